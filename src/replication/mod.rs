// ABOUTME: Logical replication: pgoutput decoding, transaction assembly and the listener
// ABOUTME: Transport is abstracted behind ReplicationStream for testing and alternative feeds

pub mod decoder;
pub mod listener;
pub mod lsn;
pub mod protocol;
pub mod stream;
pub mod values;

pub use decoder::{TransactionBuffer, TransactionDecoder};
pub use listener::{CommitHandler, ReplicationListener, Transaction, TransactionIterator};
pub use lsn::Lsn;
pub use protocol::{PgOutputMessage, RelationBody};
pub use stream::{
    PollOptions, PostgresReplicationConnector, ReplicationConnector, ReplicationStream,
    SlotPollingStream, StreamEvent,
};

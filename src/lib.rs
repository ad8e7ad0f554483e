// ABOUTME: Library root for schemasync, a PostgreSQL change-data-capture pipeline
// ABOUTME: Decodes logical replication into public schema events and applies them to consumers

pub mod backfill;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event_store;
pub mod migration;
pub mod pipeline;
pub mod postgres;
pub mod public_schema;
pub mod replication;
pub mod session;
pub mod source;
pub mod sql;
pub mod types;
pub mod utils;

pub use backfill::BackfillCoordinator;
pub use config::ManifestConfig;
pub use connection::{ConnectionAdapter, ConnectionRegistry};
pub use consumer::ConsumerSchemaTransformationEngine;
pub use error::{Error, Result};
pub use event_store::EventStore;
pub use pipeline::SyncPipeline;
pub use public_schema::PublicSchemaTransformationEngine;
pub use replication::ReplicationListener;
pub use session::Session;
pub use sql::SqlTransformer;
pub use types::{
    Cursor, OperationKind, PublicSchema, PublicSchemaReference, TableOperation,
    TransformedOperation,
};

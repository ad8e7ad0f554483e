// ABOUTME: Transport seam delivering raw pgoutput messages and keepalives
// ABOUTME: Ships a slot-polling stream built on the SQL logical decoding functions

use super::lsn::Lsn;
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_postgres::Client;

/// One unit delivered by a replication stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A pgoutput message starting at `lsn`
    XLogData { lsn: Lsn, data: Bytes },
    /// The server is alive and has nothing for us up to `wal_end`
    Keepalive { wal_end: Lsn, reply_requested: bool },
}

/// Ordered source of replication events for one slot.
///
/// Callers acknowledge every commit before pulling events past it.
#[async_trait]
pub trait ReplicationStream: Send {
    /// `Ok(None)` when the server ended the stream
    async fn next_event(&mut self) -> Result<Option<StreamEvent>>;

    /// Confirm everything up to `lsn` as durably processed
    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens streams for a (publication, slot) pair
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    async fn open(&self, publication: &str, slot: &str) -> Result<Box<dyn ReplicationStream>>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Upper bound on changes decoded per poll; whole transactions are always returned
    pub max_changes: i32,
    /// Pause after a poll that returned nothing
    pub poll_interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_changes: 1000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

const CURRENT_LSN_SQL: &str = "SELECT pg_current_wal_lsn()::text AS lsn";

const PEEK_CHANGES_SQL: &str = "SELECT lsn::text AS lsn, data
     FROM pg_logical_slot_peek_binary_changes(
         $1, $2::text::pg_lsn, $3::int,
         'proto_version', '1',
         'publication_names', $4)";

const ADVANCE_SLOT_SQL: &str = "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)";

/// Reads a logical slot with `pg_logical_slot_peek_binary_changes` and
/// confirms progress with `pg_replication_slot_advance`.
pub struct SlotPollingStream {
    client: Client,
    slot: String,
    publication: String,
    options: PollOptions,
    pending: VecDeque<StreamEvent>,
    acknowledged: Lsn,
    idle: bool,
}

impl SlotPollingStream {
    pub fn new(client: Client, publication: &str, slot: &str, options: PollOptions) -> Self {
        Self {
            client,
            slot: slot.to_string(),
            publication: publication.to_string(),
            options,
            pending: VecDeque::new(),
            acknowledged: Lsn::default(),
            idle: false,
        }
    }

    async fn poll(&mut self) -> Result<()> {
        let row = self.client.query_one(CURRENT_LSN_SQL, &[]).await?;
        let upto: Lsn = row.try_get::<_, String>("lsn")?.parse()?;

        let rows = self
            .client
            .query(
                PEEK_CHANGES_SQL,
                &[
                    &self.slot,
                    &upto.to_string(),
                    &self.options.max_changes,
                    &self.publication,
                ],
            )
            .await?;

        if rows.is_empty() {
            self.idle = true;
            self.pending.push_back(StreamEvent::Keepalive {
                wal_end: upto,
                reply_requested: true,
            });
            return Ok(());
        }

        self.idle = false;
        tracing::trace!(slot = %self.slot, changes = rows.len(), upto = %upto, "Polled replication slot");
        for row in rows {
            let lsn: Lsn = row.try_get::<_, String>("lsn")?.parse()?;
            let data: Vec<u8> = row.try_get("data")?;
            self.pending.push_back(StreamEvent::XLogData {
                lsn,
                data: Bytes::from(data),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationStream for SlotPollingStream {
    async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        if self.pending.is_empty() {
            if self.idle {
                tokio::time::sleep(self.options.poll_interval).await;
            }
            self.poll().await?;
        }
        Ok(self.pending.pop_front())
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        // The server rejects advancing to a position before the confirmed one
        if lsn <= self.acknowledged {
            return Ok(());
        }
        self.client
            .query(ADVANCE_SLOT_SQL, &[&self.slot, &lsn.to_string()])
            .await?;
        self.acknowledged = lsn;
        tracing::trace!(slot = %self.slot, lsn = %lsn, "Advanced replication slot");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        tracing::debug!(slot = %self.slot, "Closed replication stream");
        Ok(())
    }
}

/// Opens [`SlotPollingStream`]s on a dedicated connection per stream
pub struct PostgresReplicationConnector {
    config: ConnectionConfig,
    options: PollOptions,
}

impl PostgresReplicationConnector {
    pub fn new(config: ConnectionConfig, options: PollOptions) -> Self {
        Self { config, options }
    }
}

#[async_trait]
impl ReplicationConnector for PostgresReplicationConnector {
    async fn open(&self, publication: &str, slot: &str) -> Result<Box<dyn ReplicationStream>> {
        if publication.is_empty() || slot.is_empty() {
            return Err(Error::usage(
                "Publication and slot names are required to open a replication stream",
            ));
        }
        let client = crate::postgres::connect_with_retry(&self.config).await?;
        tracing::info!(
            connection = %self.config.slug,
            publication,
            slot,
            "Opened replication stream"
        );
        Ok(Box::new(SlotPollingStream::new(
            client,
            publication,
            slot,
            self.options,
        )))
    }
}

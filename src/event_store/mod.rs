// ABOUTME: Durable, replayable log of transformed operations
// ABOUTME: Idempotent writes keyed by transaction and index; cursor-based reads and tails

pub mod schema;

pub use schema::{EVENT_STORE_MIGRATIONS, EVENT_STORE_SCHEMA};

use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::migration::MigrationManager;
use crate::session::{rollback_with, Session};
use crate::types::{
    Cursor, JsonObject, OperationKind, OperationSource, PublicSchemaReference, SchemaVersion,
    SourcePublicSchema, TransactionBatch, TransformedOperation,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Largest number of transactions one read may return
pub const MAX_READ_LIMIT: i64 = 1000;

const UPSERT_DATA_STORE_SQL: &str = "INSERT INTO schemasync_events.data_store (slug) VALUES ($1)
     ON CONFLICT (slug) DO UPDATE SET slug = EXCLUDED.slug
     RETURNING id";

const INSERT_EVENT_SQL: &str = "INSERT INTO schemasync_events.events (
         transaction_id, operation_idx, operation, data_store_id,
         public_schema_name, public_schema_major_version, public_schema_minor_version,
         manifest_slug, object
     ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
     ON CONFLICT (data_store_id, transaction_id, operation_idx) DO NOTHING";

const TAIL_SQL: &str = "SELECT MAX(transaction_id) AS transaction_id
     FROM schemasync_events.events
     WHERE manifest_slug = $1
       AND public_schema_name = $2
       AND public_schema_major_version = $3";

// The limit counts transactions, so a transaction is never split across reads
const READ_SQL: &str = "WITH transactions AS (
         SELECT DISTINCT transaction_id
         FROM schemasync_events.events
         WHERE manifest_slug = $1
           AND public_schema_name = $2
           AND public_schema_major_version = $3
           AND ($4::VARCHAR IS NULL OR transaction_id > $4::VARCHAR)
         ORDER BY transaction_id
         LIMIT $5
     )
     SELECT e.transaction_id, e.operation_idx, e.operation, ds.slug AS data_store_slug,
            e.public_schema_name, e.public_schema_major_version, e.public_schema_minor_version,
            e.manifest_slug, e.object
     FROM schemasync_events.events e
     JOIN transactions t ON t.transaction_id = e.transaction_id
     JOIN schemasync_events.data_store ds ON ds.id = e.data_store_id
     WHERE e.manifest_slug = $1
       AND e.public_schema_name = $2
       AND e.public_schema_major_version = $3
     ORDER BY e.transaction_id, e.data_store_id, e.operation_idx";

/// One decoded event row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub transaction_id: String,
    pub operation_idx: i64,
    pub operation: TransformedOperation,
}

/// Postgres-backed event store on one registry connection
pub struct EventStore {
    registry: Arc<ConnectionRegistry>,
    connection_slug: String,
}

impl EventStore {
    pub fn new(registry: Arc<ConnectionRegistry>, connection_slug: impl Into<String>) -> Self {
        Self {
            registry,
            connection_slug: connection_slug.into(),
        }
    }

    /// Apply pending event-store migrations
    pub async fn prepare(&self) -> Result<usize> {
        let session = self.registry.get(&self.connection_slug).await?;
        let mut session = session.lock().await;
        MigrationManager::new(
            EVENT_STORE_SCHEMA,
            schema::MIGRATIONS_TABLE,
            EVENT_STORE_MIGRATIONS,
        )
        .ensure_schema(session.as_mut())
        .await
    }

    /// Append all operations of one transaction.
    ///
    /// Redelivering a stored transaction is a no-op.
    pub async fn write(
        &self,
        transaction_id: &str,
        operations: &[TransformedOperation],
    ) -> Result<()> {
        if operations.is_empty() {
            tracing::warn!(transaction_id, "No operations to write to event store");
            return Ok(());
        }

        let session = self.registry.get(&self.connection_slug).await?;
        let mut session = session.lock().await;
        let session = session.as_mut();

        session.begin().await?;
        match write_operations(session, transaction_id, operations).await {
            Ok(inserted) => {
                session.commit().await?;
                tracing::debug!(
                    transaction_id,
                    operations = operations.len(),
                    inserted,
                    "Wrote transaction to event store"
                );
                Ok(())
            }
            Err(e) => rollback_with(session, e).await,
        }
    }

    /// Highest stored transaction id per schema, `None` when nothing is stored
    pub async fn tail(&self, schemas: &[PublicSchemaReference]) -> Result<Vec<Cursor>> {
        let session = self.registry.get(&self.connection_slug).await?;
        let mut session = session.lock().await;

        let mut cursors = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let rows = session
                .query(
                    TAIL_SQL,
                    &[
                        json!(schema.manifest_slug),
                        json!(schema.name),
                        json!(schema.major_version),
                    ],
                )
                .await?;
            let transaction_id = rows
                .first()
                .and_then(|row| row.get("transaction_id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            cursors.push(Cursor::new(schema.clone(), transaction_id));
        }
        Ok(cursors)
    }

    /// Transactions after each cursor, oldest first, grouped per transaction.
    ///
    /// # Errors
    ///
    /// `limit` outside `1..=1000` is a [`Error::Usage`].
    pub async fn read(&self, cursors: &[Cursor], limit: i64) -> Result<Vec<TransactionBatch>> {
        validate_read_limit(limit)?;

        let session = self.registry.get(&self.connection_slug).await?;
        let mut session = session.lock().await;

        let mut events = Vec::new();
        for cursor in dedup_cursors(cursors) {
            let rows = session
                .query(
                    READ_SQL,
                    &[
                        json!(cursor.schema.manifest_slug),
                        json!(cursor.schema.name),
                        json!(cursor.schema.major_version),
                        json!(cursor.transaction_id),
                        json!(limit),
                    ],
                )
                .await?;
            for row in &rows {
                events.push(row_to_event(row)?);
            }
        }

        Ok(group_into_batches(events))
    }
}

async fn write_operations(
    session: &mut dyn Session,
    transaction_id: &str,
    operations: &[TransformedOperation],
) -> Result<u64> {
    let mut data_store_ids: HashMap<&str, Value> = HashMap::new();
    let mut inserted = 0;

    for (idx, operation) in operations.iter().enumerate() {
        let source = operation.source();
        let data_store_id = match data_store_ids.get(source.data_store_slug.as_str()) {
            Some(id) => id.clone(),
            None => {
                let rows = session
                    .query(UPSERT_DATA_STORE_SQL, &[json!(source.data_store_slug)])
                    .await?;
                let id = rows
                    .first()
                    .and_then(|row| row.get("id"))
                    .cloned()
                    .ok_or_else(|| {
                        Error::conversion(format!(
                            "Upserting data store '{}' returned no id",
                            source.data_store_slug
                        ))
                    })?;
                data_store_ids.insert(&source.data_store_slug, id.clone());
                id
            }
        };

        inserted += session
            .execute(
                INSERT_EVENT_SQL,
                &[
                    json!(transaction_id),
                    json!(idx),
                    json!(operation.kind().as_str()),
                    data_store_id,
                    json!(source.public_schema.name),
                    json!(source.public_schema.version.major),
                    json!(source.public_schema.version.minor),
                    json!(source.manifest_slug),
                    Value::Object(operation.payload().clone()),
                ],
            )
            .await?;
    }

    Ok(inserted)
}

/// Reject limits outside `1..=MAX_READ_LIMIT` instead of clamping them
pub fn validate_read_limit(limit: i64) -> Result<()> {
    if limit <= 0 {
        return Err(Error::usage("Limit must be greater than 0"));
    }
    if limit > MAX_READ_LIMIT {
        return Err(Error::usage(format!(
            "Limit must be less than or equal to {}",
            MAX_READ_LIMIT
        )));
    }
    Ok(())
}

fn dedup_cursors(cursors: &[Cursor]) -> Vec<&Cursor> {
    let mut seen: Vec<&PublicSchemaReference> = Vec::new();
    let mut unique = Vec::new();
    for cursor in cursors {
        if !seen.contains(&&cursor.schema) {
            seen.push(&cursor.schema);
            unique.push(cursor);
        }
    }
    unique
}

fn string_field(row: &JsonObject, name: &str) -> Result<String> {
    row.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::conversion(format!("Event row is missing '{}'", name)))
}

fn int_field(row: &JsonObject, name: &str) -> Result<i64> {
    row.get(name)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::conversion(format!("Event row is missing '{}'", name)))
}

/// Decode an event row selected by the read query
pub fn row_to_event(row: &JsonObject) -> Result<StoredEvent> {
    let kind: OperationKind = string_field(row, "operation")?.parse()?;
    let source = OperationSource {
        data_store_slug: string_field(row, "data_store_slug")?,
        manifest_slug: string_field(row, "manifest_slug")?,
        public_schema: SourcePublicSchema {
            name: string_field(row, "public_schema_name")?,
            version: SchemaVersion::new(
                int_field(row, "public_schema_major_version")? as i32,
                int_field(row, "public_schema_minor_version")? as i32,
            ),
        },
    };
    let payload = match row.get("object") {
        Some(Value::Object(object)) => object.clone(),
        _ => JsonObject::new(),
    };

    Ok(StoredEvent {
        transaction_id: string_field(row, "transaction_id")?,
        operation_idx: int_field(row, "operation_idx")?,
        operation: TransformedOperation::new(kind, source, payload),
    })
}

/// Order events by (transaction id, index) and group them per transaction
pub fn group_into_batches(mut events: Vec<StoredEvent>) -> Vec<TransactionBatch> {
    events.sort_by(|a, b| {
        a.transaction_id
            .cmp(&b.transaction_id)
            .then(a.operation_idx.cmp(&b.operation_idx))
    });

    let mut batches: Vec<TransactionBatch> = Vec::new();
    for event in events {
        match batches.last_mut() {
            Some(batch) if batch.transaction_id == event.transaction_id => {
                batch.operations.push(event.operation);
            }
            _ => batches.push(TransactionBatch {
                transaction_id: event.transaction_id,
                operations: vec![event.operation],
            }),
        }
    }
    batches
}

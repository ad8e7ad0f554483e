// ABOUTME: Per-destination watermark table tracking the last applied transaction
// ABOUTME: The conditional upsert refuses to move a watermark backwards

use crate::error::Result;
use crate::migration::Migration;
use crate::session::Session;
use crate::types::{Cursor, PublicSchemaReference};
use serde_json::{json, Value};

pub const CONSUMER_STATE_SCHEMA: &str = "schemasync_data_store";
pub const MIGRATIONS_TABLE: &str = "schema_version";

pub static CONSUMER_STATE_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Create public schema state table",
    up: "CREATE TABLE schemasync_data_store.public_schema_state (
             id SERIAL PRIMARY KEY,
             manifest_slug VARCHAR(255) NOT NULL,
             public_schema_name VARCHAR(255) NOT NULL,
             public_schema_major_version INTEGER NOT NULL,
             last_seen_transaction_id VARCHAR(30),
             created_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
             updated_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP,
             UNIQUE (manifest_slug, public_schema_name, public_schema_major_version)
         )",
}];

const SELECT_STATE_SQL: &str = "SELECT manifest_slug, public_schema_name, public_schema_major_version,
            last_seen_transaction_id
     FROM schemasync_data_store.public_schema_state
     ORDER BY manifest_slug, public_schema_name, public_schema_major_version";

const UPSERT_STATE_SQL: &str = "INSERT INTO schemasync_data_store.public_schema_state
         (manifest_slug, public_schema_name, public_schema_major_version, last_seen_transaction_id)
     VALUES ($1, $2, $3, $4)
     ON CONFLICT (manifest_slug, public_schema_name, public_schema_major_version)
     DO UPDATE SET
         last_seen_transaction_id = EXCLUDED.last_seen_transaction_id,
         updated_at = CURRENT_TIMESTAMP
     WHERE EXCLUDED.last_seen_transaction_id
           >= schemasync_data_store.public_schema_state.last_seen_transaction_id
     RETURNING id";

/// Every stored watermark on the destination
pub async fn read_cursors(session: &mut dyn Session) -> Result<Vec<Cursor>> {
    let rows = session.query(SELECT_STATE_SQL, &[]).await?;
    let mut cursors = Vec::with_capacity(rows.len());
    for row in rows {
        let manifest_slug = row.get("manifest_slug").and_then(Value::as_str);
        let name = row.get("public_schema_name").and_then(Value::as_str);
        let major = row
            .get("public_schema_major_version")
            .and_then(Value::as_i64);
        let (Some(manifest_slug), Some(name), Some(major)) = (manifest_slug, name, major) else {
            tracing::warn!(?row, "Skipping malformed public schema state row");
            continue;
        };
        let transaction_id = row
            .get("last_seen_transaction_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        cursors.push(Cursor::new(
            PublicSchemaReference::new(manifest_slug, name, major as i32),
            transaction_id,
        ));
    }
    Ok(cursors)
}

/// Move the watermark for `schema` to `transaction_id`.
///
/// Returns false when the stored watermark is already newer.
pub async fn advance_watermark(
    session: &mut dyn Session,
    schema: &PublicSchemaReference,
    transaction_id: &str,
) -> Result<bool> {
    let rows = session
        .query(
            UPSERT_STATE_SQL,
            &[
                json!(schema.manifest_slug),
                json!(schema.name),
                json!(schema.major_version),
                json!(transaction_id),
            ],
        )
        .await?;
    Ok(!rows.is_empty())
}

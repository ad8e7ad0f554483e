// ABOUTME: Control-table layout of the event store namespace
// ABOUTME: Append-only migration list applied through MigrationManager

use crate::migration::Migration;

pub const EVENT_STORE_SCHEMA: &str = "schemasync_events";
pub const MIGRATIONS_TABLE: &str = "schema_version";

pub static EVENT_STORE_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create data_store table",
        up: "CREATE TABLE schemasync_events.data_store (
                 id SERIAL PRIMARY KEY,
                 slug VARCHAR(255) NOT NULL UNIQUE
             )",
    },
    Migration {
        version: 2,
        description: "Create events table",
        up: "CREATE TABLE schemasync_events.events (
                 transaction_id VARCHAR(30) NOT NULL,
                 operation_idx INTEGER NOT NULL,
                 operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
                 data_store_id INTEGER NOT NULL REFERENCES schemasync_events.data_store (id),
                 public_schema_name VARCHAR(255) NOT NULL,
                 public_schema_major_version SMALLINT NOT NULL,
                 public_schema_minor_version SMALLINT NOT NULL,
                 manifest_slug VARCHAR(255) NOT NULL,
                 object JSONB,
                 created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
                 PRIMARY KEY (data_store_id, transaction_id, operation_idx)
             )",
    },
    Migration {
        version: 3,
        description: "Index events by public schema and transaction",
        up: "CREATE INDEX events_public_schema_transaction_idx
                 ON schemasync_events.events (
                     manifest_slug,
                     public_schema_name,
                     public_schema_major_version,
                     transaction_id
                 )",
    },
];

// ABOUTME: Prepares a PostgreSQL data store for logical replication
// ABOUTME: Ensures slot, publication and the backfill watermark table exist

use crate::config::DataStoreConfig;
use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::postgres::{check_replication_privileges, check_wal_level};
use crate::session::Session;
use crate::types::{JsonObject, TableOperation};
use crate::utils::quote_ident;
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub const WATERMARK_SCHEMA: &str = "schemasync";
pub const WATERMARK_TABLE: &str = "watermarks";

const CREATE_WATERMARK_TABLE_SQL: &str = "CREATE SCHEMA IF NOT EXISTS schemasync;
     CREATE TABLE IF NOT EXISTS schemasync.watermarks (
         id SERIAL PRIMARY KEY,
         backfill TEXT NOT NULL,
         type TEXT NOT NULL CHECK (type IN ('low', 'high'))
     )";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    Low,
    High,
}

impl WatermarkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatermarkKind::Low => "low",
            WatermarkKind::High => "high",
        }
    }
}

impl fmt::Display for WatermarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatermarkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(WatermarkKind::Low),
            "high" => Ok(WatermarkKind::High),
            other => Err(Error::usage(format!(
                "Invalid watermark type '{}': expected 'low' or 'high'",
                other
            ))),
        }
    }
}

/// Backfill boundary marker observed in the change stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub kind: WatermarkKind,
    pub backfill_id: String,
}

impl Watermark {
    /// Recognize an insert into the watermark table
    pub fn from_operation(operation: &TableOperation) -> Option<Self> {
        let TableOperation::Insert {
            table,
            table_schema,
            new,
            ..
        } = operation
        else {
            return None;
        };
        if table_schema != WATERMARK_SCHEMA || table != WATERMARK_TABLE {
            return None;
        }
        let kind = new.get("type").and_then(Value::as_str)?.parse().ok()?;
        let backfill_id = new.get("backfill").and_then(Value::as_str)?.to_string();
        Some(Watermark { kind, backfill_id })
    }
}

/// A replication source data store
pub struct PostgresSource {
    registry: Arc<ConnectionRegistry>,
    config: DataStoreConfig,
}

impl PostgresSource {
    pub fn new(registry: Arc<ConnectionRegistry>, config: DataStoreConfig) -> Self {
        Self { registry, config }
    }

    pub fn data_store_slug(&self) -> &str {
        &self.config.connection_slug
    }

    pub fn config(&self) -> &DataStoreConfig {
        &self.config
    }

    /// Verify server settings and create missing replication objects
    ///
    /// # Errors
    ///
    /// Fails with a configuration error when `wal_level` is not `logical`, the
    /// role cannot replicate, the slot belongs to another plugin or database,
    /// or the publication is missing and may not be created.
    pub async fn prepare(&self) -> Result<()> {
        let session = self.registry.get(self.data_store_slug()).await?;
        let mut session = session.lock().await;
        let session = session.as_mut();

        let wal_level = check_wal_level(session).await?;
        if wal_level != "logical" {
            return Err(Error::config(format!(
                "Data store '{}' has wal_level '{}'; logical replication requires 'logical'",
                self.data_store_slug(),
                wal_level
            )));
        }

        let privileges = check_replication_privileges(session).await?;
        if !privileges.can_replicate() {
            return Err(Error::config(format!(
                "Role on data store '{}' lacks the REPLICATION privilege",
                self.data_store_slug()
            )));
        }

        session.batch_execute(CREATE_WATERMARK_TABLE_SQL).await?;
        self.ensure_slot(session).await?;
        self.ensure_publication(session).await?;

        tracing::info!(
            data_store = self.data_store_slug(),
            slot = %self.config.slot_name,
            publication = %self.config.publication_name,
            "Source prepared for replication"
        );
        Ok(())
    }

    async fn ensure_slot(&self, session: &mut dyn Session) -> Result<()> {
        let slot = &self.config.slot_name;
        let rows = session
            .query(
                "SELECT plugin::text AS plugin, database::text AS database,
                        current_database()::text AS current_database
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[json!(slot)],
            )
            .await?;

        let Some(row) = rows.first() else {
            session
                .query(
                    "SELECT slot_name::text AS slot_name
                     FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                    &[json!(slot)],
                )
                .await?;
            tracing::info!(slot = %slot, "Created replication slot");
            return Ok(());
        };

        let plugin = row.get("plugin").and_then(Value::as_str).unwrap_or_default();
        if plugin != "pgoutput" {
            return Err(Error::config(format!(
                "Replication slot '{}' uses plugin '{}', expected 'pgoutput'",
                slot, plugin
            )));
        }
        let database = row.get("database").and_then(Value::as_str);
        let current = row.get("current_database").and_then(Value::as_str);
        if database != current {
            return Err(Error::config(format!(
                "Replication slot '{}' belongs to database '{}', not '{}'",
                slot,
                database.unwrap_or_default(),
                current.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn ensure_publication(&self, session: &mut dyn Session) -> Result<()> {
        let publication = &self.config.publication_name;
        let rows = session
            .query(
                "SELECT puballtables FROM pg_publication WHERE pubname = $1",
                &[json!(publication)],
            )
            .await?;

        let Some(row) = rows.first() else {
            if !self.config.create_publication {
                return Err(Error::config(format!(
                    "Publication '{}' does not exist on data store '{}'",
                    publication,
                    self.data_store_slug()
                )));
            }
            session
                .batch_execute(&format!(
                    "CREATE PUBLICATION {} FOR ALL TABLES",
                    quote_ident(publication)
                ))
                .await?;
            tracing::info!(publication = %publication, "Created publication for all tables");
            return Ok(());
        };

        if row.get("puballtables").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }

        let published = session
            .query(
                "SELECT 1 AS present FROM pg_publication_tables
                 WHERE pubname = $1 AND schemaname = $2 AND tablename = $3",
                &[
                    json!(publication),
                    json!(WATERMARK_SCHEMA),
                    json!(WATERMARK_TABLE),
                ],
            )
            .await?;
        if published.is_empty() {
            session
                .batch_execute(&format!(
                    "ALTER PUBLICATION {} ADD TABLE {}.{}",
                    quote_ident(publication),
                    WATERMARK_SCHEMA,
                    WATERMARK_TABLE
                ))
                .await?;
            tracing::info!(publication = %publication, "Added watermark table to publication");
        }
        Ok(())
    }

    /// Insert a backfill watermark into the change stream
    pub async fn write_watermark(&self, kind: WatermarkKind, backfill_id: &str) -> Result<()> {
        let session = self.registry.get(self.data_store_slug()).await?;
        let mut session = session.lock().await;
        session
            .execute(
                "INSERT INTO schemasync.watermarks (backfill, type) VALUES ($1, $2)",
                &[json!(backfill_id), json!(kind.as_str())],
            )
            .await?;
        tracing::info!(
            data_store = self.data_store_slug(),
            backfill = backfill_id,
            "Wrote {} watermark",
            kind
        );
        Ok(())
    }

    /// Run a backfill query on the data store's own session
    pub async fn read_backfill(&self, sql: &str) -> Result<Vec<JsonObject>> {
        let session = self.registry.get(self.data_store_slug()).await?;
        let mut session = session.lock().await;
        let rows = session.query(sql, &[]).await?;
        tracing::debug!(
            data_store = self.data_store_slug(),
            "Backfill query returned {} row(s)",
            rows.len()
        );
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionAdapter;
    use crate::session::fake::{row, statements, FakeSession};
    use async_trait::async_trait;

    struct NoAdapter;

    #[async_trait]
    impl ConnectionAdapter for NoAdapter {
        fn connection_type(&self) -> &'static str {
            "none"
        }

        async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>> {
            Err(Error::UnknownConnection(config.slug.clone()))
        }
    }

    fn source_with(session: FakeSession, create_publication: bool) -> PostgresSource {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(NoAdapter)));
        registry.register_session("source", Box::new(session)).unwrap();
        PostgresSource::new(
            registry,
            DataStoreConfig {
                connection_slug: "source".into(),
                publication_name: "schemasync_pub".into(),
                slot_name: "schemasync_slot".into(),
                create_publication,
            },
        )
    }

    fn server(wal_level: &'static str) -> FakeSession {
        FakeSession::new(Box::new(move |sql, _| {
            if sql.starts_with("SHOW wal_level") {
                Ok(vec![row(json!({ "wal_level": wal_level }))])
            } else if sql.contains("pg_roles") {
                Ok(vec![row(json!({"rolreplication": true, "rolsuper": false}))])
            } else {
                Ok(Vec::new())
            }
        }))
    }

    fn watermark_insert(schema: &str, table: &str, kind: &str) -> TableOperation {
        TableOperation::Insert {
            table: table.into(),
            table_schema: schema.into(),
            key_columns: vec!["id".into()],
            new: row(json!({"id": 1, "backfill": "b-1", "type": kind})),
        }
    }

    #[test]
    fn test_watermark_from_operation() {
        assert_eq!(
            Watermark::from_operation(&watermark_insert("schemasync", "watermarks", "high")),
            Some(Watermark {
                kind: WatermarkKind::High,
                backfill_id: "b-1".into()
            })
        );
        assert_eq!(
            Watermark::from_operation(&watermark_insert("public", "watermarks", "low")),
            None
        );
        assert_eq!(
            Watermark::from_operation(&watermark_insert("schemasync", "watermarks", "middle")),
            None
        );
    }

    #[tokio::test]
    async fn test_write_watermark_and_read_backfill() {
        let session = FakeSession::new(Box::new(|sql, _| {
            if sql.starts_with("SELECT id FROM orders") {
                Ok(vec![row(json!({"id": 1})), row(json!({"id": 2}))])
            } else {
                Ok(Vec::new())
            }
        }));
        let log = session.log_handle();
        let source = source_with(session, true);

        source.write_watermark(WatermarkKind::Low, "b-1").await.unwrap();
        let rows = source.read_backfill("SELECT id FROM orders").await.unwrap();
        assert_eq!(rows.len(), 2);

        let recorded = log.lock().unwrap();
        assert!(recorded[0].sql.starts_with("INSERT INTO schemasync.watermarks"));
        assert_eq!(recorded[0].params, vec![json!("b-1"), json!("low")]);
        assert_eq!(recorded[1].sql, "SELECT id FROM orders");
    }

    #[test]
    fn test_watermark_kind_parse() {
        assert_eq!("low".parse::<WatermarkKind>().unwrap(), WatermarkKind::Low);
        assert!("LOW".parse::<WatermarkKind>().is_err());
    }

    #[tokio::test]
    async fn test_prepare_rejects_non_logical_wal_level() {
        let source = source_with(server("replica"), true);
        let err = source.prepare().await.unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("replica")));
    }

    #[tokio::test]
    async fn test_prepare_creates_slot_and_publication() {
        let session = server("logical");
        let log = session.log_handle();
        let source = source_with(session, true);
        source.prepare().await.unwrap();

        let stmts = statements(&log);
        assert!(stmts
            .iter()
            .any(|s| s.contains("CREATE TABLE IF NOT EXISTS schemasync.watermarks")));
        assert!(stmts
            .iter()
            .any(|s| s.contains("pg_create_logical_replication_slot")));
        assert!(stmts
            .iter()
            .any(|s| s == "CREATE PUBLICATION \"schemasync_pub\" FOR ALL TABLES"));
    }

    #[tokio::test]
    async fn test_prepare_requires_publication_when_not_creating() {
        let source = source_with(server("logical"), false);
        let err = source.prepare().await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_prepare_adds_watermark_table_to_publication() {
        let session = FakeSession::new(Box::new(|sql, _| {
            if sql.starts_with("SHOW wal_level") {
                Ok(vec![row(json!({"wal_level": "logical"}))])
            } else if sql.contains("pg_roles") {
                Ok(vec![row(json!({"rolreplication": true, "rolsuper": false}))])
            } else if sql.contains("FROM pg_replication_slots") {
                Ok(vec![row(json!({
                    "plugin": "pgoutput",
                    "database": "app",
                    "current_database": "app"
                }))])
            } else if sql.contains("FROM pg_publication WHERE") {
                Ok(vec![row(json!({"puballtables": false}))])
            } else {
                Ok(Vec::new())
            }
        }));
        let log = session.log_handle();
        let source = source_with(session, false);
        source.prepare().await.unwrap();

        let stmts = statements(&log);
        assert!(!stmts.iter().any(|s| s.contains("pg_create_logical_replication_slot")));
        assert!(stmts.iter().any(|s| {
            s == "ALTER PUBLICATION \"schemasync_pub\" ADD TABLE schemasync.watermarks"
        }));
    }

    #[tokio::test]
    async fn test_prepare_rejects_foreign_plugin_slot() {
        let session = FakeSession::new(Box::new(|sql, _| {
            if sql.starts_with("SHOW wal_level") {
                Ok(vec![row(json!({"wal_level": "logical"}))])
            } else if sql.contains("pg_roles") {
                Ok(vec![row(json!({"rolreplication": false, "rolsuper": true}))])
            } else if sql.contains("FROM pg_replication_slots") {
                Ok(vec![row(json!({
                    "plugin": "wal2json",
                    "database": "app",
                    "current_database": "app"
                }))])
            } else {
                Ok(Vec::new())
            }
        }));
        let source = source_with(session, true);
        let err = source.prepare().await.unwrap_err();
        assert!(err.to_string().contains("wal2json"));
    }
}

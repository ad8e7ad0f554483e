// ABOUTME: Versioned, append-only schema migrations for control tables
// ABOUTME: Each pending migration runs in its own transaction with its version record

use crate::error::{Error, Result};
use crate::session::{rollback_with, Session};
use crate::utils::quote_ident;
use serde_json::json;

/// One schema change. Shipped migrations are never edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    /// May contain several statements
    pub up: &'static str,
}

/// Brings `schema_name` up to the latest of `migrations`
pub struct MigrationManager {
    schema_name: String,
    migrations_table: String,
    migrations: &'static [Migration],
}

impl MigrationManager {
    pub fn new(
        schema_name: impl Into<String>,
        migrations_table: impl Into<String>,
        migrations: &'static [Migration],
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            migrations_table: migrations_table.into(),
            migrations,
        }
    }

    fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            quote_ident(&self.schema_name),
            quote_ident(&self.migrations_table)
        )
    }

    /// Create the namespace and tracking table, then apply pending migrations.
    ///
    /// # Returns
    ///
    /// The number of migrations applied by this call.
    ///
    /// # Errors
    ///
    /// Fails before touching the database if versions are not strictly
    /// increasing. A failing migration is rolled back and reported with its
    /// version; earlier migrations from the same call stay applied.
    pub async fn ensure_schema(&self, session: &mut dyn Session) -> Result<usize> {
        validate_order(self.migrations)?;
        self.ensure_migrations_table(session).await?;

        let current = self.current_version(session).await?;
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .collect();

        if pending.is_empty() {
            tracing::debug!(
                schema = %self.schema_name,
                version = current,
                "Schema is up to date"
            );
            return Ok(0);
        }

        for migration in &pending {
            self.run_migration(session, migration).await?;
        }
        Ok(pending.len())
    }

    async fn ensure_migrations_table(&self, session: &mut dyn Session) -> Result<()> {
        session
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {};
                 CREATE TABLE IF NOT EXISTS {} (
                     version INTEGER PRIMARY KEY,
                     description TEXT NOT NULL,
                     applied_at TIMESTAMP WITH TIME ZONE DEFAULT CURRENT_TIMESTAMP
                 );",
                quote_ident(&self.schema_name),
                self.qualified_table()
            ))
            .await
    }

    /// Highest applied version, 0 when none
    pub async fn current_version(&self, session: &mut dyn Session) -> Result<i32> {
        let rows = session
            .query(
                &format!(
                    "SELECT COALESCE(MAX(version), 0) AS version FROM {}",
                    self.qualified_table()
                ),
                &[],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("version"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32)
    }

    async fn run_migration(&self, session: &mut dyn Session, migration: &Migration) -> Result<()> {
        tracing::debug!(
            schema = %self.schema_name,
            "Running migration {}: {}",
            migration.version,
            migration.description
        );

        session.begin().await?;
        let applied = async {
            session.batch_execute(migration.up).await?;
            session
                .execute(
                    &format!(
                        "INSERT INTO {} (version, description) VALUES ($1, $2)",
                        self.qualified_table()
                    ),
                    &[json!(migration.version), json!(migration.description)],
                )
                .await?;
            Ok::<_, Error>(())
        }
        .await;

        if let Err(e) = applied {
            return rollback_with(
                session,
                Error::Migration {
                    version: migration.version,
                    description: migration.description.to_string(),
                    source: Box::new(e),
                },
            )
            .await;
        }

        session.commit().await?;
        tracing::info!(
            schema = %self.schema_name,
            "Applied migration {}: {}",
            migration.version,
            migration.description
        );
        Ok(())
    }
}

fn validate_order(migrations: &[Migration]) -> Result<()> {
    for pair in migrations.windows(2) {
        if pair[1].version <= pair[0].version {
            return Err(Error::config(format!(
                "Migration versions must be strictly increasing: {} follows {}",
                pair[1].version, pair[0].version
            )));
        }
    }
    Ok(())
}

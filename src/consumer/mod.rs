// ABOUTME: Applies consumer schema transformations to destination data stores
// ABOUTME: Each event is applied together with its watermark in one transaction

pub mod state;

pub use state::{CONSUMER_STATE_MIGRATIONS, CONSUMER_STATE_SCHEMA};

use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::migration::MigrationManager;
use crate::session::{rollback_with, Session};
use crate::sql::SqlTransformer;
use crate::types::{ConsumerSchemaTransformation, Cursor, PublicSchemaReference, TransformedOperation};
use std::sync::Arc;

pub struct ConsumerSchemaTransformationEngine {
    registry: Arc<ConnectionRegistry>,
    transformer: Arc<SqlTransformer>,
}

impl ConsumerSchemaTransformationEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, transformer: Arc<SqlTransformer>) -> Self {
        Self {
            registry,
            transformer,
        }
    }

    /// Create the state namespace on a destination
    pub async fn prepare(&self, destination_slug: &str) -> Result<usize> {
        let session = self.registry.get(destination_slug).await?;
        let mut session = session.lock().await;
        MigrationManager::new(
            CONSUMER_STATE_SCHEMA,
            state::MIGRATIONS_TABLE,
            CONSUMER_STATE_MIGRATIONS,
        )
        .ensure_schema(session.as_mut())
        .await
    }

    /// Stored watermarks of one destination
    pub async fn get_cursors(&self, destination_slug: &str) -> Result<Vec<Cursor>> {
        let session = self.registry.get(destination_slug).await?;
        let mut session = session.lock().await;
        state::read_cursors(session.as_mut()).await
    }

    /// Apply one event to the destination and advance its watermark.
    ///
    /// Deletes are not applied; the operation comes back unchanged. The caller
    /// moves the watermark past them with [`Self::advance_watermark`].
    ///
    /// # Errors
    ///
    /// [`Error::StaleTransaction`] when the destination already saw a newer
    /// transaction for this public schema. Nothing is committed in that case.
    pub async fn apply_consumer_schema_transformation(
        &self,
        destination_slug: &str,
        transaction_id: &str,
        operation: &TransformedOperation,
        transformation: &ConsumerSchemaTransformation,
    ) -> Result<TransformedOperation> {
        if let TransformedOperation::Delete { source, .. } = operation {
            tracing::warn!(
                destination = destination_slug,
                transaction_id,
                public_schema = %source.reference(),
                "Delete operations are not applied to consumer schemas"
            );
            return Ok(operation.clone());
        }

        let converted = self
            .transformer
            .convert(&transformation.sql, operation.payload())?;
        let schema = operation.source().reference();

        let session = self.registry.get(destination_slug).await?;
        let mut session = session.lock().await;
        let session = session.as_mut();

        session.begin().await?;
        match apply_in_transaction(session, &converted.sql, &converted.values, &schema, transaction_id)
            .await
        {
            Ok(()) => {
                session.commit().await?;
                tracing::debug!(
                    destination = destination_slug,
                    transaction_id,
                    public_schema = %schema,
                    "Applied consumer schema transformation"
                );
                Ok(operation.clone())
            }
            Err(e) => rollback_with(session, e).await,
        }
    }

    /// Move the watermark of `schema` to `transaction_id` in its own
    /// destination transaction, without running any consumer SQL.
    ///
    /// Returns false when the destination already saw a newer transaction.
    pub async fn advance_watermark(
        &self,
        destination_slug: &str,
        schema: &PublicSchemaReference,
        transaction_id: &str,
    ) -> Result<bool> {
        let session = self.registry.get(destination_slug).await?;
        let mut session = session.lock().await;
        let session = session.as_mut();

        session.begin().await?;
        match state::advance_watermark(session, schema, transaction_id).await {
            Ok(advanced) => {
                session.commit().await?;
                tracing::debug!(
                    destination = destination_slug,
                    transaction_id,
                    public_schema = %schema,
                    advanced,
                    "Moved watermark past transaction"
                );
                Ok(advanced)
            }
            Err(e) => rollback_with(session, e).await,
        }
    }
}

async fn apply_in_transaction(
    session: &mut dyn Session,
    sql: &str,
    values: &[serde_json::Value],
    schema: &PublicSchemaReference,
    transaction_id: &str,
) -> Result<()> {
    session.execute(sql, values).await?;
    if !state::advance_watermark(session, schema, transaction_id).await? {
        return Err(Error::StaleTransaction {
            schema: schema.clone(),
            transaction_id: transaction_id.to_string(),
        });
    }
    Ok(())
}

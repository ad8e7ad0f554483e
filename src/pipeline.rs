// ABOUTME: Wires listener, engines and event store into publish and consume loops
// ABOUTME: One publish loop per source, one consume loop per destination, shared cancellation

use crate::backfill::BackfillCoordinator;
use crate::config::{BackfillConfig, DataStoreConfig, ManifestConfig};
use crate::connection::ConnectionRegistry;
use crate::consumer::ConsumerSchemaTransformationEngine;
use crate::error::{Error, Result};
use crate::event_store::EventStore;
use crate::postgres::PostgresConnectionAdapter;
use crate::public_schema::PublicSchemaTransformationEngine;
use crate::replication::{
    PollOptions, PostgresReplicationConnector, ReplicationConnector, ReplicationListener,
    TransactionBuffer,
};
use crate::source::{PostgresSource, Watermark, WatermarkKind};
use crate::sql::SqlTransformer;
use crate::types::{
    ConsumerSchema, Cursor, OperationSource, PublicSchema, PublicSchemaReference,
    SourcePublicSchema, TableOperation, TransformedOperation,
};
use futures::future::{try_join_all, BoxFuture, FutureExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of one consumer batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub transactions: usize,
    pub applied: usize,
    /// Deletes reaching a consumer schema; never applied
    pub skipped_deletes: usize,
    pub stale: usize,
}

pub struct SyncPipeline {
    manifest: ManifestConfig,
    registry: Arc<ConnectionRegistry>,
    public_engine: PublicSchemaTransformationEngine,
    consumer_engine: ConsumerSchemaTransformationEngine,
    event_store: EventStore,
    public_schemas: Vec<PublicSchema>,
    consumer_schemas: Vec<ConsumerSchema>,
    backfills: BackfillCoordinator,
}

impl SyncPipeline {
    /// Pipeline talking to PostgreSQL for every connection in the manifest
    pub fn from_manifest(manifest: ManifestConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::with_configs(
            Arc::new(PostgresConnectionAdapter),
            manifest.connections.clone(),
        ));
        Self::with_registry(manifest, registry)
    }

    pub fn with_registry(manifest: ManifestConfig, registry: Arc<ConnectionRegistry>) -> Self {
        let transformer = Arc::new(SqlTransformer::new(manifest.sync.placeholder_cache_size));
        let public_engine =
            PublicSchemaTransformationEngine::new(registry.clone(), transformer.clone());
        let consumer_engine = ConsumerSchemaTransformationEngine::new(registry.clone(), transformer);
        let event_store = EventStore::new(registry.clone(), &manifest.event_store.connection_slug);
        let public_schemas = manifest.public_schemas();
        let consumer_schemas = manifest.consumer_schemas();

        Self {
            manifest,
            registry,
            public_engine,
            consumer_engine,
            event_store,
            public_schemas,
            consumer_schemas,
            backfills: BackfillCoordinator::new(),
        }
    }

    pub fn manifest(&self) -> &ManifestConfig {
        &self.manifest
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn event_store(&self) -> &EventStore {
        &self.event_store
    }

    pub fn source(&self, data_store_slug: &str) -> Result<PostgresSource> {
        let config = self.manifest.data_store(data_store_slug).ok_or_else(|| {
            Error::config(format!("Unknown data store '{}'", data_store_slug))
        })?;
        Ok(PostgresSource::new(self.registry.clone(), config.clone()))
    }

    /// Every public schema reference consumed anywhere in the manifest
    pub fn consumed_schemas(&self) -> Vec<PublicSchemaReference> {
        let mut references: Vec<PublicSchemaReference> = Vec::new();
        for consumer in &self.consumer_schemas {
            if !references.contains(&consumer.public_schema) {
                references.push(consumer.public_schema.clone());
            }
        }
        references
    }

    /// Prepare sources, the event store and every destination
    pub async fn prepare(&self) -> Result<()> {
        for data_store in &self.manifest.data_stores {
            self.source(&data_store.connection_slug)?.prepare().await?;
        }

        let applied = self.event_store.prepare().await?;
        tracing::info!("Event store ready ({} migration(s) applied)", applied);

        for destination in self.manifest.destinations() {
            let applied = self.consumer_engine.prepare(&destination).await?;
            tracing::info!(
                "Destination '{}' ready ({} migration(s) applied)",
                destination,
                applied
            );
        }
        Ok(())
    }

    /// Run every publish and consume loop until `cancel` fires or one fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.run_with_backfills(cancel, &[]).await
    }

    /// [`Self::run`], also running the named backfills one after another
    pub async fn run_with_backfills(
        &self,
        cancel: CancellationToken,
        backfill_ids: &[String],
    ) -> Result<()> {
        for id in backfill_ids {
            if self.manifest.backfill(id).is_none() {
                return Err(Error::config(format!("Unknown backfill '{}'", id)));
            }
        }
        let cancel = cancel.child_token();
        let options = PollOptions {
            max_changes: self.manifest.sync.max_changes,
            poll_interval: self.manifest.sync.poll_interval(),
        };

        let mut loops: Vec<BoxFuture<'_, Result<()>>> = Vec::new();
        for data_store in &self.manifest.data_stores {
            let connection = self
                .manifest
                .connection(&data_store.connection_slug)
                .cloned()
                .ok_or_else(|| Error::UnknownConnection(data_store.connection_slug.clone()))?;
            let connector: Arc<dyn ReplicationConnector> =
                Arc::new(PostgresReplicationConnector::new(connection, options));
            loops.push(self.publish(data_store, connector, cancel.clone()).boxed());
        }
        for destination in self.manifest.destinations() {
            let cancel = cancel.clone();
            loops.push(async move { self.consume(&destination, cancel).await }.boxed());
        }

        if !backfill_ids.is_empty() {
            loops.push(
                async move {
                    for id in backfill_ids {
                        self.backfill(id).await?;
                    }
                    Ok(())
                }
                .boxed(),
            );
        }

        tracing::info!("Starting {} sync loop(s)", loops.len());
        let result = try_join_all(loops).await;
        // Stop detached listener tasks when a sibling loop failed
        cancel.cancel();
        result.map(|_| ())
    }

    /// Publish loop for one source data store
    pub async fn publish(
        &self,
        data_store: &DataStoreConfig,
        connector: Arc<dyn ReplicationConnector>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let slug = data_store.connection_slug.as_str();
        let schemas: Vec<PublicSchema> = self
            .public_schemas
            .iter()
            .filter(|schema| schema.data_store_slug == slug)
            .cloned()
            .collect();

        let listener = ReplicationListener::new(connector);
        let mut transactions = listener
            .start_iteration(&data_store.publication_name, &data_store.slot_name, cancel)
            .await?;
        tracing::info!(
            "Publishing data store '{}' with {} public schema(s)",
            slug,
            schemas.len()
        );

        while let Some(transaction) = transactions.next().await {
            let mut transaction = transaction?;
            match self
                .publish_transaction(slug, &schemas, &transaction.buffer)
                .await
            {
                Ok(_) => transaction.ack(true),
                Err(e) => {
                    transaction.ack(false);
                    if let Err(stop_error) = transactions.stop().await {
                        tracing::warn!("Listener did not stop cleanly: {}", stop_error);
                    }
                    return Err(e);
                }
            }
        }
        transactions.stop().await
    }

    /// Transform one committed source transaction and append it to the event store
    pub async fn publish_transaction(
        &self,
        data_store_slug: &str,
        schemas: &[PublicSchema],
        buffer: &TransactionBuffer,
    ) -> Result<usize> {
        let transaction_id = buffer.transaction_id();

        let mut operations: Vec<TableOperation> = Vec::with_capacity(buffer.operations.len());
        let mut backfilled: Vec<TransformedOperation> = Vec::new();
        for operation in &buffer.operations {
            let Some(watermark) = Watermark::from_operation(operation) else {
                self.backfills.observe(data_store_slug, operation);
                operations.push(operation.clone());
                continue;
            };
            tracing::info!(
                data_store = data_store_slug,
                transaction_id = %transaction_id,
                backfill = %watermark.backfill_id,
                "Observed {} watermark",
                watermark.kind
            );
            match watermark.kind {
                WatermarkKind::Low => {
                    if !self.backfills.open(&watermark.backfill_id) {
                        tracing::debug!(
                            backfill = %watermark.backfill_id,
                            "Watermark belongs to no backfill of this process"
                        );
                    }
                }
                WatermarkKind::High => {
                    if let Some(records) = self.backfills.close(&watermark.backfill_id) {
                        tracing::info!(
                            backfill = %watermark.backfill_id,
                            "Publishing {} backfilled object(s)",
                            records.len()
                        );
                        backfilled.extend(records);
                    }
                }
            }
        }

        let mut transformed = self
            .public_engine
            .apply_public_schema_transformation(data_store_slug, &operations, schemas)
            .await?;
        transformed.extend(backfilled);
        if !transformed.is_empty() {
            self.event_store.write(&transaction_id, &transformed).await?;
        }
        Ok(transformed.len())
    }

    /// Read a configured backfill between a low and a high watermark.
    ///
    /// The rows are held until the publish loop reaches the high watermark;
    /// rows whose source keys changed after the low watermark are dropped
    /// there. Returns the id the watermarks were written with.
    pub async fn backfill(&self, backfill_id: &str) -> Result<String> {
        let config = self
            .manifest
            .backfill(backfill_id)
            .ok_or_else(|| Error::config(format!("Unknown backfill '{}'", backfill_id)))?;
        let schema = self
            .public_schemas
            .iter()
            .filter(|s| {
                s.name == config.public_schema
                    && s.version.major == config.major
                    && s.data_store_slug == config.data_store_slug
            })
            .max_by_key(|s| s.version)
            .ok_or_else(|| {
                Error::config(format!(
                    "Backfill '{}' references unknown public schema '{}'",
                    backfill_id, config.public_schema
                ))
            })?;
        let source = OperationSource {
            data_store_slug: config.data_store_slug.clone(),
            manifest_slug: schema.manifest_slug.clone(),
            public_schema: SourcePublicSchema {
                name: schema.name.clone(),
                version: schema.version,
            },
        };
        let data_store = self.source(&config.data_store_slug)?;

        // Watermarks of earlier runs may still be in the slot
        let run_id = format!("{}:{}", config.id, uuid::Uuid::new_v4());
        self.backfills
            .register(&run_id, config.sources.clone(), source)?;
        match self.read_backfill(&data_store, config, &run_id).await {
            Ok(()) => Ok(run_id),
            Err(e) => {
                self.backfills.abandon(&run_id);
                Err(e)
            }
        }
    }

    async fn read_backfill(
        &self,
        data_store: &PostgresSource,
        config: &BackfillConfig,
        run_id: &str,
    ) -> Result<()> {
        data_store.write_watermark(WatermarkKind::Low, run_id).await?;
        let records = data_store.read_backfill(&config.sql).await?;
        let count = self.backfills.add_records(run_id, records)?;
        data_store.write_watermark(WatermarkKind::High, run_id).await?;
        tracing::info!(
            backfill = run_id,
            "Read {} row(s); waiting for the high watermark",
            count
        );
        Ok(())
    }

    /// Consume loop for one destination
    pub async fn consume(&self, destination: &str, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Consuming into destination '{}'", destination);
        let poll_interval = self.manifest.sync.poll_interval();

        // A batch is never interrupted mid-transaction; cancellation is checked between batches
        while !cancel.is_cancelled() {
            let stats = self.consume_once(destination).await?;
            if stats.transactions > 0 {
                continue;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        tracing::info!("Stopped consuming into destination '{}'", destination);
        Ok(())
    }

    /// Read and apply one batch of transactions for `destination`
    pub async fn consume_once(&self, destination: &str) -> Result<ConsumeStats> {
        let consumers: Vec<&ConsumerSchema> = self
            .consumer_schemas
            .iter()
            .filter(|c| c.destination_data_store_slug == destination)
            .collect();
        if consumers.is_empty() {
            return Ok(ConsumeStats::default());
        }

        let stored = self.consumer_engine.get_cursors(destination).await?;
        let cursors = build_cursors(&consumers, &stored);
        let batches = self
            .event_store
            .read(&cursors, self.manifest.sync.batch_limit)
            .await?;

        let mut stats = ConsumeStats {
            transactions: batches.len(),
            ..ConsumeStats::default()
        };
        for batch in &batches {
            // Schemas whose watermark no consumer SQL moved past this transaction
            let mut only_deletes: Vec<PublicSchemaReference> = Vec::new();
            let mut handled: Vec<PublicSchemaReference> = Vec::new();

            for operation in &batch.operations {
                let reference = operation.source().reference();
                for consumer in consumers.iter().filter(|c| c.public_schema == reference) {
                    let result = self
                        .consumer_engine
                        .apply_consumer_schema_transformation(
                            destination,
                            &batch.transaction_id,
                            operation,
                            &consumer.transformation,
                        )
                        .await;
                    match result {
                        Ok(_) if matches!(operation, TransformedOperation::Delete { .. }) => {
                            stats.skipped_deletes += 1;
                            if !only_deletes.contains(&reference) {
                                only_deletes.push(reference.clone());
                            }
                        }
                        Ok(_) => {
                            stats.applied += 1;
                            handled.push(reference.clone());
                        }
                        Err(e) if e.is_stale_transaction() => {
                            tracing::debug!("Skipping redelivered event: {}", e);
                            stats.stale += 1;
                            handled.push(reference.clone());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            for reference in only_deletes.iter().filter(|r| !handled.contains(r)) {
                self.consumer_engine
                    .advance_watermark(destination, reference, &batch.transaction_id)
                    .await?;
            }
        }

        if stats.transactions > 0 {
            tracing::debug!(
                destination,
                transactions = stats.transactions,
                applied = stats.applied,
                skipped_deletes = stats.skipped_deletes,
                stale = stats.stale,
                "Consumed batch"
            );
        }
        Ok(stats)
    }
}

/// One cursor per consumed public schema; schemas without state start from the beginning
fn build_cursors(consumers: &[&ConsumerSchema], stored: &[Cursor]) -> Vec<Cursor> {
    let mut cursors: Vec<Cursor> = Vec::new();
    for consumer in consumers {
        if cursors.iter().any(|c| c.schema == consumer.public_schema) {
            continue;
        }
        let transaction_id = stored
            .iter()
            .find(|c| c.schema == consumer.public_schema)
            .and_then(|c| c.transaction_id.clone());
        cursors.push(Cursor::new(consumer.public_schema.clone(), transaction_id));
    }
    cursors
}

// ABOUTME: Integration tests for source preparation and the replication listener
// ABOUTME: Requires a server with wal_level=logical and a role allowed to replicate

use schemasync::config::{ConnectionConfig, DataStoreConfig};
use schemasync::postgres::PostgresConnectionAdapter;
use schemasync::replication::{PollOptions, PostgresReplicationConnector};
use schemasync::source::{PostgresSource, Watermark, WatermarkKind};
use schemasync::{ConnectionRegistry, ReplicationListener, TableOperation};
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn get_test_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

fn connection(url: String) -> ConnectionConfig {
    ConnectionConfig {
        slug: "source".to_string(),
        url,
        allow_self_signed_certs: true,
    }
}

#[tokio::test]
#[ignore]
async fn test_listener_delivers_committed_changes() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let table = format!("replication_test_{}", suffix);
    let slot = format!("schemasync_it_{}", &suffix[..12]);
    let publication = format!("schemasync_it_pub_{}", &suffix[..12]);

    let registry = Arc::new(ConnectionRegistry::with_configs(
        Arc::new(PostgresConnectionAdapter),
        vec![connection(url.clone())],
    ));
    {
        let session = registry.get("source").await.unwrap();
        let mut session = session.lock().await;
        session
            .batch_execute(&format!(
                "CREATE TABLE public.{} (id INTEGER PRIMARY KEY, name TEXT)",
                table
            ))
            .await
            .unwrap();
    }

    let source = PostgresSource::new(
        registry.clone(),
        DataStoreConfig {
            connection_slug: "source".to_string(),
            publication_name: publication.clone(),
            slot_name: slot.clone(),
            create_publication: true,
        },
    );
    source.prepare().await.expect("Failed to prepare source");

    let connector = Arc::new(PostgresReplicationConnector::new(
        connection(url),
        PollOptions {
            max_changes: 100,
            poll_interval: Duration::from_millis(100),
        },
    ));
    let listener = ReplicationListener::new(connector);
    let cancel = CancellationToken::new();
    let mut transactions = listener
        .start_iteration(&publication, &slot, cancel.clone())
        .await
        .unwrap();

    {
        let session = registry.get("source").await.unwrap();
        let mut session = session.lock().await;
        session
            .batch_execute(&format!(
                "INSERT INTO public.{t} (id, name) VALUES (1, 'one');
                 UPDATE public.{t} SET id = 2 WHERE id = 1",
                t = table
            ))
            .await
            .unwrap();
    }
    source
        .write_watermark(WatermarkKind::Low, "backfill-1")
        .await
        .unwrap();

    let mut operations: Vec<TableOperation> = Vec::new();
    let mut watermark = None;
    while watermark.is_none() {
        let mut transaction = tokio::time::timeout(Duration::from_secs(30), transactions.next())
            .await
            .expect("Timed out waiting for a transaction")
            .expect("Listener ended early")
            .expect("Listener failed");
        for op in transaction.operations() {
            match Watermark::from_operation(op) {
                Some(w) => watermark = Some(w),
                None if op.table() == table => operations.push(op.clone()),
                None => {}
            }
        }
        transaction.ack(true);
    }

    assert_eq!(watermark.unwrap().backfill_id, "backfill-1");
    // insert, then the key-changing update split into insert + delete
    assert_eq!(operations.len(), 3);
    assert_eq!(
        operations[1].new_values().unwrap(),
        json!({"id": 2, "name": "one"}).as_object().unwrap()
    );
    assert_eq!(
        operations[2].old_keys().unwrap(),
        json!({"id": 1}).as_object().unwrap()
    );

    cancel.cancel();
    transactions.stop().await.unwrap();

    let session = registry.get("source").await.unwrap();
    let mut session = session.lock().await;
    session
        .batch_execute(&format!(
            "SELECT pg_drop_replication_slot('{slot}');
             DROP PUBLICATION {publication};
             DROP TABLE public.{table}",
        ))
        .await
        .unwrap();
}

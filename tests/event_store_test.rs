// ABOUTME: Integration tests for the PostgreSQL event store
// ABOUTME: Exercises migrations, idempotent writes, tails and transaction-bounded reads

use schemasync::config::ConnectionConfig;
use schemasync::postgres::PostgresConnectionAdapter;
use schemasync::types::{OperationSource, SchemaVersion, SourcePublicSchema};
use schemasync::{ConnectionRegistry, Cursor, Error, EventStore, PublicSchemaReference, TransformedOperation};
use serde_json::json;
use std::env;
use std::sync::Arc;

fn get_test_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}

fn event_store(url: String) -> EventStore {
    let registry = Arc::new(ConnectionRegistry::with_configs(
        Arc::new(PostgresConnectionAdapter),
        vec![ConnectionConfig {
            slug: "events".to_string(),
            url,
            allow_self_signed_certs: true,
        }],
    ));
    EventStore::new(registry, "events")
}

/// Unique manifest slug so runs do not see each other's rows
fn manifest_slug() -> String {
    format!("it_{}", uuid::Uuid::new_v4().simple())
}

fn insert(manifest: &str, id: i64) -> TransformedOperation {
    TransformedOperation::Insert {
        source: OperationSource {
            data_store_slug: "it_source".to_string(),
            manifest_slug: manifest.to_string(),
            public_schema: SourcePublicSchema {
                name: "orders".to_string(),
                version: SchemaVersion::new(1, 0),
            },
        },
        object: json!({ "id": id }).as_object().unwrap().clone(),
    }
}

#[tokio::test]
#[ignore]
async fn test_prepare_is_repeatable() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let store = event_store(url);

    store.prepare().await.expect("First prepare failed");
    let applied = store.prepare().await.expect("Second prepare failed");
    assert_eq!(applied, 0);
}

#[tokio::test]
#[ignore]
async fn test_write_is_idempotent_and_tail_tracks_newest() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let store = event_store(url);
    store.prepare().await.unwrap();

    let manifest = manifest_slug();
    let reference = PublicSchemaReference::new(&manifest, "orders", 1);

    let cursors = store.tail(&[reference.clone()]).await.unwrap();
    assert_eq!(cursors[0].transaction_id, None);

    let ops = vec![insert(&manifest, 1), insert(&manifest, 2)];
    store.write("0000000000000100", &ops).await.unwrap();
    store.write("0000000000000100", &ops).await.unwrap();
    store
        .write("0000000000000200", &[insert(&manifest, 3)])
        .await
        .unwrap();

    let cursors = store.tail(&[reference.clone()]).await.unwrap();
    assert_eq!(cursors[0].transaction_id.as_deref(), Some("0000000000000200"));

    let batches = store
        .read(&[Cursor::new(reference, None)], 10)
        .await
        .unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].operations.len(), 2);
    assert_eq!(batches[0].operations[1].payload()["id"], json!(2));
}

#[tokio::test]
#[ignore]
async fn test_read_limit_counts_transactions() {
    let url = get_test_url().expect("TEST_DATABASE_URL must be set");
    let store = event_store(url);
    store.prepare().await.unwrap();

    let manifest = manifest_slug();
    let reference = PublicSchemaReference::new(&manifest, "orders", 1);
    for (txid, count) in [("0000000000000001", 3), ("0000000000000002", 1), ("0000000000000003", 2)] {
        let ops: Vec<_> = (0..count).map(|i| insert(&manifest, i)).collect();
        store.write(txid, &ops).await.unwrap();
    }

    let first = store
        .read(&[Cursor::new(reference.clone(), None)], 1)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].operations.len(), 3);

    let rest = store
        .read(
            &[Cursor::new(reference.clone(), Some(first[0].transaction_id.clone()))],
            1000,
        )
        .await
        .unwrap();
    let ids: Vec<_> = rest.iter().map(|b| b.transaction_id.as_str()).collect();
    assert_eq!(ids, vec!["0000000000000002", "0000000000000003"]);

    let err = store
        .read(&[Cursor::new(reference, None)], 1001)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Usage(_)));
}

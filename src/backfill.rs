// ABOUTME: Backfills a public schema inside a low/high watermark window of the change stream
// ABOUTME: Rows whose source keys change inside the window are dropped from the backfilled set

use crate::error::{Error, Result};
use crate::types::{JsonObject, OperationSource, TableOperation, TransformedOperation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// Links the key columns of one source table to columns of the backfilled rows.
///
/// A backfill of `{account_id, address_id, name, street}` built from
/// `account(id, name)` and `address(id, street)` has two sources:
/// `public.account` with `{id = "account_id"}` and `public.address` with
/// `{id = "address_id"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillSource {
    /// `schema.table`; an unqualified name means `public`
    pub table: String,
    /// Source key column to result column
    pub key_aliases: BTreeMap<String, String>,
}

impl BackfillSource {
    fn qualified_table(&self) -> String {
        qualify(&self.table)
    }
}

fn qualify(table: &str) -> String {
    if table.contains('.') {
        table.to_string()
    } else {
        format!("public.{}", table)
    }
}

fn key_part(table: &str, column: &str, value: Option<&Value>) -> String {
    match value {
        Some(value) => format!("{}.{}={}", table, column, value),
        None => format!("{}.{}={}", table, column, Value::Null),
    }
}

/// One key per source table, so a change to any of them invalidates the row
pub fn result_set_keys(sources: &[BackfillSource], record: &JsonObject) -> Vec<String> {
    sources
        .iter()
        .map(|source| {
            let table = source.qualified_table();
            source
                .key_aliases
                .iter()
                .map(|(column, alias)| key_part(&table, column, record.get(alias)))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

/// Key of the source row a live change touched
pub fn operation_key(operation: &TableOperation) -> String {
    let table = format!("{}.{}", operation.table_schema(), operation.table());
    let values = match operation {
        TableOperation::Insert { new, .. } | TableOperation::Update { new, .. } => new,
        TableOperation::Delete { old_keys, .. } => old_keys,
    };
    let mut columns: Vec<&String> = operation.key_columns().iter().collect();
    columns.sort();
    columns
        .into_iter()
        .map(|column| key_part(&table, column, values.get(column)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Backfilled rows plus the keys the live stream invalidated
#[derive(Debug, Default)]
pub struct ResultSetStore {
    records: Vec<JsonObject>,
    key_to_records: HashMap<String, Vec<usize>>,
    drop_keys: HashSet<String>,
}

impl ResultSetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_records(&mut self, sources: &[BackfillSource], records: Vec<JsonObject>) -> Result<()> {
        if sources.is_empty() {
            return Err(Error::config("Backfill must name at least one source table"));
        }
        for record in records {
            let index = self.records.len();
            for key in result_set_keys(sources, &record) {
                self.key_to_records.entry(key).or_default().push(index);
            }
            self.records.push(record);
        }
        Ok(())
    }

    pub fn add_drop_key(&mut self, operation: &TableOperation) {
        self.drop_keys.insert(operation_key(operation));
    }

    pub fn records_without_drop_keys(&self) -> Vec<JsonObject> {
        let excluded: HashSet<usize> = self
            .drop_keys
            .iter()
            .filter_map(|key| self.key_to_records.get(key))
            .flatten()
            .copied()
            .collect();
        self.records
            .iter()
            .enumerate()
            .filter(|(index, _)| !excluded.contains(index))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.key_to_records.clear();
        self.drop_keys.clear();
    }
}

#[derive(Debug)]
struct BackfillWindow {
    data_store_slug: String,
    sources: Vec<BackfillSource>,
    source: OperationSource,
    store: ResultSetStore,
    open: bool,
}

/// In-flight backfills of one pipeline, keyed by watermark backfill id
#[derive(Debug, Default)]
pub struct BackfillCoordinator {
    windows: Mutex<HashMap<String, BackfillWindow>>,
}

impl BackfillCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BackfillWindow>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track a backfill before its low watermark is written
    pub fn register(
        &self,
        backfill_id: &str,
        sources: Vec<BackfillSource>,
        source: OperationSource,
    ) -> Result<()> {
        if sources.is_empty() {
            return Err(Error::config(format!(
                "Backfill '{}' must name at least one source table",
                backfill_id
            )));
        }
        let mut windows = self.lock();
        if windows.contains_key(backfill_id) {
            return Err(Error::usage(format!(
                "Backfill '{}' is already running",
                backfill_id
            )));
        }
        windows.insert(
            backfill_id.to_string(),
            BackfillWindow {
                data_store_slug: source.data_store_slug.clone(),
                sources,
                source,
                store: ResultSetStore::new(),
                open: false,
            },
        );
        Ok(())
    }

    pub fn add_records(&self, backfill_id: &str, records: Vec<JsonObject>) -> Result<usize> {
        let mut windows = self.lock();
        let window = windows
            .get_mut(backfill_id)
            .ok_or_else(|| Error::usage(format!("Backfill '{}' is not registered", backfill_id)))?;
        window.store.add_records(&window.sources, records)?;
        Ok(window.store.len())
    }

    pub fn abandon(&self, backfill_id: &str) {
        self.lock().remove(backfill_id);
    }

    pub fn is_pending(&self, backfill_id: &str) -> bool {
        self.lock().contains_key(backfill_id)
    }

    /// Low watermark reached; false for backfills this pipeline did not start
    pub fn open(&self, backfill_id: &str) -> bool {
        match self.lock().get_mut(backfill_id) {
            Some(window) => {
                window.open = true;
                true
            }
            None => false,
        }
    }

    /// Invalidate backfilled rows of every open window on `data_store_slug`
    pub fn observe(&self, data_store_slug: &str, operation: &TableOperation) {
        for window in self.lock().values_mut() {
            if window.open && window.data_store_slug == data_store_slug {
                window.store.add_drop_key(operation);
            }
        }
    }

    /// High watermark reached; the surviving rows as public schema inserts.
    ///
    /// `None` for unknown backfills and for windows whose low watermark was
    /// never seen.
    pub fn close(&self, backfill_id: &str) -> Option<Vec<TransformedOperation>> {
        let window = self.lock().remove(backfill_id)?;
        if !window.open {
            tracing::warn!(
                backfill = backfill_id,
                "High watermark seen before its low watermark; dropping backfill"
            );
            return None;
        }
        Some(
            window
                .store
                .records_without_drop_keys()
                .into_iter()
                .map(|object| TransformedOperation::Insert {
                    source: window.source.clone(),
                    object,
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::row;
    use crate::types::{SchemaVersion, SourcePublicSchema};
    use serde_json::json;

    fn account_and_address() -> Vec<BackfillSource> {
        vec![
            BackfillSource {
                table: "public.account".into(),
                key_aliases: BTreeMap::from([("id".to_string(), "account_id".to_string())]),
            },
            BackfillSource {
                table: "address".into(),
                key_aliases: BTreeMap::from([("id".to_string(), "address_id".to_string())]),
            },
        ]
    }

    fn update(table: &str, new: serde_json::Value) -> TableOperation {
        TableOperation::Update {
            table: table.into(),
            table_schema: "public".into(),
            key_columns: vec!["id".into()],
            new: row(new.clone()),
            old_keys: row(json!({"id": new["id"]})),
        }
    }

    fn orders_source() -> OperationSource {
        OperationSource {
            data_store_slug: "source".into(),
            manifest_slug: "shop".into(),
            public_schema: SourcePublicSchema {
                name: "orders".into(),
                version: SchemaVersion::new(1, 0),
            },
        }
    }

    fn orders_backfill() -> Vec<BackfillSource> {
        vec![BackfillSource {
            table: "orders".into(),
            key_aliases: BTreeMap::from([("id".to_string(), "id".to_string())]),
        }]
    }

    #[test]
    fn test_result_set_keys_cover_every_source() {
        let record = row(json!({"account_id": 1, "address_id": "a-9", "name": "Ann"}));
        assert_eq!(
            result_set_keys(&account_and_address(), &record),
            vec!["public.account.id=1", "public.address.id=\"a-9\""]
        );
    }

    #[test]
    fn test_operation_key_sorts_key_columns() {
        let operation = TableOperation::Delete {
            table: "memberships".into(),
            table_schema: "public".into(),
            key_columns: vec!["user_id".into(), "org_id".into()],
            old_keys: row(json!({"user_id": 4, "org_id": 2})),
        };
        assert_eq!(
            operation_key(&operation),
            "public.memberships.org_id=2,public.memberships.user_id=4"
        );
    }

    #[test]
    fn test_change_to_any_source_table_drops_the_row() {
        let mut store = ResultSetStore::new();
        store
            .add_records(
                &account_and_address(),
                vec![
                    row(json!({"account_id": 1, "address_id": "a-1"})),
                    row(json!({"account_id": 2, "address_id": "a-2"})),
                    row(json!({"account_id": 3, "address_id": "a-3"})),
                ],
            )
            .unwrap();
        store.add_drop_key(&update("account", json!({"id": 1, "name": "x"})));
        store.add_drop_key(&update("address", json!({"id": "a-3", "street": "y"})));
        // Same key value on an unrelated table
        store.add_drop_key(&update("invoice", json!({"id": 2})));

        let survivors = store.records_without_drop_keys();
        assert_eq!(survivors, vec![row(json!({"account_id": 2, "address_id": "a-2"}))]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_add_records_requires_a_source() {
        let mut store = ResultSetStore::new();
        assert!(store.add_records(&[], vec![row(json!({"id": 1}))]).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_window_drops_rows_changed_between_watermarks() {
        let coordinator = BackfillCoordinator::new();
        coordinator
            .register("b1", orders_backfill(), orders_source())
            .unwrap();

        // Changes before the low watermark belong to the snapshot
        coordinator.observe("source", &update("orders", json!({"id": 2})));
        assert!(coordinator.open("b1"));
        coordinator.observe("source", &update("orders", json!({"id": 1})));
        coordinator.observe("other", &update("orders", json!({"id": 3})));

        let count = coordinator
            .add_records(
                "b1",
                vec![
                    row(json!({"id": 1, "total": 5})),
                    row(json!({"id": 2, "total": 6})),
                    row(json!({"id": 3, "total": 7})),
                ],
            )
            .unwrap();
        assert_eq!(count, 3);

        let operations = coordinator.close("b1").unwrap();
        let objects: Vec<&JsonObject> = operations.iter().map(|op| op.payload()).collect();
        assert_eq!(objects, vec![&row(json!({"id": 2, "total": 6})), &row(json!({"id": 3, "total": 7}))]);
        assert!(matches!(operations[0], TransformedOperation::Insert { ref source, .. } if *source == orders_source()));
        assert!(!coordinator.is_pending("b1"));
    }

    #[test]
    fn test_unknown_and_unopened_windows() {
        let coordinator = BackfillCoordinator::new();
        assert!(!coordinator.open("elsewhere"));
        assert!(coordinator.close("elsewhere").is_none());

        coordinator
            .register("b2", orders_backfill(), orders_source())
            .unwrap();
        assert!(coordinator
            .register("b2", orders_backfill(), orders_source())
            .is_err());
        assert!(coordinator.close("b2").is_none());
        assert!(!coordinator.is_pending("b2"));
    }

    #[test]
    fn test_abandon_forgets_the_window() {
        let coordinator = BackfillCoordinator::new();
        coordinator
            .register("b3", orders_backfill(), orders_source())
            .unwrap();
        coordinator.abandon("b3");
        assert!(coordinator.add_records("b3", Vec::new()).is_err());
    }
}

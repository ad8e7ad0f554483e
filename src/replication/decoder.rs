// ABOUTME: Assembles pgoutput messages into complete source transactions
// ABOUTME: Enforces begin/commit framing and converts tuples into table operations

use super::lsn::Lsn;
use super::protocol::{OldTupleKind, PgOutputMessage, RelationBody, TupleData};
use super::values::tuple_to_object;
use crate::error::{Error, Result};
use crate::types::{JsonObject, TableOperation};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A committed source transaction, handed to the commit handler
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionBuffer {
    pub xid: u32,
    pub commit_lsn: Lsn,
    pub commit_end_lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    /// Relations announced inside this transaction
    pub relations: HashMap<u32, RelationBody>,
    pub operations: Vec<TableOperation>,
}

impl TransactionBuffer {
    /// Event store transaction id; orders like the commit position
    pub fn transaction_id(&self) -> String {
        self.commit_end_lsn.to_transaction_id()
    }
}

#[derive(Debug)]
struct OpenTransaction {
    xid: u32,
    final_lsn: Lsn,
    relations: HashMap<u32, RelationBody>,
    operations: Vec<TableOperation>,
}

/// Per-stream decoding state.
///
/// The server announces a relation once per session, so relations are
/// remembered across transactions as well as recorded per transaction.
#[derive(Debug, Default)]
pub struct TransactionDecoder {
    relations: HashMap<u32, RelationBody>,
    current: Option<OpenTransaction>,
}

impl TransactionDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// No transaction is in progress
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Feed one message; returns the finished transaction on commit
    pub fn decode(&mut self, message: PgOutputMessage) -> Result<Option<TransactionBuffer>> {
        match message {
            PgOutputMessage::Begin {
                final_lsn, xid, ..
            } => {
                if let Some(open) = &self.current {
                    return Err(Error::protocol(format!(
                        "Begin for xid {} while xid {} is still open",
                        xid, open.xid
                    )));
                }
                self.current = Some(OpenTransaction {
                    xid,
                    final_lsn,
                    relations: HashMap::new(),
                    operations: Vec::new(),
                });
                Ok(None)
            }
            PgOutputMessage::Relation(relation) => {
                let open = self.open_transaction("relation")?;
                open.relations.insert(relation.id, relation.clone());
                tracing::trace!(
                    relation_id = relation.id,
                    table = %format!("{}.{}", relation.namespace, relation.name),
                    "Relation announced"
                );
                self.relations.insert(relation.id, relation);
                Ok(None)
            }
            PgOutputMessage::Insert { relation_id, new } => {
                self.open_transaction("insert")?;
                let relation = self.relation(relation_id)?;
                let Some(key_columns) = keyed(relation, "insert") else {
                    return Ok(None);
                };
                let operation = TableOperation::Insert {
                    table: relation.name.clone(),
                    table_schema: relation.namespace.clone(),
                    key_columns,
                    new: tuple_to_object(&relation.columns, &new, false)?,
                };
                self.push(vec![operation]);
                Ok(None)
            }
            PgOutputMessage::Update {
                relation_id,
                old,
                new,
            } => {
                self.open_transaction("update")?;
                let relation = self.relation(relation_id)?;
                let Some(key_columns) = keyed(relation, "update") else {
                    return Ok(None);
                };
                let operations = update_operations(relation, key_columns, old, &new)?;
                self.push(operations);
                Ok(None)
            }
            PgOutputMessage::Delete {
                relation_id, old, ..
            } => {
                self.open_transaction("delete")?;
                let relation = self.relation(relation_id)?;
                let Some(key_columns) = keyed(relation, "delete") else {
                    return Ok(None);
                };
                let operation = TableOperation::Delete {
                    table: relation.name.clone(),
                    table_schema: relation.namespace.clone(),
                    key_columns,
                    old_keys: tuple_to_object(&relation.columns, &old, true)?,
                };
                self.push(vec![operation]);
                Ok(None)
            }
            PgOutputMessage::Commit {
                commit_lsn,
                end_lsn,
                commit_time,
                ..
            } => {
                let open = self
                    .current
                    .take()
                    .ok_or_else(|| Error::protocol("Commit received without a transaction"))?;
                if open.final_lsn != commit_lsn {
                    return Err(Error::protocol(format!(
                        "Commit LSN {} does not match begin final LSN {} for xid {}",
                        commit_lsn, open.final_lsn, open.xid
                    )));
                }
                Ok(Some(TransactionBuffer {
                    xid: open.xid,
                    commit_lsn,
                    commit_end_lsn: end_lsn,
                    commit_time,
                    relations: open.relations,
                    operations: open.operations,
                }))
            }
            PgOutputMessage::Truncate { relation_ids, .. } => {
                tracing::debug!(?relation_ids, "Ignoring truncate");
                Ok(None)
            }
            PgOutputMessage::Type { id, name, .. } => {
                tracing::debug!(type_id = id, name = %name, "Ignoring type message");
                Ok(None)
            }
            PgOutputMessage::Origin { name, .. } => {
                tracing::debug!(origin = %name, "Ignoring origin message");
                Ok(None)
            }
            PgOutputMessage::Message { prefix, .. } => {
                tracing::debug!(prefix = %prefix, "Ignoring logical decoding message");
                Ok(None)
            }
        }
    }

    fn open_transaction(&mut self, tag: &str) -> Result<&mut OpenTransaction> {
        self.current
            .as_mut()
            .ok_or_else(|| Error::protocol(format!("Received {} before begin", tag)))
    }

    fn relation(&self, relation_id: u32) -> Result<&RelationBody> {
        self.relations
            .get(&relation_id)
            .ok_or_else(|| Error::protocol(format!("Unknown relation id {}", relation_id)))
    }

    fn push(&mut self, operations: Vec<TableOperation>) {
        if let Some(open) = self.current.as_mut() {
            open.operations.extend(operations);
        }
    }
}

fn keyed(relation: &RelationBody, tag: &str) -> Option<Vec<String>> {
    let key_columns = relation.key_columns();
    if key_columns.is_empty() {
        tracing::warn!(
            table = %format!("{}.{}", relation.namespace, relation.name),
            "Skipping {} on table without key columns; set a primary key or replica identity",
            tag
        );
        return None;
    }
    Some(key_columns)
}

fn key_values(object: &JsonObject, key_columns: &[String]) -> JsonObject {
    key_columns
        .iter()
        .filter_map(|key| object.get(key).map(|v| (key.clone(), v.clone())))
        .collect()
}

/// `relreplident` of a `REPLICA IDENTITY FULL` table
const REPLICA_IDENTITY_FULL: u8 = b'f';

/// An update that moved the key becomes an insert of the new row and a
/// delete of the old keys.
///
/// Under `REPLICA IDENTITY FULL` every column is flagged as a key, so the
/// primary key cannot be told apart and the update is never split.
fn update_operations(
    relation: &RelationBody,
    key_columns: Vec<String>,
    old: Option<(OldTupleKind, TupleData)>,
    new: &TupleData,
) -> Result<Vec<TableOperation>> {
    let new_object = tuple_to_object(&relation.columns, new, false)?;
    let new_keys = key_values(&new_object, &key_columns);
    let old_keys = match old {
        Some((_, tuple)) => tuple_to_object(&relation.columns, &tuple, true)?,
        None => new_keys.clone(),
    };

    if old_keys == new_keys || relation.replica_identity == REPLICA_IDENTITY_FULL {
        return Ok(vec![TableOperation::Update {
            table: relation.name.clone(),
            table_schema: relation.namespace.clone(),
            key_columns,
            new: new_object,
            old_keys,
        }]);
    }

    tracing::debug!(
        table = %relation.name,
        "Key changed in update; emitting insert and delete"
    );
    Ok(vec![
        TableOperation::Insert {
            table: relation.name.clone(),
            table_schema: relation.namespace.clone(),
            key_columns: key_columns.clone(),
            new: new_object,
        },
        TableOperation::Delete {
            table: relation.name.clone(),
            table_schema: relation.namespace.clone(),
            key_columns,
            old_keys,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::super::protocol::test_messages::*;
    use super::*;
    use serde_json::json;
    use tokio_postgres::types::Type;

    const INT4: u32 = 23;
    const TEXT: u32 = 25;

    fn feed(decoder: &mut TransactionDecoder, data: bytes::Bytes) -> Result<Option<TransactionBuffer>> {
        decoder.decode(PgOutputMessage::parse(data)?)
    }

    fn orders() -> bytes::Bytes {
        relation(16384, "public", "orders", &[("id", INT4, true), ("note", TEXT, false)])
    }

    #[test]
    fn test_type_oids_match_driver() {
        assert_eq!(Type::INT4.oid(), INT4);
        assert_eq!(Type::TEXT.oid(), TEXT);
    }

    #[test]
    fn test_insert_transaction() {
        let mut decoder = TransactionDecoder::new();
        assert!(decoder.is_idle());
        feed(&mut decoder, begin(Lsn(0x200), 7)).unwrap();
        feed(&mut decoder, orders()).unwrap();
        feed(&mut decoder, insert(16384, &[Some("1"), Some("hello")])).unwrap();
        assert!(!decoder.is_idle());

        let buffer = feed(&mut decoder, commit(Lsn(0x200), Lsn(0x230)))
            .unwrap()
            .unwrap();
        assert!(decoder.is_idle());
        assert_eq!(buffer.xid, 7);
        assert_eq!(buffer.transaction_id(), "0000000000000230");
        assert!(buffer.relations.contains_key(&16384));
        assert_eq!(
            buffer.operations,
            vec![TableOperation::Insert {
                table: "orders".into(),
                table_schema: "public".into(),
                key_columns: vec!["id".into()],
                new: json!({"id": 1, "note": "hello"}).as_object().unwrap().clone(),
            }]
        );
    }

    #[test]
    fn test_relation_cache_survives_transactions() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        feed(&mut decoder, orders()).unwrap();
        feed(&mut decoder, commit(Lsn(0x100), Lsn(0x110))).unwrap();

        feed(&mut decoder, begin(Lsn(0x200), 2)).unwrap();
        feed(&mut decoder, delete(16384, &[Some("3"), None])).unwrap();
        let buffer = feed(&mut decoder, commit(Lsn(0x200), Lsn(0x210)))
            .unwrap()
            .unwrap();
        assert!(buffer.relations.is_empty());
        assert_eq!(
            buffer.operations[0].old_keys().unwrap(),
            json!({"id": 3}).as_object().unwrap()
        );
    }

    #[test]
    fn test_unchanged_toast_column_is_omitted() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        feed(&mut decoder, orders()).unwrap();
        feed(&mut decoder, update(16384, None, &[Some("1"), Some("\u{0}")])).unwrap();
        let buffer = feed(&mut decoder, commit(Lsn(0x100), Lsn(0x120)))
            .unwrap()
            .unwrap();
        match &buffer.operations[0] {
            TableOperation::Update { new, old_keys, .. } => {
                assert_eq!(new, json!({"id": 1}).as_object().unwrap());
                assert_eq!(old_keys, json!({"id": 1}).as_object().unwrap());
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_key_change_splits_into_insert_and_delete() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        feed(&mut decoder, orders()).unwrap();
        feed(
            &mut decoder,
            update(16384, Some(&[Some("1"), None][..]), &[Some("2"), Some("moved")]),
        )
        .unwrap();
        let buffer = feed(&mut decoder, commit(Lsn(0x100), Lsn(0x120)))
            .unwrap()
            .unwrap();
        assert_eq!(buffer.operations.len(), 2);
        assert_eq!(
            buffer.operations[0].new_values().unwrap(),
            json!({"id": 2, "note": "moved"}).as_object().unwrap()
        );
        assert!(matches!(buffer.operations[1], TableOperation::Delete { .. }));
        assert_eq!(
            buffer.operations[1].old_keys().unwrap(),
            json!({"id": 1}).as_object().unwrap()
        );
    }

    #[test]
    fn test_full_identity_update_is_not_split() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        // pgoutput flags every column as a key under REPLICA IDENTITY FULL
        let PgOutputMessage::Relation(mut full) = PgOutputMessage::parse(relation(
            16384,
            "public",
            "orders",
            &[("id", INT4, true), ("note", TEXT, true)],
        ))
        .unwrap() else {
            panic!("expected a relation message");
        };
        full.replica_identity = b'f';
        decoder.decode(PgOutputMessage::Relation(full)).unwrap();

        feed(
            &mut decoder,
            update(16384, Some(&[Some("1"), Some("old")][..]), &[Some("1"), Some("new")]),
        )
        .unwrap();
        let buffer = feed(&mut decoder, commit(Lsn(0x100), Lsn(0x120)))
            .unwrap()
            .unwrap();
        assert_eq!(buffer.operations.len(), 1);
        match &buffer.operations[0] {
            TableOperation::Update { new, old_keys, .. } => {
                assert_eq!(new, json!({"id": 1, "note": "new"}).as_object().unwrap());
                assert_eq!(old_keys, json!({"id": 1, "note": "old"}).as_object().unwrap());
            }
            other => panic!("unexpected operation: {other:?}"),
        }
    }

    #[test]
    fn test_keyless_table_is_skipped() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        feed(&mut decoder, relation(1, "public", "logs", &[("line", TEXT, false)])).unwrap();
        feed(&mut decoder, insert(1, &[Some("x")])).unwrap();
        let buffer = feed(&mut decoder, commit(Lsn(0x100), Lsn(0x120)))
            .unwrap()
            .unwrap();
        assert!(buffer.operations.is_empty());
    }

    #[test]
    fn test_operation_before_begin_is_fatal() {
        let mut decoder = TransactionDecoder::new();
        let err = feed(&mut decoder, insert(16384, &[Some("1"), None])).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let err = feed(&mut decoder, orders()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_unknown_relation_is_fatal() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        let err = feed(&mut decoder, insert(99, &[Some("1")])).unwrap_err();
        assert!(err.to_string().contains("Unknown relation id 99"));
    }

    #[test]
    fn test_commit_lsn_mismatch_is_fatal() {
        let mut decoder = TransactionDecoder::new();
        feed(&mut decoder, begin(Lsn(0x100), 1)).unwrap();
        let err = feed(&mut decoder, commit(Lsn(0x101), Lsn(0x120))).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}

// ABOUTME: Core data model for row changes, public schemas and event cursors
// ABOUTME: Shared by the listener, both transformation engines and the event store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ordered JSON object; key order follows column order
pub type JsonObject = serde_json::Map<String, serde_json::Value>;

/// Row operation kind.
///
/// Variant order is significant: insert < update < delete is the apply order
/// used when transformations for one table are sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(crate::Error::conversion(format!(
                "Unknown operation kind '{}'",
                other
            ))),
        }
    }
}

/// One decoded row change from the source database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TableOperation {
    Insert {
        table: String,
        table_schema: String,
        key_columns: Vec<String>,
        new: JsonObject,
    },
    Update {
        table: String,
        table_schema: String,
        key_columns: Vec<String>,
        new: JsonObject,
        old_keys: JsonObject,
    },
    Delete {
        table: String,
        table_schema: String,
        key_columns: Vec<String>,
        old_keys: JsonObject,
    },
}

impl TableOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            TableOperation::Insert { .. } => OperationKind::Insert,
            TableOperation::Update { .. } => OperationKind::Update,
            TableOperation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            TableOperation::Insert { table, .. }
            | TableOperation::Update { table, .. }
            | TableOperation::Delete { table, .. } => table,
        }
    }

    pub fn table_schema(&self) -> &str {
        match self {
            TableOperation::Insert { table_schema, .. }
            | TableOperation::Update { table_schema, .. }
            | TableOperation::Delete { table_schema, .. } => table_schema,
        }
    }

    pub fn key_columns(&self) -> &[String] {
        match self {
            TableOperation::Insert { key_columns, .. }
            | TableOperation::Update { key_columns, .. }
            | TableOperation::Delete { key_columns, .. } => key_columns,
        }
    }

    pub fn new_values(&self) -> Option<&JsonObject> {
        match self {
            TableOperation::Insert { new, .. } | TableOperation::Update { new, .. } => Some(new),
            TableOperation::Delete { .. } => None,
        }
    }

    pub fn old_keys(&self) -> Option<&JsonObject> {
        match self {
            TableOperation::Update { old_keys, .. } | TableOperation::Delete { old_keys, .. } => {
                Some(old_keys)
            }
            TableOperation::Insert { .. } => None,
        }
    }

    /// Values a transformation runs against: the new row, or the old keys for deletes
    pub fn transformation_input(&self) -> &JsonObject {
        match self {
            TableOperation::Insert { new, .. } | TableOperation::Update { new, .. } => new,
            TableOperation::Delete { old_keys, .. } => old_keys,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub major: i32,
    pub minor: i32,
}

impl SchemaVersion {
    pub fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// SQL that maps one table operation kind into the public schema shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSchemaTransformation {
    pub operation: OperationKind,
    pub table: String,
    pub sql: String,
}

/// Versioned public view of a source data store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSchema {
    pub manifest_slug: String,
    pub name: String,
    pub version: SchemaVersion,
    pub data_store_slug: String,
    pub transformations: Vec<PublicSchemaTransformation>,
}

impl PublicSchema {
    pub fn reference(&self) -> PublicSchemaReference {
        PublicSchemaReference::new(&self.manifest_slug, &self.name, self.version.major)
    }
}

/// Identifies a public schema independent of its minor version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicSchemaReference {
    pub manifest_slug: String,
    pub name: String,
    pub major_version: i32,
}

impl PublicSchemaReference {
    pub fn new(manifest_slug: impl Into<String>, name: impl Into<String>, major_version: i32) -> Self {
        Self {
            manifest_slug: manifest_slug.into(),
            name: name.into(),
            major_version,
        }
    }
}

impl fmt::Display for PublicSchemaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.manifest_slug, self.name, self.major_version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePublicSchema {
    pub name: String,
    pub version: SchemaVersion,
}

/// Where a transformed operation came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSource {
    pub data_store_slug: String,
    pub manifest_slug: String,
    pub public_schema: SourcePublicSchema,
}

impl OperationSource {
    pub fn reference(&self) -> PublicSchemaReference {
        PublicSchemaReference::new(
            &self.manifest_slug,
            &self.public_schema.name,
            self.public_schema.version.major,
        )
    }
}

/// Canonical, schema-tagged change event stored and replayed by the event store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformedOperation {
    Insert {
        source: OperationSource,
        object: JsonObject,
    },
    Update {
        source: OperationSource,
        object: JsonObject,
    },
    Delete {
        source: OperationSource,
        object_keys: JsonObject,
    },
}

impl TransformedOperation {
    pub fn new(kind: OperationKind, source: OperationSource, payload: JsonObject) -> Self {
        match kind {
            OperationKind::Insert => TransformedOperation::Insert {
                source,
                object: payload,
            },
            OperationKind::Update => TransformedOperation::Update {
                source,
                object: payload,
            },
            OperationKind::Delete => TransformedOperation::Delete {
                source,
                object_keys: payload,
            },
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            TransformedOperation::Insert { .. } => OperationKind::Insert,
            TransformedOperation::Update { .. } => OperationKind::Update,
            TransformedOperation::Delete { .. } => OperationKind::Delete,
        }
    }

    pub fn source(&self) -> &OperationSource {
        match self {
            TransformedOperation::Insert { source, .. }
            | TransformedOperation::Update { source, .. }
            | TransformedOperation::Delete { source, .. } => source,
        }
    }

    /// The object for inserts and updates, the object keys for deletes
    pub fn payload(&self) -> &JsonObject {
        match self {
            TransformedOperation::Insert { object, .. }
            | TransformedOperation::Update { object, .. } => object,
            TransformedOperation::Delete { object_keys, .. } => object_keys,
        }
    }
}

/// Everything consumed up to and including `transaction_id` for one schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub schema: PublicSchemaReference,
    /// `None` reads from the beginning
    pub transaction_id: Option<String>,
}

impl Cursor {
    pub fn new(schema: PublicSchemaReference, transaction_id: Option<String>) -> Self {
        Self {
            schema,
            transaction_id,
        }
    }
}

/// Events of one source transaction, in operation index order
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionBatch {
    pub transaction_id: String,
    pub operations: Vec<TransformedOperation>,
}

/// Destination-side transformation of one public schema major version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSchema {
    pub name: String,
    pub destination_data_store_slug: String,
    pub public_schema: PublicSchemaReference,
    pub transformation: ConsumerSchemaTransformation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSchemaTransformation {
    pub sql: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_operation_kind_order() {
        assert!(OperationKind::Insert < OperationKind::Update);
        assert!(OperationKind::Update < OperationKind::Delete);
    }

    #[test]
    fn test_operation_kind_parse_roundtrip() {
        for kind in [
            OperationKind::Insert,
            OperationKind::Update,
            OperationKind::Delete,
        ] {
            assert_eq!(kind.as_str().parse::<OperationKind>().unwrap(), kind);
        }
        assert!("upsert".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_delete_transformation_input_is_old_keys() {
        let op = TableOperation::Delete {
            table: "orders".into(),
            table_schema: "public".into(),
            key_columns: vec!["id".into()],
            old_keys: object(json!({"id": 7})),
        };
        assert_eq!(op.transformation_input(), &object(json!({"id": 7})));
        assert!(op.new_values().is_none());
    }

    #[test]
    fn test_schema_version_order() {
        assert!(SchemaVersion::new(1, 9) < SchemaVersion::new(2, 0));
        assert!(SchemaVersion::new(1, 0) < SchemaVersion::new(1, 1));
    }

    #[test]
    fn test_reference_display() {
        let reference = PublicSchemaReference::new("shop", "orders", 2);
        assert_eq!(reference.to_string(), "shop:orders@2");
    }
}

// ABOUTME: SQL placeholder handling for public and consumer transformations
// ABOUTME: Cached conversion plus manifest-level placeholder validation

pub mod cache;
pub mod placeholders;

pub use cache::{PlaceholderCache, DEFAULT_CACHE_CAPACITY};
pub use placeholders::{
    convert_named_to_positional_placeholders, is_mixing_positional_and_named_placeholders,
    parse_placeholders, validate_sql_placeholders,
    ConvertedSql, ParsedSql, Placeholder, PlaceholderIssue, PlaceholderKind,
};

use crate::error::Result;
use crate::types::{JsonObject, PublicSchema};

/// Placeholder converter backed by a bounded parse cache.
///
/// One instance is shared by both transformation engines.
pub struct SqlTransformer {
    cache: PlaceholderCache,
}

impl SqlTransformer {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: PlaceholderCache::new(capacity),
        }
    }

    pub fn convert(&self, sql: &str, object: &JsonObject) -> Result<ConvertedSql> {
        let parsed = self.cache.get_or_parse(sql)?;
        placeholders::convert_parsed(sql, &parsed, object)
    }

    pub fn cache(&self) -> &PlaceholderCache {
        &self.cache
    }
}

impl Default for SqlTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Public schema transformations may not mix placeholder styles
pub fn validate_public_schema(schema: &PublicSchema) -> Result<Vec<String>> {
    if schema.transformations.is_empty() {
        return Ok(vec![format!(
            "No PostgreSQL transformation found in public schema '{}'",
            schema.name
        )]);
    }

    let mut errors = Vec::new();
    for transformation in &schema.transformations {
        if is_mixing_positional_and_named_placeholders(&transformation.sql)? {
            errors.push(format!(
                "Public schema '{}' ({} on '{}'): {}",
                schema.name,
                transformation.operation,
                transformation.table,
                PlaceholderIssue::MixedPlaceholders {
                    sql: transformation.sql.clone()
                }
            ));
        }
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, PublicSchemaTransformation, SchemaVersion};
    use serde_json::json;

    #[test]
    fn test_transformer_caches_parses() {
        let transformer = SqlTransformer::new(8);
        let object = json!({"id": 1}).as_object().cloned().unwrap();
        transformer.convert("SELECT :id", &object).unwrap();
        transformer.convert("SELECT :id", &object).unwrap();
        assert_eq!(transformer.cache().len(), 1);
    }

    #[test]
    fn test_validate_public_schema() {
        let mut schema = PublicSchema {
            manifest_slug: "m".into(),
            name: "orders".into(),
            version: SchemaVersion::new(1, 0),
            data_store_slug: "source".into(),
            transformations: vec![],
        };
        assert_eq!(validate_public_schema(&schema).unwrap().len(), 1);

        schema.transformations.push(PublicSchemaTransformation {
            operation: OperationKind::Insert,
            table: "orders".into(),
            sql: "SELECT * FROM orders WHERE id = $1 AND org = :org".into(),
        });
        let errors = validate_public_schema(&schema).unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Mixing positional"));

        schema.transformations[0].sql = "SELECT * FROM orders WHERE id = :id".into();
        assert!(validate_public_schema(&schema).unwrap().is_empty());
    }
}

// ABOUTME: Maps decoded source operations into public schema operations
// ABOUTME: Runs matching transformations in one source-side transaction per batch

use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::session::{rollback_with, Session};
use crate::sql::SqlTransformer;
use crate::types::{
    OperationSource, PublicSchema, PublicSchemaTransformation, SourcePublicSchema, TableOperation,
    TransformedOperation,
};
use std::cmp::Ordering;
use std::sync::Arc;

/// A transformation selected for one operation
#[derive(Debug, Clone, Copy)]
pub struct TransformationMatch<'a> {
    pub schema: &'a PublicSchema,
    pub transformation: &'a PublicSchemaTransformation,
    pub operation: &'a TableOperation,
}

/// Apply order: table, then operation kind, then schema name, then version
pub fn compare_matches(a: &TransformationMatch<'_>, b: &TransformationMatch<'_>) -> Ordering {
    a.operation
        .table()
        .cmp(b.operation.table())
        .then_with(|| a.operation.kind().cmp(&b.operation.kind()))
        .then_with(|| a.schema.name.cmp(&b.schema.name))
        .then_with(|| a.schema.version.cmp(&b.schema.version))
}

/// Every (schema, transformation, operation) triple whose table and kind agree, sorted
pub fn match_transformations<'a>(
    operations: &'a [TableOperation],
    schemas: &'a [PublicSchema],
) -> Vec<TransformationMatch<'a>> {
    let mut matches = Vec::new();
    for operation in operations {
        for schema in schemas {
            for transformation in &schema.transformations {
                if transformation.table == operation.table()
                    && transformation.operation == operation.kind()
                {
                    matches.push(TransformationMatch {
                        schema,
                        transformation,
                        operation,
                    });
                }
            }
        }
    }
    // sort_by is stable: ties keep source order
    matches.sort_by(compare_matches);
    matches
}

pub struct PublicSchemaTransformationEngine {
    registry: Arc<ConnectionRegistry>,
    transformer: Arc<SqlTransformer>,
}

impl PublicSchemaTransformationEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, transformer: Arc<SqlTransformer>) -> Self {
        Self {
            registry,
            transformer,
        }
    }

    /// Transform one source transaction's operations.
    ///
    /// All transformations run in a single transaction on the data store's
    /// session; any failure rolls the whole batch back.
    ///
    /// # Errors
    ///
    /// - [`Error::UnexpectedRowCount`] when a transformation does not return exactly one row
    /// - [`Error::MissingParameters`] when the SQL needs more parameters than the row supplies
    pub async fn apply_public_schema_transformation(
        &self,
        data_store_slug: &str,
        operations: &[TableOperation],
        public_schemas: &[PublicSchema],
    ) -> Result<Vec<TransformedOperation>> {
        let matches = match_transformations(operations, public_schemas);
        if matches.is_empty() {
            tracing::debug!(
                data_store = data_store_slug,
                operations = operations.len(),
                "No public schema transformations matched"
            );
            return Ok(Vec::new());
        }

        let session = self.registry.get(data_store_slug).await?;
        let mut session = session.lock().await;
        let session = session.as_mut();

        session.begin().await?;
        let mut results = Vec::with_capacity(matches.len());
        for m in &matches {
            match self.run_match(session, data_store_slug, m).await {
                Ok(op) => results.push(op),
                Err(e) => return rollback_with(session, e).await,
            }
        }
        session.commit().await?;

        tracing::debug!(
            data_store = data_store_slug,
            operations = operations.len(),
            transformed = results.len(),
            "Applied public schema transformations"
        );
        Ok(results)
    }

    async fn run_match(
        &self,
        session: &mut dyn Session,
        data_store_slug: &str,
        m: &TransformationMatch<'_>,
    ) -> Result<TransformedOperation> {
        let sql = &m.transformation.sql;
        let input = m.operation.transformation_input();
        let converted = self
            .transformer
            .convert(sql, input)
            .map_err(|e| match e {
                Error::NotEnoughPositionalValues {
                    required, supplied, ..
                } => Error::MissingParameters {
                    schema: m.schema.name.clone(),
                    table: m.operation.table().to_string(),
                    operation: m.operation.kind(),
                    required,
                    supplied,
                    sql: sql.clone(),
                },
                other => Error::Transformation {
                    schema: m.schema.name.clone(),
                    table: m.operation.table().to_string(),
                    operation: m.operation.kind(),
                    source: Box::new(other),
                },
            })?;

        let rows = match session.query(&converted.sql, &converted.values).await {
            Ok(rows) => rows,
            Err(e) if e.is_too_few_parameters() => {
                let (required, supplied) = match e {
                    Error::TooFewParameters { required, supplied } => (required, supplied),
                    _ => (0, converted.values.len()),
                };
                return Err(Error::MissingParameters {
                    schema: m.schema.name.clone(),
                    table: m.operation.table().to_string(),
                    operation: m.operation.kind(),
                    required,
                    supplied,
                    sql: sql.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        if rows.len() != 1 {
            return Err(Error::UnexpectedRowCount {
                schema: m.schema.name.clone(),
                table: m.operation.table().to_string(),
                operation: m.operation.kind(),
                rows: rows.len(),
                sql: sql.clone(),
            });
        }

        let source = OperationSource {
            data_store_slug: data_store_slug.to_string(),
            manifest_slug: m.schema.manifest_slug.clone(),
            public_schema: SourcePublicSchema {
                name: m.schema.name.clone(),
                version: m.schema.version,
            },
        };

        Ok(match m.operation {
            TableOperation::Delete { old_keys, .. } => TransformedOperation::Delete {
                source,
                object_keys: old_keys.clone(),
            },
            _ => {
                let object = rows.into_iter().next().unwrap_or_default();
                TransformedOperation::new(m.operation.kind(), source, object)
            }
        })
    }
}

// ABOUTME: Backend-neutral database session used by engines, stores and migrations
// ABOUTME: Parameters and rows travel as JSON; nested transactions become savepoints

use crate::error::Result;
use crate::types::JsonObject;
use async_trait::async_trait;
use serde_json::Value;

/// One live connection with transaction scope tracking.
///
/// A session is never shared by concurrent callers; the registry wraps each
/// one in a mutex that is held for a whole transaction.
#[async_trait]
pub trait Session: Send {
    /// Run one or more statements without parameters
    async fn batch_execute(&mut self, sql: &str) -> Result<()>;

    /// Run a statement and return its rows as column-ordered JSON objects.
    ///
    /// Fails with [`crate::Error::TooFewParameters`] when the statement needs
    /// more parameters than supplied. Surplus trailing values are not bound.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<JsonObject>>;

    /// Run a statement and return the number of affected rows
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Open a transaction, or a savepoint when one is already open
    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// 0 outside of any transaction
    fn transaction_depth(&self) -> usize;
}

/// Savepoint name for a nesting depth (depth 1 is the outer transaction)
pub fn savepoint_name(depth: usize) -> String {
    format!("sp_{}", depth)
}

/// Roll back and return the original error; a failing rollback is only logged
pub async fn rollback_with<T>(session: &mut dyn Session, error: crate::Error) -> Result<T> {
    if let Err(rollback_error) = session.rollback().await {
        tracing::warn!("Rollback failed after error '{}': {}", error, rollback_error);
    }
    Err(error)
}

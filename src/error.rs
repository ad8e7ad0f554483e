// ABOUTME: Typed error taxonomy shared by every pipeline component
// ABOUTME: Separates protocol, authoring, ordering, connectivity and usage failures

use crate::types::{OperationKind, PublicSchemaReference};
use thiserror::Error;

/// Errors raised by the replication, transformation and storage layers
#[derive(Error, Debug)]
pub enum Error {
    /// Driver-level failure: connection loss, SQL error, type mismatch
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// The replication stream violated a decoder invariant. Never retried.
    #[error("Replication protocol violation: {0}")]
    Protocol(String),

    #[error("Replication listener error: {0}")]
    Listener(String),

    /// A public schema transformation did not return exactly one row
    #[error(
        "Transformation for public schema '{schema}' ({operation} on '{table}') returned {rows} rows, expected exactly 1. SQL: {sql}"
    )]
    UnexpectedRowCount {
        schema: String,
        table: String,
        operation: OperationKind,
        rows: usize,
        sql: String,
    },

    /// The driver reported fewer bound parameters than the statement needs
    #[error(
        "Transformation for public schema '{schema}' ({operation} on '{table}') requires {required} parameter(s) but {supplied} were supplied. \
         You probably forgot to add a parameter to your query, for example 'WHERE id = $1'. SQL: {sql}"
    )]
    MissingParameters {
        schema: String,
        table: String,
        operation: OperationKind,
        required: usize,
        supplied: usize,
        sql: String,
    },

    /// Any other failure preparing a public schema transformation
    #[error("Transformation for public schema '{schema}' ({operation} on '{table}') failed: {source}")]
    Transformation {
        schema: String,
        table: String,
        operation: OperationKind,
        #[source]
        source: Box<Error>,
    },

    #[error("Statement requires {required} parameter(s) but {supplied} were supplied")]
    TooFewParameters { required: usize, supplied: usize },

    #[error("Mixing positional ($n) and named (:name) placeholders is not supported. SQL: {sql}")]
    MixedPlaceholders { sql: String },

    #[error("Value for placeholder ':{name}' not found in object. SQL: {sql}")]
    MissingPlaceholderValue { name: String, sql: String },

    #[error(
        "Not enough values provided for positional placeholders: statement uses ${required} but only {supplied} value(s) supplied. SQL: {sql}"
    )]
    NotEnoughPositionalValues {
        required: usize,
        supplied: usize,
        sql: String,
    },

    #[error("Failed to tokenize SQL: {message}. SQL: {sql}")]
    SqlTokenize { message: String, sql: String },

    /// The consumer watermark is already past this transaction
    #[error("Transaction id {transaction_id} is older than the last seen transaction for {schema}")]
    StaleTransaction {
        schema: PublicSchemaReference,
        transaction_id: String,
    },

    #[error("Invalid usage: {0}")]
    Usage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No connection registered for data store '{0}'")]
    UnknownConnection(String),

    #[error("Value conversion error: {0}")]
    Conversion(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration {version} ({description}) failed: {source}")]
    Migration {
        version: i32,
        description: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn listener<S: Into<String>>(msg: S) -> Self {
        Error::Listener(msg.into())
    }

    pub fn usage<S: Into<String>>(msg: S) -> Self {
        Error::Usage(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn conversion<S: Into<String>>(msg: S) -> Self {
        Error::Conversion(msg.into())
    }

    /// Expected under redelivery; callers usually log and move on
    pub fn is_stale_transaction(&self) -> bool {
        matches!(self, Error::StaleTransaction { .. })
    }

    /// True for the driver's "bind message supplies N parameters" family of errors
    pub fn is_too_few_parameters(&self) -> bool {
        match self {
            Error::TooFewParameters { .. } => true,
            Error::Database(e) => {
                e.code() == Some(&tokio_postgres::error::SqlState::PROTOCOL_VIOLATION)
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_transaction_is_recognised() {
        let err = Error::StaleTransaction {
            schema: PublicSchemaReference::new("manifest", "orders", 1),
            transaction_id: "0000000000000001".into(),
        };
        assert!(err.is_stale_transaction());
        assert!(!Error::usage("nope").is_stale_transaction());
    }

    #[test]
    fn test_missing_parameters_message_has_hint() {
        let err = Error::MissingParameters {
            schema: "orders".into(),
            table: "orders".into(),
            operation: OperationKind::Insert,
            required: 1,
            supplied: 0,
            sql: "SELECT * FROM orders WHERE id = $1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'orders'"));
        assert!(msg.contains("WHERE id = $1"));
        assert!(msg.contains("insert"));
    }

    #[test]
    fn test_too_few_parameters_detection() {
        assert!(Error::TooFewParameters {
            required: 2,
            supplied: 1
        }
        .is_too_few_parameters());
        assert!(!Error::config("x").is_too_few_parameters());
    }
}

// ABOUTME: Utility functions for identifier validation, quoting and retries
// ABOUTME: Shared by source preparation, migrations and connection setup

use crate::error::{Error, Result};
use std::time::Duration;
use url::Url;

/// Retry an async operation with exponential backoff
///
/// # Arguments
///
/// * `operation` - Closure producing the future to run on each attempt
/// * `max_retries` - Retries after the first attempt (0 = run once)
/// * `initial_delay` - Delay before the first retry, doubled after each retry
///
/// # Returns
///
/// The first successful result, or the last error once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries => {
                tracing::warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Validate a PostgreSQL identifier (schema, slot, publication name)
///
/// Identifiers must be 1-63 characters, start with a letter or underscore,
/// and contain only letters, digits and underscores.
///
/// # Security
///
/// Slot and publication names are interpolated into SQL, so they must pass
/// this check before use.
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    let Some(first_char) = trimmed.chars().next() else {
        return Err(Error::config("Identifier cannot be empty or whitespace-only"));
    };

    if trimmed.len() > 63 {
        return Err(Error::config(format!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            trimmed,
            trimmed.len()
        )));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(Error::config(format!(
            "Identifier '{}' must start with a letter or underscore, not '{}'",
            trimmed, first_char
        )));
    }

    if let Some((i, c)) = trimmed
        .chars()
        .enumerate()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
    {
        return Err(Error::config(format!(
            "Identifier '{}' contains invalid character {:?} at position {}. \
             Only letters, digits, and underscores are allowed",
            trimmed, c, i
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier, doubling embedded quotes
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Strip the password from a connection URL so it can be logged
pub fn strip_password_from_url(url: &str) -> Result<String> {
    let mut parsed = Url::parse(url)
        .map_err(|e| Error::config(format!("Invalid connection URL: {}", e)))?;
    if parsed.password().is_some() {
        parsed
            .set_password(None)
            .map_err(|_| Error::config("Connection URL cannot carry credentials"))?;
    }
    Ok(parsed.to_string())
}

// ABOUTME: PostgreSQL backend: connections, sessions, binding and privilege checks
// ABOUTME: TLS follows the URL's sslmode using native-tls

pub mod adapter;
pub mod params;
pub mod privileges;
pub mod session;

pub use adapter::PostgresConnectionAdapter;
pub use params::{row_to_json, JsonParam};
pub use privileges::{check_replication_privileges, check_wal_level, PrivilegeCheck};
pub use session::PostgresSession;

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::utils::{retry_with_backoff, strip_password_from_url};
use postgres_native_tls::MakeTlsConnector;
use std::time::Duration;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls};

/// Connect to PostgreSQL, spawning the connection driver onto the runtime
///
/// # Arguments
///
/// * `config` - Connection settings; `sslmode=disable` in the URL skips TLS
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed, the TLS connector cannot be
/// built, or the server rejects the connection.
pub async fn connect(config: &ConnectionConfig) -> Result<Client> {
    let pg_config: Config = config.url.parse()?;

    if pg_config.get_ssl_mode() == SslMode::Disable {
        let (client, connection) = pg_config.connect(NoTls).await?;
        let slug = config.slug.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(connection = %slug, "Connection error: {}", e);
            }
        });
        return Ok(client);
    }

    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(config.allow_self_signed_certs)
        .build()?;
    let (client, connection) = pg_config.connect(MakeTlsConnector::new(connector)).await?;
    let slug = config.slug.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(connection = %slug, "Connection error: {}", e);
        }
    });
    Ok(client)
}

/// [`connect`] with three retries and exponential backoff starting at one second
pub async fn connect_with_retry(config: &ConnectionConfig) -> Result<Client> {
    let display_url =
        strip_password_from_url(&config.url).unwrap_or_else(|_| "<unparseable url>".to_string());
    tracing::info!(connection = %config.slug, url = %display_url, "Connecting to PostgreSQL");
    retry_with_backoff(|| connect(config), 3, Duration::from_secs(1)).await
}

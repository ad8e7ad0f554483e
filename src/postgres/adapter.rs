// ABOUTME: ConnectionAdapter implementation that opens tokio-postgres sessions
// ABOUTME: The only backend behind the connection registry

use super::session::PostgresSession;
use crate::config::ConnectionConfig;
use crate::connection::ConnectionAdapter;
use crate::error::Result;
use crate::session::Session;
use async_trait::async_trait;

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnectionAdapter;

#[async_trait]
impl ConnectionAdapter for PostgresConnectionAdapter {
    fn connection_type(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>> {
        let client = super::connect_with_retry(config).await?;
        Ok(Box::new(PostgresSession::new(client)))
    }
}

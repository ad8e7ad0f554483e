// ABOUTME: Connection registry resolving data store slugs to live sessions
// ABOUTME: Sessions are opened lazily through a backend ConnectionAdapter

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::session::Session;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;

/// Capability to open sessions for one database family
#[async_trait]
pub trait ConnectionAdapter: Send + Sync {
    fn connection_type(&self) -> &'static str;

    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Session>>;
}

/// A session shared between components; lock it for a whole transaction
pub type SharedSession = Arc<tokio::sync::Mutex<Box<dyn Session>>>;

/// Lazily creates and caches one session per data store slug.
///
/// Concurrent lookups of the same slug connect once: every slug owns a
/// `OnceCell` that the first caller initializes.
pub struct ConnectionRegistry {
    adapter: Arc<dyn ConnectionAdapter>,
    configs: RwLock<HashMap<String, ConnectionConfig>>,
    sessions: Mutex<HashMap<String, Arc<OnceCell<SharedSession>>>>,
}

impl ConnectionRegistry {
    pub fn new(adapter: Arc<dyn ConnectionAdapter>) -> Self {
        Self {
            adapter,
            configs: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_configs(
        adapter: Arc<dyn ConnectionAdapter>,
        configs: impl IntoIterator<Item = ConnectionConfig>,
    ) -> Self {
        let registry = Self::new(adapter);
        for config in configs {
            registry.register_config(config);
        }
        registry
    }

    pub fn connection_type(&self) -> &'static str {
        self.adapter.connection_type()
    }

    pub fn register_config(&self, config: ConnectionConfig) {
        let mut configs = self.configs.write().unwrap_or_else(|e| e.into_inner());
        configs.insert(config.slug.clone(), config);
    }

    pub fn config(&self, slug: &str) -> Option<ConnectionConfig> {
        let configs = self.configs.read().unwrap_or_else(|e| e.into_inner());
        configs.get(slug).cloned()
    }

    /// Install an already-open session under `slug`
    pub fn register_session(&self, slug: &str, session: Box<dyn Session>) -> Result<()> {
        let cell = OnceCell::new_with(Some(Arc::new(tokio::sync::Mutex::new(session))));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let occupied = sessions
            .get(slug)
            .map(|existing| existing.initialized())
            .unwrap_or(false);
        if occupied {
            return Err(Error::usage(format!(
                "Connection for data store '{}' already exists",
                slug
            )));
        }
        sessions.insert(slug.to_string(), Arc::new(cell));
        Ok(())
    }

    /// Session for `slug`, connecting on first use
    pub async fn get(&self, slug: &str) -> Result<SharedSession> {
        let cell = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions
                .entry(slug.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let session = cell
            .get_or_try_init(|| async {
                let config = self
                    .config(slug)
                    .ok_or_else(|| Error::UnknownConnection(slug.to_string()))?;
                tracing::debug!(
                    data_store = slug,
                    adapter = self.adapter.connection_type(),
                    "Opening connection"
                );
                let session = self.adapter.connect(&config).await?;
                Ok::<_, Error>(Arc::new(tokio::sync::Mutex::new(session)))
            })
            .await?;
        Ok(session.clone())
    }

    pub fn is_connected(&self, slug: &str) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(slug)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Drop every cached session; the next lookup reconnects
    pub fn close_all(&self) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.clear();
    }
}

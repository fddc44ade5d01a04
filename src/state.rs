//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket upgrade through
//! `web::Data`. Everything inside is either immutable or internally
//! synchronized, so the struct is cloned freely across actix workers.

use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::connection::ConnectionManager;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed for the lifetime of the server
    pub config: Arc<AppConfig>,

    /// Registry of live client connections
    pub connections: ConnectionManager,

    pub start_time: Instant,
}

impl AppState {
    /// State whose backend is selected by `backend.mode`.
    pub fn new(config: AppConfig) -> Self {
        let config = Arc::new(config);
        let connections = ConnectionManager::from_config(config.clone());
        Self::with_connections(connections)
    }

    /// State around an existing connection manager, used by tests that
    /// inject their own backend.
    pub fn with_connections(connections: ConnectionManager) -> Self {
        Self {
            config: connections.shared_config(),
            connections,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

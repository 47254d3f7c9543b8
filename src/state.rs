//! Server state and configuration.

use std::sync::Arc;

use crate::registry::PresenceRegistry;

/// Default listen port — the port the web app's chat pages connect to.
const DEFAULT_PORT: u16 = 4000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// HS256 secret shared with the web application's auth layer.
    pub jwt_secret: Vec<u8>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            jwt_secret: b"your-secret-key".to_vec(),
        }
    }
}

/// Shared server state, cloned into each connection handler.
/// The presence registry is the only shared mutable structure in the relay.
#[derive(Clone)]
pub struct RelayState {
    pub registry: Arc<PresenceRegistry>,
    pub config: Arc<RelayConfig>,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            registry: Arc::new(PresenceRegistry::new()),
            config: Arc::new(config),
        }
    }
}

//! Shared server state.

use std::sync::Arc;

use crate::config::Config;
use crate::gateway::Gateway;

/// Shared state accessible from all handlers.
pub struct AppState {
    /// Connection registry + delivery. The only mutable shared state.
    pub gateway: Gateway,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            gateway: Gateway::new(&config),
            config,
        })
    }
}

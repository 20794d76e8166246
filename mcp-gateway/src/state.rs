//! Application state shared across HTTP handlers.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;

/// Everything an axum handler needs: the wired-up [`Gateway`] plus the
/// config it booted from. Cheap to clone — every field is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, config: Arc<GatewayConfig>) -> Self {
        Self { gateway, config }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

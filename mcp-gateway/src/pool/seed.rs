//! Boot-time server reconciliation from config (§6).
//!
//! `GatewayConfig::servers` seeds a fixed set of backend connections;
//! [`reconcile`] upserts them by name on every boot and tears down
//! previously-seeded servers whose name no longer appears, without
//! touching servers registered at runtime through the catalog API. This
//! mirrors the pool's own split of concerns: `ConnectionPool` is the only
//! thing consulted here, since registry capability discovery happens one
//! layer up once a connection is live (see [`crate::gateway`]).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::CircuitPolicy;
use crate::pool::transport::{AuthDescriptor, TransportConfig};
use crate::pool::{ConnectionPool, HealthCheckPolicy, ServerConfig, ServerMetadata};
use crate::ratelimit::RateLimitPolicy;

fn default_auth() -> AuthDescriptor {
    AuthDescriptor::None
}

fn default_enabled() -> bool {
    true
}

/// Config-file shape of a [`ServerConfig`], minus the generated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigSeed {
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_auth")]
    pub auth: AuthDescriptor,
    #[serde(default)]
    pub health_check: HealthCheckPolicy,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default)]
    pub circuit: Option<CircuitPolicy>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ServerConfigSeed {
    /// A fresh server id is generated each reconcile pass; seeded state
    /// (circuit/rate counters) is process-local anyway, so identity only
    /// needs to be stable within one process's lifetime, not across
    /// restarts.
    fn into_config(self, category: &str) -> ServerConfig {
        ServerConfig {
            id: Uuid::now_v7(),
            name: self.name,
            transport: self.transport,
            auth: self.auth,
            health_check: self.health_check,
            rate_limit: self.rate_limit,
            circuit: self.circuit,
            metadata: ServerMetadata { category: Some(category.to_string()), tags: self.tags },
            enabled: self.enabled,
        }
    }
}

/// Which servers changed state during one [`reconcile`] pass, so the
/// caller can drive registry discovery/teardown for exactly those ids.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub connected: Vec<ServerConfig>,
    pub removed: Vec<Uuid>,
}

/// Diff `seeds` against whatever is currently connected under `category`:
/// disconnect servers no longer named in `seeds`, then connect (or
/// reconnect) every enabled seed.
pub async fn reconcile(pool: &Arc<ConnectionPool>, category: &str, seeds: Vec<ServerConfigSeed>) -> ReconcileOutcome {
    let desired: Vec<ServerConfig> = seeds.into_iter().map(|seed| seed.into_config(category)).collect();
    let desired_names: std::collections::HashSet<&str> = desired.iter().map(|c| c.name.as_str()).collect();

    let mut outcome = ReconcileOutcome::default();

    for stale in pool.configs_in_category(category) {
        if !desired_names.contains(stale.name.as_str()) {
            let _ = pool.disconnect(stale.id).await;
            outcome.removed.push(stale.id);
        }
    }

    for config in desired {
        if !config.enabled {
            continue;
        }
        if pool.connect(config.clone()).await.is_ok() {
            outcome.connected.push(config);
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::ratelimit::RateLimiter;
    use std::collections::HashMap;

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(RateLimiter::new()), Arc::new(EventBus::new(16))))
    }

    fn seed(name: &str) -> ServerConfigSeed {
        ServerConfigSeed {
            name: name.to_string(),
            transport: TransportConfig::Http { url: "http://127.0.0.1:1".into(), headers: HashMap::new() },
            auth: AuthDescriptor::None,
            health_check: HealthCheckPolicy { enabled: false, ..Default::default() },
            rate_limit: None,
            circuit: None,
            tags: vec![],
            enabled: true,
        }
    }

    #[tokio::test]
    async fn reconcile_removes_stale_and_reports_connected() {
        let pool = pool();
        let first = reconcile(&pool, "seeded", vec![seed("a"), seed("b")]).await;
        assert_eq!(first.connected.len(), 2);
        assert!(first.removed.is_empty());

        let second = reconcile(&pool, "seeded", vec![seed("b")]).await;
        assert_eq!(second.connected.len(), 1);
        assert_eq!(second.connected[0].name, "b");
        assert_eq!(pool.configs_in_category("seeded").len(), 1);
    }
}

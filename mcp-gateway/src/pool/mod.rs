//! Connection pool: lifecycle management of backend MCP server sessions
//! (§4.1).
//!
//! The pool is the sole owner of [`Connection`] handles; the registry
//! (`crate::registry`) only ever stores a server id, never a client handle,
//! so the pool's lifetime is a DAG rooted here (§9 "cyclic/shared
//! ownership"). Health checking is a lightweight per-connection
//! `tokio::spawn` loop guarded by the connection's own lock, giving the
//! "per-id mutex" serialization §5 asks for without actor-mailbox
//! indirection the gateway's tests don't need.

pub mod oauth;
pub mod seed;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::circuit::CircuitPolicy;
use crate::error::{Error, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::ratelimit::{RateLimitPolicy, RateLimiter};
use oauth::{OAuth2Client, OAuthTokenCache};
use transport::{AuthDescriptor, HttpTransportClient, StdioTransportClient, TransportClient, TransportConfig, WebSocketTransportClient};

/// Health-check probe policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthCheckPolicy {
    pub enabled: bool,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 30_000, timeout_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub category: Option<String>,
    pub tags: Vec<String>,
}

/// A server's connection descriptor; the unit of `connect`/`disconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: Uuid,
    pub name: String,
    pub transport: TransportConfig,
    pub auth: AuthDescriptor,
    pub health_check: HealthCheckPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
    pub circuit: Option<CircuitPolicy>,
    pub metadata: ServerMetadata,
    pub enabled: bool,
}

/// Connection lifecycle state (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error { message: String },
}

/// A live (or last-known) backend session. Never exposed outside `pool`
/// except via the read-only [`ConnectionSnapshot`] projection.
struct Connection {
    server_id: Uuid,
    state: ConnectionState,
    client: Option<Arc<dyn TransportClient>>,
    last_health: Option<DateTime<Utc>>,
    last_error: Option<String>,
    health_task: Option<tokio::task::JoinHandle<()>>,
}

/// Read-only snapshot returned from pool queries; never carries the client
/// handle itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub server_id: Uuid,
    pub state: ConnectionState,
    pub last_health: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Lifecycle manager for every backend server connection.
pub struct ConnectionPool {
    configs: DashMap<Uuid, ServerConfig>,
    connections: DashMap<Uuid, Arc<RwLock<Connection>>>,
    oauth: Arc<OAuthTokenCache>,
    rate_limiter: Arc<RateLimiter>,
    events: Arc<EventBus>,
}

impl ConnectionPool {
    pub fn new(rate_limiter: Arc<RateLimiter>, events: Arc<EventBus>) -> Self {
        Self {
            configs: DashMap::new(),
            connections: DashMap::new(),
            oauth: Arc::new(OAuthTokenCache::new()),
            rate_limiter,
            events,
        }
    }

    /// Instantiate a transport per `config.transport` and mark the
    /// connection `connected` on success (§4.1).
    pub async fn connect(self: &Arc<Self>, config: ServerConfig) -> Result<ConnectionSnapshot> {
        let server_id = config.id;
        self.configs.insert(server_id, config.clone());

        if let Some(existing) = self.connections.get(&server_id) {
            let guard = existing.read().await;
            if matches!(guard.state, ConnectionState::Connected) {
                return Ok(Self::snapshot(&guard));
            }
        }

        let slot = self
            .connections
            .entry(server_id)
            .or_insert_with(|| {
                Arc::new(RwLock::new(Connection {
                    server_id,
                    state: ConnectionState::Disconnected,
                    client: None,
                    last_health: None,
                    last_error: None,
                    health_task: None,
                }))
            })
            .clone();

        {
            let mut guard = slot.write().await;
            guard.state = ConnectionState::Connecting;
        }

        match self.instantiate_transport(&config).await {
            Ok(client) => {
                let mut guard = slot.write().await;
                guard.state = ConnectionState::Connected;
                guard.client = Some(client);
                guard.last_health = Some(Utc::now());
                guard.last_error = None;

                self.events.publish(GatewayEvent::ServerConnected { server_id });

                if config.health_check.enabled {
                    self.schedule_health_probe(config.clone(), slot.clone());
                }

                Ok(Self::snapshot(&guard))
            }
            Err(err) => {
                let mut guard = slot.write().await;
                guard.state = ConnectionState::Error { message: err.to_string() };
                guard.client = None;
                guard.last_error = Some(err.to_string());
                self.events.publish(GatewayEvent::ServerConnectFailed {
                    server_id,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn instantiate_transport(&self, config: &ServerConfig) -> Result<Arc<dyn TransportClient>> {
        match &config.transport {
            TransportConfig::Stdio { command, args, env } => {
                let client = StdioTransportClient::spawn(command, args, env).await?;
                Ok(Arc::new(client))
            }
            TransportConfig::Http { url, headers } => {
                let headers = self.resolved_headers(config, headers).await?;
                let client = HttpTransportClient::new(url.clone(), &headers)?;
                Ok(Arc::new(client))
            }
            TransportConfig::Sse { url, headers } => {
                let headers = self.resolved_headers(config, headers).await?;
                let client = Arc::new(HttpTransportClient::new(url.clone(), &headers)?);
                client.start_sse_stream().await;
                Ok(client as Arc<dyn TransportClient>)
            }
            TransportConfig::WebSocket { url, .. } => {
                let client = WebSocketTransportClient::connect(url).await?;
                Ok(Arc::new(client))
            }
        }
    }

    async fn resolved_headers(&self, config: &ServerConfig, base: &HashMap<String, String>) -> Result<HashMap<String, String>> {
        let mut headers = base.clone();
        match &config.auth {
            AuthDescriptor::None => {}
            AuthDescriptor::ApiKey { header, value } => {
                headers.insert(header.clone(), value.clone());
            }
            AuthDescriptor::OAuth2 { token_url, client_id, client_secret, scope } => {
                let oauth_client = OAuth2Client {
                    token_url: token_url.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    scope: scope.clone(),
                };
                let token = self.oauth.token_for(config.id, &oauth_client).await?;
                headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            }
        }
        Ok(headers)
    }

    fn schedule_health_probe(self: &Arc<Self>, config: ServerConfig, slot: Arc<RwLock<Connection>>) {
        let pool = self.clone();
        let interval = Duration::from_millis(config.health_check.interval_ms);
        let timeout = Duration::from_millis(config.health_check.timeout_ms);
        let server_id = config.id;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                let client = { slot.read().await.client.clone() };
                let Some(client) = client else { break };

                match client.probe(timeout).await {
                    Ok(()) => {
                        let mut guard = slot.write().await;
                        let was_down = !matches!(guard.state, ConnectionState::Connected);
                        guard.state = ConnectionState::Connected;
                        guard.last_health = Some(Utc::now());
                        guard.last_error = None;
                        drop(guard);
                        if was_down {
                            pool.events.publish(GatewayEvent::ServerConnected { server_id });
                        }
                    }
                    Err(err) => {
                        {
                            let mut guard = slot.write().await;
                            guard.state = ConnectionState::Error { message: err.to_string() };
                            guard.last_error = Some(err.to_string());
                        }
                        pool.events.publish(GatewayEvent::ServerHealthFailed {
                            server_id,
                            error: err.to_string(),
                        });

                        if let Some(cfg) = pool.configs.get(&server_id).map(|c| c.clone()) {
                            let _ = pool.reconnect(cfg, &slot).await;
                        }
                    }
                }
            }
        });

        tokio::spawn({
            let slot = slot.clone();
            async move {
                slot.write().await.health_task = Some(handle);
            }
        });
    }

    async fn reconnect(&self, config: ServerConfig, slot: &Arc<RwLock<Connection>>) -> Result<()> {
        {
            let mut guard = slot.write().await;
            if let Some(client) = guard.client.take() {
                client.close().await;
            }
        }

        match self.instantiate_transport(&config).await {
            Ok(client) => {
                let mut guard = slot.write().await;
                guard.state = ConnectionState::Connected;
                guard.client = Some(client);
                guard.last_health = Some(Utc::now());
                guard.last_error = None;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(server_id = %config.id, error = %err, "reconnect attempt failed");
                Err(err)
            }
        }
    }

    pub async fn disconnect(&self, server_id: Uuid) -> Result<()> {
        self.rate_limiter.remove_server(server_id);
        self.configs.remove(&server_id);

        if let Some((_, slot)) = self.connections.remove(&server_id) {
            let mut guard = slot.write().await;
            if let Some(handle) = guard.health_task.take() {
                handle.abort();
            }
            if let Some(client) = guard.client.take() {
                client.close().await;
            }
            guard.state = ConnectionState::Disconnected;
        }

        self.events.publish(GatewayEvent::ServerDisconnected { server_id });
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<Uuid> = self.connections.iter().map(|kv| *kv.key()).collect();
        futures::future::join_all(ids.into_iter().map(|id| self.disconnect(id))).await;
    }

    pub async fn get_client(&self, server_id: Uuid) -> Option<Arc<dyn TransportClient>> {
        let slot = self.connections.get(&server_id)?.clone();
        let guard = slot.read().await;
        match guard.state {
            ConnectionState::Connected => guard.client.clone(),
            _ => None,
        }
    }

    pub async fn get_status(&self, server_id: Uuid) -> Option<ConnectionSnapshot> {
        let slot = self.connections.get(&server_id)?.clone();
        let guard = slot.read().await;
        Some(Self::snapshot(&guard))
    }

    /// The last-registered config for a server, used by the router to
    /// look up per-server rate-limit/circuit policy (§4.2).
    pub fn config(&self, server_id: Uuid) -> Option<ServerConfig> {
        self.configs.get(&server_id).map(|c| c.clone())
    }

    pub fn server_id_by_name(&self, name: &str) -> Option<Uuid> {
        self.configs.iter().find(|kv| kv.value().name == name).map(|kv| *kv.key())
    }

    /// Every currently-registered config tagged with `category`, used by
    /// [`crate::pool::seed::reconcile`] to diff a config-seeded set against
    /// what's already connected without touching servers registered at
    /// runtime through the catalog API.
    pub fn configs_in_category(&self, category: &str) -> Vec<ServerConfig> {
        self.configs
            .iter()
            .filter(|kv| kv.value().metadata.category.as_deref() == Some(category))
            .map(|kv| kv.value().clone())
            .collect()
    }

    /// Every currently-registered config regardless of category, for the
    /// admin catalog listing endpoint (§6).
    pub fn all_configs(&self) -> Vec<ServerConfig> {
        self.configs.iter().map(|kv| kv.value().clone()).collect()
    }

    fn snapshot(guard: &Connection) -> ConnectionSnapshot {
        ConnectionSnapshot {
            server_id: guard.server_id,
            state: guard.state.clone(),
            last_health: guard.last_health,
            last_error: guard.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(Arc::new(RateLimiter::new()), Arc::new(EventBus::new(16))))
    }

    #[tokio::test]
    async fn unknown_server_has_no_client() {
        let pool = pool();
        assert!(pool.get_client(Uuid::now_v7()).await.is_none());
        assert!(pool.get_status(Uuid::now_v7()).await.is_none());
    }

    #[tokio::test]
    async fn connect_with_unreachable_http_backend_errors_and_records_state() {
        let pool = pool();
        let config = ServerConfig {
            id: Uuid::now_v7(),
            name: "unreachable".into(),
            transport: TransportConfig::Http {
                url: "http://127.0.0.1:1".into(),
                headers: HashMap::new(),
            },
            auth: AuthDescriptor::None,
            health_check: HealthCheckPolicy { enabled: false, ..Default::default() },
            rate_limit: None,
            circuit: None,
            metadata: ServerMetadata::default(),
            enabled: true,
        };

        let result = pool.connect(config.clone()).await;
        assert!(result.is_err());

        let status = pool.get_status(config.id).await.unwrap();
        assert!(matches!(status.state, ConnectionState::Error { .. }));
    }

    #[tokio::test]
    async fn disconnect_clears_client_and_status() {
        let pool = pool();
        let server_id = Uuid::now_v7();
        pool.disconnect(server_id).await.unwrap();
        assert!(pool.get_client(server_id).await.is_none());
    }

    #[tokio::test]
    async fn all_configs_lists_regardless_of_category() {
        let pool = pool();
        let seeded = ServerConfig {
            id: Uuid::now_v7(),
            name: "seeded-one".into(),
            transport: TransportConfig::Http { url: "http://127.0.0.1:1".into(), headers: HashMap::new() },
            auth: AuthDescriptor::None,
            health_check: HealthCheckPolicy { enabled: false, ..Default::default() },
            rate_limit: None,
            circuit: None,
            metadata: ServerMetadata { category: Some("seeded".into()), tags: Vec::new() },
            enabled: true,
        };
        let runtime_registered = ServerConfig {
            id: Uuid::now_v7(),
            name: "runtime-one".into(),
            metadata: ServerMetadata::default(),
            ..seeded.clone()
        };

        let _ = pool.connect(seeded.clone()).await;
        let _ = pool.connect(runtime_registered.clone()).await;

        assert_eq!(pool.configs_in_category("seeded").len(), 1);
        assert_eq!(pool.all_configs().len(), 2);
    }
}

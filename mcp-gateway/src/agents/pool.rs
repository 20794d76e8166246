//! Pool agent implementations for reactive connection management
//!
//! These agents manage the gateway's own ambient storage connections (the
//! durable Postgres pool and the Redis mirror) using the actor pattern,
//! providing automatic reconnection and graceful shutdown. The *backend
//! server* connection pool (stdio/sse/http/websocket transports to MCP
//! servers) lives in [`crate::pool`] and follows the same pattern.
//!
//! ## Shared State Architecture
//!
//! Pool agents receive a shared `Arc<RwLock<Option<Pool>>>` reference during
//! spawn. When the pool connects, the agent updates this shared storage,
//! allowing `GatewayState` to access pools directly without message passing
//! overhead.
//!
//! ## Pattern: Spawn and Send Message
//!
//! Because acton-reactive requires `Send + Sync` futures for handlers, but
//! database/cache connection futures are typically only `Send`, we use the
//! "spawn and send message to self" pattern:
//!
//! 1. Spawn the non-Sync connection work with `tokio::spawn`
//! 2. Send a message to self when the connection completes
//! 3. Handle that message in a `mutate_on` handler to update agent state

// ============================================================================
// Database Pool Agent
// ============================================================================

use std::sync::Arc;
use tokio::sync::RwLock;
use acton_reactive::prelude::*;
use super::messages::{DatabasePoolConnected, DatabasePoolConnectionFailed};

/// Shared pool storage type for database connections
pub type SharedDbPool = Arc<RwLock<Option<sqlx::PgPool>>>;

/// State for the database pool agent
#[derive(Debug, Default)]
pub struct DatabasePoolState {
    /// The underlying PostgreSQL connection pool
    pub pool: Option<sqlx::PgPool>,
    /// Configuration for the database connection
    pub config: Option<crate::config::DatabaseConfig>,
    /// Whether the agent is currently attempting to connect
    pub connecting: bool,
    /// Shared storage that GatewayState reads from directly
    pub shared_pool: Option<SharedDbPool>,
}

/// Agent-based PostgreSQL connection pool manager
pub struct DatabasePoolAgent;

impl DatabasePoolAgent {
    /// Spawn a new database pool agent with the given configuration
    pub async fn spawn(
        runtime: &mut AgentRuntime,
        config: crate::config::DatabaseConfig,
        shared_pool: Option<SharedDbPool>,
    ) -> anyhow::Result<AgentHandle> {
        let mut agent = runtime.new_agent::<DatabasePoolState>();

        agent.model.config = Some(config);
        agent.model.connecting = true;
        agent.model.shared_pool = shared_pool;

        agent.mutate_on::<DatabasePoolConnected>(|agent, envelope| {
            let pool = envelope.message().pool.clone();
            agent.model.pool = Some(pool.clone());
            agent.model.connecting = false;
            let shared_pool = agent.model.shared_pool.clone();

            AgentReply::from_async(async move {
                if let Some(shared) = shared_pool {
                    *shared.write().await = Some(pool);
                    tracing::info!("database pool connected and stored in shared state");
                } else {
                    tracing::info!("database pool connected (no shared state)");
                }
            })
        });

        agent.mutate_on::<DatabasePoolConnectionFailed>(|agent, envelope| {
            let error_msg = envelope.message().error.clone();
            agent.model.connecting = false;
            tracing::error!("database pool connection failed: {}", error_msg);
            AgentReply::immediate()
        });

        agent.after_start(|agent| {
            let config = agent.model.config.clone();
            let self_handle = agent.handle().clone();

            AgentReply::from_async(async move {
                #[cfg(feature = "database")]
                if let Some(cfg) = config {
                    tracing::info!("database pool agent starting, connecting to database...");

                    let result = tokio::spawn(async move { crate::database::create_pool(&cfg).await }).await;

                    match result {
                        Ok(Ok(pool)) => {
                            self_handle.send(DatabasePoolConnected { pool }).await;
                        }
                        Ok(Err(e)) => {
                            self_handle
                                .send(DatabasePoolConnectionFailed { error: e.to_string() })
                                .await;
                        }
                        Err(e) => {
                            self_handle
                                .send(DatabasePoolConnectionFailed {
                                    error: format!("connection task panicked: {}", e),
                                })
                                .await;
                        }
                    }
                }

                #[cfg(not(feature = "database"))]
                {
                    let _ = (config, self_handle);
                }
            })
        });

        agent.before_stop(|agent| {
            let pool = agent.model.pool.clone();
            AgentReply::from_async(async move {
                if let Some(p) = pool {
                    tracing::info!("database pool agent stopping, closing connections...");
                    p.close().await;
                    tracing::info!("database pool closed");
                }
            })
        });

        let handle = agent.start().await;
        Ok(handle)
    }
}

// ============================================================================
// Redis Pool Agent
// ============================================================================

#[cfg(feature = "cache")]
use super::messages::{RedisPoolConnected, RedisPoolConnectionFailed};

/// Shared pool storage type for Redis connections
#[cfg(feature = "cache")]
pub type SharedRedisPool = Arc<RwLock<Option<deadpool_redis::Pool>>>;

/// State for the Redis pool agent
#[cfg(feature = "cache")]
#[derive(Debug, Default)]
pub struct RedisPoolState {
    /// The underlying Redis connection pool
    pub pool: Option<deadpool_redis::Pool>,
    /// Configuration for the Redis connection
    pub config: Option<crate::config::RedisConfig>,
    /// Whether the agent is currently attempting to connect
    pub connecting: bool,
    /// Shared storage that GatewayState reads from directly
    pub shared_pool: Option<SharedRedisPool>,
}

/// Agent-based Redis connection pool manager
#[cfg(feature = "cache")]
pub struct RedisPoolAgent;

#[cfg(feature = "cache")]
impl RedisPoolAgent {
    /// Spawn a new Redis pool agent with the given configuration
    pub async fn spawn(
        runtime: &mut AgentRuntime,
        config: crate::config::RedisConfig,
        shared_pool: Option<SharedRedisPool>,
    ) -> anyhow::Result<AgentHandle> {
        let mut agent = runtime.new_agent::<RedisPoolState>();

        agent.model.config = Some(config);
        agent.model.connecting = true;
        agent.model.shared_pool = shared_pool;

        agent.mutate_on::<RedisPoolConnected>(|agent, envelope| {
            let pool = envelope.message().pool.clone();
            agent.model.pool = Some(pool.clone());
            agent.model.connecting = false;
            let shared_pool = agent.model.shared_pool.clone();

            AgentReply::from_async(async move {
                if let Some(shared) = shared_pool {
                    *shared.write().await = Some(pool);
                    tracing::info!("redis pool connected and stored in shared state");
                } else {
                    tracing::info!("redis pool connected (no shared state)");
                }
            })
        });

        agent.mutate_on::<RedisPoolConnectionFailed>(|agent, envelope| {
            let error_msg = envelope.message().error.clone();
            agent.model.connecting = false;
            tracing::error!("redis pool connection failed: {}", error_msg);
            AgentReply::immediate()
        });

        agent.after_start(|agent| {
            let config = agent.model.config.clone();
            let self_handle = agent.handle().clone();

            AgentReply::from_async(async move {
                if let Some(cfg) = config {
                    tracing::info!("redis pool agent starting, connecting to Redis...");

                    let result = tokio::spawn(async move { crate::cache::create_pool(&cfg).await }).await;

                    match result {
                        Ok(Ok(pool)) => {
                            self_handle.send(RedisPoolConnected { pool }).await;
                        }
                        Ok(Err(e)) => {
                            self_handle
                                .send(RedisPoolConnectionFailed { error: e.to_string() })
                                .await;
                        }
                        Err(e) => {
                            self_handle
                                .send(RedisPoolConnectionFailed {
                                    error: format!("connection task panicked: {}", e),
                                })
                                .await;
                        }
                    }
                }
            })
        });

        agent.before_stop(|_agent| {
            AgentReply::from_async(async move {
                tracing::info!("redis pool agent stopping");
            })
        });

        let handle = agent.start().await;
        Ok(handle)
    }
}

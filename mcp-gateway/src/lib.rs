//! # mcp-gateway
//!
//! Multi-tenant gateway for the Model Context Protocol: a connection pool
//! that keeps backend MCP servers alive and health-checked, a capability
//! registry and router that qualifies and rate-limits every invocation, a
//! workflow engine for multi-step tool/prompt orchestration, and an event
//! fabric that fans invocations and workflow progress out over SSE and
//! signed webhooks.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_gateway::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::load()?;
//!     init_tracing(&config)?;
//!
//!     let gateway = Arc::new(GatewayBuilder::new(config.clone()).build().await?);
//!     let state = AppState::new(gateway, Arc::new(config.clone()));
//!
//!     let app = build_router().with_state(state);
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod audit;
pub mod circuit;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity;
pub mod observability;
pub mod pool;
pub mod ratelimit;
pub mod registry;
pub mod response_cache;
pub mod responses;
pub mod router;
pub mod server;
pub mod state;
pub mod storage;
pub mod workflow;

#[cfg(feature = "database")]
pub mod database;

#[cfg(feature = "cache")]
pub mod cache;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::config::GatewayConfig;
    pub use crate::error::{Error, Result};
    pub use crate::server::Server;
    pub use crate::state::AppState;

    #[cfg(feature = "observability")]
    pub use crate::observability::init_tracing;

    pub use crate::agents::{AggregatedHealthResponse, BackgroundWorkerAgent, HealthMonitorAgent, HealthStatus, TaskStatus};

    #[cfg(feature = "database")]
    pub use crate::agents::{DatabasePoolAgent, SharedDbPool};

    #[cfg(feature = "cache")]
    pub use crate::agents::{RedisPoolAgent, SharedRedisPool};

    pub use crate::audit::{AuditAgent, AuditChain, AuditConfig, AuditEvent, AuditLogger, AuditStorage, verify_chain};
    pub use crate::identity::{ApiKey, SemanticEmbedding, Tenant};

    pub use crate::registry::{CapabilityEntry, CapabilityKind, Registry, SearchOptions, SearchPage};
    pub use crate::ratelimit::{ChargeOutcome, RateLimitBucket, RateLimitPolicy, RateLimiter};
    pub use crate::circuit::{CircuitBreaker, CircuitPolicy, CircuitState, CircuitStateKind};
    pub use crate::response_cache::{CacheKey, DurableCache, InvalidateFilter, ResponseCache};
    pub use crate::responses::Created;
    pub use crate::pool::{ConnectionPool, ConnectionSnapshot, ConnectionState, ServerConfig};
    pub use crate::pool::transport::{AuthDescriptor, TransportConfig};
    pub use crate::router::{InvokeRequest, InvokeResponse, Router as GatewayRouter};
    pub use crate::events::{EventBus, EventEnvelope, EventFilter, GatewayEvent};
    pub use crate::events::webhooks::{WebhookDispatcher, WebhookSubscription};
    pub use crate::storage::GatewayStorage;
    pub use crate::workflow::{Workflow, WorkflowDefinition, WorkflowEngine, WorkflowExecution};
    pub use crate::gateway::{build_router, Gateway, GatewayBuilder};

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Extension, Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error;
    pub use anyhow::{self, Context as AnyhowContext};

    pub use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};

    pub use uuid::Uuid;

    pub use futures::{future, stream, Future, Stream, StreamExt, TryFutureExt, TryStreamExt};

    pub use http::{Method, Uri};

    pub use acton_reactive::prelude::*;
}

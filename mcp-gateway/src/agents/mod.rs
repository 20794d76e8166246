//! Agent-based components for the gateway
//!
//! Reactive, actor-based alternatives to traditional connection-pool and
//! background-task management. Built on [`acton_reactive`], these agents
//! offer:
//!
//! - **Elimination of lock contention**: no bare `Arc<RwLock<Option<T>>>` reads on the hot path
//! - **Automatic reconnection**: built-in retry logic with state tracking
//! - **Health monitoring**: agent-based health checks via message passing
//! - **Graceful shutdown**: coordinated via agent lifecycle hooks

pub mod background_worker;
mod health;
mod messages;
mod pool;

pub mod prelude {
    //! Convenient re-exports for agent-based components

    pub use acton_reactive::prelude::*;

    pub use super::messages::{AggregatedHealthResponse, ComponentHealth, HealthStatus};

    pub use super::health::{HealthMonitorAgent, HealthMonitorState};

    pub use super::pool::{DatabasePoolAgent, DatabasePoolState};

    #[cfg(feature = "cache")]
    pub use super::pool::{RedisPoolAgent, RedisPoolState};

    pub use super::background_worker::{BackgroundWorkerAgent, BackgroundWorkerState, TaskStatus};
}

pub use messages::*;

pub use health::{HealthMonitorAgent, HealthMonitorState};

pub use background_worker::{BackgroundWorkerAgent, BackgroundWorkerState, TaskStatus};

pub use pool::{DatabasePoolAgent, DatabasePoolState, SharedDbPool};

#[cfg(feature = "cache")]
pub use pool::{RedisPoolAgent, RedisPoolState, SharedRedisPool};

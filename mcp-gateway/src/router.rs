//! Tool invocation router (§4.2).
//!
//! `Router::invoke` composes cache, circuit breaker, rate limiter, pool
//! dispatch, and usage accounting in the fixed order §4.2 requires:
//! cache-hit shortcut, circuit gate, rate gate, dispatch, outcome
//! accounting. Each stage is a discrete async call rather than a
//! `tower::Layer`, because the ordering and short-circuit semantics here
//! are a spec invariant the gateway owns, not a generic middleware
//! concern (see `SPEC_FULL.md` §4.2).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit::{CircuitBreaker, CircuitStateKind};
use crate::error::{Error, Result};
use crate::events::{EventBus, GatewayEvent};
use crate::pool::ConnectionPool;
use crate::ratelimit::RateLimiter;
use crate::registry::{CapabilityKind, Registry};
use crate::response_cache::{CacheKey, ResponseCache};

/// Maps a circuit breaker transition to the `circuit.*` event it publishes
/// (§4.5's event taxonomy names all three as a category).
fn circuit_event(server_id: Uuid, state: CircuitStateKind) -> GatewayEvent {
    match state {
        CircuitStateKind::Open => GatewayEvent::CircuitOpened { server_id },
        CircuitStateKind::HalfOpen => GatewayEvent::CircuitHalfOpen { server_id },
        CircuitStateKind::Closed => GatewayEvent::CircuitClosed { server_id },
    }
}

/// Synthetic caller identity used for internal/unauthenticated callers so
/// rate accounting stays uniform (§9 open question: "a synthetic identity
/// SHOULD be used so accounting is uniform").
pub const INTERNAL_CALLER_KEY: Uuid = Uuid::nil();

/// A single tool invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub caller_key_id: Option<Uuid>,
    /// Whether this call's response is eligible for the response cache;
    /// the decision of *which* tools are cacheable is a call-site policy,
    /// the router only provides the primitive (§4.2).
    pub cacheable: bool,
    pub cache_ttl: Duration,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(tool_name: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            params,
            caller_key_id: None,
            cacheable: false,
            cache_ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn caller(mut self, key_id: Uuid) -> Self {
        self.caller_key_id = Some(key_id);
        self
    }

    pub fn cacheable(mut self, ttl: Duration) -> Self {
        self.cacheable = true;
        self.cache_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub output: serde_json::Value,
    pub cached: bool,
    pub duration_ms: u64,
    pub remaining_per_minute: Option<u32>,
    pub remaining_per_day: Option<u32>,
}

/// Composes the registry, pool, rate limiter, circuit breaker, and
/// response cache behind the single `invoke`/`invoke_batch` contract of
/// §4.2.
pub struct Router {
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    rate_limiter: Arc<RateLimiter>,
    circuit: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    events: Arc<EventBus>,
}

impl Router {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<ConnectionPool>,
        rate_limiter: Arc<RateLimiter>,
        circuit: Arc<CircuitBreaker>,
        cache: Arc<ResponseCache>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { registry, pool, rate_limiter, circuit, cache, events }
    }

    /// Five-stage pipeline: cache → circuit → rate → dispatch → accounting
    /// (§4.2). Each stage's short-circuit maps to the error taxonomy of §7.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let entry = self
            .registry
            .find(&request.tool_name)
            .ok_or_else(|| Error::NotFound(format!("tool '{}' not registered", request.tool_name)))?;
        if entry.kind != CapabilityKind::Tool {
            return Err(Error::BadRequest(format!("'{}' is not a tool", request.tool_name)));
        }
        let server_id = entry.server_id;
        let caller = request.caller_key_id.unwrap_or(INTERNAL_CALLER_KEY);

        // 1. Cache-hit shortcut.
        let cache_key = CacheKey::new("tool", server_id, &entry.qualified_name, &request.params);
        if request.cacheable {
            if let Some(hit) = self.cache.get(&cache_key).await {
                return Ok(InvokeResponse {
                    output: hit.payload,
                    cached: true,
                    duration_ms: 0,
                    remaining_per_minute: None,
                    remaining_per_day: None,
                });
            }
        }

        let now = chrono::Utc::now();

        // 2. Circuit gate.
        let (allowed, transition) = self.circuit.can_execute_noting_transition(server_id, now);
        if let Some(state) = transition {
            self.events.publish(circuit_event(server_id, state));
        }
        if !allowed {
            return Err(Error::CircuitOpen {
                server_id,
                retry_after_ms: self.circuit.retry_after_ms(server_id, now),
            });
        }

        // 3. Rate gate.
        let policy = self.pool.config(server_id).and_then(|c| c.rate_limit).unwrap_or(crate::ratelimit::RateLimitPolicy::new(0, 0));
        let charge = self.rate_limiter.charge(caller, server_id, policy, now);
        if !charge.admitted {
            return Err(Error::RateLimited {
                remaining_per_minute: charge.remaining_per_minute,
                remaining_per_day: charge.remaining_per_day,
                reset_at: charge.reset_at,
            });
        }

        // 4. Dispatch.
        let client = self
            .pool
            .get_client(server_id)
            .await
            .ok_or_else(|| Error::External(format!("server '{}' has no active connection", entry.server_name)))?;

        let started = std::time::Instant::now();
        let outcome = client.call_tool(&entry.local_name, request.params.clone(), request.timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // 5. Outcome accounting.
        match outcome {
            Ok(output) => {
                if let Some(state) = self.circuit.record_success(server_id, chrono::Utc::now()) {
                    self.events.publish(circuit_event(server_id, state));
                }
                if request.cacheable {
                    self.cache.set(&cache_key, output.clone(), request.cache_ttl).await;
                }
                self.events.publish(GatewayEvent::ToolInvoked {
                    server_id,
                    qualified_name: entry.qualified_name.clone(),
                    duration_ms,
                    cached: false,
                });
                Ok(InvokeResponse {
                    output,
                    cached: false,
                    duration_ms,
                    remaining_per_minute: Some(charge.remaining_per_minute),
                    remaining_per_day: Some(charge.remaining_per_day),
                })
            }
            Err(err) => {
                if let Some(state) = self.circuit.record_failure(server_id, chrono::Utc::now()) {
                    self.events.publish(circuit_event(server_id, state));
                }
                self.events.publish(GatewayEvent::ToolFailed {
                    server_id,
                    qualified_name: entry.qualified_name.clone(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Runs every request concurrently, preserving input order in the
    /// output, with one element's failure never aborting the others
    /// (§4.2 "Batch invoke"; §8 law "Bulk = sequential").
    pub async fn invoke_batch(&self, requests: Vec<InvokeRequest>) -> Vec<Result<InvokeResponse>> {
        let futures = requests.into_iter().map(|req| self.invoke(req));
        futures::future::join_all(futures).await
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CapabilityEntry, CapabilityKind as Kind};

    fn router() -> (Router, Arc<Registry>, Arc<ConnectionPool>) {
        let (router, registry, pool, _events) = router_with_events();
        (router, registry, pool)
    }

    fn router_with_events() -> (Router, Arc<Registry>, Arc<ConnectionPool>, Arc<EventBus>) {
        let registry = Arc::new(Registry::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let events = Arc::new(EventBus::new(16));
        let pool = Arc::new(ConnectionPool::new(rate_limiter.clone(), events.clone()));
        let circuit = Arc::new(CircuitBreaker::new());
        let cache = Arc::new(ResponseCache::new(16, Arc::new(crate::response_cache::InMemoryDurableCache::default())));
        let router = Router::new(registry.clone(), pool.clone(), rate_limiter, circuit, cache, events.clone());
        (router, registry, pool, events)
    }

    #[tokio::test]
    async fn invoke_unknown_tool_is_not_found() {
        let (router, _registry, _pool) = router();
        let result = router.invoke(InvokeRequest::new("missing/tool", serde_json::json!({}))).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn invoke_with_no_connection_is_external_error() {
        let (router, registry, _pool) = router();
        let server_id = Uuid::now_v7();
        registry.upsert(CapabilityEntry {
            qualified_name: "fs/read".into(),
            local_name: "read".into(),
            server_name: "fs".into(),
            server_id,
            kind: Kind::Tool,
            description: "reads a file".into(),
            input_schema: serde_json::json!({}),
            category: None,
            tags: vec![],
            registered_at: chrono::Utc::now(),
        });

        let result = router.invoke(InvokeRequest::new("fs/read", serde_json::json!({}))).await;
        assert!(matches!(result, Err(Error::External(_))));
    }

    #[tokio::test]
    async fn repeated_dispatch_failures_open_the_circuit_and_publish_an_event() {
        let (router, registry, _pool, events) = router_with_events();
        let server_id = Uuid::now_v7();
        registry.upsert(CapabilityEntry {
            qualified_name: "fs/read".into(),
            local_name: "read".into(),
            server_name: "fs".into(),
            server_id,
            kind: Kind::Tool,
            description: String::new(),
            input_schema: serde_json::json!({}),
            category: None,
            tags: vec![],
            registered_at: chrono::Utc::now(),
        });
        let mut rx = events.subscribe();

        // Default circuit policy: failure_threshold=5, volume_threshold=5.
        for _ in 0..5 {
            let _ = router.invoke(InvokeRequest::new("fs/read", serde_json::json!({}))).await;
        }

        let result = router.invoke(InvokeRequest::new("fs/read", serde_json::json!({}))).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));

        let mut saw_opened = false;
        while let Ok(envelope) = rx.try_recv() {
            if matches!(envelope.event, GatewayEvent::CircuitOpened { server_id: sid } if sid == server_id) {
                saw_opened = true;
            }
        }
        assert!(saw_opened, "expected a circuit.opened event once the failure threshold was crossed");
    }

    #[tokio::test]
    async fn invoke_batch_preserves_order_and_isolates_failures() {
        let (router, registry, _pool) = router();
        let server_id = Uuid::now_v7();
        registry.upsert(CapabilityEntry {
            qualified_name: "fs/read".into(),
            local_name: "read".into(),
            server_name: "fs".into(),
            server_id,
            kind: Kind::Tool,
            description: String::new(),
            input_schema: serde_json::json!({}),
            category: None,
            tags: vec![],
            registered_at: chrono::Utc::now(),
        });

        let requests = vec![
            InvokeRequest::new("fs/read", serde_json::json!({})),
            InvokeRequest::new("missing/tool", serde_json::json!({})),
            InvokeRequest::new("fs/read", serde_json::json!({})),
        ];
        let results = router.invoke_batch(requests).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_err());
        assert!(matches!(results[1], Err(Error::NotFound(_))));
        assert!(results[2].is_err());
    }
}

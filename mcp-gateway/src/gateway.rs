//! The gateway itself: wires the registry, connection pool, router,
//! workflow engine, event fabric, and ambient agents into one object, and
//! exposes the thin HTTP/SSE surface of §6 over it.
//!
//! [`GatewayBuilder`] follows a fluent `new().build()` shape rather than a
//! generic `with_x()` chain, since every component here is fixed by what
//! the gateway needs rather than configurable per caller.

use std::sync::Arc;

use acton_reactive::prelude::{ActonApp, AgentRuntime};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::Deserialize;
use uuid::Uuid;

use crate::agents::background_worker::BackgroundWorkerAgent;
use crate::agents::{DatabasePoolAgent, HealthMonitorAgent, SharedDbPool};
use crate::audit::{AuditAgent, AuditLogger};
use crate::circuit::CircuitBreaker;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::events::webhooks::{WebhookDispatcher, WebhookSubscriptionSeed};
use crate::events::{EventBus, GatewayEvent};
use crate::pool::seed::{self, ReconcileOutcome};
use crate::pool::transport::CapabilityDescriptor;
use crate::pool::{ConnectionPool, ServerConfig};
use crate::ratelimit::RateLimiter;
use crate::registry::{CapabilityEntry, CapabilityKind, Registry};
use crate::response_cache::{InMemoryDurableCache, ResponseCache};
use crate::responses::Created;
use crate::router::{InvokeRequest, Router};
use crate::state::AppState;
use crate::storage::{GatewayStorage, InMemoryGatewayStorage};
use crate::workflow::{WorkflowDefinition, WorkflowEngine};

#[cfg(feature = "cache")]
use crate::agents::{RedisPoolAgent, SharedRedisPool};

/// Category tag for servers seeded from [`GatewayConfig::servers`], kept
/// distinct from servers registered later through an (out-of-scope here)
/// admin API so a config reload never tears down runtime-registered ones.
const SEEDED_CATEGORY: &str = "seeded";

/// Response-cache hot-tier capacity; entries beyond this are only kept in
/// the durable tier.
const RESPONSE_CACHE_CAPACITY: usize = 10_000;

/// Everything the gateway needs to serve requests, own connections, and
/// run its background agents. Cloning is cheap (every field is an `Arc`);
/// the only non-`Arc`-wrapped piece, the agent runtime, is kept in its own
/// `Arc<tokio::sync::Mutex<_>>` purely so `shutdown` can consume it once.
pub struct Gateway {
    pub registry: Arc<Registry>,
    pub pool: Arc<ConnectionPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit: Arc<CircuitBreaker>,
    pub cache: Arc<ResponseCache>,
    pub events: Arc<EventBus>,
    pub router: Arc<Router>,
    pub storage: Arc<dyn GatewayStorage>,
    pub workflows: Arc<WorkflowEngine>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub audit: AuditLogger,
    agent_runtime: Arc<tokio::sync::Mutex<Option<AgentRuntime>>>,
}

impl Gateway {
    /// Gracefully stop every ambient agent (pool agents, health monitor,
    /// background worker, audit agent). Safe to call at most once.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(mut runtime) = self.agent_runtime.lock().await.take() {
            runtime.shutdown_all().await?;
        }
        Ok(())
    }

    /// Admission check for the opaque master-admin key (§3 glossary). An
    /// empty configured key disables the admin surface entirely.
    pub fn check_admin_key(&self, presented: Option<&str>, configured: &str) -> Result<()> {
        if configured.is_empty() {
            return Err(Error::Forbidden("admin API disabled: no master key configured".into()));
        }
        match presented {
            Some(key) if key == configured => Ok(()),
            _ => Err(Error::Unauthenticated("missing or invalid admin key".into())),
        }
    }
}

/// Fluent builder for [`Gateway`]: `GatewayBuilder::new(config).build()`.
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Wire every component, connect configured backend servers, and start
    /// the ambient agents (pool agents, health monitor, background worker,
    /// audit agent, webhook dispatcher).
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;

        let mut runtime = ActonApp::launch();

        let registry = Arc::new(Registry::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let circuit = Arc::new(CircuitBreaker::new());
        let events = Arc::new(EventBus::default());
        let pool = Arc::new(ConnectionPool::new(rate_limiter.clone(), events.clone()));

        let (storage, durable_cache) = Self::build_storage(&config, &mut runtime).await?;
        let cache = Arc::new(ResponseCache::new(RESPONSE_CACHE_CAPACITY, durable_cache));

        let router = Arc::new(Router::new(
            registry.clone(),
            pool.clone(),
            rate_limiter.clone(),
            circuit.clone(),
            cache.clone(),
            events.clone(),
        ));

        let budget_rules = config.workflow.budget_rules.iter().cloned().map(|seed| seed.into_rule()).collect();
        let workflows = Arc::new(WorkflowEngine::new(router.clone(), registry.clone(), storage.clone(), events.clone(), budget_rules));

        let worker = Arc::new(BackgroundWorkerAgent::spawn(&mut runtime).await?);
        let _health_monitor = HealthMonitorAgent::spawn(&mut runtime).await?;

        let webhooks = Arc::new(WebhookDispatcher::new(worker.clone(), storage.clone()));
        webhooks.load_subscriptions().await.map_err(|e| Error::Internal(format!("loading webhook subscriptions: {e}")))?;
        for seed in config.webhook.subscriptions.iter().cloned() {
            // Reuse a previously-persisted subscription's id when its URL
            // matches a configured seed, so re-running with the same config
            // file upserts rather than accumulating duplicate rows across
            // restarts (mirrors `pool::seed::reconcile`'s diff-by-identity).
            let id = webhooks
                .list_subscriptions()
                .into_iter()
                .find(|s| s.url == seed.url)
                .map(|s| s.id)
                .unwrap_or_else(Uuid::new_v4);
            webhooks
                .upsert_subscription(seed.into_subscription(id))
                .await
                .map_err(|e| Error::Internal(format!("seeding webhook subscription: {e}")))?;
        }
        webhooks.clone().run(events.clone());

        let audit_handle = AuditAgent::spawn(&mut runtime, config.audit.clone(), Some(storage.clone()), config.service.name.clone()).await?;
        let audit = AuditLogger::new(audit_handle, config.service.name.clone(), config.audit.clone());

        let gateway = Gateway {
            registry,
            pool,
            rate_limiter,
            circuit,
            cache,
            events,
            router,
            storage,
            workflows,
            webhooks,
            audit,
            agent_runtime: Arc::new(tokio::sync::Mutex::new(Some(runtime))),
        };

        gateway.reconcile_seeded_servers(&config).await;

        Ok(gateway)
    }

    /// Build the durable storage backend and the response cache's durable
    /// mirror. The two are independent choices: storage falls back to an
    /// in-process store when no database is configured (§1 non-goal), and
    /// the cache's durable tier falls back to an in-memory stand-in when no
    /// Redis is configured, regardless of how storage resolved.
    async fn build_storage(
        config: &GatewayConfig,
        _runtime: &mut AgentRuntime,
    ) -> Result<(Arc<dyn GatewayStorage>, Arc<dyn crate::response_cache::DurableCache>)> {
        let storage: Arc<dyn GatewayStorage> = 'storage: {
            #[cfg(feature = "database")]
            if let Some(db_config) = &config.database {
                let shared: SharedDbPool = Arc::new(tokio::sync::RwLock::new(None));
                DatabasePoolAgent::spawn(_runtime, db_config.clone(), Some(shared.clone())).await?;

                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(db_config.connection_timeout_secs.max(1));
                loop {
                    if let Some(pool) = shared.read().await.clone() {
                        break 'storage Arc::new(crate::storage::PgGatewayStorage::new(pool)) as Arc<dyn GatewayStorage>;
                    }
                    if std::time::Instant::now() >= deadline {
                        if db_config.optional {
                            tracing::warn!("database did not connect within the configured timeout; falling back to in-memory storage");
                            break;
                        }
                        return Err(Error::External("database connection timed out".into()));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }

            Arc::new(InMemoryGatewayStorage::new()) as Arc<dyn GatewayStorage>
        };

        #[cfg(feature = "cache")]
        let durable_cache: Arc<dyn crate::response_cache::DurableCache> = 'cache: {
            if let Some(redis_config) = &config.redis {
                let shared: SharedRedisPool = Arc::new(tokio::sync::RwLock::new(None));
                RedisPoolAgent::spawn(_runtime, redis_config.clone(), Some(shared.clone())).await?;

                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(redis_config.connection_timeout_secs.max(1));
                loop {
                    if let Some(pool) = shared.read().await.clone() {
                        break 'cache Arc::new(crate::cache::RedisDurableCache::new(pool)) as Arc<dyn crate::response_cache::DurableCache>;
                    }
                    if std::time::Instant::now() >= deadline {
                        if redis_config.optional {
                            tracing::warn!("redis did not connect within the configured timeout; response cache falls back to in-memory durable tier");
                            break;
                        }
                        return Err(Error::External("redis connection timed out".into()));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }

            Arc::new(InMemoryDurableCache::default()) as Arc<dyn crate::response_cache::DurableCache>
        };
        #[cfg(not(feature = "cache"))]
        let durable_cache: Arc<dyn crate::response_cache::DurableCache> = Arc::new(InMemoryDurableCache::default());

        Ok((storage, durable_cache))
    }
}

impl Gateway {
    /// Connect (or reconcile) `config.servers`, then pull each newly
    /// connected server's tool/prompt/resource catalog into the registry.
    /// This is the "one layer up" step `pool::seed::reconcile`'s doc
    /// comment defers to this module for.
    async fn reconcile_seeded_servers(&self, config: &GatewayConfig) {
        let ReconcileOutcome { connected, removed } = seed::reconcile(&self.pool, SEEDED_CATEGORY, config.servers.clone()).await;

        for server_id in removed {
            self.registry.unregister_server(server_id);
        }

        for server_config in connected {
            self.register_capabilities(server_config.id, &server_config.name).await;
        }
    }

    /// Pull a connected server's full catalog and publish it into the
    /// registry as qualified entries (§4.1 "on connect, discover and
    /// register capabilities").
    pub async fn register_capabilities(&self, server_id: Uuid, server_name: &str) {
        let Some(client) = self.pool.get_client(server_id).await else {
            tracing::warn!(%server_id, "cannot register capabilities: no active client");
            return;
        };

        let mut entries = Vec::new();
        match client.list_tools().await {
            Ok(descriptors) => entries.extend(to_entries(descriptors, server_id, server_name, CapabilityKind::Tool)),
            Err(e) => tracing::warn!(%server_id, "failed to list tools: {e}"),
        }
        match client.list_prompts().await {
            Ok(descriptors) => entries.extend(to_entries(descriptors, server_id, server_name, CapabilityKind::Prompt)),
            Err(e) => tracing::warn!(%server_id, "failed to list prompts: {e}"),
        }
        match client.list_resources().await {
            Ok(descriptors) => entries.extend(to_entries(descriptors, server_id, server_name, CapabilityKind::Resource)),
            Err(e) => tracing::warn!(%server_id, "failed to list resources: {e}"),
        }

        let count = entries.len();
        self.registry.register_server(server_id, entries);
        tracing::info!(%server_id, server_name, count, "registered backend capabilities");
    }
}

fn to_entries(descriptors: Vec<CapabilityDescriptor>, server_id: Uuid, server_name: &str, kind: CapabilityKind) -> Vec<CapabilityEntry> {
    descriptors
        .into_iter()
        .map(|d| CapabilityEntry {
            qualified_name: CapabilityEntry::qualify(server_name, &d.name),
            local_name: d.name,
            server_name: server_name.to_string(),
            server_id,
            kind,
            description: d.description,
            input_schema: d.input_schema,
            category: None,
            tags: Vec::new(),
            registered_at: chrono::Utc::now(),
        })
        .collect()
}

// ============================================================================
// HTTP surface (§6): thin REST pass-through over the router/registry/
// workflow engine, plus an SSE stream over the event fabric.
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub kind: Option<String>,
    pub query: Option<String>,
    pub category: Option<String>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_capabilities(State(state): State<AppState>, Query(params): Query<SearchParams>) -> Result<impl IntoResponse> {
    let kind = match params.kind.as_deref() {
        Some("tool") => Some(CapabilityKind::Tool),
        Some("prompt") => Some(CapabilityKind::Prompt),
        Some("resource") => Some(CapabilityKind::Resource),
        Some(other) => return Err(Error::BadRequest(format!("unknown capability kind '{other}'"))),
        None => None,
    };
    let opts = crate::registry::SearchOptions {
        kind,
        query: params.query,
        category: params.category,
        tags: Vec::new(),
        server_id: None,
        offset: params.offset,
        limit: params.limit,
    };
    let page = state.gateway().registry.search(&opts);
    Ok(Json(serde_json::json!({ "items": page.items, "total": page.total })))
}

#[derive(Debug, Deserialize)]
pub struct InvokeBody {
    pub params: serde_json::Value,
    #[serde(default)]
    pub caller_key_id: Option<Uuid>,
    #[serde(default)]
    pub cacheable: bool,
}

async fn invoke_tool(State(state): State<AppState>, Path(name): Path<String>, Json(body): Json<InvokeBody>) -> Result<impl IntoResponse> {
    let mut request = InvokeRequest::new(name, body.params);
    if let Some(caller) = body.caller_key_id {
        request = request.caller(caller);
    }
    if body.cacheable {
        request = request.cacheable(std::time::Duration::from_secs(60));
    }
    let response = state.gateway().router.invoke(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct BatchInvokeItem {
    pub name: String,
    pub params: serde_json::Value,
    #[serde(default)]
    pub caller_key_id: Option<Uuid>,
    #[serde(default)]
    pub cacheable: bool,
}

async fn invoke_tools_batch(State(state): State<AppState>, Json(items): Json<Vec<BatchInvokeItem>>) -> Result<impl IntoResponse> {
    let requests = items
        .into_iter()
        .map(|item| {
            let mut request = InvokeRequest::new(item.name, item.params);
            if let Some(caller) = item.caller_key_id {
                request = request.caller(caller);
            }
            if item.cacheable {
                request = request.cacheable(std::time::Duration::from_secs(60));
            }
            request
        })
        .collect();

    let results = state.gateway().router.invoke_batch(requests).await;
    let body: Vec<serde_json::Value> = results
        .into_iter()
        .map(|result| match result {
            Ok(response) => serde_json::json!({ "ok": response }),
            Err(err) => serde_json::json!({ "error": err.to_string() }),
        })
        .collect();
    Ok(Json(body))
}

async fn validate_workflow(State(state): State<AppState>, Json(definition): Json<WorkflowDefinition>) -> Result<impl IntoResponse> {
    let report = state.gateway().workflows.validate(&definition);
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowBody {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub definition: WorkflowDefinition,
}

async fn create_workflow(State(state): State<AppState>, Json(body): Json<CreateWorkflowBody>) -> Result<impl IntoResponse> {
    let started = std::time::Instant::now();
    let result = state.gateway().workflows.create_workflow(body.name.clone(), body.description, body.definition).await;
    state
        .gateway()
        .audit
        .record(
            "workflow.create",
            None,
            None,
            "workflow",
            result.as_ref().ok().map(|w| w.id.to_string()),
            started.elapsed().as_millis() as u64,
            result.is_ok(),
            result.as_ref().err().map(|e| e.to_string()),
        )
        .await;
    let workflow = result?;
    let location = format!("/workflows/{}", workflow.id);
    Ok(Created::new(workflow).with_location(location))
}

async fn get_workflow(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    match state.gateway().workflows.get_workflow(id).await? {
        Some(workflow) => Ok(Json(workflow)),
        None => Err(Error::NotFound(format!("workflow '{id}' not found"))),
    }
}

async fn list_workflows(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let workflows = state.gateway().workflows.list_workflows().await?;
    Ok(Json(workflows))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteWorkflowBody {
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub caller_key_id: Option<Uuid>,
}

async fn execute_workflow(State(state): State<AppState>, Path(id): Path<Uuid>, Json(body): Json<ExecuteWorkflowBody>) -> Result<impl IntoResponse> {
    let execution = state.gateway().workflows.execute(id, body.input, None, body.caller_key_id).await?;
    Ok(Json(execution))
}

async fn delete_workflow(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    if state.gateway().workflows.delete_workflow(id).await? {
        Ok(axum::http::StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(format!("workflow '{id}' not found")))
    }
}

async fn list_executions(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    let executions = state.gateway().workflows.list_executions(Some(id)).await?;
    Ok(Json(executions))
}

async fn get_execution(State(state): State<AppState>, Path((_id, execution_id)): Path<(Uuid, Uuid)>) -> Result<impl IntoResponse> {
    match state.gateway().workflows.get_execution(execution_id).await? {
        Some((execution, steps)) => Ok(Json(serde_json::json!({ "execution": execution, "steps": steps }))),
        None => Err(Error::NotFound(format!("execution '{execution_id}' not found"))),
    }
}

/// Query parameters accepted by the global `/events` stream: comma-separated
/// event kinds and server ids, both optional (§4.5 "optionally filtering by
/// event kinds and server ids").
#[derive(Debug, Deserialize)]
pub struct EventStreamParams {
    pub kinds: Option<String>,
    pub server_ids: Option<String>,
}

impl EventStreamParams {
    fn into_filter(self) -> Result<crate::events::EventFilter> {
        let kinds = self.kinds.map(|s| s.split(',').map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect::<Vec<_>>());
        let server_ids = self
            .server_ids
            .map(|s| {
                s.split(',')
                    .map(|id| id.trim().parse::<Uuid>().map_err(|_| Error::BadRequest(format!("invalid server id '{id}'"))))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        Ok(crate::events::EventFilter { kinds, server_ids })
    }
}

async fn sse_events(State(state): State<AppState>, Query(params): Query<EventStreamParams>) -> Result<impl IntoResponse> {
    use futures::stream::StreamExt;

    let filter = params.into_filter()?;
    let rx = state.gateway().events.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(move |item| {
        let filter = filter.clone();
        async move {
            match item {
                Ok(envelope) if filter.matches(&envelope) => {
                    let data = serde_json::to_string(&envelope).ok()?;
                    Some(Ok::<_, std::convert::Infallible>(axum::response::sse::Event::default().event(event_name(&envelope.event)).data(data)))
                }
                Ok(_) => None,
                Err(_) => None,
            }
        }
    });

    Ok(axum::response::sse::Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default()))
}

/// Per-execution stream of `/workflows/{id}/executions/{execution_id}/events`
/// (§4.5): only events carrying this execution id, closing the stream after
/// either terminal event (`workflow.completed` or `workflow.failed`).
async fn workflow_execution_events(State(state): State<AppState>, Path((_id, execution_id)): Path<(Uuid, Uuid)>) -> impl IntoResponse {
    use futures::stream::StreamExt;

    let rx = state.gateway().events.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter_map(move |item| async move {
            match item {
                Ok(envelope) if envelope.event.execution_id() == Some(execution_id) => Some(envelope),
                _ => None,
            }
        })
        // Yield the terminal event itself, then end the stream on the next poll.
        .scan(false, |done, envelope| {
            let already_done = *done;
            if envelope.event.is_terminal_for_execution() {
                *done = true;
            }
            async move { if already_done { None } else { Some(envelope) } }
        })
        .map(|envelope| {
            let data = serde_json::to_string(&envelope).unwrap_or_default();
            Ok::<_, std::convert::Infallible>(axum::response::sse::Event::default().event(event_name(&envelope.event)).data(data))
        });

    axum::response::sse::Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::default())
}

fn event_name(event: &GatewayEvent) -> &'static str {
    event.kind()
}

// ----------------------------------------------------------------------
// Server catalog admin surface (§6): connect/disconnect/inspect backend
// servers at runtime, distinct from `config.servers` seeding.
// ----------------------------------------------------------------------

async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway().pool.all_configs())
}

async fn connect_server(State(state): State<AppState>, Json(config): Json<ServerConfig>) -> Result<impl IntoResponse> {
    let server_id = config.id;
    let server_name = config.name.clone();
    let snapshot = state.gateway().pool.connect(config).await?;
    state.gateway().register_capabilities(server_id, &server_name).await;
    Ok(Created::new(snapshot).with_location(format!("/servers/{server_id}")))
}

async fn disconnect_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    state.gateway().pool.disconnect(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn delete_server(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    state.gateway().pool.disconnect(id).await?;
    state.gateway().registry.unregister_server(id);
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ----------------------------------------------------------------------
// Webhook subscription admin surface (§4.5/§6).
// ----------------------------------------------------------------------

async fn list_webhooks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway().webhooks.list_subscriptions())
}

async fn create_webhook(State(state): State<AppState>, Json(seed): Json<WebhookSubscriptionSeed>) -> Result<impl IntoResponse> {
    let subscription = seed.into_subscription(Uuid::new_v4());
    let id = subscription.id;
    state
        .gateway()
        .webhooks
        .upsert_subscription(subscription.clone())
        .await
        .map_err(|e| Error::Internal(format!("creating webhook subscription: {e}")))?;
    Ok(Created::new(subscription).with_location(format!("/webhooks/{id}")))
}

async fn get_webhook(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    match state.gateway().webhooks.get_subscription(id) {
        Some(subscription) => Ok(Json(subscription)),
        None => Err(Error::NotFound(format!("webhook subscription '{id}' not found"))),
    }
}

async fn update_webhook(State(state): State<AppState>, Path(id): Path<Uuid>, Json(seed): Json<WebhookSubscriptionSeed>) -> Result<impl IntoResponse> {
    if state.gateway().webhooks.get_subscription(id).is_none() {
        return Err(Error::NotFound(format!("webhook subscription '{id}' not found")));
    }
    let subscription = seed.into_subscription(id);
    state
        .gateway()
        .webhooks
        .upsert_subscription(subscription.clone())
        .await
        .map_err(|e| Error::Internal(format!("updating webhook subscription: {e}")))?;
    Ok(Json(subscription))
}

async fn delete_webhook(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    if state.gateway().webhooks.get_subscription(id).is_none() {
        return Err(Error::NotFound(format!("webhook subscription '{id}' not found")));
    }
    state
        .gateway()
        .webhooks
        .remove_subscription(id)
        .await
        .map_err(|e| Error::Internal(format!("deleting webhook subscription: {e}")))?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn list_webhook_deliveries(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<impl IntoResponse> {
    if state.gateway().webhooks.get_subscription(id).is_none() {
        return Err(Error::NotFound(format!("webhook subscription '{id}' not found")));
    }
    let deliveries = state
        .gateway()
        .webhooks
        .list_deliveries(id)
        .await
        .map_err(|e| Error::Internal(format!("listing webhook deliveries: {e}")))?;
    Ok(Json(deliveries))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let connected = state.gateway().pool.configs_in_category(SEEDED_CATEGORY).len();
    Json(serde_json::json!({ "status": "ready", "seeded_servers": connected }))
}

/// Build the gateway's axum router (§6).
pub fn build_router() -> AxumRouter<AppState> {
    AxumRouter::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/capabilities", get(list_capabilities))
        .route("/tools/{name}/invoke", post(invoke_tool))
        .route("/tools/invoke/batch", post(invoke_tools_batch))
        .route("/workflows", get(list_workflows).post(create_workflow))
        .route("/workflows/validate", post(validate_workflow))
        .route("/workflows/{id}", get(get_workflow).delete(delete_workflow))
        .route("/workflows/{id}/execute", post(execute_workflow))
        .route("/workflows/{id}/executions", get(list_executions))
        .route("/workflows/{id}/executions/{execution_id}", get(get_execution))
        .route("/servers", get(list_servers).post(connect_server))
        .route("/servers/{id}/disconnect", post(disconnect_server))
        .route("/servers/{id}", axum::routing::delete(delete_server))
        .route("/webhooks", get(list_webhooks).post(create_webhook))
        .route("/webhooks/{id}", get(get_webhook).put(update_webhook).delete(delete_webhook))
        .route("/webhooks/{id}/deliveries", get(list_webhook_deliveries))
        .route("/events", get(sse_events))
        .route("/workflows/{id}/executions/{execution_id}/events", get(workflow_execution_events))
}

//! Durable storage for gateway entities (§6).
//!
//! The logical tables of §6 (`workflows`, `workflow_executions`,
//! `workflow_execution_steps`, `webhook_deliveries`, `budget_usage`,
//! `key_exposure_detections`, …) are fronted by one `GatewayStorage` trait
//! object, split the same way [`crate::response_cache::DurableCache`] is,
//! between an in-memory stand-in (used by default and by tests) and
//! a `sqlx`-backed Postgres implementation behind the `database` feature.
//! `GatewayStorage` is intentionally one trait rather than one-per-entity:
//! the workflow engine's two-transaction persistence model (§4.3) needs
//! every execution-step write to land in the same backing store as the
//! workflow definition it belongs to.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::webhooks::{WebhookDelivery, WebhookSubscription};
use crate::workflow::{BudgetScope, ExecutionStep, Workflow, WorkflowDefinition, WorkflowExecution};

/// Durable storage surface the gateway's stateful components depend on.
/// `Send + Sync` so it can be shared as `Arc<dyn GatewayStorage>` across
/// the pool, router, engine, and webhook dispatcher.
#[async_trait::async_trait]
pub trait GatewayStorage: Send + Sync {
    // -- workflows --------------------------------------------------------
    async fn put_workflow(&self, workflow: Workflow) -> Result<()>;
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>>;
    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>>;
    async fn list_workflows(&self) -> Result<Vec<Workflow>>;
    async fn delete_workflow(&self, id: Uuid) -> Result<bool>;

    // -- executions (§4.3 two-transaction persistence model) --------------
    /// Insert the execution row and one `pending` step row per step, as a
    /// single transaction, before the first step runs.
    async fn create_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()>;
    /// Overwrite every step's final state (and the execution's terminal
    /// status) as a single transaction, after the last step runs.
    async fn finalize_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()>;
    async fn get_execution(&self, id: Uuid) -> Result<Option<(WorkflowExecution, Vec<ExecutionStep>)>>;
    async fn list_executions(&self, workflow_id: Option<Uuid>) -> Result<Vec<WorkflowExecution>>;

    // -- budgets ------------------------------------------------------------
    async fn get_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>) -> Result<u64>;
    async fn add_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>, period_end: DateTime<Utc>, amount: u64) -> Result<()>;

    // -- secret scanner findings (§3 `KeyExposureDetection`) ---------------
    async fn record_secret_detection(&self, workflow_id: Option<Uuid>, provider: String, masked_prefix: String, json_path: String) -> Result<()>;

    // -- webhook subscriptions (admin-managed, §3) ---------------------------
    async fn put_webhook_subscription(&self, subscription: WebhookSubscription) -> Result<()>;
    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>>;
    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>>;
    async fn delete_webhook_subscription(&self, id: Uuid) -> Result<bool>;

    // -- webhook deliveries -------------------------------------------------
    async fn put_webhook_delivery(&self, delivery: WebhookDelivery) -> Result<()>;
    async fn list_webhook_deliveries(&self, subscription_id: Uuid) -> Result<Vec<WebhookDelivery>>;
    async fn prune_webhook_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-memory `GatewayStorage`, the default backing store for a single
/// process (§1 non-goal: "the engine assumes a single process with local
/// durable storage") and the one used by unit/integration tests.
#[derive(Default)]
pub struct InMemoryGatewayStorage {
    workflows: Mutex<HashMap<Uuid, Workflow>>,
    executions: Mutex<HashMap<Uuid, (WorkflowExecution, Vec<ExecutionStep>)>>,
    budget_usage: Mutex<HashMap<(String, DateTime<Utc>), u64>>,
    secret_detections: Mutex<Vec<(Option<Uuid>, String, String, String)>>,
    webhook_subscriptions: Mutex<HashMap<Uuid, WebhookSubscription>>,
    webhook_deliveries: Mutex<HashMap<Uuid, WebhookDelivery>>,
}

impl InMemoryGatewayStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn budget_key(scope: &BudgetScope) -> String {
        match scope {
            BudgetScope::Global => "global".to_string(),
            BudgetScope::Tenant(id) => format!("tenant:{id}"),
            BudgetScope::Workflow(id) => format!("workflow:{id}"),
            BudgetScope::Key(id) => format!("key:{id}"),
        }
    }
}

#[async_trait::async_trait]
impl GatewayStorage for InMemoryGatewayStorage {
    async fn put_workflow(&self, workflow: Workflow) -> Result<()> {
        self.workflows.lock().await.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        Ok(self.workflows.lock().await.get(&id).cloned())
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.lock().await.values().find(|w| w.name == name).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self.workflows.lock().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        Ok(self.workflows.lock().await.remove(&id).is_some())
    }

    async fn create_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()> {
        self.executions.lock().await.insert(execution.id, (execution, steps));
        Ok(())
    }

    async fn finalize_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()> {
        self.executions.lock().await.insert(execution.id, (execution, steps));
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<(WorkflowExecution, Vec<ExecutionStep>)>> {
        Ok(self.executions.lock().await.get(&id).cloned())
    }

    async fn list_executions(&self, workflow_id: Option<Uuid>) -> Result<Vec<WorkflowExecution>> {
        let executions = self.executions.lock().await;
        let mut items: Vec<WorkflowExecution> = executions
            .values()
            .map(|(e, _)| e.clone())
            .filter(|e| workflow_id.is_none_or(|wid| e.workflow_id == wid))
            .collect();
        items.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(items)
    }

    async fn get_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>) -> Result<u64> {
        let key = (Self::budget_key(&scope), period_start);
        Ok(self.budget_usage.lock().await.get(&key).copied().unwrap_or(0))
    }

    async fn add_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>, _period_end: DateTime<Utc>, amount: u64) -> Result<()> {
        let key = (Self::budget_key(&scope), period_start);
        *self.budget_usage.lock().await.entry(key).or_insert(0) += amount;
        Ok(())
    }

    async fn record_secret_detection(&self, workflow_id: Option<Uuid>, provider: String, masked_prefix: String, json_path: String) -> Result<()> {
        self.secret_detections.lock().await.push((workflow_id, provider, masked_prefix, json_path));
        Ok(())
    }

    async fn put_webhook_subscription(&self, subscription: WebhookSubscription) -> Result<()> {
        self.webhook_subscriptions.lock().await.insert(subscription.id, subscription);
        Ok(())
    }

    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        Ok(self.webhook_subscriptions.lock().await.get(&id).cloned())
    }

    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        Ok(self.webhook_subscriptions.lock().await.values().cloned().collect())
    }

    async fn delete_webhook_subscription(&self, id: Uuid) -> Result<bool> {
        Ok(self.webhook_subscriptions.lock().await.remove(&id).is_some())
    }

    async fn put_webhook_delivery(&self, delivery: WebhookDelivery) -> Result<()> {
        self.webhook_deliveries.lock().await.insert(delivery.id, delivery);
        Ok(())
    }

    async fn list_webhook_deliveries(&self, subscription_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let mut deliveries: Vec<WebhookDelivery> = self
            .webhook_deliveries
            .lock()
            .await
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(deliveries)
    }

    async fn prune_webhook_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut deliveries = self.webhook_deliveries.lock().await;
        let before = deliveries.len();
        deliveries.retain(|_, d| d.created_at >= cutoff);
        Ok((before - deliveries.len()) as u64)
    }
}

/// Postgres-backed `GatewayStorage`, the production store named in §6.
/// Table/column shapes follow the logical tables listed there; exact
/// column names aren't contractual, only semantics are.
#[cfg(feature = "database")]
pub struct PgGatewayStorage {
    pool: sqlx::PgPool,
}

#[cfg(feature = "database")]
impl PgGatewayStorage {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Create the logical tables of §6 if they don't already exist. Should be
    /// called once during application startup, same as
    /// [`crate::audit::storage::pg::PgAuditStorage::initialize`].
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                definition JSONB NOT NULL,
                enabled BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create workflows table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id UUID PRIMARY KEY,
                workflow_id UUID NOT NULL REFERENCES workflows(id),
                status TEXT NOT NULL,
                input JSONB NOT NULL,
                output JSONB,
                error TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                triggered_by TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create workflow_executions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_execution_steps (
                id UUID PRIMARY KEY,
                execution_id UUID NOT NULL REFERENCES workflow_executions(id),
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                input JSONB,
                output JSONB,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                tokens_used BIGINT,
                cost_credits DOUBLE PRECISION,
                model_name TEXT,
                duration_ms BIGINT,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create workflow_execution_steps table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_execution_steps_execution ON workflow_execution_steps (execution_id, position)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create execution steps index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS budget_usage (
                scope TEXT NOT NULL,
                period_start TIMESTAMPTZ NOT NULL,
                period_end TIMESTAMPTZ NOT NULL,
                used BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (scope, period_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create budget_usage table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_exposure_detections (
                id UUID PRIMARY KEY,
                workflow_id UUID,
                provider TEXT NOT NULL,
                masked_prefix TEXT NOT NULL,
                json_path TEXT NOT NULL,
                resolved BOOLEAN NOT NULL DEFAULT false,
                detected_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create key_exposure_detections table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id UUID PRIMARY KEY,
                url TEXT NOT NULL,
                secret TEXT,
                filter_kinds JSONB,
                filter_server_ids JSONB,
                retry_count INTEGER NOT NULL,
                retry_delay_ms BIGINT NOT NULL,
                enabled BOOLEAN NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create webhook_subscriptions table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id UUID PRIMARY KEY,
                subscription_id UUID NOT NULL,
                event_id UUID NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_response_status INTEGER,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create webhook_deliveries table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_created ON webhook_deliveries (created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create webhook_deliveries index: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_subscription ON webhook_deliveries (subscription_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("create webhook_deliveries subscription index: {e}")))?;

        Ok(())
    }
}

#[cfg(feature = "database")]
#[async_trait::async_trait]
impl GatewayStorage for PgGatewayStorage {
    async fn put_workflow(&self, workflow: Workflow) -> Result<()> {
        let definition = serde_json::to_value(&workflow.definition).map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflows (id, name, description, definition, enabled, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                definition = EXCLUDED.definition,
                enabled = EXCLUDED.enabled,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(definition)
        .bind(workflow.enabled)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("put_workflow: {e}")))?;
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("get_workflow: {e}")))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("find_workflow_by_name: {e}")))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let rows = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM workflows ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("list_workflows: {e}")))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("delete_workflow: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Internal(e.to_string()))?;
        insert_execution(&mut tx, &execution).await?;
        for step in &steps {
            insert_step(&mut tx, &step).await?;
        }
        tx.commit().await.map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn finalize_execution(&self, execution: WorkflowExecution, steps: Vec<ExecutionStep>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Internal(e.to_string()))?;
        update_execution(&mut tx, &execution).await?;
        for step in &steps {
            update_step(&mut tx, &step).await?;
        }
        tx.commit().await.map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<(WorkflowExecution, Vec<ExecutionStep>)>> {
        let execution = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("get_execution: {e}")))?;
        let Some(execution) = execution else { return Ok(None) };

        let steps = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM workflow_execution_steps WHERE execution_id = $1 ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("get_execution steps: {e}")))?;

        Ok(Some((execution.try_into()?, steps.into_iter().map(TryInto::try_into).collect::<Result<_>>()?)))
    }

    async fn list_executions(&self, workflow_id: Option<Uuid>) -> Result<Vec<WorkflowExecution>> {
        let rows = match workflow_id {
            Some(wid) => {
                sqlx::query_as::<_, ExecutionRow>("SELECT * FROM workflow_executions WHERE workflow_id = $1 ORDER BY started_at")
                    .bind(wid)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query_as::<_, ExecutionRow>("SELECT * FROM workflow_executions ORDER BY started_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| Error::Internal(format!("list_executions: {e}")))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>) -> Result<u64> {
        let scope_key = scope.storage_key();
        let used: Option<i64> = sqlx::query_scalar(
            "SELECT used FROM budget_usage WHERE scope = $1 AND period_start = $2",
        )
        .bind(scope_key)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("get_budget_usage: {e}")))?;
        Ok(used.unwrap_or(0) as u64)
    }

    async fn add_budget_usage(&self, scope: BudgetScope, period_start: DateTime<Utc>, period_end: DateTime<Utc>, amount: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO budget_usage (scope, period_start, period_end, used)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (scope, period_start) DO UPDATE SET used = budget_usage.used + EXCLUDED.used",
        )
        .bind(scope.storage_key())
        .bind(period_start)
        .bind(period_end)
        .bind(amount as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("add_budget_usage: {e}")))?;
        Ok(())
    }

    async fn record_secret_detection(&self, workflow_id: Option<Uuid>, provider: String, masked_prefix: String, json_path: String) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_exposure_detections (id, workflow_id, provider, masked_prefix, json_path, resolved, detected_at)
             VALUES ($1, $2, $3, $4, $5, false, $6)",
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(provider)
        .bind(masked_prefix)
        .bind(json_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("record_secret_detection: {e}")))?;
        Ok(())
    }

    async fn put_webhook_subscription(&self, subscription: WebhookSubscription) -> Result<()> {
        let filter_kinds = serde_json::to_value(&subscription.filter.kinds).map_err(|e| Error::Internal(e.to_string()))?;
        let filter_server_ids = serde_json::to_value(&subscription.filter.server_ids).map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO webhook_subscriptions (id, url, secret, filter_kinds, filter_server_ids, retry_count, retry_delay_ms, enabled)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                url = EXCLUDED.url,
                secret = EXCLUDED.secret,
                filter_kinds = EXCLUDED.filter_kinds,
                filter_server_ids = EXCLUDED.filter_server_ids,
                retry_count = EXCLUDED.retry_count,
                retry_delay_ms = EXCLUDED.retry_delay_ms,
                enabled = EXCLUDED.enabled",
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(&subscription.secret)
        .bind(filter_kinds)
        .bind(filter_server_ids)
        .bind(subscription.retry_count as i32)
        .bind(subscription.retry_delay_ms as i64)
        .bind(subscription.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("put_webhook_subscription: {e}")))?;
        Ok(())
    }

    async fn get_webhook_subscription(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        let row = sqlx::query_as::<_, WebhookSubscriptionRow>("SELECT * FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("get_webhook_subscription: {e}")))?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_webhook_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, WebhookSubscriptionRow>("SELECT * FROM webhook_subscriptions")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("list_webhook_subscriptions: {e}")))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn delete_webhook_subscription(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("delete_webhook_subscription: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn put_webhook_delivery(&self, delivery: WebhookDelivery) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, subscription_id, event_id, status, attempts, last_response_status, last_error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_response_status = EXCLUDED.last_response_status,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(delivery.id)
        .bind(delivery.subscription_id)
        .bind(delivery.event_id)
        .bind(serde_json::to_string(&delivery.status).unwrap_or_default())
        .bind(delivery.attempts as i32)
        .bind(delivery.last_response_status.map(|s| s as i32))
        .bind(delivery.last_error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("put_webhook_delivery: {e}")))?;
        Ok(())
    }

    async fn list_webhook_deliveries(&self, subscription_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, WebhookDeliveryRow>(
            "SELECT * FROM webhook_deliveries WHERE subscription_id = $1 ORDER BY created_at",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Internal(format!("list_webhook_deliveries: {e}")))?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn prune_webhook_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_deliveries WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Internal(format!("prune_webhook_deliveries_before: {e}")))?;
        Ok(result.rows_affected())
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct WebhookSubscriptionRow {
    id: Uuid,
    url: String,
    secret: Option<String>,
    filter_kinds: Option<serde_json::Value>,
    filter_server_ids: Option<serde_json::Value>,
    retry_count: i32,
    retry_delay_ms: i64,
    enabled: bool,
}

#[cfg(feature = "database")]
impl TryFrom<WebhookSubscriptionRow> for WebhookSubscription {
    type Error = Error;

    fn try_from(row: WebhookSubscriptionRow) -> Result<Self> {
        let kinds = row
            .filter_kinds
            .map(|v| serde_json::from_value(v).map_err(|e| Error::Internal(e.to_string())))
            .transpose()?
            .flatten();
        let server_ids = row
            .filter_server_ids
            .map(|v| serde_json::from_value(v).map_err(|e| Error::Internal(e.to_string())))
            .transpose()?
            .flatten();
        Ok(Self {
            id: row.id,
            url: row.url,
            secret: row.secret,
            filter: crate::events::EventFilter { kinds, server_ids },
            retry_count: row.retry_count as u32,
            retry_delay_ms: row.retry_delay_ms as u64,
            enabled: row.enabled,
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct WebhookDeliveryRow {
    id: Uuid,
    subscription_id: Uuid,
    event_id: Uuid,
    status: String,
    attempts: i32,
    last_response_status: Option<i32>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[cfg(feature = "database")]
impl TryFrom<WebhookDeliveryRow> for WebhookDelivery {
    type Error = Error;

    fn try_from(row: WebhookDeliveryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            subscription_id: row.subscription_id,
            event_id: row.event_id,
            status: serde_json::from_value(serde_json::Value::String(row.status)).map_err(|e| Error::Internal(e.to_string()))?,
            attempts: row.attempts as u32,
            last_response_status: row.last_response_status.map(|s| s as u16),
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    description: String,
    definition: serde_json::Value,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[cfg(feature = "database")]
impl TryFrom<WorkflowRow> for Workflow {
    type Error = Error;

    fn try_from(row: WorkflowRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            description: row.description,
            definition: serde_json::from_value(row.definition).map_err(|e| Error::Internal(e.to_string()))?,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    input: serde_json::Value,
    output: Option<serde_json::Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    triggered_by: Option<String>,
}

#[cfg(feature = "database")]
impl TryFrom<ExecutionRow> for WorkflowExecution {
    type Error = Error;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            workflow_id: row.workflow_id,
            status: serde_json::from_value(serde_json::Value::String(row.status)).map_err(|e| Error::Internal(e.to_string()))?,
            input: row.input,
            output: row.output,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            triggered_by: row.triggered_by,
        })
    }
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    execution_id: Uuid,
    position: i32,
    name: String,
    status: String,
    input: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    error: Option<String>,
    retry_count: i32,
    tokens_used: Option<i64>,
    cost_credits: Option<f64>,
    model_name: Option<String>,
    duration_ms: Option<i64>,
    completed_at: Option<DateTime<Utc>>,
}

#[cfg(feature = "database")]
impl TryFrom<StepRow> for ExecutionStep {
    type Error = Error;

    fn try_from(row: StepRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            execution_id: row.execution_id,
            position: row.position as usize,
            name: row.name,
            status: serde_json::from_value(serde_json::Value::String(row.status)).map_err(|e| Error::Internal(e.to_string()))?,
            input: row.input,
            output: row.output,
            error: row.error,
            retry_count: row.retry_count as u32,
            tokens_used: row.tokens_used.map(|t| t as u64),
            cost_credits: row.cost_credits,
            model_name: row.model_name,
            duration_ms: row.duration_ms.map(|d| d as u64),
            completed_at: row.completed_at,
        })
    }
}

#[cfg(feature = "database")]
async fn insert_execution(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, execution: &WorkflowExecution) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_executions (id, workflow_id, status, input, output, error, started_at, completed_at, triggered_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(execution.id)
    .bind(execution.workflow_id)
    .bind(serde_json::to_string(&execution.status).unwrap_or_default())
    .bind(&execution.input)
    .bind(&execution.output)
    .bind(&execution.error)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(&execution.triggered_by)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Internal(format!("insert_execution: {e}")))?;
    Ok(())
}

#[cfg(feature = "database")]
async fn update_execution(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, execution: &WorkflowExecution) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_executions SET status = $2, output = $3, error = $4, completed_at = $5 WHERE id = $1",
    )
    .bind(execution.id)
    .bind(serde_json::to_string(&execution.status).unwrap_or_default())
    .bind(&execution.output)
    .bind(&execution.error)
    .bind(execution.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Internal(format!("update_execution: {e}")))?;
    Ok(())
}

#[cfg(feature = "database")]
async fn insert_step(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, step: &ExecutionStep) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_execution_steps (id, execution_id, position, name, status, input)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(step.id)
    .bind(step.execution_id)
    .bind(step.position as i32)
    .bind(&step.name)
    .bind(serde_json::to_string(&step.status).unwrap_or_default())
    .bind(&step.input)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Internal(format!("insert_step: {e}")))?;
    Ok(())
}

#[cfg(feature = "database")]
async fn update_step(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, step: &ExecutionStep) -> Result<()> {
    sqlx::query(
        "UPDATE workflow_execution_steps SET status = $2, output = $3, error = $4, retry_count = $5,
            tokens_used = $6, cost_credits = $7, model_name = $8, duration_ms = $9, completed_at = $10
         WHERE id = $1",
    )
    .bind(step.id)
    .bind(serde_json::to_string(&step.status).unwrap_or_default())
    .bind(&step.output)
    .bind(&step.error)
    .bind(step.retry_count as i32)
    .bind(step.tokens_used.map(|t| t as i64))
    .bind(step.cost_credits)
    .bind(&step.model_name)
    .bind(step.duration_ms.map(|d| d as i64))
    .bind(step.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Internal(format!("update_step: {e}")))?;
    Ok(())
}

/// Construct the default (in-memory) storage, wrapped for sharing.
pub fn default_storage() -> Arc<dyn GatewayStorage> {
    Arc::new(InMemoryGatewayStorage::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ExecutionStatus, StepStatus};

    fn workflow(name: &str) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: Uuid::now_v7(),
            name: name.to_string(),
            description: String::new(),
            definition: WorkflowDefinition { steps: vec![], error_strategy: Default::default(), timeout_ms: None },
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn put_then_find_by_name() {
        let storage = InMemoryGatewayStorage::new();
        let wf = workflow("daily-report");
        storage.put_workflow(wf.clone()).await.unwrap();

        let found = storage.find_workflow_by_name("daily-report").await.unwrap().unwrap();
        assert_eq!(found.id, wf.id);
        assert!(storage.find_workflow_by_name("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_workflow_removes_it() {
        let storage = InMemoryGatewayStorage::new();
        let wf = workflow("one-off");
        storage.put_workflow(wf.clone()).await.unwrap();
        assert!(storage.delete_workflow(wf.id).await.unwrap());
        assert!(storage.get_workflow(wf.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn execution_history_is_reconstructible_from_storage() {
        let storage = InMemoryGatewayStorage::new();
        let workflow_id = Uuid::now_v7();
        let execution_id = Uuid::now_v7();
        let now = Utc::now();

        let execution = WorkflowExecution {
            id: execution_id,
            workflow_id,
            status: ExecutionStatus::Running,
            input: serde_json::json!({}),
            output: None,
            error: None,
            started_at: now,
            completed_at: None,
            triggered_by: None,
        };
        let pending_steps = vec![ExecutionStep {
            id: Uuid::now_v7(),
            execution_id,
            position: 0,
            name: "step-one".into(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            tokens_used: None,
            cost_credits: None,
            model_name: None,
            duration_ms: None,
            completed_at: None,
        }];
        storage.create_execution(execution.clone(), pending_steps.clone()).await.unwrap();

        let mut finished = execution.clone();
        finished.status = ExecutionStatus::Completed;
        finished.completed_at = Some(now);
        let mut finished_steps = pending_steps;
        finished_steps[0].status = StepStatus::Completed;
        finished_steps[0].completed_at = Some(now);
        storage.finalize_execution(finished.clone(), finished_steps.clone()).await.unwrap();

        let (loaded_execution, loaded_steps) = storage.get_execution(execution_id).await.unwrap().unwrap();
        assert_eq!(loaded_execution.status, ExecutionStatus::Completed);
        assert_eq!(loaded_steps.len(), 1);
        assert_eq!(loaded_steps[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn budget_usage_accumulates() {
        let storage = InMemoryGatewayStorage::new();
        let scope = BudgetScope::Global;
        let start = Utc::now();
        let end = start + chrono::Duration::days(1);

        storage.add_budget_usage(scope, start, end, 5).await.unwrap();
        storage.add_budget_usage(scope, start, end, 3).await.unwrap();

        assert_eq!(storage.get_budget_usage(scope, start).await.unwrap(), 8);
    }
}

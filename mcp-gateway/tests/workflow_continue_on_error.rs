//! End-to-end scenario 3 (§8): a workflow where the middle step fails with
//! `onError: continue` still runs its remaining steps and completes.

use std::sync::Arc;

use mcp_gateway::circuit::CircuitBreaker;
use mcp_gateway::events::EventBus;
use mcp_gateway::pool::ConnectionPool;
use mcp_gateway::prelude::*;
use mcp_gateway::ratelimit::RateLimiter;
use mcp_gateway::registry::Registry;
use mcp_gateway::response_cache::{InMemoryDurableCache, ResponseCache};
use mcp_gateway::router::Router;
use mcp_gateway::storage::InMemoryGatewayStorage;
use mcp_gateway::workflow::{ExecutionStatus, OnErrorPolicy, RetryPolicy, StepDefinition, StepKind, StepStatus};

fn test_engine() -> WorkflowEngine {
    let registry = Arc::new(Registry::new());
    let rate_limiter = Arc::new(RateLimiter::new());
    let events = Arc::new(EventBus::new(16));
    let pool = Arc::new(ConnectionPool::new(rate_limiter.clone(), events.clone()));
    let router = Arc::new(Router::new(
        registry.clone(),
        pool,
        rate_limiter,
        Arc::new(CircuitBreaker::new()),
        Arc::new(ResponseCache::new(100, Arc::new(InMemoryDurableCache::default()))),
        events.clone(),
    ));
    WorkflowEngine::new(router, registry, Arc::new(InMemoryGatewayStorage::new()), events, vec![])
}

/// A step that always succeeds without needing a registered tool or a live
/// backend connection: an unguarded `condition` with empty branches.
fn noop_step(name: &str) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        kind: StepKind::Condition { expression: "input.never".into(), then: vec![], else_: vec![] },
        retry: RetryPolicy::default(),
        on_error: None,
        condition: None,
    }
}

/// A step that always fails: a `tool` step naming a tool no server
/// publishes, so the router's dispatch rejects it with `NotFound`.
fn failing_step(name: &str, on_error: OnErrorPolicy) -> StepDefinition {
    StepDefinition {
        name: name.to_string(),
        kind: StepKind::Tool { tool_name: "nowhere/nothing".into(), params: serde_json::json!({}), model_name: None, cacheable: false },
        retry: RetryPolicy::default(),
        on_error: Some(on_error),
        condition: None,
    }
}

#[tokio::test]
async fn middle_step_failure_with_continue_runs_remaining_steps() {
    let engine = test_engine();

    let definition = WorkflowDefinition {
        steps: vec![noop_step("first"), failing_step("second", OnErrorPolicy::Continue), noop_step("third")],
        error_strategy: OnErrorPolicy::Stop,
        timeout_ms: None,
    };

    let workflow = engine.create_workflow("continue-on-error".into(), "".into(), definition).await.unwrap();
    let execution = engine.execute(workflow.id, serde_json::json!({}), None, None).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);

    let (_, steps) = engine.get_execution(execution.id).await.unwrap().unwrap();
    let mut steps = steps;
    steps.sort_by_key(|s| s.position);

    let statuses: Vec<StepStatus> = steps.iter().map(|s| s.status).collect();
    assert_eq!(statuses, vec![StepStatus::Completed, StepStatus::Failed, StepStatus::Completed]);

    assert!(steps[0].output.is_some());
    assert!(steps[1].error.is_some());
    assert!(steps[1].output.is_none());
}

#[tokio::test]
async fn middle_step_failure_with_stop_halts_remaining_steps() {
    let engine = test_engine();

    let definition = WorkflowDefinition {
        steps: vec![noop_step("first"), failing_step("second", OnErrorPolicy::Stop), noop_step("third")],
        error_strategy: OnErrorPolicy::Stop,
        timeout_ms: None,
    };

    let workflow = engine.create_workflow("stop-on-error".into(), "".into(), definition).await.unwrap();
    let execution = engine.execute(workflow.id, serde_json::json!({}), None, None).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);

    let (_, steps) = engine.get_execution(execution.id).await.unwrap().unwrap();
    let mut steps = steps;
    steps.sort_by_key(|s| s.position);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Failed);
    // The third step never ran; it keeps its initial `pending` status since
    // nothing it belongs to transitioned it to `cancelled` (no timeout) or
    // `skipped` (no guard).
    assert_eq!(steps[2].status, StepStatus::Pending);
}

//! Per-execution driver: guard conditions, retries, step-kind dispatch,
//! and the two-transaction persistence model (§4.3).
//!
//! `Step` identity is `(workflow id, position)` (§3), so only the
//! top-level steps of a [`super::WorkflowDefinition`] get their own
//! [`super::ExecutionStep`] row; a `parallel`/`condition` step's nested
//! branches run as part of dispatching that one step and contribute to
//! its single output; retry/backoff treats the whole step as one unit
//! rather than retrying its individual sub-calls.

use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::GatewayEvent;
use crate::router::InvokeRequest;

use super::context::ExecutionContext;
use super::{ExecutionStatus, ExecutionStep, OnErrorPolicy, StepDefinition, StepKind, StepStatus, Workflow, WorkflowEngine, WorkflowExecution};

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

struct DispatchOutcome {
    output: Value,
    tokens_used: Option<u64>,
    cost_credits: Option<f64>,
    model_name: Option<String>,
}

/// Run `workflow` to completion against `input`, persisting step state in
/// exactly two transactions (§4.3).
pub async fn run(
    engine: &WorkflowEngine,
    workflow: Workflow,
    input: Value,
    triggered_by: Option<String>,
    caller_key_id: Option<Uuid>,
) -> Result<WorkflowExecution> {
    let execution_id = Uuid::now_v7();
    let started_at = Utc::now();
    let deadline = workflow.definition.timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

    let mut execution = WorkflowExecution {
        id: execution_id,
        workflow_id: workflow.id,
        status: ExecutionStatus::Running,
        input: input.clone(),
        output: None,
        error: None,
        started_at,
        completed_at: None,
        triggered_by,
    };

    let mut step_records: Vec<ExecutionStep> = workflow
        .definition
        .steps
        .iter()
        .enumerate()
        .map(|(position, step)| ExecutionStep {
            id: Uuid::now_v7(),
            execution_id,
            position,
            name: step.name.clone(),
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
        })
        .collect();

    engine.storage.create_execution(execution.clone(), step_records.clone()).await?;

    let mut ctx = ExecutionContext::new(input);
    let mut total_cost: u64 = 0;
    let mut failure: Option<String> = None;
    let mut timed_out = false;

    for (position, step) in workflow.definition.steps.iter().enumerate() {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }
        }

        if !should_run(step, &ctx) {
            step_records[position].status = StepStatus::Skipped;
            step_records[position].completed_at = Some(Utc::now());
            continue;
        }

        engine.events.publish(GatewayEvent::WorkflowStepStarted { execution_id, step_id: step.name.clone() });
        let step_started = Instant::now();

        let outcome = run_step_with_retry(engine, step, &mut ctx, caller_key_id, &mut step_records[position]).await;
        step_records[position].duration_ms = Some(step_started.elapsed().as_millis() as u64);
        step_records[position].completed_at = Some(Utc::now());

        match outcome {
            Ok(dispatched) => {
                ctx.record_output(&step.name, dispatched.output.clone());
                step_records[position].status = StepStatus::Completed;
                step_records[position].output = Some(dispatched.output);
                step_records[position].tokens_used = dispatched.tokens_used;
                step_records[position].cost_credits = dispatched.cost_credits;
                step_records[position].model_name = dispatched.model_name;
                total_cost += dispatched.cost_credits.unwrap_or(0.0).round() as u64;

                engine.events.publish(GatewayEvent::WorkflowStepCompleted { execution_id, step_id: step.name.clone() });
            }
            Err(err) => {
                let message = err.to_string();
                ctx.record_error(&step.name, &message);
                step_records[position].status = StepStatus::Failed;
                step_records[position].error = Some(message.clone());

                engine.events.publish(GatewayEvent::WorkflowStepFailed {
                    execution_id,
                    step_id: step.name.clone(),
                    error: message.clone(),
                });

                match step.on_error.unwrap_or(workflow.definition.error_strategy) {
                    OnErrorPolicy::Continue => continue,
                    OnErrorPolicy::Stop | OnErrorPolicy::Retry => {
                        failure = Some(message);
                        break;
                    }
                }
            }
        }
    }

    if timed_out {
        for record in step_records.iter_mut().filter(|r| matches!(r.status, StepStatus::Pending)) {
            record.status = StepStatus::Cancelled;
            record.completed_at = Some(Utc::now());
        }
        failure = Some("workflow execution exceeded its configured timeout".to_string());
    }

    execution.completed_at = Some(Utc::now());
    match &failure {
        Some(error) => {
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(error.clone());
            engine.events.publish(GatewayEvent::WorkflowFailed { execution_id, error: error.clone() });
        }
        None => {
            execution.status = ExecutionStatus::Completed;
            execution.output = Some(ctx.as_value());
            engine.events.publish(GatewayEvent::WorkflowCompleted { execution_id });
        }
    }

    engine.storage.finalize_execution(execution.clone(), step_records).await?;

    if total_cost > 0 {
        let scopes = [super::BudgetScope::Global, super::BudgetScope::Workflow(workflow.id)];
        engine.budget.accrue(&scopes, total_cost, Utc::now()).await?;
    }

    Ok(execution)
}

/// Whether a step's guard `condition` (if any) is satisfied; steps with
/// no guard always run (§4.3 per-step execution, point 1).
fn should_run(step: &StepDefinition, ctx: &ExecutionContext) -> bool {
    match &step.condition {
        Some(expr) => ctx.evaluate_condition(expr),
        None => true,
    }
}

/// Apply the step's retry policy around a single dispatch: up to
/// `max_attempts` attempts with geometric backoff, honoring a
/// rate-limit/circuit retry-after hint when one is available (§4.3 point 4).
async fn run_step_with_retry(
    engine: &WorkflowEngine,
    step: &StepDefinition,
    ctx: &mut ExecutionContext,
    caller_key_id: Option<Uuid>,
    record: &mut ExecutionStep,
) -> Result<DispatchOutcome> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        record.retry_count = attempt - 1;

        match dispatch_step_once(engine, step, ctx, caller_key_id).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt >= step.retry.max_attempts => return Err(err),
            Err(err) => {
                let backoff_ms = match &err {
                    Error::RateLimited { reset_at, .. } => (*reset_at - Utc::now()).num_milliseconds().max(0) as u64,
                    Error::CircuitOpen { retry_after_ms, .. } => *retry_after_ms,
                    _ => step.retry.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(20)),
                };
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

/// Dispatch one step by kind. Boxed so `condition`/`parallel` can recurse
/// into their branch steps without an infinitely-sized future.
fn dispatch_step_once<'a>(
    engine: &'a WorkflowEngine,
    step: &'a StepDefinition,
    ctx: &'a ExecutionContext,
    caller_key_id: Option<Uuid>,
) -> BoxFuture<'a, Result<DispatchOutcome>> {
    Box::pin(async move {
        match &step.kind {
            StepKind::Tool { tool_name, params, model_name, cacheable } => {
                let interpolated = engine.templates.interpolate(params, ctx);
                let mut request = InvokeRequest::new(tool_name.clone(), interpolated);
                if let Some(key) = caller_key_id {
                    request = request.caller(key);
                }
                if *cacheable {
                    request = request.cacheable(Duration::from_secs(300));
                }

                let response = engine.router.invoke(request).await?;
                let usage = engine.costs.tabulate(model_name.as_deref(), &response.output);
                Ok(DispatchOutcome {
                    output: response.output,
                    tokens_used: usage.map(|u| u.tokens_used),
                    cost_credits: usage.map(|u| u.cost_credits),
                    model_name: model_name.clone(),
                })
            }
            StepKind::Prompt { prompt_name, args } => {
                let interpolated = engine.templates.interpolate(args, ctx);
                let entry = engine
                    .registry
                    .find(prompt_name)
                    .ok_or_else(|| Error::NotFound(format!("prompt '{prompt_name}' not registered")))?;
                let client = engine
                    .router
                    .pool()
                    .get_client(entry.server_id)
                    .await
                    .ok_or_else(|| Error::External(format!("server '{}' has no active connection", entry.server_name)))?;
                let output = client.get_prompt(&entry.local_name, interpolated, DEFAULT_STEP_TIMEOUT).await?;
                Ok(DispatchOutcome { output, tokens_used: None, cost_credits: None, model_name: None })
            }
            StepKind::Resource { uri } => {
                let interpolated = engine.templates.interpolate(&Value::String(uri.clone()), ctx);
                let qualified = interpolated.as_str().unwrap_or(uri).to_string();
                let entry = engine
                    .registry
                    .find(&qualified)
                    .ok_or_else(|| Error::NotFound(format!("resource '{qualified}' not registered")))?;
                let client = engine
                    .router
                    .pool()
                    .get_client(entry.server_id)
                    .await
                    .ok_or_else(|| Error::External(format!("server '{}' has no active connection", entry.server_name)))?;
                let output = client.read_resource(&entry.local_name, DEFAULT_STEP_TIMEOUT).await?;
                Ok(DispatchOutcome { output, tokens_used: None, cost_credits: None, model_name: None })
            }
            StepKind::Condition { expression, then, else_ } => {
                let branch = if ctx.evaluate_condition(expression) { then } else { else_ };
                run_branch_sequential(engine, branch, ctx, caller_key_id).await
            }
            StepKind::Parallel { steps } => {
                let results =
                    futures::future::join_all(steps.iter().map(|child| dispatch_child(engine, child, ctx, caller_key_id))).await;

                let mut outputs = Vec::with_capacity(results.len());
                let mut tokens_total = 0u64;
                let mut cost_total = 0.0f64;
                let mut first_error = None;

                for (child, result) in steps.iter().zip(results) {
                    match result {
                        Ok(outcome) => {
                            outputs.push(serde_json::json!({"name": child.name, "output": outcome.output}));
                            tokens_total += outcome.tokens_used.unwrap_or(0);
                            cost_total += outcome.cost_credits.unwrap_or(0.0);
                        }
                        Err(err) => {
                            outputs.push(serde_json::json!({"name": child.name, "error": err.to_string()}));
                            if first_error.is_none() && matches!(child.on_error.unwrap_or_default(), OnErrorPolicy::Stop) {
                                first_error = Some(err);
                            }
                        }
                    }
                }

                if let Some(err) = first_error {
                    return Err(err);
                }

                Ok(DispatchOutcome {
                    output: Value::Array(outputs),
                    tokens_used: (tokens_total > 0).then_some(tokens_total),
                    cost_credits: (cost_total > 0.0).then_some(cost_total),
                    model_name: None,
                })
            }
        }
    })
}

/// A parallel-group child: skipped children never run, and a failure
/// never aborts its siblings (§4.3: "one failing child does not cancel
/// the others unless the parent's on-error is `stop`").
fn dispatch_child<'a>(
    engine: &'a WorkflowEngine,
    step: &'a StepDefinition,
    ctx: &'a ExecutionContext,
    caller_key_id: Option<Uuid>,
) -> BoxFuture<'a, Result<DispatchOutcome>> {
    Box::pin(async move {
        if !should_run(step, ctx) {
            return Ok(DispatchOutcome { output: Value::Null, tokens_used: None, cost_credits: None, model_name: None });
        }
        dispatch_step_once(engine, step, ctx, caller_key_id).await
    })
}

/// Run a `condition` branch's steps one after another, threading outputs
/// through a throwaway child context so later branch steps can reference
/// earlier ones; the branch's last step output becomes the parent's.
async fn run_branch_sequential(
    engine: &WorkflowEngine,
    branch: &[StepDefinition],
    parent_ctx: &ExecutionContext,
    caller_key_id: Option<Uuid>,
) -> Result<DispatchOutcome> {
    let mut last_output = Value::Null;
    let mut child_ctx = parent_ctx.clone();

    for step in branch {
        if !should_run(step, &child_ctx) {
            continue;
        }
        let outcome = dispatch_step_once(engine, step, &child_ctx, caller_key_id).await?;
        child_ctx.record_output(&step.name, outcome.output.clone());
        last_output = outcome.output;
    }

    Ok(DispatchOutcome { output: last_output, tokens_used: None, cost_credits: None, model_name: None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{RetryPolicy, StepDefinition};

    #[test]
    fn should_run_defaults_true_without_guard() {
        let ctx = ExecutionContext::new(serde_json::json!({}));
        let step = StepDefinition {
            name: "a".into(),
            kind: StepKind::Resource { uri: "fs/readme".into() },
            retry: RetryPolicy::default(),
            on_error: Some(OnErrorPolicy::Stop),
            condition: None,
        };
        assert!(should_run(&step, &ctx));
    }

    #[test]
    fn should_run_respects_guard_expression() {
        let ctx = ExecutionContext::new(serde_json::json!({"enabled": false}));
        let step = StepDefinition {
            name: "a".into(),
            kind: StepKind::Resource { uri: "fs/readme".into() },
            retry: RetryPolicy::default(),
            on_error: Some(OnErrorPolicy::Stop),
            condition: Some("input.enabled".into()),
        };
        assert!(!should_run(&step, &ctx));
    }
}

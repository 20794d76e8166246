//! Typed event bus, SSE fan-out, and webhook delivery (§4.5).
//!
//! A global `tokio::sync::broadcast` sender, typed to [`GatewayEvent`] rather
//! than a generic string channel. A lagging or dropped subscriber only misses
//! messages; it can never panic the bus, so handler isolation falls out of
//! `broadcast` for free.

pub mod webhooks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Every event the gateway publishes, namespaced per §4.5
/// (`server.*`, `tool.*`, `circuit.*`, `workflow.*`, `workflow_template.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayEvent {
    #[serde(rename = "server.connected")]
    ServerConnected { server_id: Uuid },
    #[serde(rename = "server.disconnected")]
    ServerDisconnected { server_id: Uuid },
    #[serde(rename = "server.connect_failed")]
    ServerConnectFailed { server_id: Uuid, error: String },
    #[serde(rename = "server.health_failed")]
    ServerHealthFailed { server_id: Uuid, error: String },

    #[serde(rename = "tool.invoked")]
    ToolInvoked {
        server_id: Uuid,
        qualified_name: String,
        duration_ms: u64,
        cached: bool,
    },
    #[serde(rename = "tool.failed")]
    ToolFailed {
        server_id: Uuid,
        qualified_name: String,
        error: String,
    },

    #[serde(rename = "circuit.opened")]
    CircuitOpened { server_id: Uuid },
    #[serde(rename = "circuit.half_open")]
    CircuitHalfOpen { server_id: Uuid },
    #[serde(rename = "circuit.closed")]
    CircuitClosed { server_id: Uuid },

    #[serde(rename = "workflow.step.started")]
    WorkflowStepStarted { execution_id: Uuid, step_id: String },
    #[serde(rename = "workflow.step.completed")]
    WorkflowStepCompleted { execution_id: Uuid, step_id: String },
    #[serde(rename = "workflow.step.failed")]
    WorkflowStepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
    },
    #[serde(rename = "workflow.completed")]
    WorkflowCompleted { execution_id: Uuid },
    #[serde(rename = "workflow.failed")]
    WorkflowFailed { execution_id: Uuid, error: String },

    #[serde(rename = "workflow_template.created")]
    WorkflowTemplateCreated { workflow_id: Uuid },
    #[serde(rename = "workflow_template.updated")]
    WorkflowTemplateUpdated { workflow_id: Uuid },
}

impl GatewayEvent {
    /// The dotted event kind string (`server.connected`, etc.) used both as
    /// the SSE `event:` line and the webhook subscription filter key.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServerConnected { .. } => "server.connected",
            Self::ServerDisconnected { .. } => "server.disconnected",
            Self::ServerConnectFailed { .. } => "server.connect_failed",
            Self::ServerHealthFailed { .. } => "server.health_failed",
            Self::ToolInvoked { .. } => "tool.invoked",
            Self::ToolFailed { .. } => "tool.failed",
            Self::CircuitOpened { .. } => "circuit.opened",
            Self::CircuitHalfOpen { .. } => "circuit.half_open",
            Self::CircuitClosed { .. } => "circuit.closed",
            Self::WorkflowStepStarted { .. } => "workflow.step.started",
            Self::WorkflowStepCompleted { .. } => "workflow.step.completed",
            Self::WorkflowStepFailed { .. } => "workflow.step.failed",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowTemplateCreated { .. } => "workflow_template.created",
            Self::WorkflowTemplateUpdated { .. } => "workflow_template.updated",
        }
    }

    /// The server id an event concerns, if any — used for SSE/webhook
    /// filtering by server id (§4.5). Workflow events carry no server id.
    pub fn server_id(&self) -> Option<Uuid> {
        match self {
            Self::ServerConnected { server_id }
            | Self::ServerDisconnected { server_id }
            | Self::ServerConnectFailed { server_id, .. }
            | Self::ServerHealthFailed { server_id, .. }
            | Self::ToolInvoked { server_id, .. }
            | Self::ToolFailed { server_id, .. }
            | Self::CircuitOpened { server_id }
            | Self::CircuitHalfOpen { server_id }
            | Self::CircuitClosed { server_id } => Some(*server_id),
            _ => None,
        }
    }

    /// The workflow execution id an event concerns, if any — used to drive
    /// the per-execution SSE stream of §4.5.
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            Self::WorkflowStepStarted { execution_id, .. }
            | Self::WorkflowStepCompleted { execution_id, .. }
            | Self::WorkflowStepFailed { execution_id, .. }
            | Self::WorkflowCompleted { execution_id }
            | Self::WorkflowFailed { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    /// Whether this event terminates a workflow execution's SSE stream.
    pub fn is_terminal_for_execution(&self) -> bool {
        matches!(self, Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. })
    }
}

/// An envelope wrapping an event with its publication timestamp, the unit
/// actually sent over the broadcast channel and delivered to SSE/webhook
/// consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub event: GatewayEvent,
}

/// Process-wide typed event bus.
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber; fire-and-forget per
    /// §4.5 ("publication is fire-and-forget within the process").
    pub fn publish(&self, event: GatewayEvent) -> EventEnvelope {
        let envelope = EventEnvelope { id: Uuid::now_v7(), occurred_at: Utc::now(), event };
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Subscription filter shared by the SSE endpoint and webhook matching
/// (§4.5: "optionally filtering by event kinds and server ids").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub kinds: Option<Vec<String>>,
    pub server_ids: Option<Vec<Uuid>>,
}

impl EventFilter {
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.iter().any(|k| k == envelope.event.kind()) {
                return false;
            }
        }
        if let Some(server_ids) = &self.server_ids {
            match envelope.event.server_id() {
                Some(sid) if server_ids.contains(&sid) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let server_id = Uuid::now_v7();

        bus.publish(GatewayEvent::ServerConnected { server_id });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.kind(), "server.connected");
        assert_eq!(envelope.event.server_id(), Some(server_id));
    }

    #[test]
    fn filter_matches_on_kind_and_server_id() {
        let server_id = Uuid::now_v7();
        let envelope = EventEnvelope {
            id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            event: GatewayEvent::ServerConnected { server_id },
        };

        let matching = EventFilter { kinds: Some(vec!["server.connected".into()]), server_ids: None };
        assert!(matching.matches(&envelope));

        let wrong_kind = EventFilter { kinds: Some(vec!["tool.invoked".into()]), server_ids: None };
        assert!(!wrong_kind.matches(&envelope));

        let wrong_server = EventFilter { kinds: None, server_ids: Some(vec![Uuid::now_v7()]) };
        assert!(!wrong_server.matches(&envelope));
    }

    #[test]
    fn workflow_completion_events_are_terminal() {
        let execution_id = Uuid::now_v7();
        assert!(GatewayEvent::WorkflowCompleted { execution_id }.is_terminal_for_execution());
        assert!(GatewayEvent::WorkflowFailed { execution_id, error: "x".into() }.is_terminal_for_execution());
        assert!(!GatewayEvent::WorkflowStepStarted { execution_id, step_id: "s".into() }.is_terminal_for_execution());
    }
}

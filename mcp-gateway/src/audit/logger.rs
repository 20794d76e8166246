//! Audit logger — thin public API wrapper around the agent handle
//!
//! `AuditLogger` provides a fire-and-forget API for emitting audit events.
//! Events are sent to the `AuditAgent` via `AgentHandle::send()`, so audit
//! logging never blocks request handling.

use acton_reactive::prelude::AgentHandle;
use uuid::Uuid;

use super::config::AuditConfig;
use super::event::AuditEvent;

/// Audit logger for emitting events to the audit trail
///
/// Thin wrapper around the `AuditAgent`'s handle. `record` is
/// fire-and-forget: it sends a message to the agent and returns as soon as
/// the agent's mailbox accepts it, without waiting for persistence.
#[derive(Clone)]
pub struct AuditLogger {
    handle: AgentHandle,
    service_name: String,
    config: AuditConfig,
}

impl AuditLogger {
    /// Create a new audit logger wrapping the given agent handle
    pub fn new(handle: AgentHandle, service_name: String, config: AuditConfig) -> Self {
        Self {
            handle,
            service_name,
            config,
        }
    }

    /// Get the audit configuration
    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Get the service name
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Record a mutating admin operation.
    ///
    /// No-ops (without erroring) when audit logging is disabled so callers
    /// never need to branch on `config().enabled` themselves.
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        action: impl Into<String>,
        key_id: Option<Uuid>,
        tenant_id: Option<String>,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
        duration_ms: u64,
        success: bool,
        error: Option<String>,
    ) {
        if !self.config.enabled {
            return;
        }

        let event = AuditEvent::new(
            action,
            key_id,
            tenant_id,
            resource_type,
            resource_id,
            duration_ms,
            success,
            error,
            self.service_name.clone(),
        );

        self.handle.send(event).await;
    }
}

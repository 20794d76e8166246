//! The audit event record.
//!
//! Field shape follows the gateway's own admin-action audit contract:
//! `{action, key_id, tenant_id, resource_type, resource_id, duration_ms,
//! success, error}`, plus the chain-linkage fields (`hash`/`previous_hash`/
//! `sequence`) [`super::chain::AuditChain::seal`] fills in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One sealed (or about-to-be-sealed) admin-action audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    /// The mutating admin operation performed, e.g. `"workflow.create"`,
    /// `"server.disconnect"`, `"webhook.subscribe"`.
    pub action: String,
    /// The API key (if any) that performed the operation.
    pub key_id: Option<Uuid>,
    /// The tenant (if any) the operation was scoped to.
    pub tenant_id: Option<String>,
    /// Kind of resource acted on, e.g. `"workflow"`, `"server"`, `"webhook"`.
    pub resource_type: String,
    /// Id of the specific resource acted on, when one exists yet (a
    /// `create` that fails validation may have none).
    pub resource_id: Option<String>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,

    /// Name of the service that generated this event.
    pub service_name: String,

    /// BLAKE3 hash over this event's canonical fields plus `previous_hash`.
    pub hash: Option<String>,
    /// Hash of the previous event in the chain.
    pub previous_hash: Option<String>,
    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl AuditEvent {
    /// Construct an unsealed event (`hash`/`previous_hash`/`sequence` are
    /// placeholders until `AuditChain::seal` runs).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: impl Into<String>,
        key_id: Option<Uuid>,
        tenant_id: Option<String>,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
        duration_ms: u64,
        success: bool,
        error: Option<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            key_id,
            tenant_id,
            resource_type: resource_type.into(),
            resource_id,
            duration_ms,
            success,
            error,
            service_name: service_name.into(),
            hash: None,
            previous_hash: None,
            sequence: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_is_unsealed() {
        let event = AuditEvent::new("workflow.create", None, None, "workflow", None, 12, true, None, "gateway");
        assert!(event.hash.is_none());
        assert_eq!(event.sequence, 0);
        assert_eq!(event.action, "workflow.create");
    }

    #[test]
    fn serde_roundtrip() {
        let event = AuditEvent::new(
            "workflow.delete",
            Some(Uuid::new_v4()),
            Some("tenant-a".to_string()),
            "workflow",
            Some("wf-1".to_string()),
            8,
            false,
            Some("not found".to_string()),
            "gateway",
        );
        let json = serde_json::to_string(&event).unwrap();
        let deserialized: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, event.id);
        assert_eq!(deserialized.action, "workflow.delete");
        assert!(!deserialized.success);
    }
}

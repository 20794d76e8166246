//! Minimal caller-identity and embedding row shapes (§3 supplemental).
//!
//! The RBAC permission matrix and the embedding model/backend itself are out
//! of scope; these structs only carry the storage shape callers elsewhere in
//! the crate key off of — `ApiKey::id` is the `key_id` the rate limiter,
//! budget enforcer, and audit log already scope state by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A tenant record. No behavior of its own — tenants exist so
/// `ApiKey::tenant_id` and `BudgetScope::Tenant` have something to point at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>) -> Self {
        Self { id: Uuid::now_v7(), name: name.into(), created_at: Utc::now() }
    }
}

/// An API key record. `id` is the `key_id` used throughout the crate to
/// scope rate limits, budgets, and audit entries — this struct is the
/// minimal record those ids resolve to, not a credential-issuance system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn new(tenant_id: Uuid, label: impl Into<String>) -> Self {
        Self { id: Uuid::now_v7(), tenant_id, label: label.into(), created_at: Utc::now(), revoked_at: None }
    }

    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }

    pub fn revoke(&mut self) {
        self.revoked_at = Some(Utc::now());
    }
}

/// Storage shape for the optional semantic-search surface over the
/// registry (§6). The embedding model/backend is out of scope; this is
/// only the row an embedding would be persisted as.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEmbedding {
    pub owner_qualified_name: String,
    pub vector: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_api_key_is_active() {
        let key = ApiKey::new(Uuid::now_v7(), "ci-runner");
        assert!(key.is_active());
    }

    #[test]
    fn revoke_marks_inactive() {
        let mut key = ApiKey::new(Uuid::now_v7(), "ci-runner");
        key.revoke();
        assert!(!key.is_active());
    }

    #[test]
    fn tenant_new_sets_name() {
        let tenant = Tenant::new("acme");
        assert_eq!(tenant.name, "acme");
    }
}

//! Audit logging configuration
//!
//! Loaded from the `[audit]` section of `config.toml` or `MCPGW_AUDIT_*`
//! environment variables.

use serde::{Deserialize, Serialize};

/// Audit logging configuration. Controls whether admin-action auditing is
/// active and how long records are kept before the cleanup run prunes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Days to retain audit events (None = infinite)
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Hours between cleanup runs (default: 24)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_hours: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: None,
            cleanup_interval_hours: default_cleanup_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cleanup_interval() -> u32 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_config_defaults() {
        let config = AuditConfig::default();
        assert!(config.enabled);
        assert!(config.retention_days.is_none());
        assert_eq!(config.cleanup_interval_hours, 24);
    }

    #[test]
    fn test_audit_config_serde_roundtrip() {
        let config = AuditConfig { enabled: true, retention_days: Some(90), cleanup_interval_hours: 12 };

        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AuditConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.retention_days, Some(90));
        assert_eq!(deserialized.cleanup_interval_hours, 12);
    }

    #[test]
    fn test_retention_fields_default_from_json() {
        let json = r#"{"enabled": true}"#;
        let config: AuditConfig = serde_json::from_str(json).unwrap();
        assert!(config.retention_days.is_none());
        assert_eq!(config.cleanup_interval_hours, 24);
    }
}

//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: MCPGW_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/mcp-gateway/config.toml
//! 4. System directory: /etc/mcp-gateway/config.toml
//! 5. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::audit::AuditConfig;
use crate::error::Result;
use crate::events::webhooks::WebhookSubscriptionSeed;
use crate::pool::seed::ServerConfigSeed;
use crate::workflow::{BudgetPeriod, BudgetRule, BudgetScope};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Service-level configuration (name, port, log level).
    pub service: ServiceConfig,

    /// Durable storage (optional; falls back to `InMemoryGatewayStorage`
    /// and an in-memory response cache mirror when absent).
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis mirror for the response cache's durable tier (optional).
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Admin master-key configuration (§3, §6: "an opaque master-admin key").
    #[serde(default)]
    pub admin: AdminConfig,

    /// Defaults used when a server/caller has no explicit rate policy.
    #[serde(default)]
    pub rate_limit: RateLimitDefaults,

    /// Workflow engine configuration (budget rules).
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Webhook dispatcher configuration (retry defaults, seeded subscriptions).
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Audit logging configuration (§7: mutating admin operations).
    #[serde(default)]
    pub audit: AuditConfig,

    /// Backend servers to connect at boot (§6 `[[servers]]`), reconciled by
    /// [`crate::pool::seed::reconcile`] under the `"seeded"` category.
    #[serde(default)]
    pub servers: Vec<ServerConfigSeed>,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Admin master-key configuration. A caller presenting this key bypasses
/// per-key rate limiting (§3 glossary: "master-admin key") — treated as
/// [`crate::router::INTERNAL_CALLER_KEY`] by whatever authentication
/// plumbing sits in front of the router.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// Opaque bearer value. Empty disables the admin bypass entirely.
    #[serde(default)]
    pub master_key: String,
}

/// Fallback rate limit policy applied to servers/callers with no explicit
/// override configured (§4.2, §5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitDefaults {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_day")]
    pub per_day: u32,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self { per_minute: default_per_minute(), per_day: default_per_day() }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether database is optional (service can start without it)
    #[serde(default = "default_false")]
    pub optional: bool,

    /// Whether to initialize connection lazily (in background)
    #[serde(default = "default_lazy_init")]
    pub lazy_init: bool,
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port or cluster URLs)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing Redis connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Whether Redis is optional (service can start without it)
    #[serde(default = "default_false")]
    pub optional: bool,

    /// Whether to initialize connection lazily (in background)
    #[serde(default = "default_lazy_init")]
    pub lazy_init: bool,
}

/// Seed shape for a [`BudgetRule`] (§3 `BudgetUsage`, §4.3 gate 2).
///
/// `BudgetScope`/`BudgetPeriod` carry no `serde` impls of their own (they're
/// plain in-process value types used by the engine's hot path), so config
/// loading goes through this flat, serializable stand-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BudgetRuleScopeSeed {
    Global,
    Tenant { id: Uuid },
    Workflow { id: Uuid },
    Key { id: Uuid },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriodSeed {
    Day,
    Week,
    Month,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRuleSeed {
    #[serde(flatten)]
    pub scope: BudgetRuleScopeSeed,
    pub limit: u64,
    pub period: BudgetPeriodSeed,
}

impl BudgetRuleSeed {
    pub fn into_rule(self) -> BudgetRule {
        let scope = match self.scope {
            BudgetRuleScopeSeed::Global => BudgetScope::Global,
            BudgetRuleScopeSeed::Tenant { id } => BudgetScope::Tenant(id),
            BudgetRuleScopeSeed::Workflow { id } => BudgetScope::Workflow(id),
            BudgetRuleScopeSeed::Key { id } => BudgetScope::Key(id),
        };
        let period = match self.period {
            BudgetPeriodSeed::Day => BudgetPeriod::Day,
            BudgetPeriodSeed::Week => BudgetPeriod::Week,
            BudgetPeriodSeed::Month => BudgetPeriod::Month,
        };
        BudgetRule { scope, limit: self.limit, period }
    }
}

/// Workflow engine configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Budget rules installed into the `BudgetEnforcer` at boot.
    #[serde(default)]
    pub budget_rules: Vec<BudgetRuleSeed>,
}

/// Webhook dispatcher configuration section (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Default retry count for subscriptions that don't specify one.
    #[serde(default = "default_webhook_retry_count")]
    pub default_retry_count: u32,
    /// Default retry backoff base, in milliseconds.
    #[serde(default = "default_webhook_retry_delay_ms")]
    pub default_retry_delay_ms: u64,
    /// How long delivery records are kept before `prune_old_deliveries` removes them.
    #[serde(default = "default_webhook_prune_after_days")]
    pub prune_after_days: i64,
    /// Subscriptions registered at boot.
    #[serde(default)]
    pub subscriptions: Vec<WebhookSubscriptionSeed>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_retry_count: default_webhook_retry_count(),
            default_retry_delay_ms: default_webhook_retry_delay_ms(),
            prune_after_days: default_webhook_prune_after_days(),
            subscriptions: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from all sources.
    ///
    /// Searches for config files in this order (first found wins):
    /// 1. Current working directory: `./config.toml`
    /// 2. XDG config directory: `~/.config/mcp-gateway/config.toml`
    /// 3. System directory: `/etc/mcp-gateway/config.toml`
    ///
    /// Environment variables (`MCPGW_` prefix) override all file-based config.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(GatewayConfig::default()));

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("MCPGW_").split("_"));

        // Honor the literal, non-exhaustive env-name contract: PORT and
        // DB_PATH are respected unprefixed so a bare container/systemd unit
        // can set them without knowing the crate's own prefix convention.
        figment = figment.merge(Env::raw().only(&["PORT"]).map(|_| "service.port".into()));
        if let Ok(db_path) = std::env::var("DB_PATH") {
            figment = figment.merge(("database.url", db_path));
        }

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing XDG/system lookup.
    /// Useful for tests and non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("MCPGW_").split("_"))
            .extract()?;

        Ok(config)
    }

    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("mcp-gateway");
        if let Ok(path) = xdg_dirs.place_config_file(Path::new("config.toml")) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/mcp-gateway/config.toml"));

        paths
    }

    /// Recommended config path, for `--write-default-config`-style tooling.
    pub fn recommended_path() -> PathBuf {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("mcp-gateway");
        xdg_dirs.place_config_file(Path::new("config.toml")).unwrap_or_else(|_| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| String::from("~")))
                .join(".config/mcp-gateway/config.toml")
        })
    }

    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis.as_ref().map(|r| r.url.as_str())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "mcp-gateway".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
            },
            database: None,
            redis: None,
            admin: AdminConfig::default(),
            rate_limit: RateLimitDefaults::default(),
            workflow: WorkflowConfig::default(),
            webhook: WebhookConfig::default(),
            audit: AuditConfig::default(),
            servers: Vec::new(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_per_minute() -> u32 {
    200
}

fn default_per_day() -> u32 {
    20_000
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_redis_max_connections() -> usize {
    20
}

fn default_false() -> bool {
    false
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_lazy_init() -> bool {
    true
}

fn default_webhook_retry_count() -> u32 {
    3
}

fn default_webhook_retry_delay_ms() -> u64 {
    500
}

fn default_webhook_prune_after_days() -> i64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.service.port, 8080);
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.rate_limit.per_minute, 200);
        assert!(config.database.is_none());
        assert!(config.servers.is_empty());
    }

    #[test]
    fn test_load_from_toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [service]
            name = "test-gateway"
            port = 9090

            [admin]
            master_key = "secret"
            "#,
        )
        .unwrap();

        let config = GatewayConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "test-gateway");
        assert_eq!(config.service.port, 9090);
        assert_eq!(config.admin.master_key, "secret");
    }

    #[test]
    fn test_budget_rule_seed_conversion() {
        let seed = BudgetRuleSeed {
            scope: BudgetRuleScopeSeed::Global,
            limit: 1000,
            period: BudgetPeriodSeed::Day,
        };
        let rule = seed.into_rule();
        assert!(matches!(rule.scope, BudgetScope::Global));
        assert_eq!(rule.limit, 1000);
        assert!(matches!(rule.period, BudgetPeriod::Day));
    }
}

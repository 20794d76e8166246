//! Budget admission and accrual (§4.3 pre-execution gate 2, §3 `BudgetUsage`).

use std::sync::Arc;

use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::storage::GatewayStorage;

/// The scope a budget rule applies to (§3: "scope (global|tenant|workflow|key)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Global,
    Tenant(Uuid),
    Workflow(Uuid),
    Key(Uuid),
}

impl BudgetScope {
    /// Stable string key used by the storage layer's `budget_usage` table.
    pub fn storage_key(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Tenant(id) => format!("tenant:{id}"),
            Self::Workflow(id) => format!("workflow:{id}"),
            Self::Key(id) => format!("key:{id}"),
        }
    }
}

/// A configured limit for one scope over one period.
#[derive(Debug, Clone, Copy)]
pub struct BudgetRule {
    pub scope: BudgetScope,
    pub limit: u64,
    pub period: BudgetPeriod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetPeriod {
    Day,
    Week,
    Month,
}

impl BudgetPeriod {
    /// The inclusive period start covering `now`, matching §3's
    /// `periodStart`/`periodEnd` columns.
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = now.date_naive();
        let start_date = match self {
            Self::Day => date,
            Self::Week => date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64),
            Self::Month => date.with_day(1).unwrap_or(date),
        };
        start_date.and_hms_opt(0, 0, 0).expect("midnight is always valid").and_utc()
    }

    pub fn period_end(&self, period_start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Day => period_start + chrono::Duration::days(1),
            Self::Week => period_start + chrono::Duration::days(7),
            Self::Month => period_start + chrono::Duration::days(30),
        }
    }
}

/// Result of a budget admission check.
#[derive(Debug, Clone, Copy)]
pub struct BudgetDecision {
    pub admitted: bool,
    pub scope: BudgetScope,
    pub used: u64,
    pub limit: u64,
}

/// Consults and updates `BudgetUsage` rows per rule.
pub struct BudgetEnforcer {
    storage: Arc<dyn GatewayStorage>,
    rules: Vec<BudgetRule>,
}

impl BudgetEnforcer {
    pub fn new(storage: Arc<dyn GatewayStorage>, rules: Vec<BudgetRule>) -> Self {
        Self { storage, rules }
    }

    /// Check every rule that applies to `scopes`; admission fails if any
    /// scope's used-plus-expected would exceed its limit (§4.3 gate 2).
    pub async fn admit(&self, scopes: &[BudgetScope], expected_cost: u64, now: DateTime<Utc>) -> Result<Vec<BudgetDecision>> {
        let mut decisions = Vec::new();
        for rule in self.rules.iter().filter(|r| scopes.contains(&r.scope)) {
            let period_start = rule.period.period_start(now);
            let used = self.storage.get_budget_usage(rule.scope, period_start).await?;
            decisions.push(BudgetDecision {
                admitted: used + expected_cost <= rule.limit,
                scope: rule.scope,
                used,
                limit: rule.limit,
            });
        }
        Ok(decisions)
    }

    /// Accrue actual cost against every rule-matching scope after
    /// execution completes.
    pub async fn accrue(&self, scopes: &[BudgetScope], cost: u64, now: DateTime<Utc>) -> Result<()> {
        for rule in self.rules.iter().filter(|r| scopes.contains(&r.scope)) {
            let period_start = rule.period.period_start(now);
            let period_end = rule.period.period_end(period_start);
            self.storage.add_budget_usage(rule.scope, period_start, period_end, cost).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryGatewayStorage;

    #[tokio::test]
    async fn admits_when_under_limit_and_rejects_when_over() {
        let storage = Arc::new(InMemoryGatewayStorage::new());
        let enforcer = BudgetEnforcer::new(
            storage,
            vec![BudgetRule { scope: BudgetScope::Global, limit: 100, period: BudgetPeriod::Day }],
        );
        let now = Utc::now();

        let decisions = enforcer.admit(&[BudgetScope::Global], 50, now).await.unwrap();
        assert!(decisions[0].admitted);

        enforcer.accrue(&[BudgetScope::Global], 80, now).await.unwrap();
        let decisions = enforcer.admit(&[BudgetScope::Global], 50, now).await.unwrap();
        assert!(!decisions[0].admitted);
    }

    #[test]
    fn scopes_without_a_matching_rule_are_not_checked() {
        assert_eq!(BudgetScope::Tenant(Uuid::nil()).storage_key(), format!("tenant:{}", Uuid::nil()));
    }
}

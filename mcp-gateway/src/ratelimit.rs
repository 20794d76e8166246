//! Per-(api-key, server) two-window rate limiter (§4.4).
//!
//! State is held in a `DashMap` keyed by `(ApiKeyId, ServerId)`; a charge is
//! a single `entry().and_modify()/.or_insert()` closure, so concurrent
//! chargers for distinct keys never contend and there is no global lock
//! (§5).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-server rate limit policy; `0` in either field means "unset" and that
/// window is never enforced (an admin configuring a policy with only a
/// daily cap, say).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub per_minute: u32,
    pub per_day: u32,
}

impl RateLimitPolicy {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self { per_minute, per_day }
    }
}

/// A single (key, server) bucket's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub minute_count: u32,
    pub minute_reset_at: DateTime<Utc>,
    pub day_count: u32,
    pub day_reset_at: DateTime<Utc>,
}

impl RateLimitBucket {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            minute_count: 0,
            minute_reset_at: now + ChronoDuration::seconds(60),
            day_count: 0,
            day_reset_at: next_calendar_day(now),
        }
    }
}

fn next_calendar_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = (now + ChronoDuration::days(1)).date_naive();
    tomorrow
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

/// Outcome of a charge attempt, returned on both admission and rejection
/// per §4.4 ("returns `{remainingPerMinute, remainingPerDay, resetAt}` on
/// both success and rejection").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeOutcome {
    pub admitted: bool,
    pub remaining_per_minute: u32,
    pub remaining_per_day: u32,
    pub reset_at: DateTime<Utc>,
}

/// Two-window fixed-bucket limiter over (api-key, server) pairs.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: DashMap<(Uuid, Uuid), RateLimitBucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed/replace a persisted bucket (used when restoring from durable
    /// storage at boot).
    pub fn restore(&self, key_id: Uuid, server_id: Uuid, bucket: RateLimitBucket) {
        self.buckets.insert((key_id, server_id), bucket);
    }

    pub fn bucket(&self, key_id: Uuid, server_id: Uuid) -> Option<RateLimitBucket> {
        self.buckets.get(&(key_id, server_id)).map(|b| b.clone())
    }

    /// Atomically try to reserve one slot. Resets whichever window(s) the
    /// wall clock has crossed before evaluating admission, per §4.4.
    pub fn charge(&self, key_id: Uuid, server_id: Uuid, policy: RateLimitPolicy, now: DateTime<Utc>) -> ChargeOutcome {
        let mut entry = self
            .buckets
            .entry((key_id, server_id))
            .or_insert_with(|| RateLimitBucket::fresh(now));

        if now >= entry.minute_reset_at {
            entry.minute_count = 0;
            entry.minute_reset_at = now + ChronoDuration::seconds(60);
        }
        if now >= entry.day_reset_at {
            entry.day_count = 0;
            entry.day_reset_at = next_calendar_day(now);
        }

        let minute_limit_ok = policy.per_minute == 0 || entry.minute_count + 1 <= policy.per_minute;
        let day_limit_ok = policy.per_day == 0 || entry.day_count + 1 <= policy.per_day;

        let admitted = minute_limit_ok && day_limit_ok;
        if admitted {
            entry.minute_count += 1;
            entry.day_count += 1;
        }

        let remaining_per_minute = if policy.per_minute == 0 {
            u32::MAX
        } else {
            policy.per_minute.saturating_sub(entry.minute_count)
        };
        let remaining_per_day = if policy.per_day == 0 {
            u32::MAX
        } else {
            policy.per_day.saturating_sub(entry.day_count)
        };

        ChargeOutcome {
            admitted,
            remaining_per_minute,
            remaining_per_day,
            reset_at: entry.minute_reset_at.min(entry.day_reset_at),
        }
    }

    pub fn remove_server(&self, server_id: Uuid) {
        self.buckets.retain(|(_, sid), _| *sid != server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_per_minute_limit() {
        let limiter = RateLimiter::new();
        let key = Uuid::now_v7();
        let server = Uuid::now_v7();
        let policy = RateLimitPolicy::new(2, 0);
        let now = Utc::now();

        let first = limiter.charge(key, server, policy, now);
        let second = limiter.charge(key, server, policy, now);
        let third = limiter.charge(key, server, policy, now);

        assert!(first.admitted);
        assert!(second.admitted);
        assert!(!third.admitted);
        assert_eq!(third.remaining_per_minute, 0);
    }

    #[test]
    fn minute_window_resets_after_60s() {
        let limiter = RateLimiter::new();
        let key = Uuid::now_v7();
        let server = Uuid::now_v7();
        let policy = RateLimitPolicy::new(1, 0);
        let t0 = Utc::now();

        assert!(limiter.charge(key, server, policy, t0).admitted);
        assert!(!limiter.charge(key, server, policy, t0).admitted);

        let t1 = t0 + ChronoDuration::seconds(61);
        let after_reset = limiter.charge(key, server, policy, t1);
        assert!(after_reset.admitted);
        assert_eq!(after_reset.remaining_per_minute, 0);
    }

    #[test]
    fn distinct_servers_do_not_share_a_bucket() {
        let limiter = RateLimiter::new();
        let key = Uuid::now_v7();
        let policy = RateLimitPolicy::new(1, 0);
        let now = Utc::now();

        assert!(limiter.charge(key, Uuid::now_v7(), policy, now).admitted);
        assert!(limiter.charge(key, Uuid::now_v7(), policy, now).admitted);
    }

    #[test]
    fn zero_policy_means_unlimited_window() {
        let limiter = RateLimiter::new();
        let key = Uuid::now_v7();
        let server = Uuid::now_v7();
        let policy = RateLimitPolicy::new(0, 0);
        let now = Utc::now();

        for _ in 0..100 {
            assert!(limiter.charge(key, server, policy, now).admitted);
        }
    }
}

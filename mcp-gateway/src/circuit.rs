//! Per-server circuit breaker state machine (§4.4).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitPolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub volume_threshold: u32,
    pub timeout: std::time::Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            volume_threshold: 5,
            timeout: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub state: CircuitStateKind,
    pub failure_count: u32,
    pub total_observations: u32,
    pub consecutive_successes: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
}

impl CircuitState {
    fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitStateKind::Closed,
            failure_count: 0,
            total_observations: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_state_change_at: now,
        }
    }
}

/// Per-server circuit breaker registry; transitions are linearizable per
/// server id via `DashMap::entry` (§5), no global lock.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    states: DashMap<Uuid, CircuitState>,
    policies: DashMap<Uuid, CircuitPolicy>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_policy(&self, server_id: Uuid, policy: CircuitPolicy) {
        self.policies.insert(server_id, policy);
    }

    fn policy_for(&self, server_id: Uuid) -> CircuitPolicy {
        self.policies.get(&server_id).map(|p| *p).unwrap_or_default()
    }

    pub fn state(&self, server_id: Uuid) -> Option<CircuitState> {
        self.states.get(&server_id).map(|s| s.clone())
    }

    /// Whether a call may proceed right now; transitions OPEN → HALF_OPEN
    /// when the timeout has elapsed (the probe allowance is consumed by the
    /// caller actually dispatching the call).
    pub fn can_execute(&self, server_id: Uuid, now: DateTime<Utc>) -> bool {
        self.can_execute_noting_transition(server_id, now).0
    }

    /// Same admission check as [`Self::can_execute`], additionally
    /// reporting an OPEN → HALF_OPEN transition when one just happened, so
    /// callers that publish `circuit.*` events (§4.5) don't need to poll
    /// state separately.
    pub fn can_execute_noting_transition(&self, server_id: Uuid, now: DateTime<Utc>) -> (bool, Option<CircuitStateKind>) {
        let policy = self.policy_for(server_id);
        let mut entry = self.states.entry(server_id).or_insert_with(|| CircuitState::closed(now));

        match entry.state {
            CircuitStateKind::Closed | CircuitStateKind::HalfOpen => (true, None),
            CircuitStateKind::Open => {
                let opened_at = entry.opened_at.unwrap_or(now);
                if now - opened_at >= chrono::Duration::from_std(policy.timeout).unwrap_or_default() {
                    entry.state = CircuitStateKind::HalfOpen;
                    entry.consecutive_successes = 0;
                    entry.last_state_change_at = now;
                    (true, Some(CircuitStateKind::HalfOpen))
                } else {
                    (false, None)
                }
            }
        }
    }

    /// Retry-after hint in milliseconds for a server whose circuit is open.
    pub fn retry_after_ms(&self, server_id: Uuid, now: DateTime<Utc>) -> u64 {
        let policy = self.policy_for(server_id);
        match self.states.get(&server_id) {
            Some(s) if s.state == CircuitStateKind::Open => {
                let opened_at = s.opened_at.unwrap_or(now);
                let elapsed = (now - opened_at).num_milliseconds().max(0) as u64;
                policy.timeout.as_millis() as u64 - elapsed.min(policy.timeout.as_millis() as u64)
            }
            _ => 0,
        }
    }

    /// Record a successful call. Returns the state transitioned *to*, if
    /// this call caused one, so callers can publish the matching
    /// `circuit.*` event (§4.5) without a separate state read.
    pub fn record_success(&self, server_id: Uuid, now: DateTime<Utc>) -> Option<CircuitStateKind> {
        let policy = self.policy_for(server_id);
        let mut entry = self.states.entry(server_id).or_insert_with(|| CircuitState::closed(now));
        entry.total_observations += 1;

        match entry.state {
            CircuitStateKind::Closed => {
                entry.failure_count = 0;
                None
            }
            CircuitStateKind::HalfOpen => {
                entry.consecutive_successes += 1;
                if entry.consecutive_successes >= policy.success_threshold {
                    entry.state = CircuitStateKind::Closed;
                    entry.failure_count = 0;
                    entry.consecutive_successes = 0;
                    entry.last_state_change_at = now;
                    Some(CircuitStateKind::Closed)
                } else {
                    None
                }
            }
            CircuitStateKind::Open => None,
        }
    }

    /// Record a failed call. Returns the state transitioned *to*, if this
    /// call caused one (see [`Self::record_success`]).
    pub fn record_failure(&self, server_id: Uuid, now: DateTime<Utc>) -> Option<CircuitStateKind> {
        let policy = self.policy_for(server_id);
        let mut entry = self.states.entry(server_id).or_insert_with(|| CircuitState::closed(now));
        entry.total_observations += 1;

        match entry.state {
            CircuitStateKind::Closed => {
                entry.failure_count += 1;
                if entry.total_observations >= policy.volume_threshold
                    && entry.failure_count >= policy.failure_threshold
                {
                    entry.state = CircuitStateKind::Open;
                    entry.opened_at = Some(now);
                    entry.last_state_change_at = now;
                    Some(CircuitStateKind::Open)
                } else {
                    None
                }
            }
            CircuitStateKind::HalfOpen => {
                entry.state = CircuitStateKind::Open;
                entry.opened_at = Some(now);
                entry.consecutive_successes = 0;
                entry.last_state_change_at = now;
                Some(CircuitStateKind::Open)
            }
            CircuitStateKind::Open => None,
        }
    }

    /// Run `fn` through the breaker, short-circuiting with
    /// [`Error::CircuitOpen`] when not admitted.
    pub async fn execute<F, Fut, T>(&self, server_id: Uuid, fn_: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let now = Utc::now();
        if !self.can_execute(server_id, now) {
            return Err(Error::CircuitOpen {
                server_id,
                retry_after_ms: self.retry_after_ms(server_id, now),
            });
        }

        match fn_().await {
            Ok(value) => {
                let _ = self.record_success(server_id, Utc::now());
                Ok(value)
            }
            Err(err) => {
                let _ = self.record_failure(server_id, Utc::now());
                Err(err)
            }
        }
    }

    pub fn remove_server(&self, server_id: Uuid) {
        self.states.remove(&server_id);
        self.policies.remove(&server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CircuitPolicy {
        CircuitPolicy {
            failure_threshold: 3,
            success_threshold: 2,
            volume_threshold: 3,
            timeout: std::time::Duration::from_millis(50),
        }
    }

    #[test]
    fn opens_after_failure_and_volume_threshold() {
        let cb = CircuitBreaker::new();
        let sid = Uuid::now_v7();
        cb.set_policy(sid, policy());
        let now = Utc::now();

        cb.record_failure(sid, now);
        cb.record_failure(sid, now);
        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::Closed);
        cb.record_failure(sid, now);

        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::Open);
        assert!(!cb.can_execute(sid, now));
    }

    #[test]
    fn transitions_half_open_after_timeout_then_closed_after_successes() {
        let cb = CircuitBreaker::new();
        let sid = Uuid::now_v7();
        cb.set_policy(sid, policy());
        let t0 = Utc::now();

        for _ in 0..3 {
            cb.record_failure(sid, t0);
        }
        assert!(!cb.can_execute(sid, t0));

        let t1 = t0 + chrono::Duration::milliseconds(60);
        assert!(cb.can_execute(sid, t1));
        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::HalfOpen);

        cb.record_success(sid, t1);
        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::HalfOpen);
        cb.record_success(sid, t1);
        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::Closed);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let cb = CircuitBreaker::new();
        let sid = Uuid::now_v7();
        cb.set_policy(sid, policy());
        let t0 = Utc::now();
        for _ in 0..3 {
            cb.record_failure(sid, t0);
        }
        let t1 = t0 + chrono::Duration::milliseconds(60);
        assert!(cb.can_execute(sid, t1));
        cb.record_failure(sid, t1);
        assert_eq!(cb.state(sid).unwrap().state, CircuitStateKind::Open);
    }

    #[test]
    fn transitions_are_reported_on_the_call_that_causes_them() {
        let cb = CircuitBreaker::new();
        let sid = Uuid::now_v7();
        cb.set_policy(sid, policy());
        let t0 = Utc::now();

        assert_eq!(cb.record_failure(sid, t0), None);
        assert_eq!(cb.record_failure(sid, t0), None);
        assert_eq!(cb.record_failure(sid, t0), Some(CircuitStateKind::Open));

        let t1 = t0 + chrono::Duration::milliseconds(60);
        let (allowed, transition) = cb.can_execute_noting_transition(sid, t1);
        assert!(allowed);
        assert_eq!(transition, Some(CircuitStateKind::HalfOpen));
        // A second check after the transition already happened reports none.
        assert_eq!(cb.can_execute_noting_transition(sid, t1).1, None);

        assert_eq!(cb.record_success(sid, t1), None);
        assert_eq!(cb.record_success(sid, t1), Some(CircuitStateKind::Closed));
    }

    #[tokio::test]
    async fn execute_short_circuits_when_open() {
        let cb = CircuitBreaker::new();
        let sid = Uuid::now_v7();
        cb.set_policy(sid, policy());
        let now = Utc::now();
        for _ in 0..3 {
            cb.record_failure(sid, now);
        }

        let result: Result<(), Error> = cb.execute(sid, || async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
    }
}

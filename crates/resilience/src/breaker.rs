//! Three-state circuit breaker: closed → open → half-open.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

/// How many state transitions are retained for the audit trail.
const TRANSITION_HISTORY: usize = 10;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Successes in `half-open` that close the breaker.
    pub success_threshold: u32,
    /// Cooldown before an open breaker permits a probe.
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Point-in-time view of the breaker, serializable for admin surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Fast-fail: the breaker is open (or a half-open probe is in flight).
    #[error("circuit breaker is open, retry in {retry_after:?}")]
    Open { retry_after: Duration },

    /// The guarded call itself failed; already counted against the breaker.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    /// Half-open probes currently executing (limit 1).
    probes_in_flight: u32,
    transitions: VecDeque<Transition>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            next_attempt_at: None,
            probes_in_flight: 0,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
        }
    }

    fn transition(&mut self, to: BreakerState, at: DateTime<Utc>, reason: impl Into<String>) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        let reason = reason.into();
        tracing::info!(from = from.as_str(), to = to.as_str(), %reason, "circuit breaker transition");
        self.transitions.push_back(Transition { from, to, at, reason });
    }
}

/// Failure-isolation gate for a fragile external dependency.
///
/// All mutation is serialized behind one mutex; `execute` releases the lock
/// while the guarded call runs and reacquires it to record the outcome.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An open breaker whose cooldown has elapsed transitions to half-open
    /// here, so polling `can_execute` is enough to drive recovery probing.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.permit(&mut inner, now)
    }

    fn permit(&self, inner: &mut Inner, now: DateTime<Utc>) -> bool {
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let due = inner.next_attempt_at.is_some_and(|at| now >= at);
                if due {
                    inner.successes = 0;
                    inner.probes_in_flight = 0;
                    inner.transition(BreakerState::HalfOpen, now, "cooldown elapsed");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => inner.probes_in_flight == 0,
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.next_attempt_at = None;
                    inner.transition(BreakerState::Closed, now, "success threshold reached");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, error: &str) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        inner.failures += 1;
        inner.last_failure_at = Some(now);
        match inner.state {
            BreakerState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    self.open(&mut inner, now, format!("failure threshold reached: {error}"));
                }
            }
            BreakerState::HalfOpen => {
                self.open(&mut inner, now, format!("probe failed: {error}"));
            }
            BreakerState::Open => {}
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>, reason: String) {
        inner.successes = 0;
        inner.next_attempt_at =
            Some(now + chrono::Duration::from_std(self.config.timeout).unwrap_or_default());
        inner.transition(BreakerState::Open, now, reason);
    }

    /// Run `op` under the breaker.
    ///
    /// The permission check and outcome recording each hold the lock briefly;
    /// the call itself runs without it. In half-open, at most one probe is in
    /// flight at a time.
    pub async fn execute<T, E, Fut, Op>(&self, op: Op) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
        E: std::fmt::Display,
    {
        {
            let now = self.clock.now();
            let mut inner = self.lock();
            if !self.permit(&mut inner, now) {
                return Err(BreakerError::Open {
                    retry_after: self.retry_after(&inner, now),
                });
            }
            if inner.state == BreakerState::HalfOpen {
                inner.probes_in_flight += 1;
            }
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error.to_string());
                Err(BreakerError::Inner(error))
            }
        }
    }

    fn retry_after(&self, inner: &Inner, now: DateTime<Utc>) -> Duration {
        inner
            .next_attempt_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(self.config.timeout)
    }

    /// Admin: force the breaker closed and clear counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.failures = 0;
        inner.successes = 0;
        inner.probes_in_flight = 0;
        inner.next_attempt_at = None;
        inner.transition(BreakerState::Closed, now, "manual reset");
    }

    /// Admin: force the breaker open.
    pub fn trip(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.open(&mut inner, now, "manual trip".to_string());
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_at: inner.last_failure_at,
            next_attempt_at: inner.next_attempt_at,
            transitions: inner.transitions.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // All writes under this lock are single assignments; a poisoned
        // guard still holds consistent state.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

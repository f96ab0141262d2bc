//! Scaling policy: decides whether a task runs locally or remotely.
//!
//! The decision is a pure function of the task's complexity, a load
//! snapshot and the remote circuit breaker. Nothing random goes into it,
//! so identical inputs always give the same answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::core::Task;
use crate::orchestration::backend::{BackendHint, ExecutionOutcome, OutcomeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Local agents allowed before work spills to remote.
    pub local_capacity: usize,
    /// Tasks at or above this complexity prefer remote capacity.
    pub remote_complexity_threshold: f64,
    /// Number of recent remote outcomes the breaker looks at.
    pub breaker_window: usize,
    /// Error rate above which the breaker opens.
    pub breaker_error_threshold: f64,
    pub breaker_min_samples: usize,
    /// How long an open breaker waits before letting one trial call through.
    pub breaker_cooldown_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            local_capacity: 4,
            remote_complexity_threshold: 8.0,
            breaker_window: 20,
            breaker_error_threshold: 0.5,
            breaker_min_samples: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl ScalingConfig {
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Agents currently running on each backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub local_running: usize,
    pub remote_running: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; a single trial call may go remote.
    HalfOpen,
}

/// Sliding-window circuit breaker over remote outcomes.
///
/// Opens once the error rate over the window exceeds the threshold. After
/// the cooldown it lets one trial call through: a healthy one closes the
/// breaker and clears the window, a faulty one re-opens it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBreaker {
    window: usize,
    threshold: f64,
    min_samples: usize,
    cooldown: Duration,
    /// `true` for each failed invocation, newest last.
    outcomes: VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    on_trial: bool,
}

impl RemoteBreaker {
    pub fn new(window: usize, threshold: f64, min_samples: usize, cooldown: Duration) -> Self {
        Self {
            window: window.max(1),
            threshold,
            min_samples,
            cooldown,
            outcomes: VecDeque::new(),
            opened_at: None,
            on_trial: false,
        }
    }

    pub fn from_config(config: &ScalingConfig) -> Self {
        Self::new(
            config.breaker_window,
            config.breaker_error_threshold,
            config.breaker_min_samples,
            config.breaker_cooldown(),
        )
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> BreakerState {
        let Some(opened_at) = self.opened_at else {
            return BreakerState::Closed;
        };
        // A clock that went backwards keeps the breaker open.
        let cooled = now
            .signed_duration_since(opened_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= self.cooldown);
        if cooled {
            BreakerState::HalfOpen
        } else {
            BreakerState::Open
        }
    }

    /// Whether a task may be sent remote at `now`.
    pub fn allows_remote(&self, now: DateTime<Utc>) -> bool {
        match self.state_at(now) {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => !self.on_trial,
        }
    }

    /// A remote dispatch was made while half-open.
    pub fn begin_trial(&mut self, now: DateTime<Utc>) {
        if self.state_at(now) == BreakerState::HalfOpen {
            self.on_trial = true;
        }
    }

    /// The trial call ended without telling anything about the backend.
    pub fn abandon_trial(&mut self) {
        self.on_trial = false;
    }

    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        if self.state_at(now) == BreakerState::HalfOpen {
            self.on_trial = false;
            if success {
                self.outcomes.clear();
                self.opened_at = None;
            } else {
                self.opened_at = Some(now);
            }
            return;
        }
        if self.outcomes.len() == self.window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(!success);
        if self.opened_at.is_none() && self.tripped() {
            self.opened_at = Some(now);
        }
    }

    pub fn samples(&self) -> usize {
        self.outcomes.len()
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.outcomes.iter().filter(|failed| **failed).count();
        errors as f64 / self.outcomes.len() as f64
    }

    fn tripped(&self) -> bool {
        self.samples() >= self.min_samples && self.error_rate() > self.threshold
    }
}

/// Why a backend was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    RemoteUnavailable,
    BreakerOpen,
    LocalAtCapacity,
    HighComplexity,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub hint: BackendHint,
    pub reason: DecisionReason,
}

/// Pure decision rule. Order matters: availability, breaker, load, complexity.
pub fn decide(
    config: &ScalingConfig,
    remote_available: bool,
    breaker: &RemoteBreaker,
    complexity: f64,
    load: &LoadSnapshot,
    now: DateTime<Utc>,
) -> ScalingDecision {
    let (hint, reason) = if !remote_available {
        (BackendHint::Local, DecisionReason::RemoteUnavailable)
    } else if !breaker.allows_remote(now) {
        (BackendHint::Local, DecisionReason::BreakerOpen)
    } else if load.local_running >= config.local_capacity {
        (BackendHint::Remote, DecisionReason::LocalAtCapacity)
    } else if complexity >= config.remote_complexity_threshold {
        (BackendHint::Remote, DecisionReason::HighComplexity)
    } else {
        (BackendHint::Local, DecisionReason::Default)
    };
    ScalingDecision { hint, reason }
}

/// What a remote outcome says about the backend: `Some(true)` healthy,
/// `Some(false)` faulty, `None` nothing (cancelled).
fn backend_health(outcome: &ExecutionOutcome) -> Option<bool> {
    match outcome.status {
        OutcomeStatus::Succeeded => Some(true),
        OutcomeStatus::Cancelled => None,
        OutcomeStatus::Failed | OutcomeStatus::TimedOut => outcome
            .error
            .as_ref()
            .map(|failure| !failure.category.is_backend_fault()),
    }
}

/// Shared scaling engine used by the dispatcher.
#[derive(Debug)]
pub struct ScalingPolicy {
    config: ScalingConfig,
    remote_available: bool,
    breaker: Mutex<RemoteBreaker>,
}

impl ScalingPolicy {
    pub fn new(config: ScalingConfig, remote_available: bool) -> Self {
        let breaker = RemoteBreaker::from_config(&config);
        Self {
            config,
            remote_available,
            breaker: Mutex::new(breaker),
        }
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, RemoteBreaker> {
        self.breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current breaker state, for inspection and replay.
    pub fn breaker_snapshot(&self) -> RemoteBreaker {
        self.breaker().clone()
    }

    pub fn choose_backend(&self, task: &Task, load: &LoadSnapshot) -> ScalingDecision {
        self.choose_backend_at(task, load, Utc::now())
    }

    pub fn choose_backend_at(
        &self,
        task: &Task,
        load: &LoadSnapshot,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let mut breaker = self.breaker();
        let decision = decide(
            &self.config,
            self.remote_available,
            &breaker,
            task.complexity,
            load,
            now,
        );
        if decision.hint == BackendHint::Remote && breaker.state_at(now) == BreakerState::HalfOpen {
            breaker.begin_trial(now);
            tracing::info!(task = %task.id, "trying remote backend after cooldown");
        }
        tracing::debug!(
            task = %task.id,
            complexity = task.complexity,
            local_running = load.local_running,
            hint = %decision.hint,
            reason = ?decision.reason,
            "scaling decision"
        );
        decision
    }

    /// Feed a remote invocation result into the breaker.
    ///
    /// Only backend faults count as errors; a task that ran remotely and
    /// failed on its own still shows a healthy backend.
    pub fn record_remote_outcome(&self, outcome: &ExecutionOutcome) {
        self.record_remote_outcome_at(outcome, Utc::now());
    }

    pub fn record_remote_outcome_at(&self, outcome: &ExecutionOutcome, now: DateTime<Utc>) {
        let mut breaker = self.breaker();
        let Some(healthy) = backend_health(outcome) else {
            breaker.abandon_trial();
            return;
        };
        let before = breaker.state_at(now);
        breaker.record(healthy, now);
        let after = breaker.state_at(now);
        if before != after {
            match after {
                BreakerState::Open => tracing::warn!(
                    error_rate = breaker.error_rate(),
                    "remote circuit breaker opened, preferring local execution"
                ),
                BreakerState::Closed => tracing::info!("remote circuit breaker closed"),
                BreakerState::HalfOpen => {}
            }
        }
    }
}

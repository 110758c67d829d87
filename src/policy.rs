//! Restart policies.
//!
//! A policy classifies each exit of the monitored process and tells the
//! supervisor what to do next. Two policies exist and are never mixed:
//!
//! - [`CircuitBreaker`]: a run shorter than the uptime threshold is a crash.
//!   Too many crashes inside a sliding window open the circuit, which pauses
//!   restarts for a recovery interval and then closes again. Never gives up.
//! - [`ExponentialBackoff`]: a non-zero exit is a failure. Each failure doubles
//!   the restart delay up to a cap, and too many failures in a row stop the
//!   supervisor for good.

use crate::config::{PolicyKind, SupervisorConfig};
use crate::launcher::ExitReport;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

/// What the supervisor should do after an exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Restart after `delay`, sending `alert` first if present.
    Restart {
        delay: Duration,
        alert: Option<String>,
    },
    /// The circuit opened: alert, wait `cooldown`, then call [`RestartPolicy::close`].
    Open { cooldown: Duration, alert: String },
    /// Stop supervising permanently.
    GiveUp { alert: String },
}

pub trait RestartPolicy: Send {
    /// Classify an exit that happened at `now` (Unix seconds).
    fn on_exit(&mut self, report: &ExitReport, now: u64) -> Verdict;

    /// Called once the cooldown after [`Verdict::Open`] has elapsed.
    fn close(&mut self) {}

    fn state(&self) -> CircuitState {
        CircuitState::Closed
    }
}

/// Build the policy selected in `config`.
pub fn from_config(config: &SupervisorConfig) -> Box<dyn RestartPolicy> {
    match config.policy {
        PolicyKind::Circuit => Box::new(CircuitBreaker::from_config(config)),
        PolicyKind::Backoff => Box::new(ExponentialBackoff::from_config(config)),
    }
}

impl<P: RestartPolicy + ?Sized> RestartPolicy for Box<P> {
    fn on_exit(&mut self, report: &ExitReport, now: u64) -> Verdict {
        (**self).on_exit(report, now)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn state(&self) -> CircuitState {
        (**self).state()
    }
}

// ── Circuit breaker ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    uptime_threshold: Duration,
    failure_window: u64,
    failure_threshold: usize,
    restart_delay: Duration,
    recovery_wait: Duration,
    crashes: VecDeque<u64>,
    state: CircuitState,
}

impl CircuitBreaker {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            uptime_threshold: config.uptime_threshold,
            failure_window: config.failure_window.as_secs(),
            failure_threshold: config.failure_threshold.max(1),
            restart_delay: config.restart_delay,
            recovery_wait: config.recovery_wait,
            crashes: VecDeque::new(),
            state: CircuitState::Closed,
        }
    }

    /// Crash timestamps still inside the window as of the last evaluation.
    pub fn crash_history(&self) -> impl Iterator<Item = u64> + '_ {
        self.crashes.iter().copied()
    }

    /// Drop crashes more than `failure_window` seconds before `now`.
    fn prune(&mut self, now: u64) {
        let window = self.failure_window;
        self.crashes.retain(|&t| now.saturating_sub(t) <= window);
    }
}

impl RestartPolicy for CircuitBreaker {
    fn on_exit(&mut self, report: &ExitReport, now: u64) -> Verdict {
        if report.uptime >= self.uptime_threshold {
            if !self.crashes.is_empty() {
                tracing::info!(uptime = ?report.uptime, "stable run, clearing crash history");
            }
            self.crashes.clear();
            return Verdict::Restart {
                delay: self.restart_delay,
                alert: None,
            };
        }

        self.crashes.push_back(now);
        self.prune(now);
        let count = self.crashes.len();
        tracing::warn!(
            uptime = ?report.uptime,
            code = ?report.code,
            crashes = count,
            window_secs = self.failure_window,
            "monitored process crashed"
        );

        if count >= self.failure_threshold {
            self.state = CircuitState::Open;
            return Verdict::Open {
                cooldown: self.recovery_wait,
                alert: format!(
                    "Bot crashed {count} times in {}s. Pausing restarts for {}s.",
                    self.failure_window,
                    self.recovery_wait.as_secs()
                ),
            };
        }

        Verdict::Restart {
            delay: self.restart_delay,
            alert: None,
        }
    }

    fn close(&mut self) {
        self.crashes.clear();
        self.state = CircuitState::Closed;
    }

    fn state(&self) -> CircuitState {
        self.state
    }
}

// ── Exponential backoff ────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    failures: u32,
    max_retries: u32,
    alert_after: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            delay: config.initial_backoff,
            failures: 0,
            max_retries: config.max_retries,
            alert_after: config.alert_after,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

impl RestartPolicy for ExponentialBackoff {
    fn on_exit(&mut self, report: &ExitReport, _now: u64) -> Verdict {
        if report.success() {
            self.failures = 0;
            self.delay = self.initial;
            return Verdict::Restart {
                delay: self.initial,
                alert: None,
            };
        }

        self.failures += 1;
        tracing::warn!(code = ?report.code, failures = self.failures, "monitored process failed");

        if self.failures > self.max_retries {
            return Verdict::GiveUp {
                alert: format!(
                    "Bot failed {} times in a row. Giving up after {} retries.",
                    self.failures, self.max_retries
                ),
            };
        }

        let delay = self.delay;
        self.delay = self.delay.saturating_mul(2).min(self.max);
        let alert = (self.failures == self.alert_after).then(|| {
            format!(
                "Bot failed {} times in a row (last exit code {}). Retrying in {}s.",
                self.failures,
                report
                    .code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                delay.as_secs()
            )
        });
        Verdict::Restart { delay, alert }
    }
}

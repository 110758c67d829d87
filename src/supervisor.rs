//! The restart loop.
//!
//! Each iteration checks the liveness gate, runs the monitored process to
//! completion, checks the gate again and then asks the restart policy what to
//! do. The supervisor owns all mutable state; nothing here reads the
//! environment.

use crate::alert::Notifier;
use crate::clock::Clock;
use crate::launcher::Launcher;
use crate::liveness::SessionProbe;
use crate::policy::{RestartPolicy, Verdict};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why the supervisor stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The liveness gate reported no session left to serve.
    NoActiveSession,
    /// A termination signal arrived.
    Cancelled,
    /// The backoff policy ran out of retries.
    RetriesExhausted,
}

impl SupervisorExit {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::NoActiveSession | Self::Cancelled => 0,
            Self::RetriesExhausted => 1,
        }
    }
}

pub struct Supervisor<L, R, P, N, C> {
    launcher: L,
    probe: R,
    policy: P,
    notifier: N,
    clock: C,
    cancel: CancellationToken,
    restarts: u64,
}

impl<L, R, P, N, C> Supervisor<L, R, P, N, C>
where
    L: Launcher,
    R: SessionProbe,
    P: RestartPolicy,
    N: Notifier,
    C: Clock,
{
    pub fn new(
        launcher: L,
        probe: R,
        policy: P,
        notifier: N,
        clock: C,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            launcher,
            probe,
            policy,
            notifier,
            clock,
            cancel,
            restarts: 0,
        }
    }

    /// Restarts performed so far.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Supervise until there is nothing left to serve, a signal arrives, or
    /// the policy gives up.
    pub async fn run(&mut self) -> SupervisorExit {
        tracing::info!("supervisor started");
        loop {
            if !self.gate("before launch").await {
                return SupervisorExit::NoActiveSession;
            }
            if self.cancel.is_cancelled() {
                return SupervisorExit::Cancelled;
            }

            let report = self.launcher.spawn_and_wait(&self.cancel).await;
            if self.cancel.is_cancelled() {
                tracing::info!(code = ?report.code, "monitored process stopped for shutdown");
                return SupervisorExit::Cancelled;
            }
            let now = self.clock.now();
            tracing::info!(
                code = ?report.code,
                uptime_secs = report.uptime.as_secs(),
                restarts = self.restarts,
                "monitored process exited"
            );

            if !self.gate("after exit").await {
                return SupervisorExit::NoActiveSession;
            }

            match self.policy.on_exit(&report, now) {
                Verdict::Restart { delay, alert } => {
                    if let Some(alert) = alert {
                        self.alert(&alert).await;
                    }
                    tracing::info!(delay_secs = delay.as_secs(), "restarting after delay");
                    if !self.sleep(delay).await {
                        return SupervisorExit::Cancelled;
                    }
                }
                Verdict::Open { cooldown, alert } => {
                    tracing::error!(cooldown_secs = cooldown.as_secs(), "crash loop detected, circuit open");
                    self.alert(&alert).await;
                    if !self.sleep(cooldown).await {
                        return SupervisorExit::Cancelled;
                    }
                    if !self.gate("after cooldown").await {
                        return SupervisorExit::NoActiveSession;
                    }
                    self.policy.close();
                    tracing::info!("circuit closed, resuming restarts");
                }
                Verdict::GiveUp { alert } => {
                    tracing::error!(restarts = self.restarts, "retries exhausted, giving up");
                    self.alert(&alert).await;
                    return SupervisorExit::RetriesExhausted;
                }
            }

            self.restarts += 1;
        }
    }

    async fn gate(&self, point: &str) -> bool {
        let active = self.probe.has_active_session().await;
        if !active {
            tracing::info!(point, "no active session, shutting down");
        }
        active
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.clock.sleep(duration) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Dispatch an alert; an in-flight request is dropped on cancellation.
    async fn alert(&self, message: &str) {
        tokio::select! {
            _ = self.notifier.notify(message) => {}
            _ = self.cancel.cancelled() => {
                tracing::debug!("alert abandoned for shutdown");
            }
        }
    }
}

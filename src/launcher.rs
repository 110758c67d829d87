//! Spawning and waiting on the monitored process.

use std::future::Future;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and SIGKILL when the supervisor shuts down.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How one run of the monitored process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, or `None` if killed by a signal or never started.
    pub code: Option<i32>,
    pub uptime: Duration,
}

impl ExitReport {
    pub fn new(code: Option<i32>, uptime: Duration) -> Self {
        Self { code, uptime }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs the monitored process to completion.
pub trait Launcher {
    /// Start the process and wait for it to exit.
    ///
    /// When `cancel` fires the process must be stopped before returning.
    /// Failing to start is reported as an exit with no code and zero uptime.
    fn spawn_and_wait(
        &mut self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = ExitReport> + Send;
}

/// Launches a real command in its own process group.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    grace: Duration,
}

impl CommandLauncher {
    /// `argv[0]` is the program. Returns None for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            envs: Vec::new(),
            grace: DEFAULT_KILL_GRACE,
        })
    }

    /// Extra environment for the child, e.g. values from an env file.
    pub fn with_envs(mut self, envs: Vec<(String, String)>) -> Self {
        self.envs = envs;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn terminate(&self, child: &mut tokio::process::Child) -> Option<i32> {
        if let Some(pid) = child.id() {
            tracing::info!(pid, "stopping monitored process");
            // SAFETY: the child leads its own process group (process_group(0)),
            // so the negative PID reaches it and anything it spawned.
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::warn!(?e, "failed to wait on monitored process");
                None
            }
            Err(_) => {
                tracing::warn!(grace = ?self.grace, "monitored process ignored SIGTERM, killing");
                if let Some(pid) = child.id() {
                    // SAFETY: see above.
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
                let _ = child.kill().await;
                None
            }
        }
    }
}

impl Launcher for CommandLauncher {
    async fn spawn_and_wait(&mut self, cancel: &CancellationToken) -> ExitReport {
        let started = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(?e, program = %self.program, "failed to start monitored process");
                return ExitReport::new(None, started.elapsed());
            }
        };
        tracing::info!(pid = child.id(), program = %self.program, "monitored process started");

        let code = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!(?e, "failed to wait on monitored process");
                    None
                }
            },
            _ = cancel.cancelled() => self.terminate(&mut child).await,
        };

        ExitReport::new(code, started.elapsed())
    }
}

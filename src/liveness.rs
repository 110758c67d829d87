use crate::registry::SessionRegistry;
use std::future::Future;
use std::time::Duration;

const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether anything still needs the supervisor.
pub trait SessionProbe {
    fn has_active_session(&self) -> impl Future<Output = bool> + Send;
}

/// Live check against the host: a running tmux server with at least one
/// session, or at least one descriptor in the registry directory.
#[derive(Debug, Clone)]
pub struct HostSessionProbe {
    tmux_binary: String,
    registry: SessionRegistry,
}

impl HostSessionProbe {
    pub fn new(tmux_binary: impl Into<String>, registry: SessionRegistry) -> Self {
        Self {
            tmux_binary: tmux_binary.into(),
            registry,
        }
    }

    /// True if `tmux list-sessions` succeeds with non-empty output.
    ///
    /// tmux exits non-zero when no server is running, and a missing binary
    /// or a hung server both count as no sessions.
    pub async fn tmux_has_sessions(&self) -> bool {
        let output = tokio::time::timeout(
            TMUX_TIMEOUT,
            tokio::process::Command::new(&self.tmux_binary)
                .arg("list-sessions")
                .stdin(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match output {
            Ok(Ok(out)) => out.status.success() && !out.stdout.trim_ascii().is_empty(),
            Ok(Err(e)) => {
                tracing::trace!(?e, binary = %self.tmux_binary, "tmux not available");
                false
            }
            Err(_) => {
                tracing::warn!("tmux list-sessions timed out");
                false
            }
        }
    }
}

impl SessionProbe for HostSessionProbe {
    async fn has_active_session(&self) -> bool {
        if self.tmux_has_sessions().await {
            return true;
        }
        let count = self.registry.count();
        tracing::trace!(count, "registered sessions");
        count > 0
    }
}

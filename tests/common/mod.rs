#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

pub const EXIT_TIMEOUT: Duration = Duration::from_secs(15);

/// A throwaway state directory with its own config and env file.
pub struct TestHome {
    pub dir: tempfile::TempDir,
}

impl TestHome {
    pub fn new() -> Self {
        Self {
            dir: tempfile::TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn lock_file(&self) -> PathBuf {
        self.path().join("watchdog.pid")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.path().join("sessions")
    }

    /// Write `watchdog.toml`. Strays and the host's tmux are always disabled
    /// so tests never touch unrelated processes.
    pub fn write_config(&self, extra: &str) {
        let toml = format!(
            "[supervisor]\n\
             stray_process_name = \"\"\n\
             tmux_binary = \"/nonexistent/tmux\"\n\
             {extra}\n"
        );
        std::fs::write(self.path().join("watchdog.toml"), toml).unwrap();
    }

    /// `tgwatch` pointed at this home with a clean CT_* environment.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_tgwatch"));
        cmd.arg("--base-dir")
            .arg(self.path())
            .arg("--env-file")
            .arg(self.path().join(".env"))
            .env_remove("CT_HOME")
            .env_remove("CT_TELEGRAM_BOT_TOKEN")
            .env_remove("CT_ALERT_CHAT_IDS")
            .env_remove("CT_ALLOWED_USERS")
            .env_remove("CT_TELEGRAM_API_BASE")
            .env_remove("RUST_LOG");
        cmd
    }
}

/// Poll `child` until it exits or `timeout` passes.
pub fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> Option<std::process::ExitStatus> {
    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait failed") {
            return Some(status);
        }
        if start.elapsed() > timeout {
            child.kill().ok();
            child.wait().ok();
            return None;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Poll until `cond` holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    cond()
}

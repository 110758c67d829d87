//! Single-instance PID lock.
//!
//! The lock file holds one line: the PID of the supervisor that owns it.
//! A file naming a dead PID is stale and gets overwritten. The check is
//! read-then-write, so two supervisors started in the same instant can both
//! win; launches are human-triggered and rare enough for that to be fine.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("supervisor already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("lock file {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// RAII guard for the supervisor lock file.
///
/// The file is removed when the guard is dropped, which covers normal
/// returns, `?` propagation, cancellation of the owning future and panics.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    pid: u32,
}

impl PidLock {
    /// Take the lock at `path` for the current process.
    ///
    /// If `stray_process_name` is set, processes with exactly that name are
    /// killed first so a fresh supervisor does not run alongside a child left
    /// behind by an unclean shutdown.
    pub fn acquire(path: &Path, stray_process_name: Option<&str>) -> Result<Self, LockError> {
        let me = std::process::id();

        if let Some(pid) = read_owner(path) {
            if pid as u32 != me && pid_alive(pid) {
                return Err(LockError::AlreadyRunning { pid });
            }
            tracing::info!(pid, path = %path.display(), "removing stale lock");
        }

        if let Some(name) = stray_process_name {
            kill_strays(name);
        }

        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        std::fs::write(path, format!("{me}\n")).map_err(io_err)?;

        tracing::debug!(pid = me, path = %path.display(), "lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            pid: me,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        // Leave the file alone if someone else has since claimed it.
        match read_owner(&self.path) {
            Some(pid) if pid as u32 == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!(?e, path = %self.path.display(), "failed to remove lock file");
                } else {
                    tracing::debug!(path = %self.path.display(), "lock released");
                }
            }
            _ => {}
        }
    }
}

/// Parse the PID recorded in the lock file, if any.
pub fn read_owner(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

/// The PID of the live supervisor holding `path`, if there is one.
pub fn live_owner(path: &Path) -> Option<i32> {
    read_owner(path).filter(|pid| pid_alive(*pid))
}

/// Probe a PID with signal 0.
///
/// EPERM means the process exists but belongs to another user, which still
/// counts as alive.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with sig=0 never delivers a signal; it only checks existence.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Kill every process whose name is exactly `name`.
///
/// Best-effort: a missing `pkill` or no matching process is only logged.
pub fn kill_strays(name: &str) {
    let own_name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
    if own_name.as_deref() == Some(name) {
        tracing::warn!(name, "stray process name matches the supervisor itself, skipping cleanup");
        return;
    }

    match std::process::Command::new("pkill")
        .arg("-x")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {
            tracing::warn!(name, "killed stray processes from a previous run");
        }
        Ok(_) => {
            tracing::debug!(name, "no stray processes found");
        }
        Err(e) => {
            tracing::debug!(?e, "pkill unavailable, skipping stray cleanup");
        }
    }
}

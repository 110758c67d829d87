//! Session registry directory.
//!
//! One small JSON descriptor per active project session. The supervisor only
//! counts files here; the fields are for the bot.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub project: String,
    /// Multiplexer handle (pane or session id) the bot talks to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    pub cwd: PathBuf,
    /// Unix seconds.
    pub registered_at: u64,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid project name {0:?}")]
    InvalidProject(String),

    #[error("registry {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to encode descriptor: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Write (or replace) the descriptor for `desc.project`.
    pub fn register(&self, desc: &SessionDescriptor) -> Result<PathBuf, RegistryError> {
        let path = self.descriptor_path(&desc.project)?;
        let io_err = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(desc)?;
        std::fs::write(&path, json).map_err(io_err)?;
        tracing::info!(project = %desc.project, path = %path.display(), "session registered");
        Ok(path)
    }

    /// Remove the descriptor for `project`. Returns false if none existed.
    pub fn unregister(&self, project: &str) -> Result<bool, RegistryError> {
        let path = self.descriptor_path(project)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(project, "session unregistered");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    /// Number of descriptor files present. A missing directory counts as empty.
    pub fn count(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    /// Parse every readable descriptor, skipping malformed files.
    pub fn list(&self) -> Vec<SessionDescriptor> {
        let mut out: Vec<SessionDescriptor> = self
            .entries()
            .filter_map(|path| {
                let contents = std::fs::read_to_string(&path).ok()?;
                match serde_json::from_str(&contents) {
                    Ok(desc) => Some(desc),
                    Err(e) => {
                        tracing::debug!(?e, path = %path.display(), "skipping malformed descriptor");
                        None
                    }
                }
            })
            .collect();
        out.sort_by(|a, b| a.project.cmp(&b.project));
        out
    }

    fn entries(&self) -> impl Iterator<Item = PathBuf> {
        std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|entry| !entry.file_name().to_string_lossy().starts_with('.'))
            .map(|entry| entry.path())
    }

    fn descriptor_path(&self, project: &str) -> Result<PathBuf, RegistryError> {
        let valid = !project.is_empty()
            && project != "."
            && project != ".."
            && project
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(RegistryError::InvalidProject(project.to_string()));
        }
        Ok(self.dir.join(format!("{project}.json")))
    }
}

/// Current time as Unix seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

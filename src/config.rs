use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory under `$HOME` shared with the bot for its state.
pub const BASE_DIR_NAME: &str = ".claude-telegram";

/// Program launched when no command is configured.
pub const DEFAULT_COMMAND: &str = "claude-telegram";

/// Which restart policy drives the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Uptime-classified crashes feeding a two-state circuit breaker.
    #[default]
    Circuit,
    /// Exit-code-classified failures with exponential backoff and a retry ceiling.
    Backoff,
}

/// Top-level config file, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub supervisor: Option<SupervisorSection>,
}

/// `[supervisor]` table. Every field is optional and overrides the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSection {
    pub failure_window_secs: Option<u64>,
    pub failure_threshold: Option<usize>,
    pub restart_delay_secs: Option<u64>,
    pub recovery_wait_secs: Option<u64>,
    pub uptime_threshold_secs: Option<u64>,
    pub policy: Option<PolicyKind>,
    pub max_retries: Option<u32>,
    pub alert_after: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub lock_file: Option<PathBuf>,
    pub sessions_dir: Option<PathBuf>,
    pub command: Option<Vec<String>>,
    /// Exact process name to clean up before taking the lock. Empty disables.
    #[serde(alias = "stray_pattern")]
    pub stray_process_name: Option<String>,
    pub tmux_binary: Option<String>,
}

/// Fully resolved supervisor settings, built once at startup.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub failure_window: Duration,
    pub failure_threshold: usize,
    pub restart_delay: Duration,
    pub recovery_wait: Duration,
    pub uptime_threshold: Duration,
    pub policy: PolicyKind,
    pub max_retries: u32,
    pub alert_after: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub lock_file: PathBuf,
    pub sessions_dir: PathBuf,
    pub command: Vec<String>,
    pub stray_process_name: Option<String>,
    pub tmux_binary: String,
}

impl SupervisorConfig {
    /// Defaults with all paths rooted at `base`.
    pub fn with_base_dir(base: &Path) -> Self {
        Self {
            failure_window: Duration::from_secs(60),
            failure_threshold: 5,
            restart_delay: Duration::from_secs(5),
            recovery_wait: Duration::from_secs(120),
            uptime_threshold: Duration::from_secs(30),
            policy: PolicyKind::Circuit,
            max_retries: 5,
            alert_after: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            lock_file: base.join("watchdog.pid"),
            sessions_dir: base.join("sessions"),
            command: vec![DEFAULT_COMMAND.to_string()],
            stray_process_name: Some(DEFAULT_COMMAND.to_string()),
            tmux_binary: "tmux".to_string(),
        }
    }

    /// Overlay the values present in a `[supervisor]` table.
    pub fn apply(&mut self, section: SupervisorSection) {
        let secs = Duration::from_secs;
        if let Some(v) = section.failure_window_secs {
            self.failure_window = secs(v);
        }
        if let Some(v) = section.failure_threshold {
            self.failure_threshold = v.max(1);
        }
        if let Some(v) = section.restart_delay_secs {
            self.restart_delay = secs(v);
        }
        if let Some(v) = section.recovery_wait_secs {
            self.recovery_wait = secs(v);
        }
        if let Some(v) = section.uptime_threshold_secs {
            self.uptime_threshold = secs(v);
        }
        if let Some(v) = section.policy {
            self.policy = v;
        }
        if let Some(v) = section.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = section.alert_after {
            self.alert_after = v;
        }
        if let Some(v) = section.initial_backoff_secs {
            self.initial_backoff = secs(v);
        }
        if let Some(v) = section.max_backoff_secs {
            self.max_backoff = secs(v);
        }
        if let Some(v) = section.lock_file {
            self.lock_file = v;
        }
        if let Some(v) = section.sessions_dir {
            self.sessions_dir = v;
        }
        if let Some(v) = section.command {
            if !v.is_empty() {
                self.command = v;
            }
        }
        if let Some(v) = section.stray_process_name {
            self.stray_process_name = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = section.tmux_binary {
            self.tmux_binary = v;
        }
    }

    /// Defaults under `base`, overlaid with the TOML file at `path` if it exists.
    pub fn load(base: &Path, path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::with_base_dir(base);
        if let Some(file) = ConfigFile::load(path)? {
            if let Some(section) = file.supervisor {
                config.apply(section);
            }
        }
        Ok(config)
    }
}

impl ConfigFile {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::ReadFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let config: Self =
            toml::from_str(&contents).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Some(config))
    }
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", .path.display())]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to read env file {}: {source}", .path.display())]
    EnvFileFailed {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Default state directory: `$HOME/.claude-telegram`.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(BASE_DIR_NAME)
}

/// Variables read from a `KEY=VALUE` env file.
///
/// The file never overrides the process environment: lookups here are only
/// consulted after the real environment came up empty.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    /// Load `path`. A missing file yields an empty set.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::EnvFileFailed {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut vars = BTreeMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            vars.insert(key.to_string(), unquote(value.trim()).to_string());
        }
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Entries not already set in the process environment, for passing to
    /// the monitored child.
    pub fn missing_from_env(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .filter(|(k, _)| std::env::var_os(k).is_none())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Split a comma-separated recipient list, dropping blanks.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}). \
             It may contain tokens -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

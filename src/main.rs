//! tgwatch - watchdog for the chat bridge bot.
//!
//! ## Modes
//!
//! **Default** / `tgwatch run`: takes the host-wide lock and supervises the
//! bot until no terminal session is left, a termination signal arrives, or
//! (with the backoff policy) retries run out.
//!
//! `tgwatch register` / `tgwatch unregister` maintain the session registry
//! and start a supervisor in the background when none is running.

use clap::{Parser as ClapParser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use thiserror::Error;
use tgwatch::{
    alert::{self, TelegramNotifier},
    clock::SystemClock,
    config::{self, EnvFile, SupervisorConfig},
    launcher::CommandLauncher,
    liveness::HostSessionProbe,
    lock::{self, LockError, PidLock},
    policy,
    registry::{self, SessionDescriptor, SessionRegistry},
    shutdown,
    supervisor::Supervisor,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// tgwatch - watchdog for the chat bridge bot
///
/// Restarts the bot when it exits and opens a circuit breaker with a chat
/// alert when it keeps crashing.
#[derive(ClapParser, Debug)]
#[command(name = "tgwatch", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// State directory holding the lock file, session registry and config
    #[arg(long, env = "CT_HOME", global = true)]
    base_dir: Option<PathBuf>,

    /// TOML config file (default: <base-dir>/watchdog.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// KEY=VALUE file consulted for settings missing from the environment
    #[arg(long, default_value = ".env", global = true)]
    env_file: PathBuf,

    /// Telegram bot token used for alerts
    #[arg(long, env = "CT_TELEGRAM_BOT_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Comma-separated chat ids to alert (falls back to CT_ALLOWED_USERS)
    #[arg(long, env = "CT_ALERT_CHAT_IDS", global = true)]
    chat_ids: Option<String>,

    /// Base URL of the Telegram Bot API
    #[arg(long, env = "CT_TELEGRAM_API_BASE", global = true)]
    api_base: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the bot (the default)
    Run,

    /// Show whether a supervisor is running and which sessions are registered
    Status,

    /// Register a project session and make sure a supervisor is running
    Register {
        /// Project name, used as the descriptor file name
        #[arg(long)]
        project: String,

        /// Multiplexer pane or session handle for the bot to talk to
        #[arg(long)]
        handle: Option<String>,

        /// Working directory of the session (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Only write the descriptor; do not start a supervisor
        #[arg(long)]
        no_start: bool,
    },

    /// Remove a project session from the registry
    Unregister {
        /// Project name given at registration
        #[arg(long)]
        project: String,
    },
}

#[derive(Error, Debug)]
pub enum TgwatchError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("no command configured to supervise")]
    EmptyCommand,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Settings resolved from flags, the environment and the env file.
struct Context {
    base_dir: PathBuf,
    config_path: PathBuf,
    env_file: EnvFile,
}

impl Context {
    fn load(cli: &Cli, env_file: EnvFile) -> Self {
        let base_dir = cli
            .base_dir
            .clone()
            .or_else(|| env_file.get("CT_HOME").map(PathBuf::from))
            .unwrap_or_else(config::default_base_dir);
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| base_dir.join("watchdog.toml"));
        Self {
            base_dir,
            config_path,
            env_file,
        }
    }

    fn supervisor_config(&self) -> Result<SupervisorConfig, TgwatchError> {
        Ok(SupervisorConfig::load(&self.base_dir, &self.config_path)?)
    }

    /// Flag or process environment first, then the env file.
    fn setting(&self, value: &Option<String>, key: &str) -> Option<String> {
        value
            .clone()
            .or_else(|| self.env_file.get(key).map(str::to_string))
            .filter(|v| !v.trim().is_empty())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_file = match EnvFile::load(&cli.env_file) {
        Ok(env) => env,
        Err(e) => {
            eprintln!("tgwatch: {e}");
            EnvFile::default()
        }
    };
    init_tracing(&env_file);
    if !env_file.is_empty() {
        tracing::debug!(path = %cli.env_file.display(), vars = env_file.len(), "loaded env file");
    }
    let ctx = Context::load(&cli, env_file);

    let result = match &cli.command {
        None | Some(Commands::Run) => run_supervisor(&cli, &ctx).await,
        Some(Commands::Status) => run_status(&ctx),
        Some(Commands::Register {
            project,
            handle,
            cwd,
            no_start,
        }) => run_register(&cli, &ctx, project, handle.clone(), cwd.clone(), *no_start),
        Some(Commands::Unregister { project }) => run_unregister(&ctx, project),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "tgwatch failed");
            eprintln!("tgwatch: {e}");
            ExitCode::FAILURE
        }
    }
}

const DEFAULT_FILTER: &str = "tgwatch=info";

/// `RUST_LOG` wins; otherwise the bot's `CT_LOG_LEVEL` sets our level.
fn init_tracing(env_file: &EnvFile) {
    let directive = filter_directive(
        std::env::var("RUST_LOG").ok(),
        std::env::var("CT_LOG_LEVEL")
            .ok()
            .or_else(|| env_file.get("CT_LOG_LEVEL").map(str::to_string)),
    );
    let (filter, rejected) = match EnvFilter::try_new(&directive) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new(DEFAULT_FILTER), Some(e)),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    if let Some(e) = rejected {
        tracing::warn!(directive = %directive, error = %e, "invalid log filter, using {}", DEFAULT_FILTER);
    }
}

fn filter_directive(rust_log: Option<String>, ct_log_level: Option<String>) -> String {
    if let Some(filter) = rust_log.filter(|f| !f.trim().is_empty()) {
        return filter;
    }
    match ct_log_level {
        Some(level) => format!("tgwatch={}", tracing_level(&level)),
        None => DEFAULT_FILTER.to_string(),
    }
}

/// Map a Python `logging` level name onto a tracing level.
fn tracing_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "" | "notset" => "info".to_string(),
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        other => other.to_string(),
    }
}

// ── Supervisor ─────────────────────────────────────────────────────

async fn run_supervisor(cli: &Cli, ctx: &Context) -> Result<u8, TgwatchError> {
    let config = ctx.supervisor_config()?;
    let launcher = CommandLauncher::from_argv(&config.command)
        .ok_or(TgwatchError::EmptyCommand)?
        .with_envs(ctx.env_file.missing_from_env());

    let token = ctx.setting(&cli.token, "CT_TELEGRAM_BOT_TOKEN");
    let chat_ids = ctx
        .setting(&cli.chat_ids, "CT_ALERT_CHAT_IDS")
        .or_else(|| ctx.setting(&std::env::var("CT_ALLOWED_USERS").ok(), "CT_ALLOWED_USERS"))
        .unwrap_or_default();
    let api_base = ctx
        .setting(&cli.api_base, "CT_TELEGRAM_API_BASE")
        .unwrap_or_else(|| alert::DEFAULT_API_BASE.to_string());
    let notifier = TelegramNotifier::new(api_base, token, config::parse_recipients(&chat_ids))
        .with_label(alert::host_label());
    if !notifier.is_configured() {
        tracing::warn!("no bot token or recipients configured, alerts disabled");
    }

    // Handlers go in first so a signal never finds the lock held without them.
    let cancel = CancellationToken::new();
    let signals = shutdown::install(cancel.clone())?;

    let _lock = match PidLock::acquire(&config.lock_file, config.stray_process_name.as_deref()) {
        Ok(lock) => lock,
        Err(e) => {
            signals.abort();
            return match e {
                LockError::AlreadyRunning { pid } => {
                    tracing::info!(pid, "supervisor already running, exiting");
                    Ok(0)
                }
                e => Err(e.into()),
            };
        }
    };

    let probe = HostSessionProbe::new(
        config.tmux_binary.clone(),
        SessionRegistry::new(&config.sessions_dir),
    );
    tracing::info!(
        command = ?config.command,
        policy = ?config.policy,
        lock = %config.lock_file.display(),
        sessions = %config.sessions_dir.display(),
        "supervisor configured"
    );

    let mut supervisor = Supervisor::new(
        launcher,
        probe,
        policy::from_config(&config),
        notifier,
        SystemClock,
        cancel.clone(),
    );
    let exit = supervisor.run().await;

    cancel.cancel();
    let _ = signals.await;

    tracing::info!(?exit, restarts = supervisor.restarts(), "supervisor exiting");
    Ok(exit.exit_code() as u8)
}

// ── Registry subcommands ───────────────────────────────────────────

fn run_status(ctx: &Context) -> Result<u8, TgwatchError> {
    let config = ctx.supervisor_config()?;

    match lock::live_owner(&config.lock_file) {
        Some(pid) => println!("Supervisor running (pid {}).", pid),
        None => println!("Supervisor not running."),
    }

    let registry = SessionRegistry::new(&config.sessions_dir);
    let sessions = registry.list();
    if sessions.is_empty() {
        println!("No registered sessions.");
    } else {
        println!("{:<20} {:<12} {}", "PROJECT", "HANDLE", "CWD");
        for s in &sessions {
            println!(
                "{:<20} {:<12} {}",
                s.project,
                s.handle.as_deref().unwrap_or("-"),
                s.cwd.display()
            );
        }
    }
    Ok(0)
}

fn run_register(
    cli: &Cli,
    ctx: &Context,
    project: &str,
    handle: Option<String>,
    cwd: Option<PathBuf>,
    no_start: bool,
) -> Result<u8, TgwatchError> {
    let config = ctx.supervisor_config()?;
    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };

    let registry = SessionRegistry::new(&config.sessions_dir);
    registry.register(&SessionDescriptor {
        project: project.to_string(),
        handle,
        cwd,
        registered_at: registry::unix_now(),
    })?;
    println!("Session '{}' registered.", project);

    if no_start {
        return Ok(0);
    }
    match lock::live_owner(&config.lock_file) {
        Some(pid) => println!("Supervisor already running (pid {}).", pid),
        None => {
            let pid = spawn_supervisor_daemon(cli, &ctx.base_dir)?;
            println!("Supervisor started (pid {}).", pid);
        }
    }
    Ok(0)
}

fn run_unregister(ctx: &Context, project: &str) -> Result<u8, TgwatchError> {
    let config = ctx.supervisor_config()?;
    let registry = SessionRegistry::new(&config.sessions_dir);
    if registry.unregister(project)? {
        println!("Session '{}' unregistered.", project);
    } else {
        println!("Session '{}' was not registered.", project);
    }
    Ok(0)
}

/// Spawn `tgwatch run` as a background process.
///
/// Output is appended to `<base-dir>/watchdog.log`. The supervisor exits by
/// itself once the last session is gone.
fn spawn_supervisor_daemon(cli: &Cli, base_dir: &Path) -> Result<u32, TgwatchError> {
    let exe = std::env::current_exe()?;
    let mut cmd = std::process::Command::new(exe);
    cmd.arg("run").arg("--base-dir").arg(base_dir);
    if let Some(config) = &cli.config {
        cmd.arg("--config").arg(config);
    }
    cmd.arg("--env-file").arg(&cli.env_file);

    std::fs::create_dir_all(base_dir)?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(base_dir.join("watchdog.log"))?;
    cmd.stdin(std::process::Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);

    // New process group so the supervisor outlives the registering shell.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let child = cmd.spawn()?;
    tracing::debug!(pid = child.id(), "spawned supervisor daemon");
    Ok(child.id())
}

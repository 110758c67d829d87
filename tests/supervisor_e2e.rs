//! End-to-end tests for `tgwatch run`.
//!
//! These spawn the real binary against a temporary state directory. Sessions
//! come from the registry directory only; the host's tmux is never consulted.

mod common;

use common::{wait_until, wait_with_timeout, TestHome, EXIT_TIMEOUT};
use std::time::Duration;

fn register(home: &TestHome, project: &str) {
    let output = home
        .command()
        .args(["register", "--project", project, "--no-start"])
        .output()
        .expect("failed to run tgwatch register");
    assert!(
        output.status.success(),
        "register failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn unregister(home: &TestHome, project: &str) {
    let output = home
        .command()
        .args(["unregister", "--project", project])
        .output()
        .expect("failed to run tgwatch unregister");
    assert!(output.status.success());
}

fn count_lines(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

#[test]
fn test_run_without_sessions_exits_zero_without_launching() {
    let home = TestHome::new();
    let marker = home.path().join("launched");
    home.write_config(&format!(
        "command = [\"touch\", \"{}\"]",
        marker.display()
    ));

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert!(status.success(), "expected exit 0, got {:?}", status);
    assert!(!marker.exists(), "monitored command must not be launched");
    assert!(!home.lock_file().exists(), "lock should be released");
}

#[test]
fn test_run_exits_zero_when_another_supervisor_holds_lock() {
    let home = TestHome::new();
    let marker = home.path().join("launched");
    home.write_config(&format!(
        "command = [\"touch\", \"{}\"]",
        marker.display()
    ));
    register(&home, "alpha");

    let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::write(home.lock_file(), format!("{}\n", holder.id())).unwrap();

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert!(status.success());
    assert!(!marker.exists());
    let owner = std::fs::read_to_string(home.lock_file()).unwrap();
    assert_eq!(owner.trim(), holder.id().to_string(), "lock must be left alone");

    holder.kill().ok();
    holder.wait().ok();
}

#[test]
fn test_stale_lock_is_taken_over() {
    let home = TestHome::new();
    home.write_config("");
    std::fs::write(home.lock_file(), "999999999\n").unwrap();

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    // No sessions, so it exits right away, but only after owning the lock.
    assert!(status.success());
    assert!(!home.lock_file().exists());
}

#[test]
fn test_backoff_policy_exits_one_when_retries_run_out() {
    let home = TestHome::new();
    home.write_config(
        "command = [\"false\"]\n\
         policy = \"backoff\"\n\
         max_retries = 2\n\
         initial_backoff_secs = 0\n",
    );
    register(&home, "alpha");

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert_eq!(status.code(), Some(1));
    assert!(!home.lock_file().exists());
}

#[test]
fn test_sigterm_stops_supervisor_and_child() {
    let home = TestHome::new();
    let pidfile = home.path().join("child.pid");
    home.write_config(&format!(
        "command = [\"sh\", \"-c\", \"echo $$ > {}; exec sleep 30\"]",
        pidfile.display()
    ));
    register(&home, "alpha");

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    assert!(
        wait_until(EXIT_TIMEOUT, || count_lines(&pidfile) > 0),
        "monitored command should start"
    );
    let bot_pid: i32 = std::fs::read_to_string(&pidfile)
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert!(status.success(), "expected exit 0 after SIGTERM, got {:?}", status);
    assert!(!home.lock_file().exists(), "lock should be released on signal");
    assert!(
        wait_until(Duration::from_secs(5), || !tgwatch::lock::pid_alive(bot_pid)),
        "monitored process should be stopped"
    );
}

#[test]
fn test_sigterm_as_soon_as_lock_appears_releases_it() {
    let home = TestHome::new();
    home.write_config("command = [\"sleep\", \"30\"]");
    register(&home, "alpha");

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    assert!(
        wait_until(EXIT_TIMEOUT, || home.lock_file().exists()),
        "supervisor should take the lock"
    );
    unsafe {
        libc::kill(child.id() as i32, libc::SIGTERM);
    }
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert!(status.success(), "expected a clean exit, got {:?}", status);
    assert!(!home.lock_file().exists(), "lock should be released on signal");
}

#[test]
fn test_exits_when_last_session_unregistered() {
    let home = TestHome::new();
    let runs = home.path().join("runs");
    home.write_config(&format!(
        "command = [\"sh\", \"-c\", \"echo run >> {}; sleep 1\"]\n\
         restart_delay_secs = 0\n\
         uptime_threshold_secs = 0\n",
        runs.display()
    ));
    register(&home, "alpha");

    let mut child = home.command().arg("run").spawn().expect("spawn tgwatch");
    assert!(wait_until(EXIT_TIMEOUT, || count_lines(&runs) >= 2), "should restart");

    unregister(&home, "alpha");
    let status = wait_with_timeout(&mut child, EXIT_TIMEOUT).expect("tgwatch should exit");

    assert!(status.success());
    assert!(!home.lock_file().exists());
}

// ── Circuit breaker with a fake Bot API ────────────────────────────

mod circuit {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Received = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn record(State(received): State<Received>, Json(body): Json<serde_json::Value>) {
        received.lock().push(body);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_crash_loop_opens_circuit_alerts_and_resumes() {
        let received: Received = Arc::default();
        let app = Router::new()
            .route("/botsecret/sendMessage", post(record))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let home = TestHome::new();
        let runs = home.path().join("runs");
        home.write_config(&format!(
            "command = [\"sh\", \"-c\", \"echo run >> {}; exit 1\"]\n\
             failure_threshold = 2\n\
             restart_delay_secs = 0\n\
             recovery_wait_secs = 1\n",
            runs.display()
        ));
        register(&home, "alpha");

        let mut child = home
            .command()
            .arg("run")
            .env("CT_TELEGRAM_BOT_TOKEN", "secret")
            .env("CT_ALERT_CHAT_IDS", "42")
            .env("CT_TELEGRAM_API_BASE", format!("http://{}", addr))
            .spawn()
            .expect("spawn tgwatch");

        // Two crashes open the circuit; a third run proves it closed again.
        let resumed = tokio::task::spawn_blocking({
            let runs = runs.clone();
            move || wait_until(EXIT_TIMEOUT, || count_lines(&runs) >= 3)
        })
        .await
        .unwrap();
        assert!(resumed, "supervisor should resume after the cooldown");

        unregister(&home, "alpha");
        let status = tokio::task::spawn_blocking(move || wait_with_timeout(&mut child, EXIT_TIMEOUT))
            .await
            .unwrap()
            .expect("tgwatch should exit");
        assert!(status.success());

        let bodies = received.lock();
        assert!(!bodies.is_empty(), "an alert should have been sent");
        assert_eq!(bodies[0]["chat_id"], "42");
        let text = bodies[0]["text"].as_str().unwrap();
        assert!(text.contains("crashed 2 times"), "{}", text);
    }
}

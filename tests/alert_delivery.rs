//! Integration tests for alert delivery against a fake Bot API.
//!
//! A local axum server stands in for `api.telegram.org` and records every
//! `sendMessage` body it receives.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tgwatch::alert::{Notifier, TelegramNotifier};
use tokio::net::TcpListener;

type Received = Arc<Mutex<Vec<serde_json::Value>>>;

async fn record(
    State(received): State<Received>,
    Json(body): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    received.lock().push(body);
    Json(serde_json::json!({"ok": true}))
}

async fn reject(State(received): State<Received>, Json(body): Json<serde_json::Value>) -> StatusCode {
    received.lock().push(body);
    StatusCode::BAD_REQUEST
}

async fn start_fake_api(token: &str, fail: bool) -> (SocketAddr, Received) {
    let received: Received = Arc::default();
    let path = format!("/bot{}/sendMessage", token);
    let app = if fail {
        Router::new().route(&path, post(reject))
    } else {
        Router::new().route(&path, post(record))
    }
    .with_state(received.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    (addr, received)
}

#[tokio::test]
async fn test_alert_posts_once_per_recipient() {
    let (addr, received) = start_fake_api("123-abc", false).await;
    let notifier = TelegramNotifier::new(
        format!("http://{}", addr),
        Some("123-abc".into()),
        vec!["111".into(), "222".into()],
    )
    .with_label("tgwatch@test");

    notifier.notify("Bot crashed 5 times in 60s.").await;

    let bodies = received.lock();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["chat_id"], "111");
    assert_eq!(bodies[1]["chat_id"], "222");
    assert_eq!(bodies[0]["text"], "[tgwatch@test] Bot crashed 5 times in 60s.");
}

#[tokio::test]
async fn test_send_one_reports_api_errors() {
    let (addr, received) = start_fake_api("tok", true).await;
    let notifier = TelegramNotifier::new(format!("http://{}/", addr), Some("tok".into()), vec!["1".into()]);

    let err = notifier.send_one("1", "hello").await.unwrap_err();
    assert!(err.to_string().contains("400"), "{}", err);

    // notify swallows the same failure.
    notifier.notify("hello").await;
    assert_eq!(received.lock().len(), 2);
}

#[tokio::test]
async fn test_missing_token_sends_nothing() {
    let (addr, received) = start_fake_api("tok", false).await;
    let notifier = TelegramNotifier::new(format!("http://{}", addr), None, vec!["1".into()]);

    notifier.notify("hello").await;
    assert!(received.lock().is_empty());
}

#[tokio::test]
async fn test_wrong_token_is_swallowed() {
    let (addr, received) = start_fake_api("right", false).await;
    let notifier = TelegramNotifier::new(format!("http://{}", addr), Some("wrong".into()), vec!["1".into()]);

    // 404 from the fake API; must not panic or hang.
    tokio::time::timeout(Duration::from_secs(5), notifier.notify("hello"))
        .await
        .expect("notify should finish");
    assert!(received.lock().is_empty());
}

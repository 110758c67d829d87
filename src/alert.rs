//! Best-effort alerts through the Telegram Bot API.
//!
//! Nothing here may affect the restart loop: every failure is logged and
//! dropped.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages longer than this.
pub const TG_MAX_LEN: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TRUNCATED_SUFFIX: &str = "\n\n... (truncated)";

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("api returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Delivers operator alerts.
pub trait Notifier {
    /// Send `message` to every recipient. Never fails.
    fn notify(&self, message: &str) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    recipients: Vec<String>,
    label: String,
}

impl TelegramNotifier {
    /// An empty token or recipient list makes every `notify` a no-op.
    pub fn new(api_base: impl Into<String>, token: Option<String>, recipients: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let api_base: String = api_base.into();
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.unwrap_or_default().trim().to_string(),
            recipients,
            label: "tgwatch".to_string(),
        }
    }

    /// Prefix shown before every alert, e.g. `tgwatch@host`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.recipients.is_empty()
    }

    /// POST one `sendMessage` call.
    pub async fn send_one(&self, chat_id: &str, text: &str) -> Result<(), AlertError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": chat_id,
                "text": text,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AlertError::Status(status));
        }
        Ok(())
    }
}

impl Notifier for TelegramNotifier {
    async fn notify(&self, message: &str) {
        if !self.is_configured() {
            tracing::debug!("alerting not configured, dropping alert");
            return;
        }
        let text = truncate(&format!("[{}] {}", self.label, message));
        for chat_id in &self.recipients {
            match self.send_one(chat_id, &text).await {
                Ok(()) => tracing::info!(chat_id = %chat_id, "alert sent"),
                Err(e) => tracing::warn!(chat_id = %chat_id, error = %e, "alert delivery failed"),
            }
        }
    }
}

/// Shorten `text` to fit a Telegram message, keeping a margin for the suffix.
pub fn truncate(text: &str) -> String {
    let limit = TG_MAX_LEN - 100;
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str(TRUNCATED_SUFFIX);
    out
}

/// Default alert label: `tgwatch@<hostname>`.
pub fn host_label() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    format!("tgwatch@{host}")
}

//! Notification dispatcher port and Telegram implementation
//!
//! Delivery is best-effort: callers log failures and move on, they
//! never propagate them as business errors or roll back ledger state.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use tunnelbot_shared::{NotificationKind, TelegramConfig};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to the user's chat. `kind` is carried so
    /// implementations can route or format per message class.
    async fn notify(
        &self,
        chat_id: i64,
        kind: NotificationKind,
        text: &str,
    ) -> Result<(), NotifyError>;
}

/// Telegram Bot API `sendMessage` client.
pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        Ok(Self {
            http,
            base_url: format!("https://api.telegram.org/bot{}", config.bot_token),
        })
    }

    /// Test hook: point at a local stub instead of api.telegram.org.
    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self { http, base_url })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        chat_id: i64,
        kind: NotificationKind,
        text: &str,
    ) -> Result<(), NotifyError> {
        let url = format!("{}/sendMessage", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SendMessage { chat_id, text })
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Delivery(format!(
                "telegram returned {} for {}",
                response.status(),
                kind.as_str()
            )));
        }

        tracing::debug!(chat_id, kind = kind.as_str(), "notification delivered");
        Ok(())
    }
}

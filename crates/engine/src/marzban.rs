//! Marzban panel HTTP client
//!
//! Implements [`VpnPanel`] against the Marzban admin API. Auth is a
//! username/password login that returns a bearer token; the token is
//! cached and refreshed once on 401. Transient transport failures are
//! retried with a short exponential backoff before being surfaced as
//! `PanelError::Transient` for the reconciliation pass to pick up.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use tunnelbot_shared::MarzbanConfig;

use crate::panel::{AccountStatus, PanelError, VpnPanel};

const TRANSPORT_RETRIES: usize = 3;

pub struct MarzbanClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Serialize)]
struct CreateUserBody<'a> {
    username: &'a str,
    status: &'a str,
    proxies: serde_json::Value,
}

#[derive(Serialize)]
struct SetStatusBody<'a> {
    status: &'a str,
}

#[derive(Deserialize)]
struct UserResponse {
    status: String,
}

impl MarzbanClient {
    pub fn new(config: &MarzbanConfig) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PanelError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            token: RwLock::new(None),
        })
    }

    async fn login(&self) -> Result<String, PanelError> {
        let url = format!("{}/api/admin/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PanelError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PanelError::Rejected(format!(
                "panel login failed with {}",
                response.status()
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PanelError::Transient(e.to_string()))?;

        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn bearer(&self) -> Result<String, PanelError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        self.login().await
    }

    /// One authenticated request with a single re-login on 401 and
    /// backoff on transport failures.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, PanelError> {
        let url = format!("{}{}", self.base_url, path);
        let strategy = ExponentialBackoff::from_millis(200)
            .map(jitter)
            .take(TRANSPORT_RETRIES);

        let response = Retry::spawn(strategy, || async {
            let token = self.bearer().await?;
            let mut req = self.http.request(method.clone(), &url).bearer_auth(token);
            if let Some(ref json) = body {
                req = req.json(json);
            }
            req.send()
                .await
                .map_err(|e| PanelError::Transient(e.to_string()))
        })
        .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // Token expired: refresh once and replay.
            let token = self.login().await?;
            let mut req = self.http.request(method, &url).bearer_auth(token);
            if let Some(ref json) = body {
                req = req.json(json);
            }
            return req
                .send()
                .await
                .map_err(|e| PanelError::Transient(e.to_string()));
        }

        Ok(response)
    }
}

fn classify(status: StatusCode, context: &str) -> PanelError {
    match status {
        StatusCode::NOT_FOUND => PanelError::NotFound,
        StatusCode::CONFLICT => PanelError::Conflict,
        s if s.is_server_error() => PanelError::Transient(format!("{context}: {s}")),
        s => PanelError::Rejected(format!("{context}: {s}")),
    }
}

#[async_trait]
impl VpnPanel for MarzbanClient {
    async fn create_account(&self, username: &str) -> Result<(), PanelError> {
        let body = serde_json::to_value(CreateUserBody {
            username,
            status: "active",
            proxies: serde_json::json!({ "vless": {} }),
        })
        .map_err(|e| PanelError::Rejected(e.to_string()))?;

        let response = self.request(Method::POST, "/api/user", Some(body)).await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(classify(response.status(), "create account"))
    }

    async fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), PanelError> {
        let status = if enabled { "active" } else { "disabled" };
        let body = serde_json::to_value(SetStatusBody { status })
            .map_err(|e| PanelError::Rejected(e.to_string()))?;

        let response = self
            .request(Method::PUT, &format!("/api/user/{username}"), Some(body))
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(classify(response.status(), "set account status"))
    }

    async fn delete_account(&self, username: &str) -> Result<(), PanelError> {
        let response = self
            .request(Method::DELETE, &format!("/api/user/{username}"), None)
            .await?;
        if response.status().is_success() {
            return Ok(());
        }
        Err(classify(response.status(), "delete account"))
    }

    async fn status(&self, username: &str) -> Result<AccountStatus, PanelError> {
        let response = self
            .request(Method::GET, &format!("/api/user/{username}"), None)
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(AccountStatus::NotFound);
        }
        if !response.status().is_success() {
            return Err(classify(response.status(), "get account"));
        }

        let user: UserResponse = response
            .json()
            .await
            .map_err(|e| PanelError::Transient(e.to_string()))?;

        Ok(if user.status == "active" {
            AccountStatus::Enabled
        } else {
            AccountStatus::Disabled
        })
    }
}

//! Configuration loading
//!
//! Everything comes from environment variables (with `.env` support in
//! the binaries via dotenvy). Required variables fail fast at startup.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Whether a renewal before expiry stacks onto the remaining window or
/// resets it to a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenewalPolicy {
    #[default]
    Stack,
    Reset,
}

#[derive(Debug, Clone)]
pub struct MarzbanConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl MarzbanConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: required("MARZBAN_BASE_URL")?,
            username: required("MARZBAN_USERNAME")?,
            password: required("MARZBAN_PASSWORD")?,
            request_timeout: Duration::from_secs(parse_or(
                "MARZBAN_TIMEOUT_SECS",
                10,
            )?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub request_timeout: Duration,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: required("TELEGRAM_BOT_TOKEN")?,
            request_timeout: Duration::from_secs(parse_or(
                "TELEGRAM_TIMEOUT_SECS",
                10,
            )?),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub bind_address: String,
    pub marzban: MarzbanConfig,
    pub telegram: TelegramConfig,
    /// Secret mixed into panel username derivation so usernames are not
    /// guessable from Telegram ids.
    pub username_salt: String,
    pub renewal_policy: RenewalPolicy,
    pub trial_days: i64,
    pub referral_bonus_days: i64,
    pub expiry_warning_hours: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let renewal_policy = match std::env::var("RENEWAL_POLICY").ok().as_deref() {
            None | Some("stack") => RenewalPolicy::Stack,
            Some("reset") => RenewalPolicy::Reset,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "RENEWAL_POLICY",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            marzban: MarzbanConfig::from_env()?,
            telegram: TelegramConfig::from_env()?,
            username_salt: required("PANEL_USERNAME_SALT")?,
            renewal_policy,
            trial_days: parse_or("TRIAL_DAYS", 3)?,
            referral_bonus_days: parse_or("REFERRAL_BONUS_DAYS", 7)?,
            expiry_warning_hours: parse_or("EXPIRY_WARNING_HOURS", 24)?,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::Missing(var))
}

fn parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var,
            value: raw.clone(),
        }),
    }
}

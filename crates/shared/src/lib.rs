//! Shared domain types for the tunnelbot workspace
//!
//! Holds the ledger entity types, the error taxonomy, configuration
//! loading and the clock port. No business logic lives here.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use clock::{Clock, SystemClock};
pub use db::{create_pool, run_migrations};
pub use config::{AppConfig, ConfigError, MarzbanConfig, RenewalPolicy, TelegramConfig};
pub use error::{EngineError, EngineResult};
pub use models::{
    Notification, NotificationKind, Payment, PaymentStatus, Plan, PromoCode, ProvisioningRetry,
    Referral, ReferralLink, Subscription, User, VpnConnection,
};

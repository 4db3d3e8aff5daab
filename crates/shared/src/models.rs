//! Ledger entity types
//!
//! The relational store is the single source of truth for all of these.
//! The VPN panel's account state is a derived projection of
//! `VpnConnection::is_active` and is reconciled against it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A bot user, keyed by their Telegram identity.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub telegram_id: i64,
    pub first_name: String,
    pub username: Option<String>,
    pub is_blocked: bool,
    /// Flips false -> true exactly once, when the trial is granted.
    pub has_trial: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Catalog entry. Never deleted once referenced, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub duration_days: i32,
    pub is_active: bool,
}

/// A time-boxed access window.
///
/// The user's visible access window is `max(ends_at)` among their
/// active rows; that row is the "current" subscription for
/// provisioning purposes.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    /// None for trial and referral-bonus subscriptions.
    pub plan_id: Option<Uuid>,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl Subscription {
    /// Still inside the paid-for window at `now`.
    pub fn is_current(&self, now: OffsetDateTime) -> bool {
        self.is_active && self.ends_at > now
    }
}

/// Status transitions are monotonic: pending -> completed,
/// pending -> failed, completed -> refunded. Completed is never
/// re-completed; that is the saga's idempotency boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "completed" => Some(PaymentStatus::Completed),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub method: String,
    pub description: String,
    pub status: PaymentStatus,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Ledger record of one panel account.
///
/// (user, panel_username) is 1:1. A disabled connection keeps its row
/// so the panel username is reused on re-enable instead of orphaned.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct VpnConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub panel_username: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Immutable referrer -> referee link, at most one per referee.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Referral {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referee_id: Uuid,
    pub created_at: OffsetDateTime,
}

/// Per-user invite code.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralLink {
    pub id: Uuid,
    pub user_id: Uuid,
    pub code: String,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

/// Operator-issued bonus code granting extra subscription days.
///
/// `used_count` only grows; redemption happens under a row lock so the
/// `usage_limit` bound holds under concurrent redemptions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromoCode {
    pub id: Uuid,
    pub code: String,
    pub bonus_days: i32,
    pub usage_limit: i32,
    pub used_count: i32,
    pub expires_at: Option<OffsetDateTime>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PaymentSuccess,
    ProvisioningDelayed,
    ProvisioningFailed,
    TrialStarted,
    ExpiryWarning,
    SubscriptionExpired,
    ReferralCredit,
    PromoRedeemed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentSuccess => "payment_success",
            NotificationKind::ProvisioningDelayed => "provisioning_delayed",
            NotificationKind::ProvisioningFailed => "provisioning_failed",
            NotificationKind::TrialStarted => "trial_started",
            NotificationKind::ExpiryWarning => "expiry_warning",
            NotificationKind::SubscriptionExpired => "subscription_expired",
            NotificationKind::ReferralCredit => "referral_credit",
            NotificationKind::PromoRedeemed => "promo_redeemed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_success" => Some(NotificationKind::PaymentSuccess),
            "provisioning_delayed" => Some(NotificationKind::ProvisioningDelayed),
            "provisioning_failed" => Some(NotificationKind::ProvisioningFailed),
            "trial_started" => Some(NotificationKind::TrialStarted),
            "expiry_warning" => Some(NotificationKind::ExpiryWarning),
            "subscription_expired" => Some(NotificationKind::SubscriptionExpired),
            "referral_credit" => Some(NotificationKind::ReferralCredit),
            "promo_redeemed" => Some(NotificationKind::PromoRedeemed),
            _ => None,
        }
    }
}

/// Append-only in-app message history. `dedupe_key` is the idempotency
/// marker for at-most-once notifications (expiry warnings, referral
/// credits); it is not a delivery-retry queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    pub dedupe_key: Option<String>,
    pub is_read: bool,
    pub created_at: OffsetDateTime,
}

/// One row per user whose panel provisioning failed after a committed
/// payment. Drained by the scheduler's reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProvisioningRetry {
    pub user_id: Uuid,
    pub attempts: i32,
    pub last_error: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

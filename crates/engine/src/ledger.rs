//! Ledger port: unit of work + repository contracts
//!
//! `Ledger::begin` opens one database transaction and hands back a
//! [`LedgerTx`]; every repository call on that object joins the same
//! transaction. `commit` consumes the transaction, dropping it rolls
//! back. There are no nested transactions — an orchestrator that is
//! invoked mid-saga receives the caller's `LedgerTx` and works inside
//! it.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use tunnelbot_shared::{
    EngineResult, Notification, NotificationKind, Payment, PaymentStatus, Plan, PromoCode,
    ProvisioningRetry, Referral, ReferralLink, Subscription, User, VpnConnection,
};

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub method: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub panel_username: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewPromoCode {
    pub code: String,
    pub bonus_days: i32,
    pub usage_limit: i32,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    /// When set, `insert_notification` is a no-op if a row with the
    /// same key already exists. This is the at-most-once guard for
    /// expiry warnings and referral credits.
    pub dedupe_key: Option<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin(&self) -> EngineResult<Box<dyn LedgerTx>>;
}

/// One open ledger transaction.
///
/// `*_for_update` methods take a row-level lock (`SELECT ... FOR
/// UPDATE` in the Postgres implementation) so concurrent sagas on the
/// same row serialize.
#[async_trait]
pub trait LedgerTx: Send {
    // -- users --
    async fn user_by_id(&mut self, id: Uuid) -> EngineResult<Option<User>>;
    /// Locked read. First-time provisioning has no connection row to
    /// lock on, so concurrent enables serialize on the user row instead.
    async fn user_for_update(&mut self, id: Uuid) -> EngineResult<Option<User>>;
    async fn mark_trial_used(&mut self, user_id: Uuid) -> EngineResult<()>;

    // -- plans --
    async fn plan_by_id(&mut self, id: Uuid) -> EngineResult<Option<Plan>>;

    // -- payments --
    async fn payment_for_update(&mut self, id: Uuid) -> EngineResult<Option<Payment>>;
    async fn insert_payment(&mut self, payment: NewPayment) -> EngineResult<Payment>;
    async fn set_payment_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> EngineResult<()>;
    async fn completed_payment_count(&mut self, user_id: Uuid) -> EngineResult<i64>;

    // -- subscriptions --
    /// The "current" subscription: latest `ends_at` among active rows.
    async fn current_subscription(&mut self, user_id: Uuid) -> EngineResult<Option<Subscription>>;
    async fn insert_subscription(&mut self, sub: NewSubscription) -> EngineResult<Subscription>;
    async fn set_subscription_end(&mut self, id: Uuid, ends_at: OffsetDateTime)
        -> EngineResult<()>;
    async fn deactivate_subscription(&mut self, id: Uuid) -> EngineResult<()>;
    /// Active rows whose `ends_at` has passed.
    async fn subscriptions_expired(
        &mut self,
        now: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>>;
    /// Active rows with `now < ends_at <= until`.
    async fn subscriptions_expiring(
        &mut self,
        now: OffsetDateTime,
        until: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>>;

    // -- vpn connections --
    /// Errors with `ConsistencyViolation` if more than one row exists
    /// for the user.
    async fn connection_for_update(&mut self, user_id: Uuid)
        -> EngineResult<Option<VpnConnection>>;
    async fn connection_by_panel_username(
        &mut self,
        username: &str,
    ) -> EngineResult<Option<VpnConnection>>;
    async fn insert_connection(&mut self, conn: NewConnection) -> EngineResult<VpnConnection>;
    async fn set_connection_active(&mut self, id: Uuid, active: bool) -> EngineResult<()>;

    // -- referrals --
    async fn referral_by_referee(&mut self, referee_id: Uuid) -> EngineResult<Option<Referral>>;
    async fn insert_referral(
        &mut self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> EngineResult<Referral>;
    async fn referral_link_by_code(&mut self, code: &str) -> EngineResult<Option<ReferralLink>>;
    async fn referral_link_by_user(&mut self, user_id: Uuid)
        -> EngineResult<Option<ReferralLink>>;
    async fn insert_referral_link(&mut self, user_id: Uuid, code: &str)
        -> EngineResult<ReferralLink>;

    // -- promo codes --
    async fn insert_promo_code(&mut self, promo: NewPromoCode) -> EngineResult<PromoCode>;
    /// Locked read by normalized code, so concurrent redemptions
    /// serialize on the usage counter.
    async fn promo_for_update(&mut self, code: &str) -> EngineResult<Option<PromoCode>>;
    async fn increment_promo_uses(&mut self, id: Uuid) -> EngineResult<()>;

    // -- notifications --
    async fn notification_exists(&mut self, dedupe_key: &str) -> EngineResult<bool>;
    async fn insert_notification(
        &mut self,
        notification: NewNotification,
    ) -> EngineResult<Notification>;
    async fn unread_notifications(&mut self, user_id: Uuid) -> EngineResult<Vec<Notification>>;
    async fn mark_notification_read(&mut self, id: Uuid) -> EngineResult<()>;

    // -- provisioning retries --
    /// Flag a user for the scheduler's reconciliation pass. Inserting
    /// an already-flagged user only refreshes `last_error`.
    async fn flag_provisioning_retry(&mut self, user_id: Uuid, error: &str) -> EngineResult<()>;
    async fn provisioning_retries(&mut self, limit: i64) -> EngineResult<Vec<ProvisioningRetry>>;
    /// Returns the attempt count after the bump.
    async fn bump_provisioning_attempts(
        &mut self,
        user_id: Uuid,
        error: &str,
    ) -> EngineResult<i32>;
    async fn clear_provisioning_retry(&mut self, user_id: Uuid) -> EngineResult<()>;

    async fn commit(self: Box<Self>) -> EngineResult<()>;
}

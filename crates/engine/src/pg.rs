//! Postgres ledger
//!
//! `sqlx`-backed implementation of the [`Ledger`] unit of work. Each
//! `begin` checks a transaction out of the pool; dropping the
//! [`PgLedgerTx`] without committing rolls back.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use tunnelbot_shared::{
    EngineError, EngineResult, Notification, NotificationKind, Payment, PaymentStatus, Plan,
    PromoCode, ProvisioningRetry, Referral, ReferralLink, Subscription, User, VpnConnection,
};

use crate::ledger::{
    Ledger, LedgerTx, NewConnection, NewNotification, NewPayment, NewPromoCode, NewSubscription,
};

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> EngineResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

/// Payments and notifications store their enums as text; decode
/// failures mean the ledger holds a value this binary doesn't know.
#[derive(sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: Uuid,
    amount_cents: i64,
    currency: String,
    method: String,
    description: String,
    status: String,
    created_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
}

impl PaymentRow {
    fn into_payment(self) -> EngineResult<Payment> {
        let status = PaymentStatus::parse(&self.status).ok_or_else(|| {
            EngineError::ConsistencyViolation(format!(
                "payment {} has unknown status {:?}",
                self.id, self.status
            ))
        })?;
        Ok(Payment {
            id: self.id,
            user_id: self.user_id,
            plan_id: self.plan_id,
            amount_cents: self.amount_cents,
            currency: self.currency,
            method: self.method,
            description: self.description,
            status,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    user_id: Uuid,
    kind: String,
    message: String,
    dedupe_key: Option<String>,
    is_read: bool,
    created_at: OffsetDateTime,
}

impl NotificationRow {
    fn into_notification(self) -> EngineResult<Notification> {
        let kind = NotificationKind::parse(&self.kind).ok_or_else(|| {
            EngineError::ConsistencyViolation(format!(
                "notification {} has unknown kind {:?}",
                self.id, self.kind
            ))
        })?;
        Ok(Notification {
            id: self.id,
            user_id: self.user_id,
            kind,
            message: self.message,
            dedupe_key: self.dedupe_key,
            is_read: self.is_read,
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn user_by_id(&mut self, id: Uuid) -> EngineResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn user_for_update(&mut self, id: Uuid) -> EngineResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(user)
    }

    async fn mark_trial_used(&mut self, user_id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE users SET has_trial = TRUE, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn plan_by_id(&mut self, id: Uuid) -> EngineResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(plan)
    }

    async fn payment_for_update(&mut self, id: Uuid) -> EngineResult<Option<Payment>> {
        let row =
            sqlx::query_as::<_, PaymentRow>("SELECT * FROM payments WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *self.tx)
                .await?;
        row.map(PaymentRow::into_payment).transpose()
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> EngineResult<Payment> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            INSERT INTO payments (id, user_id, plan_id, amount_cents, currency, method, description, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(payment.user_id)
        .bind(payment.plan_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(&payment.method)
        .bind(&payment.description)
        .fetch_one(&mut *self.tx)
        .await?;
        row.into_payment()
    }

    async fn set_payment_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE payments SET status = $2, completed_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(completed_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn completed_payment_count(&mut self, user_id: Uuid) -> EngineResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payments WHERE user_id = $1 AND status = 'completed'",
        )
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count)
    }

    async fn current_subscription(&mut self, user_id: Uuid) -> EngineResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1 AND is_active = TRUE
            ORDER BY ends_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(sub)
    }

    async fn insert_subscription(&mut self, sub: NewSubscription) -> EngineResult<Subscription> {
        let sub = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (id, user_id, plan_id, starts_at, ends_at, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sub.user_id)
        .bind(sub.plan_id)
        .bind(sub.starts_at)
        .bind(sub.ends_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(sub)
    }

    async fn set_subscription_end(
        &mut self,
        id: Uuid,
        ends_at: OffsetDateTime,
    ) -> EngineResult<()> {
        sqlx::query("UPDATE subscriptions SET ends_at = $2 WHERE id = $1")
            .bind(id)
            .bind(ends_at)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn deactivate_subscription(&mut self, id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE subscriptions SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn subscriptions_expired(
        &mut self,
        now: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE is_active = TRUE AND ends_at <= $1",
        )
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(subs)
    }

    async fn subscriptions_expiring(
        &mut self,
        now: OffsetDateTime,
        until: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE is_active = TRUE AND ends_at > $1 AND ends_at <= $2
            ORDER BY ends_at
            "#,
        )
        .bind(now)
        .bind(until)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(subs)
    }

    async fn connection_for_update(
        &mut self,
        user_id: Uuid,
    ) -> EngineResult<Option<VpnConnection>> {
        let mut rows = sqlx::query_as::<_, VpnConnection>(
            "SELECT * FROM vpn_connections WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        if rows.len() > 1 {
            return Err(EngineError::ConsistencyViolation(format!(
                "user {user_id} has {} vpn connections, expected at most one",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }

    async fn connection_by_panel_username(
        &mut self,
        username: &str,
    ) -> EngineResult<Option<VpnConnection>> {
        let conn = sqlx::query_as::<_, VpnConnection>(
            "SELECT * FROM vpn_connections WHERE panel_username = $1",
        )
        .bind(username)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(conn)
    }

    async fn insert_connection(&mut self, conn: NewConnection) -> EngineResult<VpnConnection> {
        let conn = sqlx::query_as::<_, VpnConnection>(
            r#"
            INSERT INTO vpn_connections (id, user_id, panel_username, name, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(conn.user_id)
        .bind(&conn.panel_username)
        .bind(&conn.name)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(conn)
    }

    async fn set_connection_active(&mut self, id: Uuid, active: bool) -> EngineResult<()> {
        sqlx::query(
            "UPDATE vpn_connections SET is_active = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(active)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn referral_by_referee(&mut self, referee_id: Uuid) -> EngineResult<Option<Referral>> {
        let referral =
            sqlx::query_as::<_, Referral>("SELECT * FROM referrals WHERE referee_id = $1")
                .bind(referee_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(referral)
    }

    async fn insert_referral(
        &mut self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> EngineResult<Referral> {
        let referral = sqlx::query_as::<_, Referral>(
            r#"
            INSERT INTO referrals (id, referrer_id, referee_id)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(referrer_id)
        .bind(referee_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(referral)
    }

    async fn referral_link_by_code(&mut self, code: &str) -> EngineResult<Option<ReferralLink>> {
        let link = sqlx::query_as::<_, ReferralLink>(
            "SELECT * FROM referral_links WHERE code = $1 AND is_active = TRUE",
        )
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(link)
    }

    async fn referral_link_by_user(
        &mut self,
        user_id: Uuid,
    ) -> EngineResult<Option<ReferralLink>> {
        let link =
            sqlx::query_as::<_, ReferralLink>("SELECT * FROM referral_links WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(link)
    }

    async fn insert_referral_link(
        &mut self,
        user_id: Uuid,
        code: &str,
    ) -> EngineResult<ReferralLink> {
        let link = sqlx::query_as::<_, ReferralLink>(
            r#"
            INSERT INTO referral_links (id, user_id, code, is_active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(code)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(link)
    }

    async fn insert_promo_code(&mut self, promo: NewPromoCode) -> EngineResult<PromoCode> {
        let row = sqlx::query_as::<_, PromoCode>(
            r#"
            INSERT INTO promo_codes (id, code, bonus_days, usage_limit, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&promo.code)
        .bind(promo.bonus_days)
        .bind(promo.usage_limit)
        .bind(promo.expires_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row)
    }

    async fn promo_for_update(&mut self, code: &str) -> EngineResult<Option<PromoCode>> {
        let row =
            sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes WHERE code = $1 FOR UPDATE")
                .bind(code)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row)
    }

    async fn increment_promo_uses(&mut self, id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE promo_codes SET used_count = used_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn notification_exists(&mut self, dedupe_key: &str) -> EngineResult<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM notifications WHERE dedupe_key = $1)")
                .bind(dedupe_key)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(exists)
    }

    async fn insert_notification(
        &mut self,
        notification: NewNotification,
    ) -> EngineResult<Notification> {
        // The unique index on dedupe_key makes concurrent duplicate
        // markers a no-op instead of an error.
        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
            INSERT INTO notifications (id, user_id, kind, message, dedupe_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dedupe_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.message)
        .bind(&notification.dedupe_key)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => row.into_notification(),
            None => {
                // Lost the race: return the winner's row.
                let key = notification.dedupe_key.as_deref().unwrap_or_default();
                let row = sqlx::query_as::<_, NotificationRow>(
                    "SELECT * FROM notifications WHERE dedupe_key = $1",
                )
                .bind(key)
                .fetch_one(&mut *self.tx)
                .await?;
                row.into_notification()
            }
        }
    }

    async fn unread_notifications(&mut self, user_id: Uuid) -> EngineResult<Vec<Notification>> {
        let rows = sqlx::query_as::<_, NotificationRow>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1 AND is_read = FALSE
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.into_iter()
            .map(NotificationRow::into_notification)
            .collect()
    }

    async fn mark_notification_read(&mut self, id: Uuid) -> EngineResult<()> {
        sqlx::query("UPDATE notifications SET is_read = TRUE WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn flag_provisioning_retry(&mut self, user_id: Uuid, error: &str) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO provisioning_retries (user_id, attempts, last_error)
            VALUES ($1, 0, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET last_error = EXCLUDED.last_error, updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(error)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn provisioning_retries(&mut self, limit: i64) -> EngineResult<Vec<ProvisioningRetry>> {
        let retries = sqlx::query_as::<_, ProvisioningRetry>(
            "SELECT * FROM provisioning_retries ORDER BY updated_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(retries)
    }

    async fn bump_provisioning_attempts(
        &mut self,
        user_id: Uuid,
        error: &str,
    ) -> EngineResult<i32> {
        let (attempts,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO provisioning_retries (user_id, attempts, last_error)
            VALUES ($1, 1, $2)
            ON CONFLICT (user_id)
            DO UPDATE SET attempts = provisioning_retries.attempts + 1,
                          last_error = EXCLUDED.last_error,
                          updated_at = NOW()
            RETURNING attempts
            "#,
        )
        .bind(user_id)
        .bind(error)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(attempts)
    }

    async fn clear_provisioning_retry(&mut self, user_id: Uuid) -> EngineResult<()> {
        sqlx::query("DELETE FROM provisioning_retries WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

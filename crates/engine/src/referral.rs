//! Referral orchestrator
//!
//! Referral rows are immutable and unique per referee; the credit
//! itself is guarded by a deduplicated notification marker, so the
//! whole operation is idempotent under saga retries.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tunnelbot_shared::{
    EngineError, EngineResult, NotificationKind, Referral, ReferralLink, User,
};

use crate::ledger::{LedgerTx, NewNotification, NewSubscription};

/// Outcome of a credit, returned so the saga can dispatch the
/// referrer's message after its transaction commits.
#[derive(Debug, Clone)]
pub struct ReferralCredit {
    pub referrer: User,
    pub bonus_days: i64,
    pub new_end: OffsetDateTime,
}

pub struct ReferralOrchestrator {
    bonus_days: i64,
}

impl ReferralOrchestrator {
    pub fn new(bonus_days: i64) -> Self {
        Self { bonus_days }
    }

    /// Record that `referee` signed up through `referrer`'s link.
    pub async fn register_referral(
        &self,
        tx: &mut dyn LedgerTx,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> EngineResult<Referral> {
        if referrer_id == referee_id {
            return Err(EngineError::InvalidStateTransition {
                entity: "referral",
                actual: "self-referral".to_string(),
                expected: "distinct referrer and referee",
            });
        }
        tx.user_by_id(referrer_id)
            .await?
            .ok_or(EngineError::NotFound("referrer"))?;
        tx.user_by_id(referee_id)
            .await?
            .ok_or(EngineError::NotFound("referee"))?;
        if tx.referral_by_referee(referee_id).await?.is_some() {
            return Err(EngineError::InvalidStateTransition {
                entity: "referral",
                actual: "referee already referred".to_string(),
                expected: "no existing referral",
            });
        }
        tx.insert_referral(referrer_id, referee_id).await
    }

    /// Fetch or mint the user's invite link.
    pub async fn issue_link(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: Uuid,
    ) -> EngineResult<ReferralLink> {
        if let Some(link) = tx.referral_link_by_user(user_id).await? {
            return Ok(link);
        }
        let code = format!("ref_{}", &user_id.simple().to_string()[..10]);
        tx.insert_referral_link(user_id, &code).await
    }

    /// Credit the referrer on the referee's first completed payment.
    ///
    /// Called after the payment's status flip in the same transaction,
    /// so "first" means the completed count is exactly one. Applies at
    /// most once per referee via the notification dedupe key.
    pub async fn credit_if_eligible(
        &self,
        tx: &mut dyn LedgerTx,
        referee_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<Option<ReferralCredit>> {
        let Some(referral) = tx.referral_by_referee(referee_id).await? else {
            return Ok(None);
        };
        if tx.completed_payment_count(referee_id).await? != 1 {
            return Ok(None);
        }

        let dedupe_key = format!("referral_credit:{referee_id}");
        if tx.notification_exists(&dedupe_key).await? {
            return Ok(None);
        }

        let referrer = tx
            .user_by_id(referral.referrer_id)
            .await?
            .ok_or(EngineError::NotFound("referrer"))?;

        let bonus = Duration::days(self.bonus_days);
        let new_end = match tx.current_subscription(referrer.id).await? {
            Some(sub) if sub.is_current(now) => {
                let new_end = sub.ends_at + bonus;
                tx.set_subscription_end(sub.id, new_end).await?;
                new_end
            }
            _ => {
                tx.insert_subscription(NewSubscription {
                    user_id: referrer.id,
                    plan_id: None,
                    starts_at: now,
                    ends_at: now + bonus,
                })
                .await?
                .ends_at
            }
        };

        tx.insert_notification(NewNotification {
            user_id: referrer.id,
            kind: NotificationKind::ReferralCredit,
            message: format!(
                "Your referral made their first payment: {} bonus days added, active until {new_end}.",
                self.bonus_days
            ),
            dedupe_key: Some(dedupe_key),
        })
        .await?;

        tracing::info!(
            referrer_id = %referrer.id,
            referee_id = %referee_id,
            bonus_days = self.bonus_days,
            "referral credited"
        );

        Ok(Some(ReferralCredit {
            referrer,
            bonus_days: self.bonus_days,
            new_end,
        }))
    }
}

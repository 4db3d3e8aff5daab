//! Promo code orchestrator
//!
//! Operator-issued codes that grant bonus subscription days. A
//! redemption is at most once per (code, user): the usage counter is
//! bumped under the promo row lock and the per-user guard is a
//! deduplicated notification marker, the same mechanism referral
//! credits use.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tunnelbot_shared::{Clock, EngineError, EngineResult, NotificationKind, PromoCode};

use crate::ledger::{Ledger, NewNotification, NewPromoCode, NewSubscription};
use crate::notify::Notifier;

/// Outcome of a redemption, for the caller's response body.
#[derive(Debug, Clone)]
pub struct PromoRedemption {
    pub code: String,
    pub bonus_days: i64,
    pub new_end: OffsetDateTime,
}

pub struct PromoOrchestrator {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

/// Codes are matched case-insensitively; the uppercased form is stored.
fn normalize(code: &str) -> String {
    code.trim().to_uppercase()
}

impl PromoOrchestrator {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            notifier,
            clock,
        }
    }

    /// Mint a new code. Rejects empty codes, non-positive bonuses and
    /// duplicates of an existing code.
    pub async fn create_code(
        &self,
        code: &str,
        bonus_days: i32,
        usage_limit: i32,
        expires_at: Option<OffsetDateTime>,
    ) -> EngineResult<PromoCode> {
        let code = normalize(code);
        if code.is_empty() || bonus_days <= 0 || usage_limit <= 0 {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: "empty code or non-positive bonus/limit".to_string(),
                expected: "non-empty code with positive bonus and limit",
            });
        }

        let mut tx = self.ledger.begin().await?;
        if tx.promo_for_update(&code).await?.is_some() {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: format!("code {code} already exists"),
                expected: "unused code",
            });
        }
        let promo = tx
            .insert_promo_code(NewPromoCode {
                code,
                bonus_days,
                usage_limit,
                expires_at,
            })
            .await?;
        tx.commit().await?;

        tracing::info!(code = %promo.code, bonus_days = promo.bonus_days, "promo code created");
        Ok(promo)
    }

    /// Redeem a code for a user: extend their current window by the
    /// bonus, or open a fresh window if none is active.
    pub async fn redeem(&self, user_id: Uuid, code: &str) -> EngineResult<PromoRedemption> {
        let code = normalize(code);
        let now = self.clock.now();

        let mut tx = self.ledger.begin().await?;
        let user = tx
            .user_by_id(user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        let promo = tx
            .promo_for_update(&code)
            .await?
            .ok_or(EngineError::NotFound("promo code"))?;

        if !promo.is_active {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: "deactivated".to_string(),
                expected: "active",
            });
        }
        if promo.expires_at.is_some_and(|t| t <= now) {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: "expired".to_string(),
                expected: "not yet expired",
            });
        }
        if promo.used_count >= promo.usage_limit {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: "usage limit reached".to_string(),
                expected: "remaining uses",
            });
        }

        let dedupe_key = format!("promo_redeemed:{}:{user_id}", promo.id);
        if tx.notification_exists(&dedupe_key).await? {
            return Err(EngineError::InvalidStateTransition {
                entity: "promo code",
                actual: "already redeemed by this user".to_string(),
                expected: "first redemption",
            });
        }

        let bonus = Duration::days(promo.bonus_days as i64);
        let new_end = match tx.current_subscription(user_id).await? {
            Some(sub) if sub.is_current(now) => {
                let new_end = sub.ends_at + bonus;
                tx.set_subscription_end(sub.id, new_end).await?;
                new_end
            }
            _ => {
                tx.insert_subscription(NewSubscription {
                    user_id,
                    plan_id: None,
                    starts_at: now,
                    ends_at: now + bonus,
                })
                .await?
                .ends_at
            }
        };

        tx.increment_promo_uses(promo.id).await?;
        let text = format!(
            "Promo code {} applied: {} bonus days added, active until {new_end}.",
            promo.code, promo.bonus_days
        );
        tx.insert_notification(NewNotification {
            user_id,
            kind: NotificationKind::PromoRedeemed,
            message: text.clone(),
            dedupe_key: Some(dedupe_key),
        })
        .await?;
        tx.commit().await?;

        if let Err(e) = self
            .notifier
            .notify(user.telegram_id, NotificationKind::PromoRedeemed, &text)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "promo notification failed");
        }
        tracing::info!(
            user_id = %user_id,
            code = %promo.code,
            bonus_days = promo.bonus_days,
            "promo code redeemed"
        );

        Ok(PromoRedemption {
            code: promo.code,
            bonus_days: promo.bonus_days as i64,
            new_end,
        })
    }
}

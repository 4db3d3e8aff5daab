//! Subscription orchestrator
//!
//! Pure ledger mutation: extends or creates the subscription row and
//! derives the new expiry. No external I/O — always runs inside the
//! caller's transaction, so a failed saga rolls this back with it.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tunnelbot_shared::{EngineError, EngineResult, RenewalPolicy, Subscription};

use crate::ledger::{LedgerTx, NewSubscription};

pub struct SubscriptionOrchestrator {
    policy: RenewalPolicy,
    trial_days: i64,
}

impl SubscriptionOrchestrator {
    pub fn new(policy: RenewalPolicy, trial_days: i64) -> Self {
        Self { policy, trial_days }
    }

    /// Extend or create the user's subscription for a purchased plan.
    ///
    /// A still-valid current subscription is extended from its own
    /// `ends_at` under the stacking policy, so renewing early never
    /// wastes remaining time. An expired or absent one yields a fresh
    /// row starting at `now`.
    pub async fn grant_access(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<Subscription> {
        let plan = tx
            .plan_by_id(plan_id)
            .await?
            .ok_or(EngineError::NotFound("plan"))?;
        let duration = Duration::days(i64::from(plan.duration_days));

        match tx.current_subscription(user_id).await? {
            Some(current) if current.is_current(now) => {
                let new_end = match self.policy {
                    RenewalPolicy::Stack => current.ends_at + duration,
                    RenewalPolicy::Reset => now + duration,
                };
                tx.set_subscription_end(current.id, new_end).await?;
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %current.id,
                    ends_at = %new_end,
                    "subscription extended"
                );
                Ok(Subscription {
                    ends_at: new_end,
                    ..current
                })
            }
            _ => {
                let sub = tx
                    .insert_subscription(NewSubscription {
                        user_id,
                        plan_id: Some(plan_id),
                        starts_at: now,
                        ends_at: now + duration,
                    })
                    .await?;
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %sub.id,
                    ends_at = %sub.ends_at,
                    "subscription created"
                );
                Ok(sub)
            }
        }
    }

    /// One-time trial window. The `has_trial` flip lives in the same
    /// transaction as the subscription row, so a duplicate grant either
    /// sees the flag or conflicts on the row lock.
    pub async fn grant_trial(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> EngineResult<Subscription> {
        let user = tx
            .user_by_id(user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        if user.has_trial {
            return Err(EngineError::InvalidStateTransition {
                entity: "trial",
                actual: "already used".to_string(),
                expected: "unused",
            });
        }

        tx.mark_trial_used(user_id).await?;
        let sub = tx
            .insert_subscription(NewSubscription {
                user_id,
                plan_id: None,
                starts_at: now,
                ends_at: now + Duration::days(self.trial_days),
            })
            .await?;
        tracing::info!(user_id = %user_id, ends_at = %sub.ends_at, "trial granted");
        Ok(sub)
    }
}

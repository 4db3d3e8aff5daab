//! Payment orchestrator: the top-level saga
//!
//! One ledger transaction covers the status flip, the subscription
//! extension and the referral credit; the panel call and the user
//! notification happen after commit because neither is transactional.
//! A panel failure after commit never rolls the payment back — money
//! was captured — it flags the user for the scheduler's reconciliation
//! pass and tells them provisioning is in progress.

use std::sync::Arc;

use uuid::Uuid;

use tunnelbot_shared::{
    Clock, EngineError, EngineResult, NotificationKind, Payment, PaymentStatus, Subscription,
    User,
};

use crate::ledger::{Ledger, NewNotification, NewPayment};
use crate::notify::Notifier;
use crate::referral::{ReferralCredit, ReferralOrchestrator};
use crate::subscription::SubscriptionOrchestrator;
use crate::vpn::VpnOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Payment processed. `provisioned` is false when the panel call
    /// failed and the user was handed to the reconciliation pass.
    Completed { provisioned: bool },
    /// Duplicate trigger for an already-completed payment; no side
    /// effects were re-applied.
    AlreadyCompleted,
}

pub struct PaymentOrchestrator {
    ledger: Arc<dyn Ledger>,
    subscriptions: SubscriptionOrchestrator,
    referrals: ReferralOrchestrator,
    vpn: Arc<VpnOrchestrator>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        subscriptions: SubscriptionOrchestrator,
        referrals: ReferralOrchestrator,
        vpn: Arc<VpnOrchestrator>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            referrals,
            vpn,
            notifier,
            clock,
        }
    }

    /// Record a pending payment for a plan purchase.
    pub async fn create_payment(&self, user_id: Uuid, plan_id: Uuid) -> EngineResult<Payment> {
        let mut tx = self.ledger.begin().await?;
        tx.user_by_id(user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        let plan = tx
            .plan_by_id(plan_id)
            .await?
            .ok_or(EngineError::NotFound("plan"))?;
        if !plan.is_active {
            return Err(EngineError::InvalidStateTransition {
                entity: "plan",
                actual: "inactive".to_string(),
                expected: "active",
            });
        }

        let payment = tx
            .insert_payment(NewPayment {
                user_id,
                plan_id,
                amount_cents: plan.price_cents,
                currency: plan.currency.clone(),
                method: "provider".to_string(),
                description: format!("Subscription: {}", plan.name),
            })
            .await?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment.id,
            user_id = %user_id,
            amount_cents = payment.amount_cents,
            "payment created"
        );
        Ok(payment)
    }

    /// Drive a confirmed payment through the full saga.
    ///
    /// Safe to call repeatedly for the same id: the row lock serializes
    /// concurrent completions and an already-completed payment returns
    /// without re-applying side effects.
    pub async fn complete_payment(&self, payment_id: Uuid) -> EngineResult<CompletionOutcome> {
        let now = self.clock.now();

        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment_for_update(payment_id)
            .await?
            .ok_or(EngineError::NotFound("payment"))?;

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Completed => {
                tracing::info!(payment_id = %payment_id, "duplicate completion ignored");
                return Ok(CompletionOutcome::AlreadyCompleted);
            }
            status => {
                return Err(EngineError::InvalidStateTransition {
                    entity: "payment",
                    actual: status.as_str().to_string(),
                    expected: "pending",
                });
            }
        }

        tx.set_payment_status(payment_id, PaymentStatus::Completed, Some(now))
            .await?;
        let subscription = self
            .subscriptions
            .grant_access(tx.as_mut(), payment.user_id, payment.plan_id, now)
            .await?;
        let credit = self
            .referrals
            .credit_if_eligible(tx.as_mut(), payment.user_id, now)
            .await?;
        let user = tx
            .user_by_id(payment.user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        tx.commit().await?;

        tracing::info!(
            payment_id = %payment_id,
            user_id = %payment.user_id,
            ends_at = %subscription.ends_at,
            "payment completed"
        );

        // Panel and notifications live outside the transaction.
        let success = format!(
            "Your subscription is active until {}. VPN access is ready.",
            subscription.ends_at
        );
        let provisioned = self
            .provision_after_commit(&user, &subscription, Some((NotificationKind::PaymentSuccess, success)))
            .await?;
        if let Some(credit) = credit {
            self.notify_referrer(&credit).await;
        }

        Ok(CompletionOutcome::Completed { provisioned })
    }

    /// Payment-less counterpart of the purchase saga: grants the trial
    /// window, then runs the same commit-then-provision sequence.
    pub async fn start_trial(&self, user_id: Uuid) -> EngineResult<Subscription> {
        let now = self.clock.now();

        let mut tx = self.ledger.begin().await?;
        let subscription = self
            .subscriptions
            .grant_trial(tx.as_mut(), user_id, now)
            .await?;
        let user = tx
            .user_by_id(user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        let text = format!("Trial started. Active until {}.", subscription.ends_at);
        tx.insert_notification(NewNotification {
            user_id,
            kind: NotificationKind::TrialStarted,
            message: text.clone(),
            dedupe_key: None,
        })
        .await?;
        tx.commit().await?;

        if let Err(e) = self
            .notifier
            .notify(user.telegram_id, NotificationKind::TrialStarted, &text)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %e, "trial notification failed");
        }
        self.provision_after_commit(&user, &subscription, None).await?;
        Ok(subscription)
    }

    /// Mark a pending payment failed. Idempotent if already failed.
    pub async fn fail_payment(&self, payment_id: Uuid) -> EngineResult<()> {
        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment_for_update(payment_id)
            .await?
            .ok_or(EngineError::NotFound("payment"))?;
        match payment.status {
            PaymentStatus::Failed => return Ok(()),
            PaymentStatus::Pending => {}
            status => {
                return Err(EngineError::InvalidStateTransition {
                    entity: "payment",
                    actual: status.as_str().to_string(),
                    expected: "pending",
                });
            }
        }
        tx.set_payment_status(payment_id, PaymentStatus::Failed, None)
            .await?;
        tx.commit().await?;
        tracing::info!(payment_id = %payment_id, "payment failed");
        Ok(())
    }

    /// Mark a completed payment refunded. Idempotent if already
    /// refunded. Access revocation is left to the expiry sweep.
    pub async fn refund_payment(&self, payment_id: Uuid) -> EngineResult<()> {
        let mut tx = self.ledger.begin().await?;
        let payment = tx
            .payment_for_update(payment_id)
            .await?
            .ok_or(EngineError::NotFound("payment"))?;
        match payment.status {
            PaymentStatus::Refunded => return Ok(()),
            PaymentStatus::Completed => {}
            status => {
                return Err(EngineError::InvalidStateTransition {
                    entity: "payment",
                    actual: status.as_str().to_string(),
                    expected: "completed",
                });
            }
        }
        tx.set_payment_status(payment_id, PaymentStatus::Refunded, None)
            .await?;
        tx.commit().await?;
        tracing::info!(payment_id = %payment_id, "payment refunded");
        Ok(())
    }

    /// Step 6/7 of the saga: enable the panel account and tell the
    /// user. Returns whether provisioning succeeded; ledger state is
    /// already committed either way.
    async fn provision_after_commit(
        &self,
        user: &User,
        subscription: &Subscription,
        success: Option<(NotificationKind, String)>,
    ) -> EngineResult<bool> {
        match self.vpn.enable(user.id).await {
            Ok(()) => {
                if let Some((kind, text)) = success {
                    self.record_and_send(user, kind, text).await;
                }
                Ok(true)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    user_id = %user.id,
                    error = %e,
                    "provisioning failed after commit, flagged for reconciliation"
                );
                let mut tx = self.ledger.begin().await?;
                tx.flag_provisioning_retry(user.id, &e.to_string()).await?;
                tx.commit().await?;

                self.record_and_send(
                    user,
                    NotificationKind::ProvisioningDelayed,
                    format!(
                        "Payment received. Your subscription is active until {}. \
                         VPN setup is taking longer than usual; we'll finish it shortly.",
                        subscription.ends_at
                    ),
                )
                .await;
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user.id,
                    error = %e,
                    "provisioning failed permanently after commit"
                );
                self.record_and_send(
                    user,
                    NotificationKind::ProvisioningFailed,
                    "Payment received, but VPN setup hit a problem. \
                     Support has been notified."
                        .to_string(),
                )
                .await;
                Ok(false)
            }
        }
    }

    async fn notify_referrer(&self, credit: &ReferralCredit) {
        let text = format!(
            "Your referral made their first payment: {} bonus days added.",
            credit.bonus_days
        );
        if let Err(e) = self
            .notifier
            .notify(
                credit.referrer.telegram_id,
                NotificationKind::ReferralCredit,
                &text,
            )
            .await
        {
            tracing::warn!(user_id = %credit.referrer.id, error = %e, "referrer notification failed");
        }
    }

    /// Append to in-app history and best-effort deliver. Delivery
    /// failures are logged, never propagated.
    async fn record_and_send(&self, user: &User, kind: NotificationKind, text: String) {
        let recorded: EngineResult<()> = async {
            let mut tx = self.ledger.begin().await?;
            tx.insert_notification(NewNotification {
                user_id: user.id,
                kind,
                message: text.clone(),
                dedupe_key: None,
            })
            .await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = recorded {
            tracing::warn!(user_id = %user.id, error = %e, "failed to record notification");
        }

        if let Err(e) = self.notifier.notify(user.telegram_id, kind, &text).await {
            tracing::warn!(user_id = %user.id, error = %e, "notification delivery failed");
        }
    }
}

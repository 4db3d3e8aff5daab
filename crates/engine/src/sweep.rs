//! Expiry sweeper
//!
//! The asynchronous half of the engine: a periodic sweep that revokes
//! lapsed access, warns users ahead of expiry and drains the
//! provisioning-retry queue. Sweeps are single-flight in-process; each
//! subscription is handled in its own transaction so one failure never
//! aborts the batch.

use std::sync::Arc;

use time::Duration;
use uuid::Uuid;

use tunnelbot_shared::{Clock, EngineError, EngineResult, NotificationKind, Subscription};

use crate::ledger::{Ledger, NewNotification};
use crate::notify::Notifier;
use crate::vpn::VpnOrchestrator;

#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How far ahead of `ends_at` the warning pass looks.
    pub warning_window: Duration,
    /// Reconciliation attempts before a flagged provisioning failure
    /// escalates to a permanent-failure notification.
    pub max_provision_attempts: i32,
    /// Retry rows drained per sweep.
    pub retry_batch: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            warning_window: Duration::hours(24),
            max_provision_attempts: 5,
            retry_batch: 50,
        }
    }
}

/// What one sweep cycle did, for structured logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub warned: usize,
    pub reconciled: usize,
    pub escalated: usize,
    pub errors: usize,
}

pub struct ExpirySweeper {
    ledger: Arc<dyn Ledger>,
    vpn: Arc<VpnOrchestrator>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    flight: tokio::sync::Mutex<()>,
}

impl ExpirySweeper {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        vpn: Arc<VpnOrchestrator>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            vpn,
            notifier,
            clock,
            config,
            flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one sweep cycle. Returns `None` if a previous cycle is
    /// still in flight.
    pub async fn run(&self) -> EngineResult<Option<SweepReport>> {
        let Ok(_guard) = self.flight.try_lock() else {
            tracing::warn!("previous sweep still running, skipping cycle");
            return Ok(None);
        };

        let mut report = SweepReport::default();
        self.expire_pass(&mut report).await?;
        self.warning_pass(&mut report).await?;
        self.reconcile_pass(&mut report).await?;

        tracing::info!(
            expired = report.expired,
            warned = report.warned,
            reconciled = report.reconciled,
            escalated = report.escalated,
            errors = report.errors,
            "sweep cycle complete"
        );
        Ok(Some(report))
    }

    /// Pass 1: deactivate lapsed subscriptions and revoke access.
    async fn expire_pass(&self, report: &mut SweepReport) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self.ledger.begin().await?;
        let expired = tx.subscriptions_expired(now).await?;
        drop(tx);

        for sub in expired {
            match self.expire_one(&sub).await {
                Ok(escalated) => {
                    report.expired += 1;
                    if escalated {
                        report.escalated += 1;
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        error = %e,
                        "failed to expire subscription"
                    );
                }
            }
        }
        Ok(())
    }

    /// Returns whether the revocation failure escalated to an alert.
    async fn expire_one(&self, sub: &Subscription) -> EngineResult<bool> {
        let now = self.clock.now();

        let mut tx = self.ledger.begin().await?;
        tx.deactivate_subscription(sub.id).await?;
        // A renewal may already carry the user past this row's end;
        // only revoke and notify when no current window remains.
        let still_covered = tx
            .current_subscription(sub.user_id)
            .await?
            .map(|s| s.is_current(now))
            .unwrap_or(false);

        let mut send: Option<(i64, String)> = None;
        if !still_covered {
            let user = tx
                .user_by_id(sub.user_id)
                .await?
                .ok_or(EngineError::NotFound("user"))?;
            let dedupe_key = format!("subscription_expired:{}", sub.id);
            if !tx.notification_exists(&dedupe_key).await? {
                let text =
                    "Your subscription has expired. Renew to restore VPN access.".to_string();
                tx.insert_notification(NewNotification {
                    user_id: sub.user_id,
                    kind: NotificationKind::SubscriptionExpired,
                    message: text.clone(),
                    dedupe_key: Some(dedupe_key),
                })
                .await?;
                send = Some((user.telegram_id, text));
            }
        }
        tx.commit().await?;

        let mut escalated = false;
        if !still_covered {
            // Panel revocation after commit; a transient failure is
            // handed to the reconciliation pass like any other drift,
            // a permanent one goes straight to the operator alert. The
            // ledger side is already settled either way.
            if let Err(e) = self.vpn.disable(sub.user_id).await {
                let mut tx = self.ledger.begin().await?;
                if e.is_transient() {
                    tx.flag_provisioning_retry(sub.user_id, &e.to_string())
                        .await?;
                } else {
                    self.escalate(tx.as_mut(), sub.user_id, &e.to_string())
                        .await?;
                    escalated = true;
                    tracing::error!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        error = %e,
                        "panel revocation failed permanently"
                    );
                }
                tx.commit().await?;
            }
        }

        if let Some((chat_id, text)) = send {
            if let Err(e) = self
                .notifier
                .notify(chat_id, NotificationKind::SubscriptionExpired, &text)
                .await
            {
                tracing::warn!(user_id = %sub.user_id, error = %e, "expiry notification failed");
            }
        }
        Ok(escalated)
    }

    /// Pass 2: warn users whose window closes inside the warning
    /// window, once per expiry window.
    async fn warning_pass(&self, report: &mut SweepReport) -> EngineResult<()> {
        let now = self.clock.now();
        let mut tx = self.ledger.begin().await?;
        let expiring = tx
            .subscriptions_expiring(now, now + self.config.warning_window)
            .await?;
        drop(tx);

        for sub in expiring {
            match self.warn_one(&sub).await {
                Ok(true) => report.warned += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::error!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        error = %e,
                        "failed to send expiry warning"
                    );
                }
            }
        }
        Ok(())
    }

    async fn warn_one(&self, sub: &Subscription) -> EngineResult<bool> {
        let mut tx = self.ledger.begin().await?;
        // Keyed on the window end, not just the row: a stacking renewal
        // moves ends_at on the same row, and the next window deserves
        // its own warning.
        let dedupe_key = format!(
            "expiry_warning:{}:{}",
            sub.id,
            sub.ends_at.unix_timestamp()
        );
        if tx.notification_exists(&dedupe_key).await? {
            return Ok(false);
        }
        let user = tx
            .user_by_id(sub.user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;
        let text = format!(
            "Your subscription expires at {}. Renew now to keep your access.",
            sub.ends_at
        );
        tx.insert_notification(NewNotification {
            user_id: sub.user_id,
            kind: NotificationKind::ExpiryWarning,
            message: text.clone(),
            dedupe_key: Some(dedupe_key),
        })
        .await?;
        tx.commit().await?;

        if let Err(e) = self
            .notifier
            .notify(user.telegram_id, NotificationKind::ExpiryWarning, &text)
            .await
        {
            tracing::warn!(user_id = %sub.user_id, error = %e, "warning delivery failed");
        }
        Ok(true)
    }

    /// Pass 3: drain the provisioning-retry queue via `Reconcile`,
    /// escalating after the attempt bound.
    async fn reconcile_pass(&self, report: &mut SweepReport) -> EngineResult<()> {
        let mut tx = self.ledger.begin().await?;
        let retries = tx.provisioning_retries(self.config.retry_batch).await?;
        drop(tx);

        for retry in retries {
            match self.vpn.reconcile(retry.user_id).await {
                Ok(outcome) => {
                    let mut tx = self.ledger.begin().await?;
                    tx.clear_provisioning_retry(retry.user_id).await?;
                    tx.commit().await?;
                    report.reconciled += 1;
                    tracing::info!(
                        user_id = %retry.user_id,
                        outcome = ?outcome,
                        "provisioning retry resolved"
                    );
                }
                Err(e) if e.is_transient() => {
                    let mut tx = self.ledger.begin().await?;
                    let attempts = tx
                        .bump_provisioning_attempts(retry.user_id, &e.to_string())
                        .await?;
                    if attempts >= self.config.max_provision_attempts {
                        self.escalate(tx.as_mut(), retry.user_id, &e.to_string())
                            .await?;
                        report.escalated += 1;
                    }
                    tx.commit().await?;
                    tracing::warn!(
                        user_id = %retry.user_id,
                        attempts,
                        error = %e,
                        "provisioning retry still failing"
                    );
                }
                Err(e) => {
                    // Permanent: no point retrying, escalate now.
                    let mut tx = self.ledger.begin().await?;
                    self.escalate(tx.as_mut(), retry.user_id, &e.to_string())
                        .await?;
                    tx.commit().await?;
                    report.escalated += 1;
                    tracing::error!(
                        user_id = %retry.user_id,
                        error = %e,
                        "provisioning failed permanently"
                    );
                }
            }
        }
        Ok(())
    }

    async fn escalate(
        &self,
        tx: &mut dyn crate::ledger::LedgerTx,
        user_id: Uuid,
        error: &str,
    ) -> EngineResult<()> {
        tx.clear_provisioning_retry(user_id).await?;
        let dedupe_key = format!("provisioning_failed:{user_id}");
        if tx.notification_exists(&dedupe_key).await? {
            return Ok(());
        }
        let text = "We couldn't finish setting up your VPN access. \
                    Support has been notified and will follow up."
            .to_string();
        tx.insert_notification(NewNotification {
            user_id,
            kind: NotificationKind::ProvisioningFailed,
            message: text.clone(),
            dedupe_key: Some(dedupe_key),
        })
        .await?;

        if let Some(user) = tx.user_by_id(user_id).await? {
            if let Err(e) = self
                .notifier
                .notify(user.telegram_id, NotificationKind::ProvisioningFailed, &text)
                .await
            {
                tracing::warn!(user_id = %user_id, error = %e, "escalation delivery failed");
            }
        }
        tracing::error!(user_id = %user_id, error, "provisioning escalated to operator");
        Ok(())
    }
}

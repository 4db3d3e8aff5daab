//! In-memory test doubles
//!
//! `MemLedger` emulates the unit of work with copy-on-write snapshots:
//! `begin` takes the single state lock (serializing transactions the
//! way row locks do) and works on a clone; `commit` swaps the clone
//! in, dropping the transaction discards it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use tunnelbot_shared::{
    Clock, EngineError, EngineResult, Notification, NotificationKind, Payment, PaymentStatus,
    Plan, PromoCode, ProvisioningRetry, Referral, ReferralLink, Subscription, User, VpnConnection,
};

use crate::ledger::{
    Ledger, LedgerTx, NewConnection, NewNotification, NewPayment, NewPromoCode, NewSubscription,
};
use crate::notify::{Notifier, NotifyError};
use crate::panel::{AccountStatus, PanelError, VpnPanel};

#[derive(Default, Clone)]
pub struct MemState {
    pub users: HashMap<Uuid, User>,
    pub plans: HashMap<Uuid, Plan>,
    pub payments: HashMap<Uuid, Payment>,
    pub subscriptions: HashMap<Uuid, Subscription>,
    pub connections: HashMap<Uuid, VpnConnection>,
    pub referrals: Vec<Referral>,
    pub referral_links: Vec<ReferralLink>,
    pub promo_codes: HashMap<Uuid, PromoCode>,
    pub notifications: Vec<Notification>,
    pub retries: HashMap<Uuid, ProvisioningRetry>,
}

#[derive(Default, Clone)]
pub struct MemLedger {
    state: Arc<tokio::sync::Mutex<MemState>>,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemState {
        self.state.lock().await.clone()
    }

    pub async fn seed_user(&self, telegram_id: i64) -> User {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            telegram_id,
            first_name: format!("user{telegram_id}"),
            username: None,
            is_blocked: false,
            has_trial: false,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .users
            .insert(user.id, user.clone());
        user
    }

    pub async fn seed_plan(&self, duration_days: i32, price_cents: i64) -> Plan {
        let plan = Plan {
            id: Uuid::new_v4(),
            name: format!("{duration_days}-day plan"),
            price_cents,
            currency: "USD".to_string(),
            duration_days,
            is_active: true,
        };
        self.state
            .lock()
            .await
            .plans
            .insert(plan.id, plan.clone());
        plan
    }

    pub async fn seed_pending_payment(&self, user: &User, plan: &Plan) -> Payment {
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: user.id,
            plan_id: plan.id,
            amount_cents: plan.price_cents,
            currency: plan.currency.clone(),
            method: "provider".to_string(),
            description: format!("Subscription: {}", plan.name),
            status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        self.state
            .lock()
            .await
            .payments
            .insert(payment.id, payment.clone());
        payment
    }

    pub async fn seed_subscription(
        &self,
        user_id: Uuid,
        ends_at: OffsetDateTime,
        is_active: bool,
    ) -> Subscription {
        let now = OffsetDateTime::now_utc();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: None,
            starts_at: ends_at - time::Duration::days(30),
            ends_at,
            is_active,
            created_at: now,
        };
        self.state
            .lock()
            .await
            .subscriptions
            .insert(sub.id, sub.clone());
        sub
    }

    pub async fn seed_referral(&self, referrer_id: Uuid, referee_id: Uuid) -> Referral {
        let referral = Referral {
            id: Uuid::new_v4(),
            referrer_id,
            referee_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().await.referrals.push(referral.clone());
        referral
    }
}

#[async_trait]
impl Ledger for MemLedger {
    async fn begin(&self) -> EngineResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemTx { guard, working }))
    }
}

pub struct MemTx {
    guard: OwnedMutexGuard<MemState>,
    working: MemState,
}

#[async_trait]
impl LedgerTx for MemTx {
    async fn user_by_id(&mut self, id: Uuid) -> EngineResult<Option<User>> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn user_for_update(&mut self, id: Uuid) -> EngineResult<Option<User>> {
        // The single state lock already serializes transactions.
        Ok(self.working.users.get(&id).cloned())
    }

    async fn mark_trial_used(&mut self, user_id: Uuid) -> EngineResult<()> {
        if let Some(user) = self.working.users.get_mut(&user_id) {
            user.has_trial = true;
            user.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn plan_by_id(&mut self, id: Uuid) -> EngineResult<Option<Plan>> {
        Ok(self.working.plans.get(&id).cloned())
    }

    async fn payment_for_update(&mut self, id: Uuid) -> EngineResult<Option<Payment>> {
        Ok(self.working.payments.get(&id).cloned())
    }

    async fn insert_payment(&mut self, payment: NewPayment) -> EngineResult<Payment> {
        let row = Payment {
            id: Uuid::new_v4(),
            user_id: payment.user_id,
            plan_id: payment.plan_id,
            amount_cents: payment.amount_cents,
            currency: payment.currency,
            method: payment.method,
            description: payment.description,
            status: PaymentStatus::Pending,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        self.working.payments.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_payment_status(
        &mut self,
        id: Uuid,
        status: PaymentStatus,
        completed_at: Option<OffsetDateTime>,
    ) -> EngineResult<()> {
        let payment = self
            .working
            .payments
            .get_mut(&id)
            .ok_or(EngineError::NotFound("payment"))?;
        payment.status = status;
        payment.completed_at = completed_at;
        Ok(())
    }

    async fn completed_payment_count(&mut self, user_id: Uuid) -> EngineResult<i64> {
        Ok(self
            .working
            .payments
            .values()
            .filter(|p| p.user_id == user_id && p.status == PaymentStatus::Completed)
            .count() as i64)
    }

    async fn current_subscription(&mut self, user_id: Uuid) -> EngineResult<Option<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .max_by_key(|s| s.ends_at)
            .cloned())
    }

    async fn insert_subscription(&mut self, sub: NewSubscription) -> EngineResult<Subscription> {
        let row = Subscription {
            id: Uuid::new_v4(),
            user_id: sub.user_id,
            plan_id: sub.plan_id,
            starts_at: sub.starts_at,
            ends_at: sub.ends_at,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.subscriptions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_subscription_end(
        &mut self,
        id: Uuid,
        ends_at: OffsetDateTime,
    ) -> EngineResult<()> {
        if let Some(sub) = self.working.subscriptions.get_mut(&id) {
            sub.ends_at = ends_at;
        }
        Ok(())
    }

    async fn deactivate_subscription(&mut self, id: Uuid) -> EngineResult<()> {
        if let Some(sub) = self.working.subscriptions.get_mut(&id) {
            sub.is_active = false;
        }
        Ok(())
    }

    async fn subscriptions_expired(
        &mut self,
        now: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .values()
            .filter(|s| s.is_active && s.ends_at <= now)
            .cloned()
            .collect())
    }

    async fn subscriptions_expiring(
        &mut self,
        now: OffsetDateTime,
        until: OffsetDateTime,
    ) -> EngineResult<Vec<Subscription>> {
        Ok(self
            .working
            .subscriptions
            .values()
            .filter(|s| s.is_active && s.ends_at > now && s.ends_at <= until)
            .cloned()
            .collect())
    }

    async fn connection_for_update(
        &mut self,
        user_id: Uuid,
    ) -> EngineResult<Option<VpnConnection>> {
        let mut rows: Vec<_> = self
            .working
            .connections
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
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
        Ok(self
            .working
            .connections
            .values()
            .find(|c| c.panel_username == username)
            .cloned())
    }

    async fn insert_connection(&mut self, conn: NewConnection) -> EngineResult<VpnConnection> {
        let now = OffsetDateTime::now_utc();
        let row = VpnConnection {
            id: Uuid::new_v4(),
            user_id: conn.user_id,
            panel_username: conn.panel_username,
            name: conn.name,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.working.connections.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_connection_active(&mut self, id: Uuid, active: bool) -> EngineResult<()> {
        if let Some(conn) = self.working.connections.get_mut(&id) {
            conn.is_active = active;
            conn.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn referral_by_referee(&mut self, referee_id: Uuid) -> EngineResult<Option<Referral>> {
        Ok(self
            .working
            .referrals
            .iter()
            .find(|r| r.referee_id == referee_id)
            .cloned())
    }

    async fn insert_referral(
        &mut self,
        referrer_id: Uuid,
        referee_id: Uuid,
    ) -> EngineResult<Referral> {
        let row = Referral {
            id: Uuid::new_v4(),
            referrer_id,
            referee_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.referrals.push(row.clone());
        Ok(row)
    }

    async fn referral_link_by_code(&mut self, code: &str) -> EngineResult<Option<ReferralLink>> {
        Ok(self
            .working
            .referral_links
            .iter()
            .find(|l| l.code == code && l.is_active)
            .cloned())
    }

    async fn referral_link_by_user(
        &mut self,
        user_id: Uuid,
    ) -> EngineResult<Option<ReferralLink>> {
        Ok(self
            .working
            .referral_links
            .iter()
            .find(|l| l.user_id == user_id)
            .cloned())
    }

    async fn insert_referral_link(
        &mut self,
        user_id: Uuid,
        code: &str,
    ) -> EngineResult<ReferralLink> {
        let row = ReferralLink {
            id: Uuid::new_v4(),
            user_id,
            code: code.to_string(),
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.referral_links.push(row.clone());
        Ok(row)
    }

    async fn insert_promo_code(&mut self, promo: NewPromoCode) -> EngineResult<PromoCode> {
        let row = PromoCode {
            id: Uuid::new_v4(),
            code: promo.code,
            bonus_days: promo.bonus_days,
            usage_limit: promo.usage_limit,
            used_count: 0,
            expires_at: promo.expires_at,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.promo_codes.insert(row.id, row.clone());
        Ok(row)
    }

    async fn promo_for_update(&mut self, code: &str) -> EngineResult<Option<PromoCode>> {
        Ok(self
            .working
            .promo_codes
            .values()
            .find(|p| p.code == code)
            .cloned())
    }

    async fn increment_promo_uses(&mut self, id: Uuid) -> EngineResult<()> {
        if let Some(promo) = self.working.promo_codes.get_mut(&id) {
            promo.used_count += 1;
        }
        Ok(())
    }

    async fn notification_exists(&mut self, dedupe_key: &str) -> EngineResult<bool> {
        Ok(self
            .working
            .notifications
            .iter()
            .any(|n| n.dedupe_key.as_deref() == Some(dedupe_key)))
    }

    async fn insert_notification(
        &mut self,
        notification: NewNotification,
    ) -> EngineResult<Notification> {
        if let Some(ref key) = notification.dedupe_key {
            if let Some(existing) = self
                .working
                .notifications
                .iter()
                .find(|n| n.dedupe_key.as_deref() == Some(key.as_str()))
            {
                return Ok(existing.clone());
            }
        }
        let row = Notification {
            id: Uuid::new_v4(),
            user_id: notification.user_id,
            kind: notification.kind,
            message: notification.message,
            dedupe_key: notification.dedupe_key,
            is_read: false,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.notifications.push(row.clone());
        Ok(row)
    }

    async fn unread_notifications(&mut self, user_id: Uuid) -> EngineResult<Vec<Notification>> {
        Ok(self
            .working
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .cloned()
            .collect())
    }

    async fn mark_notification_read(&mut self, id: Uuid) -> EngineResult<()> {
        if let Some(n) = self.working.notifications.iter_mut().find(|n| n.id == id) {
            n.is_read = true;
        }
        Ok(())
    }

    async fn flag_provisioning_retry(&mut self, user_id: Uuid, error: &str) -> EngineResult<()> {
        let now = OffsetDateTime::now_utc();
        self.working
            .retries
            .entry(user_id)
            .and_modify(|r| {
                r.last_error = error.to_string();
                r.updated_at = now;
            })
            .or_insert(ProvisioningRetry {
                user_id,
                attempts: 0,
                last_error: error.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn provisioning_retries(&mut self, limit: i64) -> EngineResult<Vec<ProvisioningRetry>> {
        let mut rows: Vec<_> = self.working.retries.values().cloned().collect();
        rows.sort_by_key(|r| r.updated_at);
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn bump_provisioning_attempts(
        &mut self,
        user_id: Uuid,
        error: &str,
    ) -> EngineResult<i32> {
        let now = OffsetDateTime::now_utc();
        let entry = self
            .working
            .retries
            .entry(user_id)
            .and_modify(|r| {
                r.attempts += 1;
                r.last_error = error.to_string();
                r.updated_at = now;
            })
            .or_insert(ProvisioningRetry {
                user_id,
                attempts: 1,
                last_error: error.to_string(),
                created_at: now,
                updated_at: now,
            });
        Ok(entry.attempts)
    }

    async fn clear_provisioning_retry(&mut self, user_id: Uuid) -> EngineResult<()> {
        self.working.retries.remove(&user_id);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> EngineResult<()> {
        *self.guard = self.working;
        Ok(())
    }
}

/// Panel double: tracks accounts, records every call, and can be told
/// to fail.
#[derive(Default)]
pub struct MockPanel {
    accounts: Mutex<HashMap<String, bool>>,
    pub calls: Mutex<Vec<String>>,
    /// Next N create/set_enabled calls fail transiently.
    transient_failures: AtomicUsize,
    /// Next N create/set_enabled calls are rejected outright.
    rejections: AtomicUsize,
    /// Usernames that always conflict on create.
    conflicts: Mutex<Vec<String>>,
    /// When set, every create conflicts.
    conflict_all: std::sync::atomic::AtomicBool,
}

impl MockPanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn reject_next(&self, n: usize) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    pub fn conflict_on(&self, username: &str) {
        self.conflicts.lock().unwrap().push(username.to_string());
    }

    pub fn conflict_always(&self) {
        self.conflict_all.store(true, Ordering::SeqCst);
    }

    pub fn calls_named(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn is_enabled(&self, username: &str) -> Option<bool> {
        self.accounts.lock().unwrap().get(username).copied()
    }

    pub fn set_account(&self, username: &str, enabled: bool) {
        self.accounts
            .lock()
            .unwrap()
            .insert(username.to_string(), enabled);
    }

    pub fn remove_account(&self, username: &str) {
        self.accounts.lock().unwrap().remove(username);
    }

    fn take_transient(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_rejection(&self) -> bool {
        self.rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl VpnPanel for MockPanel {
    async fn create_account(&self, username: &str) -> Result<(), PanelError> {
        self.calls.lock().unwrap().push(format!("create:{username}"));
        if self.take_transient() {
            return Err(PanelError::Transient("injected failure".to_string()));
        }
        if self.take_rejection() {
            return Err(PanelError::Rejected("injected rejection".to_string()));
        }
        if self.conflict_all.load(Ordering::SeqCst)
            || self.conflicts.lock().unwrap().iter().any(|c| c == username)
        {
            return Err(PanelError::Conflict);
        }
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(username) {
            return Err(PanelError::Conflict);
        }
        accounts.insert(username.to_string(), true);
        Ok(())
    }

    async fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), PanelError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set:{username}:{enabled}"));
        if self.take_transient() {
            return Err(PanelError::Transient("injected failure".to_string()));
        }
        if self.take_rejection() {
            return Err(PanelError::Rejected("injected rejection".to_string()));
        }
        match self.accounts.lock().unwrap().get_mut(username) {
            Some(state) => {
                *state = enabled;
                Ok(())
            }
            None => Err(PanelError::NotFound),
        }
    }

    async fn delete_account(&self, username: &str) -> Result<(), PanelError> {
        self.calls.lock().unwrap().push(format!("delete:{username}"));
        match self.accounts.lock().unwrap().remove(username) {
            Some(_) => Ok(()),
            None => Err(PanelError::NotFound),
        }
    }

    async fn status(&self, username: &str) -> Result<AccountStatus, PanelError> {
        Ok(match self.accounts.lock().unwrap().get(username) {
            Some(true) => AccountStatus::Enabled,
            Some(false) => AccountStatus::Disabled,
            None => AccountStatus::NotFound,
        })
    }
}

/// Collects delivered messages instead of hitting Telegram.
#[derive(Default)]
pub struct MockNotifier {
    pub sent: Mutex<Vec<(i64, NotificationKind, String)>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_of_kind(&self, kind: NotificationKind) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(
        &self,
        chat_id: i64,
        kind: NotificationKind,
        text: &str,
    ) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id, kind, text.to_string()));
        Ok(())
    }
}

/// Fixed, manually-advanced clock.
pub struct MockClock {
    now: Mutex<OffsetDateTime>,
}

impl MockClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: time::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

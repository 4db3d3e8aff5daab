//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use tunnelbot_engine::{
    Ledger, MarzbanClient, PaymentOrchestrator, PgLedger, PromoOrchestrator,
    ReferralOrchestrator, SubscriptionOrchestrator, TelegramNotifier, VpnOrchestrator,
};
use tunnelbot_shared::{AppConfig, SystemClock};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub ledger: Arc<dyn Ledger>,
    pub payments: Arc<PaymentOrchestrator>,
    pub vpn: Arc<VpnOrchestrator>,
    pub referrals: Arc<ReferralOrchestrator>,
    pub promos: Arc<PromoOrchestrator>,
}

impl AppState {
    pub fn new(pool: PgPool, config: &AppConfig) -> anyhow::Result<Self> {
        let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool.clone()));
        let clock = Arc::new(SystemClock);
        let panel = Arc::new(MarzbanClient::new(&config.marzban)?);
        let notifier = Arc::new(TelegramNotifier::new(&config.telegram)?);

        let vpn = Arc::new(VpnOrchestrator::new(
            ledger.clone(),
            panel,
            clock.clone(),
            config.username_salt.clone(),
        ));
        let referrals = Arc::new(ReferralOrchestrator::new(config.referral_bonus_days));
        let promos = Arc::new(PromoOrchestrator::new(
            ledger.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        let payments = Arc::new(PaymentOrchestrator::new(
            ledger.clone(),
            SubscriptionOrchestrator::new(config.renewal_policy, config.trial_days),
            ReferralOrchestrator::new(config.referral_bonus_days),
            vpn.clone(),
            notifier,
            clock,
        ));

        Ok(Self {
            pool,
            ledger,
            payments,
            vpn,
            referrals,
            promos,
        })
    }
}

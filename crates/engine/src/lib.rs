// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Subscription & provisioning consistency engine
//!
//! Keeps three independently-failing systems in agreement: the
//! relational ledger, the external VPN panel and the notification
//! channel. The payment saga handles the synchronous path (a payment
//! completes); the expiry sweeper handles the asynchronous path
//! (subscriptions lapse, failed provisioning is reconciled).

pub mod ledger;
pub mod marzban;
pub mod notify;
pub mod panel;
pub mod payment;
pub mod pg;
pub mod promo;
pub mod referral;
pub mod subscription;
pub mod sweep;
pub mod vpn;

#[cfg(test)]
mod mock;


pub use ledger::{
    Ledger, LedgerTx, NewConnection, NewNotification, NewPayment, NewPromoCode, NewSubscription,
};
pub use marzban::MarzbanClient;
pub use notify::{Notifier, NotifyError, TelegramNotifier};
pub use panel::{AccountStatus, PanelError, VpnPanel};
pub use payment::{CompletionOutcome, PaymentOrchestrator};
pub use pg::PgLedger;
pub use promo::{PromoOrchestrator, PromoRedemption};
pub use referral::{ReferralCredit, ReferralOrchestrator};
pub use subscription::SubscriptionOrchestrator;
pub use sweep::{ExpirySweeper, SweepConfig, SweepReport};
pub use vpn::{ReconcileOutcome, VpnOrchestrator, MAX_USERNAME_ATTEMPTS};

//! VPN panel port
//!
//! The panel is a plain HTTP service with no cross-call atomicity; the
//! ledger's idempotency checks are the only guard against duplicate
//! provisioning. "Not found" is a distinct outcome, never folded into
//! transient errors.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("panel account not found")]
    NotFound,

    #[error("panel username already taken")]
    Conflict,

    /// Network/5xx failures the next reconciliation pass may repair.
    #[error("panel request failed: {0}")]
    Transient(String),

    /// The panel rejected the request for a reason retrying won't fix.
    #[error("panel rejected request: {0}")]
    Rejected(String),
}

impl PanelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PanelError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Enabled,
    Disabled,
    NotFound,
}

#[async_trait]
pub trait VpnPanel: Send + Sync {
    async fn create_account(&self, username: &str) -> Result<(), PanelError>;
    async fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), PanelError>;
    async fn delete_account(&self, username: &str) -> Result<(), PanelError>;
    async fn status(&self, username: &str) -> Result<AccountStatus, PanelError>;
}

//! VPN orchestrator
//!
//! Owns the ledger<->panel consistency for one user: ensures exactly
//! one provisioned account exists and that its enabled state matches
//! what the subscriptions say it should be. Panel calls happen while
//! the user row (and the connection row, once it exists) is locked, so
//! two concurrent enables for the same user serialize and converge
//! instead of double-provisioning.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use tunnelbot_shared::{Clock, EngineError, EngineResult};

use crate::ledger::{Ledger, LedgerTx, NewConnection};
use crate::panel::{AccountStatus, PanelError, VpnPanel};

/// Suffix attempts before a username collision is declared permanent.
pub const MAX_USERNAME_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Ledger and panel already agreed.
    Unchanged,
    Enabled,
    Disabled,
    /// Ledger state was right but the panel had drifted; repaired.
    Repaired,
}

pub struct VpnOrchestrator {
    ledger: Arc<dyn Ledger>,
    panel: Arc<dyn VpnPanel>,
    clock: Arc<dyn Clock>,
    username_salt: String,
}

/// Deterministic panel username for a platform identity. The salt keeps
/// it unguessable; the attempt counter feeds collision regeneration.
fn derive_username(telegram_id: i64, salt: &str, attempt: u32) -> String {
    let digest = Sha256::digest(format!("{salt}:{telegram_id}:{attempt}").as_bytes());
    format!("tb_{}", &hex::encode(digest)[..12])
}

fn panel_err(e: PanelError) -> EngineError {
    match e {
        PanelError::Transient(msg) => EngineError::Transient(msg),
        PanelError::NotFound => EngineError::Permanent("panel account missing".to_string()),
        PanelError::Conflict => EngineError::Permanent("panel username conflict".to_string()),
        PanelError::Rejected(msg) => EngineError::Permanent(msg),
    }
}

impl VpnOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        panel: Arc<dyn VpnPanel>,
        clock: Arc<dyn Clock>,
        username_salt: String,
    ) -> Self {
        Self {
            ledger,
            panel,
            clock,
            username_salt,
        }
    }

    /// Ensure a provisioned, enabled account exists. Idempotent: an
    /// already-active connection is a no-op without a panel call.
    pub async fn enable(&self, user_id: Uuid) -> EngineResult<()> {
        let mut tx = self.ledger.begin().await?;
        // Lock the user row first: on first-time provisioning there is
        // no connection row yet, and without this two concurrent
        // enables would both reach the create loop and orphan a panel
        // account when the loser's insert hits the unique constraint.
        let user = tx
            .user_for_update(user_id)
            .await?
            .ok_or(EngineError::NotFound("user"))?;

        match tx.connection_for_update(user_id).await? {
            Some(conn) if conn.is_active => Ok(()),
            Some(conn) => {
                // Reuse the existing panel username.
                match self.panel.set_enabled(&conn.panel_username, true).await {
                    Ok(()) => {}
                    // Crash between a ledger commit and the panel call can
                    // leave no account behind; recreate it.
                    Err(PanelError::NotFound) => self
                        .panel
                        .create_account(&conn.panel_username)
                        .await
                        .map_err(panel_err)?,
                    Err(e) => return Err(panel_err(e)),
                }
                tx.set_connection_active(conn.id, true).await?;
                tx.commit().await?;
                tracing::info!(user_id = %user_id, username = %conn.panel_username, "vpn re-enabled");
                Ok(())
            }
            None => {
                let mut created = None;
                for attempt in 0..MAX_USERNAME_ATTEMPTS {
                    let username = derive_username(user.telegram_id, &self.username_salt, attempt);
                    if tx.connection_by_panel_username(&username).await?.is_some() {
                        continue;
                    }
                    match self.panel.create_account(&username).await {
                        Ok(()) => {
                            created = Some(username);
                            break;
                        }
                        Err(PanelError::Conflict) => {
                            tracing::warn!(
                                user_id = %user_id,
                                username = %username,
                                attempt,
                                "panel username collision, regenerating"
                            );
                            continue;
                        }
                        Err(e) => return Err(panel_err(e)),
                    }
                }

                let username = created.ok_or_else(|| {
                    EngineError::Permanent(format!(
                        "could not allocate panel username after {MAX_USERNAME_ATTEMPTS} attempts"
                    ))
                })?;

                tx.insert_connection(NewConnection {
                    user_id,
                    panel_username: username.clone(),
                    name: format!("{} access", user.first_name),
                })
                .await?;
                tx.commit().await?;
                tracing::info!(user_id = %user_id, username = %username, "vpn provisioned");
                Ok(())
            }
        }
    }

    /// Revoke panel access. No-op if already inactive or absent.
    pub async fn disable(&self, user_id: Uuid) -> EngineResult<()> {
        let mut tx = self.ledger.begin().await?;
        match tx.connection_for_update(user_id).await? {
            Some(conn) if conn.is_active => {
                match self.panel.set_enabled(&conn.panel_username, false).await {
                    // Absent on the panel means access is already revoked.
                    Ok(()) | Err(PanelError::NotFound) => {}
                    Err(e) => return Err(panel_err(e)),
                }
                tx.set_connection_active(conn.id, false).await?;
                tx.commit().await?;
                tracing::info!(user_id = %user_id, username = %conn.panel_username, "vpn disabled");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Re-derive the desired enabled state from the ledger and repair
    /// any drift in the connection row or on the panel itself.
    pub async fn reconcile(&self, user_id: Uuid) -> EngineResult<ReconcileOutcome> {
        let now = self.clock.now();
        let mut tx = self.ledger.begin().await?;
        let desired = tx
            .current_subscription(user_id)
            .await?
            .map(|s| s.is_current(now))
            .unwrap_or(false);
        let conn = tx.connection_for_update(user_id).await?;
        drop(tx); // read-only so far; enable/disable re-check under their own lock

        let actual = conn.as_ref().map(|c| c.is_active).unwrap_or(false);
        match (desired, actual) {
            (true, false) => {
                self.enable(user_id).await?;
                Ok(ReconcileOutcome::Enabled)
            }
            (false, true) => {
                self.disable(user_id).await?;
                Ok(ReconcileOutcome::Disabled)
            }
            (ledger_enabled, _) => {
                // Ledger is settled; verify the panel projection matches.
                let Some(conn) = conn else {
                    return Ok(ReconcileOutcome::Unchanged);
                };
                match self.panel.status(&conn.panel_username).await {
                    Ok(AccountStatus::Enabled) if ledger_enabled => Ok(ReconcileOutcome::Unchanged),
                    Ok(AccountStatus::Disabled) | Ok(AccountStatus::NotFound)
                        if !ledger_enabled =>
                    {
                        Ok(ReconcileOutcome::Unchanged)
                    }
                    Ok(AccountStatus::Disabled) => {
                        self.panel
                            .set_enabled(&conn.panel_username, true)
                            .await
                            .map_err(panel_err)?;
                        tracing::warn!(user_id = %user_id, "panel drift repaired: re-enabled");
                        Ok(ReconcileOutcome::Repaired)
                    }
                    Ok(AccountStatus::NotFound) => {
                        self.panel
                            .create_account(&conn.panel_username)
                            .await
                            .map_err(panel_err)?;
                        tracing::warn!(user_id = %user_id, "panel drift repaired: recreated");
                        Ok(ReconcileOutcome::Repaired)
                    }
                    Ok(AccountStatus::Enabled) => {
                        self.panel
                            .set_enabled(&conn.panel_username, false)
                            .await
                            .map_err(panel_err)?;
                        tracing::warn!(user_id = %user_id, "panel drift repaired: disabled");
                        Ok(ReconcileOutcome::Repaired)
                    }
                    Err(e) => Err(panel_err(e)),
                }
            }
        }
    }
}

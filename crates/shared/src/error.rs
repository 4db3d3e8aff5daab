//! Error taxonomy for the consistency engine
//!
//! The variants map directly onto how a failure is handled:
//!
//! - `NotFound` / `InvalidStateTransition` — surfaced to the caller,
//!   never retried.
//! - `Transient` — external call failed in a way the next
//!   reconciliation pass may repair; never blocks a ledger commit.
//! - `Permanent` — external system rejected us irrecoverably; escalated
//!   to an operator-visible alert.
//! - `ConsistencyViolation` — a ledger invariant is broken; logged
//!   loudly, never silently repaired by guessing.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid state transition: {entity} is {actual}, expected {expected}")]
    InvalidStateTransition {
        entity: &'static str,
        actual: String,
        expected: &'static str,
    },

    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("permanent external failure: {0}")]
    Permanent(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// True for failures the scheduler's reconciliation pass may repair.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

// src/error.rs
//
// =============================================================================
// MARLIN-SUPER: ERROR TAXONOMY (§7)
// =============================================================================
//
// The gateway's error kind is matched on by the state machine to decide
// whether to retry, drop the job, or crash — so it needs to be a real enum,
// not an opaque anyhow chain. `anyhow` still covers the CLI/config boundary
// (see main.rs, config.rs) the way the orchestrator uses it everywhere else.

use thiserror::Error;

/// Errors surfaced by every `MdsGateway` operation (§4.1, §7).
#[derive(Debug, Error)]
pub enum MdsError {
    /// Ownership race lost, or a duplicate `taskGroupId` create.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Store unavailable, network error, call timeout — retryable by the
    /// next tick with no bounded counter at this layer (§7).
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed record read back from the store (out-of-range `phaseNum`,
    /// duplicate `taskGroupId`, missing required field). Logged and
    /// skipped; never aborts the job (§7, §9).
    #[error("validation: {0}")]
    Validation(String),

    /// Programmer bug or impossible state. Allowed to propagate and crash
    /// the supervisor; the MDS is left consistent so restart recovers (§7).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MdsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, MdsError::Transient(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MdsError::Conflict(_))
    }
}

/// A bounded gateway call that elapsed its deadline is a transient failure,
/// not a fatal one (§5 Timeouts, §9 item 3).
impl From<tokio::time::error::Elapsed> for MdsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MdsError::Transient("operation deadline elapsed".into())
    }
}

impl From<rusqlite::Error> for MdsError {
    fn from(e: rusqlite::Error) -> Self {
        MdsError::Transient(format!("sqlite: {e}"))
    }
}

impl From<serde_json::Error> for MdsError {
    fn from(e: serde_json::Error) -> Self {
        MdsError::Validation(format!("serde_json: {e}"))
    }
}

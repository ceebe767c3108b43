//! Error taxonomy for the privacy core.
//!
//! Every fallible operation in this crate returns [`PrivacyResult`]. Variants map
//! onto the orchestrator's handling policy: parameter errors are never retried,
//! budget errors drop the client for the round, encryption failures may be
//! retried (encryption step only), protocol errors are programmer errors.

use std::fmt;
use thiserror::Error;

pub type PrivacyResult<T> = Result<T, PrivacyError>;

/// Which half of an (ε, δ) budget a budget error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDimension { Epsilon, Delta }

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { BudgetDimension::Epsilon => f.write_str("epsilon"), BudgetDimension::Delta => f.write_str("delta") }
    }
}

#[derive(Debug, Error)]
pub enum PrivacyError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("privacy budget exceeded for client {client_id}: {dimension} required {required}, available {available}")]
    BudgetExceeded { client_id: String, dimension: BudgetDimension, required: f64, available: f64 },

    #[error("insufficient privacy budget for client {client_id}: {dimension} required {required}, available {available}")]
    InsufficientBudget { client_id: String, dimension: BudgetDimension, required: f64, available: f64 },

    #[error("encryption failure: {0}")]
    EncryptionFailure(String),

    #[error("invalid threshold {threshold} for {participants} participants")]
    InvalidThreshold { threshold: usize, participants: usize },

    #[error("aggregation session {0} is closed")]
    SessionClosed(String),

    #[error("parameter bounds violation in layer {layer} at index {index}: {value}")]
    ParameterBoundsViolation { layer: String, index: usize, value: f64 },

    #[error("privacy budget for job {0} is closed")]
    JobClosed(String),

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("job {0} already has an active privacy budget")]
    JobAlreadyActive(String),

    #[error("client {client_id} has no budget in job {job_id}")]
    UnknownClient { job_id: String, client_id: String },

    #[error("unknown aggregation session {0}")]
    UnknownSession(String),

    #[error("client {client_id} is not a participant of session {session_id}")]
    UnknownParticipant { session_id: String, client_id: String },

    #[error("session {session_id} aggregates job {expected}, update belongs to job {found}")]
    JobMismatch { session_id: String, expected: String, found: String },

    #[error("client {client_id} already contributed to session {session_id}")]
    DuplicateContribution { session_id: String, client_id: String },

    #[error("insufficient contributions: required {required}, received {received}")]
    InsufficientContributions { required: usize, received: usize },

    #[error("parameter shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid privacy proof: {0}")]
    InvalidProof(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PrivacyError {
    /// Only the encryption step may be retried; everything else is final for the call.
    pub fn is_retryable(&self) -> bool { matches!(self, PrivacyError::EncryptionFailure(_)) }

    pub fn is_budget_error(&self) -> bool {
        matches!(self, PrivacyError::BudgetExceeded { .. } | PrivacyError::InsufficientBudget { .. })
    }
}

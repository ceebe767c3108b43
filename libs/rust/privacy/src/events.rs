//! Structured lifecycle events returned to the orchestrator, which decides how to fan
//! them out (logs, metrics, UI).

use serde::{Deserialize, Serialize};

use crate::budget::LedgerSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrivacyEvent {
    BudgetInitialized { job_id: String, clients: usize, total_epsilon: f64, total_delta: f64 },
    AggregationCompleted { job_id: String, session_id: String, contributions: usize, encrypted: bool },
    SessionAborted { job_id: String, session_id: String },
    BudgetFinalized { summary: LedgerSummary },
}

impl PrivacyEvent {
    pub fn job_id(&self) -> &str {
        match self {
            PrivacyEvent::BudgetInitialized { job_id, .. }
            | PrivacyEvent::AggregationCompleted { job_id, .. }
            | PrivacyEvent::SessionAborted { job_id, .. } => job_id,
            PrivacyEvent::BudgetFinalized { summary } => &summary.job_id,
        }
    }
}

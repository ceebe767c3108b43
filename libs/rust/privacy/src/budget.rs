//! Privacy budget ledgers, one per job, one row per client.
//!
//! Concurrency model:
//! - job map: `RwLock<HashMap<job, Arc<JobLedger>>>`, held only long enough to clone the Arc
//! - ledger status: `RwLock`; consumption holds it shared, `finalize` exclusively, so a
//!   finalize waits for in-flight commits and every later commit sees `JobClosed`
//! - client row: `Mutex`, check-then-act on (used + reserved) happens under it
//!
//! Finalized ledgers leave the job map; their ids stay in a bounded retired record so
//! later lookups fail with `JobClosed` rather than `UnknownJob`.
//!
//! `used_epsilon` / `used_delta` only ever grow. Rollback is expressed by dropping an
//! uncommitted [`BudgetReservation`], which releases the reserved amount instead.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{BudgetDimension, PrivacyError, PrivacyResult};
use crate::noise::NoiseMechanism;
use crate::retired::Retired;
use crate::types::{AccountantState, FederatedClient};

/// Absorbs float drift when budgets are spent in equal slices (e.g. 8 × 0.1 of 0.8).
const BUDGET_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientPrivacyBudget {
    pub max_epsilon: f64,
    pub max_delta: f64,
    pub used_epsilon: f64,
    pub used_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    pub epsilon: f64,
    pub delta: f64,
    pub mechanism: NoiseMechanism,
    pub at: DateTime<Utc>,
}

/// Final per-job totals returned by [`PrivacyBudgetAccountant::finalize`] for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub job_id: String,
    pub total_epsilon: f64,
    pub total_delta: f64,
    pub clients: BTreeMap<String, ClientPrivacyBudget>,
    pub consumption_count: usize,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
}

impl LedgerSummary {
    pub fn used_epsilon(&self) -> f64 { self.clients.values().map(|c| c.used_epsilon).sum() }
}

#[derive(Debug)]
struct ClientLedger {
    budget: ClientPrivacyBudget,
    reserved_epsilon: f64,
    reserved_delta: f64,
    history: Vec<ConsumptionRecord>,
}

impl ClientLedger {
    fn available_epsilon(&self) -> f64 { (self.budget.max_epsilon - self.budget.used_epsilon - self.reserved_epsilon).max(0.0) }
    fn available_delta(&self) -> f64 { (self.budget.max_delta - self.budget.used_delta - self.reserved_delta).max(0.0) }
    fn state(&self) -> AccountantState {
        AccountantState { used_epsilon: self.budget.used_epsilon, used_delta: self.budget.used_delta, max_epsilon: self.budget.max_epsilon, max_delta: self.budget.max_delta }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LedgerStatus { Open, Closed { at: DateTime<Utc> } }

#[derive(Debug)]
struct JobLedger {
    job_id: String,
    total_epsilon: f64,
    total_delta: f64,
    created_at: DateTime<Utc>,
    status: RwLock<LedgerStatus>,
    clients: HashMap<String, Mutex<ClientLedger>>,
}

impl JobLedger {
    fn client(&self, client_id: &str) -> PrivacyResult<&Mutex<ClientLedger>> {
        self.clients.get(client_id).ok_or_else(|| PrivacyError::UnknownClient { job_id: self.job_id.clone(), client_id: client_id.to_string() })
    }
    fn is_open(&self) -> bool { *self.status.read() == LedgerStatus::Open }
}

/// Budget held for one pending protection. Commit to record it as spent; drop to release.
#[must_use = "an uncommitted reservation is released on drop"]
#[derive(Debug)]
pub struct BudgetReservation {
    ledger: Arc<JobLedger>,
    client_id: String,
    epsilon: f64,
    delta: f64,
    mechanism: NoiseMechanism,
    projected: AccountantState,
    committed: bool,
}

impl BudgetReservation {
    pub fn epsilon(&self) -> f64 { self.epsilon }
    pub fn delta(&self) -> f64 { self.delta }

    /// Ledger row as it will read once this reservation is committed.
    pub fn projected_state(&self) -> &AccountantState { &self.projected }

    /// Moves the reserved amount into the used counters. Fails with `JobClosed` if the
    /// job was finalized since the reservation was taken; the amount is then released.
    pub fn commit(mut self) -> PrivacyResult<AccountantState> {
        let status = self.ledger.status.read();
        if *status != LedgerStatus::Open { return Err(PrivacyError::JobClosed(self.ledger.job_id.clone())); }
        let mut row = self.ledger.client(&self.client_id)?.lock();
        row.reserved_epsilon = (row.reserved_epsilon - self.epsilon).max(0.0);
        row.reserved_delta = (row.reserved_delta - self.delta).max(0.0);
        row.budget.used_epsilon += self.epsilon;
        row.budget.used_delta += self.delta;
        row.history.push(ConsumptionRecord { epsilon: self.epsilon, delta: self.delta, mechanism: self.mechanism, at: Utc::now() });
        self.committed = true;
        debug!(job_id = %self.ledger.job_id, client_id = %self.client_id, epsilon = self.epsilon, used_epsilon = row.budget.used_epsilon, "privacy budget consumed");
        Ok(row.state())
    }
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        if self.committed { return; }
        if let Ok(row) = self.ledger.client(&self.client_id) {
            let mut row = row.lock();
            row.reserved_epsilon = (row.reserved_epsilon - self.epsilon).max(0.0);
            row.reserved_delta = (row.reserved_delta - self.delta).max(0.0);
            debug!(job_id = %self.ledger.job_id, client_id = %self.client_id, epsilon = self.epsilon, "privacy budget reservation released");
        }
    }
}

/// Single source of truth for spent and remaining (ε, δ).
#[derive(Default)]
pub struct PrivacyBudgetAccountant {
    jobs: RwLock<HashMap<String, Arc<JobLedger>>>,
    // lock order: `jobs` before `retired`
    retired: Mutex<Retired<DateTime<Utc>>>,
}

impl PrivacyBudgetAccountant {
    pub fn new() -> Self { Self::default() }

    fn ledger(&self, job_id: &str) -> PrivacyResult<Arc<JobLedger>> {
        if let Some(ledger) = self.jobs.read().get(job_id).cloned() { return Ok(ledger); }
        if self.retired.lock().contains(job_id) { Err(PrivacyError::JobClosed(job_id.to_string())) } else { Err(PrivacyError::UnknownJob(job_id.to_string())) }
    }

    /// Creates the job ledger with one row per client, each capped at
    /// `min(preferred max_epsilon, total_epsilon)`. A finalized job id may be reused.
    pub fn initialize_job(&self, job_id: &str, total_epsilon: f64, total_delta: f64, clients: &[FederatedClient]) -> PrivacyResult<()> {
        if !total_epsilon.is_finite() || total_epsilon <= 0.0 { return Err(PrivacyError::InvalidParameter(format!("total_epsilon must be > 0, got {total_epsilon}"))); }
        if !total_delta.is_finite() || total_delta < 0.0 { return Err(PrivacyError::InvalidParameter(format!("total_delta must be >= 0, got {total_delta}"))); }
        let mut rows = HashMap::with_capacity(clients.len());
        for client in clients {
            let preferred = client.privacy_preferences.max_epsilon.unwrap_or(total_epsilon);
            if !preferred.is_finite() || preferred < 0.0 {
                return Err(PrivacyError::InvalidParameter(format!("client {} max_epsilon must be >= 0, got {preferred}", client.client_id)));
            }
            let budget = ClientPrivacyBudget { max_epsilon: preferred.min(total_epsilon), max_delta: total_delta, used_epsilon: 0.0, used_delta: 0.0 };
            let row = ClientLedger { budget, reserved_epsilon: 0.0, reserved_delta: 0.0, history: Vec::new() };
            if rows.insert(client.client_id.clone(), Mutex::new(row)).is_some() {
                return Err(PrivacyError::InvalidParameter(format!("duplicate client {} in roster", client.client_id)));
            }
        }
        let mut jobs = self.jobs.write();
        if jobs.get(job_id).map(|l| l.is_open()).unwrap_or(false) { return Err(PrivacyError::JobAlreadyActive(job_id.to_string())); }
        jobs.insert(job_id.to_string(), Arc::new(JobLedger {
            job_id: job_id.to_string(),
            total_epsilon,
            total_delta,
            created_at: Utc::now(),
            status: RwLock::new(LedgerStatus::Open),
            clients: rows,
        }));
        self.retired.lock().remove(job_id);
        info!(job_id, total_epsilon, total_delta, clients = clients.len(), "privacy budget initialized");
        Ok(())
    }

    /// Atomically checks and holds (ε, δ) for one client. Nothing is spent until commit.
    pub fn reserve(&self, job_id: &str, client_id: &str, epsilon: f64, delta: f64, mechanism: NoiseMechanism) -> PrivacyResult<BudgetReservation> {
        if !epsilon.is_finite() || epsilon < 0.0 || !delta.is_finite() || delta < 0.0 {
            return Err(PrivacyError::InvalidParameter(format!("consumption must be non-negative, got epsilon={epsilon} delta={delta}")));
        }
        let ledger = self.ledger(job_id)?;
        let projected = {
            let status = ledger.status.read();
            if *status != LedgerStatus::Open { return Err(PrivacyError::JobClosed(job_id.to_string())); }
            let mut row = ledger.client(client_id)?.lock();
            let available_epsilon = row.available_epsilon();
            if epsilon > available_epsilon + BUDGET_TOLERANCE {
                warn!(job_id, client_id, epsilon, available_epsilon, "privacy budget exceeded");
                return Err(PrivacyError::BudgetExceeded { client_id: client_id.to_string(), dimension: BudgetDimension::Epsilon, required: epsilon, available: available_epsilon });
            }
            let available_delta = row.available_delta();
            if delta > available_delta + BUDGET_TOLERANCE * available_delta.max(f64::MIN_POSITIVE) {
                warn!(job_id, client_id, delta, available_delta, "privacy budget exceeded");
                return Err(PrivacyError::BudgetExceeded { client_id: client_id.to_string(), dimension: BudgetDimension::Delta, required: delta, available: available_delta });
            }
            row.reserved_epsilon += epsilon;
            row.reserved_delta += delta;
            let mut projected = row.state();
            projected.used_epsilon += epsilon;
            projected.used_delta += delta;
            projected
        };
        Ok(BudgetReservation { ledger, client_id: client_id.to_string(), epsilon, delta, mechanism, projected, committed: false })
    }

    /// Reserve and commit in one step.
    pub fn record_consumption(&self, job_id: &str, client_id: &str, epsilon: f64, delta: f64, mechanism: NoiseMechanism) -> PrivacyResult<AccountantState> {
        self.reserve(job_id, client_id, epsilon, delta, mechanism)?.commit()
    }

    /// Spendable (ε, δ): cap minus used minus outstanding reservations.
    pub fn remaining_budget(&self, job_id: &str, client_id: &str) -> PrivacyResult<(f64, f64)> {
        let ledger = self.ledger(job_id)?;
        let row = ledger.client(client_id)?.lock();
        Ok((row.available_epsilon(), row.available_delta()))
    }

    pub fn client_budget(&self, job_id: &str, client_id: &str) -> PrivacyResult<ClientPrivacyBudget> {
        let ledger = self.ledger(job_id)?;
        let budget = ledger.client(client_id)?.lock().budget.clone();
        Ok(budget)
    }

    pub fn accountant_state(&self, job_id: &str, client_id: &str) -> PrivacyResult<AccountantState> {
        let ledger = self.ledger(job_id)?;
        let state = ledger.client(client_id)?.lock().state();
        Ok(state)
    }

    pub fn consumption_history(&self, job_id: &str, client_id: &str) -> PrivacyResult<Vec<ConsumptionRecord>> {
        let ledger = self.ledger(job_id)?;
        let history = ledger.client(client_id)?.lock().history.clone();
        Ok(history)
    }

    pub fn is_open(&self, job_id: &str) -> bool { self.jobs.read().get(job_id).map(|l| l.is_open()).unwrap_or(false) }

    /// `UnknownJob` if never initialized, `JobClosed` once finalized.
    pub fn ensure_open(&self, job_id: &str) -> PrivacyResult<()> {
        if self.ledger(job_id)?.is_open() { Ok(()) } else { Err(PrivacyError::JobClosed(job_id.to_string())) }
    }

    /// Clients that still hold a row in any open job.
    pub fn open_job_clients(&self) -> HashSet<String> {
        self.jobs.read().values().filter(|l| l.is_open()).flat_map(|l| l.clients.keys().cloned()).collect()
    }

    pub fn job_clients(&self, job_id: &str) -> PrivacyResult<Vec<String>> {
        let ledger = self.ledger(job_id)?;
        let mut ids: Vec<String> = ledger.clients.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Closes the ledger and drops it from the job map. Returns `None` if it was already
    /// closed.
    pub fn finalize(&self, job_id: &str) -> PrivacyResult<Option<LedgerSummary>> {
        let ledger = match self.ledger(job_id) {
            Ok(ledger) => ledger,
            Err(PrivacyError::JobClosed(_)) => { debug!(job_id, "privacy budget already finalized"); return Ok(None); }
            Err(e) => return Err(e),
        };
        let finalized_at = {
            let mut status = ledger.status.write();
            if let LedgerStatus::Closed { at } = *status { debug!(job_id, closed_at = %at, "privacy budget already finalized"); return Ok(None); }
            let now = Utc::now();
            *status = LedgerStatus::Closed { at: now };
            now
        };
        let mut clients = BTreeMap::new();
        let mut consumption_count = 0;
        for (id, row) in &ledger.clients {
            let row = row.lock();
            consumption_count += row.history.len();
            clients.insert(id.clone(), row.budget.clone());
        }
        {
            let mut jobs = self.jobs.write();
            // a re-initialized ledger under the same id is not ours to drop
            if jobs.get(job_id).map(|l| Arc::ptr_eq(l, &ledger)).unwrap_or(false) { jobs.remove(job_id); }
            self.retired.lock().insert(job_id, finalized_at);
        }
        let summary = LedgerSummary { job_id: job_id.to_string(), total_epsilon: ledger.total_epsilon, total_delta: ledger.total_delta, clients, consumption_count, created_at: ledger.created_at, finalized_at };
        info!(job_id, used_epsilon = summary.used_epsilon(), consumptions = consumption_count, "privacy budget finalized");
        Ok(Some(summary))
    }

    /// Ledgers still held in memory; finalized jobs are not counted.
    pub fn tracked_job_count(&self) -> usize { self.jobs.read().len() }

    pub fn active_job_count(&self) -> usize { self.jobs.read().values().filter(|l| l.is_open()).count() }

    /// Σ used ε / Σ max ε over all open jobs; 0 when nothing is open.
    pub fn utilization(&self) -> f64 {
        let jobs = self.jobs.read();
        let (used, max) = jobs.values().filter(|l| l.is_open()).flat_map(|l| l.clients.values()).fold((0.0, 0.0), |(u, m), row| {
            let row = row.lock();
            (u + row.budget.used_epsilon, m + row.budget.max_epsilon)
        });
        if max > 0.0 { used / max } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    fn accountant_with(job: &str, total: f64, clients: &[(&str, Option<f64>)]) -> PrivacyBudgetAccountant {
        let acc = PrivacyBudgetAccountant::new();
        let roster: Vec<FederatedClient> = clients.iter().map(|(id, max)| FederatedClient::new(*id, *max)).collect();
        acc.initialize_job(job, total, 1e-5, &roster).unwrap();
        acc
    }

    #[test]
    fn caps_at_job_total() {
        let acc = accountant_with("j", 4.0, &[("a", Some(10.0)), ("b", Some(2.0)), ("c", None)]);
        assert_eq!(acc.client_budget("j", "a").unwrap().max_epsilon, 4.0);
        assert_eq!(acc.client_budget("j", "b").unwrap().max_epsilon, 2.0);
        assert_eq!(acc.client_budget("j", "c").unwrap().max_epsilon, 4.0);
    }

    #[test]
    fn rejects_overspend_without_mutation() {
        let acc = accountant_with("j", 8.0, &[("a", Some(1.0))]);
        acc.record_consumption("j", "a", 1.0, 0.0, NoiseMechanism::Staircase).unwrap();
        let err = acc.record_consumption("j", "a", 0.1, 0.0, NoiseMechanism::Staircase).unwrap_err();
        assert!(matches!(err, PrivacyError::BudgetExceeded { dimension: BudgetDimension::Epsilon, .. }));
        assert_eq!(acc.client_budget("j", "a").unwrap().used_epsilon, 1.0);
    }

    #[test]
    fn delta_is_capped_too() {
        let acc = accountant_with("j", 8.0, &[("a", None)]);
        acc.record_consumption("j", "a", 1.0, 1e-5, NoiseMechanism::Gaussian).unwrap();
        let err = acc.record_consumption("j", "a", 1.0, 1e-5, NoiseMechanism::Gaussian).unwrap_err();
        assert!(matches!(err, PrivacyError::BudgetExceeded { dimension: BudgetDimension::Delta, .. }));
    }

    #[test]
    fn equal_slices_spend_the_whole_budget() {
        let acc = accountant_with("j", 0.8, &[("a", None)]);
        for _ in 0..8 { acc.record_consumption("j", "a", 0.1, 0.0, NoiseMechanism::Laplace).unwrap(); }
        assert!(acc.record_consumption("j", "a", 0.1, 0.0, NoiseMechanism::Laplace).is_err());
    }

    #[test]
    fn dropped_reservation_is_released() {
        let acc = accountant_with("j", 2.0, &[("a", None)]);
        let r = acc.reserve("j", "a", 1.5, 0.0, NoiseMechanism::Staircase).unwrap();
        assert_eq!(r.projected_state().used_epsilon, 1.5);
        assert!((acc.remaining_budget("j", "a").unwrap().0 - 0.5).abs() < 1e-12);
        assert!(acc.reserve("j", "a", 1.0, 0.0, NoiseMechanism::Staircase).is_err());
        drop(r);
        assert_eq!(acc.remaining_budget("j", "a").unwrap().0, 2.0);
        assert_eq!(acc.client_budget("j", "a").unwrap().used_epsilon, 0.0);
    }

    #[test]
    fn finalize_is_idempotent_and_blocks_commits() {
        let acc = accountant_with("j", 2.0, &[("a", None)]);
        let pending = acc.reserve("j", "a", 1.0, 0.0, NoiseMechanism::Staircase).unwrap();
        let summary = acc.finalize("j").unwrap().expect("first finalize returns summary");
        assert_eq!(summary.clients.len(), 1);
        assert!(acc.finalize("j").unwrap().is_none());
        assert!(matches!(pending.commit(), Err(PrivacyError::JobClosed(_))));
        assert!(matches!(acc.record_consumption("j", "a", 0.5, 0.0, NoiseMechanism::Staircase), Err(PrivacyError::JobClosed(_))));
        assert_eq!(summary.clients["a"].used_epsilon, 0.0);
        assert_eq!(acc.active_job_count(), 0);
    }

    #[test]
    fn finalized_ledgers_are_released() {
        let acc = accountant_with("j", 2.0, &[("a", None)]);
        acc.initialize_job("k", 2.0, 1e-5, &[FederatedClient::new("a", None)]).unwrap();
        assert_eq!(acc.tracked_job_count(), 2);
        acc.finalize("j").unwrap();
        assert_eq!(acc.tracked_job_count(), 1);
        assert!(matches!(acc.client_budget("j", "a"), Err(PrivacyError::JobClosed(_))));
        assert!(matches!(acc.ensure_open("j"), Err(PrivacyError::JobClosed(_))));
        assert!(matches!(acc.ensure_open("never"), Err(PrivacyError::UnknownJob(_))));
        assert!(!acc.is_open("j"));
        acc.initialize_job("j", 1.0, 1e-5, &[FederatedClient::new("a", None)]).unwrap();
        acc.ensure_open("j").unwrap();
    }

    #[test]
    fn reinitialize_requires_closed_job() {
        let acc = accountant_with("j", 2.0, &[("a", None)]);
        assert!(matches!(acc.initialize_job("j", 2.0, 1e-5, &[]), Err(PrivacyError::JobAlreadyActive(_))));
        acc.finalize("j").unwrap();
        acc.initialize_job("j", 3.0, 1e-5, &[FederatedClient::new("a", None)]).unwrap();
        assert_eq!(acc.client_budget("j", "a").unwrap().max_epsilon, 3.0);
    }

    #[test]
    fn concurrent_consumption_never_overspends() {
        let acc = accountant_with("j", 5.0, &[("a", None)]);
        let successes = (0..64).into_par_iter().filter(|_| acc.record_consumption("j", "a", 1.0, 0.0, NoiseMechanism::Staircase).is_ok()).count();
        assert_eq!(successes, 5);
        assert_eq!(acc.client_budget("j", "a").unwrap().used_epsilon, 5.0);
        assert_eq!(acc.consumption_history("j", "a").unwrap().len(), 5);
    }

    #[test]
    fn utilization_tracks_open_jobs() {
        let acc = accountant_with("j", 4.0, &[("a", None), ("b", None)]);
        acc.record_consumption("j", "a", 2.0, 0.0, NoiseMechanism::Staircase).unwrap();
        assert!((acc.utilization() - 0.25).abs() < 1e-12);
        acc.finalize("j").unwrap();
        assert_eq!(acc.utilization(), 0.0);
    }
}

//! Threshold-gated aggregation sessions.
//!
//! Session lifecycle: `Created -> Collecting -> Aggregated` or `... -> Aborted`. Finished
//! sessions leave the live map and keep only their final state in a bounded record. Each
//! session sits behind its own mutex, so exactly one caller can observe "threshold met"
//! and perform the terminal aggregation. The coordinator only combines; ciphertexts are
//! averaged as-is and never decrypted here.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::error::{PrivacyError, PrivacyResult};
use crate::retired::Retired;
use crate::telemetry::PRIVACY_METRICS;
use crate::types::{EncryptionTag, ModelParameters, ModelUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState { Created, Collecting, Aggregated, Aborted }

impl SessionState {
    pub fn is_terminal(&self) -> bool { matches!(self, SessionState::Aggregated | SessionState::Aborted) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecureAggregationSession {
    pub session_id: String,
    pub job_id: String,
    pub client_ids: BTreeSet<String>,
    pub threshold: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    session: SecureAggregationSession,
    state: SessionState,
    contributions: BTreeMap<String, ModelUpdate>,
    started_at: Instant,
}

impl SessionEntry {
    fn ensure_open(&self) -> PrivacyResult<()> {
        if self.state.is_terminal() { Err(PrivacyError::SessionClosed(self.session.session_id.clone())) } else { Ok(()) }
    }

    fn ensure_job(&self, update: &ModelUpdate) -> PrivacyResult<()> {
        if update.job_id() == self.session.job_id { Ok(()) } else {
            Err(PrivacyError::JobMismatch { session_id: self.session.session_id.clone(), expected: self.session.job_id.clone(), found: update.job_id().to_string() })
        }
    }

    fn ensure_member(&self, client_id: &str) -> PrivacyResult<()> {
        if self.session.client_ids.contains(client_id) { Ok(()) } else {
            Err(PrivacyError::UnknownParticipant { session_id: self.session.session_id.clone(), client_id: client_id.to_string() })
        }
    }
}

pub struct SecureAggregationCoordinator {
    max_clients: usize,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionEntry>>>>,
    // a session entry is never locked while `sessions` is held, nor the reverse
    retired: Mutex<Retired<SessionState>>,
    closed_jobs: Mutex<Retired<()>>,
}

impl SecureAggregationCoordinator {
    pub fn new(max_clients: usize) -> Self {
        Self { max_clients, sessions: RwLock::new(HashMap::new()), retired: Mutex::new(Retired::default()), closed_jobs: Mutex::new(Retired::default()) }
    }

    fn entry(&self, session_id: &str) -> PrivacyResult<Arc<Mutex<SessionEntry>>> {
        if let Some(entry) = self.sessions.read().get(session_id).cloned() { return Ok(entry); }
        if self.retired.lock().contains(session_id) { Err(PrivacyError::SessionClosed(session_id.to_string())) } else { Err(PrivacyError::UnknownSession(session_id.to_string())) }
    }

    /// Drops a finished session from the live map, remembering its final state.
    fn retire(&self, session_id: &str, state: SessionState) {
        self.retired.lock().insert(session_id, state);
        self.sessions.write().remove(session_id);
    }

    /// `threshold` must satisfy `1 <= threshold <= |client_ids|` (after de-duplication).
    pub fn create_session(&self, job_id: &str, session_id: &str, client_ids: &[String], threshold: usize) -> PrivacyResult<SecureAggregationSession> {
        let members: BTreeSet<String> = client_ids.iter().cloned().collect();
        if threshold == 0 || threshold > members.len() {
            return Err(PrivacyError::InvalidThreshold { threshold, participants: members.len() });
        }
        if members.len() > self.max_clients {
            return Err(PrivacyError::InvalidParameter(format!("session {session_id} has {} clients, max is {}", members.len(), self.max_clients)));
        }
        let session = SecureAggregationSession { session_id: session_id.to_string(), job_id: job_id.to_string(), client_ids: members, threshold, created_at: Utc::now() };
        let mut sessions = self.sessions.write();
        if self.closed_jobs.lock().contains(job_id) { return Err(PrivacyError::JobClosed(job_id.to_string())); }
        if sessions.contains_key(session_id) || self.retired.lock().contains(session_id) {
            return Err(PrivacyError::InvalidParameter(format!("session {session_id} already exists")));
        }
        sessions.insert(session_id.to_string(), Arc::new(Mutex::new(SessionEntry { session: session.clone(), state: SessionState::Created, contributions: BTreeMap::new(), started_at: Instant::now() })));
        info!(job_id, session_id, participants = session.client_ids.len(), threshold, "secure aggregation session created");
        Ok(session)
    }

    /// Records one participant's contribution; returns the number collected so far.
    pub fn submit_contribution(&self, session_id: &str, update: ModelUpdate) -> PrivacyResult<usize> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock();
        entry.ensure_open()?;
        entry.ensure_member(&update.client_id)?;
        entry.ensure_job(&update)?;
        if entry.contributions.contains_key(&update.client_id) {
            return Err(PrivacyError::DuplicateContribution { session_id: session_id.to_string(), client_id: update.client_id });
        }
        entry.contributions.insert(update.client_id.clone(), update);
        entry.state = SessionState::Collecting;
        Ok(entry.contributions.len())
    }

    /// Combines the supplied updates. Requires at least `threshold` distinct participants.
    pub fn aggregate(&self, session_id: &str, updates: &[ModelUpdate]) -> PrivacyResult<ModelParameters> {
        let entry = self.entry(session_id)?;
        let combined = {
            let mut entry = entry.lock();
            entry.ensure_open()?;
            let mut seen = BTreeSet::new();
            for u in updates {
                entry.ensure_member(&u.client_id)?;
                entry.ensure_job(u)?;
                if !seen.insert(u.client_id.as_str()) {
                    return Err(PrivacyError::DuplicateContribution { session_id: session_id.to_string(), client_id: u.client_id.clone() });
                }
            }
            let params: Vec<&ModelParameters> = updates.iter().map(|u| &u.parameters).collect();
            Self::finish(&mut entry, &params)?
        };
        self.retire(session_id, SessionState::Aggregated);
        Ok(combined)
    }

    /// Combines the contributions accumulated through [`submit_contribution`](Self::submit_contribution).
    pub fn aggregate_collected(&self, session_id: &str) -> PrivacyResult<ModelParameters> {
        let entry = self.entry(session_id)?;
        let combined = {
            let mut entry = entry.lock();
            entry.ensure_open()?;
            let collected: Vec<ModelUpdate> = entry.contributions.values().cloned().collect();
            let params: Vec<&ModelParameters> = collected.iter().map(|u| &u.parameters).collect();
            Self::finish(&mut entry, &params)?
        };
        self.retire(session_id, SessionState::Aggregated);
        Ok(combined)
    }

    fn finish(entry: &mut SessionEntry, params: &[&ModelParameters]) -> PrivacyResult<ModelParameters> {
        if params.len() < entry.session.threshold {
            return Err(PrivacyError::InsufficientContributions { required: entry.session.threshold, received: params.len() });
        }
        let started = Instant::now();
        let combined = combine(params)?;
        entry.state = SessionState::Aggregated;
        entry.contributions.clear();
        PRIVACY_METRICS.aggregation_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        PRIVACY_METRICS.aggregations_total.add(1, &[]);
        info!(job_id = %entry.session.job_id, session_id = %entry.session.session_id, contributions = params.len(), session_age_ms = entry.started_at.elapsed().as_millis() as u64, "secure aggregation completed");
        Ok(combined)
    }

    /// Closes the job: no new sessions, every open session aborted and dropped. Returns the
    /// aborted session ids; repeat calls return none.
    pub fn abort_job(&self, job_id: &str) -> Vec<String> {
        let entries: Vec<Arc<Mutex<SessionEntry>>> = {
            let sessions = self.sessions.read();
            self.closed_jobs.lock().insert(job_id, ());
            sessions.values().cloned().collect()
        };
        let mut aborted = Vec::new();
        let mut finished = Vec::new();
        for entry in entries {
            let mut entry = entry.lock();
            if entry.session.job_id != job_id { continue; }
            if !entry.state.is_terminal() {
                entry.state = SessionState::Aborted;
                entry.contributions.clear();
                aborted.push(entry.session.session_id.clone());
            }
            finished.push((entry.session.session_id.clone(), entry.state));
        }
        for (session_id, state) in finished { self.retire(&session_id, state); }
        if !aborted.is_empty() {
            PRIVACY_METRICS.sessions_aborted_total.add(aborted.len() as u64, &[]);
            warn!(job_id, sessions = aborted.len(), "open aggregation sessions aborted");
        }
        aborted.sort();
        aborted
    }

    /// Allows sessions for a job id again, e.g. after its budget is re-initialized.
    pub fn reopen_job(&self, job_id: &str) { self.closed_jobs.lock().remove(job_id); }

    pub fn session(&self, session_id: &str) -> PrivacyResult<SecureAggregationSession> { Ok(self.entry(session_id)?.lock().session.clone()) }

    /// Live or final state; final states are kept for a bounded number of finished sessions.
    pub fn session_state(&self, session_id: &str) -> PrivacyResult<SessionState> {
        let live = self.sessions.read().get(session_id).cloned();
        if let Some(entry) = live { return Ok(entry.lock().state); }
        self.retired.lock().get(session_id).ok_or_else(|| PrivacyError::UnknownSession(session_id.to_string()))
    }

    pub fn contribution_count(&self, session_id: &str) -> PrivacyResult<usize> { Ok(self.entry(session_id)?.lock().contributions.len()) }

    pub fn open_session_count(&self) -> usize {
        let entries: Vec<Arc<Mutex<SessionEntry>>> = self.sessions.read().values().cloned().collect();
        entries.iter().filter(|e| !e.lock().state.is_terminal()).count()
    }

    /// Sessions held in memory, including any between their terminal transition and removal.
    pub fn tracked_session_count(&self) -> usize { self.sessions.read().len() }
}

/// Coordinate-wise mean of identically shaped parameters. Encrypted inputs must come from
/// distinct key holders with equal mask weights; the result carries the union of holders.
pub fn combine(params: &[&ModelParameters]) -> PrivacyResult<ModelParameters> {
    let first = *params.first().ok_or(PrivacyError::InsufficientContributions { required: 1, received: 0 })?;
    if let Some(p) = params.iter().find(|p| !p.same_shape(first)) {
        return Err(PrivacyError::ShapeMismatch(format!("expected {} parameters in {} layers, got {} in {}", first.parameter_count, first.weights.len() + first.biases.len(), p.parameter_count, p.weights.len() + p.biases.len())));
    }
    let encrypted = first.is_encrypted();
    if params.iter().any(|p| p.is_encrypted() != encrypted) {
        return Err(PrivacyError::InvalidParameter("cannot aggregate encrypted and plaintext parameters together".into()));
    }
    let n = params.len() as f64;
    let tag = if encrypted { Some(combined_tag(params, n)?) } else { None };
    let mut layer_index = 0usize;
    let all_layers: Vec<Vec<&[f64]>> = params.iter().map(|p| p.iter_layers().map(|(_, _, v)| v).collect()).collect();
    let mut out = first.try_map_layers(|_, _, values| {
        let mut acc = vec![0.0f64; values.len()];
        for layers in &all_layers {
            for (a, v) in acc.iter_mut().zip(layers[layer_index]) { *a += *v; }
        }
        for a in &mut acc { *a /= n; }
        layer_index += 1;
        Ok(acc)
    })?;
    out.compression_info.homomorphic_encryption = encrypted;
    out.compression_info.encryption = tag;
    Ok(out)
}

fn combined_tag(params: &[&ModelParameters], n: f64) -> PrivacyResult<EncryptionTag> {
    let tags: Vec<&EncryptionTag> = params.iter().map(|p| p.compression_info.encryption.as_ref().ok_or_else(|| PrivacyError::EncryptionFailure("encrypted parameters without encryption tag".into()))).collect::<PrivacyResult<_>>()?;
    let base = tags[0];
    let mut holders = BTreeSet::new();
    for t in &tags {
        if t.scheme != base.scheme || t.key_size != base.key_size {
            return Err(PrivacyError::EncryptionFailure("ciphertexts use different encryption parameters".into()));
        }
        if (t.mask_weight - base.mask_weight).abs() > f64::EPSILON {
            return Err(PrivacyError::EncryptionFailure("ciphertexts carry different aggregation weights".into()));
        }
        for h in &t.key_holders {
            if !holders.insert(h.clone()) { return Err(PrivacyError::EncryptionFailure(format!("key holder {h} appears in more than one ciphertext"))); }
        }
    }
    Ok(EncryptionTag { scheme: base.scheme, key_size: base.key_size, key_holders: holders.into_iter().collect(), mask_weight: base.mask_weight / n })
}

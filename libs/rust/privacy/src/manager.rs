//! Privacy manager: the orchestrator-facing surface of the privacy core.
//!
//! Protection pipeline for one update:
//! 1. reserve (ε, δ) for the client (atomic check, nothing spent yet)
//! 2. sensitivity + calibrated noise on a copy of the parameters
//! 3. optional homomorphic encryption, retried on the already-noised copy
//! 4. proof
//! 5. commit the reservation; any earlier failure drops it and releases the budget
//!
//! The input update is never modified.

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::budget::{ClientPrivacyBudget, PrivacyBudgetAccountant};
use crate::config::PrivacyConfig;
use crate::encryption::{check_overhead, HomomorphicBackend, HomomorphicEncryptionGateway};
use crate::error::{PrivacyError, PrivacyResult};
use crate::events::PrivacyEvent;
use crate::noise::{self, entropy_rng_factory, NoiseMechanism, RngFactory};
use crate::proof::PrivacyProofValidator;
use crate::secure_aggregation::{SecureAggregationCoordinator, SecureAggregationSession};
use crate::telemetry::{record_validation_failure, PRIVACY_METRICS};
use crate::types::{FederatedClient, ModelParameters, ModelUpdate, PrivacyJob, PrivacyProof};
use chrono::Utc;

/// Mechanism name carried by proofs of updates protected without differential privacy.
pub const NO_MECHANISM: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationCheck { Budget, Proof, ParameterBounds }

impl ValidationCheck {
    fn as_str(&self) -> &'static str {
        match self { ValidationCheck::Budget => "budget", ValidationCheck::Proof => "proof", ValidationCheck::ParameterBounds => "parameter_bounds" }
    }
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// First failing check of [`PrivacyManager::validate_update`].
#[derive(Debug, Error)]
#[error("{check} check failed: {error}")]
pub struct ValidationFailure {
    pub check: ValidationCheck,
    #[source]
    pub error: PrivacyError,
}

#[derive(Debug, Clone)]
pub struct AggregationResult {
    pub job_id: String,
    pub session_id: String,
    pub contributions: usize,
    pub parameters: ModelParameters,
}

impl AggregationResult {
    pub fn event(&self) -> PrivacyEvent {
        PrivacyEvent::AggregationCompleted { job_id: self.job_id.clone(), session_id: self.session_id.clone(), contributions: self.contributions, encrypted: self.parameters.is_encrypted() }
    }
}

/// Read-only snapshot for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyMetricsSnapshot {
    pub budget_utilization: f64,
    pub active_budgets: usize,
    pub active_sessions: usize,
    pub encryption_contexts: usize,
    pub differential_privacy_enabled: bool,
    pub mechanism: NoiseMechanism,
    pub encryption_enabled: bool,
    pub aggregation_enabled: bool,
}

pub struct PrivacyManager {
    config: PrivacyConfig,
    accountant: PrivacyBudgetAccountant,
    gateway: HomomorphicEncryptionGateway,
    coordinator: SecureAggregationCoordinator,
    validator: PrivacyProofValidator,
    rng_factory: RngFactory,
    // ms spent on noise for the last protected update; baseline for the encryption overhead warning
    last_plaintext_ms: RwLock<f64>,
}

impl PrivacyManager {
    pub fn new(config: PrivacyConfig) -> PrivacyResult<Self> {
        config.validate()?;
        Ok(Self {
            accountant: PrivacyBudgetAccountant::new(),
            gateway: HomomorphicEncryptionGateway::new(config.homomorphic_encryption.clone()),
            coordinator: SecureAggregationCoordinator::new(config.secure_aggregation.max_clients),
            validator: PrivacyProofValidator::new(config.parameter_bound),
            rng_factory: entropy_rng_factory(),
            last_plaintext_ms: RwLock::new(0.0),
            config,
        })
    }

    /// Loads configuration from file/env (see [`PrivacyConfig::load`]).
    pub fn from_env() -> anyhow::Result<Self> { Ok(Self::new(PrivacyConfig::load()?)?) }

    /// Replaces the noise randomness source, e.g. with a fixed seed for tests.
    pub fn with_rng_factory(mut self, rng_factory: RngFactory) -> Self { self.rng_factory = rng_factory; self }

    /// Replaces the homomorphic encryption backend.
    pub fn with_backend(mut self, backend: Arc<dyn HomomorphicBackend>) -> Self {
        self.gateway = HomomorphicEncryptionGateway::with_backend(self.config.homomorphic_encryption.clone(), backend);
        self
    }

    pub fn config(&self) -> &PrivacyConfig { &self.config }

    pub fn accountant(&self) -> &PrivacyBudgetAccountant { &self.accountant }

    pub fn coordinator(&self) -> &SecureAggregationCoordinator { &self.coordinator }

    /// Creates encryption contexts (when enabled) and then opens the job's ledger. A failure
    /// at either step discards the contexts created here, so the call can be retried.
    pub fn initialize_privacy_budget(&self, job: &PrivacyJob, clients: &[FederatedClient]) -> PrivacyResult<PrivacyEvent> {
        let mut created: Vec<String> = Vec::new();
        if self.config.homomorphic_encryption.enabled {
            for client in clients {
                if self.gateway.has_context(&client.client_id) { continue; }
                if let Err(e) = self.gateway.register_client(&client.client_id) {
                    self.gateway.drop_clients(&created);
                    return Err(e);
                }
                created.push(client.client_id.clone());
            }
        }
        if let Err(e) = self.accountant.initialize_job(&job.job_id, job.total_epsilon, job.total_delta, clients) {
            self.gateway.drop_clients(&created);
            return Err(e);
        }
        self.coordinator.reopen_job(&job.job_id);
        Ok(PrivacyEvent::BudgetInitialized { job_id: job.job_id.clone(), clients: clients.len(), total_epsilon: job.total_epsilon, total_delta: job.total_delta })
    }

    /// Protects the update with the job's configured mechanism.
    pub fn apply_privacy_protection(&self, update: &ModelUpdate) -> PrivacyResult<ModelUpdate> {
        self.apply_privacy_protection_with(update, self.config.differential_privacy.mechanism)
    }

    /// Protects the update with an explicit mechanism, e.g. a cheaper one requested by the
    /// orchestrator after a budget rejection.
    pub fn apply_privacy_protection_with(&self, update: &ModelUpdate, mechanism: NoiseMechanism) -> PrivacyResult<ModelUpdate> {
        let started = Instant::now();
        let job_id = update.job_id();
        let client_id = update.client_id.as_str();
        if update.parameters.is_encrypted() {
            return Err(PrivacyError::InvalidParameter(format!("update {} is already encrypted", update.update_id)));
        }
        let dp = &self.config.differential_privacy;

        let (parameters, reservation) = if dp.enabled {
            noise::validate_parameters(mechanism, dp.epsilon, dp.delta)?;
            let delta_cost = if mechanism.uses_delta() { dp.delta } else { 0.0 };
            let reservation = self.accountant.reserve(job_id, client_id, dp.epsilon, delta_cost, mechanism).map_err(|e| {
                if e.is_budget_error() { PRIVACY_METRICS.budget_rejections_total.add(1, &[]); }
                e
            })?;
            let flat = update.parameters.flatten();
            let sensitivity = noise::sensitivity(&flat);
            let mut rng = (self.rng_factory)();
            let noise = noise::generate(mechanism, flat.len(), dp.epsilon, dp.delta, sensitivity, &mut rng)?;
            debug!(job_id, client_id, %mechanism, sensitivity, parameters = flat.len(), "noise generated");
            (update.parameters.add_flat(&noise)?, Some(reservation))
        } else {
            self.accountant.ensure_open(job_id)?;
            (update.parameters.clone(), None)
        };
        let plaintext_ms = started.elapsed().as_secs_f64() * 1000.0;

        let parameters = if self.config.homomorphic_encryption.enabled {
            let enc_started = Instant::now();
            let encrypted = self.encrypt_with_retry(&parameters, client_id)?;
            let encrypt_ms = enc_started.elapsed().as_secs_f64() * 1000.0;
            check_overhead(encrypt_ms, plaintext_ms.max(*self.last_plaintext_ms.read()), self.gateway.overhead_threshold());
            encrypted
        } else {
            parameters
        };
        *self.last_plaintext_ms.write() = plaintext_ms;

        let privacy_proof = match &reservation {
            Some(r) => self.validator.generate(mechanism, dp.epsilon, dp.delta, &parameters, r.projected_state())?,
            None => PrivacyProof { mechanism_applied: NO_MECHANISM.to_string(), privacy_accountant_state: self.accountant.accountant_state(job_id, client_id)?, ..PrivacyProof::default() },
        };
        if let Some(r) = reservation {
            let state = r.commit()?;
            debug!(job_id, client_id, used_epsilon = state.used_epsilon, max_epsilon = state.max_epsilon, "budget committed");
        }

        let mut protected = ModelUpdate { parameters, privacy_proof, timestamp: Utc::now(), ..update.clone() };
        protected.integrity_hash = protected.compute_integrity_hash();
        PRIVACY_METRICS.protected_updates_total.add(1, &[]);
        PRIVACY_METRICS.protection_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
        info!(job_id, client_id, update_id = %protected.update_id, round = protected.round_number, mechanism = %protected.privacy_proof.mechanism_applied, encrypted = protected.parameters.is_encrypted(), "privacy protection applied");
        Ok(protected)
    }

    fn encrypt_with_retry(&self, parameters: &ModelParameters, client_id: &str) -> PrivacyResult<ModelParameters> {
        let attempts = self.config.encryption_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.gateway.encrypt(parameters, client_id) {
                Ok(encrypted) => return Ok(encrypted),
                Err(e) => {
                    PRIVACY_METRICS.encryption_failures_total.add(1, &[]);
                    if !e.is_retryable() || attempt >= attempts {
                        warn!(client_id, attempt, error = %e, "encryption failed, update not released");
                        return Err(e);
                    }
                    warn!(client_id, attempt, error = %e, "encryption failed, retrying with the same noised parameters");
                }
            }
        }
    }

    /// Protects a round's updates in parallel; one result per input, in order.
    pub fn protect_batch(&self, updates: &[ModelUpdate]) -> Vec<PrivacyResult<ModelUpdate>> {
        updates.par_iter().map(|u| self.apply_privacy_protection(u)).collect()
    }

    /// Budget, then proof well-formedness, then parameter bounds; stops at the first
    /// failure. Budget and proof checks apply only when differential privacy is enabled.
    pub fn validate_update(&self, update: &ModelUpdate) -> Result<(), ValidationFailure> {
        let fail = |check: ValidationCheck, error: PrivacyError| {
            record_validation_failure(check.as_str());
            warn!(client_id = %update.client_id, update_id = %update.update_id, %check, error = %error, "update rejected");
            ValidationFailure { check, error }
        };
        if self.config.differential_privacy.enabled {
            let job_id = update.job_id();
            self.accountant.ensure_open(job_id)
                .and_then(|_| self.validator.check_budget(job_id, &update.client_id, &update.privacy_proof, &self.accountant))
                .map_err(|e| fail(ValidationCheck::Budget, e))?;
            self.validator.validate(&update.privacy_proof).map_err(|e| fail(ValidationCheck::Proof, e))?;
        }
        self.validator.check_parameter_bounds(&update.parameters).map_err(|e| fail(ValidationCheck::ParameterBounds, e))?;
        Ok(())
    }

    /// Opens a session over `client_ids` with the configured threshold, capped at the
    /// number of participants.
    pub fn setup_secure_aggregation(&self, job_id: &str, client_ids: &[String]) -> PrivacyResult<SecureAggregationSession> {
        let threshold = self.config.secure_aggregation.threshold.min(client_ids.len());
        self.setup_secure_aggregation_with_threshold(job_id, client_ids, threshold)
    }

    pub fn setup_secure_aggregation_with_threshold(&self, job_id: &str, client_ids: &[String], threshold: usize) -> PrivacyResult<SecureAggregationSession> {
        if !self.config.secure_aggregation.enabled {
            return Err(PrivacyError::InvalidParameter("secure aggregation is disabled".into()));
        }
        self.accountant.ensure_open(job_id)?;
        let session_id = format!("{job_id}-{}", Uuid::new_v4());
        self.coordinator.create_session(job_id, &session_id, client_ids, threshold)
    }

    pub fn submit_contribution(&self, session_id: &str, update: ModelUpdate) -> PrivacyResult<usize> {
        self.coordinator.submit_contribution(session_id, update)
    }

    pub fn perform_secure_aggregation(&self, session_id: &str, updates: &[ModelUpdate]) -> PrivacyResult<AggregationResult> {
        let session = self.coordinator.session(session_id)?;
        self.accountant.ensure_open(&session.job_id)?;
        let parameters = self.coordinator.aggregate(session_id, updates)?;
        Ok(AggregationResult { job_id: session.job_id, session_id: session.session_id, contributions: updates.len(), parameters })
    }

    pub fn perform_collected_aggregation(&self, session_id: &str) -> PrivacyResult<AggregationResult> {
        let session = self.coordinator.session(session_id)?;
        self.accountant.ensure_open(&session.job_id)?;
        let contributions = self.coordinator.contribution_count(session_id)?;
        let parameters = self.coordinator.aggregate_collected(session_id)?;
        Ok(AggregationResult { job_id: session.job_id, session_id: session.session_id, contributions, parameters })
    }

    /// Decrypts an (aggregated) ciphertext with the key material held by this manager.
    pub fn decrypt_parameters(&self, parameters: &ModelParameters) -> PrivacyResult<ModelParameters> { self.gateway.decrypt(parameters) }

    pub fn remaining_budget(&self, job_id: &str, client_id: &str) -> PrivacyResult<(f64, f64)> { self.accountant.remaining_budget(job_id, client_id) }

    pub fn client_budget(&self, job_id: &str, client_id: &str) -> PrivacyResult<ClientPrivacyBudget> { self.accountant.client_budget(job_id, client_id) }

    /// Closes the job for aggregation, aborting its open sessions, then finalizes the
    /// ledger. Repeat calls and unknown jobs return no events.
    pub fn cleanup_privacy_budget(&self, job_id: &str) -> PrivacyResult<Vec<PrivacyEvent>> {
        let mut events: Vec<PrivacyEvent> = self.coordinator.abort_job(job_id).into_iter().map(|session_id| PrivacyEvent::SessionAborted { job_id: job_id.to_string(), session_id }).collect();
        let summary = match self.accountant.finalize(job_id) {
            Ok(summary) => summary,
            Err(PrivacyError::UnknownJob(_)) => { debug!(job_id, "cleanup for unknown job ignored"); None }
            Err(e) => return Err(e),
        };
        if let Some(summary) = summary {
            let still_active = self.accountant.open_job_clients();
            let released: Vec<String> = summary.clients.keys().filter(|id| !still_active.contains(*id)).cloned().collect();
            self.gateway.drop_clients(&released);
            events.push(PrivacyEvent::BudgetFinalized { summary });
        }
        Ok(events)
    }

    pub fn get_privacy_metrics(&self) -> PrivacyMetricsSnapshot {
        PrivacyMetricsSnapshot {
            budget_utilization: self.accountant.utilization(),
            active_budgets: self.accountant.active_job_count(),
            active_sessions: self.coordinator.open_session_count(),
            encryption_contexts: self.gateway.context_count(),
            differential_privacy_enabled: self.config.differential_privacy.enabled,
            mechanism: self.config.differential_privacy.mechanism,
            encryption_enabled: self.config.homomorphic_encryption.enabled,
            aggregation_enabled: self.config.secure_aggregation.enabled,
        }
    }
}

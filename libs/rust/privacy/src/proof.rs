//! Privacy proofs: issued with every protected update, checked on receipt.
//!
//! A proof never lets the validator re-derive the noise. `noise_magnitude` is a comparable
//! audit figure, `characteristic_constant(δ) / ε`, fixed by the mechanism and budget.

use rayon::prelude::*;
use tracing::debug;

use crate::budget::PrivacyBudgetAccountant;
use crate::error::{BudgetDimension, PrivacyError, PrivacyResult};
use crate::noise::{self, NoiseMechanism};
use crate::types::{AccountantState, ModelParameters, PrivacyProof};

pub const DEFAULT_PARAMETER_BOUND: f64 = 1000.0;

/// Relative slack when comparing a received `noise_magnitude` to the expected figure.
const MAGNITUDE_TOLERANCE: f64 = 1e-9;

pub fn noise_magnitude(mechanism: NoiseMechanism, epsilon: f64, delta: f64) -> f64 {
    mechanism.characteristic_constant(delta) / epsilon
}

#[derive(Debug, Clone)]
pub struct PrivacyProofValidator {
    parameter_bound: f64,
}

impl Default for PrivacyProofValidator {
    fn default() -> Self { Self::new(DEFAULT_PARAMETER_BOUND) }
}

impl PrivacyProofValidator {
    pub fn new(parameter_bound: f64) -> Self { Self { parameter_bound } }

    pub fn parameter_bound(&self) -> f64 { self.parameter_bound }

    pub fn generate(&self, mechanism: NoiseMechanism, epsilon: f64, delta: f64, parameters: &ModelParameters, accountant_state: &AccountantState) -> PrivacyResult<PrivacyProof> {
        noise::validate_parameters(mechanism, epsilon, delta)?;
        let delta_used = if mechanism.uses_delta() { delta } else { 0.0 };
        let proof = PrivacyProof {
            epsilon_used: epsilon,
            delta_used,
            mechanism_applied: mechanism.as_str().to_string(),
            noise_magnitude: noise_magnitude(mechanism, epsilon, delta_used),
            privacy_accountant_state: accountant_state.clone(),
        };
        debug!(mechanism = %mechanism, epsilon, parameters = parameters.parameter_count, noise_magnitude = proof.noise_magnitude, "privacy proof generated");
        Ok(proof)
    }

    /// Well-formedness: positive ε, non-negative δ, a known mechanism, and figures that
    /// agree with each other.
    pub fn validate(&self, proof: &PrivacyProof) -> PrivacyResult<()> {
        if !proof.epsilon_used.is_finite() || proof.epsilon_used <= 0.0 {
            return Err(PrivacyError::InvalidProof(format!("epsilon_used must be > 0, got {}", proof.epsilon_used)));
        }
        if !proof.delta_used.is_finite() || proof.delta_used < 0.0 {
            return Err(PrivacyError::InvalidProof(format!("delta_used must be >= 0, got {}", proof.delta_used)));
        }
        let mechanism: NoiseMechanism = proof.mechanism_applied.parse().map_err(|e: PrivacyError| PrivacyError::InvalidProof(e.to_string()))?;
        if mechanism.uses_delta() && proof.delta_used <= 0.0 {
            return Err(PrivacyError::InvalidProof(format!("{mechanism} proof must carry delta_used > 0")));
        }
        let expected = noise_magnitude(mechanism, proof.epsilon_used, proof.delta_used);
        if (proof.noise_magnitude - expected).abs() > MAGNITUDE_TOLERANCE * expected.abs().max(1.0) {
            return Err(PrivacyError::InvalidProof(format!("noise_magnitude {} does not match {mechanism} at epsilon {}, expected {expected}", proof.noise_magnitude, proof.epsilon_used)));
        }
        let state = &proof.privacy_accountant_state;
        if state.used_epsilon > state.max_epsilon + MAGNITUDE_TOLERANCE || state.used_delta > state.max_delta * (1.0 + MAGNITUDE_TOLERANCE) {
            return Err(PrivacyError::InvalidProof(format!("accountant state over budget: used {} of {}", state.used_epsilon, state.max_epsilon)));
        }
        Ok(())
    }

    /// Rejects if the client's budget cannot cover the proof's (ε, δ).
    ///
    /// A proof whose accountant snapshot already includes its own spend, and which the
    /// ledger has caught up with, is checked against the budget as it stood before that
    /// spend; otherwise the spend must still fit in what remains.
    pub fn check_budget(&self, job_id: &str, client_id: &str, proof: &PrivacyProof, accountant: &PrivacyBudgetAccountant) -> PrivacyResult<()> {
        let (remaining_epsilon, remaining_delta) = accountant.remaining_budget(job_id, client_id)?;
        let ledger = accountant.accountant_state(job_id, client_id)?;
        let claimed = &proof.privacy_accountant_state;
        let available_epsilon = available_for(remaining_epsilon, ledger.used_epsilon, ledger.max_epsilon, claimed.used_epsilon, proof.epsilon_used);
        if available_epsilon < proof.epsilon_used {
            return Err(PrivacyError::InsufficientBudget { client_id: client_id.to_string(), dimension: BudgetDimension::Epsilon, required: proof.epsilon_used, available: available_epsilon });
        }
        let available_delta = available_for(remaining_delta, ledger.used_delta, ledger.max_delta, claimed.used_delta, proof.delta_used);
        if available_delta < proof.delta_used {
            return Err(PrivacyError::InsufficientBudget { client_id: client_id.to_string(), dimension: BudgetDimension::Delta, required: proof.delta_used, available: available_delta });
        }
        Ok(())
    }

    /// Every value finite and within `±parameter_bound`. Layers are scanned in parallel.
    pub fn check_parameter_bounds(&self, parameters: &ModelParameters) -> PrivacyResult<()> {
        let bound = self.parameter_bound;
        let layers: Vec<(&'static str, &str, &[f64])> = parameters.iter_layers().collect();
        let violation = layers.par_iter().find_map_first(|(kind, layer, values)| {
            values.iter().position(|v| !v.is_finite() || v.abs() > bound).map(|index| (format!("{kind}/{layer}"), index, values[index]))
        });
        match violation {
            Some((layer, index, value)) => Err(PrivacyError::ParameterBoundsViolation { layer, index, value }),
            None => Ok(()),
        }
    }
}

/// Budget available to a spend of `spend` given the ledger row and the proof's claimed
/// `used` figure. The spend counts as already recorded when the claim includes it and does
/// not run ahead of the ledger or past its cap.
fn available_for(remaining: f64, ledger_used: f64, ledger_max: f64, claimed_used: f64, spend: f64) -> f64 {
    let recorded = spend > 0.0 && approx_le(spend, claimed_used) && approx_le(claimed_used, ledger_used) && approx_le(claimed_used, ledger_max);
    if recorded { remaining + spend } else { remaining }
}

fn approx_le(a: f64, b: f64) -> bool { a <= b + MAGNITUDE_TOLERANCE * a.abs().max(b.abs()) }

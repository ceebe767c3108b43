//! Shared data model: model parameters, updates, proofs and the client roster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::HeScheme;
use crate::error::{PrivacyError, PrivacyResult};

/// Which client keys a ciphertext depends on and the averaging weight folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionTag {
    pub scheme: HeScheme,
    pub key_size: u32,
    pub key_holders: Vec<String>,
    pub mask_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub algorithm: String,
    pub ratio: f64,
    pub original_size: usize,
    pub compressed_size: usize,
    pub quality_loss: f64,
    pub homomorphic_encryption: bool,
    pub encryption: Option<EncryptionTag>,
}

impl CompressionInfo {
    pub fn uncompressed(size: usize) -> Self {
        Self { algorithm: "none".into(), ratio: 1.0, original_size: size, compressed_size: size, quality_loss: 0.0, homomorphic_encryption: false, encryption: None }
    }
}

/// Per-layer weights and biases. Layers iterate in name order, so [`flatten`](Self::flatten)
/// is stable across calls and processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub weights: BTreeMap<String, Vec<f64>>,
    pub biases: BTreeMap<String, Vec<f64>>,
    pub parameter_count: usize,
    pub compression_info: CompressionInfo,
}

impl ModelParameters {
    pub fn new(weights: BTreeMap<String, Vec<f64>>, biases: BTreeMap<String, Vec<f64>>) -> Self {
        let parameter_count = weights.values().chain(biases.values()).map(Vec::len).sum();
        Self { weights, biases, parameter_count, compression_info: CompressionInfo::uncompressed(parameter_count) }
    }

    pub fn is_encrypted(&self) -> bool { self.compression_info.homomorphic_encryption }

    /// All values, weights first then biases, each in layer-name order.
    pub fn flatten(&self) -> Vec<f64> {
        self.iter_layers().flat_map(|(_, _, v)| v.iter().copied()).collect()
    }

    /// `(kind, layer, values)` with kind `"weights"` or `"biases"`.
    pub fn iter_layers(&self) -> impl Iterator<Item = (&'static str, &str, &[f64])> + '_ {
        self.weights.iter().map(|(k, v)| ("weights", k.as_str(), v.as_slice()))
            .chain(self.biases.iter().map(|(k, v)| ("biases", k.as_str(), v.as_slice())))
    }

    /// New value with every layer rebuilt by `f(kind, layer, values)`; lengths are preserved
    /// by callers, `parameter_count` is recomputed regardless.
    pub fn try_map_layers<F>(&self, mut f: F) -> PrivacyResult<Self>
    where F: FnMut(&str, &str, &[f64]) -> PrivacyResult<Vec<f64>> {
        let mut weights = BTreeMap::new();
        for (name, values) in &self.weights { weights.insert(name.clone(), f("weights", name.as_str(), values.as_slice())?); }
        let mut biases = BTreeMap::new();
        for (name, values) in &self.biases { biases.insert(name.clone(), f("biases", name.as_str(), values.as_slice())?); }
        let parameter_count = weights.values().chain(biases.values()).map(Vec::len).sum();
        Ok(Self { weights, biases, parameter_count, compression_info: self.compression_info.clone() })
    }

    /// Adds `offsets` (laid out as [`flatten`](Self::flatten)) coordinate-wise.
    pub fn add_flat(&self, offsets: &[f64]) -> PrivacyResult<Self> {
        if offsets.len() != self.parameter_count {
            return Err(PrivacyError::ShapeMismatch(format!("expected {} offsets, got {}", self.parameter_count, offsets.len())));
        }
        let mut cursor = 0;
        self.try_map_layers(|_, _, values| {
            let out = values.iter().zip(&offsets[cursor..cursor + values.len()]).map(|(v, o)| v + o).collect();
            cursor += values.len();
            Ok(out)
        })
    }

    /// Same layer names and lengths in both weights and biases.
    pub fn same_shape(&self, other: &ModelParameters) -> bool {
        fn layout(m: &BTreeMap<String, Vec<f64>>) -> Vec<(&str, usize)> { m.iter().map(|(k, v)| (k.as_str(), v.len())).collect() }
        layout(&self.weights) == layout(&other.weights) && layout(&self.biases) == layout(&other.biases)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub job_id: String,
    pub local_epochs: u32,
    pub sample_count: u64,
    pub training_loss: Option<f64>,
}

/// Snapshot of a client's ledger row at the time a proof was issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AccountantState {
    pub used_epsilon: f64,
    pub used_delta: f64,
    pub max_epsilon: f64,
    pub max_delta: f64,
}

impl AccountantState {
    pub fn remaining_epsilon(&self) -> f64 { (self.max_epsilon - self.used_epsilon).max(0.0) }
    pub fn remaining_delta(&self) -> f64 { (self.max_delta - self.used_delta).max(0.0) }
}

/// Audit record attached to every protected update. `mechanism_applied` stays a plain
/// string on the wire so a validator can reject names it does not recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrivacyProof {
    pub epsilon_used: f64,
    pub delta_used: f64,
    pub mechanism_applied: String,
    pub noise_magnitude: f64,
    pub privacy_accountant_state: AccountantState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub client_id: String,
    pub round_number: u64,
    pub update_id: String,
    pub parameters: ModelParameters,
    pub metadata: UpdateMetadata,
    pub privacy_proof: PrivacyProof,
    pub integrity_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl ModelUpdate {
    /// Fresh, unprotected update as produced by local training.
    pub fn new(client_id: impl Into<String>, job_id: impl Into<String>, round_number: u64, parameters: ModelParameters) -> Self {
        let mut update = Self {
            client_id: client_id.into(),
            round_number,
            update_id: Uuid::new_v4().to_string(),
            parameters,
            metadata: UpdateMetadata { job_id: job_id.into(), local_epochs: 1, sample_count: 0, training_loss: None },
            privacy_proof: PrivacyProof::default(),
            integrity_hash: String::new(),
            timestamp: Utc::now(),
        };
        update.integrity_hash = update.compute_integrity_hash();
        update
    }

    pub fn job_id(&self) -> &str { &self.metadata.job_id }

    /// Hex SHA-256 over the identifying fields and the parameters.
    pub fn compute_integrity_hash(&self) -> String {
        let body = serde_json::json!({
            "client_id": self.client_id,
            "round_number": self.round_number,
            "update_id": self.update_id,
            "parameters": self.parameters,
        });
        let mut hasher = Sha256::new();
        hasher.update(body.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn verify_integrity(&self) -> bool { self.integrity_hash == self.compute_integrity_hash() }
}

/// Job-level privacy totals handed over by the training orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyJob {
    pub job_id: String,
    pub total_epsilon: f64,
    pub total_delta: f64,
}

impl PrivacyJob {
    pub fn new(job_id: impl Into<String>, total_epsilon: f64, total_delta: f64) -> Self {
        Self { job_id: job_id.into(), total_epsilon, total_delta }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PrivacyPreferences {
    pub max_epsilon: Option<f64>,
}

/// Roster entry supplied by the training orchestrator at job start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedClient {
    pub client_id: String,
    pub privacy_preferences: PrivacyPreferences,
}

impl FederatedClient {
    pub fn new(client_id: impl Into<String>, max_epsilon: Option<f64>) -> Self {
        Self { client_id: client_id.into(), privacy_preferences: PrivacyPreferences { max_epsilon } }
    }
}

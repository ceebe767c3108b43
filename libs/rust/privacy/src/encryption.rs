//! Homomorphic encryption gateway.
//!
//! The gateway owns every client's [`EncryptionContext`] and talks to the native
//! library through [`HomomorphicBackend`]. Nothing outside this module sees key material.
//!
//! The bundled [`SimulatedAdditiveBackend`] stands in for a CKKS binding: a ciphertext is
//! the plaintext plus a key-derived mask, which keeps it additively homomorphic so averaged
//! ciphertexts decrypt with the participating keys. It offers no confidentiality.

use parking_lot::RwLock;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{HeScheme, HomomorphicEncryptionConfig};
use crate::error::{PrivacyError, PrivacyResult};
use crate::types::{EncryptionTag, ModelParameters};

/// Error surfaced by a native backend.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct ContextParams {
    pub scheme: HeScheme,
    pub key_size: u32,
    pub poly_modulus_degree: u32,
    pub scale_bits: u32,
}

/// Per-client key material. Held only by [`HomomorphicEncryptionGateway`].
#[derive(Clone)]
pub struct EncryptionContext {
    pub client_id: String,
    pub public_key: Vec<u8>,
    private_key: Vec<u8>,
    pub context_params: ContextParams,
}

impl EncryptionContext {
    pub fn new(client_id: impl Into<String>, public_key: Vec<u8>, private_key: Vec<u8>, context_params: ContextParams) -> Self {
        Self { client_id: client_id.into(), public_key, private_key, context_params }
    }

    pub(crate) fn private_key(&self) -> &[u8] { &self.private_key }
}

impl std::fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext").field("client_id", &self.client_id).field("public_key", &hex::encode(&self.public_key)).field("context_params", &self.context_params).finish_non_exhaustive()
    }
}

/// Native-library boundary. `label` identifies the vector inside a model (layer kind
/// and name) so the backend can derive independent randomness per layer.
///
/// The private key handed to [`EncryptionContext::new`] cannot be read back outside this
/// crate; a native backend keeps its secret-key handles itself, keyed by `client_id`.
pub trait HomomorphicBackend: Send + Sync {
    fn generate_context(&self, client_id: &str, params: &ContextParams) -> Result<EncryptionContext, BackendError>;
    fn encrypt(&self, ctx: &EncryptionContext, label: &str, plaintext: &[f64]) -> Result<Vec<f64>, BackendError>;
    /// Decrypts a ciphertext produced by summing encryptions under `contexts`, each
    /// scaled by `weight`.
    fn decrypt(&self, contexts: &[&EncryptionContext], weight: f64, label: &str, ciphertext: &[f64]) -> Result<Vec<f64>, BackendError>;
}

/// Largest absolute mask value; keeps ciphertexts inside validation bounds.
const MASK_BOUND: f64 = 0.5;

#[derive(Debug, Default, Clone, Copy)]
pub struct SimulatedAdditiveBackend;

impl SimulatedAdditiveBackend {
    fn mask(ctx: &EncryptionContext, label: &str, len: usize) -> Vec<f64> {
        let mut hasher = Sha256::new();
        hasher.update(ctx.private_key());
        hasher.update(label.as_bytes());
        let seed: [u8; 32] = hasher.finalize().into();
        let mut rng = StdRng::from_seed(seed);
        (0..len).map(|_| rng.gen_range(-MASK_BOUND..MASK_BOUND)).collect()
    }
}

impl HomomorphicBackend for SimulatedAdditiveBackend {
    fn generate_context(&self, client_id: &str, params: &ContextParams) -> Result<EncryptionContext, BackendError> {
        let mut private_key = vec![0u8; (params.key_size / 8) as usize];
        OsRng.fill_bytes(&mut private_key);
        let public_key = Sha256::digest(&private_key).to_vec();
        Ok(EncryptionContext::new(client_id, public_key, private_key, params.clone()))
    }

    fn encrypt(&self, ctx: &EncryptionContext, label: &str, plaintext: &[f64]) -> Result<Vec<f64>, BackendError> {
        if let Some(i) = plaintext.iter().position(|v| !v.is_finite()) {
            return Err(BackendError(format!("non-finite plaintext at {label}[{i}]")));
        }
        let mask = Self::mask(ctx, label, plaintext.len());
        Ok(plaintext.iter().zip(mask).map(|(p, m)| p + m).collect())
    }

    fn decrypt(&self, contexts: &[&EncryptionContext], weight: f64, label: &str, ciphertext: &[f64]) -> Result<Vec<f64>, BackendError> {
        if contexts.is_empty() { return Err(BackendError("no key holders for ciphertext".into())); }
        let mut plain = ciphertext.to_vec();
        for ctx in contexts {
            for (p, m) in plain.iter_mut().zip(Self::mask(ctx, label, ciphertext.len())) { *p -= weight * m; }
        }
        Ok(plain)
    }
}

fn layer_label(kind: &str, layer: &str) -> String { format!("{kind}/{layer}") }

pub struct HomomorphicEncryptionGateway {
    backend: Arc<dyn HomomorphicBackend>,
    config: HomomorphicEncryptionConfig,
    contexts: RwLock<HashMap<String, Arc<EncryptionContext>>>,
}

impl HomomorphicEncryptionGateway {
    pub fn new(config: HomomorphicEncryptionConfig) -> Self { Self::with_backend(config, Arc::new(SimulatedAdditiveBackend)) }

    pub fn with_backend(config: HomomorphicEncryptionConfig, backend: Arc<dyn HomomorphicBackend>) -> Self {
        Self { backend, config, contexts: RwLock::new(HashMap::new()) }
    }

    fn context_params(&self) -> ContextParams {
        // CKKS-style sizing: ring degree tracks key size, 40-bit scale
        ContextParams { scheme: self.config.scheme, key_size: self.config.key_size, poly_modulus_degree: self.config.key_size * 4, scale_bits: 40 }
    }

    /// Creates the client's context if it does not exist yet.
    pub fn register_client(&self, client_id: &str) -> PrivacyResult<()> {
        self.context_for(client_id).map(|_| ())
    }

    fn context_for(&self, client_id: &str) -> PrivacyResult<Arc<EncryptionContext>> {
        if let Some(ctx) = self.contexts.read().get(client_id) { return Ok(ctx.clone()); }
        let mut contexts = self.contexts.write();
        if let Some(ctx) = contexts.get(client_id) { return Ok(ctx.clone()); }
        let ctx = Arc::new(self.backend.generate_context(client_id, &self.context_params()).map_err(|e| PrivacyError::EncryptionFailure(format!("key generation for {client_id}: {e}")))?);
        contexts.insert(client_id.to_string(), ctx.clone());
        debug!(client_id, scheme = %self.config.scheme, key_size = self.config.key_size, "encryption context created");
        Ok(ctx)
    }

    pub fn has_context(&self, client_id: &str) -> bool { self.contexts.read().contains_key(client_id) }

    pub fn context_count(&self) -> usize { self.contexts.read().len() }

    /// Encrypts every layer under the client's key. The result is tagged so it can be
    /// aggregated and later decrypted by the same gateway.
    pub fn encrypt(&self, parameters: &ModelParameters, client_id: &str) -> PrivacyResult<ModelParameters> {
        if parameters.is_encrypted() { return Err(PrivacyError::EncryptionFailure("parameters are already encrypted".into())); }
        let ctx = self.context_for(client_id)?;
        let started = Instant::now();
        let mut out = parameters.try_map_layers(|kind, layer, values| {
            self.backend.encrypt(&ctx, &layer_label(kind, layer), values).map_err(|e| PrivacyError::EncryptionFailure(format!("encrypting {kind}/{layer} for {client_id}: {e}")))
        })?;
        out.compression_info.homomorphic_encryption = true;
        out.compression_info.encryption = Some(EncryptionTag { scheme: self.config.scheme, key_size: self.config.key_size, key_holders: vec![client_id.to_string()], mask_weight: 1.0 });
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(client_id, parameters = out.parameter_count, elapsed_ms, "parameters encrypted");
        Ok(out)
    }

    /// Decrypts a single-client or aggregated ciphertext. Every key holder must have a
    /// context in this gateway.
    pub fn decrypt(&self, parameters: &ModelParameters) -> PrivacyResult<ModelParameters> {
        let tag = match (&parameters.compression_info.encryption, parameters.is_encrypted()) {
            (Some(tag), true) => tag.clone(),
            _ => return Err(PrivacyError::EncryptionFailure("parameters are not encrypted".into())),
        };
        if tag.scheme != self.config.scheme {
            return Err(PrivacyError::EncryptionFailure(format!("scheme mismatch: ciphertext {} vs gateway {}", tag.scheme, self.config.scheme)));
        }
        let contexts: Vec<Arc<EncryptionContext>> = {
            let held = self.contexts.read();
            tag.key_holders.iter().map(|id| held.get(id).cloned().ok_or_else(|| PrivacyError::EncryptionFailure(format!("no encryption context for {id}")))).collect::<PrivacyResult<_>>()?
        };
        let refs: Vec<&EncryptionContext> = contexts.iter().map(|c| c.as_ref()).collect();
        let mut out = parameters.try_map_layers(|kind, layer, values| {
            self.backend.decrypt(&refs, tag.mask_weight, &layer_label(kind, layer), values).map_err(|e| PrivacyError::EncryptionFailure(format!("decrypting {kind}/{layer}: {e}")))
        })?;
        out.compression_info.homomorphic_encryption = false;
        out.compression_info.encryption = None;
        Ok(out)
    }

    /// Discards key material for the given clients.
    pub fn drop_clients(&self, client_ids: &[String]) -> usize {
        let mut contexts = self.contexts.write();
        let dropped = client_ids.iter().filter(|id| contexts.remove(id.as_str()).is_some()).count();
        if dropped > 0 { debug!(dropped, "encryption contexts discarded"); }
        dropped
    }

    pub fn scheme(&self) -> HeScheme { self.config.scheme }

    pub fn overhead_threshold(&self) -> f64 { self.config.performance_overhead_threshold }
}

/// Logs when encryption cost exceeds the configured multiple of the plaintext step.
pub(crate) fn check_overhead(encrypt_ms: f64, plaintext_ms: f64, threshold: f64) {
    if plaintext_ms > 0.0 && encrypt_ms / plaintext_ms > threshold {
        warn!(encrypt_ms, plaintext_ms, threshold, "homomorphic encryption overhead above threshold");
    }
}

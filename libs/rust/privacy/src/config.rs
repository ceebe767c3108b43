//! Job-wide privacy configuration.
//!
//! Loaded once per job and validated before a [`PrivacyManager`](crate::PrivacyManager)
//! is built. Sources, lowest precedence first: built-in defaults, the YAML/TOML file
//! named by `SWARM_PRIVACY_CONFIG_FILE`, then `SWARM_PRIVACY__*` environment variables
//! (e.g. `SWARM_PRIVACY__DIFFERENTIAL_PRIVACY__EPSILON=0.5`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{PrivacyError, PrivacyResult};
use crate::noise::NoiseMechanism;

pub const CONFIG_FILE_ENV: &str = "SWARM_PRIVACY_CONFIG_FILE";
pub const ENV_PREFIX: &str = "SWARM_PRIVACY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeScheme {
    #[default]
    Ckks,
    Bfv,
}

impl fmt::Display for HeScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self { HeScheme::Ckks => f.write_str("ckks"), HeScheme::Bfv => f.write_str("bfv") }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifferentialPrivacyConfig {
    pub enabled: bool,
    /// ε spent by one protected update.
    pub epsilon: f64,
    /// δ spent by one protected update (ignored by Laplace).
    pub delta: f64,
    pub mechanism: NoiseMechanism,
}

impl Default for DifferentialPrivacyConfig {
    fn default() -> Self { Self { enabled: true, epsilon: 1.0, delta: 1e-7, mechanism: NoiseMechanism::Staircase } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomomorphicEncryptionConfig {
    pub enabled: bool,
    pub scheme: HeScheme,
    pub key_size: u32,
    /// Ratio of encrypted to plaintext processing time above which a warning is logged.
    pub performance_overhead_threshold: f64,
}

impl Default for HomomorphicEncryptionConfig {
    fn default() -> Self { Self { enabled: false, scheme: HeScheme::Ckks, key_size: 2048, performance_overhead_threshold: 2.0 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureAggregationConfig {
    pub enabled: bool,
    pub threshold: usize,
    pub max_clients: usize,
}

impl Default for SecureAggregationConfig {
    fn default() -> Self { Self { enabled: true, threshold: 3, max_clients: 100 } }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub differential_privacy: DifferentialPrivacyConfig,
    pub homomorphic_encryption: HomomorphicEncryptionConfig,
    pub secure_aggregation: SecureAggregationConfig,
    /// Largest absolute parameter value accepted by validation.
    pub parameter_bound: f64,
    /// Extra encryption attempts per update, reusing the already-noised parameters.
    pub encryption_retries: usize,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            differential_privacy: DifferentialPrivacyConfig::default(),
            homomorphic_encryption: HomomorphicEncryptionConfig::default(),
            secure_aggregation: SecureAggregationConfig::default(),
            parameter_bound: 1000.0,
            encryption_retries: 2,
        }
    }
}

fn with_defaults(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
    let d = PrivacyConfig::default();
    Ok(builder
        .set_default("differential_privacy.enabled", d.differential_privacy.enabled)?
        .set_default("differential_privacy.epsilon", d.differential_privacy.epsilon)?
        .set_default("differential_privacy.delta", d.differential_privacy.delta)?
        .set_default("differential_privacy.mechanism", d.differential_privacy.mechanism.as_str())?
        .set_default("homomorphic_encryption.enabled", d.homomorphic_encryption.enabled)?
        .set_default("homomorphic_encryption.scheme", d.homomorphic_encryption.scheme.to_string())?
        .set_default("homomorphic_encryption.key_size", d.homomorphic_encryption.key_size as i64)?
        .set_default("homomorphic_encryption.performance_overhead_threshold", d.homomorphic_encryption.performance_overhead_threshold)?
        .set_default("secure_aggregation.enabled", d.secure_aggregation.enabled)?
        .set_default("secure_aggregation.threshold", d.secure_aggregation.threshold as i64)?
        .set_default("secure_aggregation.max_clients", d.secure_aggregation.max_clients as i64)?
        .set_default("parameter_bound", d.parameter_bound)?
        .set_default("encryption_retries", d.encryption_retries as i64)?)
}

impl PrivacyConfig {
    /// Defaults, then optional config file, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut builder = with_defaults(config::Config::builder())?;
        if let Ok(file) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true));
        let cfg: PrivacyConfig = builder.build()?.try_deserialize().context("deserializing privacy config")?;
        cfg.validate()?;
        tracing::info!(mechanism = %cfg.differential_privacy.mechanism, dp = cfg.differential_privacy.enabled, he = cfg.homomorphic_encryption.enabled, "privacy config loaded");
        Ok(cfg)
    }

    /// Parses an inline YAML document layered over the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let builder = with_defaults(config::Config::builder())?.add_source(config::File::from_str(text, config::FileFormat::Yaml));
        let cfg: PrivacyConfig = builder.build()?.try_deserialize().context("deserializing privacy config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> PrivacyResult<()> {
        let dp = &self.differential_privacy;
        if dp.enabled {
            if !dp.epsilon.is_finite() || dp.epsilon <= 0.0 { return Err(invalid(format!("differential_privacy.epsilon must be > 0, got {}", dp.epsilon))); }
            if !dp.delta.is_finite() || dp.delta < 0.0 || dp.delta >= 1.0 { return Err(invalid(format!("differential_privacy.delta must be in [0, 1), got {}", dp.delta))); }
            if dp.mechanism.uses_delta() && dp.delta == 0.0 { return Err(invalid(format!("{} mechanism requires delta > 0", dp.mechanism))); }
        }
        let he = &self.homomorphic_encryption;
        if he.key_size < 1024 || !he.key_size.is_power_of_two() { return Err(invalid(format!("homomorphic_encryption.key_size must be a power of two >= 1024, got {}", he.key_size))); }
        if he.performance_overhead_threshold.is_nan() || he.performance_overhead_threshold < 1.0 { return Err(invalid(format!("homomorphic_encryption.performance_overhead_threshold must be >= 1, got {}", he.performance_overhead_threshold))); }
        let sa = &self.secure_aggregation;
        if sa.threshold == 0 || sa.threshold > sa.max_clients { return Err(PrivacyError::InvalidThreshold { threshold: sa.threshold, participants: sa.max_clients }); }
        if !self.parameter_bound.is_finite() || self.parameter_bound <= 0.0 { return Err(invalid(format!("parameter_bound must be > 0, got {}", self.parameter_bound))); }
        Ok(())
    }
}

fn invalid(msg: String) -> PrivacyError { PrivacyError::Config(msg) }

//! Privacy core for swarm federated learning.
//!
//! Calibrated differential-privacy noise, per-client budget accounting, an additive
//! homomorphic encryption gateway, threshold-gated secure aggregation and privacy proofs,
//! composed behind [`PrivacyManager`].

pub mod budget;
pub mod config;
pub mod encryption;
pub mod error;
pub mod events;
pub mod manager;
pub mod noise;
pub mod proof;
mod retired;
pub mod secure_aggregation;
pub mod telemetry;
pub mod types;

pub use budget::{BudgetReservation, ClientPrivacyBudget, ConsumptionRecord, LedgerSummary, PrivacyBudgetAccountant};
pub use config::{DifferentialPrivacyConfig, HeScheme, HomomorphicEncryptionConfig, PrivacyConfig, SecureAggregationConfig};
pub use encryption::{BackendError, ContextParams, EncryptionContext, HomomorphicBackend, HomomorphicEncryptionGateway, SimulatedAdditiveBackend};
pub use error::{BudgetDimension, PrivacyError, PrivacyResult};
pub use events::PrivacyEvent;
pub use manager::{AggregationResult, PrivacyManager, PrivacyMetricsSnapshot, ValidationCheck, ValidationFailure};
pub use noise::{entropy_rng_factory, seeded_rng_factory, NoiseMechanism, RngFactory};
pub use proof::PrivacyProofValidator;
pub use secure_aggregation::{SecureAggregationCoordinator, SecureAggregationSession, SessionState};
pub use telemetry::{init_tracing, PRIVACY_METRICS};
pub use types::{AccountantState, CompressionInfo, EncryptionTag, FederatedClient, ModelParameters, ModelUpdate, PrivacyJob, PrivacyPreferences, PrivacyProof, UpdateMetadata};

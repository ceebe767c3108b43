//! Tracing setup and OpenTelemetry instruments for the privacy core.
//!
//! Instruments live on the global meter `swarm_privacy`; without an installed provider
//! they are no-ops, so library users opt in by configuring OpenTelemetry themselves.

use anyhow::Result;
use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub struct PrivacyMetrics {
    pub protected_updates_total: Counter<u64>,
    pub budget_rejections_total: Counter<u64>,
    pub validation_failures_total: Counter<u64>,
    pub encryption_failures_total: Counter<u64>,
    pub aggregations_total: Counter<u64>,
    pub sessions_aborted_total: Counter<u64>,
    pub protection_latency_ms: Histogram<f64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

static PRIVACY_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("swarm_privacy"));

pub static PRIVACY_METRICS: Lazy<PrivacyMetrics> = Lazy::new(|| {
    PrivacyMetrics {
        protected_updates_total: PRIVACY_METER.u64_counter("swarm_privacy_protected_updates_total").with_description("Updates that passed the privacy protection pipeline").build(),
        budget_rejections_total: PRIVACY_METER.u64_counter("swarm_privacy_budget_rejections_total").with_description("Protection requests rejected for insufficient budget").build(),
        validation_failures_total: PRIVACY_METER.u64_counter("swarm_privacy_validation_failures_total").with_description("Incoming updates rejected by validation, by check").build(),
        encryption_failures_total: PRIVACY_METER.u64_counter("swarm_privacy_encryption_failures_total").with_description("Encryption attempts that failed").build(),
        aggregations_total: PRIVACY_METER.u64_counter("swarm_privacy_aggregations_total").with_description("Secure aggregation sessions completed").build(),
        sessions_aborted_total: PRIVACY_METER.u64_counter("swarm_privacy_sessions_aborted_total").with_description("Secure aggregation sessions aborted at job cleanup").build(),
        protection_latency_ms: PRIVACY_METER.f64_histogram("swarm_privacy_protection_latency_ms").with_description("Noise + encryption + proof latency (ms)").with_unit("ms").build(),
        aggregation_latency_ms: PRIVACY_METER.f64_histogram("swarm_privacy_aggregation_latency_ms").with_description("Secure aggregation combine latency (ms)").with_unit("ms").build(),
    }
});

pub(crate) fn record_validation_failure(check: &'static str) {
    PRIVACY_METRICS.validation_failures_total.add(1, &[KeyValue::new("check", check)]);
}

/// Installs a fmt subscriber filtered by `RUST_LOG`; JSON lines when `SWARM_JSON_LOG` is
/// `1` or `true`. Safe to call more than once.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("SWARM_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry.with(fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false)).try_init()?;
        } else {
            registry.with(fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

//! Calibrated noise mechanisms for (ε, δ)-differential privacy.
//!
//! Pure functions: callers hand in the randomness source, so the same code path
//! runs against an entropy-seeded `StdRng` in production and a fixed seed in tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{PrivacyError, PrivacyResult};

/// Floor applied to the L2 sensitivity so near-zero updates do not under-calibrate noise.
pub const MIN_SENSITIVITY: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMechanism {
    #[default]
    Staircase,
    Gaussian,
    Laplace,
}

impl NoiseMechanism {
    pub fn as_str(&self) -> &'static str {
        match self { NoiseMechanism::Staircase => "staircase", NoiseMechanism::Gaussian => "gaussian", NoiseMechanism::Laplace => "laplace" }
    }

    /// Mechanism constant per unit of ε: `sqrt(2 ln(1.25/δ))` for Gaussian and
    /// Staircase, 1 for Laplace.
    pub fn characteristic_constant(&self, delta: f64) -> f64 {
        match self {
            NoiseMechanism::Staircase | NoiseMechanism::Gaussian => gaussian_constant(delta),
            NoiseMechanism::Laplace => 1.0,
        }
    }

    /// Whether the mechanism consumes δ budget.
    pub fn uses_delta(&self) -> bool { !matches!(self, NoiseMechanism::Laplace) }
}

impl fmt::Display for NoiseMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for NoiseMechanism {
    type Err = PrivacyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staircase" => Ok(NoiseMechanism::Staircase),
            "gaussian" => Ok(NoiseMechanism::Gaussian),
            "laplace" => Ok(NoiseMechanism::Laplace),
            "" => Err(PrivacyError::InvalidParameter("empty noise mechanism".into())),
            other => Err(PrivacyError::InvalidParameter(format!("unrecognized noise mechanism '{other}'"))),
        }
    }
}

/// Produces a fresh RNG per protection call, so noise generation shares no mutable state.
pub type RngFactory = Arc<dyn Fn() -> StdRng + Send + Sync>;

/// Entropy-seeded ChaCha-backed `StdRng`.
pub fn entropy_rng_factory() -> RngFactory { Arc::new(StdRng::from_entropy) }

/// Deterministic factory: every call yields the same seeded stream.
pub fn seeded_rng_factory(seed: u64) -> RngFactory { Arc::new(move || StdRng::seed_from_u64(seed)) }

/// L2 norm of the vector, floored at [`MIN_SENSITIVITY`].
pub fn sensitivity(values: &[f64]) -> f64 {
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm.is_finite() { norm.max(MIN_SENSITIVITY) } else { MIN_SENSITIVITY }
}

fn gaussian_constant(delta: f64) -> f64 { (2.0 * (1.25 / delta).ln()).sqrt() }

pub fn validate_parameters(mechanism: NoiseMechanism, epsilon: f64, delta: f64) -> PrivacyResult<()> {
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(PrivacyError::InvalidParameter(format!("epsilon must be > 0, got {epsilon}")));
    }
    if !delta.is_finite() || delta < 0.0 {
        return Err(PrivacyError::InvalidParameter(format!("delta must be >= 0, got {delta}")));
    }
    // ln(1.25/δ) diverges at δ = 0 and goes negative for δ > 1.25.
    if mechanism.uses_delta() && (delta <= 0.0 || delta >= 1.0) {
        return Err(PrivacyError::InvalidParameter(format!("{mechanism} mechanism requires 0 < delta < 1, got {delta}")));
    }
    Ok(())
}

/// Uniform draw from the open interval (-0.5, 0.5).
fn centered_uniform<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let u = rng.gen::<f64>() - 0.5;
        if u > -0.5 { return u; }
    }
}

/// Uniform draw from (0, 1].
fn open_unit<R: Rng + ?Sized>(rng: &mut R) -> f64 { 1.0 - rng.gen::<f64>() }

/// Draws `size` independent noise coordinates for the given mechanism.
pub fn generate<R: Rng + ?Sized>(
    mechanism: NoiseMechanism,
    size: usize,
    epsilon: f64,
    delta: f64,
    sensitivity: f64,
    rng: &mut R,
) -> PrivacyResult<Vec<f64>> {
    validate_parameters(mechanism, epsilon, delta)?;
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(PrivacyError::InvalidParameter(format!("sensitivity must be > 0, got {sensitivity}")));
    }
    let noise = match mechanism {
        NoiseMechanism::Gaussian => {
            let sigma = gaussian_constant(delta) * sensitivity / epsilon;
            (0..size)
                .map(|_| {
                    // Box-Muller
                    let u1 = open_unit(rng);
                    let u2 = rng.gen::<f64>();
                    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
                })
                .collect()
        }
        NoiseMechanism::Laplace => {
            let b = sensitivity / epsilon;
            (0..size)
                .map(|_| {
                    let u = centered_uniform(rng);
                    -b * u.signum() * (1.0 - 2.0 * u.abs()).ln()
                })
                .collect()
        }
        NoiseMechanism::Staircase => {
            let gamma = gaussian_constant(delta) / epsilon;
            let scale = sensitivity * gamma;
            (0..size)
                .map(|_| {
                    let u = centered_uniform(rng);
                    scale * u.signum() * (1.0 + u.abs() / gamma).ln()
                })
                .collect()
        }
    };
    Ok(noise)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitivity_floor() {
        assert_eq!(sensitivity(&[0.0, 0.0, 0.0]), 1.0);
        assert_eq!(sensitivity(&[]), 1.0);
        assert!((sensitivity(&[3.0, 4.0]) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn staircase_is_deterministic_under_seed() {
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let first = generate(NoiseMechanism::Staircase, 3, 1.0, 1e-5, 1.0, &mut a).unwrap();
        let second = generate(NoiseMechanism::Staircase, 3, 1.0, 1e-5, 1.0, &mut b).unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        assert!(first.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mechanisms_are_symmetric_around_zero() {
        let mut rng = StdRng::seed_from_u64(7);
        for mechanism in [NoiseMechanism::Staircase, NoiseMechanism::Gaussian, NoiseMechanism::Laplace] {
            let draws = generate(mechanism, 20_000, 1.0, 1e-5, 1.0, &mut rng).unwrap();
            assert!(draws.iter().all(|v| v.is_finite()));
            let n = draws.len() as f64;
            let mean = draws.iter().sum::<f64>() / n;
            let std = (draws.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
            // mean within ~5 standard errors of zero
            assert!(mean.abs() < 5.0 * std / n.sqrt(), "{mechanism}: mean {mean}, std {std}");
            let positive = draws.iter().filter(|v| **v > 0.0).count() as f64 / n;
            assert!((positive - 0.5).abs() < 0.02, "{mechanism}: positive share {positive}");
        }
    }

    #[test]
    fn gaussian_scale_matches_calibration() {
        let mut rng = StdRng::seed_from_u64(11);
        let draws = generate(NoiseMechanism::Gaussian, 50_000, 2.0, 1e-5, 1.0, &mut rng).unwrap();
        let expected_sigma = (2.0 * (1.25f64 / 1e-5).ln()).sqrt() / 2.0;
        let n = draws.len() as f64;
        let sigma = (draws.iter().map(|v| v * v).sum::<f64>() / n).sqrt();
        assert!((sigma - expected_sigma).abs() / expected_sigma < 0.03);
    }

    #[test]
    fn staircase_bounded_by_construction() {
        // |u| < 0.5 so each coordinate is below scale * ln(1 + 0.5/γ)
        let mut rng = StdRng::seed_from_u64(3);
        let gamma = (2.0 * (1.25f64 / 1e-5).ln()).sqrt();
        let bound = 2.0 * gamma * (1.0 + 0.5 / gamma).ln();
        let draws = generate(NoiseMechanism::Staircase, 1_000, 1.0, 1e-5, 2.0, &mut rng).unwrap();
        assert!(draws.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(generate(NoiseMechanism::Staircase, 3, 0.0, 1e-5, 1.0, &mut rng), Err(PrivacyError::InvalidParameter(_))));
        assert!(matches!(generate(NoiseMechanism::Gaussian, 3, 1.0, -1.0, 1.0, &mut rng), Err(PrivacyError::InvalidParameter(_))));
        assert!(matches!(generate(NoiseMechanism::Gaussian, 3, 1.0, 0.0, 1.0, &mut rng), Err(PrivacyError::InvalidParameter(_))));
        // Laplace ignores delta
        assert_eq!(generate(NoiseMechanism::Laplace, 3, 1.0, 0.0, 1.0, &mut rng).unwrap().len(), 3);
    }

    #[test]
    fn parses_mechanism_names() {
        assert_eq!("Gaussian".parse::<NoiseMechanism>().unwrap(), NoiseMechanism::Gaussian);
        assert!("".parse::<NoiseMechanism>().is_err());
        assert!("exponential".parse::<NoiseMechanism>().is_err());
        assert_eq!(NoiseMechanism::default(), NoiseMechanism::Staircase);
    }
}

//! Parameter sets, domain validation, and content fingerprints.
//!
//! A [`ParameterSet`] describes one evaluation point for the native
//! error-exponent engine. It is immutable once constructed: every
//! constructor validates the domain ranges enforced by the engine interface,
//! so an instance in hand is always dispatchable.
//!
//! The [`ParameterSet::fingerprint`] method produces a stable, fixed-length
//! content hash used as the cache key and the in-flight deduplication key.
//! It is order-independent over the submitted field map and distinguishes a
//! custom-constellation set from a standard one even when every scalar field
//! coincides.

use crate::OrchestratorError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Valid range for the modulation order M.
pub const MOD_ORDER_RANGE: (u32, u32) = (2, 64);
/// Valid range for the quadrature order N.
pub const QUADRATURE_RANGE: (u32, u32) = (2, 40);
/// Valid range for the code length n.
pub const CODE_LENGTH_RANGE: (u64, u64) = (1, 1_000_000);
/// Valid range for the convergence threshold.
pub const THRESHOLD_RANGE: (f64, f64) = (1e-15, 0.1);

/// One point of a custom constellation: a complex symbol and its prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstellationPoint {
    /// Real part of the symbol.
    pub re: f64,
    /// Imaginary part of the symbol.
    pub im: f64,
    /// Prior probability assigned to the symbol.
    pub probability: f64,
}

/// Modulation scheme for an evaluation point.
///
/// The three standard schemes are generated by the engine from the
/// modulation order; a custom constellation supplies explicit points and is
/// serialized to the engine over a binary side channel (see
/// [`crate::engine::ConstellationWire`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Modulation {
    /// Pulse-amplitude modulation.
    Pam,
    /// Phase-shift keying.
    Psk,
    /// Quadrature amplitude modulation.
    Qam,
    /// Explicit constellation points with per-symbol priors.
    Custom(Vec<ConstellationPoint>),
}

impl Modulation {
    /// Engine-facing label for the scheme.
    pub fn label(&self) -> &'static str {
        match self {
            Modulation::Pam => "PAM",
            Modulation::Psk => "PSK",
            Modulation::Qam => "QAM",
            Modulation::Custom(_) => "CUSTOM",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "PAM" => Some(Modulation::Pam),
            "PSK" => Some(Modulation::Psk),
            "QAM" => Some(Modulation::Qam),
            _ => None,
        }
    }
}

/// A validated, immutable set of parameters for one engine evaluation.
///
/// Field names at the API boundary follow the original calculator interface:
/// `M` (modulation order), `typeM` (modulation scheme), `SNR` (linear
/// signal-to-noise ratio), `R` (rate), `N` (quadrature order), `n` (code
/// length), `th` (convergence threshold), plus an optional `constellation`
/// array for custom schemes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    modulation_order: u32,
    modulation: Modulation,
    snr: f64,
    rate: f64,
    quadrature_order: u32,
    code_length: u64,
    threshold: f64,
}

impl ParameterSet {
    /// Construct a parameter set, validating every field against the engine
    /// domain ranges.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] naming the offending field
    /// when any value is out of range.
    pub fn new(
        modulation_order: u32,
        modulation: Modulation,
        snr: f64,
        rate: f64,
        quadrature_order: u32,
        code_length: u64,
        threshold: f64,
    ) -> Result<Self, OrchestratorError> {
        let set = Self {
            modulation_order,
            modulation,
            snr,
            rate,
            quadrature_order,
            code_length,
            threshold,
        };
        set.validate()?;
        Ok(set)
    }

    /// Parse a parameter set from a flat JSON field map, as submitted by the
    /// API boundary. Field insertion order is irrelevant.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] for missing fields, wrong
    /// types, unknown modulation labels, or out-of-range values.
    pub fn from_fields(fields: &serde_json::Map<String, serde_json::Value>) -> Result<Self, OrchestratorError> {
        let num = |name: &str| -> Result<f64, OrchestratorError> {
            fields
                .get(name)
                .and_then(serde_json::Value::as_f64)
                .ok_or_else(|| OrchestratorError::Validation(format!("missing or non-numeric field `{name}`")))
        };

        let type_m = fields
            .get("typeM")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| OrchestratorError::Validation("missing field `typeM`".to_string()))?;

        let modulation = if type_m == "CUSTOM" {
            let raw = fields.get("constellation").ok_or_else(|| {
                OrchestratorError::Validation("typeM=CUSTOM requires a `constellation` field".to_string())
            })?;
            let points: Vec<ConstellationPoint> = serde_json::from_value(raw.clone())
                .map_err(|e| OrchestratorError::Validation(format!("malformed constellation: {e}")))?;
            Modulation::Custom(points)
        } else {
            Modulation::from_label(type_m).ok_or_else(|| {
                OrchestratorError::Validation(format!(
                    "typeM must be PAM, PSK, QAM, or CUSTOM (got `{type_m}`)"
                ))
            })?
        };

        Self::new(
            num("M")? as u32,
            modulation,
            num("SNR")?,
            num("R")?,
            num("N")? as u32,
            num("n")? as u64,
            num("th")?,
        )
    }

    fn validate(&self) -> Result<(), OrchestratorError> {
        let fail = |msg: String| Err(OrchestratorError::Validation(msg));

        if self.modulation_order < MOD_ORDER_RANGE.0 || self.modulation_order > MOD_ORDER_RANGE.1 {
            return fail(format!(
                "M must be between {} and {}",
                MOD_ORDER_RANGE.0, MOD_ORDER_RANGE.1
            ));
        }
        if !self.snr.is_finite() || self.snr < 0.0 {
            return fail("SNR must be non-negative and finite".to_string());
        }
        if !self.rate.is_finite() || !(0.0..=1.0).contains(&self.rate) {
            return fail("rate R must be between 0 and 1".to_string());
        }
        if self.quadrature_order < QUADRATURE_RANGE.0 || self.quadrature_order > QUADRATURE_RANGE.1 {
            return fail(format!(
                "N must be between {} and {}",
                QUADRATURE_RANGE.0, QUADRATURE_RANGE.1
            ));
        }
        if self.code_length < CODE_LENGTH_RANGE.0 || self.code_length > CODE_LENGTH_RANGE.1 {
            return fail(format!(
                "n must be between {} and {}",
                CODE_LENGTH_RANGE.0, CODE_LENGTH_RANGE.1
            ));
        }
        if !self.threshold.is_finite()
            || self.threshold < THRESHOLD_RANGE.0
            || self.threshold > THRESHOLD_RANGE.1
        {
            return fail(format!(
                "threshold must be between {:e} and {}",
                THRESHOLD_RANGE.0, THRESHOLD_RANGE.1
            ));
        }

        if let Modulation::Custom(points) = &self.modulation {
            if points.len() < 2 || points.len() > MOD_ORDER_RANGE.1 as usize {
                return fail(format!(
                    "custom constellation must have between 2 and {} points",
                    MOD_ORDER_RANGE.1
                ));
            }
            let mut prob_sum = 0.0;
            for p in points {
                if !p.re.is_finite() || !p.im.is_finite() {
                    return fail("constellation points must be finite".to_string());
                }
                if !p.probability.is_finite() || p.probability < 0.0 {
                    return fail("constellation probabilities must be non-negative".to_string());
                }
                prob_sum += p.probability;
            }
            if (prob_sum - 1.0).abs() > 1e-6 {
                return fail(format!(
                    "constellation probabilities must sum to 1 (got {prob_sum})"
                ));
            }
        }

        Ok(())
    }

    /// Modulation order M.
    pub fn modulation_order(&self) -> u32 {
        self.modulation_order
    }

    /// Modulation scheme.
    pub fn modulation(&self) -> &Modulation {
        &self.modulation
    }

    /// Linear signal-to-noise ratio.
    pub fn snr(&self) -> f64 {
        self.snr
    }

    /// Rate R.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Quadrature order N, the dominant cost driver.
    pub fn quadrature_order(&self) -> u32 {
        self.quadrature_order
    }

    /// Code length n.
    pub fn code_length(&self) -> u64 {
        self.code_length
    }

    /// Convergence threshold.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether this set carries an explicit custom constellation.
    pub fn is_custom_constellation(&self) -> bool {
        matches!(self.modulation, Modulation::Custom(_))
    }

    /// Derived copy with a different SNR (linear), re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if the new value is out of range.
    pub fn with_snr(&self, snr: f64) -> Result<Self, OrchestratorError> {
        let mut set = self.clone();
        set.snr = snr;
        set.validate()?;
        Ok(set)
    }

    /// Derived copy with a different rate, re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if the new value is out of range.
    pub fn with_rate(&self, rate: f64) -> Result<Self, OrchestratorError> {
        let mut set = self.clone();
        set.rate = rate;
        set.validate()?;
        Ok(set)
    }

    /// Derived copy with a different modulation order, re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if the new value is out of range.
    pub fn with_modulation_order(&self, modulation_order: u32) -> Result<Self, OrchestratorError> {
        let mut set = self.clone();
        set.modulation_order = modulation_order;
        set.validate()?;
        Ok(set)
    }

    /// Derived copy with a different quadrature order, re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if the new value is out of range.
    pub fn with_quadrature_order(&self, quadrature_order: u32) -> Result<Self, OrchestratorError> {
        let mut set = self.clone();
        set.quadrature_order = quadrature_order;
        set.validate()?;
        Ok(set)
    }

    /// Derived copy with a different code length, re-validated.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Validation`] if the new value is out of range.
    pub fn with_code_length(&self, code_length: u64) -> Result<Self, OrchestratorError> {
        let mut set = self.clone();
        set.code_length = code_length;
        set.validate()?;
        Ok(set)
    }

    /// Deterministic, order-independent content fingerprint.
    ///
    /// SHA-256 over the canonical sorted field list. Floats are hashed by
    /// bit pattern so semantically identical sets always collide and any
    /// representable difference separates them. Custom constellation points
    /// are part of the hashed content, so a custom set never shares a
    /// fingerprint with a standard set even when all scalars coincide.
    pub fn fingerprint(&self) -> String {
        // Canonical field list, already in sorted name order.
        let mut canon = String::new();
        let _ = write!(canon, "M={};", self.modulation_order);
        let _ = write!(canon, "N={};", self.quadrature_order);
        let _ = write!(canon, "R={:016x};", self.rate.to_bits());
        let _ = write!(canon, "SNR={:016x};", self.snr.to_bits());
        if let Modulation::Custom(points) = &self.modulation {
            let _ = write!(canon, "constellation=");
            for p in points {
                let _ = write!(
                    canon,
                    "{:016x}:{:016x}:{:016x},",
                    p.re.to_bits(),
                    p.im.to_bits(),
                    p.probability.to_bits()
                );
            }
            canon.push(';');
        }
        let _ = write!(canon, "n={};", self.code_length);
        let _ = write!(canon, "th={:016x};", self.threshold.to_bits());
        let _ = write!(canon, "typeM={};", self.modulation.label());

        let digest = Sha256::digest(canon.as_bytes());
        let mut out = String::with_capacity(64);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// Fixed result record produced by the native engine for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComputationResult {
    /// Error probability upper bound Pe.
    pub error_probability: f64,
    /// Random-coding error exponent E(R).
    pub error_exponent: f64,
    /// Optimising rho in [0, 1].
    pub optimal_rho: f64,
    /// Mutual information I(X;Y) = E0'(0).
    pub mutual_information: f64,
    /// Cutoff rate R0 = E0(1).
    pub cutoff_rate: f64,
    /// Critical rate, below which the exponent is linear in R.
    pub critical_rate: f64,
}

impl ComputationResult {
    /// Serialize for the result store.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] if serialization fails.
    pub fn to_json(&self) -> Result<String, OrchestratorError> {
        serde_json::to_string(self).map_err(|e| OrchestratorError::Store(format!("serialize result: {e}")))
    }

    /// Deserialize a stored result.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Store`] on malformed payloads.
    pub fn from_json(raw: &str) -> Result<Self, OrchestratorError> {
        serde_json::from_str(raw).map_err(|e| OrchestratorError::Store(format!("deserialize result: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_params() -> ParameterSet {
        ParameterSet::new(4, Modulation::Pam, 2.0, 0.5, 20, 100, 1e-6).unwrap()
    }

    fn qpsk_points() -> Vec<ConstellationPoint> {
        let a = std::f64::consts::FRAC_1_SQRT_2;
        [(a, a), (-a, a), (-a, -a), (a, -a)]
            .iter()
            .map(|&(re, im)| ConstellationPoint {
                re,
                im,
                probability: 0.25,
            })
            .collect()
    }

    #[test]
    fn test_fingerprint_is_64_hex_chars() {
        let fp = base_params().fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_order_independent_field_maps() {
        let a: serde_json::Map<String, serde_json::Value> = serde_json::from_value(json!({
            "M": 4, "typeM": "PAM", "SNR": 2.0, "R": 0.5, "N": 20, "n": 100, "th": 1e-6
        }))
        .unwrap();
        let b: serde_json::Map<String, serde_json::Value> = serde_json::from_value(json!({
            "th": 1e-6, "n": 100, "N": 20, "R": 0.5, "SNR": 2.0, "typeM": "PAM", "M": 4
        }))
        .unwrap();

        let fp_a = ParameterSet::from_fields(&a).unwrap().fingerprint();
        let fp_b = ParameterSet::from_fields(&b).unwrap().fingerprint();
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn test_fingerprint_differs_on_any_field() {
        let base = base_params();
        assert_ne!(base.fingerprint(), base.with_snr(2.1).unwrap().fingerprint());
        assert_ne!(base.fingerprint(), base.with_rate(0.6).unwrap().fingerprint());
        assert_ne!(
            base.fingerprint(),
            base.with_quadrature_order(21).unwrap().fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            base.with_code_length(101).unwrap().fingerprint()
        );
    }

    #[test]
    fn test_custom_constellation_distinct_from_standard_with_same_scalars() {
        let standard = ParameterSet::new(4, Modulation::Psk, 2.0, 0.5, 20, 100, 1e-6).unwrap();
        let custom =
            ParameterSet::new(4, Modulation::Custom(qpsk_points()), 2.0, 0.5, 20, 100, 1e-6)
                .unwrap();
        assert_ne!(standard.fingerprint(), custom.fingerprint());
    }

    #[test]
    fn test_custom_constellations_with_different_points_differ() {
        let mut shifted = qpsk_points();
        shifted[0].re += 1e-9;
        let a =
            ParameterSet::new(4, Modulation::Custom(qpsk_points()), 2.0, 0.5, 20, 100, 1e-6)
                .unwrap();
        let b = ParameterSet::new(4, Modulation::Custom(shifted), 2.0, 0.5, 20, 100, 1e-6).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        assert!(ParameterSet::new(1, Modulation::Pam, 2.0, 0.5, 20, 100, 1e-6).is_err());
        assert!(ParameterSet::new(4, Modulation::Pam, -1.0, 0.5, 20, 100, 1e-6).is_err());
        assert!(ParameterSet::new(4, Modulation::Pam, 2.0, 1.5, 20, 100, 1e-6).is_err());
        assert!(ParameterSet::new(4, Modulation::Pam, 2.0, 0.5, 41, 100, 1e-6).is_err());
        assert!(ParameterSet::new(4, Modulation::Pam, 2.0, 0.5, 20, 0, 1e-6).is_err());
        assert!(ParameterSet::new(4, Modulation::Pam, 2.0, 0.5, 20, 100, 0.5).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_constellation_probabilities() {
        let mut points = qpsk_points();
        points[0].probability = 0.5; // sum now 1.25
        assert!(ParameterSet::new(4, Modulation::Custom(points), 2.0, 0.5, 20, 100, 1e-6).is_err());
    }

    #[test]
    fn test_from_fields_rejects_unknown_modulation() {
        let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_value(json!({
            "M": 4, "typeM": "OFDM", "SNR": 2.0, "R": 0.5, "N": 20, "n": 100, "th": 1e-6
        }))
        .unwrap();
        assert!(matches!(
            ParameterSet::from_fields(&fields),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_result_store_round_trip() {
        let result = ComputationResult {
            error_probability: 1e-4,
            error_exponent: 0.42,
            optimal_rho: 0.8,
            mutual_information: 1.5,
            cutoff_rate: 1.1,
            critical_rate: 0.7,
        };
        let raw = result.to_json().unwrap();
        assert_eq!(ComputationResult::from_json(&raw).unwrap(), result);
    }
}

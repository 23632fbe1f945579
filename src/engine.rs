//! Native engine call contract and a deterministic stand-in.
//!
//! The real numerics engine is an external collaborator: a pure, blocking,
//! CPU-bound function that cannot be interrupted once started. This module
//! defines the narrow contract the pool needs — [`NativeEngine`] — plus the
//! wire framing for custom constellations and [`AnalyticEngine`], a
//! closed-form stand-in used by the demo binary and tests.

use crate::params::{ComputationResult, ConstellationPoint, Modulation, ParameterSet};
use thiserror::Error;

/// Failure signal from the native engine for one evaluation.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The engine refused the call before computing (malformed payload).
    #[error("engine rejected call: {0}")]
    Rejected(String),
    /// The computation itself failed (non-convergence, numeric overflow).
    #[error("engine computation failed: {0}")]
    Failed(String),
}

/// Wire framing for a custom constellation: a point count plus three
/// fixed-width arrays of 8-byte little-endian floats (real parts, imaginary
/// parts, probabilities), exactly as the engine boundary expects them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstellationWire {
    count: u32,
    re: Vec<u8>,
    im: Vec<u8>,
    probabilities: Vec<u8>,
}

impl ConstellationWire {
    /// Encode constellation points into the engine's binary layout.
    pub fn encode(points: &[ConstellationPoint]) -> Self {
        let mut re = Vec::with_capacity(points.len() * 8);
        let mut im = Vec::with_capacity(points.len() * 8);
        let mut probabilities = Vec::with_capacity(points.len() * 8);
        for p in points {
            re.extend_from_slice(&p.re.to_le_bytes());
            im.extend_from_slice(&p.im.to_le_bytes());
            probabilities.extend_from_slice(&p.probability.to_le_bytes());
        }
        Self {
            count: points.len() as u32,
            re,
            im,
            probabilities,
        }
    }

    /// Number of constellation points framed.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Decode back into constellation points, checking array widths.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rejected`] if any array is not exactly
    /// `count × 8` bytes.
    pub fn decode(&self) -> Result<Vec<ConstellationPoint>, EngineError> {
        let expected = self.count as usize * 8;
        for (name, buf) in [
            ("re", &self.re),
            ("im", &self.im),
            ("probabilities", &self.probabilities),
        ] {
            if buf.len() != expected {
                return Err(EngineError::Rejected(format!(
                    "constellation array `{name}` has {} bytes, expected {expected}",
                    buf.len()
                )));
            }
        }

        let mut points = Vec::with_capacity(self.count as usize);
        for i in 0..self.count as usize {
            let field = |buf: &[u8]| -> f64 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&buf[i * 8..i * 8 + 8]);
                f64::from_le_bytes(bytes)
            };
            points.push(ConstellationPoint {
                re: field(&self.re),
                im: field(&self.im),
                probability: field(&self.probabilities),
            });
        }
        Ok(points)
    }
}

/// One fully-resolved call to the native engine: the scalar parameter record
/// plus, for custom constellations, the wire-encoded point arrays.
#[derive(Debug, Clone)]
pub struct EngineCall {
    /// Modulation order M.
    pub modulation_order: u32,
    /// Modulation scheme label (`PAM`, `PSK`, `QAM`, `CUSTOM`).
    pub modulation: &'static str,
    /// Linear signal-to-noise ratio.
    pub snr: f64,
    /// Rate R.
    pub rate: f64,
    /// Quadrature order N.
    pub quadrature_order: u32,
    /// Code length n.
    pub code_length: u64,
    /// Convergence threshold.
    pub threshold: f64,
    /// Wire-encoded constellation, present only for `CUSTOM`.
    pub constellation: Option<ConstellationWire>,
}

impl EngineCall {
    /// Build the engine call for a validated parameter set.
    pub fn from_params(params: &ParameterSet) -> Self {
        let constellation = match params.modulation() {
            Modulation::Custom(points) => Some(ConstellationWire::encode(points)),
            _ => None,
        };
        Self {
            modulation_order: params.modulation_order(),
            modulation: params.modulation().label(),
            snr: params.snr(),
            rate: params.rate(),
            quadrature_order: params.quadrature_order(),
            code_length: params.code_length(),
            threshold: params.threshold(),
            constellation,
        }
    }
}

/// The native engine seam.
///
/// Implementations are blocking and CPU-bound; the pool runs them under
/// `spawn_blocking` for true parallelism. A call cannot be interrupted once
/// started — cancellation is handled entirely outside this trait.
pub trait NativeEngine: Send + Sync {
    /// Evaluate one parameter record. Pure: identical calls produce
    /// identical results.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on rejection or numeric failure; a failure is
    /// scoped to this call only.
    fn compute(&self, call: &EngineCall) -> Result<ComputationResult, EngineError>;
}

/// Deterministic closed-form stand-in for the native numerics library.
///
/// Uses Gaussian-input approximations (Shannon capacity, AWGN cutoff rate,
/// random-coding exponent) so that outputs are plausible, monotone in SNR,
/// and exactly reproducible. The optional delay models the real engine's
/// blocking compute time.
pub struct AnalyticEngine {
    delay: std::time::Duration,
}

impl AnalyticEngine {
    /// Engine with no simulated delay.
    pub fn new() -> Self {
        Self {
            delay: std::time::Duration::ZERO,
        }
    }

    /// Engine that blocks for `delay_ms` per call, for load and
    /// cancellation scenarios.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay: std::time::Duration::from_millis(delay_ms),
        }
    }
}

impl Default for AnalyticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeEngine for AnalyticEngine {
    fn compute(&self, call: &EngineCall) -> Result<ComputationResult, EngineError> {
        if !self.delay.is_zero() {
            // Deliberately blocking; the pool isolates this on a blocking thread.
            std::thread::sleep(self.delay);
        }

        // Effective constellation size: the decoded point count for custom
        // constellations (also exercises the wire contract).
        let m = match &call.constellation {
            Some(wire) => wire.decode()?.len() as f64,
            None => f64::from(call.modulation_order),
        };
        if m < 2.0 {
            return Err(EngineError::Rejected("constellation too small".to_string()));
        }

        let snr = call.snr;
        let capacity = (0.5 * (1.0 + snr).log2()).min(m.log2());
        let cutoff = (capacity * snr / (1.0 + snr)).max(0.0);
        let critical = cutoff * 0.7;

        let rho = if cutoff > 0.0 {
            ((cutoff - call.rate) / cutoff).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let exponent = (cutoff - call.rate).max(0.0);
        let pe = (2f64)
            .powf(-(call.code_length as f64) * exponent)
            .clamp(0.0, 1.0);

        Ok(ComputationResult {
            error_probability: pe,
            error_exponent: exponent,
            optimal_rho: rho,
            mutual_information: capacity,
            cutoff_rate: cutoff,
            critical_rate: critical,
        })
    }
}

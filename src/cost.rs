//! Bounded cost estimation for admission control and billing.
//!
//! The estimate is a pure function of the parameter set and the request
//! shape. It is consumed by the circuit breaker before any work is
//! scheduled, and by the external rate-limit/billing collaborator.
//!
//! Cost model:
//! - exponential in the quadrature order N (`2^((N − 20) / 8)`, so eight
//!   extra quadrature nodes double the cost),
//! - square-root in the constellation size M (doubling M costs ~√2×),
//! - linear in the number of independent evaluation points implied by the
//!   request shape,
//! - ×1.2 for custom constellations (extra serialization, no closed-form
//!   shortcuts in the engine),
//! - capped at [`MAX_COST`].

use crate::params::ParameterSet;

/// Hard cap on any single estimate.
pub const MAX_COST: u64 = 10_000;

/// Quadrature order at which the exponential base factor is 1.
const QUADRATURE_PIVOT: f64 = 20.0;
/// Quadrature orders per cost doubling.
const QUADRATURE_DOUBLING: f64 = 8.0;
/// Multiplier applied when a custom constellation is in play.
const CUSTOM_PENALTY: f64 = 1.2;

/// Shape of the request the cost is being estimated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    /// One evaluation point.
    Single,
    /// A batch of independent points.
    Batch(usize),
    /// A 1-D line sweep with the given point count.
    Sweep(usize),
    /// A 2-D grid sweep; total points are the product of the axis lengths.
    Grid(usize, usize),
}

impl RequestShape {
    /// Number of independent evaluation points implied by the shape.
    pub fn points(&self) -> usize {
        match *self {
            RequestShape::Single => 1,
            RequestShape::Batch(k) => k,
            RequestShape::Sweep(p) => p,
            RequestShape::Grid(px, py) => px.saturating_mul(py),
        }
    }
}

/// Estimate the cost of a request in credits.
///
/// Pure and total; always in `[1, MAX_COST]`.
pub fn estimate_cost(params: &ParameterSet, shape: RequestShape) -> u64 {
    let n = f64::from(params.quadrature_order());
    let base = 2f64.powf((n - QUADRATURE_PIVOT) / QUADRATURE_DOUBLING);

    // Normalised so the smallest constellation (M = 2) has factor 1.
    let m_factor = (f64::from(params.modulation_order()) / 2.0).sqrt();

    let custom = if params.is_custom_constellation() {
        CUSTOM_PENALTY
    } else {
        1.0
    };

    let points = shape.points().max(1) as f64;
    let raw = base * m_factor * custom * points;

    (raw.ceil() as u64).clamp(1, MAX_COST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ConstellationPoint, Modulation, ParameterSet};

    fn params(m: u32, n: u32) -> ParameterSet {
        ParameterSet::new(m, Modulation::Pam, 2.0, 0.5, n, 100, 1e-6).unwrap()
    }

    #[test]
    fn test_quadrature_doubling_roughly_doubles_cost() {
        // Large batch so integer rounding does not distort the ratio.
        let low = estimate_cost(&params(2, 20), RequestShape::Batch(1000));
        let high = estimate_cost(&params(2, 28), RequestShape::Batch(1000));
        let ratio = high as f64 / low as f64;
        assert!((ratio - 2.0).abs() < 0.05, "ratio was {ratio}");
    }

    #[test]
    fn test_doubling_m_costs_sqrt2() {
        let low = estimate_cost(&params(2, 20), RequestShape::Batch(1000));
        let high = estimate_cost(&params(4, 20), RequestShape::Batch(1000));
        let ratio = high as f64 / low as f64;
        assert!((ratio - std::f64::consts::SQRT_2).abs() < 0.05, "ratio was {ratio}");
    }

    #[test]
    fn test_shape_multiplies_by_point_count() {
        let single = estimate_cost(&params(2, 20), RequestShape::Single);
        assert_eq!(estimate_cost(&params(2, 20), RequestShape::Batch(10)), single * 10);
        assert_eq!(estimate_cost(&params(2, 20), RequestShape::Sweep(50)), single * 50);
        assert_eq!(
            estimate_cost(&params(2, 20), RequestShape::Grid(10, 5)),
            single * 50
        );
    }

    #[test]
    fn test_custom_constellation_penalty() {
        let points = vec![
            ConstellationPoint { re: 1.0, im: 0.0, probability: 0.5 },
            ConstellationPoint { re: -1.0, im: 0.0, probability: 0.5 },
        ];
        let standard = params(2, 20);
        let custom =
            ParameterSet::new(2, Modulation::Custom(points), 2.0, 0.5, 20, 100, 1e-6).unwrap();
        let s = estimate_cost(&standard, RequestShape::Batch(1000));
        let c = estimate_cost(&custom, RequestShape::Batch(1000));
        let ratio = c as f64 / s as f64;
        assert!((ratio - 1.2).abs() < 0.01, "ratio was {ratio}");
    }

    #[test]
    fn test_cost_is_capped() {
        let expensive = params(64, 40);
        assert_eq!(estimate_cost(&expensive, RequestShape::Grid(1000, 1000)), MAX_COST);
    }

    #[test]
    fn test_cost_never_below_one() {
        let cheap = params(2, 2);
        assert!(estimate_cost(&cheap, RequestShape::Single) >= 1);
    }
}

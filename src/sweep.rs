//! Parameter sweeps: 1-D lines and 2-D grids over a base parameter set.
//!
//! An axis names one parameter, a range, and a point count. Axis values are
//! generated linearly; integer-valued parameters are rounded and collapsed
//! so an axis never evaluates the same integer twice. SNR axes are specified
//! in dB (the display convention) and converted to linear SNR when the point
//! is applied to the base parameters.
//!
//! Sweeps expand into batches and ride the ordinary batch path: one store
//! round trip, one pool dispatch for the uncached points, order preserved.

use crate::cancel::CancellationToken;
use crate::cost::RequestShape;
use crate::orchestrator::ComputeOrchestrator;
use crate::params::{ComputationResult, ParameterSet};
use crate::{metrics, OrchestratorError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maximum points along one axis.
pub const MAX_AXIS_POINTS: usize = 1000;

/// Parameter a sweep axis varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepField {
    /// Signal-to-noise ratio; axis values are in dB.
    Snr,
    /// Code rate R.
    Rate,
    /// Modulation order M (integer axis).
    ModulationOrder,
    /// Quadrature order N (integer axis).
    QuadratureOrder,
    /// Code length n (integer axis).
    CodeLength,
}

impl SweepField {
    fn is_integer(self) -> bool {
        matches!(
            self,
            SweepField::ModulationOrder | SweepField::QuadratureOrder | SweepField::CodeLength
        )
    }
}

/// One sweep axis: a field, an inclusive range, and a point count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Which parameter varies.
    pub field: SweepField,
    /// First value (dB for [`SweepField::Snr`]).
    pub start: f64,
    /// Last value, inclusive.
    pub stop: f64,
    /// Requested number of points before integer collapsing.
    pub points: usize,
}

impl SweepAxis {
    /// Concrete axis values: a linear spacing from `start` to `stop`, with
    /// integer fields rounded and de-duplicated.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] for a zero or oversized point
    /// count, or non-finite bounds.
    pub fn values(&self) -> Result<Vec<f64>, OrchestratorError> {
        if self.points == 0 || self.points > MAX_AXIS_POINTS {
            return Err(OrchestratorError::Validation(format!(
                "axis points must be in [1, {MAX_AXIS_POINTS}], got {}",
                self.points
            )));
        }
        if !self.start.is_finite() || !self.stop.is_finite() {
            return Err(OrchestratorError::Validation(
                "axis bounds must be finite".to_string(),
            ));
        }

        let mut values = Vec::with_capacity(self.points);
        if self.points == 1 {
            values.push(self.start);
        } else {
            let step = (self.stop - self.start) / (self.points - 1) as f64;
            for i in 0..self.points {
                values.push(self.start + step * i as f64);
            }
        }

        if self.field.is_integer() {
            // Linear spacing is monotone, so duplicates after rounding are
            // adjacent and a single dedup pass suffices.
            for v in &mut values {
                *v = v.round();
            }
            values.dedup();
        }
        Ok(values)
    }

    /// Apply one axis value to a base parameter set, re-validating.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] when the value leaves the
    /// parameter's domain.
    pub fn apply(&self, base: &ParameterSet, value: f64) -> Result<ParameterSet, OrchestratorError> {
        match self.field {
            // dB on the axis, linear in the parameter record.
            SweepField::Snr => base.with_snr(10f64.powf(value / 10.0)),
            SweepField::Rate => base.with_rate(value),
            SweepField::ModulationOrder => base.with_modulation_order(value as u32),
            SweepField::QuadratureOrder => base.with_quadrature_order(value as u32),
            SweepField::CodeLength => base.with_code_length(value as u64),
        }
    }
}

/// Result of a 1-D sweep: axis values and per-point results, index-aligned.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// The concrete axis values evaluated.
    pub axis_values: Vec<f64>,
    /// Per-point results, `None` where a point failed or was skipped.
    pub slots: Vec<Option<ComputationResult>>,
    /// Whether the owning session was cancelled partway through.
    pub cancelled: bool,
}

impl SweepOutcome {
    /// Populated `(axis value, result)` pairs in axis order.
    pub fn points(&self) -> impl Iterator<Item = (f64, &ComputationResult)> {
        self.axis_values
            .iter()
            .zip(&self.slots)
            .filter_map(|(v, s)| s.as_ref().map(|r| (*v, r)))
    }
}

/// Result of a 2-D sweep, trimmed to the leading run of fully-populated
/// rows so consumers always see a rectangular surface.
#[derive(Debug, Clone)]
pub struct GridOutcome {
    /// Outer-axis values, one per retained row.
    pub x_values: Vec<f64>,
    /// Inner-axis values, identical for every row.
    pub y_values: Vec<f64>,
    /// Retained rows; every cell is populated.
    pub rows: Vec<Vec<ComputationResult>>,
    /// Whether any row was dropped (failure or cancellation downstream).
    pub truncated: bool,
    /// Whether the owning session was cancelled partway through.
    pub cancelled: bool,
}

impl ComputeOrchestrator {
    /// Sweep one axis over `base`, evaluating every axis point.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] for a bad axis or an axis value
    /// outside the parameter domain, plus the batch-path errors of
    /// [`ComputeOrchestrator::compute_batch`].
    pub async fn sweep_1d(
        &self,
        base: &ParameterSet,
        axis: &SweepAxis,
        token: &CancellationToken,
    ) -> Result<SweepOutcome, OrchestratorError> {
        metrics::inc_request("sweep_1d");
        let axis_values = axis.values()?;
        let items = axis_values
            .iter()
            .map(|&v| axis.apply(base, v))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(field = ?axis.field, points = items.len(), "1-D sweep planned");

        let batch = self
            .compute_batch_with_shape(&items, RequestShape::Sweep(items.len()), token)
            .await?;
        Ok(SweepOutcome {
            axis_values,
            slots: batch.slots,
            cancelled: batch.cancelled,
        })
    }

    /// Sweep two axes over `base`, row-major with `x_axis` outermost.
    ///
    /// Rows are retained only up to the first row containing a missing
    /// point, so the surface handed back is always rectangular and its rows
    /// line up with the leading `x_values`.
    ///
    /// # Errors
    ///
    /// Same classes as [`ComputeOrchestrator::sweep_1d`]; additionally
    /// [`OrchestratorError::Validation`] when the two axes name the same
    /// field.
    pub async fn sweep_2d(
        &self,
        base: &ParameterSet,
        x_axis: &SweepAxis,
        y_axis: &SweepAxis,
        token: &CancellationToken,
    ) -> Result<GridOutcome, OrchestratorError> {
        metrics::inc_request("sweep_2d");
        if x_axis.field == y_axis.field {
            return Err(OrchestratorError::Validation(
                "grid axes must vary different parameters".to_string(),
            ));
        }

        let x_values = x_axis.values()?;
        let y_values = y_axis.values()?;
        let mut items = Vec::with_capacity(x_values.len() * y_values.len());
        for &x in &x_values {
            let row_base = x_axis.apply(base, x)?;
            for &y in &y_values {
                items.push(y_axis.apply(&row_base, y)?);
            }
        }
        debug!(
            x_points = x_values.len(),
            y_points = y_values.len(),
            "2-D sweep planned"
        );

        let batch = self
            .compute_batch_with_shape(
                &items,
                RequestShape::Grid(x_values.len(), y_values.len()),
                token,
            )
            .await?;

        let width = y_values.len();
        let mut rows: Vec<Vec<ComputationResult>> = Vec::with_capacity(x_values.len());
        let mut truncated = false;
        for chunk in batch.slots.chunks(width) {
            if chunk.iter().all(Option::is_some) {
                rows.push(chunk.iter().filter_map(|s| *s).collect());
            } else {
                // Incomplete row: drop it and everything after, keeping the
                // surface rectangular.
                truncated = true;
                break;
            }
        }

        Ok(GridOutcome {
            x_values: x_values[..rows.len()].to_vec(),
            y_values,
            rows,
            truncated: truncated || batch.cancelled,
            cancelled: batch.cancelled,
        })
    }
}

//! Range measurement model.
//!
//! UWB ranges are folded into particle weights with a gated, two-level likelihood: a
//! hypothesis whose predicted range lies within `gate_sigmas * std_range` of the
//! observation keeps its weight, and anything outside the gate is multiplied by a
//! minimum-weight penalty. The penalty depends on the observed range itself because
//! near-field ranges discriminate better, so outliers there are punished harder.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::particle::{BeaconEnsemble, TagEnsemble};

/// A single range observation and its standard deviation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeMeasurement {
    pub range: f64,
    pub std_range: f64,
}

impl RangeMeasurement {
    pub fn new(range: f64, std_range: f64) -> Self {
        RangeMeasurement { range, std_range }
    }

    /// Reject non-finite ranges and non-positive or non-finite deviations.
    pub fn validate(&self) -> Result<()> {
        if self.range.is_finite() && self.std_range.is_finite() && self.std_range > 0.0 {
            Ok(())
        } else {
            Err(FilterError::InvalidMeasurement {
                range: self.range,
                std_range: self.std_range,
            })
        }
    }
}

/// Gate width and outlier penalties.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeGate {
    pub gate_sigmas: f64,
    /// Observed ranges below this use `near_penalty`.
    pub near_range: f64,
    pub near_penalty: f64,
    pub far_penalty: f64,
}

impl Default for RangeGate {
    fn default() -> Self {
        RangeGate {
            gate_sigmas: 3.0,
            near_range: 3.0,
            near_penalty: 0.1,
            far_penalty: 0.5,
        }
    }
}

impl RangeGate {
    /// Weight factor applied to hypotheses outside the gate.
    pub fn penalty(&self, measurement: &RangeMeasurement) -> f64 {
        if measurement.range < self.near_range {
            self.near_penalty
        } else {
            self.far_penalty
        }
    }

    pub fn is_outlier(&self, predicted: f64, measurement: &RangeMeasurement) -> bool {
        (predicted - measurement.range).abs() > self.gate_sigmas * measurement.std_range
    }

    /// Factor to multiply a hypothesis weight by, given its predicted range.
    pub fn likelihood(&self, predicted: f64, measurement: &RangeMeasurement) -> f64 {
        if self.is_outlier(predicted, measurement) {
            self.penalty(measurement)
        } else {
            1.0
        }
    }
}

/// Weight tag particles against a beacon at a known position.
///
/// Returns the number of particles that fell outside the gate.
pub fn weigh_by_range(
    tag: &mut TagEnsemble,
    beacon_position: &Vector3<f64>,
    measurement: &RangeMeasurement,
    gate: &RangeGate,
) -> usize {
    let mut outliers = 0;
    for tp in tag.particles_mut() {
        let predicted = (tp.position - beacon_position).norm();
        let factor = gate.likelihood(predicted, measurement);
        if factor < 1.0 {
            outliers += 1;
        }
        tp.weight *= factor;
    }
    outliers
}

/// Weight beacon particles row by row and fold each row's total into its tag particle.
///
/// Every beacon particle `(i, j)` is gated against the range between it and tag particle
/// `i`. Tag particle `i` is then scaled by the sum of row `i`'s weights, which
/// marginalizes the beacon position out of the tag hypothesis. Returns the number of
/// beacon particles outside the gate.
pub fn weigh_by_range_joint(
    tag: &mut TagEnsemble,
    beacon: &mut BeaconEnsemble,
    measurement: &RangeMeasurement,
    gate: &RangeGate,
) -> usize {
    assert_eq!(
        beacon.num_rows(),
        tag.len(),
        "Beacon ensemble must have one row per tag particle"
    );
    let mut outliers = 0;
    for (i, tp) in tag.particles_mut().iter_mut().enumerate() {
        let mut row_sum = 0.0;
        for bp in beacon.row_mut(i) {
            let predicted = (tp.position - bp.position).norm();
            let factor = gate.likelihood(predicted, measurement);
            if factor < 1.0 {
                outliers += 1;
            }
            bp.weight *= factor;
            row_sum += bp.weight;
        }
        tp.weight *= row_sum;
    }
    outliers
}

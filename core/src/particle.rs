//! Tag and beacon particle ensembles.
//!
//! The tag ensemble is an ordered array of `N_TAG` pose hypotheses. Each tracked beacon
//! carries an `N_TAG x N_BCN` array of position hypotheses where row `i` is conditioned on
//! tag particle `i`. Row order is significant: row `i` of every beacon belongs to tag
//! particle `i`, and only the resampler ever reorders them (see [`crate::resample`]).
//!
//! Weights are unnormalized. Estimators divide by the weight sum rather than assuming it
//! is one.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;
use std::fmt::{self, Debug, Display};

use crate::error::{FilterError, Result};

/// Relative resultant length below which a weighted heading has no defined direction.
const MIN_RESULTANT: f64 = 1e-9;

/// Stable identity of a beacon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BeaconId(pub u64);

impl Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One hypothesis of the tag pose.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TagParticle {
    pub weight: f64,
    pub position: Vector3<f64>,
    /// Heading in radians on `[0, 2*pi)`.
    pub heading: f64,
}

impl Default for TagParticle {
    fn default() -> Self {
        TagParticle {
            weight: 1.0,
            position: Vector3::zeros(),
            heading: 0.0,
        }
    }
}

impl Display for TagParticle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagParticle")
            .field("x", &self.position[0])
            .field("y", &self.position[1])
            .field("z", &self.position[2])
            .field("heading", &self.heading)
            .field("weight", &self.weight)
            .finish()
    }
}

/// One hypothesis of a beacon position, conditioned on a tag particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeaconParticle {
    pub weight: f64,
    pub position: Vector3<f64>,
}

impl Default for BeaconParticle {
    fn default() -> Self {
        BeaconParticle {
            weight: 1.0,
            position: Vector3::zeros(),
        }
    }
}

/// Wrap an angle onto `[0, 2*pi)`.
pub fn wrap_heading(theta: f64) -> f64 {
    let wrapped = theta.rem_euclid(TAU);
    // rem_euclid rounds tiny negative inputs up to exactly TAU
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// Heading of a weighted set of angles from their summed unit vectors.
///
/// Returns 0 when the resultant is too short to define a direction, e.g. equal weight
/// on two opposite headings.
pub fn circular_mean(cos_sum: f64, sin_sum: f64, weight_sum: f64) -> f64 {
    if cos_sum.hypot(sin_sum) <= MIN_RESULTANT * weight_sum.abs() {
        return 0.0;
    }
    sin_sum.atan2(cos_sum)
}

/// Weight moments of a tag ensemble.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WeightSummary {
    pub sum: f64,
    pub sum_sq: f64,
    /// `sum(w * cos(theta))`
    pub cos_sum: f64,
    /// `sum(w * sin(theta))`
    pub sin_sum: f64,
}

impl WeightSummary {
    /// `(sum w)^2 / sum w^2`, zero for an empty or all-zero ensemble.
    pub fn effective_sample_size(&self) -> f64 {
        if self.sum_sq > 0.0 {
            self.sum * self.sum / self.sum_sq
        } else {
            0.0
        }
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.sum > 0.0 && self.sum.is_finite() && self.sum_sq.is_finite())
    }

    /// Squared mean resultant length of the weighted headings, on `[0, 1]`.
    pub fn mean_resultant_sq(&self) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        let c = self.cos_sum / self.sum;
        let s = self.sin_sum / self.sum;
        (c * c + s * s).min(1.0)
    }
}

/// Ordered ensemble of tag particles.
#[derive(Clone, Default)]
pub struct TagEnsemble {
    particles: Vec<TagParticle>,
}

impl Debug for TagEnsemble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("TagEnsemble")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &summary.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .finish()
    }
}

impl TagEnsemble {
    pub fn from_particles(particles: Vec<TagParticle>) -> Self {
        TagEnsemble { particles }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[TagParticle] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [TagParticle] {
        &mut self.particles
    }

    pub(crate) fn replace(&mut self, particles: Vec<TagParticle>) {
        debug_assert_eq!(particles.len(), self.particles.len());
        self.particles = particles;
    }

    pub fn summary(&self) -> WeightSummary {
        let mut summary = WeightSummary::default();
        for p in &self.particles {
            summary.sum += p.weight;
            summary.sum_sq += p.weight * p.weight;
            summary.cos_sum += p.weight * p.heading.cos();
            summary.sin_sum += p.weight * p.heading.sin();
        }
        summary
    }

    pub fn total_weight(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }

    pub fn effective_sample_size(&self) -> f64 {
        self.summary().effective_sample_size()
    }

    /// Weighted mean position and circular mean heading.
    pub fn weighted_pose(&self) -> Result<(Vector3<f64>, f64)> {
        let summary = self.summary();
        if summary.is_degenerate() {
            return Err(FilterError::DegenerateEnsemble);
        }
        let mut position = Vector3::zeros();
        for p in &self.particles {
            position += p.position * p.weight;
        }
        position /= summary.sum;
        let heading = circular_mean(summary.cos_sum, summary.sin_sum, summary.sum);
        Ok((position, heading))
    }

    /// Weighted RMS distance of the particles from their weighted mean.
    pub fn spread(&self) -> Result<f64> {
        let (mean, _) = self.weighted_pose()?;
        let mut sum = 0.0;
        let mut dev = 0.0;
        for p in &self.particles {
            sum += p.weight;
            dev += p.weight * (p.position - mean).norm_squared();
        }
        Ok((dev / sum).sqrt())
    }

    pub fn reset_weights(&mut self) {
        for p in &mut self.particles {
            p.weight = 1.0;
        }
    }
}

/// `N_TAG x N_BCN` beacon hypotheses, stored row-major.
#[derive(Clone, Debug)]
pub struct BeaconEnsemble {
    num_rows: usize,
    num_cols: usize,
    particles: Vec<BeaconParticle>,
}

impl BeaconEnsemble {
    /// Ensemble of spawn-weight particles at the origin.
    pub fn new(num_rows: usize, num_cols: usize) -> Self {
        BeaconEnsemble {
            num_rows,
            num_cols,
            particles: vec![BeaconParticle::default(); num_rows * num_cols],
        }
    }

    /// Build from explicit rows. Every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<BeaconParticle>>) -> Self {
        let num_rows = rows.len();
        let num_cols = rows.first().map_or(0, Vec::len);
        assert!(
            rows.iter().all(|r| r.len() == num_cols),
            "Beacon ensemble rows must all have the same length"
        );
        BeaconEnsemble {
            num_rows,
            num_cols,
            particles: rows.into_iter().flatten().collect(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn row(&self, i: usize) -> &[BeaconParticle] {
        &self.particles[i * self.num_cols..(i + 1) * self.num_cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [BeaconParticle] {
        &mut self.particles[i * self.num_cols..(i + 1) * self.num_cols]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[BeaconParticle]> {
        self.particles.chunks(self.num_cols.max(1))
    }

    pub fn particles(&self) -> &[BeaconParticle] {
        &self.particles
    }

    pub(crate) fn replace(&mut self, particles: Vec<BeaconParticle>) {
        debug_assert_eq!(particles.len(), self.particles.len());
        self.particles = particles;
    }

    pub fn row_weight(&self, i: usize) -> f64 {
        self.row(i).iter().map(|p| p.weight).sum()
    }

    pub fn reset_weights(&mut self) {
        for p in &mut self.particles {
            p.weight = 1.0;
        }
    }

    /// Marginal beacon position: per-row weighted means combined with tag weights.
    ///
    /// Rows whose beacon weights sum to zero carry no position information and are
    /// skipped.
    pub fn weighted_position(&self, tag: &TagEnsemble) -> Result<Vector3<f64>> {
        self.hierarchical_mean(tag, |_, bp| bp.position)
    }

    /// Marginal expected distance between the beacon and the tag.
    pub fn weighted_range(&self, tag: &TagEnsemble) -> Result<f64> {
        self.hierarchical_mean(tag, |tp, bp| {
            let d = (bp.position - tp.position).norm();
            Vector3::new(d, 0.0, 0.0)
        })
        .map(|v| v[0])
    }

    fn hierarchical_mean<F>(&self, tag: &TagEnsemble, value: F) -> Result<Vector3<f64>>
    where
        F: Fn(&TagParticle, &BeaconParticle) -> Vector3<f64>,
    {
        debug_assert_eq!(tag.len(), self.num_rows);
        let mut outer_sum = 0.0;
        let mut outer = Vector3::zeros();
        for (tp, row) in tag.particles().iter().zip(self.rows()) {
            let mut inner_sum = 0.0;
            let mut inner = Vector3::zeros();
            for bp in row {
                inner_sum += bp.weight;
                inner += value(tp, bp) * bp.weight;
            }
            if inner_sum <= 0.0 || !inner_sum.is_finite() {
                continue;
            }
            outer_sum += tp.weight;
            outer += (inner / inner_sum) * tp.weight;
        }
        if outer_sum <= 0.0 || !outer_sum.is_finite() {
            return Err(FilterError::DegenerateEnsemble);
        }
        Ok(outer / outer_sum)
    }
}

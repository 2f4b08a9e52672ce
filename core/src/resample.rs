//! Degeneracy monitoring, resampling and rejuvenation.
//!
//! [`resample`] is the only code path that reorders tag particles, and it applies the
//! same source-index mapping to the rows of every tracked beacon. A beacon row is never
//! moved independently of its tag particle.

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};
use crate::init::{spawn_beacon_particle_from, spawn_tag_particle_from};
use crate::measurements::RangeMeasurement;
use crate::particle::{BeaconEnsemble, BeaconId, TagEnsemble};
use crate::random::RandomSource;

/// Floor for the squared mean resultant length when deriving the heading bandwidth.
const MIN_RESULTANT_SQ: f64 = 1e-12;

/// How source indices are drawn from the weight distribution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// One uniform offset, then evenly spaced points.
    #[default]
    Systematic,
    /// One uniform draw inside each of `n` equal strata.
    Stratified,
    /// `n` independent uniform draws, sorted.
    Multinomial,
    /// Deterministic integer copies, remainder drawn systematically.
    Residual,
}

impl ResamplingStrategy {
    /// Draw `n` source indices from unnormalized `weights`.
    ///
    /// Indices come back in ascending order. Particles with zero weight are never
    /// selected. The caller guarantees that at least one weight is positive.
    pub fn draw<R: RandomSource>(&self, weights: &[f64], n: usize, rng: &mut R) -> Vec<usize> {
        let total: f64 = weights.iter().sum();
        match self {
            ResamplingStrategy::Systematic => {
                let step = total / n as f64;
                let offset = rng.uniform() * step;
                select_sorted(weights, (0..n).map(|k| offset + k as f64 * step))
            }
            ResamplingStrategy::Stratified => {
                let step = total / n as f64;
                let points: Vec<f64> = (0..n)
                    .map(|k| (k as f64 + rng.uniform()) * step)
                    .collect();
                select_sorted(weights, points.into_iter())
            }
            ResamplingStrategy::Multinomial => {
                let mut points: Vec<f64> = (0..n).map(|_| rng.uniform() * total).collect();
                points.sort_by(f64::total_cmp);
                select_sorted(weights, points.into_iter())
            }
            ResamplingStrategy::Residual => residual_draw(weights, total, n, rng),
        }
    }
}

/// Walk the cumulative weights once for ascending sample points on `[0, total)`.
fn select_sorted<I: Iterator<Item = f64>>(weights: &[f64], points: I) -> Vec<usize> {
    let last_positive = weights.iter().rposition(|&w| w > 0.0).unwrap_or(0);
    let mut indices = Vec::with_capacity(weights.len());
    let mut j = 0;
    let mut cumulative = weights.first().copied().unwrap_or(0.0);
    for u in points {
        while u >= cumulative && j < last_positive {
            j += 1;
            cumulative += weights[j];
        }
        indices.push(j);
    }
    indices
}

fn residual_draw<R: RandomSource>(weights: &[f64], total: f64, n: usize, rng: &mut R) -> Vec<usize> {
    let mut indices = Vec::with_capacity(n);
    let mut residual = vec![0.0; weights.len()];
    for (i, &w) in weights.iter().enumerate() {
        let scaled = w / total * n as f64;
        let copies = scaled.floor();
        residual[i] = scaled - copies;
        for _ in 0..copies as usize {
            indices.push(i);
        }
    }
    indices.truncate(n);
    let remaining = n - indices.len();
    if remaining > 0 {
        indices.extend(ResamplingStrategy::Systematic.draw(&residual, remaining, rng));
        indices.sort_unstable();
    }
    indices
}

/// Resampling thresholds and rejuvenation bandwidths.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResampleParams {
    /// Resample when `ESS / N_TAG` falls below this.
    pub threshold: f64,
    pub strategy: ResamplingStrategy,
    pub tag_jitter_std: f64,
    pub beacon_jitter_std: f64,
    /// Draw each copied beacon row's columns by their weights instead of copying them
    /// one to one.
    pub resample_beacon_columns: bool,
}

impl Default for ResampleParams {
    fn default() -> Self {
        ResampleParams {
            threshold: 0.5,
            strategy: ResamplingStrategy::Systematic,
            tag_jitter_std: 0.1,
            beacon_jitter_std: 0.1,
            resample_beacon_columns: true,
        }
    }
}

/// What a resampling pass did.
#[derive(Clone, Debug, PartialEq)]
pub enum ResampleOutcome {
    /// The ensemble was healthy; tag weights were rescaled to mean one.
    Renormalized { effective_sample_size: f64 },
    /// The ensemble was redrawn. `sources[k]` is the old index that new tag particle `k`
    /// and new row `k` of every beacon were copied from.
    Resampled {
        effective_sample_size: f64,
        sources: Vec<usize>,
    },
}

impl ResampleOutcome {
    pub fn effective_sample_size(&self) -> f64 {
        match self {
            ResampleOutcome::Renormalized {
                effective_sample_size,
            }
            | ResampleOutcome::Resampled {
                effective_sample_size,
                ..
            } => *effective_sample_size,
        }
    }

    pub fn resampled(&self) -> bool {
        matches!(self, ResampleOutcome::Resampled { .. })
    }
}

/// Heading rejuvenation bandwidth from the circular spread of the ensemble.
///
/// `-ln(R^2)` grows from zero for a perfectly concentrated ensemble and tracks the
/// circular variance `1 - R^2` when headings agree closely.
pub fn heading_bandwidth(mean_resultant_sq: f64, effective_sample_size: f64) -> f64 {
    if effective_sample_size <= 0.0 {
        return 0.0;
    }
    let r_sq = mean_resultant_sq.clamp(MIN_RESULTANT_SQ, 1.0);
    (-r_sq.ln() / effective_sample_size).max(0.0).sqrt()
}

/// Renormalize or resample the tag ensemble together with every tracked beacon.
///
/// `observed` names the beacon and range that produced the current weights. It is only
/// used for diagnostics; the weights have already been applied by the measurement model.
///
/// A tag ensemble whose total weight is zero or non-finite cannot be resampled. All tag
/// and beacon weights are reset to their spawn value and
/// [`FilterError::DegenerateEnsemble`] is returned.
pub fn resample<'a, R, I>(
    tag: &mut TagEnsemble,
    beacons: I,
    observed: Option<(BeaconId, &RangeMeasurement)>,
    params: &ResampleParams,
    rng: &mut R,
) -> Result<ResampleOutcome>
where
    R: RandomSource,
    I: IntoIterator<Item = &'a mut BeaconEnsemble>,
{
    let n = tag.len();
    let summary = tag.summary();
    if summary.is_degenerate() {
        error!(
            "Tag ensemble collapsed (total weight {}) after {:?}; resetting weights",
            summary.sum, observed
        );
        tag.reset_weights();
        for beacon in beacons {
            beacon.reset_weights();
        }
        return Err(FilterError::DegenerateEnsemble);
    }

    let ess = summary.effective_sample_size();
    if ess / n as f64 >= params.threshold {
        let mean = summary.sum / n as f64;
        for tp in tag.particles_mut() {
            tp.weight /= mean;
        }
        debug!("ESS {:.1}/{} healthy, renormalized after {:?}", ess, n, observed);
        return Ok(ResampleOutcome::Renormalized {
            effective_sample_size: ess,
        });
    }

    let weights: Vec<f64> = tag.particles().iter().map(|p| p.weight).collect();
    let sources = params.strategy.draw(&weights, n, rng);
    let h_heading = heading_bandwidth(summary.mean_resultant_sq(), ess);
    debug!(
        "ESS {:.1}/{} below threshold after {:?}; resampling (heading bandwidth {:.3e})",
        ess, n, observed, h_heading
    );

    let new_tag = sources
        .iter()
        .map(|&j| {
            spawn_tag_particle_from(&tag.particles()[j], params.tag_jitter_std, h_heading, rng)
        })
        .collect();

    for beacon in beacons {
        resample_beacon_rows(beacon, &sources, params, rng);
    }
    tag.replace(new_tag);

    Ok(ResampleOutcome::Resampled {
        effective_sample_size: ess,
        sources,
    })
}

/// Rebuild `beacon` so that new row `k` is a jittered copy of old row `sources[k]`.
fn resample_beacon_rows<R: RandomSource>(
    beacon: &mut BeaconEnsemble,
    sources: &[usize],
    params: &ResampleParams,
    rng: &mut R,
) {
    assert_eq!(
        beacon.num_rows(),
        sources.len(),
        "Beacon ensemble must have one row per tag particle"
    );
    let cols = beacon.num_cols();
    let mut particles = Vec::with_capacity(beacon.particles().len());
    for &j in sources {
        let row = beacon.row(j);
        let row_weight: f64 = row.iter().map(|p| p.weight).sum();
        if params.resample_beacon_columns && row_weight > 0.0 && row_weight.is_finite() {
            let weights: Vec<f64> = row.iter().map(|p| p.weight).collect();
            for c in params.strategy.draw(&weights, cols, rng) {
                particles.push(spawn_beacon_particle_from(
                    &row[c],
                    params.beacon_jitter_std,
                    rng,
                ));
            }
        } else {
            for bp in row {
                particles.push(spawn_beacon_particle_from(bp, params.beacon_jitter_std, rng));
            }
        }
    }
    beacon.replace(particles);
}

//! Filter orchestrator.
//!
//! A [`Filter`] owns the tag ensemble, the registry of tracked beacons, the odometry
//! accumulator and the random source. Odometry samples only advance the dead-reckoning
//! accumulator; the accumulated interval is consumed by the next range fix, which
//! propagates the tag ensemble, weights it and resamples it.
//!
//! ```text
//! deposit_odometry ──> accumulator ──┐
//!                                    v
//! deposit_range ──> motion ──> (unknown beacon) bootstrap
//!                          └─> (known beacon)   joint weighting ──> resample
//! ```

use log::{debug, warn};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{FilterError, Result};
use crate::init::{BootstrapParams, spawn_beacon_ensemble, spawn_tag_ensemble};
use crate::measurements::{RangeGate, RangeMeasurement, weigh_by_range, weigh_by_range_joint};
use crate::motion::{MotionNoise, OdometryDelta, apply_odometry, rotate_planar};
use crate::particle::{BeaconEnsemble, BeaconId, TagEnsemble};
use crate::resample::{ResampleOutcome, ResampleParams, ResamplingStrategy, resample};

/// Filter configuration.
///
/// Every field has a default, so a config file only needs to list what it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Number of tag particles, `N_TAG`.
    pub num_tag_particles: usize,
    /// Beacon hypotheses per tag particle, `N_BCN`.
    pub num_beacon_particles: usize,
    /// Positional process noise per square root of distance travelled.
    pub odometry_std_xyz: f64,
    /// Heading process noise per square root of elapsed time.
    pub odometry_std_heading: f64,
    pub gate_sigmas: f64,
    pub near_range: f64,
    pub near_range_penalty: f64,
    pub far_range_penalty: f64,
    pub bootstrap_attempts: usize,
    pub resample_threshold: f64,
    pub resampling_strategy: ResamplingStrategy,
    pub tag_jitter_std: f64,
    pub beacon_jitter_std: f64,
    pub resample_beacon_columns: bool,
    /// Random seed. A fresh seed is drawn when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            num_tag_particles: 1000,
            num_beacon_particles: 100,
            odometry_std_xyz: 1e-3,
            odometry_std_heading: 1e-6,
            gate_sigmas: 3.0,
            near_range: 3.0,
            near_range_penalty: 0.1,
            far_range_penalty: 0.5,
            bootstrap_attempts: 10,
            resample_threshold: 0.5,
            resampling_strategy: ResamplingStrategy::Systematic,
            tag_jitter_std: 0.1,
            beacon_jitter_std: 0.1,
            resample_beacon_columns: true,
            seed: None,
        }
    }
}

impl FilterConfig {
    /// Check that every parameter is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(FilterError::InvalidConfig(msg)) };
        if self.num_tag_particles == 0 {
            return invalid("num_tag_particles must be positive".into());
        }
        if self.num_beacon_particles == 0 {
            return invalid("num_beacon_particles must be positive".into());
        }
        for (name, value) in [
            ("odometry_std_xyz", self.odometry_std_xyz),
            ("odometry_std_heading", self.odometry_std_heading),
            ("tag_jitter_std", self.tag_jitter_std),
            ("beacon_jitter_std", self.beacon_jitter_std),
            ("near_range", self.near_range),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if !(self.gate_sigmas.is_finite() && self.gate_sigmas > 0.0) {
            return invalid(format!("gate_sigmas must be positive, got {}", self.gate_sigmas));
        }
        if !(0.0..=1.0).contains(&self.resample_threshold) {
            return invalid(format!(
                "resample_threshold must lie in [0, 1], got {}",
                self.resample_threshold
            ));
        }
        for (name, value) in [
            ("near_range_penalty", self.near_range_penalty),
            ("far_range_penalty", self.far_range_penalty),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{name} must lie in (0, 1], got {value}"));
            }
        }
        if self.bootstrap_attempts == 0 {
            return invalid("bootstrap_attempts must be positive".into());
        }
        Ok(())
    }

    pub fn motion_noise(&self) -> MotionNoise {
        MotionNoise {
            std_xyz: self.odometry_std_xyz,
            std_heading: self.odometry_std_heading,
        }
    }

    pub fn range_gate(&self) -> RangeGate {
        RangeGate {
            gate_sigmas: self.gate_sigmas,
            near_range: self.near_range,
            near_penalty: self.near_range_penalty,
            far_penalty: self.far_range_penalty,
        }
    }

    pub fn bootstrap_params(&self) -> BootstrapParams {
        BootstrapParams {
            gate_sigmas: self.gate_sigmas,
            attempts: self.bootstrap_attempts,
        }
    }

    pub fn resample_params(&self) -> ResampleParams {
        ResampleParams {
            threshold: self.resample_threshold,
            strategy: self.resampling_strategy,
            tag_jitter_std: self.tag_jitter_std,
            beacon_jitter_std: self.beacon_jitter_std,
            resample_beacon_columns: self.resample_beacon_columns,
        }
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        File::open(path)?.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }

    /// Write in the format named by the file extension (.json/.yaml/.yml/.toml).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }

    /// Read in the format named by the file extension (.json/.yaml/.yml/.toml).
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("unsupported config file extension: {}", path.display()),
    )
}

/// One raw odometry sample: time, position in the odometry frame, and the cumulative
/// path length reported by the odometry source.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OdometrySample {
    pub time: f64,
    pub position: Vector3<f64>,
    pub distance: f64,
}

impl OdometrySample {
    pub fn new(time: f64, position: Vector3<f64>, distance: f64) -> Self {
        OdometrySample {
            time,
            position,
            distance,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.time.is_finite()
            && self.position.iter().all(|v| v.is_finite())
            && self.distance.is_finite()
        {
            Ok(())
        } else {
            Err(FilterError::InvalidOdometry(self.time))
        }
    }
}

/// Dead-reckoning accumulator between range fixes.
///
/// `first` is the snapshot taken at the last processed range fix and `last` the most
/// recent sample. `last.distance` is a cumulative path length that never decreases
/// while the source's own counter keeps increasing.
#[derive(Clone, Copy, Debug, Default)]
pub struct OdometryAccumulator {
    first: OdometrySample,
    last: OdometrySample,
    primed: bool,
}

impl OdometryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a new sample. The first sample seeds both snapshots.
    pub fn deposit(&mut self, sample: OdometrySample) -> Result<()> {
        sample.validate()?;
        if !self.primed {
            self.first = sample;
            self.last = sample;
            self.primed = true;
            return Ok(());
        }
        if sample.time < self.last.time {
            warn!(
                "Odometry time went backwards from {} to {}",
                self.last.time, sample.time
            );
        }
        let distance = if sample.distance > self.last.distance {
            sample.distance
        } else {
            if sample.distance < self.last.distance {
                warn!(
                    "Odometry path counter reset from {:.3} to {:.3}; integrating steps",
                    self.last.distance, sample.distance
                );
            }
            self.last.distance + (sample.position - self.last.position).norm()
        };
        self.last = OdometrySample {
            distance,
            ..sample
        };
        Ok(())
    }

    /// Motion accumulated since the last fix, without consuming it.
    pub fn pending(&self) -> OdometryDelta {
        OdometryDelta {
            dt: self.last.time - self.first.time,
            displacement: self.last.position - self.first.position,
            distance: self.last.distance - self.first.distance,
        }
    }

    /// Return the pending motion and start a new interval at the latest sample.
    pub fn consume(&mut self) -> OdometryDelta {
        let delta = self.pending();
        self.first = self.last;
        delta
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Time of the latest sample, zero before any sample arrived.
    pub fn last_time(&self) -> f64 {
        self.last.time
    }

    /// Cumulative path length at the latest sample.
    pub fn last_distance(&self) -> f64 {
        self.last.distance
    }
}

/// Tag pose estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TagLocation {
    pub time: f64,
    pub position: Vector3<f64>,
    /// Circular mean heading on `(-pi, pi]`.
    pub heading: f64,
}

/// Beacon position estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeaconLocation {
    pub time: f64,
    pub position: Vector3<f64>,
}

#[derive(Clone, Debug)]
struct TrackedBeacon {
    id: BeaconId,
    ensemble: BeaconEnsemble,
}

/// Joint tag and beacon particle filter.
pub struct Filter {
    config: FilterConfig,
    tag: TagEnsemble,
    /// Tracked beacons in the order they were first observed.
    beacons: Vec<TrackedBeacon>,
    index: HashMap<BeaconId, usize>,
    odometry: OdometryAccumulator,
    last_resample: Option<ResampleOutcome>,
    resample_count: usize,
    rng: StdRng,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("tag", &self.tag)
            .field("tracked_beacons", &self.beacons.len())
            .field("odometry", &self.odometry)
            .field("resample_count", &self.resample_count)
            .finish()
    }
}

impl Filter {
    /// Create a filter with every tag particle at the origin.
    pub fn new(config: FilterConfig) -> Result<Self> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        debug!(
            "Creating filter with {} tag particles, {} beacon particles per row, seed {}",
            config.num_tag_particles, config.num_beacon_particles, seed
        );
        Ok(Filter {
            tag: spawn_tag_ensemble(config.num_tag_particles),
            beacons: Vec::new(),
            index: HashMap::new(),
            odometry: OdometryAccumulator::new(),
            last_resample: None,
            resample_count: 0,
            rng: StdRng::seed_from_u64(seed),
            config,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Advance the dead-reckoning accumulator. No weighting happens here.
    pub fn deposit_odometry(&mut self, sample: OdometrySample) -> Result<()> {
        self.odometry.deposit(sample)
    }

    /// Process a range fix against `beacon`.
    ///
    /// The first range for a beacon registers it and bootstraps its ensemble around the
    /// current tag hypotheses; later ranges weight and resample the joint ensemble.
    pub fn deposit_range(&mut self, beacon: BeaconId, measurement: RangeMeasurement) -> Result<()> {
        measurement.validate()?;
        self.propagate();

        let Some(idx) = self.index.get(&beacon).copied() else {
            let mut ensemble = BeaconEnsemble::new(
                self.config.num_tag_particles,
                self.config.num_beacon_particles,
            );
            spawn_beacon_ensemble(
                &mut ensemble,
                &self.tag,
                &measurement,
                &self.config.bootstrap_params(),
                &mut self.rng,
            );
            self.index.insert(beacon, self.beacons.len());
            self.beacons.push(TrackedBeacon {
                id: beacon,
                ensemble,
            });
            debug!("Beacon {} is now tracked ({} total)", beacon, self.beacons.len());
            return Ok(());
        };

        let outliers = weigh_by_range_joint(
            &mut self.tag,
            &mut self.beacons[idx].ensemble,
            &measurement,
            &self.config.range_gate(),
        );
        debug!(
            "Range {:.3} +/- {:.3} to beacon {}: {} beacon hypotheses outside the gate",
            measurement.range, measurement.std_range, beacon, outliers
        );
        self.finish_update(Some((beacon, &measurement)))
    }

    /// Process a range fix against a beacon at a surveyed position.
    pub fn deposit_anchored_range(
        &mut self,
        position: Vector3<f64>,
        measurement: RangeMeasurement,
    ) -> Result<()> {
        measurement.validate()?;
        self.propagate();
        let outliers = weigh_by_range(
            &mut self.tag,
            &position,
            &measurement,
            &self.config.range_gate(),
        );
        debug!(
            "Range {:.3} +/- {:.3} to anchor {:?}: {} tag hypotheses outside the gate",
            measurement.range,
            measurement.std_range,
            position.as_slice(),
            outliers
        );
        self.finish_update(None)
    }

    fn propagate(&mut self) {
        let delta = self.odometry.consume();
        apply_odometry(
            &mut self.tag,
            &delta,
            &self.config.motion_noise(),
            &mut self.rng,
        );
    }

    fn finish_update(&mut self, observed: Option<(BeaconId, &RangeMeasurement)>) -> Result<()> {
        let result = resample(
            &mut self.tag,
            self.beacons.iter_mut().map(|b| &mut b.ensemble),
            observed,
            &self.config.resample_params(),
            &mut self.rng,
        );
        match result {
            Ok(outcome) => {
                if outcome.resampled() {
                    self.resample_count += 1;
                }
                self.last_resample = Some(outcome);
                Ok(())
            }
            Err(e) => {
                self.last_resample = None;
                Err(e)
            }
        }
    }

    /// Weighted mean tag pose, including odometry received since the last range fix.
    pub fn query_tag_location(&self) -> Result<TagLocation> {
        let (mut position, heading) = self.tag.weighted_pose()?;
        let pending = self.odometry.pending();
        position += rotate_planar(&pending.displacement, heading);
        Ok(TagLocation {
            time: self.odometry.last_time(),
            position,
            heading,
        })
    }

    /// Marginal beacon position.
    pub fn query_beacon_location(&self, beacon: BeaconId) -> Result<BeaconLocation> {
        let position = self.beacon_ensemble(beacon)?.weighted_position(&self.tag)?;
        Ok(BeaconLocation {
            time: self.odometry.last_time(),
            position,
        })
    }

    /// Marginal expected distance between the beacon and the tag at the last fix.
    pub fn query_beacon_range(&self, beacon: BeaconId) -> Result<f64> {
        self.beacon_ensemble(beacon)?.weighted_range(&self.tag)
    }

    /// Weighted RMS distance of tag particles from their mean.
    pub fn query_tag_spread(&self) -> Result<f64> {
        self.tag.spread()
    }

    pub fn effective_sample_size(&self) -> f64 {
        self.tag.effective_sample_size()
    }

    pub fn is_known(&self, beacon: BeaconId) -> bool {
        self.index.contains_key(&beacon)
    }

    /// Tracked beacons in the order they were first observed.
    pub fn tracked_beacons(&self) -> impl Iterator<Item = BeaconId> + '_ {
        self.beacons.iter().map(|b| b.id)
    }

    pub fn tag_ensemble(&self) -> &TagEnsemble {
        &self.tag
    }

    pub fn beacon_ensemble(&self, beacon: BeaconId) -> Result<&BeaconEnsemble> {
        self.index
            .get(&beacon)
            .map(|&idx| &self.beacons[idx].ensemble)
            .ok_or(FilterError::UnknownBeacon(beacon))
    }

    pub fn odometry(&self) -> &OdometryAccumulator {
        &self.odometry
    }

    /// Outcome of the most recent resampling pass, if the last weighting update succeeded.
    pub fn last_resample(&self) -> Option<&ResampleOutcome> {
        self.last_resample.as_ref()
    }

    /// Number of range updates that redrew the ensemble.
    pub fn resample_count(&self) -> usize {
        self.resample_count
    }

    /// Stop tracking `beacon`. Returns whether it was tracked.
    pub fn forget_beacon(&mut self, beacon: BeaconId) -> bool {
        let Some(idx) = self.index.remove(&beacon) else {
            return false;
        };
        self.beacons.remove(idx);
        for tracked in &self.beacons[idx..] {
            if let Some(i) = self.index.get_mut(&tracked.id) {
                *i -= 1;
            }
        }
        debug!("Beacon {} forgotten ({} remain)", beacon, self.beacons.len());
        true
    }
}

//! Tag and beacon localization from odometry and UWB ranging
//!
//! This crate fuses a relative odometry stream (for example visual-inertial odometry on a phone) with
//! ultra-wideband range measurements to fixed beacons whose positions are not known in advance. It estimates
//! both the pose of the moving tag and the positions of the beacons with a Rao-Blackwellized particle filter in
//! the style of FastSLAM: the tag pose is represented by an ensemble of weighted particles, and every beacon
//! carries, for each tag particle, its own small ensemble of position hypotheses conditioned on that tag
//! particle.
//!
//! The filter works in the tag's own reference frame. The tag starts at the origin with zero heading, and
//! beacons are placed relative to that start. Odometry displacements are planar in the tag's moving frame and
//! are rotated into the global frame by each particle's heading, so heading drift between the odometry frame
//! and the filter frame is estimated along with position.
//!
//! ## Crate overview
//!
//! - [random]: The random source threaded through every stochastic step.
//! - [particle]: Tag and beacon particles, ensembles, and weighted estimators.
//! - [init]: Initial tag ensemble, beacon bootstrap from a first range, and jittered particle copies.
//! - [motion]: The odometry motion model.
//! - [measurements]: Range measurements, the outlier gate, and the weighting steps.
//! - [resample]: Effective-sample-size monitoring, resampling strategies, and rejuvenation.
//! - [filter]: The [`Filter`] orchestrator, its configuration, and the odometry accumulator.
//! - [bindings]: A handle-based [`Session`] for host-language bindings.
//! - [sim]: Replay of recorded event logs.
//! - [error]: The [`FilterError`] type.
//!
//! ## Usage
//!
//! ```
//! use nalgebra::Vector3;
//! use slam3d::{BeaconId, Filter, FilterConfig, OdometrySample, RangeMeasurement};
//!
//! let config = FilterConfig {
//!     num_tag_particles: 200,
//!     num_beacon_particles: 20,
//!     seed: Some(42),
//!     ..FilterConfig::default()
//! };
//! let mut filter = Filter::new(config).unwrap();
//! filter.deposit_odometry(OdometrySample::new(0.0, Vector3::zeros(), 0.0)).unwrap();
//! filter.deposit_odometry(OdometrySample::new(1.0, Vector3::new(1.0, 0.0, 0.0), 1.0)).unwrap();
//! filter.deposit_range(BeaconId(1), RangeMeasurement::new(5.0, 0.1)).unwrap();
//!
//! let tag = filter.query_tag_location().unwrap();
//! let range = filter.query_beacon_range(BeaconId(1)).unwrap();
//! assert!((tag.position[0] - 1.0).abs() < 0.05);
//! assert!((range - 5.0).abs() < 0.3);
//! ```
pub mod bindings;
pub mod error;
pub mod filter;
pub mod init;
pub mod measurements;
pub mod motion;
pub mod particle;
pub mod random;
pub mod resample;
pub mod sim;

pub use bindings::{BeaconHandle, FilterHandle, Session};
pub use error::{FilterError, Result};
pub use filter::{BeaconLocation, Filter, FilterConfig, OdometrySample, TagLocation};
pub use measurements::RangeMeasurement;
pub use particle::BeaconId;
pub use random::RandomSource;
pub use resample::ResamplingStrategy;

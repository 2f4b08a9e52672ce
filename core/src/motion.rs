//! Odometry motion model.
//!
//! Each tag particle applies the planar odometry displacement in its own heading frame
//! and then takes a random step. Positional noise scales with the square root of the
//! path length travelled and heading noise with the square root of elapsed time, so a
//! particle that moved a long, curving route diffuses more than one that shuffled in
//! place even when both report the same net displacement.

use nalgebra::Vector3;

use crate::particle::{TagEnsemble, wrap_heading};
use crate::random::RandomSource;

/// Odometry accumulated between two range fixes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OdometryDelta {
    pub dt: f64,
    /// Displacement in the odometry frame.
    pub displacement: Vector3<f64>,
    /// Path length travelled, not net displacement.
    pub distance: f64,
}

/// Process noise gains.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionNoise {
    /// Positional std per square root of distance travelled.
    pub std_xyz: f64,
    /// Heading std per square root of elapsed time.
    pub std_heading: f64,
}

impl Default for MotionNoise {
    fn default() -> Self {
        MotionNoise {
            std_xyz: 1e-3,
            std_heading: 1e-6,
        }
    }
}

/// Rotate a planar displacement from a frame with the given heading into the global frame.
pub fn rotate_planar(displacement: &Vector3<f64>, heading: f64) -> Vector3<f64> {
    let (s, c) = heading.sin_cos();
    Vector3::new(
        displacement[0] * c - displacement[1] * s,
        displacement[0] * s + displacement[1] * c,
        displacement[2],
    )
}

/// Propagate every tag particle by `delta`.
pub fn apply_odometry<R: RandomSource>(
    tag: &mut TagEnsemble,
    delta: &OdometryDelta,
    noise: &MotionNoise,
    rng: &mut R,
) {
    let std_xyz = delta.distance.max(0.0).sqrt() * noise.std_xyz;
    let std_heading = delta.dt.max(0.0).sqrt() * noise.std_heading;
    for tp in tag.particles_mut() {
        let step = rotate_planar(&delta.displacement, tp.heading);
        let (rx, ry) = rng.normal_pair();
        let (rz, rtheta) = rng.normal_pair();
        tp.position += step + Vector3::new(rx, ry, rz) * std_xyz;
        tp.heading = wrap_heading(tp.heading + rtheta * std_heading);
    }
}

//! Particle spawning: the initial tag ensemble, beacon bootstrap from a first range, and
//! jittered copies used during rejuvenation.

use log::{debug, warn};
use nalgebra::Vector3;
use std::f64::consts::TAU;

use crate::measurements::RangeMeasurement;
use crate::particle::{BeaconEnsemble, BeaconParticle, TagEnsemble, TagParticle, wrap_heading};
use crate::random::RandomSource;

/// Bootstrap parameters for a newly observed beacon.
#[derive(Clone, Copy, Debug)]
pub struct BootstrapParams {
    /// Half-width of the sampled shell in units of the range standard deviation.
    pub gate_sigmas: f64,
    /// Radius draws attempted before falling back to a zero radius.
    pub attempts: usize,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        BootstrapParams {
            gate_sigmas: 3.0,
            attempts: 10,
        }
    }
}

/// Tag ensemble of `n` identical particles at the origin with zero heading.
///
/// The tag's starting pose defines the reference frame, so the ensemble starts as a
/// single degenerate hypothesis.
pub fn spawn_tag_ensemble(n: usize) -> TagEnsemble {
    TagEnsemble::from_particles(vec![TagParticle::default(); n])
}

/// Populate `beacon` with hypotheses on a spherical shell around every tag particle.
///
/// Radii are uniform on `[range - k*std, range + k*std]`; elevation uses the inverse sine
/// of a uniform draw so directions are uniform over the sphere. Returns the number of
/// particles that fell back to a zero radius.
pub fn spawn_beacon_ensemble<R: RandomSource>(
    beacon: &mut BeaconEnsemble,
    tag: &TagEnsemble,
    measurement: &RangeMeasurement,
    params: &BootstrapParams,
    rng: &mut R,
) -> usize {
    assert_eq!(
        beacon.num_rows(),
        tag.len(),
        "Beacon ensemble must have one row per tag particle"
    );
    let mut fallbacks = 0;
    for (i, tp) in tag.particles().iter().enumerate() {
        for bp in beacon.row_mut(i) {
            if !spawn_beacon_particle(bp, tp, measurement, params, rng) {
                fallbacks += 1;
            }
        }
    }
    if fallbacks > 0 {
        warn!(
            "Beacon bootstrap fell back to zero radius for {} of {} particles (range {:.3} +/- {:.3})",
            fallbacks,
            beacon.particles().len(),
            measurement.range,
            measurement.std_range
        );
    }
    debug!(
        "Bootstrapped {}x{} beacon particles from range {:.3} +/- {:.3}",
        beacon.num_rows(),
        beacon.num_cols(),
        measurement.range,
        measurement.std_range
    );
    fallbacks
}

/// Draw one beacon particle around `tp`. Returns `false` if every radius draw was negative
/// and the particle was placed at zero radius.
pub fn spawn_beacon_particle<R: RandomSource>(
    bp: &mut BeaconParticle,
    tp: &TagParticle,
    measurement: &RangeMeasurement,
    params: &BootstrapParams,
    rng: &mut R,
) -> bool {
    let half_width = params.gate_sigmas * measurement.std_range;
    let mut radius = None;
    for _ in 0..params.attempts {
        let candidate = measurement.range + half_width * (rng.uniform() * 2.0 - 1.0);
        if candidate >= 0.0 {
            radius = Some(candidate);
            break;
        }
    }
    let elevation = (rng.uniform() * 2.0 - 1.0).asin();
    let azimuth = rng.uniform() * TAU;

    let r = radius.unwrap_or(0.0);
    let horizontal = r * elevation.cos();
    let offset = Vector3::new(
        horizontal * azimuth.cos(),
        horizontal * azimuth.sin(),
        r * elevation.sin(),
    );
    bp.weight = 1.0;
    bp.position = tp.position + offset;
    radius.is_some()
}

/// Jittered copy of `other` with unit weight.
pub fn spawn_tag_particle_from<R: RandomSource>(
    other: &TagParticle,
    h_xyz: f64,
    h_heading: f64,
    rng: &mut R,
) -> TagParticle {
    let (dx, dy) = rng.normal_pair();
    let (dz, dtheta) = rng.normal_pair();
    TagParticle {
        weight: 1.0,
        position: other.position + Vector3::new(dx, dy, dz) * h_xyz,
        heading: wrap_heading(other.heading + dtheta * h_heading),
    }
}

/// Jittered copy of `other` with unit weight.
pub fn spawn_beacon_particle_from<R: RandomSource>(
    other: &BeaconParticle,
    h_xyz: f64,
    rng: &mut R,
) -> BeaconParticle {
    let (dx, dy) = rng.normal_pair();
    let (dz, _) = rng.normal_pair();
    BeaconParticle {
        weight: 1.0,
        position: other.position + Vector3::new(dx, dy, dz) * h_xyz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn scattered_tag(n: usize, rng: &mut StdRng) -> TagEnsemble {
        let mut tag = spawn_tag_ensemble(n);
        for p in tag.particles_mut() {
            p.position = Vector3::new(
                rng.uniform() * 10.0,
                rng.uniform() * 10.0,
                rng.uniform(),
            );
        }
        tag
    }

    #[test]
    fn tag_ensemble_starts_at_origin() {
        let tag = spawn_tag_ensemble(50);
        assert_eq!(tag.len(), 50);
        for p in tag.particles() {
            assert_eq!(p.weight, 1.0);
            assert_eq!(p.position, Vector3::zeros());
            assert_eq!(p.heading, 0.0);
        }
    }

    #[test]
    fn bootstrap_particles_lie_in_shell_around_their_tag_particle() {
        let mut rng = StdRng::seed_from_u64(5);
        let tag = scattered_tag(40, &mut rng);
        let mut beacon = BeaconEnsemble::new(40, 25);
        let measurement = RangeMeasurement::new(5.0, 0.1);
        let fallbacks = spawn_beacon_ensemble(
            &mut beacon,
            &tag,
            &measurement,
            &BootstrapParams::default(),
            &mut rng,
        );
        assert_eq!(fallbacks, 0);
        for (i, tp) in tag.particles().iter().enumerate() {
            for bp in beacon.row(i) {
                let d = (bp.position - tp.position).norm();
                assert!((4.7 - 1e-9..=5.3 + 1e-9).contains(&d), "distance {d}");
                assert_eq!(bp.weight, 1.0);
            }
        }
    }

    #[test]
    fn bootstrap_directions_cover_the_sphere() {
        let mut rng = StdRng::seed_from_u64(8);
        let tag = spawn_tag_ensemble(1);
        let mut beacon = BeaconEnsemble::new(1, 4000);
        spawn_beacon_ensemble(
            &mut beacon,
            &tag,
            &RangeMeasurement::new(1.0, 0.01),
            &BootstrapParams::default(),
            &mut rng,
        );
        // Uniform on the sphere: z is uniform on [-1, 1], so half the mass has |z| < 0.5.
        let inner = beacon
            .particles()
            .iter()
            .filter(|bp| bp.position[2].abs() < 0.5)
            .count() as f64
            / 4000.0;
        assert!((inner - 0.5).abs() < 0.05, "fraction {inner}");
        let mean = beacon
            .particles()
            .iter()
            .fold(Vector3::zeros(), |acc, bp| acc + bp.position)
            / 4000.0;
        assert!(mean.norm() < 0.1, "mean {mean}");
    }

    #[test]
    fn impossible_radius_falls_back_to_tag_position() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut tag = spawn_tag_ensemble(3);
        tag.particles_mut()[1].position = Vector3::new(1.0, 2.0, 3.0);
        let mut beacon = BeaconEnsemble::new(3, 4);
        let fallbacks = spawn_beacon_ensemble(
            &mut beacon,
            &tag,
            &RangeMeasurement::new(-10.0, 0.1),
            &BootstrapParams::default(),
            &mut rng,
        );
        assert_eq!(fallbacks, 12);
        for bp in beacon.row(1) {
            assert_eq!(bp.position, Vector3::new(1.0, 2.0, 3.0));
        }
    }

    #[test]
    #[should_panic(expected = "Beacon ensemble must have one row per tag particle")]
    fn bootstrap_rejects_misaligned_ensembles() {
        let mut rng = StdRng::seed_from_u64(1);
        let tag = spawn_tag_ensemble(3);
        let mut beacon = BeaconEnsemble::new(2, 4);
        spawn_beacon_ensemble(
            &mut beacon,
            &tag,
            &RangeMeasurement::new(1.0, 0.1),
            &BootstrapParams::default(),
            &mut rng,
        );
    }

    #[test]
    fn zero_bandwidth_copies_are_exact() {
        let mut rng = StdRng::seed_from_u64(4);
        let source = TagParticle {
            weight: 0.25,
            position: Vector3::new(1.0, -2.0, 0.5),
            heading: 1.0,
        };
        let copy = spawn_tag_particle_from(&source, 0.0, 0.0, &mut rng);
        assert_eq!(copy.position, source.position);
        assert_approx_eq!(copy.heading, 1.0, 1e-15);
        assert_eq!(copy.weight, 1.0);

        let bsource = BeaconParticle {
            weight: 0.1,
            position: Vector3::new(3.0, 3.0, 3.0),
        };
        let bcopy = spawn_beacon_particle_from(&bsource, 0.0, &mut rng);
        assert_eq!(bcopy.position, bsource.position);
        assert_eq!(bcopy.weight, 1.0);
    }

    #[test]
    fn jittered_heading_stays_wrapped() {
        let mut rng = StdRng::seed_from_u64(9);
        let source = TagParticle {
            weight: 1.0,
            position: Vector3::zeros(),
            heading: 0.0,
        };
        for _ in 0..1000 {
            let copy = spawn_tag_particle_from(&source, 0.1, 0.5, &mut rng);
            assert!((0.0..TAU).contains(&copy.heading));
        }
    }
}

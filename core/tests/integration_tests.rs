//! End-to-end tests of the tag/beacon filter.
//!
//! These tests drive a [`Filter`] through short synthetic odometry and range sequences and
//! check the behavior a caller relies on: beacon registration, estimates that reflect the
//! observed geometry, bounded outlier handling, and tag/beacon pairing across resampling.
//! Tolerances are loose where the outcome is stochastic; every filter is seeded so a
//! failure reproduces.
use nalgebra::Vector3;

use slam3d::resample::ResampleOutcome;
use slam3d::{
    BeaconId, Filter, FilterConfig, FilterError, OdometrySample, RangeMeasurement, Session,
};

fn config(num_tag: usize, num_bcn: usize, seed: u64) -> FilterConfig {
    FilterConfig {
        num_tag_particles: num_tag,
        num_beacon_particles: num_bcn,
        seed: Some(seed),
        ..FilterConfig::default()
    }
}

/// Waypoints every `step` along a closed square of side `side` starting at the origin.
fn square_path(side: f64, step: f64, loops: usize) -> Vec<Vector3<f64>> {
    let corners = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(side, 0.0, 0.0),
        Vector3::new(side, side, 0.0),
        Vector3::new(0.0, side, 0.0),
        Vector3::new(0.0, 0.0, 0.0),
    ];
    let per_edge = (side / step).round() as usize;
    let mut path = Vec::new();
    for _ in 0..loops {
        for edge in corners.windows(2) {
            for k in 1..=per_edge {
                path.push(edge[0] + (edge[1] - edge[0]) * (k as f64 / per_edge as f64));
            }
        }
    }
    path
}

#[test]
fn first_range_makes_beacon_known_on_its_shell() {
    let mut filter = Filter::new(config(500, 50, 1)).unwrap();
    let beacon = BeaconId(1);
    filter
        .deposit_odometry(OdometrySample::new(0.0, Vector3::zeros(), 0.0))
        .unwrap();
    filter
        .deposit_odometry(OdometrySample::new(1.0, Vector3::new(1.0, 0.0, 0.0), 1.0))
        .unwrap();
    assert!(!filter.is_known(beacon));
    assert_eq!(
        filter.query_beacon_location(beacon),
        Err(FilterError::UnknownBeacon(beacon))
    );

    filter
        .deposit_range(beacon, RangeMeasurement::new(5.0, 0.1))
        .unwrap();

    assert!(filter.is_known(beacon));
    let tag = filter.query_tag_location().unwrap();
    assert!((tag.position - Vector3::new(1.0, 0.0, 0.0)).norm() < 0.01);
    assert_eq!(tag.time, 1.0);

    let range = filter.query_beacon_range(beacon).unwrap();
    assert!((range - 5.0).abs() <= 0.3, "expected range {range}");
    let location = filter.query_beacon_location(beacon).unwrap();
    assert_eq!(location.time, 1.0);
    // A lone range only fixes a shell, whose mean point is its centre.
    assert!((location.position - tag.position).norm() < 1.0);
}

#[test]
fn consistent_ranges_keep_the_ensemble_healthy() {
    let mut filter = Filter::new(config(200, 30, 2)).unwrap();
    let beacon = BeaconId(4);
    for k in 0..20 {
        filter
            .deposit_odometry(OdometrySample::new(k as f64, Vector3::zeros(), 0.0))
            .unwrap();
        filter
            .deposit_range(beacon, RangeMeasurement::new(5.0, 0.1))
            .unwrap();
        assert!(filter.effective_sample_size() / 200.0 >= 0.5);
    }
    assert_eq!(filter.resample_count(), 0);
    assert!((filter.effective_sample_size() - 200.0).abs() < 1e-6);
}

#[test]
fn beacon_estimate_converges_along_a_square_path() {
    let mut filter = Filter::new(FilterConfig {
        tag_jitter_std: 0.02,
        beacon_jitter_std: 0.05,
        ..config(200, 50, 3)
    })
    .unwrap();
    let beacon = BeaconId(7);
    let truth = Vector3::new(4.0, 3.0, 0.0);
    let std_range = 0.1;

    filter
        .deposit_odometry(OdometrySample::new(0.0, Vector3::zeros(), 0.0))
        .unwrap();
    filter
        .deposit_range(beacon, RangeMeasurement::new(truth.norm(), std_range))
        .unwrap();
    let initial = filter.query_beacon_location(beacon).unwrap().position;
    let initial_error = (initial - truth).xy().norm();

    let mut travelled = 0.0;
    let mut previous = Vector3::zeros();
    for (k, position) in square_path(4.0, 0.5, 2).into_iter().enumerate() {
        travelled += (position - previous).norm();
        previous = position;
        let time = (k + 1) as f64;
        filter
            .deposit_odometry(OdometrySample::new(time, position, travelled))
            .unwrap();
        let range = (truth - position).norm();
        filter
            .deposit_range(beacon, RangeMeasurement::new(range, std_range))
            .unwrap();
    }

    let estimate = filter.query_beacon_location(beacon).unwrap().position;
    let final_error = (estimate - truth).xy().norm();
    assert!(
        final_error < 1.5 && final_error < 0.5 * initial_error,
        "beacon error {initial_error:.2} -> {final_error:.2}, estimate {estimate:?}"
    );
    assert!(filter.resample_count() > 0);

    let tag = filter.query_tag_location().unwrap();
    let expected_range = (truth - tag.position).norm();
    let range = filter.query_beacon_range(beacon).unwrap();
    assert!(
        (range - expected_range).abs() < 0.5,
        "range {range:.2}, expected {expected_range:.2}"
    );
}

#[test]
fn far_outlier_halves_weights_without_collapse() {
    let mut filter = Filter::new(config(100, 20, 4)).unwrap();
    let beacon = BeaconId(2);
    filter
        .deposit_range(beacon, RangeMeasurement::new(5.0, 0.1))
        .unwrap();
    filter
        .deposit_range(beacon, RangeMeasurement::new(5.0, 0.1))
        .unwrap();

    filter
        .deposit_range(beacon, RangeMeasurement::new(50.0, 0.1))
        .unwrap();

    let ensemble = filter.beacon_ensemble(beacon).unwrap();
    assert!(ensemble.particles().iter().all(|p| p.weight == 0.5));
    let tag = filter.tag_ensemble();
    assert!(tag.particles().iter().all(|p| p.weight > 0.0));
    assert!(filter.effective_sample_size() / 100.0 >= 0.5);
    assert!(filter.query_tag_location().is_ok());
}

#[test]
fn near_outlier_is_penalized_harder() {
    let mut filter = Filter::new(config(100, 20, 5)).unwrap();
    let beacon = BeaconId(2);
    filter
        .deposit_range(beacon, RangeMeasurement::new(2.0, 0.05))
        .unwrap();

    filter
        .deposit_range(beacon, RangeMeasurement::new(1.0, 0.05))
        .unwrap();

    let ensemble = filter.beacon_ensemble(beacon).unwrap();
    for p in ensemble.particles() {
        assert!((p.weight - 0.1).abs() < 1e-12);
    }
    assert!(filter.tag_ensemble().particles().iter().all(|p| p.weight > 0.0));
}

#[test]
fn forced_resampling_never_leaves_zero_weights() {
    let mut filter = Filter::new(FilterConfig {
        resample_threshold: 1.0,
        ..config(100, 20, 6)
    })
    .unwrap();
    let beacon = BeaconId(3);
    filter
        .deposit_range(beacon, RangeMeasurement::new(5.0, 0.5))
        .unwrap();
    filter
        .deposit_range(beacon, RangeMeasurement::new(6.4, 0.05))
        .unwrap();

    assert!(filter.last_resample().unwrap().resampled());
    assert!(filter.tag_ensemble().particles().iter().all(|p| p.weight == 1.0));
    assert!(
        filter
            .beacon_ensemble(beacon)
            .unwrap()
            .particles()
            .iter()
            .all(|p| p.weight == 1.0)
    );
}

#[test]
fn every_beacon_row_stays_paired_with_its_tag_particle() {
    let mut filter = Filter::new(FilterConfig {
        odometry_std_xyz: 2.0,
        tag_jitter_std: 0.0,
        beacon_jitter_std: 0.0,
        resample_threshold: 1.0,
        ..config(80, 15, 7)
    })
    .unwrap();
    let first = BeaconId(10);
    let second = BeaconId(20);

    // Scatter the tag particles so a mismatched row would sit far off its shell.
    filter
        .deposit_odometry(OdometrySample::new(0.0, Vector3::zeros(), 0.0))
        .unwrap();
    filter
        .deposit_odometry(OdometrySample::new(1.0, Vector3::new(1.0, 0.0, 0.0), 1.0))
        .unwrap();
    filter
        .deposit_range(first, RangeMeasurement::new(5.0, 0.1))
        .unwrap();
    filter
        .deposit_range(second, RangeMeasurement::new(3.0, 0.1))
        .unwrap();
    assert!(filter.query_tag_spread().unwrap() > 1.0);

    filter
        .deposit_range(first, RangeMeasurement::new(5.2, 0.1))
        .unwrap();

    let Some(ResampleOutcome::Resampled { sources, .. }) = filter.last_resample() else {
        panic!("expected the update to resample");
    };
    assert_eq!(sources.len(), 80);
    let tag = filter.tag_ensemble();
    for (beacon, range) in [(first, 5.0), (second, 3.0)] {
        let ensemble = filter.beacon_ensemble(beacon).unwrap();
        for (k, tp) in tag.particles().iter().enumerate() {
            for bp in ensemble.row(k) {
                let d = (bp.position - tp.position).norm();
                assert!(
                    (range - 0.3 - 1e-9..=range + 0.3 + 1e-9).contains(&d),
                    "beacon {beacon} row {k}: distance {d}"
                );
            }
        }
    }
}

#[test]
fn anchored_ranges_pull_the_tag_toward_a_surveyed_beacon() {
    let mut filter = Filter::new(FilterConfig {
        odometry_std_xyz: 0.5,
        tag_jitter_std: 0.05,
        ..config(500, 10, 8)
    })
    .unwrap();
    let anchor = Vector3::new(10.0, 0.0, 0.0);
    filter
        .deposit_odometry(OdometrySample::new(0.0, Vector3::zeros(), 0.0))
        .unwrap();
    filter
        .deposit_odometry(OdometrySample::new(1.0, Vector3::zeros(), 4.0))
        .unwrap();
    for _ in 0..10 {
        filter
            .deposit_anchored_range(anchor, RangeMeasurement::new(10.0, 0.1))
            .unwrap();
    }
    let tag = filter.query_tag_location().unwrap();
    let range = (anchor - tag.position).norm();
    assert!((range - 10.0).abs() < 0.5, "range {range}");

    // Most of the weight sits on hypotheses inside the gate.
    let ensemble = filter.tag_ensemble();
    let inside: f64 = ensemble
        .particles()
        .iter()
        .filter(|p| ((anchor - p.position).norm() - 10.0).abs() <= 0.3)
        .map(|p| p.weight)
        .sum();
    assert!(inside / ensemble.total_weight() > 0.5);
}

#[test]
fn session_runs_a_full_sequence_in_single_precision() {
    let mut session = Session::new(config(300, 30, 9));
    let filter = session.create_filter().unwrap();
    let beacon = session.create_beacon();

    session
        .deposit_odometry(filter, 0.0, 0.0, 0.0, 0.0, 0.0)
        .unwrap();
    session
        .deposit_odometry(filter, 1.0, 1.0, 0.0, 0.0, 1.0)
        .unwrap();
    session.deposit_range(filter, beacon, 5.0, 0.1).unwrap();
    session
        .deposit_odometry(filter, 2.0, 1.5, 0.0, 0.0, 1.5)
        .unwrap();
    session.deposit_range(filter, beacon, 4.8, 0.1).unwrap();

    let (t, x, y, z, _) = session.query_tag_location(filter).unwrap();
    assert_eq!(t, 2.0);
    assert!((x - 1.5).abs() < 0.1);
    assert!(y.abs() < 0.1);
    assert!(z.abs() < 0.1);
    let (t, ..) = session.query_beacon_location(filter, beacon).unwrap();
    assert_eq!(t, 2.0);

    session.destroy_beacon(beacon).unwrap();
    session.destroy_filter(filter).unwrap();
    assert_eq!(
        session.query_tag_location(filter),
        Err(FilterError::UnknownFilter(filter.raw()))
    );
}

#[test]
fn config_file_drives_filter_construction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("filter.toml");
    std::fs::write(
        &path,
        "num_tag_particles = 64\nnum_beacon_particles = 8\nresampling_strategy = \"residual\"\nseed = 5\n",
    )
    .unwrap();
    let config = FilterConfig::from_file(&path).unwrap();
    let mut filter = Filter::new(config).unwrap();
    filter
        .deposit_range(BeaconId(1), RangeMeasurement::new(3.5, 0.1))
        .unwrap();
    assert_eq!(filter.tag_ensemble().len(), 64);
    assert_eq!(filter.beacon_ensemble(BeaconId(1)).unwrap().num_cols(), 8);
}

//! Handle-based boundary for host bindings.
//!
//! Host code holds opaque [`FilterHandle`]s and [`BeaconHandle`]s issued by a
//! [`Session`] and exchanges single-precision positions and ranges with double-precision
//! timestamps. The session owns every filter, checks every handle, and enforces that a
//! beacon is only ever ranged against one filter.
//!
//! A session holds no locks. Hosts that call in from several threads wrap it in a mutex.

use log::debug;
use nalgebra::Vector3;
use std::collections::HashMap;

use crate::error::{FilterError, Result};
use crate::filter::{Filter, FilterConfig, OdometrySample};
use crate::measurements::RangeMeasurement;
use crate::particle::BeaconId;

/// Opaque reference to a filter owned by a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FilterHandle(u64);

impl FilterHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Opaque reference to a beacon owned by a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BeaconHandle(u64);

impl BeaconHandle {
    pub fn raw(&self) -> u64 {
        self.0
    }

    fn id(&self) -> BeaconId {
        BeaconId(self.0)
    }
}

/// Owner of every filter and beacon handed out to a host.
#[derive(Debug)]
pub struct Session {
    config: FilterConfig,
    filters: HashMap<u64, Filter>,
    /// Beacon handle to the filter it was first ranged against.
    beacons: HashMap<u64, Option<u64>>,
    next_handle: u64,
}

impl Default for Session {
    fn default() -> Self {
        Session::new(FilterConfig::default())
    }
}

impl Session {
    /// Session whose filters use `config`. A configured seed is offset by each filter's
    /// handle so filters in one session draw different streams.
    pub fn new(config: FilterConfig) -> Self {
        Session {
            config,
            filters: HashMap::new(),
            beacons: HashMap::new(),
            next_handle: 1,
        }
    }

    fn issue(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    pub fn create_filter(&mut self) -> Result<FilterHandle> {
        let config = self.config.clone();
        self.create_filter_with(config)
    }

    pub fn create_filter_with(&mut self, mut config: FilterConfig) -> Result<FilterHandle> {
        config.validate()?;
        let handle = self.issue();
        config.seed = config.seed.map(|s| s.wrapping_add(handle));
        self.filters.insert(handle, Filter::new(config)?);
        debug!("Created filter handle {}", handle);
        Ok(FilterHandle(handle))
    }

    /// Release a filter. Beacons that were bound to it become free again.
    pub fn destroy_filter(&mut self, filter: FilterHandle) -> Result<()> {
        self.filters
            .remove(&filter.0)
            .ok_or(FilterError::UnknownFilter(filter.0))?;
        for bound in self.beacons.values_mut() {
            if *bound == Some(filter.0) {
                *bound = None;
            }
        }
        debug!("Destroyed filter handle {}", filter.0);
        Ok(())
    }

    pub fn create_beacon(&mut self) -> BeaconHandle {
        let handle = self.issue();
        self.beacons.insert(handle, None);
        BeaconHandle(handle)
    }

    /// Release a beacon and drop it from the filter tracking it.
    pub fn destroy_beacon(&mut self, beacon: BeaconHandle) -> Result<()> {
        let bound = self
            .beacons
            .remove(&beacon.0)
            .ok_or(FilterError::UnknownBeaconHandle(beacon.0))?;
        if let Some(filter) = bound.and_then(|f| self.filters.get_mut(&f)) {
            filter.forget_beacon(beacon.id());
        }
        Ok(())
    }

    pub fn filter(&self, filter: FilterHandle) -> Result<&Filter> {
        self.filters
            .get(&filter.0)
            .ok_or(FilterError::UnknownFilter(filter.0))
    }

    fn filter_mut(&mut self, filter: FilterHandle) -> Result<&mut Filter> {
        self.filters
            .get_mut(&filter.0)
            .ok_or(FilterError::UnknownFilter(filter.0))
    }

    /// Filter the beacon is bound to, if any.
    pub fn beacon_binding(&self, beacon: BeaconHandle) -> Result<Option<FilterHandle>> {
        self.beacons
            .get(&beacon.0)
            .map(|bound| bound.map(FilterHandle))
            .ok_or(FilterError::UnknownBeaconHandle(beacon.0))
    }

    pub fn deposit_odometry(
        &mut self,
        filter: FilterHandle,
        t: f64,
        x: f32,
        y: f32,
        z: f32,
        dist: f32,
    ) -> Result<()> {
        let sample = OdometrySample::new(
            t,
            Vector3::new(x as f64, y as f64, z as f64),
            dist as f64,
        );
        self.filter_mut(filter)?.deposit_odometry(sample)
    }

    pub fn deposit_range(
        &mut self,
        filter: FilterHandle,
        beacon: BeaconHandle,
        range: f32,
        std_range: f32,
    ) -> Result<()> {
        let bound = *self
            .beacons
            .get(&beacon.0)
            .ok_or(FilterError::UnknownBeaconHandle(beacon.0))?;
        if let Some(other) = bound {
            if other != filter.0 {
                return Err(FilterError::BeaconBoundToOtherFilter {
                    beacon: beacon.0,
                    filter: other,
                });
            }
        }
        let f = self.filter_mut(filter)?;
        let result = f.deposit_range(
            beacon.id(),
            RangeMeasurement::new(range as f64, std_range as f64),
        );
        if f.is_known(beacon.id()) {
            self.beacons.insert(beacon.0, Some(filter.0));
        }
        result
    }

    /// `(t, x, y, z, heading)` of the tag.
    pub fn query_tag_location(&self, filter: FilterHandle) -> Result<(f64, f32, f32, f32, f32)> {
        let loc = self.filter(filter)?.query_tag_location()?;
        Ok((
            loc.time,
            loc.position[0] as f32,
            loc.position[1] as f32,
            loc.position[2] as f32,
            loc.heading as f32,
        ))
    }

    /// `(t, x, y, z)` of a beacon.
    pub fn query_beacon_location(
        &self,
        filter: FilterHandle,
        beacon: BeaconHandle,
    ) -> Result<(f64, f32, f32, f32)> {
        if !self.beacons.contains_key(&beacon.0) {
            return Err(FilterError::UnknownBeaconHandle(beacon.0));
        }
        let loc = self.filter(filter)?.query_beacon_location(beacon.id())?;
        Ok((
            loc.time,
            loc.position[0] as f32,
            loc.position[1] as f32,
            loc.position[2] as f32,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn session() -> Session {
        Session::new(FilterConfig {
            num_tag_particles: 40,
            num_beacon_particles: 10,
            seed: Some(11),
            ..FilterConfig::default()
        })
    }

    #[test]
    fn handles_are_never_reused() {
        let mut s = session();
        let f1 = s.create_filter().unwrap();
        let b1 = s.create_beacon();
        s.destroy_filter(f1).unwrap();
        s.destroy_beacon(b1).unwrap();
        let f2 = s.create_filter().unwrap();
        let b2 = s.create_beacon();
        let raw = [f1.raw(), b1.raw(), f2.raw(), b2.raw()];
        for (i, a) in raw.iter().enumerate() {
            assert!(raw[i + 1..].iter().all(|b| b != a));
        }
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut s = session();
        let f = s.create_filter().unwrap();
        let b = s.create_beacon();
        s.destroy_filter(f).unwrap();
        assert_eq!(
            s.deposit_odometry(f, 0.0, 0.0, 0.0, 0.0, 0.0),
            Err(FilterError::UnknownFilter(f.raw()))
        );
        assert_eq!(s.destroy_filter(f), Err(FilterError::UnknownFilter(f.raw())));

        let f = s.create_filter().unwrap();
        s.destroy_beacon(b).unwrap();
        assert_eq!(
            s.deposit_range(f, b, 5.0, 0.1),
            Err(FilterError::UnknownBeaconHandle(b.raw()))
        );
        assert_eq!(
            s.query_beacon_location(f, b),
            Err(FilterError::UnknownBeaconHandle(b.raw()))
        );
    }

    #[test]
    fn beacon_binds_to_the_first_filter_that_ranges_it() {
        let mut s = session();
        let f1 = s.create_filter().unwrap();
        let f2 = s.create_filter().unwrap();
        let b = s.create_beacon();
        assert_eq!(s.beacon_binding(b), Ok(None));

        s.deposit_range(f1, b, 5.0, 0.1).unwrap();
        assert_eq!(s.beacon_binding(b), Ok(Some(f1)));
        assert_eq!(
            s.deposit_range(f2, b, 5.0, 0.1),
            Err(FilterError::BeaconBoundToOtherFilter {
                beacon: b.raw(),
                filter: f1.raw(),
            })
        );

        s.destroy_filter(f1).unwrap();
        assert_eq!(s.beacon_binding(b), Ok(None));
        s.deposit_range(f2, b, 5.0, 0.1).unwrap();
        assert_eq!(s.beacon_binding(b), Ok(Some(f2)));
    }

    #[test]
    fn invalid_first_range_leaves_beacon_unbound() {
        let mut s = session();
        let f = s.create_filter().unwrap();
        let b = s.create_beacon();
        assert!(s.deposit_range(f, b, 5.0, -0.1).is_err());
        assert_eq!(s.beacon_binding(b), Ok(None));
    }

    #[test]
    fn destroying_a_beacon_removes_it_from_its_filter() {
        let mut s = session();
        let f = s.create_filter().unwrap();
        let b = s.create_beacon();
        s.deposit_range(f, b, 5.0, 0.1).unwrap();
        assert!(s.filter(f).unwrap().is_known(BeaconId(b.raw())));
        s.destroy_beacon(b).unwrap();
        assert!(!s.filter(f).unwrap().is_known(BeaconId(b.raw())));
    }

    #[test]
    fn single_precision_round_trip() {
        let mut s = session();
        let f = s.create_filter().unwrap();
        let b = s.create_beacon();
        s.deposit_odometry(f, 100.0, 0.0, 0.0, 0.0, 0.0).unwrap();
        s.deposit_odometry(f, 101.5, 1.0, 0.0, 0.0, 1.0).unwrap();

        let (t, x, y, _, theta) = s.query_tag_location(f).unwrap();
        assert_eq!(t, 101.5);
        assert_approx_eq!(x, 1.0f32, 1e-6);
        assert_approx_eq!(y, 0.0f32, 1e-6);
        assert_approx_eq!(theta, 0.0f32, 1e-6);

        assert_eq!(
            s.query_beacon_location(f, b),
            Err(FilterError::UnknownBeacon(BeaconId(b.raw())))
        );
        s.deposit_range(f, b, 5.0, 0.1).unwrap();
        let (t, ..) = s.query_beacon_location(f, b).unwrap();
        assert_eq!(t, 101.5);
    }

    #[test]
    fn filters_in_one_session_draw_different_streams() {
        let mut s = session();
        let f1 = s.create_filter().unwrap();
        let f2 = s.create_filter().unwrap();
        let b1 = s.create_beacon();
        let b2 = s.create_beacon();
        s.deposit_range(f1, b1, 5.0, 0.1).unwrap();
        s.deposit_range(f2, b2, 5.0, 0.1).unwrap();
        let p1 = s.filter(f1).unwrap().beacon_ensemble(BeaconId(b1.raw())).unwrap().particles()[0];
        let p2 = s.filter(f2).unwrap().beacon_ensemble(BeaconId(b2.raw())).unwrap().particles()[0];
        assert_ne!(p1.position, p2.position);
    }
}

//! Replay of recorded odometry and range logs.
//!
//! An event log is a CSV file with one row per sensor event, in time order:
//!
//! ```text
//! time,kind,x,y,z,dist,beacon,range,std_range
//! 0.0,odometry,0.0,0.0,0.0,0.0,,,
//! 0.5,odometry,0.4,0.0,0.0,0.4,,,
//! 0.6,range,,,,,7,5.02,0.1
//! ```
//!
//! [`replay`] drives a [`Filter`] through the log and records one tag estimate per range
//! event, plus the estimate of every tracked beacon at that time.

use anyhow::{Context, anyhow};
use log::{info, warn};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

use crate::error::FilterError;
use crate::filter::{Filter, OdometrySample};
use crate::measurements::RangeMeasurement;
use crate::particle::BeaconId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Odometry,
    Range,
}

/// One row of an event log. Odometry rows fill `x, y, z, dist`; range rows fill
/// `beacon, range, std_range`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: f64,
    pub kind: EventKind,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub dist: Option<f64>,
    pub beacon: Option<u64>,
    pub range: Option<f64>,
    pub std_range: Option<f64>,
}

/// A validated event ready for the filter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Event {
    Odometry(OdometrySample),
    Range {
        time: f64,
        beacon: BeaconId,
        measurement: RangeMeasurement,
    },
}

impl EventRecord {
    pub fn odometry(time: f64, position: Vector3<f64>, dist: f64) -> Self {
        EventRecord {
            time,
            kind: EventKind::Odometry,
            x: Some(position[0]),
            y: Some(position[1]),
            z: Some(position[2]),
            dist: Some(dist),
            beacon: None,
            range: None,
            std_range: None,
        }
    }

    pub fn range(time: f64, beacon: u64, range: f64, std_range: f64) -> Self {
        EventRecord {
            time,
            kind: EventKind::Range,
            x: None,
            y: None,
            z: None,
            dist: None,
            beacon: Some(beacon),
            range: Some(range),
            std_range: Some(std_range),
        }
    }

    /// Check that the columns for this row's kind are present.
    pub fn to_event(&self) -> anyhow::Result<Event> {
        let field = |value: Option<f64>, name: &str| {
            value.ok_or_else(|| anyhow!("{:?} event at t = {} is missing '{}'", self.kind, self.time, name))
        };
        match self.kind {
            EventKind::Odometry => Ok(Event::Odometry(OdometrySample::new(
                self.time,
                Vector3::new(field(self.x, "x")?, field(self.y, "y")?, field(self.z, "z")?),
                field(self.dist, "dist")?,
            ))),
            EventKind::Range => Ok(Event::Range {
                time: self.time,
                beacon: BeaconId(
                    self.beacon
                        .ok_or_else(|| anyhow!("range event at t = {} has no beacon", self.time))?,
                ),
                measurement: RangeMeasurement::new(
                    field(self.range, "range")?,
                    field(self.std_range, "std_range")?,
                ),
            }),
        }
    }

    /// Read an event log.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Self>> {
        let path = path.as_ref();
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("opening event log {}", path.display()))?;
        let mut records = Vec::new();
        for (line, result) in rdr.deserialize().enumerate() {
            let record: Self =
                result.with_context(|| format!("parsing event {} of {}", line + 1, path.display()))?;
            records.push(record);
        }
        Ok(records)
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        write_csv(records, path)
    }
}

/// Tag estimate after a range event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimateRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: f64,
    /// Weighted RMS distance of the tag particles from their mean.
    pub spread: f64,
    pub ess: f64,
    /// Number of tracked beacons.
    pub beacons: usize,
}

impl EstimateRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Self>> {
        read_csv(path.as_ref())
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        write_csv(records, path)
    }
}

/// Beacon estimate after a range event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub beacon: u64,
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Expected tag-to-beacon distance.
    pub range: f64,
}

impl BeaconRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Self>> {
        read_csv(path.as_ref())
    }

    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        write_csv(records, path)
    }
}

fn read_csv<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<Vec<T>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut records = Vec::new();
    for result in rdr.deserialize::<T>() {
        records.push(result?);
    }
    Ok(records)
}

fn write_csv<T: Serialize, P: AsRef<Path>>(records: &[T], path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Everything recorded while replaying a log.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplayOutput {
    pub estimates: Vec<EstimateRecord>,
    pub beacons: Vec<BeaconRecord>,
    /// Range events the filter rejected or could not use.
    pub skipped: usize,
}

/// Run every event through `filter`.
///
/// Invalid range readings and degenerate updates are logged and skipped; the filter
/// recovers from both on its own. Malformed rows and invalid odometry abort the replay.
pub fn replay(filter: &mut Filter, events: &[EventRecord]) -> anyhow::Result<ReplayOutput> {
    let mut output = ReplayOutput::default();
    for record in events {
        match record.to_event()? {
            Event::Odometry(sample) => filter
                .deposit_odometry(sample)
                .with_context(|| format!("odometry at t = {}", sample.time))?,
            Event::Range {
                time,
                beacon,
                measurement,
            } => {
                match filter.deposit_range(beacon, measurement) {
                    Ok(()) => {}
                    Err(e @ (FilterError::InvalidMeasurement { .. } | FilterError::DegenerateEnsemble)) => {
                        warn!("Range to beacon {} at t = {}: {}", beacon, time, e);
                        output.skipped += 1;
                    }
                    Err(e) => return Err(e).with_context(|| format!("range at t = {time}")),
                }
                record_estimates(filter, time, &mut output);
            }
        }
    }
    info!(
        "Replayed {} events: {} estimates, {} beacon estimates, {} skipped ranges",
        events.len(),
        output.estimates.len(),
        output.beacons.len(),
        output.skipped
    );
    Ok(output)
}

fn record_estimates(filter: &Filter, time: f64, output: &mut ReplayOutput) {
    let (location, spread) = match (filter.query_tag_location(), filter.query_tag_spread()) {
        (Ok(location), Ok(spread)) => (location, spread),
        (Err(e), _) | (_, Err(e)) => {
            warn!("No tag estimate at t = {}: {}", time, e);
            return;
        }
    };
    let tracked: Vec<BeaconId> = filter.tracked_beacons().collect();
    output.estimates.push(EstimateRecord {
        time,
        x: location.position[0],
        y: location.position[1],
        z: location.position[2],
        heading: location.heading,
        spread,
        ess: filter.effective_sample_size(),
        beacons: tracked.len(),
    });
    for beacon in tracked {
        let estimate = filter
            .query_beacon_location(beacon)
            .and_then(|loc| Ok((loc, filter.query_beacon_range(beacon)?)));
        match estimate {
            Ok((loc, range)) => output.beacons.push(BeaconRecord {
                beacon: beacon.0,
                time,
                x: loc.position[0],
                y: loc.position[1],
                z: loc.position[2],
                range,
            }),
            Err(e) => warn!("No estimate for beacon {} at t = {}: {}", beacon, time, e),
        }
    }
}

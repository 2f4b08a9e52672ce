//! Error types for filter operations.

use thiserror::Error;

use crate::particle::BeaconId;

/// Result type alias for filter operations.
pub type Result<T> = std::result::Result<T, FilterError>;

/// Errors surfaced by the filter and by the handle boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterError {
    /// The beacon has never received a range observation from this filter.
    #[error("beacon {0} is not tracked by this filter")]
    UnknownBeacon(BeaconId),

    /// Total tag weight collapsed to zero (or stopped being finite).
    #[error("tag ensemble is degenerate: total weight is zero or non-finite")]
    DegenerateEnsemble,

    /// A range observation that cannot be used for weighting.
    #[error("invalid range measurement: range {range}, std {std_range}")]
    InvalidMeasurement { range: f64, std_range: f64 },

    /// An odometry sample with non-finite fields.
    #[error("invalid odometry sample at t = {0}")]
    InvalidOdometry(f64),

    /// Configuration rejected by [`crate::filter::FilterConfig::validate`].
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filter handle not owned by this session.
    #[error("unknown filter handle {0}")]
    UnknownFilter(u64),

    /// Beacon handle not owned by this session.
    #[error("unknown beacon handle {0}")]
    UnknownBeaconHandle(u64),

    /// Beacon already registered with a different filter.
    #[error("beacon {beacon} is bound to filter {filter}")]
    BeaconBoundToOtherFilter { beacon: u64, filter: u64 },
}

//! Tightly-coupled GNSS/IMU integrated navigation toolbox
//!
//! This crate fuses high-rate inertial measurements with low-rate satellite fixes to
//! produce a continuous six-degree-of-freedom pose trajectory, and it diagnoses the
//! observation model (position corrections, lateral-axis residuals) across a sweep of
//! GNSS-to-IMU time offsets in order to recover the true sensor timing delay.
//!
//! The estimator is an 18-state error-state Kalman filter (ESKF) with a nominal/error
//! split. The nominal state carries position, velocity, attitude, gyro bias,
//! accelerometer bias, and the gravity vector; the error state is an 18-vector ordered
//! `[δp, δv, δθ, δbg, δba, δg]` that is re-zeroed after every observation through a
//! covariance projection. Attitude lives on SO(3) with a right-perturbation
//! convention: `R_true = R_nominal · Exp(δθ)`, and every attitude update goes through
//! the exponential map so the estimate remains a proper rotation.
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra for the filter
//!   (fixed-size vectors and matrices, `Rotation3` as the SO(3) representation).
//! - [`nav-types`](https://crates.io/crates/nav-types): geodetic coordinate types for
//!   the WGS84 input side of the planar projection.
//! - [`chrono`](https://crates.io/crates/chrono): wall-clock key parsing used to match
//!   satellite fixes against the auxiliary heading stream.
//!
//! ## Crate overview
//!
//! - [earth]: WGS84 constants, the transverse-Mercator (UTM) projection, and the
//!   locally-anchored planar frame used by the filter.
//! - [linalg]: skew-symmetric and SO(3) helpers shared by the filter Jacobians.
//! - [eskf]: the 18-state error-state Kalman filter and its observation models.
//! - [io]: the ASCII drive-log reader producing typed sample buffers.
//! - [events]: the tagged event model, timestamp merge, and heading matching.
//! - [turns]: the heading-rate turn detector that gates observations during turns.
//! - [pipeline]: offline (offset sweep) and realtime (queued GNSS) replay drivers.
//! - [sim]: synthetic drive-session generation for tests and tuning experiments.
//!
//! ## Conventions
//!
//! The body frame is X-right, Y-forward, Z-up. The planar world frame is a UTM zone
//! anchored at the first accepted fix, so positions are small local meters. Headings
//! follow the source data and are degrees in `[0, 360)`; internally the filter reads
//! heading as `atan2(R[1,0], R[0,0])`. Timestamps are seconds within a single session
//! epoch and every stream handed to the filter is non-decreasing in time, with IMU
//! sorted ahead of GNSS when timestamps coincide.

pub mod earth;
pub mod eskf;
pub mod events;
pub mod io;
pub mod linalg;
pub mod pipeline;
pub mod sim;
pub mod turns;

use nalgebra::{Rotation3, Vector3};

/// A single inertial sample: body-frame angular rate and specific force.
///
/// Samples are produced by pairing accelerometer and gyroscope records from the log;
/// the timestamp is the later of the two paired records.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImuSample {
    /// Timestamp in seconds, monotonic within a session
    pub timestamp: f64,
    /// Angular rate in rad/s, body frame x, y, z axis
    pub gyro: Vector3<f64>,
    /// Specific force in m/s^2, body frame x, y, z axis
    pub accel: Vector3<f64>,
}

impl ImuSample {
    pub fn new(timestamp: f64, gyro: Vector3<f64>, accel: Vector3<f64>) -> Self {
        ImuSample {
            timestamp,
            gyro,
            accel,
        }
    }
}

/// A raw GNSS record as read from the log, still in geodetic coordinates.
///
/// The planar [`GnssFix`] consumed by the filter is produced from this through the
/// [`earth::LocalFrame`] projector.
#[derive(Clone, Debug, Default)]
pub struct GnssRecord {
    /// Timestamp in seconds, same epoch as the IMU stream
    pub timestamp: f64,
    /// WGS84 latitude in degrees
    pub latitude_deg: f64,
    /// WGS84 longitude in degrees
    pub longitude_deg: f64,
    /// Altitude in meters
    pub altitude: f64,
    /// Reported heading in degrees
    pub heading_deg: f64,
    /// Reported ground speed
    pub speed: f64,
    /// Receiver fix-status code (4 = valid fix, 0 = invalid)
    pub status: i32,
    /// Whether the reported heading may be observed by the filter
    pub heading_valid: bool,
    /// Wall-clock key `Y-M-D H:M:S` used to match auxiliary heading samples
    pub wall_clock_key: Option<String>,
}

/// A planar GNSS fix in the locally anchored frame.
///
/// The rotation is built about the vertical axis only: its yaw equals the reported
/// heading (minus the antenna yaw bias) and roll/pitch are identity.
#[derive(Clone, Debug)]
pub struct GnssFix {
    /// Timestamp in seconds (after any configured time offset)
    pub timestamp: f64,
    /// Position in local meters
    pub position: Vector3<f64>,
    /// Attitude, yaw-only
    pub rotation: Rotation3<f64>,
    /// Whether the heading channel may be observed
    pub heading_valid: bool,
    /// Receiver fix-status code
    pub status: i32,
}

/// An auxiliary heading sample, keyed by wall-clock second rather than by timestamp.
///
/// The source is independent of the GNSS heading field; samples are matched to fixes
/// through the wall-clock key and only then acquire a numeric timestamp.
#[derive(Clone, Debug)]
pub struct HeadingSample {
    /// Wall-clock key `Y-M-D H:M:S`
    pub wall_clock_key: String,
    /// Heading in degrees in `[0, 360)`
    pub heading_deg: f64,
}

/// A calibration feedback pair: pitch/heading misalignment tagged with a timestamp.
///
/// Assembled from a `$FBK flag` line and the `$FBK misalignment` line that follows it.
/// The pipeline forwards these to the filter, which folds them into its installation
/// rotation.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationSample {
    /// Timestamp in seconds
    pub timestamp: f64,
    /// Pitch misalignment in degrees
    pub pitch_deg: f64,
    /// Heading misalignment in degrees
    pub heading_deg: f64,
}

/// Wrap an angle in degrees to the range `[0, 360)`.
///
/// # Example
/// ```rust
/// use gins::wrap_to_360;
/// assert_eq!(wrap_to_360(370.0), 10.0);
/// assert_eq!(wrap_to_360(-10.0), 350.0);
/// ```
pub fn wrap_to_360(angle: f64) -> f64 {
    let mut wrapped = angle % 360.0;
    if wrapped < 0.0 {
        wrapped += 360.0;
    }
    wrapped
}

/// Wrap an angular difference in degrees to the range `(-180, 180]`.
///
/// Used when differencing consecutive headings so that a crossing of the 0/360
/// boundary does not read as a near-full-circle turn.
///
/// # Example
/// ```rust
/// use gins::wrap_heading_diff;
/// assert_eq!(wrap_heading_diff(350.0, 10.0), 20.0);
/// assert_eq!(wrap_heading_diff(10.0, 350.0), -20.0);
/// ```
pub fn wrap_heading_diff(from_deg: f64, to_deg: f64) -> f64 {
    let mut diff = to_deg - from_deg;
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff <= -180.0 {
        diff += 360.0;
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_to_360() {
        assert_eq!(wrap_to_360(0.0), 0.0);
        assert_eq!(wrap_to_360(359.9), 359.9);
        assert_eq!(wrap_to_360(360.0), 0.0);
        assert_eq!(wrap_to_360(725.0), 5.0);
        assert_eq!(wrap_to_360(-90.0), 270.0);
    }

    #[test]
    fn test_wrap_heading_diff() {
        assert_eq!(wrap_heading_diff(0.0, 10.0), 10.0);
        assert_eq!(wrap_heading_diff(10.0, 0.0), -10.0);
        assert_eq!(wrap_heading_diff(359.0, 1.0), 2.0);
        assert_eq!(wrap_heading_diff(1.0, 359.0), -2.0);
        // the boundary case lands on +180, not -180
        assert_eq!(wrap_heading_diff(0.0, 180.0), 180.0);
    }

    #[test]
    fn test_imu_sample_new() {
        let s = ImuSample::new(1.5, Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.0, 0.0, 9.8));
        assert_eq!(s.timestamp, 1.5);
        assert_eq!(s.gyro[2], 0.3);
        assert_eq!(s.accel[2], 9.8);
    }
}

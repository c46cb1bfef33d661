//! Tagged sensor events, the timestamp merge, and heading matching.
//!
//! The log reader produces typed buffers per sensor; this module turns them into the
//! single time-sorted stream the filter replays. A configurable offset is added to
//! every GNSS timestamp before the merge, which is how the offline pipeline scans
//! candidate GNSS-to-IMU delays. The merge is stable with an IMU-before-GNSS
//! tie-break: an inertial sample that lands exactly on a fix epoch must be
//! propagated first so the covariance reflects the latest kinematics before the
//! update.
//!
//! The auxiliary heading stream carries no numeric timestamps of its own: samples
//! are keyed by wall-clock second strings. [`match_headings`] joins them against the
//! fixes that carry the same key, first by exact string equality and then after
//! normalizing both sides to the zero-padded `YYYY-MM-DD HH:MM:SS` form.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::earth::LocalFrame;
use crate::turns::HeadingPoint;
use crate::{CalibrationSample, GnssFix, GnssRecord, HeadingSample, ImuSample};

/// Typed sample buffers produced by the log reader.
#[derive(Clone, Debug, Default)]
pub struct SensorStreams {
    pub imu: Vec<ImuSample>,
    pub gnss: Vec<GnssRecord>,
    pub headings: Vec<HeadingSample>,
    pub calibration: Vec<CalibrationSample>,
    /// Wheel-odometry records are parsed for compatibility but not fused
    pub odom_count: usize,
}

impl SensorStreams {
    pub fn is_empty(&self) -> bool {
        self.imu.is_empty() && self.gnss.is_empty()
    }
}

/// One entry of the merged stream handed to the filter.
#[derive(Clone, Debug)]
pub enum Event {
    Imu(ImuSample),
    Gnss(GnssFix),
}

impl Event {
    /// The primary timestamp key (after any configured offset).
    pub fn timestamp(&self) -> f64 {
        match self {
            Event::Imu(sample) => sample.timestamp,
            Event::Gnss(fix) => fix.timestamp,
        }
    }

    /// Tie-break rank: IMU sorts ahead of GNSS at identical timestamps.
    fn rank(&self) -> u8 {
        match self {
            Event::Imu(_) => 0,
            Event::Gnss(_) => 1,
        }
    }
}

/// Build the merged, time-sorted event stream for one replay.
///
/// Every GNSS record is projected into the anchored planar frame (records that fail
/// to project are logged and skipped), shifted by `gnss_offset` seconds, and merged
/// with the IMU buffer. The sort is stable by `(timestamp, IMU-first)`, so replaying
/// the same buffers with the same offset yields a bit-identical stream.
pub fn reorganize(
    streams: &SensorStreams,
    gnss_offset: f64,
    frame: &mut LocalFrame,
) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::with_capacity(streams.imu.len() + streams.gnss.len());
    events.extend(streams.imu.iter().copied().map(Event::Imu));
    for record in &streams.gnss {
        match frame.project(record) {
            Ok(mut fix) => {
                fix.timestamp += gnss_offset;
                events.push(Event::Gnss(fix));
            }
            Err(reason) => {
                log::warn!(
                    "dropping gnss record at {:.3}: {}",
                    record.timestamp,
                    reason
                );
            }
        }
    }
    events.sort_by(|a, b| {
        a.timestamp()
            .total_cmp(&b.timestamp())
            .then_with(|| a.rank().cmp(&b.rank()))
    });
    events
}

/// Normalize a wall-clock key to the canonical 19-character
/// `YYYY-MM-DD HH:MM:SS` form by zero-padding single-digit fields.
///
/// Returns `None` when the key does not parse as a date-time at all.
pub fn normalize_wall_clock_key(key: &str) -> Option<String> {
    NaiveDateTime::parse_from_str(key.trim(), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Join keyed GNSS fixes against the auxiliary heading stream.
///
/// Matching runs in two passes per fix: (a) exact equality on the wall-clock key,
/// (b) equality after normalizing both keys to the canonical zero-padded form. Each
/// key resolves to at most one heading sample, first occurrence winning (the reader
/// already de-duplicates the heading source to one sample per wall-clock second).
///
/// The output pairs the matched heading with the fix timestamp plus `gnss_offset`,
/// in fix order, ready for the turn detector.
pub fn match_headings(
    gnss: &[GnssRecord],
    headings: &[HeadingSample],
    gnss_offset: f64,
) -> Vec<HeadingPoint> {
    let mut exact: HashMap<&str, f64> = HashMap::new();
    let mut normalized: HashMap<String, f64> = HashMap::new();
    for sample in headings {
        exact
            .entry(sample.wall_clock_key.as_str())
            .or_insert(sample.heading_deg);
        if let Some(canonical) = normalize_wall_clock_key(&sample.wall_clock_key) {
            normalized.entry(canonical).or_insert(sample.heading_deg);
        }
    }

    let mut matched = Vec::new();
    for record in gnss {
        let Some(key) = record.wall_clock_key.as_deref() else {
            continue;
        };
        let heading = exact.get(key).copied().or_else(|| {
            normalize_wall_clock_key(key).and_then(|canonical| normalized.get(&canonical).copied())
        });
        if let Some(heading_deg) = heading {
            matched.push(HeadingPoint {
                timestamp: record.timestamp + gnss_offset,
                heading_deg,
            });
        }
    }
    log::debug!(
        "matched {} of {} keyed fixes against {} heading samples",
        matched.len(),
        gnss.len(),
        headings.len()
    );
    matched
}

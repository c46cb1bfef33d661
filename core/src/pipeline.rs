//! Offline and realtime replay pipelines.
//!
//! The offline pipeline loads a drive log once, then replays it deterministically
//! for each configured GNSS time offset: GNSS timestamps are shifted, the merged
//! stream is rebuilt, a fresh filter is instantiated, and the turn detector's
//! segment list decides per fix whether the full pose or only the position is
//! observed. Each offset produces its own artifact set (trajectory, covariance
//! diagonal, correction log, lateral-residual log, turn segments) so that external
//! tooling can compare RMS across the sweep and recover the true sensor delay.
//!
//! The realtime pipeline replays the same data the way a live system would see it:
//! fixes that arrive ahead of the filter clock are queued and drained after each
//! prediction step, and fixes that have gone stale are dropped.
//!
//! Given identical input and identical offset the produced artifacts are
//! bit-identical: there is no wall clock, no hashing of unordered containers, and
//! no thread scheduling anywhere in the replay path.

use std::collections::VecDeque;
use std::error::Error;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::earth::LocalFrame;
use crate::eskf::{Eskf, EskfOptions, NavState};
use crate::events::{match_headings, reorganize, Event, SensorStreams};
use crate::io::load_log;
use crate::turns::{write_segments_csv, TurnDetector, TurnDetectorConfig};
use crate::GnssFix;

/// Antenna mounting geometry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AntennaConfig {
    /// Yaw bias between the antenna heading and the body heading, degrees
    pub yaw_bias_deg: f64,
    /// Lever arm from the body origin to the antenna, meters, body frame
    pub lever_arm: [f64; 3],
}

impl Default for AntennaConfig {
    fn default() -> Self {
        AntennaConfig {
            yaw_bias_deg: 12.06,
            lever_arm: [-0.17, -0.20, 0.0],
        }
    }
}

/// Full replay configuration.
///
/// Serializable so a whole experiment can be pinned to a file; the
/// [`ReplayConfig::from_file`] / [`ReplayConfig::to_file`] pair dispatches on the
/// extension between JSON, YAML, and TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    // scalar fields stay ahead of the nested tables so the TOML form serializes
    /// Gate observations with detected turn segments (offline only)
    pub enable_turn_detection: bool,
    /// GNSS timestamp offsets to replay, seconds; one artifact set per entry
    pub gps_time_offsets: Vec<f64>,
    /// Directory receiving the output files
    pub output_dir: PathBuf,
    /// Pre-computed initial gyro bias, deg/s
    pub initial_gyro_bias_deg_s: [f64; 3],
    /// Pre-computed initial accelerometer bias, m/s^2
    pub initial_accel_bias: [f64; 3],
    /// Initial gravity vector, m/s^2
    pub gravity: [f64; 3],
    /// Filter options
    pub eskf: EskfOptions,
    /// Turn detector thresholds
    pub turn: TurnDetectorConfig,
    /// Antenna geometry used by the coordinate adapter
    pub antenna: AntennaConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            enable_turn_detection: false,
            gps_time_offsets: vec![0.0],
            output_dir: PathBuf::from("output"),
            // the biases come from an external static calibration of the same
            // sensor set
            initial_gyro_bias_deg_s: [0.001711, -0.021235, 0.049159],
            initial_accel_bias: [-0.013369, -0.020087, 0.101552],
            gravity: [0.0, 0.0, -9.8],
            // phone-logger tuning
            eskf: EskfOptions {
                gyro_var: 2e-3,
                acce_var: 5e-2,
                bias_gyro_var: 1e-6,
                bias_acce_var: 1e-4,
                ..EskfOptions::default()
            },
            turn: TurnDetectorConfig::default(),
            antenna: AntennaConfig::default(),
        }
    }
}

impl ReplayConfig {
    /// Write the configuration, choosing the format by file extension
    /// (`.json` / `.yaml` / `.yml` / `.toml`).
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => {
                let file = File::create(p)?;
                serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
            }
            Some("yaml") | Some("yml") => {
                let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
                fs::write(p, s)
            }
            Some("toml") => {
                let s = toml::to_string(self).map_err(io::Error::other)?;
                fs::write(p, s)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    /// Read the configuration, choosing the format by file extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        let ext = p
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_lowercase());
        match ext.as_deref() {
            Some("json") => {
                let file = File::open(p)?;
                serde_json::from_reader(file).map_err(io::Error::other)
            }
            Some("yaml") | Some("yml") => {
                let file = File::open(p)?;
                serde_yaml::from_reader(file).map_err(io::Error::other)
            }
            Some("toml") => {
                let mut s = String::new();
                File::open(p)?.read_to_string(&mut s)?;
                toml::from_str(&s).map_err(io::Error::other)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }

    fn build_filter(&self, calibration: &[crate::CalibrationSample]) -> Eskf {
        let mut eskf = Eskf::new(self.eskf.clone());
        let gyro_bias = Vector3::new(
            self.initial_gyro_bias_deg_s[0].to_radians(),
            self.initial_gyro_bias_deg_s[1].to_radians(),
            self.initial_gyro_bias_deg_s[2].to_radians(),
        );
        let accel_bias = Vector3::from_row_slice(&self.initial_accel_bias);
        let gravity = Vector3::from_row_slice(&self.gravity);
        eskf.set_initial_conditions(self.eskf.clone(), gyro_bias, accel_bias, gravity);
        for pair in calibration {
            eskf.apply_misalignment(pair.pitch_deg, pair.heading_deg);
        }
        eskf
    }

    fn local_frame(&self) -> LocalFrame {
        LocalFrame::new(
            Vector3::from_row_slice(&self.antenna.lever_arm),
            self.antenna.yaw_bias_deg,
        )
    }
}

/// Suffix appended to artifact names for a given offset; empty at zero.
fn offset_suffix(offset: f64) -> String {
    if offset.abs() < 5e-7 {
        String::new()
    } else {
        format!("_{}ms", (offset * 1000.0).round() as i64)
    }
}

/// The per-offset artifact writers.
///
/// Timestamps and floats are printed with nine decimal places so replays can be
/// compared bit-for-bit.
struct OffsetWriters {
    trajectory: BufWriter<File>,
    covariance: BufWriter<File>,
    corrections: BufWriter<File>,
    lateral: BufWriter<File>,
}

impl OffsetWriters {
    fn create(dir: &Path, suffix: &str) -> io::Result<Self> {
        let open = |name: &str| -> io::Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(
                dir.join(format!("{name}{suffix}.txt")),
            )?))
        };
        Ok(OffsetWriters {
            trajectory: open("trajectory")?,
            covariance: open("covariance")?,
            corrections: open("corrections")?,
            lateral: open("lateral")?,
        })
    }

    /// `timestamp p(3) q(w,x,y,z) v(3) bg(3) ba(3) gps_p(3) has_gps`
    fn trajectory_row(&mut self, state: &NavState, gps: Option<&Vector3<f64>>) -> io::Result<()> {
        let q = state.quaternion_wxyz();
        let zero = Vector3::zeros();
        let gps_p = gps.unwrap_or(&zero);
        writeln!(
            self.trajectory,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} \
             {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {}",
            state.timestamp,
            state.position[0],
            state.position[1],
            state.position[2],
            q[0],
            q[1],
            q[2],
            q[3],
            state.velocity[0],
            state.velocity[1],
            state.velocity[2],
            state.gyro_bias[0],
            state.gyro_bias[1],
            state.gyro_bias[2],
            state.accel_bias[0],
            state.accel_bias[1],
            state.accel_bias[2],
            gps_p[0],
            gps_p[1],
            gps_p[2],
            u8::from(gps.is_some()),
        )
    }

    /// `timestamp diag(P)[0..17]`
    fn covariance_row(&mut self, timestamp: f64, diagonal: &[f64; 18]) -> io::Result<()> {
        write!(self.covariance, "{:.9}", timestamp)?;
        for value in diagonal {
            write!(self.covariance, " {:.9}", value)?;
        }
        writeln!(self.covariance)
    }

    /// `timestamp dp(3) |dp| residual(3) |residual|`
    fn correction_row(
        &mut self,
        timestamp: f64,
        delta: &Vector3<f64>,
        residual: &Vector3<f64>,
    ) -> io::Result<()> {
        writeln!(
            self.corrections,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            timestamp,
            delta[0],
            delta[1],
            delta[2],
            delta.norm(),
            residual[0],
            residual[1],
            residual[2],
            residual.norm(),
        )
    }

    /// `timestamp lateral heading speed residual.x residual.y |residual|`
    fn lateral_row(
        &mut self,
        timestamp: f64,
        lateral: f64,
        heading: f64,
        speed: f64,
        residual: &Vector3<f64>,
    ) -> io::Result<()> {
        writeln!(
            self.lateral,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            timestamp,
            lateral,
            heading,
            speed,
            residual[0],
            residual[1],
            residual.norm(),
        )
    }

    fn flush(&mut self) -> io::Result<()> {
        self.trajectory.flush()?;
        self.covariance.flush()?;
        self.corrections.flush()?;
        self.lateral.flush()
    }
}

/// Offline replay over a sweep of GNSS time offsets.
pub struct OfflinePipeline {
    config: ReplayConfig,
}

impl OfflinePipeline {
    pub fn new(config: ReplayConfig) -> Self {
        OfflinePipeline { config }
    }

    /// Load the log and replay it once per configured offset.
    ///
    /// Only I/O failures (the input file, the output directory) are fatal; a log
    /// with no usable records ends the run early with empty output.
    pub fn run<P: AsRef<Path>>(&self, log_path: P) -> Result<(), Box<dyn Error>> {
        let streams = load_log(log_path.as_ref())?;
        if streams.is_empty() {
            log::error!(
                "no usable records in {}, nothing to replay",
                log_path.as_ref().display()
            );
            return Ok(());
        }
        fs::create_dir_all(&self.config.output_dir)?;
        for &offset in &self.config.gps_time_offsets {
            self.run_offset(&streams, offset)?;
        }
        Ok(())
    }

    /// Replay the loaded streams at a single GNSS offset, emitting one artifact set.
    pub fn run_offset(&self, streams: &SensorStreams, offset: f64) -> Result<(), Box<dyn Error>> {
        let suffix = offset_suffix(offset);
        log::info!("replaying with gnss offset {:+.3} s", offset);

        let segments = if self.config.enable_turn_detection {
            let matched = match_headings(&streams.gnss, &streams.headings, offset);
            let detector = TurnDetector::new(self.config.turn.clone());
            let segments = detector.detect(&matched);
            write_segments_csv(
                self.config
                    .output_dir
                    .join(format!("turn_segments{suffix}.csv")),
                &segments,
                detector.config(),
            )?;
            segments
        } else {
            Vec::new()
        };

        let mut frame = self.config.local_frame();
        let events = reorganize(streams, offset, &mut frame);
        let mut eskf = self.config.build_filter(&streams.calibration);
        let mut writers = OffsetWriters::create(&self.config.output_dir, &suffix)?;

        let mut predicted = 0usize;
        let mut observed = 0usize;
        for event in &events {
            match event {
                Event::Imu(imu) => {
                    // prediction waits for the first accepted fix
                    if !eskf.is_initialized() {
                        continue;
                    }
                    if eskf.predict(imu) {
                        predicted += 1;
                        let state = eskf.nominal_state();
                        writers.trajectory_row(&state, None)?;
                        writers.covariance_row(state.timestamp, &eskf.covariance_diagonal())?;
                    }
                }
                Event::Gnss(fix) => {
                    if !eskf.is_initialized() {
                        if eskf.observe_gps(fix) {
                            let state = eskf.nominal_state();
                            writers.trajectory_row(&state, Some(&fix.position))?;
                            writers.covariance_row(state.timestamp, &eskf.covariance_diagonal())?;
                        }
                        continue;
                    }
                    let in_turn = segments.iter().any(|s| s.contains(fix.timestamp));
                    let before = eskf.nominal_state().position;
                    let accepted = if in_turn {
                        eskf.observe_position_only(fix)
                    } else {
                        eskf.observe_gps(fix)
                    };
                    if accepted {
                        observed += 1;
                        let state = eskf.nominal_state();
                        let residual = fix.position - before;
                        let delta = state.position - before;
                        let speed = state.velocity.xy().norm();
                        writers.correction_row(fix.timestamp, &delta, &residual)?;
                        writers.lateral_row(
                            fix.timestamp,
                            eskf.lateral_residual(&residual),
                            eskf.current_heading(),
                            speed,
                            &residual,
                        )?;
                        writers.trajectory_row(&state, Some(&fix.position))?;
                        writers.covariance_row(state.timestamp, &eskf.covariance_diagonal())?;
                    }
                }
            }
        }
        writers.flush()?;
        log::info!(
            "offset {:+.3} s: {} predictions, {} observations, {} turn segments",
            offset,
            predicted,
            observed,
            segments.len()
        );
        Ok(())
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }
}

/// How long a queued fix may trail the filter clock before it is dropped, seconds.
const STALE_GNSS_S: f64 = 5.0;

/// Event-driven replay where late fixes wait for the filter to catch up.
///
/// Fixes arriving after initialization are queued; after each accepted prediction
/// the queue is drained while its head is at or behind the filter clock. A fix that
/// has fallen more than [`STALE_GNSS_S`] behind is dropped.
pub struct RealtimePipeline {
    config: ReplayConfig,
}

impl RealtimePipeline {
    pub fn new(config: ReplayConfig) -> Self {
        RealtimePipeline { config }
    }

    pub fn run<P: AsRef<Path>>(&self, log_path: P) -> Result<(), Box<dyn Error>> {
        let streams = load_log(log_path.as_ref())?;
        if streams.is_empty() {
            log::error!(
                "no usable records in {}, nothing to replay",
                log_path.as_ref().display()
            );
            return Ok(());
        }
        fs::create_dir_all(&self.config.output_dir)?;
        let mut frame = self.config.local_frame();
        let events = reorganize(&streams, 0.0, &mut frame);
        let mut eskf = self.config.build_filter(&streams.calibration);

        let mut trajectory = BufWriter::new(File::create(
            self.config.output_dir.join("realtime_trajectory.txt"),
        )?);
        let mut queue: VecDeque<GnssFix> = VecDeque::new();

        let write_row =
            |state: &NavState, gps: Option<&Vector3<f64>>, out: &mut BufWriter<File>| {
                let q = state.quaternion_wxyz();
                let zero = Vector3::zeros();
                let gps_p = gps.unwrap_or(&zero);
                writeln!(
                    out,
                    "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} \
                     {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {}",
                    state.timestamp,
                    state.position[0],
                    state.position[1],
                    state.position[2],
                    q[0],
                    q[1],
                    q[2],
                    q[3],
                    state.velocity[0],
                    state.velocity[1],
                    state.velocity[2],
                    state.gyro_bias[0],
                    state.gyro_bias[1],
                    state.gyro_bias[2],
                    state.accel_bias[0],
                    state.accel_bias[1],
                    state.accel_bias[2],
                    gps_p[0],
                    gps_p[1],
                    gps_p[2],
                    u8::from(gps.is_some()),
                )
            };

        for event in events {
            match event {
                Event::Imu(imu) => {
                    if !eskf.is_initialized() {
                        continue;
                    }
                    if eskf.predict(&imu) {
                        write_row(&eskf.nominal_state(), None, &mut trajectory)?;
                    }
                    let current_time = eskf.nominal_state().timestamp;
                    while queue
                        .front()
                        .is_some_and(|head| head.timestamp <= current_time)
                    {
                        let Some(fix) = queue.pop_front() else {
                            break;
                        };
                        if current_time - fix.timestamp > STALE_GNSS_S {
                            log::warn!(
                                "dropping stale fix at {:.3}, filter clock {:.3}",
                                fix.timestamp,
                                current_time
                            );
                            continue;
                        }
                        if eskf.observe_gps(&fix) {
                            write_row(&eskf.nominal_state(), Some(&fix.position), &mut trajectory)?;
                        }
                    }
                }
                Event::Gnss(fix) => {
                    if !eskf.is_initialized() {
                        if eskf.observe_gps(&fix) {
                            write_row(&eskf.nominal_state(), Some(&fix.position), &mut trajectory)?;
                        }
                    } else {
                        queue.push_back(fix);
                    }
                }
            }
        }
        trajectory.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_suffix_formats_milliseconds() {
        assert_eq!(offset_suffix(0.0), "");
        assert_eq!(offset_suffix(-0.35), "_-350ms");
        assert_eq!(offset_suffix(0.2), "_200ms");
        assert_eq!(offset_suffix(-0.05), "_-50ms");
    }

    #[test]
    fn config_roundtrips_through_json_and_toml() {
        let mut config = ReplayConfig::default();
        config.enable_turn_detection = true;
        config.gps_time_offsets = vec![0.0, -0.05, -0.1];

        for ext in ["json", "toml", "yaml"] {
            let path = std::env::temp_dir().join(format!("gins_replay_config_test.{ext}"));
            config.to_file(&path).unwrap();
            let restored = ReplayConfig::from_file(&path).unwrap();
            assert_eq!(restored.gps_time_offsets, config.gps_time_offsets);
            assert!(restored.enable_turn_detection);
            assert_eq!(restored.antenna.yaw_bias_deg, config.antenna.yaw_bias_deg);
            assert_eq!(restored.eskf.gyro_var, config.eskf.gyro_var);
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn unsupported_config_extension_is_rejected() {
        let config = ReplayConfig::default();
        let path = std::env::temp_dir().join("gins_replay_config_test.ini");
        assert!(config.to_file(&path).is_err());
        assert!(ReplayConfig::from_file(&path).is_err());
    }

    #[test]
    fn missing_log_is_fatal() {
        let pipeline = OfflinePipeline::new(ReplayConfig::default());
        assert!(pipeline.run("/nonexistent/drive.log").is_err());
    }
}

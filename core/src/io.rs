//! ASCII drive-log reading.
//!
//! Logs are line-oriented UTF-8 text where `#` starts a comment and the leading
//! token selects the record type: `$GPS`, `$ACC`, `$GYR`, `$NZZ`, and `$FBK` for the
//! phone-logger format, plus the legacy single-line `IMU` / `ODOM` / `GNSS` records
//! of older datasets. The reader walks the file once and fills typed buffers
//! ([`SensorStreams`]); nothing here is fatal except failing to open the file, and
//! a malformed line is logged at warn level and skipped.
//!
//! Accelerometer and gyroscope records arrive as separate lines and are paired by
//! approximate timestamp through a two-cell mailbox: one pending sample of each
//! kind, combined when their timestamps agree within 50 ms (the produced sample is
//! stamped with the later of the two), with the older cell dropped when the gap is
//! too large.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use nalgebra::Vector3;

use crate::events::SensorStreams;
use crate::{CalibrationSample, GnssRecord, HeadingSample, ImuSample};

/// Pairing tolerance between an `$ACC` and a `$GYR` record, seconds.
const PAIRING_TOLERANCE: f64 = 0.05;
/// Accelerometer readings are logged in g.
const GRAVITY_SCALE: f64 = 9.8;

#[derive(Clone, Copy)]
struct PendingAxis {
    timestamp: f64,
    value: Vector3<f64>,
}

/// Two-cell mailbox pairing `$ACC` and `$GYR` lines into [`ImuSample`]s.
#[derive(Default)]
struct ImuPairer {
    pending_acc: Option<PendingAxis>,
    pending_gyr: Option<PendingAxis>,
}

impl ImuPairer {
    fn push_acc(&mut self, timestamp: f64, accel: Vector3<f64>) -> Option<ImuSample> {
        self.pending_acc = Some(PendingAxis {
            timestamp,
            value: accel,
        });
        self.try_pair()
    }

    fn push_gyr(&mut self, timestamp: f64, gyro: Vector3<f64>) -> Option<ImuSample> {
        self.pending_gyr = Some(PendingAxis {
            timestamp,
            value: gyro,
        });
        self.try_pair()
    }

    fn try_pair(&mut self) -> Option<ImuSample> {
        let (acc, gyr) = match (self.pending_acc, self.pending_gyr) {
            (Some(acc), Some(gyr)) => (acc, gyr),
            _ => return None,
        };
        if (acc.timestamp - gyr.timestamp).abs() > PAIRING_TOLERANCE {
            // keep the newer half, drop the older one
            if acc.timestamp < gyr.timestamp {
                self.pending_acc = None;
            } else {
                self.pending_gyr = None;
            }
            return None;
        }
        self.pending_acc = None;
        self.pending_gyr = None;
        Some(ImuSample {
            timestamp: acc.timestamp.max(gyr.timestamp),
            gyro: gyr.value,
            accel: acc.value,
        })
    }
}

/// Read a drive log into typed sample buffers.
///
/// Only the file-open failure is returned as an error; individual malformed lines
/// are logged and skipped, and a file with no recognizable records yields empty
/// buffers.
pub fn load_log<P: AsRef<Path>>(path: P) -> std::io::Result<SensorStreams> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);

    let mut streams = SensorStreams::default();
    let mut pairer = ImuPairer::default();
    let mut seen_heading_keys = std::collections::HashSet::new();
    let mut pending_flag: Option<f64> = None;

    for (line_number, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                log::warn!("unreadable line {}: {}", line_number + 1, error);
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut tokens = trimmed.split_whitespace();
        let record_type = match tokens.next() {
            Some(token) => token,
            None => continue,
        };
        let fields: Vec<&str> = tokens.collect();

        let parsed = match record_type {
            "$GPS" => parse_gps(&fields, &mut streams),
            "$ACC" => parse_acc(&fields, &mut pairer, &mut streams),
            "$GYR" => parse_gyr(&fields, &mut pairer, &mut streams),
            "$NZZ" => parse_nzz(&fields, &mut seen_heading_keys, &mut streams),
            "$FBK" => parse_fbk(&fields, &mut pending_flag, &mut streams),
            "IMU" => parse_legacy_imu(&fields, &mut streams),
            "ODOM" => {
                streams.odom_count += 1;
                Some(())
            }
            "GNSS" => parse_legacy_gnss(&fields, &mut streams),
            _ => Some(()), // unrecognized record types are ignored
        };
        if parsed.is_none() {
            log::warn!("malformed {} record on line {}", record_type, line_number + 1);
        }
    }

    log::info!(
        "loaded {} imu samples, {} gnss records, {} heading samples, {} calibration pairs",
        streams.imu.len(),
        streams.gnss.len(),
        streams.headings.len(),
        streams.calibration.len()
    );
    Ok(streams)
}

fn field_f64(fields: &[&str], index: usize) -> Option<f64> {
    fields.get(index)?.parse::<f64>().ok()
}

/// `$GPS`: timestamp, WGS84 position scaled by 1e7, heading, speed, altitude,
/// status, and the wall-clock fields forming the heading-match key.
fn parse_gps(fields: &[&str], streams: &mut SensorStreams) -> Option<()> {
    if fields.len() < 25 {
        return None;
    }
    let timestamp = field_f64(fields, 0)? / 1000.0;
    let longitude_deg = field_f64(fields, 6)? / 1e7;
    let latitude_deg = field_f64(fields, 7)? / 1e7;
    let heading_deg = field_f64(fields, 8)?;
    let speed = field_f64(fields, 9)?;
    let altitude = field_f64(fields, 10)?;
    let fix_valid = fields[11] == "A";

    // wall-clock key in the unpadded `Y-M-D H:M:S` form the heading stream uses
    let year = field_f64(fields, 18)? as i64;
    let month = field_f64(fields, 19)? as i64;
    let day = field_f64(fields, 20)? as i64;
    let hour = field_f64(fields, 21)? as i64;
    let minute = field_f64(fields, 22)? as i64;
    let second = field_f64(fields, 23)? as i64;
    let wall_clock_key = format!("{year}-{month}-{day} {hour}:{minute}:{second}");

    streams.gnss.push(GnssRecord {
        timestamp,
        latitude_deg,
        longitude_deg,
        altitude,
        heading_deg,
        speed,
        status: if fix_valid { 4 } else { 0 },
        heading_valid: true,
        wall_clock_key: Some(wall_clock_key),
    });
    Some(())
}

/// `$ACC`: readings in g, ordered up / forward / right; re-ordered to body XYZ.
fn parse_acc(fields: &[&str], pairer: &mut ImuPairer, streams: &mut SensorStreams) -> Option<()> {
    if fields.len() < 6 {
        return None;
    }
    let timestamp = field_f64(fields, 0)? / 1000.0;
    let up = field_f64(fields, 3)? * GRAVITY_SCALE;
    let forward = field_f64(fields, 4)? * GRAVITY_SCALE;
    let right = field_f64(fields, 5)? * GRAVITY_SCALE;
    if let Some(sample) = pairer.push_acc(timestamp, Vector3::new(right, forward, up)) {
        streams.imu.push(sample);
    }
    Some(())
}

/// `$GYR`: readings in deg/s, ordered up / forward / right; re-ordered to body XYZ.
fn parse_gyr(fields: &[&str], pairer: &mut ImuPairer, streams: &mut SensorStreams) -> Option<()> {
    if fields.len() < 7 {
        return None;
    }
    let timestamp = field_f64(fields, 0)? / 1000.0;
    let up = field_f64(fields, 4)?.to_radians();
    let forward = field_f64(fields, 5)?.to_radians();
    let right = field_f64(fields, 6)?.to_radians();
    if let Some(sample) = pairer.push_gyr(timestamp, Vector3::new(right, forward, up)) {
        streams.imu.push(sample);
    }
    Some(())
}

/// `$NZZ`: auxiliary heading keyed by wall-clock second, one sample per second.
fn parse_nzz(
    fields: &[&str],
    seen_keys: &mut std::collections::HashSet<String>,
    streams: &mut SensorStreams,
) -> Option<()> {
    if fields.len() < 12 {
        return None;
    }
    let wall_clock_key = format!("{} {}", fields[0], fields[1]);
    let heading_deg = field_f64(fields, 11)?;
    if !seen_keys.insert(wall_clock_key.clone()) {
        return Some(()); // only the first sample of each second is kept
    }
    streams.headings.push(HeadingSample {
        wall_clock_key,
        heading_deg,
    });
    Some(())
}

/// `$FBK`: a comma-separated `flag` line carrying the timestamp, paired with the
/// following `misalignment` line carrying `pitch:` / `heading:` values.
fn parse_fbk(
    fields: &[&str],
    pending_flag: &mut Option<f64>,
    streams: &mut SensorStreams,
) -> Option<()> {
    let rest = fields.join(" ");
    if rest.starts_with("flag") {
        let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
        if parts.len() < 3 {
            return None;
        }
        let timestamp = parts[2].parse::<f64>().ok()? / 1000.0;
        *pending_flag = Some(timestamp);
        Some(())
    } else if rest.starts_with("misalignment") {
        let timestamp = match pending_flag.take() {
            Some(timestamp) => timestamp,
            None => {
                log::warn!("misalignment record without a preceding flag record");
                return Some(());
            }
        };
        let mut pitch_deg = None;
        let mut heading_deg = None;
        for token in fields.iter().skip(1).flat_map(|f| f.split(',')) {
            let token = token.trim();
            if let Some(value) = token.strip_prefix("pitch:") {
                pitch_deg = value.parse::<f64>().ok();
            } else if let Some(value) = token.strip_prefix("heading:") {
                heading_deg = value.parse::<f64>().ok();
            }
        }
        let (pitch_deg, heading_deg) = (pitch_deg?, heading_deg?);
        streams.calibration.push(CalibrationSample {
            timestamp,
            pitch_deg,
            heading_deg,
        });
        Some(())
    } else {
        // other $FBK payloads (status counters and the like) are not used
        Some(())
    }
}

/// Legacy `IMU time gx gy gz ax ay az`, already in rad/s and m/s^2.
fn parse_legacy_imu(fields: &[&str], streams: &mut SensorStreams) -> Option<()> {
    if fields.len() < 7 {
        return None;
    }
    let timestamp = field_f64(fields, 0)?;
    let gyro = Vector3::new(
        field_f64(fields, 1)?,
        field_f64(fields, 2)?,
        field_f64(fields, 3)?,
    );
    let accel = Vector3::new(
        field_f64(fields, 4)?,
        field_f64(fields, 5)?,
        field_f64(fields, 6)?,
    );
    streams.imu.push(ImuSample::new(timestamp, gyro, accel));
    Some(())
}

/// Legacy `GNSS time lat lon alt heading heading_valid`.
fn parse_legacy_gnss(fields: &[&str], streams: &mut SensorStreams) -> Option<()> {
    if fields.len() < 6 {
        return None;
    }
    let timestamp = field_f64(fields, 0)?;
    let latitude_deg = field_f64(fields, 1)?;
    let longitude_deg = field_f64(fields, 2)?;
    let altitude = field_f64(fields, 3)?;
    let heading_deg = field_f64(fields, 4)?;
    let heading_valid = matches!(fields[5], "1" | "true");
    streams.gnss.push(GnssRecord {
        timestamp,
        latitude_deg,
        longitude_deg,
        altitude,
        heading_deg,
        speed: 0.0,
        status: 4,
        heading_valid,
        wall_clock_key: None,
    });
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    fn write_temp_log(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn gps_line(timestamp_ms: i64, lat: f64, lon: f64) -> String {
        // 25 post-token fields with the semantic ones filled in
        let mut fields = vec!["0".to_string(); 25];
        fields[0] = timestamp_ms.to_string();
        fields[6] = format!("{}", (lon * 1e7) as i64);
        fields[7] = format!("{}", (lat * 1e7) as i64);
        fields[8] = "90.5".to_string();
        fields[9] = "12.0".to_string();
        fields[10] = "4.5".to_string();
        fields[11] = "A".to_string();
        fields[18] = "2025".to_string();
        fields[19] = "6".to_string();
        fields[20] = "12".to_string();
        fields[21] = "11".to_string();
        fields[22] = "22".to_string();
        fields[23] = "27".to_string();
        format!("$GPS {}", fields.join(" "))
    }

    #[test]
    fn parses_gps_records_with_wall_clock_key() {
        let path = write_temp_log(
            "gins_io_gps_test.log",
            &format!("# comment\n{}\n", gps_line(868905770, 31.2, 121.4)),
        );
        let streams = load_log(&path).unwrap();
        assert_eq!(streams.gnss.len(), 1);
        let record = &streams.gnss[0];
        assert_approx_eq!(record.timestamp, 868905.770, 1e-9);
        assert_approx_eq!(record.latitude_deg, 31.2, 1e-6);
        assert_approx_eq!(record.longitude_deg, 121.4, 1e-6);
        assert_approx_eq!(record.heading_deg, 90.5, 1e-9);
        assert_eq!(record.status, 4);
        assert_eq!(record.wall_clock_key.as_deref(), Some("2025-6-12 11:22:27"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pairs_acc_and_gyr_within_tolerance() {
        // 0.02 and 0.05 s apart: the first pair combines, the second drops the
        // older accelerometer cell
        let log = "\
$ACC 1000 3 10 0.0 0.1 0.2
$GYR 1020 3 10 25.0 1.0 2.0 3.0
$ACC 2000 3 10 0.0 0.0 1.0
$GYR 2100 3 10 25.0 0.0 0.0 0.0
";
        let path = write_temp_log("gins_io_pair_test.log", log);
        let streams = load_log(&path).unwrap();
        assert_eq!(streams.imu.len(), 1);
        let sample = &streams.imu[0];
        // the later timestamp of the pair wins
        assert_approx_eq!(sample.timestamp, 1.020, 1e-9);
        // accel re-ordered (right, forward, up) and scaled by 9.8
        assert_approx_eq!(sample.accel[0], 0.2 * 9.8, 1e-9);
        assert_approx_eq!(sample.accel[1], 0.1 * 9.8, 1e-9);
        assert_approx_eq!(sample.accel[2], 0.0, 1e-9);
        // gyro re-ordered (right, forward, up) and converted to rad/s
        assert_approx_eq!(sample.gyro[0], 3.0_f64.to_radians(), 1e-12);
        assert_approx_eq!(sample.gyro[1], 2.0_f64.to_radians(), 1e-12);
        assert_approx_eq!(sample.gyro[2], 1.0_f64.to_radians(), 1e-12);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn nzz_deduplicates_per_second() {
        let log = "\
$NZZ 2025-6-12 11:22:27 a b c d e f g h i 271.8 x
$NZZ 2025-6-12 11:22:27 a b c d e f g h i 999.0 x
$NZZ 2025-6-12 11:22:28 a b c d e f g h i 272.4 x
";
        let path = write_temp_log("gins_io_nzz_test.log", log);
        let streams = load_log(&path).unwrap();
        assert_eq!(streams.headings.len(), 2);
        assert_eq!(streams.headings[0].wall_clock_key, "2025-6-12 11:22:27");
        assert_approx_eq!(streams.headings[0].heading_deg, 271.8, 1e-9);
        assert_approx_eq!(streams.headings[1].heading_deg, 272.4, 1e-9);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn fbk_pairs_flag_with_misalignment() {
        let log = "\
$FBK flag,1,164385368,-0.153193,0.030816
$FBK misalignment pitch:-18.122493,heading:1.800880
$FBK misalignment pitch:-1.0,heading:2.0
";
        let path = write_temp_log("gins_io_fbk_test.log", log);
        let streams = load_log(&path).unwrap();
        // the second misalignment has no pending flag and is dropped
        assert_eq!(streams.calibration.len(), 1);
        let pair = &streams.calibration[0];
        assert_approx_eq!(pair.timestamp, 164385.368, 1e-9);
        assert_approx_eq!(pair.pitch_deg, -18.122493, 1e-9);
        assert_approx_eq!(pair.heading_deg, 1.800880, 1e-9);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn legacy_records_parse_directly() {
        let log = "\
IMU 1.0 0.01 0.02 0.03 0.1 0.2 9.8
GNSS 2.0 31.2 121.4 4.0 45.0 1
ODOM 3.0 0.5 0.6
";
        let path = write_temp_log("gins_io_legacy_test.log", log);
        let streams = load_log(&path).unwrap();
        assert_eq!(streams.imu.len(), 1);
        assert_eq!(streams.gnss.len(), 1);
        assert_eq!(streams.odom_count, 1);
        assert!(streams.gnss[0].heading_valid);
        assert!(streams.gnss[0].wall_clock_key.is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let log = "\
$GPS 1 2 3
$ACC not numeric at all
garbage line with no recognized type
IMU 1.0 0.0 0.0
";
        let path = write_temp_log("gins_io_malformed_test.log", log);
        let streams = load_log(&path).unwrap();
        assert!(streams.imu.is_empty());
        assert!(streams.gnss.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_log("/nonexistent/path/to.log").is_err());
    }
}

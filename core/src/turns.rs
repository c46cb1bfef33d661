//! Heading-rate turn detection.
//!
//! Drive sessions are segmented into turning and straight episodes from an
//! independent heading stream. The detector differentiates consecutive headings
//! into rates (degrees per second, wrapped so the 0/360 crossing does not alias),
//! smooths them with a centered moving average, and runs a three-state machine:
//!
//! - **Idle** until the rate magnitude exceeds the start threshold;
//! - **Accumulating** while the rate keeps the turn's sign, integrating the swept
//!   angle; a strong sign flip either emits the segment (if enough angle
//!   accumulated) or restarts in the new direction;
//! - **EndTiming** once the rate falls below the end threshold, finalizing the
//!   segment only after it stays low for a configured duration, so brief
//!   mid-corner hesitations do not split one turn into two.
//!
//! The emitted segments drive the observation-gating policy in the replay
//! pipelines: while the vehicle turns, only position is observed, which keeps the
//! GNSS heading channel from fighting the attitude states.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{wrap_heading_diff, wrap_to_360};

/// Turn direction; positive smoothed rates read as left turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDirection {
    Left,
    Right,
}

impl std::fmt::Display for TurnDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnDirection::Left => write!(f, "left"),
            TurnDirection::Right => write!(f, "right"),
        }
    }
}

/// A detected turn episode.
#[derive(Clone, Copy, Debug)]
pub struct TurnSegment {
    /// Timestamp of the first sample in the segment
    pub start_time: f64,
    /// Timestamp where the finalization condition fired
    pub end_time: f64,
    /// Cumulative swept angle in degrees
    pub angle_deg: f64,
    /// Average rate magnitude over the segment in degrees per second
    pub avg_rate_deg_s: f64,
    pub direction: TurnDirection,
}

impl TurnSegment {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Whether a timestamp falls inside this segment (inclusive).
    pub fn contains(&self, timestamp: f64) -> bool {
        self.start_time <= timestamp && timestamp <= self.end_time
    }
}

/// Detector thresholds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnDetectorConfig {
    /// Rate magnitude that opens a turn, deg/s
    pub start_rate_deg_s: f64,
    /// Rate magnitude below which a turn begins to close, deg/s
    pub end_rate_deg_s: f64,
    /// How long the rate must stay below the end threshold to close, seconds
    pub end_duration_s: f64,
    /// Minimum cumulative angle for a segment to be kept, degrees
    pub angle_deg: f64,
    /// Centered moving-average width over the rate sequence, odd
    pub smooth_window: usize,
}

impl Default for TurnDetectorConfig {
    fn default() -> Self {
        TurnDetectorConfig {
            start_rate_deg_s: 3.0,
            end_rate_deg_s: 1.5,
            end_duration_s: 3.0,
            angle_deg: 30.0,
            smooth_window: 5,
        }
    }
}

/// A time-stamped heading in degrees, the detector's input.
#[derive(Clone, Copy, Debug)]
pub struct HeadingPoint {
    pub timestamp: f64,
    pub heading_deg: f64,
}

#[derive(Clone, Copy, Debug)]
struct RatePoint {
    timestamp: f64,
    rate_deg_s: f64,
}

#[derive(Clone, Copy)]
enum DetectorState {
    Idle,
    Accumulating,
    EndTiming { end_start: f64 },
}

/// The heading-rate turn detector.
#[derive(Clone, Debug, Default)]
pub struct TurnDetector {
    config: TurnDetectorConfig,
}

impl TurnDetector {
    pub fn new(config: TurnDetectorConfig) -> Self {
        TurnDetector { config }
    }

    /// Segment a heading stream into turns.
    ///
    /// Samples are sorted by timestamp and headings sanitized into `[0, 360)`
    /// before differentiation, so the output is invariant both to a constant
    /// heading offset and to heading wrap.
    pub fn detect(&self, samples: &[HeadingPoint]) -> Vec<TurnSegment> {
        if samples.len() < 2 {
            log::warn!("not enough heading samples for turn detection: {}", samples.len());
            return Vec::new();
        }
        let mut sorted: Vec<HeadingPoint> = samples
            .iter()
            .map(|p| HeadingPoint {
                timestamp: p.timestamp,
                heading_deg: wrap_to_360(p.heading_deg),
            })
            .collect();
        sorted.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let rates = turn_rates(&sorted);
        let smoothed = smooth(&rates, self.config.smooth_window);
        let segments = self.run_state_machine(&smoothed);
        log::info!("turn detection found {} segments", segments.len());
        segments
    }

    fn run_state_machine(&self, rates: &[RatePoint]) -> Vec<TurnSegment> {
        let cfg = &self.config;
        let mut segments = Vec::new();

        let mut state = DetectorState::Idle;
        let mut direction = TurnDirection::Left;
        let mut accumulated = 0.0;
        let mut segment_start = 0.0;
        let mut rate_history: Vec<f64> = Vec::new();

        let matches_direction = |direction: TurnDirection, rate: f64| match direction {
            TurnDirection::Left => rate > 0.0,
            TurnDirection::Right => rate < 0.0,
        };

        for i in 0..rates.len() {
            let RatePoint {
                timestamp,
                rate_deg_s: rate,
            } = rates[i];
            let magnitude = rate.abs();

            match state {
                DetectorState::Idle => {
                    if magnitude > cfg.start_rate_deg_s {
                        state = DetectorState::Accumulating;
                        direction = if rate > 0.0 {
                            TurnDirection::Left
                        } else {
                            TurnDirection::Right
                        };
                        segment_start = timestamp;
                        accumulated = 0.0;
                        rate_history.clear();
                        rate_history.push(rate);
                    }
                }
                DetectorState::Accumulating => {
                    if magnitude > cfg.end_rate_deg_s {
                        let dt = if i > 0 {
                            timestamp - rates[i - 1].timestamp
                        } else {
                            0.0
                        };
                        let swept = (rate * dt).abs();
                        if matches_direction(direction, rate) {
                            accumulated += swept;
                        } else if magnitude > cfg.start_rate_deg_s {
                            // decisive reversal: close out the current turn if it
                            // swept enough angle, then restart in the new direction
                            if accumulated >= cfg.angle_deg {
                                segments.push(make_segment(
                                    segment_start,
                                    rates[i.saturating_sub(1)].timestamp,
                                    accumulated,
                                    &rate_history,
                                    direction,
                                ));
                            }
                            direction = if rate > 0.0 {
                                TurnDirection::Left
                            } else {
                                TurnDirection::Right
                            };
                            segment_start = timestamp;
                            accumulated = swept;
                            rate_history.clear();
                        }
                        rate_history.push(rate);
                    } else {
                        state = DetectorState::EndTiming {
                            end_start: timestamp,
                        };
                    }
                }
                DetectorState::EndTiming { end_start } => {
                    if magnitude <= cfg.end_rate_deg_s {
                        if timestamp - end_start >= cfg.end_duration_s {
                            if accumulated >= cfg.angle_deg {
                                segments.push(make_segment(
                                    segment_start,
                                    timestamp,
                                    accumulated,
                                    &rate_history,
                                    direction,
                                ));
                            } else {
                                log::debug!(
                                    "discarding turn at {:.1}s, only {:.1} deg accumulated",
                                    timestamp,
                                    accumulated
                                );
                            }
                            state = DetectorState::Idle;
                        }
                    } else {
                        // the rate picked back up before the end timer ran out
                        state = DetectorState::Accumulating;
                        if i > 0 && matches_direction(direction, rate) {
                            let dt = timestamp - rates[i - 1].timestamp;
                            accumulated += (rate * dt).abs();
                        }
                        rate_history.push(rate);
                    }
                }
            }
        }

        // a turn still open at end-of-stream is kept when it swept enough angle
        if let DetectorState::Accumulating | DetectorState::EndTiming { .. } = state {
            if accumulated >= cfg.angle_deg {
                if let Some(last) = rates.last() {
                    segments.push(make_segment(
                        segment_start,
                        last.timestamp,
                        accumulated,
                        &rate_history,
                        direction,
                    ));
                }
            }
        }
        segments
    }

    pub fn config(&self) -> &TurnDetectorConfig {
        &self.config
    }
}

fn make_segment(
    start_time: f64,
    end_time: f64,
    angle_deg: f64,
    rate_history: &[f64],
    direction: TurnDirection,
) -> TurnSegment {
    let avg_rate_deg_s = if rate_history.is_empty() {
        0.0
    } else {
        rate_history.iter().map(|r| r.abs()).sum::<f64>() / rate_history.len() as f64
    };
    log::info!(
        "turn segment {:.1}s - {:.1}s ({:.1}s, {}, {:.1} deg, {:.2} deg/s)",
        start_time,
        end_time,
        end_time - start_time,
        direction,
        angle_deg,
        avg_rate_deg_s
    );
    TurnSegment {
        start_time,
        end_time,
        angle_deg,
        avg_rate_deg_s,
        direction,
    }
}

/// Differentiate sorted heading samples into per-pair rates.
///
/// The rate between consecutive samples is stamped with the later timestamp; pairs
/// with non-positive time separation are skipped.
fn turn_rates(samples: &[HeadingPoint]) -> Vec<RatePoint> {
    let mut rates = Vec::with_capacity(samples.len().saturating_sub(1));
    for pair in samples.windows(2) {
        let dt = pair[1].timestamp - pair[0].timestamp;
        if dt <= 0.0 {
            continue;
        }
        let dh = wrap_heading_diff(pair[0].heading_deg, pair[1].heading_deg);
        rates.push(RatePoint {
            timestamp: pair[1].timestamp,
            rate_deg_s: dh / dt,
        });
    }
    rates
}

/// Centered moving average over the rate sequence; timestamps are unchanged.
fn smooth(rates: &[RatePoint], window: usize) -> Vec<RatePoint> {
    if rates.len() < window || window < 2 {
        return rates.to_vec();
    }
    let half = window / 2;
    let mut smoothed = Vec::with_capacity(rates.len());
    for i in 0..rates.len() {
        let start = i.saturating_sub(half);
        let end = (i + half + 1).min(rates.len());
        let sum: f64 = rates[start..end].iter().map(|r| r.rate_deg_s).sum();
        smoothed.push(RatePoint {
            timestamp: rates[i].timestamp,
            rate_deg_s: sum / (end - start) as f64,
        });
    }
    smoothed
}

/// Write the segment table as CSV with `#` comment headers recording the detector
/// parameters, one row per segment.
pub fn write_segments_csv<P: AsRef<Path>>(
    path: P,
    segments: &[TurnSegment],
    config: &TurnDetectorConfig,
) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "# turn segments detected from matched heading data")?;
    writeln!(file, "# detection parameters:")?;
    writeln!(file, "#   start rate threshold: {} deg/s", config.start_rate_deg_s)?;
    writeln!(
        file,
        "#   end rate threshold: {} deg/s for {} s",
        config.end_rate_deg_s, config.end_duration_s
    )?;
    writeln!(file, "#   cumulative angle threshold: {} deg", config.angle_deg)?;
    writeln!(file, "# {} segments", segments.len())?;
    writeln!(file, "#")?;
    writeln!(
        file,
        "id,start,end,duration_s,angle_deg,avg_rate_deg_s,direction"
    )?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    for (i, segment) in segments.iter().enumerate() {
        writer.serialize((
            i + 1,
            format!("{:.3}", segment.start_time),
            format!("{:.3}", segment.end_time),
            format!("{:.1}", segment.duration()),
            format!("{:.1}", segment.angle_deg),
            format!("{:.2}", segment.avg_rate_deg_s),
            segment.direction.to_string(),
        ))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    /// 1 Hz heading stream: ramp from 0 to 90 degrees over 10 s, then flat.
    fn ramp_then_flat() -> Vec<HeadingPoint> {
        let mut samples = Vec::new();
        for i in 0..=10 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 9.0 * i as f64,
            });
        }
        for i in 11..=20 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 90.0,
            });
        }
        samples
    }

    #[test]
    fn single_left_turn_is_detected() {
        let detector = TurnDetector::default();
        let segments = detector.detect(&ramp_then_flat());
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert_eq!(segment.direction, TurnDirection::Left);
        // at 1 Hz the entry sample and the smoothed tail cost a few degrees of
        // the true 90-degree sweep
        assert!(
            segment.angle_deg >= 75.0 && segment.angle_deg <= 95.0,
            "angle {} out of range",
            segment.angle_deg
        );
        assert!(segment.avg_rate_deg_s > 0.0);
        assert!(segment.start_time < segment.end_time);
    }

    #[test]
    fn constant_offset_does_not_change_segments() {
        let detector = TurnDetector::default();
        let base = detector.detect(&ramp_then_flat());
        let offset: Vec<HeadingPoint> = ramp_then_flat()
            .iter()
            .map(|p| HeadingPoint {
                timestamp: p.timestamp,
                heading_deg: p.heading_deg + 123.0,
            })
            .collect();
        let shifted = detector.detect(&offset);
        assert_eq!(base.len(), shifted.len());
        for (a, b) in base.iter().zip(shifted.iter()) {
            assert_approx_eq!(a.start_time, b.start_time, 1e-12);
            assert_approx_eq!(a.end_time, b.end_time, 1e-12);
            assert_approx_eq!(a.angle_deg, b.angle_deg, 1e-9);
            assert_eq!(a.direction, b.direction);
        }
    }

    #[test]
    fn heading_wrap_does_not_change_segments() {
        let detector = TurnDetector::default();
        let base = detector.detect(&ramp_then_flat());
        let wrapped: Vec<HeadingPoint> = ramp_then_flat()
            .iter()
            .map(|p| HeadingPoint {
                timestamp: p.timestamp,
                heading_deg: (p.heading_deg + 720.0 + 350.0).rem_euclid(360.0),
            })
            .collect();
        let rewrapped = detector.detect(&wrapped);
        assert_eq!(base.len(), rewrapped.len());
        for (a, b) in base.iter().zip(rewrapped.iter()) {
            assert_approx_eq!(a.angle_deg, b.angle_deg, 1e-9);
            assert_eq!(a.direction, b.direction);
        }
    }

    #[test]
    fn right_turn_has_right_direction() {
        let mut samples = Vec::new();
        for i in 0..=10 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 360.0 - 9.0 * i as f64,
            });
        }
        for i in 11..=20 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 270.0,
            });
        }
        let detector = TurnDetector::default();
        let segments = detector.detect(&samples);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].direction, TurnDirection::Right);
    }

    #[test]
    fn small_wiggle_is_discarded() {
        // 10 deg of total swing never reaches the 30 deg threshold
        let mut samples = Vec::new();
        for i in 0..=2 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 5.0 * i as f64,
            });
        }
        for i in 3..=15 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 10.0,
            });
        }
        let detector = TurnDetector::default();
        assert!(detector.detect(&samples).is_empty());
    }

    #[test]
    fn unsorted_input_is_sorted_first() {
        let mut samples = ramp_then_flat();
        samples.reverse();
        let detector = TurnDetector::default();
        let segments = detector.detect(&samples);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].direction, TurnDirection::Left);
    }

    #[test]
    fn open_turn_at_end_of_stream_is_emitted() {
        // ramp that never flattens out
        let mut samples = Vec::new();
        for i in 0..=12 {
            samples.push(HeadingPoint {
                timestamp: i as f64,
                heading_deg: 9.0 * i as f64,
            });
        }
        let detector = TurnDetector::default();
        let segments = detector.detect(&samples);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].angle_deg >= 30.0);
    }

    #[test]
    fn segments_csv_has_comment_header_and_rows() {
        let detector = TurnDetector::default();
        let segments = detector.detect(&ramp_then_flat());
        let path = std::env::temp_dir().join("gins_turn_segments_test.csv");
        write_segments_csv(&path, &segments, detector.config()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# turn segments"));
        assert!(contents.contains("id,start,end,duration_s,angle_deg,avg_rate_deg_s,direction"));
        assert!(contents.contains(",left"));
        let _ = std::fs::remove_file(&path);
    }
}

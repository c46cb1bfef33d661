//! Earth model and planar projection.
//!
//! The Earth is modeled as the WGS84 ellipsoid. Satellite fixes arrive as geodetic
//! coordinates (latitude, longitude, altitude) and the filter works in a planar
//! frame, so this module provides the forward transverse-Mercator (UTM) projection
//! together with [`LocalFrame`], which anchors projected fixes at the first accepted
//! one and folds in the antenna lever arm and yaw bias.
//!
//! The projection is the standard series expansion on the ellipsoid with a 0.9996
//! central scale factor, 500 km false easting, and 10,000 km false northing in the
//! southern hemisphere. It is valid over the UTM latitude band (84°N to 80°S);
//! outside of that the conversion reports failure and the caller is expected to skip
//! the fix.

use nalgebra::{Rotation3, Vector3};
use nav_types::WGS84;

use crate::linalg::yaw_rotation;
use crate::{GnssFix, GnssRecord};

// Earth constants (WGS84)
pub const EQUATORIAL_RADIUS: f64 = 6378137.0; // meters
pub const POLAR_RADIUS: f64 = 6356752.31425; // meters
pub const ECCENTRICITY: f64 = 0.0818191908425; // unit-less
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;

// UTM projection constants
pub const UTM_SCALE_FACTOR: f64 = 0.9996;
pub const UTM_FALSE_EASTING: f64 = 500_000.0; // meters
pub const UTM_FALSE_NORTHING: f64 = 10_000_000.0; // meters, southern hemisphere only
pub const UTM_MAX_LATITUDE: f64 = 84.0; // degrees
pub const UTM_MIN_LATITUDE: f64 = -80.0; // degrees

/// UTM zone number (1..=60) for a longitude in degrees.
pub fn utm_zone(longitude_deg: f64) -> u8 {
    let zone = ((longitude_deg + 180.0) / 6.0).floor() as i32 + 1;
    zone.clamp(1, 60) as u8
}

/// Central meridian of a UTM zone, in degrees.
pub fn central_meridian_deg(zone: u8) -> f64 {
    (zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

/// Meridian arc length from the equator to the given latitude (radians).
fn meridian_arc(latitude: f64) -> f64 {
    let e2 = ECCENTRICITY_SQUARED;
    let e4 = e2 * e2;
    let e6 = e4 * e2;
    EQUATORIAL_RADIUS
        * ((1.0 - e2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * latitude
            - (3.0 * e2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * latitude).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * latitude).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * latitude).sin())
}

/// Forward transverse-Mercator (UTM) projection of a WGS84 geodetic position.
///
/// Returns `(easting, northing, altitude)` in meters within the zone implied by the
/// longitude, or an error when the point lies outside the valid projection band or
/// any coordinate is non-finite.
///
/// # Example
/// ```rust
/// use nav_types::WGS84;
/// use gins::earth::geodetic_to_utm;
/// // On the central meridian of zone 31, at the equator
/// let p = WGS84::from_degrees_and_meters(0.0, 3.0, 0.0);
/// let utm = geodetic_to_utm(&p).unwrap();
/// assert!((utm[0] - 500_000.0).abs() < 1e-6);
/// assert!(utm[1].abs() < 1e-6);
/// ```
pub fn geodetic_to_utm(position: &WGS84<f64>) -> Result<Vector3<f64>, &'static str> {
    let lat_deg = position.latitude_degrees();
    let lon_deg = position.longitude_degrees();
    let altitude = position.altitude();
    if !lat_deg.is_finite() || !lon_deg.is_finite() || !altitude.is_finite() {
        return Err("non-finite geodetic coordinate");
    }
    if !(UTM_MIN_LATITUDE..=UTM_MAX_LATITUDE).contains(&lat_deg) {
        return Err("latitude outside the UTM projection band");
    }

    let lat = lat_deg.to_radians();
    let zone = utm_zone(lon_deg);
    let lon0 = central_meridian_deg(zone).to_radians();

    let e2 = ECCENTRICITY_SQUARED;
    let ep2 = e2 / (1.0 - e2); // second eccentricity squared
    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = EQUATORIAL_RADIUS / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = ep2 * cos_lat * cos_lat;
    let a = (lon_deg.to_radians() - lon0) * cos_lat;
    let m = meridian_arc(lat);

    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let easting = UTM_SCALE_FACTOR
        * n
        * (a
            + (1.0 - t + c) * a3 / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a5 / 120.0)
        + UTM_FALSE_EASTING;
    let mut northing = UTM_SCALE_FACTOR
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a6 / 720.0));
    if lat_deg < 0.0 {
        northing += UTM_FALSE_NORTHING;
    }

    Ok(Vector3::new(easting, northing, altitude))
}

/// Planar frame anchored at the first accepted fix.
///
/// Converts raw geodetic records into [`GnssFix`] values the filter can observe:
/// the position is the UTM projection with the antenna lever arm rotated into the
/// world frame, expressed relative to the first successfully projected fix, and the
/// rotation is yaw-only with the antenna yaw bias removed from the reported heading.
///
/// The anchor is established once and is independent of any configured time offset,
/// so replays of the same log at different offsets share a common origin.
#[derive(Clone, Debug)]
pub struct LocalFrame {
    lever_arm: Vector3<f64>,
    yaw_bias_rad: f64,
    origin: Option<Vector3<f64>>,
}

impl LocalFrame {
    /// Create a frame with the given antenna lever arm (meters, body frame) and yaw
    /// bias (degrees).
    pub fn new(lever_arm: Vector3<f64>, yaw_bias_deg: f64) -> Self {
        LocalFrame {
            lever_arm,
            yaw_bias_rad: yaw_bias_deg.to_radians(),
            origin: None,
        }
    }

    /// Project a geodetic record into the anchored planar frame.
    ///
    /// The first record that projects successfully becomes the origin. Projection
    /// failures leave the anchor untouched.
    pub fn project(&mut self, record: &GnssRecord) -> Result<GnssFix, &'static str> {
        // validate before constructing the geodetic value: the coordinate type
        // asserts its ranges, and a malformed record must degrade to a skip
        if !record.latitude_deg.is_finite()
            || !record.longitude_deg.is_finite()
            || !record.altitude.is_finite()
            || !record.heading_deg.is_finite()
        {
            return Err("non-finite geodetic coordinate");
        }
        if !(UTM_MIN_LATITUDE..=UTM_MAX_LATITUDE).contains(&record.latitude_deg)
            || record.longitude_deg.abs() > 180.0
        {
            return Err("position outside the UTM projection band");
        }
        let geodetic = WGS84::from_degrees_and_meters(
            record.latitude_deg,
            record.longitude_deg,
            record.altitude,
        );
        let utm = geodetic_to_utm(&geodetic)?;
        let yaw = record.heading_deg.to_radians() - self.yaw_bias_rad;
        let rotation: Rotation3<f64> = yaw_rotation(yaw);
        let absolute = utm + rotation * self.lever_arm;
        let origin = *self.origin.get_or_insert(absolute);
        Ok(GnssFix {
            timestamp: record.timestamp,
            position: absolute - origin,
            rotation,
            heading_valid: record.heading_valid,
            status: record.status,
        })
    }

    /// The absolute UTM position of the anchor, if one has been established.
    pub fn origin(&self) -> Option<Vector3<f64>> {
        self.origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_utm_zone() {
        assert_eq!(utm_zone(-180.0), 1);
        assert_eq!(utm_zone(0.0), 31);
        assert_eq!(utm_zone(3.0), 31);
        assert_eq!(utm_zone(120.6), 51);
        assert_eq!(central_meridian_deg(31), 3.0);
    }

    #[test]
    fn test_central_meridian_projects_to_false_easting() {
        let p = WGS84::from_degrees_and_meters(45.0, 3.0, 120.0);
        let utm = geodetic_to_utm(&p).unwrap();
        assert_approx_eq!(utm[0], UTM_FALSE_EASTING, 1e-6);
        assert!(utm[1] > 4_000_000.0 && utm[1] < 6_000_000.0);
        assert_eq!(utm[2], 120.0);
    }

    #[test]
    fn test_small_offsets_scale_like_meters() {
        // 0.001 deg of longitude at the equator is ~111.3 m, times the central scale
        let origin = WGS84::from_degrees_and_meters(0.0, 3.0, 0.0);
        let east = WGS84::from_degrees_and_meters(0.0, 3.001, 0.0);
        let north = WGS84::from_degrees_and_meters(0.001, 3.0, 0.0);
        let o = geodetic_to_utm(&origin).unwrap();
        let e = geodetic_to_utm(&east).unwrap();
        let n = geodetic_to_utm(&north).unwrap();
        assert_approx_eq!(e[0] - o[0], 111.32 * UTM_SCALE_FACTOR, 1.0);
        assert_approx_eq!(n[1] - o[1], 110.57 * UTM_SCALE_FACTOR, 1.0);
    }

    #[test]
    fn test_southern_hemisphere_false_northing() {
        let p = WGS84::from_degrees_and_meters(-0.001, 3.0, 0.0);
        let utm = geodetic_to_utm(&p).unwrap();
        assert!(utm[1] > 9_000_000.0);
    }

    #[test]
    fn test_out_of_band_latitude_fails() {
        let p = WGS84::from_degrees_and_meters(85.0, 3.0, 0.0);
        assert!(geodetic_to_utm(&p).is_err());
        let p = WGS84::from_degrees_and_meters(-81.0, 3.0, 0.0);
        assert!(geodetic_to_utm(&p).is_err());
    }

    #[test]
    fn test_local_frame_anchors_first_fix() {
        let mut frame = LocalFrame::new(Vector3::zeros(), 0.0);
        let record = GnssRecord {
            timestamp: 10.0,
            latitude_deg: 31.0,
            longitude_deg: 121.0,
            altitude: 4.0,
            heading_deg: 90.0,
            speed: 0.0,
            status: 4,
            heading_valid: true,
            wall_clock_key: None,
        };
        let first = frame.project(&record).unwrap();
        assert_approx_eq!(first.position.norm(), 0.0, 1e-9);

        let mut moved = record.clone();
        moved.latitude_deg += 0.001;
        let second = frame.project(&moved).unwrap();
        assert_approx_eq!(second.position[1], 110.57 * UTM_SCALE_FACTOR, 1.0);
    }

    #[test]
    fn test_local_frame_lever_arm_rotates_with_heading() {
        // a forward lever arm with heading 90 deg lands rotated in the plane
        let mut frame = LocalFrame::new(Vector3::new(0.0, 1.0, 0.0), 0.0);
        let record = GnssRecord {
            timestamp: 0.0,
            latitude_deg: 31.0,
            longitude_deg: 121.0,
            altitude: 0.0,
            heading_deg: 90.0,
            speed: 0.0,
            status: 4,
            heading_valid: true,
            wall_clock_key: None,
        };
        let fix = frame.project(&record).unwrap();
        // first fix anchors at zero regardless of the lever arm
        assert_approx_eq!(fix.position.norm(), 0.0, 1e-9);
        let yaw = fix.rotation.matrix()[(1, 0)].atan2(fix.rotation.matrix()[(0, 0)]);
        assert_approx_eq!(yaw, std::f64::consts::FRAC_PI_2, 1e-12);
    }
}

//! Linear algebra utilities shared by the filter Jacobians.
//!
//! The error-state filter works on the SO(3) manifold with a right-perturbation
//! convention, so the pieces it needs over and over are the skew-symmetric (hat)
//! operator, the exponential and logarithm maps, and the fixed sensor-installation
//! rotation built from an Euler triple. `nalgebra`'s `Rotation3` already carries
//! exact exp/log implementations (`from_scaled_axis` / `scaled_axis`); the wrappers
//! here exist so the filter code reads like the equations it implements.

use nalgebra::{Matrix3, Rotation3, Unit, Vector3};

/// Build the skew-symmetric (hat) matrix of a 3-vector.
///
/// For `v = [a, b, c]` the result is the matrix `V` such that `V * x = v × x`:
///
/// ```text
/// [  0  -c   b ]
/// [  c   0  -a ]
/// [ -b   a   0 ]
/// ```
///
/// # Example
/// ```rust
/// use nalgebra::Vector3;
/// use gins::linalg::skew_symmetric;
/// let v = Vector3::new(1.0, 2.0, 3.0);
/// let m = skew_symmetric(&v);
/// assert_eq!(m[(0, 1)], -3.0);
/// ```
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v[2], v[1], v[2], 0.0, -v[0], -v[1], v[0], 0.0)
}

/// SO(3) exponential map: axis-angle 3-vector to rotation.
pub fn so3_exp(phi: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::from_scaled_axis(*phi)
}

/// SO(3) logarithm map: rotation to axis-angle 3-vector.
pub fn so3_log(rotation: &Rotation3<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Build the fixed sensor-to-body installation rotation from an Euler triple.
///
/// The angles describe how the sensor package sits in the vehicle: a roll about the
/// body X axis, a pitch about the body Y axis, and a heading about the body Z axis,
/// all in radians. The returned matrix `C` pre-rotates raw samples into the body
/// frame: `a_body = C * a_sensor`, `w_body = C * w_sensor`.
///
/// The composition matches the navigation-frame convention of the source data:
/// `C = Rz(-heading) * Rx(pitch) * Ry(roll)`.
pub fn installation_rotation(roll: f64, pitch: f64, heading: f64) -> Matrix3<f64> {
    let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), -heading);
    let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), pitch);
    let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), roll);
    (rz * rx * ry).into_inner()
}

/// Symmetrize a square matrix in place as `0.5 * (M + M^T)`.
///
/// Covariance updates in this crate are built from symmetric factors so this is not
/// required for correctness, but it is useful in tests and tooling that want to
/// assert symmetry without accumulating rounding skew.
pub fn symmetrize<const N: usize>(
    m: &nalgebra::SMatrix<f64, N, N>,
) -> nalgebra::SMatrix<f64, N, N> {
    (m + m.transpose()) * 0.5
}

/// Rotation about the vertical axis by `yaw` radians.
pub fn yaw_rotation(yaw: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Unit::new_unchecked(Vector3::z()), yaw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_skew_symmetric_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let x = Vector3::new(-0.5, 4.0, 0.25);
        let lhs = skew_symmetric(&v) * x;
        let rhs = v.cross(&x);
        for i in 0..3 {
            assert_approx_eq!(lhs[i], rhs[i], 1e-12);
        }
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.1, -0.2, 0.3);
        let recovered = so3_log(&so3_exp(&phi));
        for i in 0..3 {
            assert_approx_eq!(phi[i], recovered[i], 1e-12);
        }
    }

    #[test]
    fn test_exp_zero_is_identity() {
        let r = so3_exp(&Vector3::zeros());
        let identity = Rotation3::<f64>::identity();
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(r.matrix()[(i, j)], identity.matrix()[(i, j)], 1e-15);
            }
        }
    }

    #[test]
    fn test_yaw_rotation_heading() {
        let r = yaw_rotation(PI / 4.0);
        let heading = r.matrix()[(1, 0)].atan2(r.matrix()[(0, 0)]);
        assert_approx_eq!(heading, PI / 4.0, 1e-12);
    }

    #[test]
    fn test_installation_rotation_identity() {
        let c = installation_rotation(0.0, 0.0, 0.0);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(c[(i, j)], expected, 1e-15);
            }
        }
    }

    #[test]
    fn test_installation_rotation_is_orthonormal() {
        let c = installation_rotation(0.02, (90.0f64 - 19.5).to_radians(), -0.03);
        let should_be_identity = c * c.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(should_be_identity[(i, j)], expected, 1e-12);
            }
        }
        assert_approx_eq!(c.determinant(), 1.0, 1e-12);
    }

    #[test]
    fn test_symmetrize() {
        let m = nalgebra::SMatrix::<f64, 3, 3>::new(1.0, 2.0, 3.0, 0.0, 1.0, 4.0, 1.0, 0.0, 1.0);
        let s = symmetrize(&m);
        for i in 0..3 {
            for j in 0..3 {
                assert_eq!(s[(i, j)], s[(j, i)]);
            }
        }
    }
}

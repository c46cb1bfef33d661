//! 18-state error-state Kalman filter for GNSS/IMU fusion.
//!
//! The filter tracks a nominal state (position, velocity, attitude, gyro bias,
//! accelerometer bias, gravity) deterministically and estimates a small-signal error
//! state `dx = [δp, δv, δθ, δbg, δba, δg]` linearly. IMU samples drive the prediction
//! step; satellite fixes drive one of two observation models: a full pose
//! observation (position plus the yaw channel of attitude), or a position-only
//! observation used while the vehicle is turning, where observing heading would
//! couple badly with the attitude states. After every observation the error state is
//! folded into the nominal state and re-zeroed through a covariance projection.
//!
//! Attitude uses the right-perturbation convention `R_true = R_nominal · Exp(δθ)`
//! with `Exp`/`Log` the SO(3) exponential and logarithm maps; attitude error is a
//! body-frame tangent 3-vector throughout, never a raw Euler triple.

use nalgebra::{Matrix3, Matrix6, Rotation3, SMatrix, SVector, UnitQuaternion, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use crate::linalg::{installation_rotation, skew_symmetric, so3_exp, so3_log};
use crate::{wrap_to_360, GnssFix, ImuSample};

/// 18-dimensional error-state vector type.
pub type Vec18 = SVector<f64, 18>;
/// 18x18 covariance / transition matrix type.
pub type Mat18 = SMatrix<f64, 18, 18>;

/// Filter configuration.
///
/// The IMU noise terms are discrete-time variances and enter the process noise
/// diagonal directly; the GNSS noise terms are standard deviations and are squared
/// into the observation noise. Installation angles are degrees.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EskfOptions {
    /// Nominal IMU period in seconds; prediction steps longer than five periods are
    /// treated as a session start
    pub imu_dt: f64,
    /// Gyro measurement noise variance (discrete time)
    pub gyro_var: f64,
    /// Accelerometer measurement noise variance (discrete time)
    pub acce_var: f64,
    /// Gyro bias random-walk variance
    pub bias_gyro_var: f64,
    /// Accelerometer bias random-walk variance
    pub bias_acce_var: f64,
    /// GNSS horizontal position noise standard deviation (meters)
    pub gnss_pos_noise: f64,
    /// GNSS height noise standard deviation (meters)
    pub gnss_height_noise: f64,
    /// GNSS heading noise standard deviation (radians)
    pub gnss_ang_noise: f64,
    /// Sensor installation roll about the body X axis (degrees)
    pub phone_roll_install: f64,
    /// Sensor installation pitch about the body Y axis (degrees)
    pub phone_pitch_install: f64,
    /// Sensor installation heading about the body Z axis (degrees)
    pub phone_heading_install: f64,
    /// Shift every IMU timestamp by `fixed_time_delay` before use
    pub enable_time_compensation: bool,
    /// IMU-behind-GNSS delay in seconds, applied when compensation is enabled
    pub fixed_time_delay: f64,
    /// Fold δbg into the nominal gyro bias on update
    pub update_bias_gyro: bool,
    /// Fold δba into the nominal accelerometer bias on update
    pub update_bias_acce: bool,
}

impl Default for EskfOptions {
    fn default() -> Self {
        EskfOptions {
            imu_dt: 0.04,
            gyro_var: 1e-5,
            acce_var: 1e-2,
            bias_gyro_var: 1e-6,
            bias_acce_var: 1e-4,
            gnss_pos_noise: 5.0,
            gnss_height_noise: 1.0,
            gnss_ang_noise: 1.0_f64.to_radians(),
            phone_roll_install: 0.0,
            phone_pitch_install: 90.0 - 19.549240,
            phone_heading_install: -1.584286,
            enable_time_compensation: false,
            fixed_time_delay: 0.2,
            update_bias_gyro: true,
            update_bias_acce: true,
        }
    }
}

/// A snapshot of the nominal state, used by the pipelines for serialization.
#[derive(Clone, Copy, Debug)]
pub struct NavState {
    pub timestamp: f64,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub rotation: Rotation3<f64>,
    pub gyro_bias: Vector3<f64>,
    pub accel_bias: Vector3<f64>,
}

impl NavState {
    /// Attitude as `[w, x, y, z]` quaternion components.
    pub fn quaternion_wxyz(&self) -> [f64; 4] {
        let q = UnitQuaternion::from_rotation_matrix(&self.rotation);
        let coords = q.into_inner().coords; // [x, y, z, w]
        [coords[3], coords[0], coords[1], coords[2]]
    }
}

/// The 18-state error-state Kalman filter.
///
/// The filter owns its nominal state and covariance; nothing else mutates them. It
/// is not re-entrant and holds no background tasks: callers replay a time-sorted
/// event stream through [`Eskf::predict`] and the observation methods.
#[derive(Clone, Debug)]
pub struct Eskf {
    options: EskfOptions,
    install: Matrix3<f64>,

    current_time: f64,
    position: Vector3<f64>,
    velocity: Vector3<f64>,
    rotation: Rotation3<f64>,
    gyro_bias: Vector3<f64>,
    accel_bias: Vector3<f64>,
    gravity: Vector3<f64>,

    dx: Vec18,
    cov: Mat18,

    process_noise: Mat18,
    pose_noise: Matrix6<f64>,
    position_noise: Matrix3<f64>,

    first_fix: bool,
}

fn block3(v: &Vec18, index: usize) -> Vector3<f64> {
    Vector3::new(v[index], v[index + 1], v[index + 2])
}

impl Eskf {
    /// Create a filter with zero initial biases and the given options.
    pub fn new(options: EskfOptions) -> Self {
        let mut eskf = Eskf {
            install: Matrix3::identity(),
            current_time: 0.0,
            position: Vector3::zeros(),
            velocity: Vector3::zeros(),
            rotation: Rotation3::identity(),
            gyro_bias: Vector3::zeros(),
            accel_bias: Vector3::zeros(),
            gravity: Vector3::new(0.0, 0.0, -9.8),
            dx: Vec18::zeros(),
            cov: Mat18::identity(),
            process_noise: Mat18::zeros(),
            pose_noise: Matrix6::zeros(),
            position_noise: Matrix3::zeros(),
            first_fix: true,
            options,
        };
        eskf.build_noise();
        eskf.build_installation();
        eskf
    }

    /// Reset options, pre-computed biases, and gravity, and tighten the covariance.
    ///
    /// The biases come from an external calibration (the static initializer is not
    /// part of this crate); gravity defaults to `(0, 0, -9.8)`.
    pub fn set_initial_conditions(
        &mut self,
        options: EskfOptions,
        gyro_bias: Vector3<f64>,
        accel_bias: Vector3<f64>,
        gravity: Vector3<f64>,
    ) {
        self.options = options;
        self.build_noise();
        self.build_installation();
        self.gyro_bias = gyro_bias;
        self.accel_bias = accel_bias;
        self.gravity = gravity;
        self.cov = Mat18::identity() * 1e-4;
    }

    fn build_noise(&mut self) {
        let ev = self.options.acce_var;
        let et = self.options.gyro_var;
        let eg = self.options.bias_gyro_var;
        let ea = self.options.bias_acce_var;
        let mut q = Vec18::zeros();
        for i in 0..3 {
            q[3 + i] = ev;
            q[6 + i] = et;
            q[9 + i] = eg;
            q[12 + i] = ea;
        }
        self.process_noise = Mat18::from_diagonal(&q);

        let gp2 = self.options.gnss_pos_noise * self.options.gnss_pos_noise;
        let gh2 = self.options.gnss_height_noise * self.options.gnss_height_noise;
        let ga2 = self.options.gnss_ang_noise * self.options.gnss_ang_noise;
        self.pose_noise =
            Matrix6::from_diagonal(&Vector6::new(gp2, gp2, gh2, ga2, ga2, ga2));
        self.position_noise = Matrix3::from_diagonal(&Vector3::new(gp2, gp2, gh2));
    }

    fn build_installation(&mut self) {
        self.install = installation_rotation(
            self.options.phone_roll_install.to_radians(),
            self.options.phone_pitch_install.to_radians(),
            self.options.phone_heading_install.to_radians(),
        );
    }

    /// Rotate a raw sample into the body frame and apply the optional time shift.
    fn condition_sample(&self, imu: &ImuSample) -> ImuSample {
        let mut out = ImuSample {
            timestamp: imu.timestamp,
            gyro: self.install * imu.gyro,
            accel: self.install * imu.accel,
        };
        if self.options.enable_time_compensation {
            out.timestamp += self.options.fixed_time_delay;
        }
        out
    }

    /// Propagate the nominal state and covariance with one IMU sample.
    ///
    /// Returns `false` without touching the state when the sample is early
    /// (`dt < 0`), and `false` after resynchronizing `current_time` when the gap
    /// exceeds five nominal IMU periods (session start).
    pub fn predict(&mut self, imu: &ImuSample) -> bool {
        let imu = self.condition_sample(imu);
        let dt = imu.timestamp - self.current_time;

        if dt < 0.0 {
            log::warn!("skipping early imu sample: dt = {:.6}", dt);
            return false;
        }
        if dt > 5.0 * self.options.imu_dt {
            log::warn!("imu gap of {:.3} s, treating as session start", dt);
            self.current_time = imu.timestamp;
            return false;
        }

        let accel_unbiased = imu.accel - self.accel_bias;
        let gyro_unbiased = imu.gyro - self.gyro_bias;

        // nominal propagation; every new value is computed from the current attitude
        // before it is overwritten
        let world_accel = self.rotation * accel_unbiased;
        let new_position = self.position
            + self.velocity * dt
            + 0.5 * world_accel * dt * dt
            + 0.5 * self.gravity * dt * dt;
        let new_velocity = self.velocity + world_accel * dt + self.gravity * dt;
        let new_rotation = self.rotation * so3_exp(&(gyro_unbiased * dt));

        self.rotation = new_rotation;
        self.velocity = new_velocity;
        self.position = new_position;

        // discrete error-state transition; F is sparse and only the non-identity
        // blocks are filled in
        let r_mat = *self.rotation.matrix();
        let mut f = Mat18::identity();
        f.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(3, 6)
            .copy_from(&(-(r_mat * skew_symmetric(&accel_unbiased)) * dt));
        f.fixed_view_mut::<3, 3>(3, 12).copy_from(&(-r_mat * dt));
        f.fixed_view_mut::<3, 3>(3, 15)
            .copy_from(&(Matrix3::identity() * dt));
        f.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(so3_exp(&(-gyro_unbiased * dt)).matrix());
        f.fixed_view_mut::<3, 3>(6, 9)
            .copy_from(&(-Matrix3::identity() * dt));

        // dx is zero right after a reset, but F still has to flow through the
        // covariance prediction
        self.dx = f * self.dx;
        self.cov = f * self.cov * f.transpose() + self.process_noise;
        self.current_time = imu.timestamp;
        true
    }

    /// Full pose observation: position plus the yaw channel of attitude.
    ///
    /// The first accepted fix initializes the filter pose instead of updating it.
    /// Fixes whose heading is flagged invalid are skipped.
    pub fn observe_gps(&mut self, fix: &GnssFix) -> bool {
        if self.first_fix {
            self.initialize_from_fix(fix);
            return true;
        }
        if !fix.heading_valid {
            log::warn!("gnss heading invalid, skipping pose update");
            return false;
        }
        self.update_pose(fix)
    }

    /// Position-only observation, used while the vehicle is turning.
    ///
    /// Shares the first-fix initialization with [`Eskf::observe_gps`]; afterwards
    /// only the position block of the observation matrix is populated, so the
    /// attitude and bias states move only through the Kalman gain.
    pub fn observe_position_only(&mut self, fix: &GnssFix) -> bool {
        if self.first_fix {
            self.initialize_from_fix(fix);
            return true;
        }
        self.update_position(fix)
    }

    fn initialize_from_fix(&mut self, fix: &GnssFix) {
        self.rotation = fix.rotation;
        self.position = fix.position;
        self.current_time = fix.timestamp;
        self.first_fix = false;
        log::info!(
            "filter initialized from first fix, heading {:.3} deg",
            wrap_to_360(self.current_heading().to_degrees())
        );
    }

    fn update_pose(&mut self, fix: &GnssFix) -> bool {
        let mut h = SMatrix::<f64, 6, 18>::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
        h.fixed_view_mut::<3, 3>(3, 6).copy_from(&Matrix3::identity());

        let s = h * self.cov * h.transpose() + self.pose_noise;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => {
                log::error!("pose innovation covariance is singular, skipping update");
                return false;
            }
        };
        let k = self.cov * h.transpose() * s_inv;

        let mut innovation = Vector6::zeros();
        innovation
            .fixed_rows_mut::<3>(0)
            .copy_from(&(fix.position - self.position));
        innovation
            .fixed_rows_mut::<3>(3)
            .copy_from(&so3_log(&(self.rotation.inverse() * fix.rotation)));
        // GNSS provides heading only; the roll and pitch channels of the attitude
        // innovation are cleared so just yaw influences the update
        innovation[3] = 0.0;
        innovation[4] = 0.0;

        self.dx = k * innovation;
        self.cov = (Mat18::identity() - k * h) * self.cov;
        self.update_and_reset();
        true
    }

    fn update_position(&mut self, fix: &GnssFix) -> bool {
        let mut h = SMatrix::<f64, 3, 18>::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());

        let s = h * self.cov * h.transpose() + self.position_noise;
        let s_inv = match s.try_inverse() {
            Some(inv) => inv,
            None => {
                log::error!("position innovation covariance is singular, skipping update");
                return false;
            }
        };
        let k = self.cov * h.transpose() * s_inv;
        let innovation = fix.position - self.position;

        self.dx = k * innovation;
        self.cov = (Mat18::identity() - k * h) * self.cov;
        self.update_and_reset();
        true
    }

    /// Fold the error state into the nominal state, project the covariance, and
    /// re-zero `dx`.
    fn update_and_reset(&mut self) {
        let dtheta = block3(&self.dx, 6);
        self.position += block3(&self.dx, 0);
        self.velocity += block3(&self.dx, 3);
        self.rotation *= so3_exp(&dtheta);
        if self.options.update_bias_gyro {
            self.gyro_bias += block3(&self.dx, 9);
        }
        if self.options.update_bias_acce {
            self.accel_bias += block3(&self.dx, 12);
        }
        self.gravity += block3(&self.dx, 15);

        // small-angle covariance projection onto the post-reset tangent space
        let mut j = Mat18::identity();
        j.fixed_view_mut::<3, 3>(6, 6)
            .copy_from(&(Matrix3::identity() - 0.5 * skew_symmetric(&dtheta)));
        self.cov = j * self.cov * j.transpose();

        self.dx = Vec18::zeros();
    }

    /// Whether the filter has accepted its first fix.
    pub fn is_initialized(&self) -> bool {
        !self.first_fix
    }

    /// Snapshot of the nominal state.
    pub fn nominal_state(&self) -> NavState {
        NavState {
            timestamp: self.current_time,
            position: self.position,
            velocity: self.velocity,
            rotation: self.rotation,
            gyro_bias: self.gyro_bias,
            accel_bias: self.accel_bias,
        }
    }

    /// Overwrite the nominal state, for replay harnesses.
    pub fn set_state(&mut self, state: &NavState, gravity: Vector3<f64>) {
        self.current_time = state.timestamp;
        self.position = state.position;
        self.velocity = state.velocity;
        self.rotation = state.rotation;
        self.gyro_bias = state.gyro_bias;
        self.accel_bias = state.accel_bias;
        self.gravity = gravity;
        self.first_fix = false;
    }

    /// Overwrite the covariance, for replay harnesses.
    pub fn set_covariance(&mut self, cov: Mat18) {
        self.cov = cov;
    }

    /// The full 18x18 covariance.
    pub fn covariance(&self) -> &Mat18 {
        &self.cov
    }

    /// Diagonal of the covariance in state order.
    pub fn covariance_diagonal(&self) -> [f64; 18] {
        let mut diag = [0.0; 18];
        for (i, value) in diag.iter_mut().enumerate() {
            *value = self.cov[(i, i)];
        }
        diag
    }

    /// The current error state (zero except between a gain application and reset).
    pub fn error_state(&self) -> &Vec18 {
        &self.dx
    }

    /// The estimated gravity vector.
    pub fn gravity(&self) -> Vector3<f64> {
        self.gravity
    }

    /// Planar heading of the nominal attitude, radians.
    pub fn current_heading(&self) -> f64 {
        let m = self.rotation.matrix();
        m[(1, 0)].atan2(m[(0, 0)])
    }

    /// Project a planar residual onto the axis perpendicular to the current heading.
    ///
    /// Used by the offline diagnostics: a timing error between GNSS and IMU shows up
    /// as a systematic lateral component while the vehicle turns.
    pub fn lateral_residual(&self, residual: &Vector3<f64>) -> f64 {
        let heading = self.current_heading();
        residual.x * heading.cos() - residual.y * heading.sin()
    }

    /// The active IMU timestamp shift in seconds.
    pub fn time_compensation(&self) -> f64 {
        if self.options.enable_time_compensation {
            self.options.fixed_time_delay
        } else {
            0.0
        }
    }

    /// Toggle the IMU timestamp shift at runtime.
    pub fn set_time_compensation(&mut self, enable: bool, delay: f64) {
        self.options.enable_time_compensation = enable;
        self.options.fixed_time_delay = delay;
        log::info!(
            "time compensation {}, delay = {} s",
            if enable { "enabled" } else { "disabled" },
            delay
        );
    }

    /// Fold a calibration feedback pair into the installation rotation.
    ///
    /// The feedback reports the estimated sensor misalignment; pitch maps onto the
    /// installation pitch relative to the upright mount and heading replaces the
    /// installation heading. Roll is left unchanged.
    pub fn apply_misalignment(&mut self, pitch_deg: f64, heading_deg: f64) {
        self.options.phone_pitch_install = 90.0 + pitch_deg;
        self.options.phone_heading_install = heading_deg;
        self.build_installation();
        log::info!(
            "installation updated from calibration feedback: pitch {:.4} deg, heading {:.4} deg",
            pitch_deg,
            heading_deg
        );
    }

    /// The active options.
    pub fn options(&self) -> &EskfOptions {
        &self.options
    }
}

//! Constant-velocity Kalman filter on the ground plane using ndarray and a nalgebra-based
//! inverse.
//!
//! State is `[x, y, vx, vy]` in metres and metres per second; measurements are `[x, y]`.

use ndarray::{Array1, Array2};

/// Filter state of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionState {
    pub mean: Array1<f64>,
    pub covariance: Array2<f64>,
}

impl MotionState {
    pub fn position(&self) -> [f64; 2] {
        [self.mean[0], self.mean[1]]
    }

    pub fn velocity(&self) -> [f64; 2] {
        [self.mean[2], self.mean[3]]
    }
}

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    update_mat: Array2<f64>,
    std_measurement: f64,
    std_acceleration: f64,
    std_initial_velocity: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        Self::with_noise(0.25, 2.0)
    }

    /// Filter with the given measurement noise (metres) and process acceleration noise
    /// (metres per second squared).
    pub fn with_noise(std_measurement: f64, std_acceleration: f64) -> Self {
        let mut update_mat: Array2<f64> = Array2::zeros((2, 4));
        update_mat[[0, 0]] = 1.0;
        update_mat[[1, 1]] = 1.0;

        Self {
            update_mat,
            std_measurement,
            std_acceleration,
            std_initial_velocity: 2.0,
        }
    }

    pub fn initiate(&self, measurement: [f64; 2]) -> MotionState {
        let mut mean: Array1<f64> = Array1::zeros(4);
        mean[0] = measurement[0];
        mean[1] = measurement[1];

        let std = [
            2.0 * self.std_measurement,
            2.0 * self.std_measurement,
            self.std_initial_velocity,
            self.std_initial_velocity,
        ];
        let mut covariance: Array2<f64> = Array2::zeros((4, 4));
        for i in 0..4 {
            covariance[[i, i]] = std[i] * std[i];
        }

        MotionState { mean, covariance }
    }

    /// Propagate the state `dt` seconds forward. Non-positive `dt` leaves it unchanged.
    pub fn predict(&self, state: &MotionState, dt: f64) -> MotionState {
        if dt <= 0.0 {
            return state.clone();
        }
        let mut motion_mat: Array2<f64> = Array2::eye(4);
        motion_mat[[0, 2]] = dt;
        motion_mat[[1, 3]] = dt;

        // discrete white-noise acceleration, per axis
        let q = self.std_acceleration * self.std_acceleration;
        let (dt2, dt3, dt4) = (dt * dt, dt * dt * dt, dt * dt * dt * dt);
        let mut motion_cov: Array2<f64> = Array2::zeros((4, 4));
        for axis in 0..2 {
            let (p, v) = (axis, axis + 2);
            motion_cov[[p, p]] = q * dt4 / 4.0;
            motion_cov[[p, v]] = q * dt3 / 2.0;
            motion_cov[[v, p]] = q * dt3 / 2.0;
            motion_cov[[v, v]] = q * dt2;
        }

        let mean = motion_mat.dot(&state.mean);
        let covariance = motion_mat.dot(&state.covariance).dot(&motion_mat.t()) + motion_cov;
        MotionState { mean, covariance }
    }

    pub fn project(&self, state: &MotionState) -> (Array1<f64>, Array2<f64>) {
        let r = self.std_measurement * self.std_measurement;
        let innovation_cov: Array2<f64> = Array2::eye(2) * r;

        let mean_proj = self.update_mat.dot(&state.mean);
        let covariance_proj =
            self.update_mat.dot(&state.covariance).dot(&self.update_mat.t()) + innovation_cov;

        (mean_proj, covariance_proj)
    }

    pub fn update(&self, state: &MotionState, measurement: [f64; 2]) -> MotionState {
        let (projected_mean, projected_cov) = self.project(state);

        let measurement_arr = Array1::from_vec(measurement.to_vec());
        let innovation = measurement_arr - projected_mean;

        // K = P * H^T * S^-1
        let Some(s_inv) = invert_2x2(&projected_cov) else {
            tracing::warn!("singular innovation covariance, measurement ignored");
            return state.clone();
        };
        let pht = state.covariance.dot(&self.update_mat.t()); // 4x2
        let kalman_gain = pht.dot(&s_inv); // 4x2

        let mean = &state.mean + &kalman_gain.dot(&innovation);
        let covariance =
            &state.covariance - &kalman_gain.dot(&projected_cov).dot(&kalman_gain.t());
        MotionState { mean, covariance }
    }
}

fn invert_2x2(m: &Array2<f64>) -> Option<Array2<f64>> {
    let nm = nalgebra::Matrix2::new(m[[0, 0]], m[[0, 1]], m[[1, 0]], m[[1, 1]]);
    let inv = nm.try_inverse()?;
    let mut res = Array2::zeros((2, 2));
    for i in 0..2 {
        for j in 0..2 {
            res[[i, j]] = inv[(i, j)];
        }
    }
    Some(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_initiate() {
        let kf = KalmanFilter::new();
        let state = kf.initiate([10.0, 20.0]);
        assert_eq!(state.position(), [10.0, 20.0]);
        assert_eq!(state.velocity(), [0.0, 0.0]);
    }

    #[test]
    fn test_learns_velocity() {
        let kf = KalmanFilter::new();
        let mut state = kf.initiate([0.0, 0.0]);
        for step in 1..=20 {
            state = kf.predict(&state, 0.1);
            state = kf.update(&state, [step as f64 * 0.1, 0.0]);
        }
        let [vx, vy] = state.velocity();
        assert_abs_diff_eq!(vx, 1.0, epsilon = 0.15);
        assert_abs_diff_eq!(vy, 0.0, epsilon = 0.05);
    }

    #[test]
    fn test_zero_dt_predict_is_identity() {
        let kf = KalmanFilter::new();
        let state = kf.initiate([1.0, 2.0]);
        assert_eq!(kf.predict(&state, 0.0), state);
        assert_eq!(kf.predict(&state, -1.0), state);
    }
}

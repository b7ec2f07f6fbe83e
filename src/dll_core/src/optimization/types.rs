//! Type definitions shared by the alignment solvers.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector4};
use serde::{Deserialize, Serialize};

/// Four-DoF pose `(tx, ty, tz, yaw)` acting on tilt-compensated points.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
}

impl Pose4 {
    pub fn new(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self { x, y, z, yaw }
    }

    /// Apply the pose: `(tx + cy·x − sy·y, ty + sy·x + cy·y, tz + z)`.
    #[inline]
    pub fn transform_point(&self, point: &[f32; 3]) -> [f64; 3] {
        let (sy, cy) = self.yaw.sin_cos();
        let (x, y, z) = (point[0] as f64, point[1] as f64, point[2] as f64);
        [
            self.x + cy * x - sy * y,
            self.y + sy * x + cy * y,
            self.z + z,
        ]
    }

    pub fn to_vector(&self) -> Vector4<f64> {
        Vector4::new(self.x, self.y, self.z, self.yaw)
    }

    pub fn from_vector(v: &Vector4<f64>) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    /// `self + delta * step`, parameters in `[tx, ty, tz, yaw]` order.
    pub fn apply_delta(&self, delta: &Vector4<f64>, step: f64) -> Self {
        Self::from_vector(&(self.to_vector() + delta * step))
    }

    /// Same pose with yaw wrapped into `(-π, π]`.
    pub fn normalized(&self) -> Self {
        Self {
            yaw: normalize_angle(self.yaw),
            ..*self
        }
    }

    /// Full 6-DoF transform with the given roll and pitch.
    pub fn to_isometry(&self, roll: f64, pitch: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(self.x, self.y, self.z),
            UnitQuaternion::from_euler_angles(roll, pitch, self.yaw),
        )
    }

    /// Translation and yaw of a 6-DoF transform.
    pub fn from_isometry(isometry: &Isometry3<f64>) -> Self {
        let t = isometry.translation.vector;
        let (_, _, yaw) = isometry.rotation.euler_angles();
        Self::new(t.x, t.y, t.z, yaw)
    }

    /// Euclidean distance between translations.
    pub fn translation_distance(&self, other: &Pose4) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }

    /// Absolute wrapped yaw difference.
    pub fn yaw_distance(&self, other: &Pose4) -> f64 {
        normalize_angle(self.yaw - other.yaw).abs()
    }
}

/// Wrap an angle into `(-π, π]`.
pub fn normalize_angle(angle: f64) -> f64 {
    use std::f64::consts::{PI, TAU};
    let mut a = angle.rem_euclid(TAU);
    if a > PI {
        a -= TAU;
    }
    a
}

/// Levenberg-Marquardt settings for the distance-field solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Stop when the step norm drops below this.
    pub step_epsilon: f64,
    /// Stop when an accepted step lowers the cost by less than this.
    pub cost_epsilon: f64,
    /// Initial damping λ.
    pub initial_lambda: f64,
    /// Damping factor ν.
    pub lambda_factor: f64,
    /// Cholesky retries (each multiplies λ by ν²) before giving up.
    pub max_cholesky_retries: usize,
    /// Minimum number of in-grid points needed to solve.
    pub min_points: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            step_epsilon: 1e-4,
            cost_epsilon: 1e-6,
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            max_cholesky_retries: 3,
            min_points: 4,
        }
    }
}

/// Outcome of an alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// A termination tolerance was met.
    Converged,

    /// Hit the iteration cap.
    MaxIterations,

    /// Too few usable points or correspondences; the prior is returned.
    Underdetermined,

    /// The linear system stayed singular.
    SingularHessian,

    /// No step ever lowered the cost.
    Diverged,

    /// Stopped at an iteration boundary on request.
    Cancelled,
}

impl SolveStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, SolveStatus::Converged)
    }

    /// Whether the pose may be committed as a correction.
    pub fn is_usable(&self) -> bool {
        matches!(self, SolveStatus::Converged | SolveStatus::MaxIterations)
    }
}

/// Result of aligning a cloud from a prior.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveResult {
    /// Refined pose (the prior when nothing was accepted).
    pub pose: Pose4,
    pub status: SolveStatus,
    /// Objective at the prior.
    pub initial_cost: f64,
    /// Objective at `pose`.
    pub final_cost: f64,
    pub iterations: usize,
    /// Points or correspondences used in the last evaluation.
    pub num_points: usize,
}

impl SolveResult {
    /// Result that leaves the prior untouched.
    pub fn unchanged(prior: Pose4, status: SolveStatus, cost: f64, num_points: usize) -> Self {
        Self {
            pose: prior,
            status,
            initial_cost: cost,
            final_cost: cost,
            iterations: 0,
            num_points,
        }
    }
}

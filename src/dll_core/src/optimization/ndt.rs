//! Newton iterations on the NDT score.
//!
//! 1. Transform source points with the current pose
//! 2. Accumulate score, gradient and Hessian against the voxel map
//! 3. Solve `Δp = -(H + λI)⁻¹g`
//! 4. Force an ascent direction, cap the step length, repeat
//!
//! Results report the negated score as cost, so lower is better for every
//! backend.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::newton::{condition_number, newton_step_regularized};
use super::types::{Pose4, SolveResult, SolveStatus};
use crate::derivatives::{compute_derivatives, GaussianParams};
use crate::voxel_grid::VoxelGrid;

const SVD_TOLERANCE: f64 = 1e-10;
const CONDITION_WARNING: f64 = 1e10;

/// NDT backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdtConfig {
    /// Voxel side length in meters; also the correspondence search radius.
    pub resolution: f64,
    pub max_iterations: usize,
    /// Stop when `‖Δp‖` drops below this.
    pub trans_epsilon: f64,
    /// Maximum step length per iteration (not a damping factor).
    pub step_size: f64,
    /// Probability that a point is an outlier.
    pub outlier_ratio: f64,
    /// Added to the Hessian diagonal before solving.
    pub regularization: f64,
    /// Fewer point-voxel pairs than this is underdetermined.
    pub min_correspondences: usize,
}

impl Default for NdtConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 30,
            trans_epsilon: 0.01,
            step_size: 0.1,
            outlier_ratio: 0.55,
            regularization: 1e-6,
            min_correspondences: 10,
        }
    }
}

/// Newton optimizer for the 4-DoF NDT score.
#[derive(Debug, Clone)]
pub struct NdtOptimizer {
    config: NdtConfig,
    gauss: GaussianParams,
}

impl NdtOptimizer {
    pub fn new(config: NdtConfig) -> Self {
        let gauss = GaussianParams::new(config.resolution, config.outlier_ratio);
        Self { config, gauss }
    }

    pub fn config(&self) -> &NdtConfig {
        &self.config
    }

    pub fn gauss(&self) -> &GaussianParams {
        &self.gauss
    }

    /// Align `source_points` to `target_grid` starting from `prior`.
    pub fn align(
        &self,
        source_points: &[[f32; 3]],
        target_grid: &VoxelGrid,
        prior: Pose4,
        cancel: Option<&AtomicBool>,
    ) -> SolveResult {
        let config = &self.config;
        let mut pose = prior;
        let mut best_score = f64::NEG_INFINITY;
        let mut best_pose = pose;
        let mut initial_score = None;
        let mut last_correspondences = 0;

        let finish = |pose: Pose4, status, score: f64, initial: Option<f64>, iterations, n| {
            SolveResult {
                pose: pose.normalized(),
                status,
                initial_cost: -initial.unwrap_or(score),
                final_cost: -score,
                iterations,
                num_points: n,
            }
        };

        for iteration in 0..config.max_iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                let score = if best_score.is_finite() { best_score } else { 0.0 };
                return finish(
                    best_pose,
                    SolveStatus::Cancelled,
                    score,
                    initial_score,
                    iteration,
                    last_correspondences,
                );
            }

            let derivatives =
                compute_derivatives(source_points, target_grid, &pose, &self.gauss);

            if derivatives.num_correspondences < config.min_correspondences {
                if iteration == 0 {
                    return SolveResult::unchanged(
                        prior,
                        SolveStatus::Underdetermined,
                        -derivatives.score,
                        derivatives.num_correspondences,
                    );
                }
                break;
            }
            initial_score.get_or_insert(derivatives.score);
            last_correspondences = derivatives.num_correspondences;

            if derivatives.score > best_score {
                best_score = derivatives.score;
                best_pose = pose;
            }

            let Some(delta) = newton_step_regularized(
                &derivatives.gradient,
                &derivatives.hessian,
                config.regularization,
                SVD_TOLERANCE,
            ) else {
                return finish(
                    best_pose,
                    SolveStatus::SingularHessian,
                    best_score,
                    initial_score,
                    iteration,
                    last_correspondences,
                );
            };

            let delta_norm = delta.norm();
            if delta_norm < config.trans_epsilon {
                return finish(
                    pose,
                    SolveStatus::Converged,
                    derivatives.score,
                    initial_score,
                    iteration + 1,
                    derivatives.num_correspondences,
                );
            }

            let condition = condition_number(&derivatives.hessian);
            if condition > CONDITION_WARNING {
                debug!("NDT: ill-conditioned Hessian (cond {condition:.3e}) at iteration {iteration}");
            }

            // The score is maximized: the step must point uphill.
            let mut step_dir = delta / delta_norm;
            if derivatives.gradient.dot(&step_dir) <= 0.0 {
                step_dir = -step_dir;
            }
            pose = pose.apply_delta(&step_dir, delta_norm.min(config.step_size));
        }

        finish(
            best_pose,
            SolveStatus::MaxIterations,
            best_score,
            initial_score,
            config.max_iterations,
            last_correspondences,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_room_pcd, sample_scan};
    use crate::voxel_grid::VoxelGridConfig;

    fn room_grid(map: &[[f32; 3]]) -> VoxelGrid {
        VoxelGrid::from_points(map, VoxelGridConfig::default())
    }

    #[test]
    fn test_config_defaults() {
        let optimizer = NdtOptimizer::new(NdtConfig::default());
        assert_eq!(optimizer.config().resolution, 1.0);
        assert_eq!(optimizer.config().max_iterations, 30);
        assert!(optimizer.gauss().d1 < 0.0);
    }

    #[test]
    fn test_align_recovers_offset() {
        let map = make_room_pcd(6.0, 4.0, 2.5, 0.05);
        let grid = room_grid(&map);
        let truth = Pose4::new(0.4, -0.3, 1.0, 0.3);
        let scan = sample_scan(&map, &truth, 11, 1.0, 1.0e4);
        let prior = Pose4::new(truth.x + 0.2, truth.y + 0.2, truth.z, truth.yaw + 5f64.to_radians());

        let result = NdtOptimizer::new(NdtConfig::default()).align(&scan, &grid, prior, None);
        assert!(result.status.is_usable(), "status {:?}", result.status);
        assert!(result.pose.translation_distance(&truth) < 0.1);
        assert!(result.pose.yaw_distance(&truth) < 1f64.to_radians());
        assert!(result.final_cost <= result.initial_cost);
    }

    #[test]
    fn test_no_correspondences_is_underdetermined() {
        let map = make_room_pcd(4.0, 3.0, 2.5, 0.1);
        let grid = room_grid(&map);
        let scan: Vec<[f32; 3]> = (0..50).map(|_| [1000.0f32, 1000.0, 1000.0]).collect();
        let prior = Pose4::new(0.0, 0.0, 1.0, 0.0);

        let result = NdtOptimizer::new(NdtConfig::default()).align(&scan, &grid, prior, None);
        assert_eq!(result.status, SolveStatus::Underdetermined);
        assert_eq!(result.pose, prior);
    }

    #[test]
    fn test_cancelled_before_start() {
        let map = make_room_pcd(4.0, 3.0, 2.5, 0.1);
        let grid = room_grid(&map);
        let truth = Pose4::new(0.0, 0.0, 1.0, 0.0);
        let scan = sample_scan(&map, &truth, 5, 1.0, 1.0e4);
        let cancel = AtomicBool::new(true);

        let result = NdtOptimizer::new(NdtConfig::default()).align(&scan, &grid, truth, Some(&cancel));
        assert_eq!(result.status, SolveStatus::Cancelled);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.pose, truth);
    }
}

//! Levenberg-Marquardt refinement of a 4-DoF pose against a distance field.
//!
//! Each iteration forms `H = JᵀJ + λ·diag(JᵀJ)`, solves `H·δ = −Jᵀr` and
//! tries `θ + δ`. A step is kept only if it strictly lowers `½·Σr²`; ties
//! are rejected. Cholesky failures multiply `λ` by `ν²` and retry.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::newton::damped_step;
use super::types::{Pose4, SolveResult, SolveStatus, SolverConfig};
use crate::derivatives::ResidualBlock;
use crate::interpolation::TrilinearField;

const MIN_LAMBDA: f64 = 1e-12;
const MAX_LAMBDA: f64 = 1e10;

/// Damping state: shrinks on accepted steps, grows on rejected ones.
#[derive(Debug, Clone)]
pub struct Damping {
    lambda: f64,
    factor: f64,
}

impl Damping {
    pub fn new(initial: f64, factor: f64) -> Self {
        Self {
            lambda: initial,
            factor,
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Cost went down: `λ /= ν`.
    pub fn accept_step(&mut self) {
        self.lambda = (self.lambda / self.factor).max(MIN_LAMBDA);
    }

    /// Cost did not go down: `λ *= ν`.
    pub fn reject_step(&mut self) {
        self.lambda = (self.lambda * self.factor).min(MAX_LAMBDA);
    }

    /// Linear solve failed: `λ *= ν²`.
    pub fn escalate(&mut self) {
        self.lambda = (self.lambda * self.factor * self.factor).min(MAX_LAMBDA);
    }

    /// Damping saturated; further rejections will not change the step.
    pub fn is_stuck(&self) -> bool {
        self.lambda >= MAX_LAMBDA * 0.99
    }
}

/// Levenberg-Marquardt solver over a [`TrilinearField`].
#[derive(Debug, Clone, Default)]
pub struct LmSolver {
    config: SolverConfig,
}

impl LmSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Refine `prior` so that `points`, moved by the pose, sit on the zero
    /// level set of `field`.
    ///
    /// `cancel` is polled at the start of every iteration.
    pub fn solve(
        &self,
        field: &TrilinearField,
        points: &[[f32; 3]],
        prior: Pose4,
        cancel: Option<&AtomicBool>,
    ) -> SolveResult {
        let config = &self.config;
        let block = ResidualBlock::new(field, points);
        let mut system = block.normal_equations(&prior);
        let initial_cost = system.cost;

        if system.in_grid < config.min_points {
            debug!(
                "LM: {} of {} points in grid, need {}",
                system.in_grid,
                points.len(),
                config.min_points
            );
            return SolveResult::unchanged(
                prior,
                SolveStatus::Underdetermined,
                initial_cost,
                system.in_grid,
            );
        }

        let mut pose = prior;
        let mut damping = Damping::new(config.initial_lambda, config.lambda_factor);
        let mut accepted_any = false;

        let finish = |pose: Pose4, status, final_cost, iterations, num_points| SolveResult {
            pose: pose.normalized(),
            status,
            initial_cost,
            final_cost,
            iterations,
            num_points,
        };

        for iteration in 0..config.max_iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return finish(pose, SolveStatus::Cancelled, system.cost, iteration, system.in_grid);
            }

            let mut delta = damped_step(&system.jtj, &system.jtr, damping.lambda());
            let mut retries = 0;
            while delta.is_none() && retries < config.max_cholesky_retries {
                damping.escalate();
                delta = damped_step(&system.jtj, &system.jtr, damping.lambda());
                retries += 1;
            }
            let Some(delta) = delta else {
                debug!("LM: damped system singular at λ = {:.3e}", damping.lambda());
                return finish(
                    pose,
                    SolveStatus::SingularHessian,
                    system.cost,
                    iteration,
                    system.in_grid,
                );
            };

            if delta.norm() < config.step_epsilon {
                return finish(
                    pose,
                    SolveStatus::Converged,
                    system.cost,
                    iteration + 1,
                    system.in_grid,
                );
            }

            let trial = pose.apply_delta(&delta, 1.0);
            let trial_system = block.normal_equations(&trial);

            // Points leaving the grid also lower the cost; require support.
            if trial_system.in_grid >= config.min_points && trial_system.cost < system.cost {
                let decrease = system.cost - trial_system.cost;
                pose = trial;
                system = trial_system;
                damping.accept_step();
                accepted_any = true;

                if decrease < config.cost_epsilon {
                    return finish(
                        pose,
                        SolveStatus::Converged,
                        system.cost,
                        iteration + 1,
                        system.in_grid,
                    );
                }
            } else {
                damping.reject_step();
                if damping.is_stuck() {
                    let status = if accepted_any {
                        SolveStatus::Converged
                    } else {
                        SolveStatus::Diverged
                    };
                    return finish(pose, status, system.cost, iteration + 1, system.in_grid);
                }
            }
        }

        finish(
            pose,
            SolveStatus::MaxIterations,
            system.cost,
            config.max_iterations,
            system.in_grid,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{DistanceGrid, GridConfig, GridGeometry};
    use crate::test_utils::{make_room_pcd, sample_scan};
    use approx::assert_relative_eq;

    fn room() -> (Vec<[f32; 3]>, TrilinearField) {
        let map = make_room_pcd(4.0, 3.0, 2.5, 0.05);
        let config = GridConfig {
            resolution: 0.1,
            max_distance: 1.0,
            margin: 0.5,
        };
        let field = TrilinearField::new(DistanceGrid::from_points(&map, &config).unwrap());
        (map, field)
    }

    fn offset_prior(truth: &Pose4) -> Pose4 {
        Pose4::new(
            truth.x + 0.2,
            truth.y + 0.2,
            truth.z,
            truth.yaw + 5f64.to_radians(),
        )
    }

    #[test]
    fn test_damping_schedule() {
        let mut damping = Damping::new(1e-3, 10.0);
        damping.accept_step();
        assert_relative_eq!(damping.lambda(), 1e-4, epsilon = 1e-18);
        damping.reject_step();
        damping.reject_step();
        assert_relative_eq!(damping.lambda(), 1e-2, epsilon = 1e-15);
        damping.escalate();
        assert_relative_eq!(damping.lambda(), 1.0, epsilon = 1e-12);
        assert!(!damping.is_stuck());

        for _ in 0..20 {
            damping.reject_step();
        }
        assert!(damping.is_stuck());
    }

    #[test]
    fn test_recovers_ground_truth() {
        let (map, field) = room();
        let truth = Pose4::new(0.3, -0.2, 1.0, 0.4);
        let scan = sample_scan(&map, &truth, 13, 1.0, 1.0e4);
        let solver = LmSolver::default();

        let result = solver.solve(&field, &scan, offset_prior(&truth), None);
        assert!(result.status.is_usable(), "status {:?}", result.status);
        assert!(result.pose.translation_distance(&truth) < 0.2);
        assert!(result.pose.yaw_distance(&truth) < 1f64.to_radians());
        assert!(result.final_cost <= result.initial_cost);
    }

    #[test]
    fn test_converged_cost_never_increases() {
        let (map, field) = room();
        let truth = Pose4::new(-0.4, 0.3, 0.8, -0.2);
        let scan = sample_scan(&map, &truth, 17, 1.0, 1.0e4);
        let solver = LmSolver::default();

        for prior in [truth, offset_prior(&truth), Pose4::new(-0.3, 0.3, 0.85, -0.15)] {
            let result = solver.solve(&field, &scan, prior, None);
            if result.status.is_converged() {
                assert!(result.final_cost <= result.initial_cost);
            }
        }
    }

    #[test]
    fn test_identical_inputs_give_identical_outputs() {
        let (map, field) = room();
        let truth = Pose4::new(0.1, 0.1, 1.2, 0.1);
        let scan = sample_scan(&map, &truth, 11, 1.0, 1.0e4);
        let solver = LmSolver::default();
        let prior = offset_prior(&truth);

        let a = solver.solve(&field, &scan, prior, None);
        let b = solver.solve(&field, &scan, prior, None);
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_few_points_returns_prior() {
        let (_, field) = room();
        let prior = Pose4::new(0.1, 0.2, 1.0, 0.3);
        let scan = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.5, 0.5, 0.5]];

        let result = LmSolver::default().solve(&field, &scan, prior, None);
        assert_eq!(result.status, SolveStatus::Underdetermined);
        assert_eq!(result.pose, prior);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.num_points, 3);
    }

    #[test]
    fn test_out_of_grid_points_do_not_count() {
        let (_, field) = room();
        let prior = Pose4::default();
        let scan: Vec<[f32; 3]> = (0..100).map(|i| [50.0 + i as f32, 0.0, 0.0]).collect();

        let result = LmSolver::default().solve(&field, &scan, prior, None);
        assert_eq!(result.status, SolveStatus::Underdetermined);
        assert_eq!(result.num_points, 0);
    }

    #[test]
    fn test_cancel_before_first_iteration() {
        let (map, field) = room();
        let truth = Pose4::new(0.0, 0.0, 1.0, 0.0);
        let scan = sample_scan(&map, &truth, 13, 1.0, 1.0e4);
        let prior = offset_prior(&truth);
        let cancel = AtomicBool::new(true);

        let result = LmSolver::default().solve(&field, &scan, prior, Some(&cancel));
        assert_eq!(result.status, SolveStatus::Cancelled);
        assert_eq!(result.pose, prior.normalized());
        assert_eq!(result.iterations, 0);
    }

    #[test]
    fn test_iteration_cap() {
        let (map, field) = room();
        let truth = Pose4::new(0.2, 0.0, 1.0, 0.0);
        let scan = sample_scan(&map, &truth, 13, 1.0, 1.0e4);
        let solver = LmSolver::new(SolverConfig {
            max_iterations: 1,
            ..Default::default()
        });

        let result = solver.solve(&field, &scan, offset_prior(&truth), None);
        assert_eq!(result.status, SolveStatus::MaxIterations);
        assert_eq!(result.iterations, 1);
        assert!(result.final_cost < result.initial_cost);
    }

    #[test]
    fn test_flat_field_reports_singular() {
        // Constant distance: every residual is 1 and every gradient is zero.
        let geometry = GridGeometry {
            origin: [0.0; 3],
            resolution: 0.1,
            dims: [20, 20, 20],
            max_distance: 2.0,
        };
        let grid = DistanceGrid::from_cells(geometry, vec![1.0; geometry.cell_count()]).unwrap();
        let field = TrilinearField::new(grid);
        let scan: Vec<[f32; 3]> = (0..20)
            .map(|i| [0.2 + 0.05 * i as f32, 0.3 + 0.02 * i as f32, 0.4])
            .collect();
        let prior = Pose4::new(0.5, 0.5, 0.5, 0.1);

        let result = LmSolver::default().solve(&field, &scan, prior, None);
        assert_eq!(result.status, SolveStatus::SingularHessian);
        assert_eq!(result.pose, prior);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.num_points, scan.len());
        assert_relative_eq!(result.final_cost, result.initial_cost);
    }
}

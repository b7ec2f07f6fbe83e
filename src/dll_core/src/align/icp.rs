//! Point-to-plane ICP against the map cloud.
//!
//! Map normals are fitted once, from the neighborhood of every map point.
//!
//! ```text
//! repeat:
//!   a. transform the scan with the current pose
//!   b. nearest map point for each scan point (KD-tree); drop pairs beyond
//!      max_correspondence_distance, pairs whose map point has no normal,
//!      and the worst outlier_ratio fraction by |residual|
//!   c. Gauss-Newton on r = n·(q - m) for (dx, dy, dz, dyaw), the yaw
//!      increment taken about the current position
//!   d. apply, stop when both increments are below epsilon
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{Matrix4, Vector3, Vector4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AlignMethod, Aligner};
use crate::error::AlignError;
use crate::optimization::newton::{condition_number, damped_step};
use crate::optimization::{Pose4, SolveResult, SolveStatus};
use crate::voxel_grid::{PointMoments, PointSearch};

/// Systems worse conditioned than this leave a direction unobserved.
const MAX_CONDITION_NUMBER: f64 = 1e8;

/// ICP backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    pub max_iterations: usize,
    /// Translation increment below which the run has converged (meters).
    pub translation_epsilon: f64,
    /// Yaw increment below which the run has converged (radians).
    pub rotation_epsilon: f64,
    /// Pairs farther apart than this are discarded (meters).
    pub max_correspondence_distance: f32,
    pub min_correspondences: usize,
    /// Fraction of the worst pairs dropped each iteration.
    pub outlier_ratio: f32,
    /// Neighborhood radius for map normals (meters).
    pub normal_radius: f32,
    /// Closest neighbors used per normal.
    pub normal_neighbors: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            translation_epsilon: 1e-3,
            rotation_epsilon: 1e-3,
            max_correspondence_distance: 0.5,
            min_correspondences: 10,
            outlier_ratio: 0.1,
            normal_radius: 0.2,
            normal_neighbors: 20,
        }
    }
}

/// One scan-to-map pair.
#[derive(Debug, Clone, Copy)]
struct Correspondence {
    /// Scan point transformed by the current pose.
    source: Vector3<f64>,
    target: Vector3<f64>,
    normal: Vector3<f64>,
}

impl Correspondence {
    fn residual(&self) -> f64 {
        self.normal.dot(&(self.source - self.target))
    }
}

/// ICP aligner owning the map cloud, its KD-tree and per-point normals.
#[derive(Debug)]
pub struct IcpAligner {
    config: IcpConfig,
    map: Vec<[f32; 3]>,
    normals: Vec<Option<Vector3<f64>>>,
    search: PointSearch,
}

impl IcpAligner {
    pub fn new(map: &[[f32; 3]], config: IcpConfig) -> Result<Self, AlignError> {
        let map: Vec<[f32; 3]> = map
            .iter()
            .filter(|p| p.iter().all(|v| v.is_finite()))
            .copied()
            .collect();
        let search = PointSearch::from_points(&map).ok_or(AlignError::EmptyMap("points"))?;

        let normals: Vec<Option<Vector3<f64>>> = map
            .par_iter()
            .map(|p| {
                let neighbors = search.within(p, config.normal_radius);
                PointMoments::from_points(
                    neighbors
                        .iter()
                        .take(config.normal_neighbors)
                        .map(|&idx| &map[idx]),
                )
                .normal()
            })
            .collect();
        let missing = normals.iter().filter(|n| n.is_none()).count();
        debug!(
            "ICP map: {} points, {} without a normal",
            map.len(),
            missing
        );

        Ok(Self {
            config,
            map,
            normals,
            search,
        })
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    fn find_correspondences(&self, points: &[[f32; 3]], pose: &Pose4) -> Vec<Correspondence> {
        let max_dist_sq = self.config.max_correspondence_distance.powi(2);
        let mut pairs: Vec<Correspondence> = points
            .par_iter()
            .filter_map(|p| {
                let [x, y, z] = pose.transform_point(p);
                let query = [x as f32, y as f32, z as f32];
                let (idx, dist_sq) = self.search.nearest(&query);
                if dist_sq > max_dist_sq {
                    return None;
                }
                let normal = self.normals[idx]?;
                let t = self.map[idx];
                Some(Correspondence {
                    source: Vector3::new(x, y, z),
                    target: Vector3::new(t[0] as f64, t[1] as f64, t[2] as f64),
                    normal,
                })
            })
            .collect();

        if self.config.outlier_ratio > 0.0 && !pairs.is_empty() {
            pairs.sort_by(|a, b| a.residual().abs().total_cmp(&b.residual().abs()));
            let keep = ((1.0 - self.config.outlier_ratio) * pairs.len() as f32) as usize;
            pairs.truncate(keep.max(self.config.min_correspondences));
        }
        pairs
    }
}

/// `(JᵀJ, Jᵀr)` of the point-to-plane residuals, yaw taken about `pivot`.
fn normal_equations(pairs: &[Correspondence], pivot: [f64; 2]) -> (Matrix4<f64>, Vector4<f64>) {
    let mut jtj = Matrix4::zeros();
    let mut jtr = Vector4::zeros();
    for pair in pairs {
        let n = pair.normal;
        let lever_x = pair.source.x - pivot[0];
        let lever_y = pair.source.y - pivot[1];
        let jacobian = Vector4::new(n.x, n.y, n.z, n.y * lever_x - n.x * lever_y);
        jtj += jacobian * jacobian.transpose();
        jtr += jacobian * pair.residual();
    }
    (jtj, jtr)
}

/// Gauss-Newton increment `(dx, dy, dz, dyaw)`; `None` when a direction is
/// not constrained by the pairs.
fn compute_increment(pairs: &[Correspondence], pivot: [f64; 2]) -> Option<Vector4<f64>> {
    let (jtj, jtr) = normal_equations(pairs, pivot);
    if condition_number(&jtj) > MAX_CONDITION_NUMBER {
        return None;
    }
    damped_step(&jtj, &jtr, 0.0)
}

fn mean_squared_error(pairs: &[Correspondence]) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    pairs.iter().map(|p| p.residual().powi(2)).sum::<f64>() / pairs.len() as f64
}

impl Aligner for IcpAligner {
    fn method(&self) -> AlignMethod {
        AlignMethod::Icp
    }

    fn align(&self, points: &[[f32; 3]], prior: Pose4, cancel: Option<&AtomicBool>) -> SolveResult {
        let config = &self.config;
        let mut pose = prior;
        let mut initial_cost = None;
        let mut last_cost = 0.0;
        let mut last_pairs = 0;

        let finish = |pose: Pose4, status, initial: Option<f64>, cost: f64, iterations, n| {
            SolveResult {
                pose: pose.normalized(),
                status,
                initial_cost: initial.unwrap_or(cost),
                final_cost: cost,
                iterations,
                num_points: n,
            }
        };

        for iteration in 0..config.max_iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return finish(pose, SolveStatus::Cancelled, initial_cost, last_cost, iteration, last_pairs);
            }

            let pairs = self.find_correspondences(points, &pose);
            if pairs.len() < config.min_correspondences {
                debug!(
                    "ICP: {} correspondences at iteration {iteration}, need {}",
                    pairs.len(),
                    config.min_correspondences
                );
                if iteration == 0 {
                    return SolveResult::unchanged(
                        prior,
                        SolveStatus::Underdetermined,
                        mean_squared_error(&pairs),
                        pairs.len(),
                    );
                }
                return finish(pose, SolveStatus::Diverged, initial_cost, last_cost, iteration, pairs.len());
            }
            last_cost = mean_squared_error(&pairs);
            last_pairs = pairs.len();
            initial_cost.get_or_insert(last_cost);

            let Some(delta) = compute_increment(&pairs, [pose.x, pose.y]) else {
                debug!("ICP: degenerate normal equations at iteration {iteration}");
                if iteration == 0 {
                    return SolveResult::unchanged(prior, SolveStatus::SingularHessian, last_cost, last_pairs);
                }
                return finish(pose, SolveStatus::SingularHessian, initial_cost, last_cost, iteration, last_pairs);
            };

            pose = pose.apply_delta(&delta, 1.0);

            let translation_change = delta.fixed_rows::<3>(0).norm();
            if translation_change < config.translation_epsilon && delta[3].abs() < config.rotation_epsilon {
                return finish(pose, SolveStatus::Converged, initial_cost, last_cost, iteration + 1, last_pairs);
            }
        }

        finish(pose, SolveStatus::MaxIterations, initial_cost, last_cost, config.max_iterations, last_pairs)
    }
}

//! NDT score, gradient and Hessian over a voxel map.
//!
//! With `x = T(θ)·p − μ` and point Jacobian `J = ∂T/∂θ` (3×4):
//!
//! - score:    `-d1 · e`, `e = exp(-d2/2 · xᵀΣ⁻¹x)`
//! - gradient: `d1·d2·e · xᵀΣ⁻¹J_i`
//! - Hessian:  `d1·d2·e · (-d2·(xᵀΣ⁻¹J_i)(xᵀΣ⁻¹J_j) + xᵀΣ⁻¹∂²T_ij + J_jᵀΣ⁻¹J_i)`
//!
//! The score is maximized. Only `∂²T/∂yaw²` is non-zero.

use nalgebra::{Matrix3, Matrix3x4, Vector3, Vector4};
use rayon::prelude::*;

use super::types::{AggregatedDerivatives, DerivativeResult, GaussianParams};
use crate::optimization::Pose4;
use crate::voxel_grid::VoxelGrid;

/// First and second derivatives of the transformed point.
#[derive(Debug, Clone)]
pub struct PointDerivatives {
    /// Columns `[∂/∂tx, ∂/∂ty, ∂/∂tz, ∂/∂yaw]`.
    pub jacobian: Matrix3x4<f64>,
    /// `∂²T/∂yaw²`.
    pub yaw_yaw: Vector3<f64>,
}

impl PointDerivatives {
    pub fn new(point: &[f32; 3], yaw: f64) -> Self {
        let (sy, cy) = yaw.sin_cos();
        let (x, y) = (point[0] as f64, point[1] as f64);
        let mut jacobian = Matrix3x4::zeros();
        jacobian[(0, 0)] = 1.0;
        jacobian[(1, 1)] = 1.0;
        jacobian[(2, 2)] = 1.0;
        jacobian[(0, 3)] = -sy * x - cy * y;
        jacobian[(1, 3)] = cy * x - sy * y;

        Self {
            jacobian,
            yaw_yaw: Vector3::new(-cy * x + sy * y, -sy * x - cy * y, 0.0),
        }
    }
}

/// Contribution of one point-voxel pair.
///
/// `x_trans` is the transformed point minus the voxel mean.
pub fn compute_derivative_single(
    x_trans: &Vector3<f64>,
    inv_covariance: &Matrix3<f64>,
    point: &PointDerivatives,
    gauss: &GaussianParams,
) -> DerivativeResult {
    let c_inv_x = inv_covariance * x_trans;
    let x_c_inv_x = x_trans.dot(&c_inv_x);

    let e_raw = (-gauss.d2 * x_c_inv_x * 0.5).exp();
    let score = -gauss.d1 * e_raw;

    let mut e_scaled = gauss.d2 * e_raw;
    if !(0.0..=1.0).contains(&e_scaled) || !e_scaled.is_finite() {
        return DerivativeResult::zeros();
    }
    e_scaled *= gauss.d1;

    // xᵀΣ⁻¹J (1×4), Σ symmetric.
    let x_c_inv_j: Vector4<f64> = point.jacobian.transpose() * c_inv_x;
    let gradient = x_c_inv_j * e_scaled;

    let jt_c_inv_j = point.jacobian.transpose() * inv_covariance * point.jacobian;
    let mut hessian = jt_c_inv_j - x_c_inv_j * x_c_inv_j.transpose() * gauss.d2;
    hessian[(3, 3)] += c_inv_x.dot(&point.yaw_yaw);
    hessian *= e_scaled;

    DerivativeResult {
        score,
        gradient,
        hessian,
    }
}

/// Score, gradient and Hessian of a scan at `pose`.
///
/// Each point is matched against every voxel whose mean lies within one
/// voxel resolution of the transformed point. Per-point sums run in
/// parallel; the final reduction is sequential in point order.
pub fn compute_derivatives(
    source_points: &[[f32; 3]],
    target_grid: &VoxelGrid,
    pose: &Pose4,
    gauss: &GaussianParams,
) -> AggregatedDerivatives {
    let radius = target_grid.resolution();

    let per_point: Vec<(DerivativeResult, usize)> = source_points
        .par_iter()
        .map(|p| {
            let t = pose.transform_point(p);
            let t32 = [t[0] as f32, t[1] as f32, t[2] as f32];
            let nearby = target_grid.radius_search(&t32, radius);
            if nearby.is_empty() {
                return (DerivativeResult::zeros(), 0);
            }

            let derivs = PointDerivatives::new(p, pose.yaw);
            let transformed = Vector3::new(t[0], t[1], t[2]);
            let mut sum = DerivativeResult::zeros();
            for voxel in &nearby {
                let x_trans = transformed - voxel.mean;
                let single = compute_derivative_single(
                    &x_trans,
                    &voxel.inv_covariance,
                    &derivs,
                    gauss,
                );
                sum.accumulate(&single);
            }
            (sum, nearby.len())
        })
        .collect();

    let mut result = AggregatedDerivatives::zeros();
    for (sum, count) in &per_point {
        result.score += sum.score;
        result.gradient += sum.gradient;
        result.hessian += sum.hessian;
        result.num_correspondences += count;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_room_pcd;
    use crate::voxel_grid::VoxelGridConfig;
    use approx::assert_relative_eq;

    fn pair_score(point: &[f32; 3], pose: &Pose4, mean: &Vector3<f64>, inv: &Matrix3<f64>) -> DerivativeResult {
        let t = pose.transform_point(point);
        let x = Vector3::new(t[0], t[1], t[2]) - mean;
        compute_derivative_single(&x, inv, &PointDerivatives::new(point, pose.yaw), &GaussianParams::default())
    }

    fn fixture() -> ([f32; 3], Pose4, Vector3<f64>, Matrix3<f64>) {
        let point = [0.8f32, -0.4, 0.3];
        let pose = Pose4::new(0.1, 0.2, -0.05, 0.35);
        let mean = Vector3::new(0.95, 0.15, 0.2);
        let inv = Matrix3::new(4.0, 0.5, 0.1, 0.5, 2.0, 0.3, 0.1, 0.3, 8.0);
        (point, pose, mean, inv)
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let (point, pose, mean, inv) = fixture();
        let analytic = pair_score(&point, &pose, &mean, &inv);
        let h = 1e-6;

        for k in 0..4 {
            let mut delta = Vector4::zeros();
            delta[k] = h;
            let plus = pair_score(&point, &pose.apply_delta(&delta, 1.0), &mean, &inv).score;
            let minus = pair_score(&point, &pose.apply_delta(&delta, -1.0), &mean, &inv).score;
            assert_relative_eq!(analytic.gradient[k], (plus - minus) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_hessian_matches_finite_difference() {
        let (point, pose, mean, inv) = fixture();
        let analytic = pair_score(&point, &pose, &mean, &inv);
        let h = 1e-6;

        for k in 0..4 {
            let mut delta = Vector4::zeros();
            delta[k] = h;
            let plus = pair_score(&point, &pose.apply_delta(&delta, 1.0), &mean, &inv).gradient;
            let minus = pair_score(&point, &pose.apply_delta(&delta, -1.0), &mean, &inv).gradient;
            let column = (plus - minus) / (2.0 * h);
            for i in 0..4 {
                assert_relative_eq!(analytic.hessian[(i, k)], column[i], epsilon = 1e-5);
            }
        }
        assert_relative_eq!(analytic.hessian, analytic.hessian.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_score_peaks_at_voxel_mean() {
        let inv = Matrix3::identity() * 4.0;
        let derivs = PointDerivatives::new(&[0.0, 0.0, 0.0], 0.0);
        let gauss = GaussianParams::default();

        let at_mean = compute_derivative_single(&Vector3::zeros(), &inv, &derivs, &gauss);
        let off = compute_derivative_single(&Vector3::new(0.3, 0.0, 0.0), &inv, &derivs, &gauss);
        assert!(at_mean.score > off.score);
        assert_relative_eq!(at_mean.score, -gauss.d1, epsilon = 1e-12);
        assert_eq!(at_mean.gradient, Vector4::zeros());
    }

    #[test]
    fn test_scan_derivatives_and_correspondences() {
        let map = make_room_pcd(6.0, 4.0, 2.5, 0.05);
        let grid = VoxelGrid::from_points(&map, VoxelGridConfig::default());
        let gauss = GaussianParams::new(1.0, 0.55);

        let scan: Vec<[f32; 3]> = map.iter().step_by(50).copied().collect();
        let result = compute_derivatives(&scan, &grid, &Pose4::default(), &gauss);
        assert!(result.num_correspondences >= scan.len());
        assert!(result.score > 0.0);

        let far = vec![[500.0f32, 500.0, 500.0]];
        let none = compute_derivatives(&far, &grid, &Pose4::default(), &gauss);
        assert_eq!(none.num_correspondences, 0);
        assert_eq!(none.score, 0.0);
    }

    #[test]
    fn test_scan_derivatives_are_deterministic() {
        let map = make_room_pcd(4.0, 3.0, 2.5, 0.1);
        let grid = VoxelGrid::from_points(&map, VoxelGridConfig::default());
        let gauss = GaussianParams::default();
        let scan: Vec<[f32; 3]> = map.iter().step_by(9).copied().collect();
        let pose = Pose4::new(0.05, -0.02, 0.01, 0.03);

        let first = compute_derivatives(&scan, &grid, &pose, &gauss);
        for _ in 0..3 {
            assert_eq!(compute_derivatives(&scan, &grid, &pose, &gauss), first);
        }
    }
}

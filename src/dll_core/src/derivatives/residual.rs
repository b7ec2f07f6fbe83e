//! Residuals `r_i = D(T(θ)·p_i)` and their 4-DoF Jacobian.
//!
//! For `θ = (tx, ty, tz, yaw)` and gradient `(Dx, Dy, Dz)` at the transformed
//! point, one Jacobian row is
//!
//! ```text
//! [ Dx,  Dy,  Dz,  Dx·(−sy·x − cy·y) + Dy·(cy·x − sy·y) ]
//! ```
//!
//! Points that land outside the grid get a zero residual and a zero row.

use nalgebra::{Matrix4, Vector4};
use rayon::prelude::*;

use crate::interpolation::TrilinearField;
use crate::optimization::Pose4;

/// Residual and Jacobian row of one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualRow {
    pub residual: f64,
    pub jacobian: [f64; 4],
    /// Whether the transformed point fell inside the grid.
    pub in_grid: bool,
}

impl ResidualRow {
    const OUTSIDE: Self = Self {
        residual: 0.0,
        jacobian: [0.0; 4],
        in_grid: false,
    };
}

/// Gauss-Newton system accumulated over all rows.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalEquations {
    /// `JᵀJ`
    pub jtj: Matrix4<f64>,
    /// `Jᵀr`
    pub jtr: Vector4<f64>,
    /// `½·Σ r_i²`
    pub cost: f64,
    pub in_grid: usize,
}

/// Evaluate one point.
#[inline]
pub fn residual_row(field: &TrilinearField, point: &[f32; 3], pose: &Pose4) -> ResidualRow {
    let transformed = pose.transform_point(point);
    let Some(sample) = field.try_eval(&transformed) else {
        return ResidualRow::OUTSIDE;
    };

    let (sy, cy) = pose.yaw.sin_cos();
    let (x, y) = (point[0] as f64, point[1] as f64);
    let [dx, dy, dz] = sample.gradient;
    let d_yaw = dx * (-sy * x - cy * y) + dy * (cy * x - sy * y);

    ResidualRow {
        residual: sample.distance,
        jacobian: [dx, dy, dz, d_yaw],
        in_grid: true,
    }
}

/// Residual block over a fixed point set.
pub struct ResidualBlock<'a> {
    field: &'a TrilinearField,
    points: &'a [[f32; 3]],
}

impl<'a> ResidualBlock<'a> {
    pub fn new(field: &'a TrilinearField, points: &'a [[f32; 3]]) -> Self {
        Self { field, points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All rows in point order.
    pub fn rows(&self, pose: &Pose4) -> Vec<ResidualRow> {
        self.points
            .par_iter()
            .map(|p| residual_row(self.field, p, pose))
            .collect()
    }

    /// Residual vector `r`.
    pub fn residuals(&self, pose: &Pose4) -> Vec<f64> {
        self.rows(pose).iter().map(|row| row.residual).collect()
    }

    /// `N×4` Jacobian, one row per point.
    pub fn jacobian(&self, pose: &Pose4) -> Vec<[f64; 4]> {
        self.rows(pose).iter().map(|row| row.jacobian).collect()
    }

    /// `½·Σ r_i²` and the number of in-grid points.
    pub fn cost(&self, pose: &Pose4) -> (f64, usize) {
        let rows = self.rows(pose);
        let mut cost = 0.0;
        let mut in_grid = 0;
        for row in &rows {
            cost += row.residual * row.residual;
            in_grid += row.in_grid as usize;
        }
        (0.5 * cost, in_grid)
    }

    /// Accumulate `JᵀJ`, `Jᵀr` and the cost.
    ///
    /// Rows are evaluated in parallel and summed sequentially in point order,
    /// so equal inputs give bit-identical systems.
    pub fn normal_equations(&self, pose: &Pose4) -> NormalEquations {
        let rows = self.rows(pose);
        let mut jtj = Matrix4::zeros();
        let mut jtr = Vector4::zeros();
        let mut cost = 0.0;
        let mut in_grid = 0;

        for row in rows.iter().filter(|row| row.in_grid) {
            let j = Vector4::from(row.jacobian);
            jtj += j * j.transpose();
            jtr += j * row.residual;
            cost += row.residual * row.residual;
            in_grid += 1;
        }

        NormalEquations {
            jtj,
            jtr,
            cost: 0.5 * cost,
            in_grid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{DistanceGrid, GridConfig};
    use crate::test_utils::make_room_pcd;
    use approx::assert_relative_eq;

    fn room_field() -> TrilinearField {
        let map = make_room_pcd(4.0, 3.0, 2.5, 0.05);
        let config = GridConfig {
            resolution: 0.1,
            max_distance: 1.0,
            margin: 0.5,
        };
        TrilinearField::new(DistanceGrid::from_points(&map, &config).unwrap())
    }

    #[test]
    fn test_jacobian_matches_finite_difference() {
        let field = room_field();
        let pose = Pose4::new(0.13, -0.07, 0.02, 0.3);
        let points = [[1.23f32, 0.41, 0.37], [-0.6, 0.9, 1.11], [0.35, -1.1, -0.4]];
        let h = 1e-6;

        for p in &points {
            let row = residual_row(&field, p, &pose);
            assert!(row.in_grid);
            for k in 0..4 {
                let mut delta = Vector4::zeros();
                delta[k] = h;
                let plus = residual_row(&field, p, &pose.apply_delta(&delta, 1.0)).residual;
                let minus = residual_row(&field, p, &pose.apply_delta(&delta, -1.0)).residual;
                let numeric = (plus - minus) / (2.0 * h);
                assert_relative_eq!(row.jacobian[k], numeric, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_out_of_grid_points_contribute_nothing() {
        let field = room_field();
        let pose = Pose4::default();
        let far = [[100.0f32, 0.0, 0.0], [0.0, -50.0, 0.0]];

        for p in &far {
            let row = residual_row(&field, p, &pose);
            assert_eq!(row, ResidualRow::OUTSIDE);
        }

        let block = ResidualBlock::new(&field, &far);
        let system = block.normal_equations(&pose);
        assert_eq!(system.in_grid, 0);
        assert_eq!(system.cost, 0.0);
        assert_eq!(system.jtj, Matrix4::zeros());
        assert_eq!(block.residuals(&pose), vec![0.0, 0.0]);
        assert_eq!(block.jacobian(&pose), vec![[0.0; 4]; 2]);
    }

    #[test]
    fn test_normal_equations_match_rows() {
        let field = room_field();
        let pose = Pose4::new(0.05, 0.05, 0.0, 0.02);
        let points: Vec<[f32; 3]> = (0..40)
            .map(|i| {
                let a = i as f32 * 0.157;
                [1.5 * a.cos(), 1.2 * a.sin(), 0.1 * (i % 7) as f32]
            })
            .collect();
        let block = ResidualBlock::new(&field, &points);

        let residuals = block.residuals(&pose);
        let jacobian = block.jacobian(&pose);
        let system = block.normal_equations(&pose);

        let mut jtr = Vector4::zeros();
        for (r, j) in residuals.iter().zip(&jacobian) {
            jtr += Vector4::from(*j) * *r;
        }
        assert_relative_eq!(system.jtr, jtr, epsilon = 1e-12);

        let cost: f64 = 0.5 * residuals.iter().map(|r| r * r).sum::<f64>();
        assert_relative_eq!(system.cost, cost, epsilon = 1e-12);
        assert_eq!(block.cost(&pose).1, system.in_grid);
    }

    #[test]
    fn test_normal_equations_are_deterministic() {
        let field = room_field();
        let pose = Pose4::new(0.1, -0.1, 0.05, -0.04);
        let points: Vec<[f32; 3]> = (0..500)
            .map(|i| {
                let a = i as f32 * 0.0125;
                [1.9 * a.cos(), 1.4 * a.sin(), -1.0 + 0.004 * i as f32]
            })
            .collect();
        let block = ResidualBlock::new(&field, &points);

        let first = block.normal_equations(&pose);
        for _ in 0..5 {
            assert_eq!(block.normal_equations(&pose), first);
        }
    }
}

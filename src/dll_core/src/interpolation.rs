//! Trilinear distance field over a [`DistanceGrid`].
//!
//! Every cell caches the eight coefficients of
//!
//! `D = c0 + c1·Δx + c2·Δy + c3·Δz + c4·ΔxΔy + c5·ΔxΔz + c6·ΔyΔz + c7·ΔxΔyΔz`
//!
//! with `Δ = (p − corner) / r ∈ [0, 1)`, so both the value and the gradient
//! are a handful of multiply-adds on the hot path.
//!
//! Border policy: a corner that falls outside the grid reads `max_distance`,
//! the same value [`DistanceGrid::distance_at_cell`] reports out of range.

use rayon::prelude::*;

use crate::grid::{DistanceGrid, GridGeometry};

/// Polynomial coefficients of one cell.
pub type CellCoefficients = [f64; 8];

/// Interpolated distance and its spatial gradient (per meter).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceSample {
    pub distance: f64,
    pub gradient: [f64; 3],
}

/// Smooth, differentiable distance field built from a grid.
#[derive(Debug, Clone)]
pub struct TrilinearField {
    grid: DistanceGrid,
    coefficients: Vec<CellCoefficients>,
    inv_resolution: f64,
}

impl TrilinearField {
    /// Compute coefficients for every cell. The grid is immutable afterwards.
    pub fn new(grid: DistanceGrid) -> Self {
        let geometry = *grid.geometry();
        let coefficients: Vec<CellCoefficients> = (0..grid.len())
            .into_par_iter()
            .map(|idx| {
                let [ix, iy, iz] = geometry.cell_of_index(idx);
                cell_coefficients(&grid, ix, iy, iz)
            })
            .collect();

        Self {
            inv_resolution: 1.0 / geometry.resolution,
            grid,
            coefficients,
        }
    }

    pub fn grid(&self) -> &DistanceGrid {
        &self.grid
    }

    pub fn geometry(&self) -> &GridGeometry {
        self.grid.geometry()
    }

    /// One coefficient record per cell, same order as the cells.
    pub fn coefficients(&self) -> &[CellCoefficients] {
        &self.coefficients
    }

    /// Evaluate at a world point. Outside the grid: `(max_distance, 0, 0, 0)`.
    #[inline]
    pub fn eval(&self, point: &[f64; 3]) -> DistanceSample {
        self.try_eval(point).unwrap_or(DistanceSample {
            distance: self.grid.max_distance(),
            gradient: [0.0; 3],
        })
    }

    /// Evaluate at a world point, `None` when it lies outside the grid.
    #[inline]
    pub fn try_eval(&self, point: &[f64; 3]) -> Option<DistanceSample> {
        let g = self.grid.geometry();
        let fx = (point[0] - g.origin[0]) * self.inv_resolution;
        let fy = (point[1] - g.origin[1]) * self.inv_resolution;
        let fz = (point[2] - g.origin[2]) * self.inv_resolution;
        if !(fx.is_finite() && fy.is_finite() && fz.is_finite()) {
            return None;
        }

        let (ix, iy, iz) = (fx.floor(), fy.floor(), fz.floor());
        let idx = g.index(ix as i64, iy as i64, iz as i64)?;
        let c = &self.coefficients[idx];
        let (dx, dy, dz) = (fx - ix, fy - iy, fz - iz);

        let distance = c[0]
            + c[1] * dx
            + c[2] * dy
            + c[3] * dz
            + c[4] * dx * dy
            + c[5] * dx * dz
            + c[6] * dy * dz
            + c[7] * dx * dy * dz;
        let gx = c[1] + c[4] * dy + c[5] * dz + c[7] * dy * dz;
        let gy = c[2] + c[4] * dx + c[6] * dz + c[7] * dx * dz;
        let gz = c[3] + c[5] * dx + c[6] * dy + c[7] * dx * dy;

        Some(DistanceSample {
            distance,
            gradient: [
                gx * self.inv_resolution,
                gy * self.inv_resolution,
                gz * self.inv_resolution,
            ],
        })
    }
}

/// Evaluate a coefficient record at normalized local coordinates.
#[inline]
pub fn eval_coefficients(c: &CellCoefficients, dx: f64, dy: f64, dz: f64) -> f64 {
    c[0] + c[1] * dx
        + c[2] * dy
        + c[3] * dz
        + c[4] * dx * dy
        + c[5] * dx * dz
        + c[6] * dy * dz
        + c[7] * dx * dy * dz
}

fn cell_coefficients(grid: &DistanceGrid, ix: i64, iy: i64, iz: i64) -> CellCoefficients {
    let v = |dx: i64, dy: i64, dz: i64| grid.distance_at_cell(ix + dx, iy + dy, iz + dz) as f64;
    let v000 = v(0, 0, 0);
    let v100 = v(1, 0, 0);
    let v010 = v(0, 1, 0);
    let v001 = v(0, 0, 1);
    let v110 = v(1, 1, 0);
    let v101 = v(1, 0, 1);
    let v011 = v(0, 1, 1);
    let v111 = v(1, 1, 1);

    [
        v000,
        v100 - v000,
        v010 - v000,
        v001 - v000,
        v110 - v010 - v100 + v000,
        v101 - v001 - v100 + v000,
        v011 - v001 - v010 + v000,
        v111 - v011 - v101 - v110 + v100 + v010 + v001 - v000,
    ]
}

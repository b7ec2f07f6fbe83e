//! Type definitions for the distance grid.

use serde::{Deserialize, Serialize};

use crate::error::GridError;

/// Configuration for building a distance grid from a map cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Cell side length in meters.
    pub resolution: f64,
    /// Distances are clamped above at this value (meters).
    pub max_distance: f64,
    /// Padding added around the map bounding box (meters).
    pub margin: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution: 0.05,
            max_distance: 1.0,
            margin: 1.0,
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), GridError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(GridError::InvalidGeometry(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !(self.max_distance.is_finite() && self.max_distance > 0.0) {
            return Err(GridError::InvalidGeometry(format!(
                "max_distance must be positive, got {}",
                self.max_distance
            )));
        }
        if !(self.margin.is_finite() && self.margin >= 0.0) {
            return Err(GridError::InvalidGeometry(format!(
                "margin must be non-negative, got {}",
                self.margin
            )));
        }
        Ok(())
    }
}

/// Placement and extent of a distance grid.
///
/// Cell `(ix, iy, iz)` is sampled at `origin + (ix, iy, iz) * resolution`,
/// which is also the lower corner of the interpolation cell it anchors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridGeometry {
    /// World position of cell (0, 0, 0).
    pub origin: [f64; 3],
    /// Cell side length in meters.
    pub resolution: f64,
    /// Number of cells along x, y, z.
    pub dims: [u32; 3],
    /// Value reported for every query outside the grid.
    pub max_distance: f64,
}

impl GridGeometry {
    pub fn validate(&self) -> Result<(), GridError> {
        if self.dims.iter().any(|&d| d == 0) {
            return Err(GridError::InvalidGeometry(format!(
                "dimensions must be non-zero, got {:?}",
                self.dims
            )));
        }
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(GridError::InvalidGeometry(format!(
                "resolution must be positive, got {}",
                self.resolution
            )));
        }
        if !(self.max_distance.is_finite() && self.max_distance > 0.0) {
            return Err(GridError::InvalidGeometry(format!(
                "max_distance must be positive, got {}",
                self.max_distance
            )));
        }
        if self.origin.iter().any(|v| !v.is_finite()) {
            return Err(GridError::InvalidGeometry(format!(
                "origin must be finite, got {:?}",
                self.origin
            )));
        }
        if self.cell_count_checked().is_none() {
            return Err(GridError::InvalidGeometry(format!(
                "cell count overflows for dimensions {:?}",
                self.dims
            )));
        }
        Ok(())
    }

    /// Total number of cells.
    pub fn cell_count(&self) -> usize {
        self.dims[0] as usize * self.dims[1] as usize * self.dims[2] as usize
    }

    fn cell_count_checked(&self) -> Option<usize> {
        (self.dims[0] as usize)
            .checked_mul(self.dims[1] as usize)?
            .checked_mul(self.dims[2] as usize)
    }

    /// Linear index of a cell, x-fastest. `None` outside the grid.
    #[inline]
    pub fn index(&self, ix: i64, iy: i64, iz: i64) -> Option<usize> {
        let [nx, ny, nz] = self.dims;
        if ix < 0 || iy < 0 || iz < 0 || ix >= nx as i64 || iy >= ny as i64 || iz >= nz as i64 {
            return None;
        }
        Some(ix as usize + nx as usize * (iy as usize + ny as usize * iz as usize))
    }

    /// Inverse of [`GridGeometry::index`].
    #[inline]
    pub fn cell_of_index(&self, index: usize) -> [i64; 3] {
        let nx = self.dims[0] as usize;
        let ny = self.dims[1] as usize;
        let ix = index % nx;
        let iy = (index / nx) % ny;
        let iz = index / (nx * ny);
        [ix as i64, iy as i64, iz as i64]
    }

    /// World position sampled by a cell.
    #[inline]
    pub fn cell_position(&self, ix: i64, iy: i64, iz: i64) -> [f64; 3] {
        [
            self.origin[0] + ix as f64 * self.resolution,
            self.origin[1] + iy as f64 * self.resolution,
            self.origin[2] + iz as f64 * self.resolution,
        ]
    }

    /// Integer cell containing a world point (floor of `(p - origin) / r`).
    #[inline]
    pub fn cell_of_point(&self, point: &[f64; 3]) -> [i64; 3] {
        let inv = 1.0 / self.resolution;
        [
            ((point[0] - self.origin[0]) * inv).floor() as i64,
            ((point[1] - self.origin[1]) * inv).floor() as i64,
            ((point[2] - self.origin[2]) * inv).floor() as i64,
        ]
    }

    /// Upper corner of the sampled volume.
    pub fn max_corner(&self) -> [f64; 3] {
        self.cell_position(
            self.dims[0] as i64 - 1,
            self.dims[1] as i64 - 1,
            self.dims[2] as i64 - 1,
        )
    }
}

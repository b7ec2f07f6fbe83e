//! Dense voxel distance grid.
//!
//! Each cell stores the Euclidean distance from its sample point to the
//! nearest map point, clamped above at `max_distance`. The grid is built
//! once from a map cloud (or loaded from a persisted file) and is read-only
//! afterwards.
//!
//! # Construction
//!
//! 1. Bounding box of the finite map points, padded by `margin`
//! 2. KD-tree over the map points
//! 3. One nearest-neighbor query per cell (parallel via rayon)

pub mod io;
pub mod types;

pub use types::{GridConfig, GridGeometry};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::GridError;
use crate::voxel_grid::search::PointSearch;

/// Uniform 3D lattice of clamped distances to the nearest map surface.
#[derive(Debug, Clone)]
pub struct DistanceGrid {
    geometry: GridGeometry,
    /// Distances, x-fastest.
    cells: Vec<f32>,
}

impl DistanceGrid {
    /// Build a grid from a map point cloud.
    ///
    /// Non-finite points are ignored. A map without finite points is an error.
    pub fn from_points(points: &[[f32; 3]], config: &GridConfig) -> Result<Self, GridError> {
        config.validate()?;

        let map: Vec<[f32; 3]> = points
            .iter()
            .copied()
            .filter(|p| p.iter().all(|v| v.is_finite()))
            .collect();
        let search = PointSearch::from_points(&map).ok_or(GridError::EmptyMap)?;

        let (min, max) = bounding_box(&map);
        let resolution = config.resolution;
        let origin = [
            min[0] - config.margin,
            min[1] - config.margin,
            min[2] - config.margin,
        ];
        let mut dims = [0u32; 3];
        for axis in 0..3 {
            let extent = max[axis] - min[axis] + 2.0 * config.margin;
            let cells = (extent / resolution).ceil() + 1.0;
            if cells > u32::MAX as f64 {
                return Err(GridError::InvalidGeometry(format!(
                    "axis {axis} needs {cells} cells at resolution {resolution}"
                )));
            }
            dims[axis] = cells as u32;
        }

        let geometry = GridGeometry {
            origin,
            resolution,
            dims,
            max_distance: config.max_distance,
        };
        geometry.validate()?;

        debug!(
            "Building distance grid {:?} cells ({} total) from {} map points",
            dims,
            geometry.cell_count(),
            map.len()
        );

        let max_distance = config.max_distance as f32;
        let cells: Vec<f32> = (0..geometry.cell_count())
            .into_par_iter()
            .map(|idx| {
                let [ix, iy, iz] = geometry.cell_of_index(idx);
                let p = geometry.cell_position(ix, iy, iz);
                let query = [p[0] as f32, p[1] as f32, p[2] as f32];
                let (_, dist_sq) = search.nearest(&query);
                dist_sq.sqrt().min(max_distance)
            })
            .collect();

        info!(
            "Distance grid built: {:?} cells, resolution {} m, max distance {} m",
            dims, resolution, config.max_distance
        );

        Ok(Self { geometry, cells })
    }

    /// Assemble a grid from raw cell values.
    ///
    /// Values are clamped to `[0, max_distance]`; non-finite values are rejected.
    pub fn from_cells(geometry: GridGeometry, mut cells: Vec<f32>) -> Result<Self, GridError> {
        geometry.validate()?;
        if cells.len() != geometry.cell_count() {
            return Err(GridError::InvalidGeometry(format!(
                "expected {} cells, got {}",
                geometry.cell_count(),
                cells.len()
            )));
        }
        let max_distance = geometry.max_distance as f32;
        for (idx, value) in cells.iter_mut().enumerate() {
            if !value.is_finite() {
                return Err(GridError::NonFinite(idx));
            }
            *value = value.clamp(0.0, max_distance);
        }
        Ok(Self { geometry, cells })
    }

    /// Distance stored at a cell, or `max_distance` outside the grid.
    #[inline]
    pub fn distance_at_cell(&self, ix: i64, iy: i64, iz: i64) -> f32 {
        match self.geometry.index(ix, iy, iz) {
            Some(idx) => self.cells[idx],
            None => self.geometry.max_distance as f32,
        }
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn origin(&self) -> [f64; 3] {
        self.geometry.origin
    }

    pub fn resolution(&self) -> f64 {
        self.geometry.resolution
    }

    pub fn dims(&self) -> [u32; 3] {
        self.geometry.dims
    }

    pub fn max_distance(&self) -> f64 {
        self.geometry.max_distance
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Raw cell values, x-fastest.
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }
}

fn bounding_box(points: &[[f32; 3]]) -> ([f64; 3], [f64; 3]) {
    let mut min = [f64::INFINITY; 3];
    let mut max = [f64::NEG_INFINITY; 3];
    for p in points {
        for axis in 0..3 {
            let v = p[axis] as f64;
            min[axis] = min[axis].min(v);
            max[axis] = max[axis].max(v);
        }
    }
    (min, max)
}

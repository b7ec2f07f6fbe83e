//! Numerical core of a 3D LiDAR localizer against a prebuilt map.
//!
//! A map cloud is turned into a dense distance grid once; scans are then
//! aligned to it by minimizing interpolated point-to-surface distances
//! over `(tx, ty, tz, yaw)`. Roll and pitch are removed from the scan
//! beforehand, so the problem has four degrees of freedom.
//!
//! # Architecture
//!
//! - Grid: nearest-map-point distance per cell, clamped at `max_distance`
//! - Interpolation: per-cell trilinear coefficients, value + gradient
//! - Residuals: `D(T(θ)·p)` and the 4-column Jacobian
//! - Solvers: Levenberg-Marquardt on the field, Newton on the NDT score,
//!   point-to-point ICP
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use dll_core::{build_aligner, AlignMethod, AlignerConfig, DistanceGrid, GridConfig, Pose4, TrilinearField};
//!
//! let grid = DistanceGrid::from_points(&map_points, &GridConfig::default())?;
//! let field = Arc::new(TrilinearField::new(grid));
//! let aligner = build_aligner(AlignMethod::DistanceField, field, None, &AlignerConfig::default())?;
//!
//! let result = aligner.align(&leveled_scan, Pose4::new(1.0, 2.0, 0.5, 0.3), None);
//! println!("{:?} after {} iterations", result.status, result.iterations);
//! ```

pub mod align;
pub mod derivatives;
pub mod error;
pub mod grid;
pub mod interpolation;
pub mod optimization;
pub mod test_utils;
pub mod voxel_grid;

pub use align::{build_aligner, AlignMethod, Aligner, AlignerConfig, IcpConfig};
pub use derivatives::{GaussianParams, NormalEquations, ResidualBlock, ResidualRow};
pub use error::{AlignError, GridError};
pub use grid::{DistanceGrid, GridConfig, GridGeometry};
pub use interpolation::{DistanceSample, TrilinearField};
pub use optimization::{
    normalize_angle, LmSolver, NdtConfig, NdtOptimizer, Pose4, SolveResult, SolveStatus,
    SolverConfig,
};
pub use voxel_grid::{Voxel, VoxelGrid, VoxelGridConfig};

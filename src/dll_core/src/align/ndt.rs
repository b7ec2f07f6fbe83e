//! NDT aligner: the map is voxelized once, scans are matched by Newton
//! iterations on the NDT score.

use std::sync::atomic::AtomicBool;

use super::{AlignMethod, Aligner};
use crate::error::AlignError;
use crate::optimization::{NdtConfig, NdtOptimizer, Pose4, SolveResult};
use crate::voxel_grid::{VoxelGrid, VoxelGridConfig};

#[derive(Debug)]
pub struct NdtAligner {
    grid: VoxelGrid,
    optimizer: NdtOptimizer,
}

impl NdtAligner {
    /// Voxelize `map` at `config.resolution`.
    pub fn new(map: &[[f32; 3]], config: NdtConfig) -> Result<Self, AlignError> {
        let grid = VoxelGrid::from_points(
            map,
            VoxelGridConfig {
                resolution: config.resolution as f32,
                ..Default::default()
            },
        );
        if grid.is_empty() {
            return Err(AlignError::EmptyMap("voxels"));
        }
        Ok(Self {
            grid,
            optimizer: NdtOptimizer::new(config),
        })
    }

    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }
}

impl Aligner for NdtAligner {
    fn method(&self) -> AlignMethod {
        AlignMethod::Ndt
    }

    fn align(&self, points: &[[f32; 3]], prior: Pose4, cancel: Option<&AtomicBool>) -> SolveResult {
        self.optimizer.align(points, &self.grid, prior, cancel)
    }
}

//! Voxelized Gaussian map for NDT alignment.
//!
//! Map points are binned into cubic voxels; each voxel with enough points
//! stores the mean and regularized inverse covariance of its points. Voxel
//! means are indexed in a KD-tree for radius queries.

pub mod search;
pub mod types;

pub use search::{PointSearch, VoxelSearch};
pub use types::{voxel_key, PointMoments, Voxel, VoxelGridConfig, VoxelKey};

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

/// Gaussian voxels of a map cloud with a radius index over their means.
#[derive(Debug)]
pub struct VoxelGrid {
    config: VoxelGridConfig,
    /// Sorted by key, so construction is deterministic.
    keys: Vec<VoxelKey>,
    voxels: Vec<Voxel>,
    search: Option<VoxelSearch>,
}

impl VoxelGrid {
    /// Build from a point cloud. Non-finite points are skipped.
    pub fn from_points(points: &[[f32; 3]], config: VoxelGridConfig) -> Self {
        let mut bins: BTreeMap<VoxelKey, PointMoments> = BTreeMap::new();
        for point in points.iter().filter(|p| p.iter().all(|v| v.is_finite())) {
            bins.entry(voxel_key(point, config.resolution))
                .or_default()
                .push(point);
        }
        let occupied = bins.len();

        let bins: Vec<_> = bins.into_iter().collect();
        let (keys, voxels): (Vec<_>, Vec<_>) = bins
            .into_par_iter()
            .filter_map(|(key, moments)| Voxel::fit(&moments, &config).map(|voxel| (key, voxel)))
            .collect::<Vec<_>>()
            .into_iter()
            .unzip();
        let search = VoxelSearch::from_voxels(&voxels);

        debug!(
            "Built NDT voxel map: {} points, {} occupied voxels, {} Gaussians (resolution {})",
            points.len(),
            occupied,
            voxels.len(),
            config.resolution
        );

        Self {
            config,
            keys,
            voxels,
            search,
        }
    }

    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    pub fn config(&self) -> &VoxelGridConfig {
        &self.config
    }

    pub fn resolution(&self) -> f32 {
        self.config.resolution
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    /// Voxels whose mean lies within `radius` of `point`, nearest first.
    pub fn radius_search(&self, point: &[f32; 3], radius: f32) -> Vec<&Voxel> {
        match &self.search {
            Some(search) => search
                .within(point, radius)
                .into_iter()
                .map(|i| &self.voxels[i])
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VoxelKey, &Voxel)> {
        self.keys.iter().zip(self.voxels.iter())
    }
}

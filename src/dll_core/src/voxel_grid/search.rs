//! KD-tree based nearest-neighbor and radius search.
//!
//! [`PointSearch`] indexes an arbitrary point set and serves three callers:
//! distance-grid construction (nearest map point per cell), ICP
//! correspondences and normals, and [`VoxelSearch`] over NDT voxel means.
//! Maps with many equal coordinates on one axis, such as an exactly flat
//! floor, index like any other cloud.
//!
//! ```ignore
//! let search = VoxelSearch::from_voxels(&voxels).unwrap();
//! for idx in search.within(&query_point, radius) {
//!     let voxel = &voxels[idx];
//! }
//! ```

use std::fmt;

use kiddo::{ImmutableKdTree, SquaredEuclidean};

use super::Voxel;

/// Static KD-tree over a point set. Item ids are indices into that set.
pub struct PointSearch {
    kdtree: ImmutableKdTree<f32, 3>,
    len: usize,
}

impl fmt::Debug for PointSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointSearch").field("len", &self.len).finish()
    }
}

impl PointSearch {
    /// Build a search index. Returns `None` for an empty slice.
    pub fn from_points(points: &[[f32; 3]]) -> Option<Self> {
        if points.is_empty() {
            return None;
        }
        Some(Self {
            kdtree: ImmutableKdTree::new_from_slice(points),
            len: points.len(),
        })
    }

    /// Nearest indexed point as `(index, squared_distance)`.
    #[inline]
    pub fn nearest(&self, point: &[f32; 3]) -> (usize, f32) {
        let nn = self.kdtree.nearest_one::<SquaredEuclidean>(point);
        (nn.item as usize, nn.distance)
    }

    /// Indices within `radius`, nearest first.
    pub fn within(&self, point: &[f32; 3], radius: f32) -> Vec<usize> {
        self.kdtree
            .within::<SquaredEuclidean>(point, radius * radius)
            .iter()
            .map(|nn| nn.item as usize)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Radius search over voxel centroids.
///
/// Each source point scores against every voxel whose mean lies within the
/// search radius, which smooths the NDT objective near voxel borders.
#[derive(Debug)]
pub struct VoxelSearch {
    inner: PointSearch,
}

impl VoxelSearch {
    /// Build from voxel means. Indices refer to positions in `voxels`.
    pub fn from_voxels(voxels: &[Voxel]) -> Option<Self> {
        let centroids: Vec<[f32; 3]> = voxels.iter().map(Voxel::mean_f32).collect();
        PointSearch::from_points(&centroids).map(|inner| Self { inner })
    }

    pub fn within(&self, point: &[f32; 3], radius: f32) -> Vec<usize> {
        self.inner.within(point, radius)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

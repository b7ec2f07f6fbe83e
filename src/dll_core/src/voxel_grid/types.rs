//! Gaussian fits of local map patches.
//!
//! NDT voxels and ICP surface normals both come from the first and second
//! moments of a small point set. Voxels keep the regularized inverse
//! covariance; the ICP backend keeps the direction of least spread.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

/// NDT voxel map settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoxelGridConfig {
    /// Voxel side length in meters.
    pub resolution: f32,
    /// Voxels with fewer points hold no Gaussian.
    pub min_points_per_voxel: usize,
    /// Eigenvalues are floored at this fraction of the largest one.
    pub min_eigenvalue_ratio: f64,
}

impl Default for VoxelGridConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            min_points_per_voxel: 6,
            min_eigenvalue_ratio: 0.01,
        }
    }
}

/// Integer voxel index, `floor(p / resolution)` per axis.
pub type VoxelKey = [i32; 3];

pub fn voxel_key(point: &[f32; 3], resolution: f32) -> VoxelKey {
    point.map(|v| (v / resolution).floor() as i32)
}

/// Running `Σp`, `Σppᵀ` and count of a point set, in f64.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMoments {
    sum: Vector3<f64>,
    sum_sq: Matrix3<f64>,
    count: usize,
}

impl Default for PointMoments {
    fn default() -> Self {
        Self {
            sum: Vector3::zeros(),
            sum_sq: Matrix3::zeros(),
            count: 0,
        }
    }
}

impl PointMoments {
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f32; 3]>) -> Self {
        let mut moments = Self::default();
        for point in points {
            moments.push(point);
        }
        moments
    }

    pub fn push(&mut self, point: &[f32; 3]) {
        let v = Vector3::new(point[0] as f64, point[1] as f64, point[2] as f64);
        self.sum += v;
        self.sum_sq += v * v.transpose();
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<Vector3<f64>> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Unbiased sample covariance; needs two points.
    pub fn covariance(&self) -> Option<Matrix3<f64>> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let covariance = (self.sum_sq - mean * mean.transpose() * n) / (n - 1.0);
        // Cancellation can leave tiny asymmetries.
        Some((covariance + covariance.transpose()) * 0.5)
    }

    /// Unit direction of least spread. `None` below three points or when all
    /// points coincide.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        if self.count < 3 {
            return None;
        }
        let eigen = self.covariance()?.symmetric_eigen();
        if !(eigen.eigenvalues.max() > 0.0) {
            return None;
        }
        let flattest = eigen.eigenvalues.imin();
        Some(eigen.eigenvectors.column(flattest).normalize())
    }
}

/// Gaussian fitted to the map points of one voxel.
#[derive(Debug, Clone)]
pub struct Voxel {
    pub mean: Vector3<f64>,
    /// Regularized, so planar patches stay invertible.
    pub covariance: Matrix3<f64>,
    pub inv_covariance: Matrix3<f64>,
    pub point_count: usize,
}

impl Voxel {
    /// `None` below `min_points_per_voxel` or for a zero covariance.
    pub fn fit(moments: &PointMoments, config: &VoxelGridConfig) -> Option<Self> {
        if moments.count() < config.min_points_per_voxel {
            return None;
        }
        let mean = moments.mean()?;
        let (covariance, inv_covariance) =
            floor_eigenvalues(moments.covariance()?, config.min_eigenvalue_ratio)?;
        Some(Self {
            mean,
            covariance,
            inv_covariance,
            point_count: moments.count(),
        })
    }

    /// Mean as an index query point.
    pub fn mean_f32(&self) -> [f32; 3] {
        [self.mean.x as f32, self.mean.y as f32, self.mean.z as f32]
    }
}

/// `(C', C'⁻¹)` where `C'` has the eigenvalues of `C` floored at
/// `ratio · λ_max`.
pub(crate) fn floor_eigenvalues(
    covariance: Matrix3<f64>,
    ratio: f64,
) -> Option<(Matrix3<f64>, Matrix3<f64>)> {
    let mut eigen = SymmetricEigen::new(covariance);
    let largest = eigen.eigenvalues.max();
    if !(largest > 0.0) {
        return None;
    }

    let floor = largest * ratio;
    eigen.eigenvalues.apply(|ev| *ev = ev.max(floor));
    let regularized = eigen.recompose();
    eigen.eigenvalues.apply(|ev| *ev = ev.recip());
    Some((regularized, eigen.recompose()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_on_plane_x(x: f32) -> Vec<[f32; 3]> {
        (0..5)
            .flat_map(|i| (0..5).map(move |j| [x, 0.1 * i as f32, 0.1 * j as f32]))
            .collect()
    }

    #[test]
    fn test_voxel_key_floors() {
        assert_eq!(voxel_key(&[0.0, 0.0, 0.0], 2.0), [0, 0, 0]);
        assert_eq!(voxel_key(&[3.5, 5.1, 1.9], 2.0), [1, 2, 0]);
        assert_eq!(voxel_key(&[-3.5, -1.1, -0.1], 2.0), [-2, -1, -1]);
    }

    #[test]
    fn test_moments_mean_and_covariance() {
        let points = [[1.0, 0.0, 0.0], [-1.0, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, -2.0, 0.0]];
        let moments = PointMoments::from_points(&points);
        assert_eq!(moments.count(), 4);
        assert_relative_eq!(moments.mean().unwrap(), Vector3::zeros(), epsilon = 1e-12);

        let cov = moments.covariance().unwrap();
        assert_relative_eq!(cov[(0, 0)], 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(1, 1)], 8.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(cov[(2, 2)], 0.0, epsilon = 1e-12);
        assert!(PointMoments::from_points(&points[..1]).covariance().is_none());
    }

    #[test]
    fn test_normal_of_planar_patch() {
        let moments = PointMoments::from_points(&grid_on_plane_x(0.5));
        let normal = moments.normal().unwrap();
        assert_relative_eq!(normal.x.abs(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(normal.norm(), 1.0, epsilon = 1e-12);

        let same = [[1.0, 1.0, 1.0]; 5];
        assert!(PointMoments::from_points(&same).normal().is_none());
    }

    #[test]
    fn test_planar_voxel_is_invertible() {
        let moments = PointMoments::from_points(&grid_on_plane_x(0.5));
        let voxel = Voxel::fit(&moments, &VoxelGridConfig::default()).unwrap();

        assert!(voxel.inv_covariance.iter().all(|v| v.is_finite()));
        // The plane normal is the stiffest direction.
        assert!(voxel.inv_covariance[(0, 0)] > voxel.inv_covariance[(1, 1)]);
        assert!(voxel.inv_covariance[(0, 0)] > voxel.inv_covariance[(2, 2)]);
        assert_relative_eq!(voxel.mean.x, 0.5, epsilon = 1e-6);
        assert_relative_eq!(
            voxel.covariance * voxel.inv_covariance,
            Matrix3::identity(),
            epsilon = 1e-8
        );
    }

    #[test]
    fn test_sparse_or_degenerate_voxels_rejected() {
        let config = VoxelGridConfig::default();
        let few = PointMoments::from_points(&grid_on_plane_x(0.0)[..5]);
        assert!(Voxel::fit(&few, &config).is_none());

        let same = PointMoments::from_points(&[[2.0, 2.0, 2.0]; 10]);
        assert!(Voxel::fit(&same, &config).is_none());
    }

    #[test]
    fn test_eigenvalue_floor() {
        let cov = Matrix3::from_diagonal(&Vector3::new(1.0, 0.5, 1e-6));
        let (regularized, inverse) = floor_eigenvalues(cov, 0.01).unwrap();

        assert_relative_eq!(regularized[(0, 0)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(regularized[(1, 1)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(regularized[(2, 2)], 0.01, epsilon = 1e-12);
        assert_relative_eq!(inverse[(2, 2)], 100.0, epsilon = 1e-8);
        assert!(floor_eigenvalues(Matrix3::zeros(), 0.01).is_none());
    }
}

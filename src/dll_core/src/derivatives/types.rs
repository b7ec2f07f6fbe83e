//! Type definitions for NDT derivative computation.
//!
//! Based on Magnusson 2009, Chapter 6, restricted to the four parameters
//! `[tx, ty, tz, yaw]`.

use nalgebra::{Matrix4, Vector4};

/// Gaussian fitting parameters for the NDT score function.
///
/// Per point-voxel pair the score is `-d1 * exp(-d2/2 * (x-μ)ᵀΣ⁻¹(x-μ))`.
#[derive(Debug, Clone, Copy)]
pub struct GaussianParams {
    /// Negative amplitude: `-log(c1 + c2) - d3`.
    pub d1: f64,
    /// Exponent coefficient.
    pub d2: f64,
    pub outlier_ratio: f64,
}

impl GaussianParams {
    /// Derive `d1`, `d2` from the voxel resolution and outlier ratio.
    ///
    /// - c1 = 10 * (1 - outlier_ratio)
    /// - c2 = outlier_ratio / resolution^3
    /// - d3 = -log(c2)
    /// - d1 = -log(c1 + c2) - d3
    /// - d2 = -2 * log((-log(c1 * exp(-0.5) + c2) - d3) / d1)
    pub fn new(resolution: f64, outlier_ratio: f64) -> Self {
        let c1 = 10.0 * (1.0 - outlier_ratio);
        let c2 = outlier_ratio / (resolution * resolution * resolution);
        let d3 = -c2.ln();
        let d1 = -(c1 + c2).ln() - d3;
        let d2_nom = -(c1 * (-0.5_f64).exp() + c2).ln() - d3;
        let d2 = -2.0 * (d2_nom / d1).ln();

        Self {
            d1,
            d2,
            outlier_ratio,
        }
    }
}

impl Default for GaussianParams {
    fn default() -> Self {
        Self::new(1.0, 0.55)
    }
}

/// Score, gradient and Hessian of one point-voxel pair.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeResult {
    pub score: f64,
    pub gradient: Vector4<f64>,
    pub hessian: Matrix4<f64>,
}

impl DerivativeResult {
    pub fn zeros() -> Self {
        Self {
            score: 0.0,
            gradient: Vector4::zeros(),
            hessian: Matrix4::zeros(),
        }
    }

    pub fn accumulate(&mut self, other: &DerivativeResult) {
        self.score += other.score;
        self.gradient += other.gradient;
        self.hessian += other.hessian;
    }
}

/// Sums over the whole scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedDerivatives {
    pub score: f64,
    pub gradient: Vector4<f64>,
    pub hessian: Matrix4<f64>,
    /// Point-voxel pairs that contributed.
    pub num_correspondences: usize,
}

impl AggregatedDerivatives {
    pub fn zeros() -> Self {
        Self {
            score: 0.0,
            gradient: Vector4::zeros(),
            hessian: Matrix4::zeros(),
            num_correspondences: 0,
        }
    }

    pub fn add(&mut self, result: &DerivativeResult) {
        self.score += result.score;
        self.gradient += result.gradient;
        self.hessian += result.hessian;
        self.num_correspondences += 1;
    }
}

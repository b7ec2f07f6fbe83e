//! Linear solves for the 4-DoF step.
//!
//! - NDT: `Δp = -(H + λI)⁻¹g` through SVD, since the score Hessian is
//!   indefinite away from the optimum.
//! - LM: `(JᵀJ + λ·diag(JᵀJ))·δ = −Jᵀr` through Cholesky; failure means
//!   the damped system is not positive definite.

use nalgebra::{Matrix4, Vector4};

/// Newton step `-H⁻¹g` via SVD pseudo-inverse. `None` if `H` is effectively zero.
pub fn newton_step(
    gradient: &Vector4<f64>,
    hessian: &Matrix4<f64>,
    tolerance: f64,
) -> Option<Vector4<f64>> {
    let svd = hessian.svd(true, true);
    if svd.singular_values.max() < tolerance {
        return None;
    }
    svd.solve(&(-gradient), tolerance).ok()
}

/// Newton step on `H + λI`.
pub fn newton_step_regularized(
    gradient: &Vector4<f64>,
    hessian: &Matrix4<f64>,
    regularization: f64,
    tolerance: f64,
) -> Option<Vector4<f64>> {
    let regularized = hessian + Matrix4::identity() * regularization;
    newton_step(gradient, &regularized, tolerance)
}

/// Solve `(JᵀJ + λ·diag(JᵀJ))·δ = −Jᵀr`.
///
/// Returns `None` when the damped matrix has no Cholesky factorization.
pub fn damped_step(jtj: &Matrix4<f64>, jtr: &Vector4<f64>, lambda: f64) -> Option<Vector4<f64>> {
    let mut damped = *jtj;
    for i in 0..4 {
        damped[(i, i)] += lambda * jtj[(i, i)];
    }
    let chol = damped.cholesky()?;
    let delta = chol.solve(&(-jtr));
    delta.iter().all(|v| v.is_finite()).then_some(delta)
}

/// Ratio of largest to smallest singular value; infinite when singular.
pub fn condition_number(matrix: &Matrix4<f64>) -> f64 {
    let svd = matrix.svd(false, false);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if min_sv < 1e-15 {
        f64::INFINITY
    } else {
        max_sv / min_sv
    }
}

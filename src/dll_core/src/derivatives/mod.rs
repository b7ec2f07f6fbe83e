//! Derivatives of the alignment objectives with respect to the 4-DoF pose.
//!
//! - [`residual`]: distance-field residuals `D(T(θ)·p)` and their Jacobian
//!   for the Levenberg-Marquardt solver.
//! - [`ndt`]: NDT score, gradient and Hessian (Magnusson 2009, Chapter 6).
//!
//! The pose vector is `[tx, ty, tz, yaw]`; roll and pitch are removed from
//! the points before alignment.

pub mod ndt;
pub mod residual;
pub mod types;

pub use ndt::{compute_derivative_single, compute_derivatives, PointDerivatives};
pub use residual::{residual_row, NormalEquations, ResidualBlock, ResidualRow};
pub use types::{AggregatedDerivatives, DerivativeResult, GaussianParams};

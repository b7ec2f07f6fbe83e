//! Pose refinement for the 4-DoF alignment problem.
//!
//! - [`lm`]: Levenberg-Marquardt on distance-field residuals
//! - [`ndt`]: Newton iterations on the NDT score (Magnusson 2009, Chapter 6)
//! - [`newton`]: the shared 4×4 linear solves

pub mod lm;
pub mod ndt;
pub mod newton;
pub mod types;

pub use lm::{Damping, LmSolver};
pub use ndt::{NdtConfig, NdtOptimizer};
pub use newton::{condition_number, damped_step, newton_step, newton_step_regularized};
pub use types::{normalize_angle, Pose4, SolveResult, SolveStatus, SolverConfig};

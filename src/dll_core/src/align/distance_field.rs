//! Distance-field aligner: Levenberg-Marquardt on trilinear residuals.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use super::{AlignMethod, Aligner};
use crate::interpolation::TrilinearField;
use crate::optimization::{LmSolver, Pose4, SolveResult, SolverConfig};

/// Shares the field with any other reader; the field is immutable.
#[derive(Debug, Clone)]
pub struct DistanceFieldAligner {
    field: Arc<TrilinearField>,
    solver: LmSolver,
}

impl DistanceFieldAligner {
    pub fn new(field: Arc<TrilinearField>, config: SolverConfig) -> Self {
        Self {
            field,
            solver: LmSolver::new(config),
        }
    }

    pub fn field(&self) -> &TrilinearField {
        &self.field
    }
}

impl Aligner for DistanceFieldAligner {
    fn method(&self) -> AlignMethod {
        AlignMethod::DistanceField
    }

    fn align(&self, points: &[[f32; 3]], prior: Pose4, cancel: Option<&AtomicBool>) -> SolveResult {
        self.solver.solve(&self.field, points, prior, cancel)
    }
}

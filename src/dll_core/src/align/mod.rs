//! Interchangeable scan-to-map aligners.
//!
//! Every backend refines a 4-DoF prior for a tilt-compensated scan in the
//! base frame and reports a [`SolveResult`]. Backends are picked once from
//! configuration through [`build_aligner`].

pub mod distance_field;
pub mod icp;
pub mod ndt;

pub use distance_field::DistanceFieldAligner;
pub use icp::{IcpAligner, IcpConfig};
pub use ndt::NdtAligner;

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AlignError;
use crate::interpolation::TrilinearField;
use crate::optimization::{NdtConfig, Pose4, SolveResult, SolverConfig};

/// Refine a pose prior for a scan.
pub trait Aligner: Send + Sync {
    fn method(&self) -> AlignMethod;

    /// `cancel` is polled at iteration boundaries; a cancelled run reports
    /// [`SolveStatus::Cancelled`](crate::optimization::SolveStatus::Cancelled).
    fn align(&self, points: &[[f32; 3]], prior: Pose4, cancel: Option<&AtomicBool>) -> SolveResult;
}

/// Alignment backend, configured by numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum AlignMethod {
    #[default]
    DistanceField = 1,
    Ndt = 2,
    Icp = 3,
}

impl AlignMethod {
    pub fn id(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for AlignMethod {
    type Error = AlignError;

    fn try_from(id: i64) -> Result<Self, Self::Error> {
        match id {
            1 => Ok(Self::DistanceField),
            2 => Ok(Self::Ndt),
            3 => Ok(Self::Icp),
            other => Err(AlignError::UnknownMethod(other)),
        }
    }
}

impl From<AlignMethod> for i64 {
    fn from(method: AlignMethod) -> Self {
        method.id()
    }
}

impl fmt::Display for AlignMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DistanceField => "distance-field LM",
            Self::Ndt => "NDT",
            Self::Icp => "ICP",
        };
        f.write_str(name)
    }
}

/// Settings for all backends; only the selected one is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    pub solver: SolverConfig,
    pub ndt: NdtConfig,
    pub icp: IcpConfig,
}

/// Construct the backend for `method`.
///
/// NDT and ICP need the raw map cloud; the distance-field backend only
/// needs the field.
pub fn build_aligner(
    method: AlignMethod,
    field: Arc<TrilinearField>,
    map: Option<&[[f32; 3]]>,
    config: &AlignerConfig,
) -> Result<Box<dyn Aligner>, AlignError> {
    let aligner: Box<dyn Aligner> = match method {
        AlignMethod::DistanceField => {
            Box::new(DistanceFieldAligner::new(field, config.solver.clone()))
        }
        AlignMethod::Ndt => {
            let map = map.ok_or(AlignError::MissingMapCloud("NDT"))?;
            Box::new(NdtAligner::new(map, config.ndt.clone())?)
        }
        AlignMethod::Icp => {
            let map = map.ok_or(AlignError::MissingMapCloud("ICP"))?;
            Box::new(IcpAligner::new(map, config.icp.clone())?)
        }
    };
    info!("Using {method} aligner");
    Ok(aligner)
}

//! Error taxonomy for the localization node.
//!
//! Only configuration and grid-load failures are fatal. Everything else is
//! logged by the event handlers and turned into "no state change".

use std::io;
use std::path::PathBuf;

use dll_core::{AlignError, GridError};
use thiserror::Error;

/// Failures while handling node events or starting the node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("transform {target} <- {source_frame} unavailable: {cause}")]
    TransformUnavailable {
        target: String,
        source_frame: String,
        cause: TransformError,
    },

    #[error("malformed point cloud: {0}")]
    CloudMalformed(String),

    #[error("solver did not converge: {0}")]
    SolverDiverged(String),

    #[error("failed to load distance grid from {path}: {source}")]
    GridLoadFailed {
        path: PathBuf,
        #[source]
        source: GridError,
    },

    #[error("initial pose in frame {received:?} rejected, expected {expected:?}")]
    InitialPoseRejected { received: String, expected: String },

    #[error("aligner setup failed: {0}")]
    Aligner(#[from] AlignError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Transform lookup failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("no transform path between the frames")]
    NotFound,

    #[error("timed out after {0:?} waiting for the transform")]
    Timeout(std::time::Duration),
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

//! Error types for grid construction, persistence and aligner setup.

use std::io;

use thiserror::Error;

/// Errors from building, saving or loading a distance grid.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("map cloud contains no finite points")]
    EmptyMap,

    #[error("invalid grid geometry: {0}")]
    InvalidGeometry(String),

    #[error("grid I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("grid file truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },

    #[error("grid file has {0} unexpected trailing bytes")]
    SizeMismatch(usize),

    #[error("grid contains a non-finite distance at cell {0}")]
    NonFinite(usize),
}

/// Errors from constructing an alignment backend.
#[derive(Error, Debug)]
pub enum AlignError {
    #[error("alignment method {0} requires the map point cloud")]
    MissingMapCloud(&'static str),

    #[error("map produced no usable {0}")]
    EmptyMap(&'static str),

    #[error("unknown alignment method id {0} (expected 1, 2 or 3)")]
    UnknownMethod(i64),
}

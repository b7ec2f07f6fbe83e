//! Localization node around [`dll_core`].
//!
//! Keeps the `map -> odom` correction current: odometry motion and elapsed
//! time trigger a solve, the next cloud is leveled with the current roll and
//! pitch, aligned against the map, and the refined pose becomes the new
//! correction. The correction is republished on every tick whether or not a
//! solve succeeded.
//!
//! Transport is abstracted: transforms come from a [`TransformOracle`], are
//! published through a [`TransformPublisher`], and all inputs reach the node
//! as [`NodeEvent`]s. [`ReplaySequence`] feeds recorded clouds and odometry
//! for offline runs.

pub mod controller;
pub mod error;
pub mod log_throttle;
pub mod map_io;
pub mod node;
pub mod params;
pub mod pointcloud;
pub mod replay;
pub mod tf_handler;

pub use controller::{ControllerState, Trigger, UpdateController, UpdateThresholds};
pub use error::{ConfigError, NodeError, TransformError};
pub use map_io::{load_aligner, load_map_cloud, load_or_build_grid};
pub use node::{
    Clock, CorrectionHandle, DllNode, ImuSample, InitialPoseMsg, NodeEvent, NodeRuntime,
    SystemClock,
};
pub use params::DllParams;
pub use pointcloud::{PointCloudFrame, PointField, PreprocessStats, Preprocessor};
pub use replay::{write_tum_pose, ReplayFrame, ReplaySequence};
pub use tf_handler::{TfBuffer, TransformOracle, TransformPublisher};

//! Recorded sequences for offline runs.
//!
//! A sequence is a YAML manifest next to its clouds:
//!
//! ```yaml
//! sensor_frame: velodyne
//! sensor_pose: [0.0, 0.0, 1.2, 0.0, 0.0, 0.0]   # x y z roll pitch yaw, in base
//! initial_pose: [2.0, 1.0, 0.0, 0.5]             # x y z yaw, optional
//! frames:
//!   - stamp: 0.0                                  # seconds
//!     odom: [0.0, 0.0, 0.0, 0.0, 0.0, 0.0]        # base in odom
//!     cloud: scans/000000.pcd                     # relative to the manifest
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nalgebra::{Isometry3, Translation3, UnitQuaternion};
use serde::Deserialize;

use crate::map_io::load_map_cloud;
use crate::node::InitialPoseMsg;
use crate::pointcloud::PointCloudFrame;

/// One recorded cloud and the odometry at its stamp.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayFrame {
    /// Seconds.
    pub stamp: f64,
    /// `[x, y, z, roll, pitch, yaw]` of the base in the odometric frame.
    pub odom: [f64; 6],
    pub cloud: PathBuf,
}

impl ReplayFrame {
    pub fn stamp_ns(&self) -> i64 {
        (self.stamp * 1e9).round() as i64
    }

    /// `T_odom_base`.
    pub fn odom_transform(&self) -> Isometry3<f64> {
        isometry_from_xyzrpy(&self.odom)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplaySequence {
    pub sensor_frame: String,
    /// `[x, y, z, roll, pitch, yaw]` of the sensor in the base frame.
    #[serde(default)]
    pub sensor_pose: [f64; 6],
    /// `[x, y, z, yaw]` in the global frame.
    #[serde(default)]
    pub initial_pose: Option<[f64; 4]>,
    pub frames: Vec<ReplayFrame>,
    /// Directory cloud paths are resolved against.
    #[serde(skip)]
    root: PathBuf,
}

impl ReplaySequence {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read sequence {}", path.display()))?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&text, root).with_context(|| format!("invalid sequence {}", path.display()))
    }

    /// Parse a manifest whose cloud paths are relative to `root`.
    pub fn from_yaml(text: &str, root: &Path) -> Result<Self> {
        let mut sequence: Self = serde_yaml::from_str(text)?;
        if sequence.frames.is_empty() {
            bail!("sequence has no frames");
        }
        if let Some(pair) = sequence.frames.windows(2).find(|w| w[1].stamp < w[0].stamp) {
            bail!("stamps go backwards: {} after {}", pair[1].stamp, pair[0].stamp);
        }
        sequence.root = root.to_path_buf();
        Ok(sequence)
    }

    /// `T_base_sensor`.
    pub fn sensor_transform(&self) -> Isometry3<f64> {
        isometry_from_xyzrpy(&self.sensor_pose)
    }

    pub fn initial_pose_msg(&self, global_frame: &str) -> Option<InitialPoseMsg> {
        self.initial_pose.map(|[x, y, z, yaw]| InitialPoseMsg {
            frame_id: global_frame.to_string(),
            pose: isometry_from_xyzrpy(&[x, y, z, 0.0, 0.0, yaw]),
        })
    }

    pub fn cloud_path(&self, frame: &ReplayFrame) -> PathBuf {
        self.root.join(&frame.cloud)
    }

    /// Read the cloud of `frame`, stamped and tagged with the sensor frame.
    pub fn load_cloud(&self, frame: &ReplayFrame) -> Result<PointCloudFrame> {
        Ok(PointCloudFrame {
            frame_id: self.sensor_frame.clone(),
            stamp_ns: frame.stamp_ns(),
            points: load_map_cloud(self.cloud_path(frame))?,
        })
    }
}

/// Append one `stamp x y z qx qy qz qw` line (TUM trajectory format).
pub fn write_tum_pose(writer: &mut impl Write, stamp_ns: i64, pose: &Isometry3<f64>) -> io::Result<()> {
    let t = pose.translation.vector;
    let q = pose.rotation;
    writeln!(
        writer,
        "{:.9} {:.6} {:.6} {:.6} {:.9} {:.9} {:.9} {:.9}",
        stamp_ns as f64 * 1e-9,
        t.x,
        t.y,
        t.z,
        q.i,
        q.j,
        q.k,
        q.w
    )
}

fn isometry_from_xyzrpy(v: &[f64; 6]) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(v[0], v[1], v[2]),
        UnitQuaternion::from_euler_angles(v[3], v[4], v[5]),
    )
}

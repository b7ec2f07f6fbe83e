//! Localizer parameters, loaded from YAML.
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```yaml
//! base_frame_id: base_link
//! update_min_d: 0.1
//! align_method: 1      # 1 = distance-field LM, 2 = NDT, 3 = ICP
//! map_path: /maps/lab.pcd
//! grid:
//!   resolution: 0.05
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dll_core::{AlignMethod, AlignerConfig, GridConfig, IcpConfig, NdtConfig, Pose4, SolverConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// All localizer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DllParams {
    /// Point-cloud stream name.
    pub in_cloud: String,

    pub base_frame_id: String,
    pub odom_frame_id: String,
    pub global_frame_id: String,

    /// Take roll and pitch from the IMU instead of the prior.
    pub use_imu: bool,
    /// Tick rate (Hz).
    pub update_rate: f64,

    pub initial_x: f64,
    pub initial_y: f64,
    pub initial_z: f64,
    pub initial_a: f64,
    /// Added to z of every initial-pose message.
    pub initial_z_offset: f64,

    /// Odometric translation that triggers a solve (meters).
    pub update_min_d: f64,
    /// Odometric yaw change that triggers a solve (radians).
    pub update_min_a: f64,
    /// Time since the last trigger that forces a solve (seconds).
    pub update_min_time: f64,

    pub align_method: AlignMethod,

    /// Map cloud (`.xyz`, ASCII or binary `.pcd`).
    pub map_path: String,
    /// Persisted grid; empty means `<map_path>.grid`.
    pub grid_path: String,

    /// Points with squared range at or below this are dropped.
    pub range_min_sq: f64,
    /// Points with squared range at or above this are dropped.
    pub range_max_sq: f64,

    /// Wait for the sensor-to-base lookup (seconds).
    pub sensor_tf_timeout: f64,
    /// Wait for the odom-to-base lookup on clouds and initial poses (seconds).
    pub odom_tf_timeout: f64,
    /// Minimum period between repeated transform diagnostics (seconds).
    pub log_throttle_period: f64,

    pub grid: GridConfig,
    pub solver: SolverConfig,
    pub ndt: NdtConfig,
    pub icp: IcpConfig,
}

impl Default for DllParams {
    fn default() -> Self {
        Self {
            in_cloud: "/pointcloud".into(),
            base_frame_id: "base_link".into(),
            odom_frame_id: "odom".into(),
            global_frame_id: "map".into(),
            use_imu: false,
            update_rate: 10.0,
            initial_x: 0.0,
            initial_y: 0.0,
            initial_z: 0.0,
            initial_a: 0.0,
            initial_z_offset: 0.0,
            update_min_d: 0.1,
            update_min_a: 0.1,
            update_min_time: 1.0,
            align_method: AlignMethod::DistanceField,
            map_path: String::new(),
            grid_path: String::new(),
            range_min_sq: 1.0,
            range_max_sq: 10_000.0,
            sensor_tf_timeout: 2.0,
            odom_tf_timeout: 1.0,
            log_throttle_period: 1.0,
            grid: GridConfig::default(),
            solver: SolverConfig::default(),
            ndt: NdtConfig::default(),
            icp: IcpConfig::default(),
        }
    }
}

impl DllParams {
    /// Load and validate parameters from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate parameters from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let params: Self = serde_yaml::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let frames = [
            ("base_frame_id", &self.base_frame_id),
            ("odom_frame_id", &self.odom_frame_id),
            ("global_frame_id", &self.global_frame_id),
        ];
        for (key, frame) in frames {
            if frame.trim_start_matches('/').is_empty() {
                return Err(invalid(format!("{key} must not be empty")));
            }
        }

        require_positive("update_rate", self.update_rate)?;
        require_non_negative("update_min_d", self.update_min_d)?;
        require_non_negative("update_min_a", self.update_min_a)?;
        require_non_negative("update_min_time", self.update_min_time)?;
        require_non_negative("range_min_sq", self.range_min_sq)?;
        require_positive("range_max_sq", self.range_max_sq)?;
        if self.range_min_sq >= self.range_max_sq {
            return Err(invalid(format!(
                "range_min_sq ({}) must be below range_max_sq ({})",
                self.range_min_sq, self.range_max_sq
            )));
        }
        require_non_negative("sensor_tf_timeout", self.sensor_tf_timeout)?;
        require_non_negative("odom_tf_timeout", self.odom_tf_timeout)?;
        require_non_negative("log_throttle_period", self.log_throttle_period)?;

        let seed = [self.initial_x, self.initial_y, self.initial_z, self.initial_a];
        if !seed.iter().chain([&self.initial_z_offset]).all(|v| v.is_finite()) {
            return Err(invalid("initial pose values must be finite".into()));
        }

        self.grid
            .validate()
            .map_err(|e| invalid(format!("grid: {e}")))?;
        require_positive("ndt.resolution", self.ndt.resolution)?;
        require_positive("ndt.step_size", self.ndt.step_size)?;
        if !(0.0..1.0).contains(&self.ndt.outlier_ratio) {
            return Err(invalid("ndt.outlier_ratio must lie in [0, 1)".into()));
        }
        require_positive(
            "icp.max_correspondence_distance",
            self.icp.max_correspondence_distance as f64,
        )?;
        if !(0.0..1.0).contains(&self.icp.outlier_ratio) {
            return Err(invalid("icp.outlier_ratio must lie in [0, 1)".into()));
        }
        if !(self.solver.lambda_factor.is_finite() && self.solver.lambda_factor > 1.0) {
            return Err(invalid(format!(
                "solver.lambda_factor must exceed 1, got {}",
                self.solver.lambda_factor
            )));
        }
        Ok(())
    }

    /// Seed pose from `initial_{x,y,z,a}`, if any of them is nonzero.
    pub fn seed_pose(&self) -> Option<Pose4> {
        let seed = Pose4::new(self.initial_x, self.initial_y, self.initial_z, self.initial_a);
        (seed != Pose4::default()).then_some(seed)
    }

    /// Grid cache location, derived from `map_path` when not set.
    pub fn resolved_grid_path(&self) -> Option<PathBuf> {
        if !self.grid_path.is_empty() {
            return Some(PathBuf::from(&self.grid_path));
        }
        if self.map_path.is_empty() {
            return None;
        }
        Some(PathBuf::from(format!("{}.grid", self.map_path)))
    }

    pub fn aligner_config(&self) -> AlignerConfig {
        AlignerConfig {
            solver: self.solver.clone(),
            ndt: self.ndt.clone(),
            icp: self.icp.clone(),
        }
    }

    pub fn tick_period(&self) -> Duration {
        secs(1.0 / self.update_rate)
    }

    pub fn sensor_timeout(&self) -> Duration {
        secs(self.sensor_tf_timeout)
    }

    pub fn odom_timeout(&self) -> Duration {
        secs(self.odom_tf_timeout)
    }

    pub fn throttle_period(&self) -> Duration {
        secs(self.log_throttle_period)
    }
}

/// Frame names compare equal regardless of a leading `/`.
pub fn same_frame(a: &str, b: &str) -> bool {
    a.trim_start_matches('/') == b.trim_start_matches('/')
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}

fn require_positive(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{key} must be positive, got {value}")))
    }
}

fn require_non_negative(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{key} must not be negative, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_table() {
        let params = DllParams::default();
        assert_eq!(params.in_cloud, "/pointcloud");
        assert_eq!(params.base_frame_id, "base_link");
        assert_eq!(params.odom_frame_id, "odom");
        assert_eq!(params.global_frame_id, "map");
        assert!(!params.use_imu);
        assert_eq!(params.update_rate, 10.0);
        assert_eq!(params.update_min_d, 0.1);
        assert_eq!(params.update_min_a, 0.1);
        assert_eq!(params.update_min_time, 1.0);
        assert_eq!(params.align_method, AlignMethod::DistanceField);
        assert_eq!(params.range_min_sq, 1.0);
        assert_eq!(params.range_max_sq, 10_000.0);
        assert_eq!(params.grid.resolution, 0.05);
        assert!(params.seed_pose().is_none());
        params.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let params = DllParams::from_yaml(
            "use_imu: true\nupdate_min_d: 0.25\nalign_method: 3\ngrid:\n  resolution: 0.1\n",
        )
        .unwrap();
        assert!(params.use_imu);
        assert_eq!(params.update_min_d, 0.25);
        assert_eq!(params.align_method, AlignMethod::Icp);
        assert_eq!(params.grid.resolution, 0.1);
        assert_eq!(params.grid.max_distance, 1.0);
        assert_eq!(params.update_min_a, 0.1);
        assert_eq!(params.solver.min_points, 4);
    }

    #[test]
    fn test_unknown_align_method_rejected() {
        assert!(matches!(
            DllParams::from_yaml("align_method: 7\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<Box<dyn Fn(&mut DllParams)>> = vec![
            Box::new(|p| p.update_rate = 0.0),
            Box::new(|p| p.update_min_d = -0.1),
            Box::new(|p| p.range_min_sq = 100.0),
            Box::new(|p| p.range_max_sq = 1.0),
            Box::new(|p| p.base_frame_id = "/".into()),
            Box::new(|p| p.global_frame_id.clear()),
            Box::new(|p| p.grid.resolution = 0.0),
            Box::new(|p| p.grid.max_distance = -1.0),
            Box::new(|p| p.initial_x = f64::NAN),
            Box::new(|p| p.odom_tf_timeout = f64::INFINITY),
        ];
        for (i, mutate) in cases.iter().enumerate() {
            let mut params = DllParams::default();
            mutate(&mut params);
            assert!(
                matches!(params.validate(), Err(ConfigError::Invalid(_))),
                "case {i} should be invalid"
            );
        }
    }

    #[test]
    fn test_seed_pose_when_any_value_nonzero() {
        let params = DllParams {
            initial_a: 0.5,
            ..Default::default()
        };
        assert_eq!(params.seed_pose(), Some(Pose4::new(0.0, 0.0, 0.0, 0.5)));
    }

    #[test]
    fn test_grid_path_derived_from_map_path() {
        let mut params = DllParams::default();
        assert_eq!(params.resolved_grid_path(), None);
        params.map_path = "/maps/lab.pcd".into();
        assert_eq!(
            params.resolved_grid_path(),
            Some(PathBuf::from("/maps/lab.pcd.grid"))
        );
        params.grid_path = "/cache/lab.grid".into();
        assert_eq!(
            params.resolved_grid_path(),
            Some(PathBuf::from("/cache/lab.grid"))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "global_frame_id: world\nupdate_rate: 20.0").unwrap();
        let params = DllParams::load(file.path()).unwrap();
        assert_eq!(params.global_frame_id, "world");
        assert_relative_eq!(params.tick_period().as_secs_f64(), 0.05, epsilon = 1e-9);

        assert!(matches!(
            DllParams::load("/nonexistent/dll.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_same_frame_ignores_leading_slash() {
        assert!(same_frame("/map", "map"));
        assert!(same_frame("map", "map"));
        assert!(!same_frame("odom", "map"));
    }
}

//! Point cloud decoding and preprocessing.
//!
//! Packed records (driver output, binary PCD bodies) decode into the points
//! of a [`PointCloudFrame`]. Frames are moved into the base frame with a
//! memoized sensor transform, range-filtered, and then leveled by the
//! current roll/pitch so the aligners only solve for yaw and translation.

use nalgebra::{Isometry3, Matrix3};
use tracing::debug;

use crate::error::NodeError;
use crate::tf_handler::{apply_isometry, TransformOracle};

const LOGGER_NAME: &str = "dll_localizer.pointcloud";

/// Datatype code of a little-endian `float32` field.
pub const FLOAT32: u8 = 7;

/// A decoded point cloud in its sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudFrame {
    pub frame_id: String,
    pub stamp_ns: i64,
    pub points: Vec<[f32; 3]>,
}

/// Layout of one field inside a packed point record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointField {
    pub name: String,
    /// Byte offset inside the record.
    pub offset: u32,
    pub datatype: u8,
    pub count: u32,
}

/// Field offsets for XYZ point cloud
struct XyzOffsets {
    x: usize,
    y: usize,
    z: usize,
}

impl XyzOffsets {
    fn from_fields(fields: &[PointField], point_step: usize) -> Result<Self, NodeError> {
        let find = |name: &str| -> Result<usize, NodeError> {
            let field = fields
                .iter()
                .find(|f| f.name == name)
                .ok_or_else(|| NodeError::CloudMalformed(format!("missing '{name}' field")))?;
            if field.datatype != FLOAT32 {
                return Err(NodeError::CloudMalformed(format!(
                    "field '{name}' has datatype {}, expected float32",
                    field.datatype
                )));
            }
            let offset = field.offset as usize;
            if offset + 4 > point_step {
                return Err(NodeError::CloudMalformed(format!(
                    "field '{name}' at offset {offset} exceeds point step {point_step}"
                )));
            }
            Ok(offset)
        };

        Ok(Self {
            x: find("x")?,
            y: find("y")?,
            z: find("z")?,
        })
    }
}

/// Decode `x`, `y`, `z` from packed little-endian point records.
///
/// Non-finite points are skipped.
pub fn decode_packed_xyz(
    fields: &[PointField],
    point_step: u32,
    data: &[u8],
    width: u32,
    height: u32,
) -> Result<Vec<[f32; 3]>, NodeError> {
    let point_step = point_step as usize;
    let offsets = XyzOffsets::from_fields(fields, point_step)?;
    let num_points = width as usize * height as usize;

    if data.len() < num_points * point_step {
        return Err(NodeError::CloudMalformed(format!(
            "data too short: {} < {}",
            data.len(),
            num_points * point_step
        )));
    }

    let mut points = Vec::with_capacity(num_points);
    for record in data.chunks_exact(point_step).take(num_points) {
        let x = read_f32(record, offsets.x);
        let y = read_f32(record, offsets.y);
        let z = read_f32(record, offsets.z);

        // Skip NaN points
        if x.is_finite() && y.is_finite() && z.is_finite() {
            points.push([x, y, z]);
        }
    }

    Ok(points)
}

/// Read f32 from byte slice (little endian)
fn read_f32(data: &[u8], offset: usize) -> f32 {
    let bytes = [
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ];
    f32::from_le_bytes(bytes)
}

/// Leveling rotation `R_pitch · R_roll`.
pub fn tilt_rotation(roll: f64, pitch: f64) -> Matrix3<f64> {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    Matrix3::new(
        cp, sp * sr, cr * sp, //
        0.0, cr, -sr, //
        -sp, cp * sr, cp * cr,
    )
}

/// Keep points with `min_sq < x²+y²+z² < max_sq`.
pub fn range_filter(points: &[[f32; 3]], min_sq: f64, max_sq: f64) -> Vec<[f32; 3]> {
    points
        .iter()
        .filter(|p| {
            let d2 = (p[0] as f64).powi(2) + (p[1] as f64).powi(2) + (p[2] as f64).powi(2);
            d2 > min_sq && d2 < max_sq
        })
        .copied()
        .collect()
}

/// Rotate every point by `rotation`.
pub fn level_points(points: &[[f32; 3]], rotation: &Matrix3<f64>) -> Vec<[f32; 3]> {
    let r = rotation;
    points
        .iter()
        .map(|p| {
            let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
            [
                (r[(0, 0)] * x + r[(0, 1)] * y + r[(0, 2)] * z) as f32,
                (r[(1, 0)] * x + r[(1, 1)] * y + r[(1, 2)] * z) as f32,
                (r[(2, 0)] * x + r[(2, 1)] * y + r[(2, 2)] * z) as f32,
            ]
        })
        .collect()
}

/// Counters from one preprocessing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessStats {
    pub points_in: usize,
    pub points_kept: usize,
    pub removed_by_range: usize,
}

/// Turns sensor clouds into leveled base-frame points.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    base_frame: String,
    range_min_sq: f64,
    range_max_sq: f64,
    sensor_timeout: std::time::Duration,
    /// Sensor frame and `T_base_sensor`, looked up on first use.
    sensor_tf: Option<(String, Isometry3<f64>)>,
}

impl Preprocessor {
    pub fn new(
        base_frame: &str,
        range_min_sq: f64,
        range_max_sq: f64,
        sensor_timeout: std::time::Duration,
    ) -> Self {
        Self {
            base_frame: base_frame.to_string(),
            range_min_sq,
            range_max_sq,
            sensor_timeout,
            sensor_tf: None,
        }
    }

    /// Cached sensor-to-base transform, if one has been looked up.
    pub fn sensor_transform(&self) -> Option<&Isometry3<f64>> {
        self.sensor_tf.as_ref().map(|(_, t)| t)
    }

    /// Forget the cached sensor transform, e.g. after recalibration.
    pub fn reset_sensor_cache(&mut self) {
        self.sensor_tf = None;
    }

    fn base_from_sensor(
        &mut self,
        frame_id: &str,
        stamp_ns: i64,
        oracle: &dyn TransformOracle,
    ) -> Result<Isometry3<f64>, NodeError> {
        if let Some((_, transform)) = &self.sensor_tf {
            return Ok(*transform);
        }

        let transform = oracle
            .lookup(&self.base_frame, frame_id, Some(stamp_ns), self.sensor_timeout)
            .map_err(|cause| NodeError::TransformUnavailable {
                target: self.base_frame.clone(),
                source_frame: frame_id.to_string(),
                cause,
            })?;
        debug!(
            target: LOGGER_NAME,
            "Cached sensor transform {} -> {}", frame_id, self.base_frame
        );
        self.sensor_tf = Some((frame_id.to_string(), transform));
        Ok(transform)
    }

    /// Base-frame, range-filtered, leveled points for `frame`.
    ///
    /// An empty result is reported as [`NodeError::CloudMalformed`].
    pub fn process(
        &mut self,
        frame: &PointCloudFrame,
        oracle: &dyn TransformOracle,
        roll: f64,
        pitch: f64,
    ) -> Result<(Vec<[f32; 3]>, PreprocessStats), NodeError> {
        let base_from_sensor = self.base_from_sensor(&frame.frame_id, frame.stamp_ns, oracle)?;
        let base_points = apply_isometry(&base_from_sensor, &frame.points);
        let filtered = range_filter(&base_points, self.range_min_sq, self.range_max_sq);

        let stats = PreprocessStats {
            points_in: frame.points.len(),
            points_kept: filtered.len(),
            removed_by_range: frame.points.len() - filtered.len(),
        };
        if filtered.is_empty() {
            return Err(NodeError::CloudMalformed(format!(
                "no points left after range filtering ({} in)",
                stats.points_in
            )));
        }

        let leveled = level_points(&filtered, &tilt_rotation(roll, pitch));
        Ok((leveled, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransformError;
    use crate::tf_handler::TfBuffer;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Translation3, UnitQuaternion, Vector3};
    use std::time::Duration;

    fn float32(name: &str, offset: u32) -> PointField {
        PointField {
            name: name.into(),
            offset,
            datatype: FLOAT32,
            count: 1,
        }
    }

    /// Encode points as packed `x y z` float32 records (12-byte step).
    fn encode_packed_xyz(points: &[[f32; 3]]) -> (Vec<PointField>, u32, Vec<u8>) {
        let fields = vec![
            float32("x", 0),
            float32("y", 4),
            float32("z", 8),
        ];
        let mut data = Vec::with_capacity(points.len() * 12);
        for p in points {
            data.extend_from_slice(&p[0].to_le_bytes());
            data.extend_from_slice(&p[1].to_le_bytes());
            data.extend_from_slice(&p[2].to_le_bytes());
        }
        (fields, 12, data)
    }

    #[test]
    fn test_decode_packed_xyz() {
        let input = [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let (fields, step, data) = encode_packed_xyz(&input);

        let result = decode_packed_xyz(&fields, step, &data, 2, 1).unwrap();
        assert_eq!(result, input.to_vec());
    }

    #[test]
    fn test_decode_with_padding_and_nan() {
        // x y z intensity, 16-byte records
        let fields = vec![
            float32("x", 0),
            float32("y", 4),
            float32("z", 8),
            float32("intensity", 12),
        ];
        let mut data = Vec::new();
        for p in [[1.0f32, 2.0, 3.0, 0.5], [f32::NAN, 0.0, 0.0, 0.1], [7.0, 8.0, 9.0, 0.9]] {
            for v in p {
                data.extend_from_slice(&v.to_le_bytes());
            }
        }

        let result = decode_packed_xyz(&fields, 16, &data, 3, 1).unwrap();
        assert_eq!(result, vec![[1.0, 2.0, 3.0], [7.0, 8.0, 9.0]]);
    }

    #[test]
    fn test_decode_rejects_missing_field_and_short_buffer() {
        let fields = vec![float32("x", 0), float32("y", 4)];
        assert!(matches!(
            decode_packed_xyz(&fields, 12, &[0u8; 12], 1, 1),
            Err(NodeError::CloudMalformed(_))
        ));

        let (fields, step, data) = encode_packed_xyz(&[[1.0, 2.0, 3.0]]);
        assert!(matches!(
            decode_packed_xyz(&fields, step, &data, 2, 1),
            Err(NodeError::CloudMalformed(_))
        ));
    }

    #[test]
    fn test_empty_cloud_decodes_to_nothing() {
        let (fields, step, data) = encode_packed_xyz(&[]);
        assert!(decode_packed_xyz(&fields, step, &data, 0, 1).unwrap().is_empty());
    }

    #[test]
    fn test_range_filter_bounds_are_exclusive() {
        let points = [
            [0.5, 0.0, 0.0],   // too close
            [1.0, 0.0, 0.0],   // exactly min
            [2.0, 0.0, 0.0],   // kept
            [0.0, 99.0, 0.0],  // kept
            [0.0, 0.0, 100.0], // exactly max
            [150.0, 0.0, 0.0], // too far
        ];
        let kept = range_filter(&points, 1.0, 10_000.0);
        assert_eq!(kept, vec![[2.0, 0.0, 0.0], [0.0, 99.0, 0.0]]);
    }

    #[test]
    fn test_tilt_rotation_is_pitch_times_roll() {
        let (roll, pitch) = (0.3, -0.2);
        let expected = Rotation3::from_axis_angle(&Vector3::y_axis(), pitch)
            * Rotation3::from_axis_angle(&Vector3::x_axis(), roll);
        let actual = tilt_rotation(roll, pitch);
        assert_relative_eq!(actual, *expected.matrix(), epsilon = 1e-12);

        // Same as the roll/pitch part of the pose orientation.
        let q = UnitQuaternion::from_euler_angles(roll, pitch, 0.0);
        assert_relative_eq!(actual, *q.to_rotation_matrix().matrix(), epsilon = 1e-12);
    }

    #[test]
    fn test_tilt_of_forward_axis() {
        let (roll, pitch) = (10f64.to_radians(), -5f64.to_radians());
        let leveled = level_points(&[[1.0, 0.0, 0.0]], &tilt_rotation(roll, pitch));
        assert_relative_eq!(leveled[0][0], 5f32.to_radians().cos(), epsilon = 1e-6);
        assert_relative_eq!(leveled[0][1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(leveled[0][2], 5f32.to_radians().sin(), epsilon = 1e-6);
    }

    fn lidar_mount() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.0, 0.0, 1.0),
            UnitQuaternion::identity(),
        )
    }

    #[test]
    fn test_process_transforms_filters_and_levels() {
        let tf = TfBuffer::new();
        tf.set_transform("base_link", "lidar", lidar_mount(), 0, true);
        let mut pre = Preprocessor::new("base_link", 1.0, 10_000.0, Duration::ZERO);

        let frame = PointCloudFrame {
            frame_id: "lidar".into(),
            stamp_ns: 0,
            // In base: (2,0,1) kept, (0,0,1) on the bound, (0.5,0,0.5) too close
            points: vec![[2.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.5, 0.0, -0.5]],
        };
        let (points, stats) = pre.process(&frame, &tf, 0.0, 0.0).unwrap();
        assert_eq!(points, vec![[2.0, 0.0, 1.0]]);
        assert_eq!(
            stats,
            PreprocessStats {
                points_in: 3,
                points_kept: 1,
                removed_by_range: 2,
            }
        );
    }

    #[test]
    fn test_sensor_transform_is_memoized() {
        let tf = TfBuffer::new();
        tf.set_transform("base_link", "lidar", lidar_mount(), 0, true);
        let mut pre = Preprocessor::new("base_link", 1.0, 10_000.0, Duration::ZERO);
        let frame = PointCloudFrame {
            frame_id: "lidar".into(),
            stamp_ns: 0,
            points: vec![[3.0, 0.0, 0.0]],
        };
        pre.process(&frame, &tf, 0.0, 0.0).unwrap();

        // A changed mount is ignored until the cache is reset.
        tf.set_transform("base_link", "lidar", Isometry3::identity(), 1, true);
        let (points, _) = pre.process(&frame, &tf, 0.0, 0.0).unwrap();
        assert_eq!(points[0], [3.0, 0.0, 1.0]);

        pre.reset_sensor_cache();
        assert!(pre.sensor_transform().is_none());
        let (points, _) = pre.process(&frame, &tf, 0.0, 0.0).unwrap();
        assert_eq!(points[0], [3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sensor_transform_taken_at_cloud_stamp() {
        // A mount recorded twice; the cloud sits next to the first stamp.
        let tf = TfBuffer::new();
        tf.set_transform("base_link", "lidar", lidar_mount(), 100, false);
        tf.set_transform("base_link", "lidar", Isometry3::identity(), 900, false);
        let mut pre = Preprocessor::new("base_link", 1.0, 10_000.0, Duration::ZERO);
        let frame = PointCloudFrame {
            frame_id: "lidar".into(),
            stamp_ns: 120,
            points: vec![[3.0, 0.0, 0.0]],
        };
        let (points, _) = pre.process(&frame, &tf, 0.0, 0.0).unwrap();
        assert_eq!(points[0], [3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_missing_sensor_transform_and_empty_result() {
        let tf = TfBuffer::new();
        let mut pre = Preprocessor::new("base_link", 1.0, 10_000.0, Duration::ZERO);
        let frame = PointCloudFrame {
            frame_id: "lidar".into(),
            stamp_ns: 0,
            points: vec![[0.1, 0.0, 0.0]],
        };
        assert!(matches!(
            pre.process(&frame, &tf, 0.0, 0.0),
            Err(NodeError::TransformUnavailable {
                cause: TransformError::NotFound,
                ..
            })
        ));

        tf.set_transform("base_link", "lidar", Isometry3::identity(), 0, true);
        assert!(matches!(
            pre.process(&frame, &tf, 0.0, 0.0),
            Err(NodeError::CloudMalformed(_))
        ));
    }
}

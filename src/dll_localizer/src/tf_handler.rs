//! Transform lookup and publication.
//!
//! The node consumes transforms through [`TransformOracle`] and emits its
//! correction through [`TransformPublisher`]. [`TfBuffer`] implements both
//! in-process: a frame graph fed by whoever owns the odometry and sensor
//! calibration, searched breadth-first on lookup.
//!
//! # Example
//!
//! ```ignore
//! use dll_localizer::tf_handler::{TfBuffer, TransformOracle};
//!
//! let tf = TfBuffer::new();
//! tf.set_transform("base_link", "velodyne", sensor_mount, 0, true);
//!
//! // Points in velodyne -> base_link, waiting up to 2 s
//! let base_from_sensor = tf.lookup("base_link", "velodyne", None, Duration::from_secs(2))?;
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use nalgebra::Isometry3;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::error::TransformError;

const LOGGER_NAME: &str = "dll_localizer.tf_handler";

/// Type alias for the transform buffer: (parent_frame, child_frame) -> list of transforms
type TransformBuffer = HashMap<(String, String), Vec<TimestampedTransform>>;

/// Dynamic transforms kept per frame pair.
const MAX_HISTORY: usize = 100;

/// Source of frame-to-frame transforms.
pub trait TransformOracle: Send + Sync {
    /// Transform taking points expressed in `source` into `target`.
    ///
    /// `time_ns = None` asks for the latest transform. A zero `timeout`
    /// makes exactly one attempt.
    fn lookup(
        &self,
        target: &str,
        source: &str,
        time_ns: Option<i64>,
        timeout: Duration,
    ) -> Result<Isometry3<f64>, TransformError>;
}

/// Sink for the node's correction transform.
pub trait TransformPublisher: Send + Sync {
    /// `transform` takes points in `child` into `parent`.
    fn publish(&self, transform: &Isometry3<f64>, parent: &str, child: &str, stamp_ns: i64);
}

/// A single transform with timestamp.
#[derive(Clone, Debug)]
struct TimestampedTransform {
    /// Takes child-frame points into the parent frame.
    transform: Isometry3<f64>,
    /// Timestamp in nanoseconds since epoch.
    stamp_ns: i64,
}

/// In-process transform buffer.
///
/// Writers call [`set_transform`](Self::set_transform); lookups that wait
/// are woken whenever a transform arrives.
#[derive(Default)]
pub struct TfBuffer {
    buffer: RwLock<TransformBuffer>,
    generation: Mutex<u64>,
    changed: Condvar,
}

impl TfBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transform taking `child` points into `parent`.
    ///
    /// Static transforms replace any existing entry for the pair.
    pub fn set_transform(
        &self,
        parent: &str,
        child: &str,
        transform: Isometry3<f64>,
        stamp_ns: i64,
        is_static: bool,
    ) {
        let key = (normalize(parent).to_string(), normalize(child).to_string());
        {
            let mut buf = self.buffer.write();
            let transforms = buf.entry(key).or_default();
            let timestamped = TimestampedTransform {
                transform,
                stamp_ns,
            };

            if is_static {
                transforms.clear();
                transforms.push(timestamped);
            } else {
                transforms.push(timestamped);
                if transforms.len() > MAX_HISTORY {
                    transforms.remove(0);
                }
            }
        }

        *self.generation.lock() += 1;
        self.changed.notify_all();
    }

    /// Single non-blocking lookup attempt.
    pub fn try_lookup(
        &self,
        target: &str,
        source: &str,
        time_ns: Option<i64>,
    ) -> Option<Isometry3<f64>> {
        let target = normalize(target);
        let source = normalize(source);

        if target == source {
            return Some(Isometry3::identity());
        }

        let buf = self.buffer.read();

        // Edges in both directions, each carrying T_from_to.
        let mut graph: HashMap<&str, Vec<(&str, Isometry3<f64>)>> = HashMap::new();
        for ((parent, child), transforms) in buf.iter() {
            let Some(transform) = Self::select(transforms, time_ns) else {
                continue;
            };
            graph
                .entry(parent.as_str())
                .or_default()
                .push((child.as_str(), transform));
            graph
                .entry(child.as_str())
                .or_default()
                .push((parent.as_str(), transform.inverse()));
        }

        // Breadth-first from the target, accumulating T_target_node.
        let mut visited: HashSet<&str> = HashSet::from([target]);
        let mut queue: VecDeque<(&str, Isometry3<f64>)> =
            VecDeque::from([(target, Isometry3::identity())]);
        while let Some((frame, target_from_frame)) = queue.pop_front() {
            for &(next, frame_from_next) in graph.get(frame).into_iter().flatten() {
                if !visited.insert(next) {
                    continue;
                }
                let target_from_next = target_from_frame * frame_from_next;
                if next == source {
                    return Some(target_from_next);
                }
                queue.push_back((next, target_from_next));
            }
        }
        None
    }

    /// Pick the transform closest to `time_ns`, or the latest one.
    fn select(transforms: &[TimestampedTransform], time_ns: Option<i64>) -> Option<Isometry3<f64>> {
        let selected = match time_ns {
            Some(target_time) => transforms
                .iter()
                .min_by_key(|t| (t.stamp_ns - target_time).abs())?,
            None => transforms.iter().max_by_key(|t| t.stamp_ns)?,
        };
        Some(selected.transform)
    }
}

impl TransformOracle for TfBuffer {
    fn lookup(
        &self,
        target: &str,
        source: &str,
        time_ns: Option<i64>,
        timeout: Duration,
    ) -> Result<Isometry3<f64>, TransformError> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.generation.lock();
            if let Some(transform) = self.try_lookup(target, source, time_ns) {
                return Ok(transform);
            }
            if timeout.is_zero() {
                debug!(target: LOGGER_NAME, "Transform not found: {} -> {}", source, target);
                return Err(TransformError::NotFound);
            }

            let mut generation = self.generation.lock();
            while *generation == seen {
                if self.changed.wait_until(&mut generation, deadline).timed_out() {
                    debug!(
                        target: LOGGER_NAME,
                        "Timed out waiting for {} -> {}", source, target
                    );
                    return Err(TransformError::Timeout(timeout));
                }
            }
        }
    }
}

impl TransformPublisher for TfBuffer {
    fn publish(&self, transform: &Isometry3<f64>, parent: &str, child: &str, stamp_ns: i64) {
        self.set_transform(parent, child, *transform, stamp_ns, false);
    }
}

/// One recorded publication.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedTransform {
    pub transform: Isometry3<f64>,
    pub parent: String,
    pub child: String,
    pub stamp_ns: i64,
}

/// Publisher that keeps every transform it is handed.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<PublishedTransform>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedTransform> {
        self.records.lock().clone()
    }

    pub fn last(&self) -> Option<PublishedTransform> {
        self.records.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl TransformPublisher for RecordingPublisher {
    fn publish(&self, transform: &Isometry3<f64>, parent: &str, child: &str, stamp_ns: i64) {
        self.records.lock().push(PublishedTransform {
            transform: *transform,
            parent: parent.to_string(),
            child: child.to_string(),
            stamp_ns,
        });
    }
}

/// Apply `transform` to every point.
pub fn apply_isometry(transform: &Isometry3<f64>, points: &[[f32; 3]]) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|p| {
            let pt = nalgebra::Point3::new(p[0] as f64, p[1] as f64, p[2] as f64);
            let transformed = transform * pt;
            [
                transformed.x as f32,
                transformed.y as f32,
                transformed.z as f32,
            ]
        })
        .collect()
}

fn normalize(frame: &str) -> &str {
    frame.trim_start_matches('/')
}

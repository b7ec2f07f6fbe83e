//! The localization node and its event executor.
//!
//! [`DllNode::handle`] is the single entry point for ticks, clouds, IMU
//! samples and initial poses. [`NodeRuntime`] runs a node on a worker
//! thread, generating ticks at the configured rate and serializing every
//! producer through one channel, so the controller state needs no locking.
//! Other threads read the correction through a [`CorrectionHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dll_core::{Aligner, Pose4, SolveResult};
use nalgebra::{Isometry3, Quaternion, UnitQuaternion};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::controller::{ControllerState, UpdateController, UpdateThresholds};
use crate::error::NodeError;
use crate::log_throttle::LogThrottle;
use crate::params::{same_frame, DllParams};
use crate::pointcloud::{PointCloudFrame, Preprocessor};
use crate::tf_handler::{TransformOracle, TransformPublisher};

const NODE_NAME: &str = "dll_localizer";

/// Orientation reported by the IMU, as `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub orientation: [f64; 4],
}

impl ImuSample {
    pub fn from_rpy(roll: f64, pitch: f64, yaw: f64) -> Self {
        let q = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        Self {
            orientation: [q.i, q.j, q.k, q.w],
        }
    }
}

/// Externally supplied pose of the base in `frame_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialPoseMsg {
    pub frame_id: String,
    pub pose: Isometry3<f64>,
}

/// Everything the node reacts to.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Tick { now_ns: i64 },
    Cloud(PointCloudFrame),
    Imu(ImuSample),
    InitialPose(InitialPoseMsg),
}

/// Time source for ticks, in nanoseconds.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i64;
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// Shared read access to `T_map_odom`.
#[derive(Debug, Clone)]
pub struct CorrectionHandle(Arc<RwLock<Isometry3<f64>>>);

impl CorrectionHandle {
    fn new(initial: Isometry3<f64>) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    /// Snapshot of the latest committed correction.
    pub fn get(&self) -> Isometry3<f64> {
        *self.0.read()
    }

    fn set(&self, correction: Isometry3<f64>) {
        *self.0.write() = correction;
    }
}

/// Localization node: controller, preprocessor and aligner wired to the
/// transform oracle and publisher.
pub struct DllNode {
    params: DllParams,
    controller: UpdateController,
    preprocessor: Preprocessor,
    aligner: Box<dyn Aligner>,
    oracle: Arc<dyn TransformOracle>,
    publisher: Arc<dyn TransformPublisher>,
    correction: CorrectionHandle,
    /// Configured seed, applied once odometry is available.
    pending_seed: Option<Pose4>,
    /// Latest `(roll, pitch)` from the IMU.
    imu_attitude: (f64, f64),
    tf_throttle: LogThrottle,
    cancel: Arc<AtomicBool>,
    last_result: Option<SolveResult>,
}

impl DllNode {
    pub fn new(
        params: DllParams,
        aligner: Box<dyn Aligner>,
        oracle: Arc<dyn TransformOracle>,
        publisher: Arc<dyn TransformPublisher>,
    ) -> Result<Self, NodeError> {
        params.validate()?;

        let controller = UpdateController::new(UpdateThresholds::from_params(&params));
        let preprocessor = Preprocessor::new(
            &params.base_frame_id,
            params.range_min_sq,
            params.range_max_sq,
            params.sensor_timeout(),
        );
        let tf_throttle = LogThrottle::new(params.throttle_period());

        let mut node = Self {
            pending_seed: params.seed_pose(),
            params,
            controller,
            preprocessor,
            aligner,
            oracle,
            publisher,
            correction: CorrectionHandle::new(Isometry3::identity()),
            imu_attitude: (0.0, 0.0),
            tf_throttle,
            cancel: Arc::new(AtomicBool::new(false)),
            last_result: None,
        };

        info!(
            target: NODE_NAME,
            "Localizer ready: {} aligner, frames {} -> {} -> {}",
            node.aligner.method(),
            node.params.global_frame_id,
            node.params.odom_frame_id,
            node.params.base_frame_id
        );
        node.try_apply_seed();
        Ok(node)
    }

    pub fn params(&self) -> &DllParams {
        &self.params
    }

    pub fn controller(&self) -> &UpdateController {
        &self.controller
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    pub fn correction_handle(&self) -> CorrectionHandle {
        self.correction.clone()
    }

    /// Flag that cancels a running solve and stops [`NodeRuntime`].
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Outcome of the most recent solve attempt.
    pub fn last_result(&self) -> Option<&SolveResult> {
        self.last_result.as_ref()
    }

    pub fn imu_attitude(&self) -> (f64, f64) {
        self.imu_attitude
    }

    /// Drop the memoized sensor-to-base transform.
    pub fn reset_sensor_cache(&mut self) {
        self.preprocessor.reset_sensor_cache();
    }

    /// Apply one event. Failures are logged and leave the state unchanged.
    pub fn handle(&mut self, event: NodeEvent) {
        let outcome = match event {
            NodeEvent::Tick { now_ns } => self.on_tick(now_ns),
            NodeEvent::Cloud(frame) => self.on_cloud(&frame).map(|_| ()),
            NodeEvent::Imu(sample) => {
                self.on_imu(&sample);
                Ok(())
            }
            NodeEvent::InitialPose(msg) => self.on_initial_pose(&msg),
        };
        if let Err(err) = outcome {
            self.report(err);
        }
    }

    fn report(&mut self, err: NodeError) {
        match err {
            NodeError::TransformUnavailable { .. } => {
                if let Some(suppressed) = self.tf_throttle.check() {
                    if suppressed > 0 {
                        debug!(target: NODE_NAME, "{err} ({suppressed} similar suppressed)");
                    } else {
                        debug!(target: NODE_NAME, "{err}");
                    }
                }
            }
            other => warn!(target: NODE_NAME, "{other}"),
        }
    }

    fn lookup_odom(&self, timeout: Duration) -> Result<Isometry3<f64>, NodeError> {
        let target = &self.params.odom_frame_id;
        let source = &self.params.base_frame_id;
        self.oracle
            .lookup(target, source, None, timeout)
            .map_err(|cause| NodeError::TransformUnavailable {
                target: target.clone(),
                source_frame: source.clone(),
                cause,
            })
    }

    fn try_apply_seed(&mut self) {
        let Some(seed) = self.pending_seed else {
            return;
        };
        match self.apply_initial_pose(seed, Duration::ZERO) {
            Ok(()) => info!(
                target: NODE_NAME,
                "Seeded at ({:.3}, {:.3}, {:.3}), yaw {:.3}",
                seed.x,
                seed.y,
                seed.z,
                seed.yaw
            ),
            Err(err) => self.report(err),
        }
    }

    /// Publish, then evaluate the thresholds.
    fn on_tick(&mut self, now_ns: i64) -> Result<(), NodeError> {
        self.try_apply_seed();
        if !self.controller.is_initialized() {
            return Ok(());
        }

        self.publisher.publish(
            self.controller.correction(),
            &self.params.global_frame_id,
            &self.params.odom_frame_id,
            now_ns,
        );

        if self.controller.state() != ControllerState::Idle {
            return Ok(());
        }
        let odom = self.lookup_odom(Duration::ZERO)?;
        self.controller.check_thresholds(&odom, now_ns);
        Ok(())
    }

    fn on_imu(&mut self, sample: &ImuSample) {
        if !self.params.use_imu {
            return;
        }
        let [x, y, z, w] = sample.orientation;
        let q = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
        let (roll, pitch, yaw) = q.euler_angles();
        if roll.is_nan() || pitch.is_nan() || yaw.is_nan() {
            debug!(target: NODE_NAME, "Ignoring IMU sample with NaN attitude");
            return;
        }
        self.imu_attitude = (roll, pitch);
    }

    fn on_initial_pose(&mut self, msg: &InitialPoseMsg) -> Result<(), NodeError> {
        if !same_frame(&msg.frame_id, &self.params.global_frame_id) {
            return Err(NodeError::InitialPoseRejected {
                received: msg.frame_id.clone(),
                expected: self.params.global_frame_id.clone(),
            });
        }

        let pose = Pose4::from_isometry(&msg.pose);
        self.apply_initial_pose(pose, self.params.odom_timeout())?;
        info!(
            target: NODE_NAME,
            "Initial pose ({:.3}, {:.3}, {:.3}), yaw {:.3}",
            pose.x,
            pose.y,
            pose.z + self.params.initial_z_offset,
            pose.yaw
        );
        Ok(())
    }

    /// Anchor the correction at `pose` for the current odometry.
    fn apply_initial_pose(&mut self, pose: Pose4, timeout: Duration) -> Result<(), NodeError> {
        let odom = self.lookup_odom(timeout)?;
        let (roll, pitch) = if self.params.use_imu {
            self.imu_attitude
        } else {
            let (roll, pitch, _) = odom.rotation.euler_angles();
            (roll, pitch)
        };

        let pose = Pose4 {
            z: pose.z + self.params.initial_z_offset,
            ..pose
        };
        self.controller.seed(&pose.to_isometry(roll, pitch), &odom);
        self.correction.set(*self.controller.correction());
        self.pending_seed = None;
        Ok(())
    }

    /// Solve on a cloud if a trigger is pending.
    fn on_cloud(&mut self, frame: &PointCloudFrame) -> Result<Option<SolveResult>, NodeError> {
        match self.controller.state() {
            ControllerState::Pending => {}
            ControllerState::Uninit => {
                debug!(target: NODE_NAME, "Not initialized, dropping cloud");
                return Ok(None);
            }
            ControllerState::Idle | ControllerState::Solving => return Ok(None),
        }

        let odom = self.lookup_odom(self.params.odom_timeout())?;
        let prior = self.controller.prior(&odom);
        let (roll, pitch) = if self.params.use_imu {
            self.imu_attitude
        } else {
            let (roll, pitch, _) = prior.rotation.euler_angles();
            (roll, pitch)
        };

        let (points, stats) =
            self.preprocessor
                .process(frame, self.oracle.as_ref(), roll, pitch)?;
        debug!(
            target: NODE_NAME,
            "Cloud {}: {} of {} points kept",
            frame.stamp_ns,
            stats.points_kept,
            stats.points_in
        );

        let prior = Pose4::from_isometry(&prior);
        self.controller.begin_solve();
        let started = Instant::now();
        let result = self.aligner.align(&points, prior, Some(self.cancel.as_ref()));

        let correction = if result.status.is_usable() {
            Some(result.pose.to_isometry(roll, pitch) * odom.inverse())
        } else {
            None
        };
        self.controller.finish_solve(&odom, correction);

        match correction {
            Some(correction) => {
                self.correction.set(correction);
                debug!(
                    target: NODE_NAME,
                    "Corrected in {} iterations ({:.1} ms): cost {:.4e} -> {:.4e}, pose ({:.3}, {:.3}, {:.3}), yaw {:.3}",
                    result.iterations,
                    started.elapsed().as_secs_f64() * 1e3,
                    result.initial_cost,
                    result.final_cost,
                    result.pose.x,
                    result.pose.y,
                    result.pose.z,
                    result.pose.yaw
                );
            }
            None => self.report(NodeError::SolverDiverged(format!(
                "{:?} after {} iterations with {} points, correction kept",
                result.status, result.iterations, result.num_points
            ))),
        }

        self.last_result = Some(result.clone());
        Ok(Some(result))
    }
}

/// Runs a [`DllNode`] on its own thread.
pub struct NodeRuntime {
    sender: mpsc::Sender<NodeEvent>,
    shutdown: Arc<AtomicBool>,
    correction: CorrectionHandle,
    worker: Option<JoinHandle<DllNode>>,
}

impl NodeRuntime {
    /// Start the worker. Ticks are stamped with `clock`.
    pub fn spawn(node: DllNode, clock: Arc<dyn Clock>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let shutdown = node.cancel_flag();
        let correction = node.correction_handle();
        let worker_shutdown = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("dll_localizer".into())
            .spawn(move || run_worker(node, receiver, clock, worker_shutdown))?;

        Ok(Self {
            sender,
            shutdown,
            correction,
            worker: Some(worker),
        })
    }

    /// Producer handle for clouds, IMU samples and initial poses.
    pub fn sender(&self) -> mpsc::Sender<NodeEvent> {
        self.sender.clone()
    }

    pub fn correction(&self) -> CorrectionHandle {
        self.correction.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Stop the worker and hand the node back, ready to solve again.
    pub fn shutdown(mut self) -> Option<DllNode> {
        self.shutdown.store(true, Ordering::SeqCst);
        let node = self.worker.take().and_then(|worker| worker.join().ok())?;
        node.cancel.store(false, Ordering::SeqCst);
        Some(node)
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    mut node: DllNode,
    receiver: mpsc::Receiver<NodeEvent>,
    clock: Arc<dyn Clock>,
    shutdown: Arc<AtomicBool>,
) -> DllNode {
    let period = node.params().tick_period();
    let mut next_tick = Instant::now() + period;
    debug!(target: NODE_NAME, "Executor started, tick period {:?}", period);

    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next_tick {
            node.handle(NodeEvent::Tick {
                now_ns: clock.now_ns(),
            });
            next_tick += period;
            let after = Instant::now();
            if next_tick <= after {
                // Overran at least one period: fold the missed ticks into this one.
                let missed = (after - next_tick).as_nanos() / period.as_nanos().max(1) + 1;
                debug!(target: NODE_NAME, "Coalesced {missed} missed ticks");
                next_tick = after + period;
            }
            continue;
        }

        match receiver.recv_timeout(next_tick - now) {
            Ok(event) => node.handle(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(target: NODE_NAME, "Executor stopped");
    node
}

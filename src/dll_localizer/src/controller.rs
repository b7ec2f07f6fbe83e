//! Update controller: when to solve, and the map-to-odom correction.
//!
//! ```text
//! Uninit --seed / initial pose--> Idle --threshold--> Pending --cloud--> Solving --done--> Idle
//! ```
//!
//! The controller holds no I/O. The node feeds it odometry, clock ticks and
//! solve outcomes; it answers with state transitions and the correction.

use std::fmt;

use nalgebra::Isometry3;
use tracing::debug;

use crate::params::DllParams;

const LOGGER_NAME: &str = "dll_localizer.controller";

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    /// No pose seeded; clouds are discarded.
    #[default]
    Uninit,
    /// Publishing the correction, waiting for a trigger.
    Idle,
    /// A trigger fired; the next cloud is solved.
    Pending,
    /// A solve is running.
    Solving,
}

/// Which threshold fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Translation,
    Rotation,
    Time,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Translation => "translation",
            Trigger::Rotation => "rotation",
            Trigger::Time => "time",
        })
    }
}

/// Odometric motion and elapsed time that trigger a solve.
///
/// All comparisons are strict: a value exactly at the threshold does not
/// fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateThresholds {
    /// Meters.
    pub translation: f64,
    /// Radians, yaw only.
    pub rotation: f64,
    pub time_ns: i64,
}

impl UpdateThresholds {
    pub fn from_params(params: &DllParams) -> Self {
        Self {
            translation: params.update_min_d,
            rotation: params.update_min_a,
            time_ns: (params.update_min_time * 1e9).round() as i64,
        }
    }
}

/// Yaw of a transform in `(-π, π]`.
pub fn yaw_of(transform: &Isometry3<f64>) -> f64 {
    transform.rotation.euler_angles().2
}

/// Correction state machine.
#[derive(Debug, Clone)]
pub struct UpdateController {
    thresholds: UpdateThresholds,
    state: ControllerState,
    /// `T_map_odom`.
    correction: Isometry3<f64>,
    /// Odometry at the last seed or solve attempt.
    last_odom: Isometry3<f64>,
    /// Clock reference for the time threshold; set on the first tick after
    /// seeding and on every trigger.
    last_trigger_ns: Option<i64>,
}

impl UpdateController {
    pub fn new(thresholds: UpdateThresholds) -> Self {
        Self {
            thresholds,
            state: ControllerState::Uninit,
            correction: Isometry3::identity(),
            last_odom: Isometry3::identity(),
            last_trigger_ns: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state != ControllerState::Uninit
    }

    pub fn thresholds(&self) -> &UpdateThresholds {
        &self.thresholds
    }

    /// Current `T_map_odom`.
    pub fn correction(&self) -> &Isometry3<f64> {
        &self.correction
    }

    /// Odometry the thresholds are measured against.
    pub fn last_odom(&self) -> &Isometry3<f64> {
        &self.last_odom
    }

    /// `T_map_base` for the given `T_odom_base`.
    pub fn prior(&self, odom: &Isometry3<f64>) -> Isometry3<f64> {
        self.correction * odom
    }

    /// Anchor the correction so that `odom` maps to `map_base`, and go
    /// idle. Any pending trigger is dropped.
    pub fn seed(&mut self, map_base: &Isometry3<f64>, odom: &Isometry3<f64>) {
        self.correction = map_base * odom.inverse();
        self.last_odom = *odom;
        self.last_trigger_ns = None;
        self.state = ControllerState::Idle;
    }

    /// Evaluate the thresholds at `now_ns`. Only fires from
    /// [`ControllerState::Idle`]; on firing the controller becomes
    /// [`ControllerState::Pending`].
    pub fn check_thresholds(&mut self, odom: &Isometry3<f64>, now_ns: i64) -> Option<Trigger> {
        if self.state != ControllerState::Idle {
            return None;
        }
        let reference_ns = *self.last_trigger_ns.get_or_insert(now_ns);

        let delta = self.last_odom.inverse() * odom;
        let trigger = if delta.translation.vector.norm() > self.thresholds.translation {
            Some(Trigger::Translation)
        } else if yaw_of(&delta).abs() > self.thresholds.rotation {
            Some(Trigger::Rotation)
        } else if now_ns - reference_ns > self.thresholds.time_ns {
            Some(Trigger::Time)
        } else {
            None
        };

        if let Some(trigger) = trigger {
            debug!(target: LOGGER_NAME, "{trigger} threshold fired at {now_ns} ns");
            self.last_trigger_ns = Some(now_ns);
            self.state = ControllerState::Pending;
        }
        trigger
    }

    /// Pending -> Solving. Returns false in any other state.
    pub fn begin_solve(&mut self) -> bool {
        if self.state != ControllerState::Pending {
            return false;
        }
        self.state = ControllerState::Solving;
        true
    }

    /// Solving -> Idle. `correction` replaces `T_map_odom` when present;
    /// either way thresholds are measured from `odom` again.
    pub fn finish_solve(&mut self, odom: &Isometry3<f64>, correction: Option<Isometry3<f64>>) {
        if let Some(correction) = correction {
            self.correction = correction;
        }
        self.last_odom = *odom;
        self.state = ControllerState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    const SEC: i64 = 1_000_000_000;

    fn iso(x: f64, y: f64, z: f64, yaw: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(x, y, z),
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
        )
    }

    fn thresholds(d: f64, a: f64, t: f64) -> UpdateThresholds {
        UpdateThresholds {
            translation: d,
            rotation: a,
            time_ns: (t * 1e9) as i64,
        }
    }

    fn seeded(th: UpdateThresholds) -> UpdateController {
        let mut controller = UpdateController::new(th);
        controller.seed(&Isometry3::identity(), &Isometry3::identity());
        controller
    }

    #[test]
    fn test_starts_uninitialized() {
        let mut controller = UpdateController::new(thresholds(0.1, 0.1, 1.0));
        assert_eq!(controller.state(), ControllerState::Uninit);
        assert!(!controller.is_initialized());
        assert_eq!(controller.check_thresholds(&iso(5.0, 0.0, 0.0, 0.0), 10 * SEC), None);
        assert!(!controller.begin_solve());
    }

    #[test]
    fn test_seed_then_prior_round_trips() {
        let mut controller = UpdateController::new(thresholds(0.1, 0.1, 1.0));
        let pose = iso(1.0, 2.0, 0.5, std::f64::consts::FRAC_PI_2);
        let odom = iso(0.3, -0.1, 0.0, 0.2);
        controller.seed(&pose, &odom);

        let prior = controller.prior(&odom);
        assert_relative_eq!(prior.translation.vector, pose.translation.vector, epsilon = 1e-12);
        assert_relative_eq!(yaw_of(&prior), yaw_of(&pose), epsilon = 1e-12);
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_translation_threshold_is_strict() {
        let mut controller = seeded(thresholds(0.5, 10.0, 100.0));
        assert_eq!(controller.check_thresholds(&iso(0.5, 0.0, 0.0, 0.0), 0), None);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(
            controller.check_thresholds(&iso(0.5000001, 0.0, 0.0, 0.0), SEC / 10),
            Some(Trigger::Translation)
        );
        assert_eq!(controller.state(), ControllerState::Pending);
    }

    #[test]
    fn test_rotation_threshold_uses_yaw_delta() {
        let mut controller = seeded(thresholds(10.0, 0.1, 100.0));
        assert_eq!(controller.check_thresholds(&iso(0.0, 0.0, 0.0, 0.09), 0), None);
        assert_eq!(
            controller.check_thresholds(&iso(0.0, 0.0, 0.0, -0.15), 0),
            Some(Trigger::Rotation)
        );
    }

    #[test]
    fn test_time_threshold_measured_from_first_tick() {
        let mut controller = seeded(thresholds(10.0, 10.0, 0.5));
        let odom = Isometry3::identity();
        assert_eq!(controller.check_thresholds(&odom, 2 * SEC), None);
        assert_eq!(controller.check_thresholds(&odom, 2 * SEC + SEC / 2), None);
        assert_eq!(
            controller.check_thresholds(&odom, 2 * SEC + SEC / 2 + 1),
            Some(Trigger::Time)
        );
    }

    #[test]
    fn test_only_idle_fires() {
        let mut controller = seeded(thresholds(0.1, 0.1, 100.0));
        let moved = iso(1.0, 0.0, 0.0, 0.0);
        assert!(controller.check_thresholds(&moved, 0).is_some());
        assert_eq!(controller.check_thresholds(&moved, 0), None);
        assert!(controller.begin_solve());
        assert_eq!(controller.state(), ControllerState::Solving);
        assert_eq!(controller.check_thresholds(&moved, 0), None);
    }

    #[test]
    fn test_failed_solve_keeps_correction_and_resets_reference() {
        let mut controller = seeded(thresholds(0.1, 0.1, 100.0));
        let moved = iso(1.0, 0.0, 0.0, 0.0);
        controller.check_thresholds(&moved, 0);
        controller.begin_solve();
        controller.finish_solve(&moved, None);

        assert_eq!(controller.state(), ControllerState::Idle);
        assert_eq!(*controller.correction(), Isometry3::identity());
        assert_eq!(*controller.last_odom(), moved);
        assert_eq!(controller.check_thresholds(&moved, 1), None);
    }

    #[test]
    fn test_successful_solve_replaces_correction() {
        let mut controller = seeded(thresholds(0.1, 0.1, 100.0));
        let moved = iso(1.0, 0.0, 0.0, 0.0);
        controller.check_thresholds(&moved, 0);
        controller.begin_solve();
        let correction = iso(0.05, -0.02, 0.0, 0.01);
        controller.finish_solve(&moved, Some(correction));
        assert_eq!(*controller.correction(), correction);
    }

    #[test]
    fn test_reseed_clears_pending() {
        let mut controller = seeded(thresholds(0.1, 0.1, 100.0));
        controller.check_thresholds(&iso(1.0, 0.0, 0.0, 0.0), 0);
        assert_eq!(controller.state(), ControllerState::Pending);
        controller.seed(&iso(3.0, 0.0, 0.0, 0.0), &Isometry3::identity());
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_thresholds_from_params() {
        let th = UpdateThresholds::from_params(&DllParams::default());
        assert_eq!(th.translation, 0.1);
        assert_eq!(th.rotation, 0.1);
        assert_eq!(th.time_ns, SEC);
    }
}

//! # motion
//!
//! Shared plumbing for the two motion controllers. Both speak the same
//! tank-drive vocabulary through the MCU bridge and both follow the
//! stop-and-settle discipline: every motor command is a short burst ending
//! in an explicit stop plus a settle pause, and sensors are only trusted
//! while the vehicle is stationary. The stop flag is checked around every
//! await; whoever spawns a controller clears or sets it, and an
//! unconditional motor stop always goes out on the way down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use rover_types::NO_RANGE;

use crate::mapper::{GroundPose, Mapper};
use crate::mcu_bridge::McuBridge;
use crate::status::SharedStatus;

// ── Tuning ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionTuning {
    /// Forward PWM magnitude
    pub drive_speed: i32,
    pub turn_speed: i32,
    pub reverse_speed: i32,
    pub forward_burst_ms: u64,
    pub turn_step_ms: u64,
    pub reverse_burst_ms: u64,
    /// Pause after each stop before sensors are trusted
    pub settle_ms: u64,
    /// Ultrasonic floor below which forward motion is refused
    pub obstacle_near_cm: i32,
    /// Grid look-ahead distance for `is_path_clear`
    pub lookahead_m: f64,
    /// Half the vehicle width, for the side rays
    pub half_width_m: f64,
}

impl Default for MotionTuning {
    fn default() -> Self {
        Self {
            drive_speed: 140,
            turn_speed: 120,
            reverse_speed: 120,
            forward_burst_ms: 250,
            turn_step_ms: 200,
            reverse_burst_ms: 400,
            settle_ms: 300,
            obstacle_near_cm: 20,
            lookahead_m: 0.5,
            half_width_m: 0.12,
        }
    }
}

/// How long a controller waits for the mapper's first accepted update
/// before giving up (pose source absent).
const FIRST_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Spin-step bound for a 360° scan; well past what 2π needs, so a slipping
/// track cannot spin forever.
const MAX_SCAN_STEPS: u32 = 60;

/// Wrap an angle difference to [-π, π].
pub fn wrap_angle(a: f64) -> f64 {
    a.sin().atan2(a.cos())
}

// ── Controller context ────────────────────────────────────────────────────────

/// Everything a controller needs, cloneable per spawn.
#[derive(Clone)]
pub struct MotionCtx {
    pub bridge: McuBridge,
    pub mapper: Arc<RwLock<Mapper>>,
    pub status: SharedStatus,
    pub tuning: MotionTuning,
    pub stop: Arc<AtomicBool>,
    pub range: watch::Receiver<i32>,
}

impl MotionCtx {
    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Latest forward ultrasonic reading, centimetres.
    pub fn range_cm(&self) -> i32 {
        *self.range.borrow()
    }

    pub async fn pose(&self) -> Option<GroundPose> {
        self.mapper.read().await.latest_pose()
    }

    /// Stop the motors and wait out the settle window.
    pub async fn settle(&self) {
        self.bridge.stop_motors();
        sleep(Duration::from_millis(self.tuning.settle_ms)).await;
    }

    /// Drive forward for one burst, then stop and settle.
    pub async fn forward_burst(&self) {
        let s = self.tuning.drive_speed;
        self.bridge.set_motors(s, s);
        sleep(Duration::from_millis(self.tuning.forward_burst_ms)).await;
        self.settle().await;
    }

    /// Back out of a dead end, then stop and settle.
    pub async fn reverse_burst(&self) {
        let s = self.tuning.reverse_speed;
        self.bridge.set_motors(-s, -s);
        sleep(Duration::from_millis(self.tuning.reverse_burst_ms)).await;
        self.settle().await;
    }

    /// One in-place rotation step; `dir` +1 turns toward +heading.
    pub async fn rotate_step(&self, dir: i32) {
        let s = self.tuning.turn_speed;
        self.bridge.set_motors(-s * dir.signum(), s * dir.signum());
        sleep(Duration::from_millis(self.tuning.turn_step_ms)).await;
        self.settle().await;
    }

    /// Grid clearance straight ahead of `pose` at an arbitrary heading.
    pub async fn path_clear_at(&self, pose: &GroundPose, heading: f64) -> bool {
        self.mapper.read().await.grid().is_path_clear(
            pose.x,
            pose.z,
            heading,
            self.tuning.lookahead_m,
            self.tuning.half_width_m,
        )
    }

    /// Ultrasonic says open AND the grid agrees along the current heading.
    pub async fn forward_is_open(&self, pose: &GroundPose) -> bool {
        let range = self.range_cm();
        range != NO_RANGE
            && range > self.tuning.obstacle_near_cm
            && self.path_clear_at(pose, pose.heading).await
    }

    /// Block until the mapper has fused at least one reading. Returns false
    /// on timeout: the pose source or the MCU is silent, and the mode runs
    /// without producing motion.
    pub async fn wait_for_first_update(&self) -> bool {
        let deadline = Instant::now() + FIRST_UPDATE_TIMEOUT;
        loop {
            if self.stopped() {
                return false;
            }
            if self.mapper.read().await.has_accepted_update() {
                return true;
            }
            if timeout(
                deadline.saturating_duration_since(Instant::now()),
                sleep(Duration::from_millis(200)),
            )
            .await
            .is_err()
            {
                debug!("no accepted mapper update within {FIRST_UPDATE_TIMEOUT:?}");
                return false;
            }
        }
    }

    /// Recorded 360° in-place scan: spin-step, settle, integrate |Δheading|
    /// until a full turn accumulates.
    pub async fn full_scan(&self, dir: i32) {
        let mut prev = match self.pose().await {
            Some(p) => p.heading,
            None => return,
        };
        self.mapper.write().await.start_scan_recording();

        let mut accumulated = 0.0;
        let mut steps = 0;
        while accumulated < std::f64::consts::TAU && steps < MAX_SCAN_STEPS && !self.stopped() {
            self.rotate_step(dir).await;
            steps += 1;
            if let Some(p) = self.pose().await {
                accumulated += wrap_angle(p.heading - prev).abs();
                prev = p.heading;
            }
        }

        let outcome = self.mapper.write().await.stop_scan_recording();
        debug!("360° scan done after {steps} steps: {outcome:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI, TAU};

    #[test]
    fn wrap_angle_stays_in_pi_range() {
        assert!((wrap_angle(TAU + 0.1) - 0.1).abs() < 1e-9);
        assert!((wrap_angle(-TAU - 0.1) + 0.1).abs() < 1e-9);
        assert!((wrap_angle(PI + FRAC_PI_2) + FRAC_PI_2).abs() < 1e-9);
        assert!(wrap_angle(0.0).abs() < 1e-12);
    }

    #[test]
    fn default_tuning_is_sane() {
        let t = MotionTuning::default();
        assert!(t.obstacle_near_cm > 0);
        assert!(t.forward_burst_ms >= 100);
        assert!(t.half_width_m < t.lookahead_m);
    }
}

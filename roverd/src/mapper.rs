//! # mapper
//!
//! Fuses the external pose stream with ultrasonic ranges into the occupancy
//! grid. Owns the drift offset (updated only by scan matches), the velocity
//! gate that rejects physically implausible jumps from the pose source, the
//! bounded raw-reading log, and scan recording for drift correction.
//!
//! Ordering contract: a range always fuses with the *latest* pose; there is
//! no back-dated fusion. Callers deliver poses and ranges from one source in
//! arrival order.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use rover_types::{Pose, NO_RANGE};

use crate::grid::{GridSnapshot, OccupancyGrid, UpdateOutcome};
use crate::scan_match::{match_scans, ScanProfile, ScanReading, MIN_CORRECTION_M, MIN_SCAN_READINGS};

/// Pose-source jumps faster than this are rejected.
const MAX_PLAUSIBLE_SPEED_MPS: f64 = 1.0;
/// After this many consecutive velocity rejects the source has probably
/// re-initialised; the next position is adopted as the new baseline.
const REJECTS_BEFORE_REBASE: u32 = 5;
/// Raw-reading log bound.
const RAW_LOG_CAP: usize = 5000;

// ── Types ─────────────────────────────────────────────────────────────────────

/// Latest pose reduced to the ground plane, drift already applied.
#[derive(Debug, Clone, Copy)]
pub struct GroundPose {
    pub x: f64,
    pub z: f64,
    pub heading: f64,
    pub ts_ns: u64,
}

/// One raw-log entry: `(x, z, heading, dist_cm, accepted, pose_ts)`.
pub type RawReading = (f64, f64, f64, i32, bool, u64);

/// Result of `stop_scan_recording`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanOutcome {
    /// Fewer than MIN_SCAN_READINGS readings; buffer dropped
    Discarded,
    /// First usable profile of the session; stored as the reference
    ReferenceStored,
    /// Matched against the reference; offset applied when above the floor
    Corrected { dx: f64, dz: f64 },
    /// Match was unreliable; drift untouched
    NoMatch,
}

/// Counter block surfaced through `get_status` and the map snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MapperCounters {
    pub updates: u64,
    pub rejected: u64,
    pub corrections: u64,
    /// Times the velocity gate gave up and re-based (auditable; a wildly
    /// drifting pose source shows up here)
    pub baseline_adoptions: u64,
}

/// Everything persisted on `stop_map`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapSnapshot {
    #[serde(flatten)]
    pub grid: GridSnapshot,
    pub updates: u64,
    pub rejected: u64,
    pub corrections: u64,
    pub raw_log: Vec<RawReading>,
}

// ── Mapper ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Mapper {
    grid: OccupancyGrid,
    drift: (f64, f64),
    latest: Option<GroundPose>,
    /// Last velocity-accepted position/time
    last_accept: Option<(f64, f64, u64)>,
    consec_rejects: u32,
    counters: MapperCounters,
    recording: bool,
    scan_buf: Vec<ScanReading>,
    reference: Option<ScanProfile>,
    raw_log: VecDeque<RawReading>,
    last_hit: (f64, f64),
}

impl Mapper {
    pub fn new() -> Self {
        Self { last_hit: (f64::NAN, f64::NAN), ..Self::default() }
    }

    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    pub fn counters(&self) -> MapperCounters {
        self.counters
    }

    pub fn drift_offset(&self) -> (f64, f64) {
        self.drift
    }

    pub fn latest_pose(&self) -> Option<GroundPose> {
        self.latest
    }

    /// World position of the most recent in-band hit; NaN after an
    /// out-of-band reading.
    pub fn last_hit(&self) -> (f64, f64) {
        self.last_hit
    }

    pub fn has_accepted_update(&self) -> bool {
        self.counters.updates > 0
    }

    /// Ingest one pose. The drift offset is applied before anything else
    /// sees the position.
    pub fn on_pose(&mut self, pose: Pose) {
        let x = pose.tx + self.drift.0;
        let z = pose.tz + self.drift.1;
        self.latest = Some(GroundPose { x, z, heading: pose.heading(), ts_ns: pose.ts_ns });
        self.grid.push_trail(x, z);
    }

    /// Ingest one ultrasonic reading (integer centimetres; -1 = none yet).
    /// Returns true when the reading was fused into the grid.
    pub fn on_range_cm(&mut self, dist_cm: i32) -> bool {
        if dist_cm == NO_RANGE || dist_cm < 0 {
            return false;
        }
        let pose = match self.latest {
            Some(p) => p,
            None => return false,
        };

        if !self.velocity_gate(&pose) {
            self.counters.rejected += 1;
            self.push_raw(&pose, dist_cm, false);
            return false;
        }

        let range_m = dist_cm as f64 / 100.0;
        let (outcome, hit) = self.grid.update(pose.x, pose.z, pose.heading, range_m);
        match outcome {
            UpdateOutcome::Applied => {
                let (hx, hz) = hit.unwrap_or((f64::NAN, f64::NAN));
                self.last_hit = (hx, hz);
                self.counters.updates += 1;
                self.push_raw(&pose, dist_cm, true);
                // An applied update is by definition inside the scan band
                if self.recording {
                    self.scan_buf.push(ScanReading {
                        heading: pose.heading,
                        range_m,
                        hit_x: hx,
                        hit_z: hz,
                    });
                }
                true
            }
            UpdateOutcome::OutOfBand => {
                self.last_hit = (f64::NAN, f64::NAN);
                self.counters.rejected += 1;
                self.push_raw(&pose, dist_cm, false);
                false
            }
        }
    }

    /// Gate on inferred speed between consecutive range updates. A pose
    /// source that re-initialises teleports the robot; five rejects in a row
    /// means it is not coming back, so the new position becomes the baseline.
    fn velocity_gate(&mut self, pose: &GroundPose) -> bool {
        let (lx, lz, lt) = match self.last_accept {
            Some(v) => v,
            None => {
                self.last_accept = Some((pose.x, pose.z, pose.ts_ns));
                return true;
            }
        };

        let dt_s = pose.ts_ns.saturating_sub(lt) as f64 / 1e9;
        if dt_s > 0.0 {
            let dist = ((pose.x - lx).powi(2) + (pose.z - lz).powi(2)).sqrt();
            if dist / dt_s > MAX_PLAUSIBLE_SPEED_MPS {
                self.consec_rejects += 1;
                if self.consec_rejects > REJECTS_BEFORE_REBASE {
                    info!(
                        "velocity gate: {} consecutive rejects, adopting ({:.2}, {:.2}) as new baseline",
                        self.consec_rejects - 1, pose.x, pose.z
                    );
                    self.counters.baseline_adoptions += 1;
                } else {
                    debug!("velocity gate: rejected {:.2} m in {:.3} s", dist, dt_s);
                    return false;
                }
            }
        }
        self.consec_rejects = 0;
        self.last_accept = Some((pose.x, pose.z, pose.ts_ns));
        true
    }

    fn push_raw(&mut self, pose: &GroundPose, dist_cm: i32, accepted: bool) {
        if self.raw_log.len() >= RAW_LOG_CAP {
            self.raw_log.pop_front();
        }
        self.raw_log
            .push_back((pose.x, pose.z, pose.heading, dist_cm, accepted, pose.ts_ns));
    }

    // ── Scan recording & drift correction ─────────────────────────────────────

    pub fn is_scan_recording(&self) -> bool {
        self.recording
    }

    pub fn start_scan_recording(&mut self) {
        self.scan_buf.clear();
        self.recording = true;
    }

    /// Close the current scan buffer. The first usable profile becomes the
    /// reference; later ones are matched and the median offset folded into
    /// the drift.
    pub fn stop_scan_recording(&mut self) -> ScanOutcome {
        self.recording = false;
        let readings = std::mem::take(&mut self.scan_buf);
        if readings.len() < MIN_SCAN_READINGS {
            debug!("scan discarded: only {} readings", readings.len());
            return ScanOutcome::Discarded;
        }
        let profile = ScanProfile { readings };

        let reference = match &self.reference {
            None => {
                info!("scan reference stored ({} readings)", profile.readings.len());
                self.reference = Some(profile);
                return ScanOutcome::ReferenceStored;
            }
            Some(r) => r,
        };

        match match_scans(reference, &profile) {
            Some((dx, dz)) => {
                // The candidate appears shifted by (dx, dz); compensate.
                self.drift.0 -= dx;
                self.drift.1 -= dz;
                if (dx * dx + dz * dz).sqrt() > MIN_CORRECTION_M {
                    self.counters.corrections += 1;
                    info!("drift corrected by ({:.3}, {:.3}) m", -dx, -dz);
                }
                ScanOutcome::Corrected { dx, dz }
            }
            None => {
                debug!("scan match unreliable, drift unchanged");
                ScanOutcome::NoMatch
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Wipe the map. Counters, drift and the scan reference survive a clear;
    /// `stop_map` persists and then calls this.
    pub fn clear_grid(&mut self) {
        self.grid.clear();
    }

    pub fn snapshot(&self) -> MapSnapshot {
        MapSnapshot {
            grid: self.grid.snapshot(),
            updates: self.counters.updates,
            rejected: self.counters.rejected,
            corrections: self.counters.corrections,
            raw_log: self.raw_log.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(ts_s: f64, x: f64, z: f64) -> Pose {
        Pose::on_ground((ts_s * 1e9) as u64, x, z, 0.0)
    }

    #[test]
    fn range_needs_a_pose_first() {
        let mut m = Mapper::new();
        assert!(!m.on_range_cm(30));
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        assert!(m.on_range_cm(30));
    }

    #[test]
    fn sentinel_range_ignored() {
        let mut m = Mapper::new();
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        assert!(!m.on_range_cm(NO_RANGE));
        assert_eq!(m.counters().updates, 0);
        assert_eq!(m.counters().rejected, 0);
    }

    #[test]
    fn out_of_band_sets_nan_hit() {
        let mut m = Mapper::new();
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        assert!(m.on_range_cm(30));
        assert!(m.last_hit().0.is_finite());
        assert!(!m.on_range_cm(90));
        assert!(m.last_hit().0.is_nan());
        assert_eq!(m.counters().rejected, 1);
    }

    #[test]
    fn velocity_gate_sequence() {
        let mut m = Mapper::new();
        // First update always accepted
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        assert!(m.on_range_cm(30));
        // 0.5 m in 1 s is fine
        m.on_pose(pose_at(2.0, 0.5, 0.0));
        assert!(m.on_range_cm(30));
        // Teleport 10 m: five consecutive rejects...
        for i in 0..5 {
            m.on_pose(pose_at(3.0 + i as f64 * 0.1, 10.0, 0.0));
            assert!(!m.on_range_cm(30), "reject #{}", i + 1);
        }
        // ...then the source is trusted again at the new position
        m.on_pose(pose_at(4.0, 10.0, 0.0));
        assert!(m.on_range_cm(30));
        assert_eq!(m.counters().baseline_adoptions, 1);
        assert_eq!(m.counters().rejected, 5);
        // And stays accepted for plausible motion from the new baseline
        m.on_pose(pose_at(5.0, 10.3, 0.0));
        assert!(m.on_range_cm(30));
    }

    #[test]
    fn drift_offset_shifts_subsequent_poses() {
        let mut m = Mapper::new();
        m.drift = (1.0, -2.0);
        m.on_pose(pose_at(1.0, 0.5, 0.5));
        let p = m.latest_pose().unwrap();
        assert!((p.x - 1.5).abs() < 1e-12);
        assert!((p.z + 1.5).abs() < 1e-12);
    }

    #[test]
    fn scan_recording_to_reference_then_correction() {
        let mut m = Mapper::new();
        m.start_scan_recording();
        // 12 in-band readings spread over a rotation
        for i in 0..12 {
            let h = i as f64 / 12.0 * std::f64::consts::TAU;
            m.on_pose(Pose::on_ground(1_000_000_000 + i as u64 * 100_000_000, 0.0, 0.0, h));
            assert!(m.on_range_cm(50));
        }
        assert_eq!(m.stop_scan_recording(), ScanOutcome::ReferenceStored);

        // Same room, same robot position: the candidate matches at ~zero
        m.start_scan_recording();
        for i in 0..12 {
            let h = i as f64 / 12.0 * std::f64::consts::TAU;
            m.on_pose(Pose::on_ground(3_000_000_000 + i as u64 * 100_000_000, 0.0, 0.0, h));
            assert!(m.on_range_cm(50));
        }
        match m.stop_scan_recording() {
            ScanOutcome::Corrected { dx, dz } => {
                assert!(dx.abs() < 1e-9 && dz.abs() < 1e-9);
            }
            other => panic!("expected correction, got {other:?}"),
        }
        // Sub-centimetre match does not count as a correction
        assert_eq!(m.counters().corrections, 0);
    }

    #[test]
    fn short_scan_discarded() {
        let mut m = Mapper::new();
        m.start_scan_recording();
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        m.on_range_cm(40);
        assert_eq!(m.stop_scan_recording(), ScanOutcome::Discarded);
    }

    #[test]
    fn raw_log_is_bounded() {
        let mut m = Mapper::new();
        for i in 0..(RAW_LOG_CAP + 100) {
            m.on_pose(pose_at(1.0 + i as f64 * 0.01, 0.0, 0.0));
            m.on_range_cm(30);
        }
        assert_eq!(m.snapshot().raw_log.len(), RAW_LOG_CAP);
    }

    #[test]
    fn snapshot_carries_counters() {
        let mut m = Mapper::new();
        m.on_pose(pose_at(1.0, 0.0, 0.0));
        m.on_range_cm(30);
        m.on_range_cm(95);
        let snap = m.snapshot();
        assert_eq!(snap.updates, 1);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.raw_log.len(), 2);
        let json = serde_json::to_string(&snap).unwrap();
        let back: MapSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.updates, 1);
        assert_eq!(back.grid.occupied.len(), snap.grid.occupied.len());
    }
}

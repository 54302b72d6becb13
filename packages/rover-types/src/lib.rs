//! # rover-types
//!
//! Shared data and wire types for the Rover Suite robot runtime.
//!
//! These types are used by:
//! - `roverd`: the phone-hosted robot runtime (mapper, bridges, wire hub)
//! - `mcu-sim`: the hardware-free microcontroller emulator
//! - host integration layers feeding poses / IMU / camera frames in
//!
//! ## Coordinate conventions
//!
//! - **World frame**: right-hand Cartesian, ground plane is X/Z, Y is up.
//! - **Body frame**: +X is robot-forward. Ground-plane heading is the angle
//!   of the rotated forward axis, `atan2(fwd_z, fwd_x)`, so heading 0 points
//!   down +X and heading π/2 points down +Z.
//! - Pose timestamps are monotonic nanoseconds from the pose source's clock.

use serde::{Deserialize, Serialize};

// ── Pose ──────────────────────────────────────────────────────────────────────

/// One 6-DoF pose sample from the external pose source.
///
/// Immutable by convention: the runtime never writes back into a pose, it
/// only derives ground-plane quantities from it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pose {
    /// Monotonic timestamp, nanoseconds
    pub ts_ns: u64,
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

impl Pose {
    /// Ground-plane heading: the unit quaternion applied to the body-forward
    /// axis (+X), projected onto (X, Z), taken as `atan2(fwd_z, fwd_x)`.
    pub fn heading(&self) -> f64 {
        let (x, y, z, w) = (self.qx, self.qy, self.qz, self.qw);
        // q * (1,0,0) * q⁻¹, first column of the rotation matrix
        let fwd_x = 1.0 - 2.0 * (y * y + z * z);
        let fwd_z = 2.0 * (x * z - w * y);
        fwd_z.atan2(fwd_x)
    }

    /// Construct a ground-plane pose at (x, z) facing `heading` radians.
    /// Rotation about the +Y (up) axis; used by replay tooling and tests.
    pub fn on_ground(ts_ns: u64, x: f64, z: f64, heading: f64) -> Self {
        // Rotating (1,0,0) about Y by -h lands on (cos h, 0, sin h)
        let half = -heading / 2.0;
        Self {
            ts_ns,
            tx: x,
            ty: 0.0,
            tz: z,
            qx: 0.0,
            qy: half.sin(),
            qz: 0.0,
            qw: half.cos(),
        }
    }
}

/// One phone-IMU sample (gyro rad/s, accel m/s²), as recorded to `imu0.csv`
/// and streamed on the `/imu` endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuSample {
    pub ts_ns: u64,
    pub wx: f64,
    pub wy: f64,
    pub wz: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

// ── MCU serial protocol ───────────────────────────────────────────────────────

/// Numeric command codes understood by the motor-driver firmware.
/// One JSON object per line, newline terminated, both directions.
pub mod cmd {
    pub const PING: u32 = 1;
    pub const STOP: u32 = 6;
    pub const SET_MOTORS: u32 = 7;
    pub const STATE_DUMP: u32 = 101;
    pub const SET_WATCHDOG: u32 = 102;
    pub const SET_STREAM_PERIOD: u32 = 103;
    pub const GET_FW_VERSION: u32 = 105;
}

/// A command line sent to the MCU: `{"N":7,"D1":-120,"D2":120}`.
/// D1/D2 are the signed tank-drive pair where present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct McuCommand {
    #[serde(rename = "N")]
    pub n: u32,
    #[serde(rename = "D1", skip_serializing_if = "Option::is_none")]
    pub d1: Option<i32>,
    #[serde(rename = "D2", skip_serializing_if = "Option::is_none")]
    pub d2: Option<i32>,
}

impl McuCommand {
    pub fn ping() -> Self { Self { n: cmd::PING, d1: None, d2: None } }
    pub fn stop() -> Self { Self { n: cmd::STOP, d1: None, d2: None } }
    pub fn set_motors(d1: i32, d2: i32) -> Self {
        Self { n: cmd::SET_MOTORS, d1: Some(d1), d2: Some(d2) }
    }
    pub fn state_dump() -> Self { Self { n: cmd::STATE_DUMP, d1: None, d2: None } }
    pub fn set_watchdog(ms: i32) -> Self {
        Self { n: cmd::SET_WATCHDOG, d1: Some(ms), d2: None }
    }
    /// Stream period in ms; 0 disables streaming.
    pub fn set_stream_period(ms: i32) -> Self {
        Self { n: cmd::SET_STREAM_PERIOD, d1: Some(ms), d2: None }
    }
    pub fn get_fw_version() -> Self { Self { n: cmd::GET_FW_VERSION, d1: None, d2: None } }

    /// Serialize to one protocol line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A telemetry line from the MCU after key remapping, with every field
/// optional: the firmware only sends what changed or what streaming is
/// configured to include. Unknown fields are ignored on purpose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Telemetry {
    /// Firmware millis() timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
    /// Forward ultrasonic range, integer centimetres; -1 = no reading yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dist_f: Option<i32>,
    /// IR line-sensor array
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ir: Option<Vec<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gyro: Option<[f64; 3]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp: Option<f64>,
    /// Battery voltage, volts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    /// MPU self-test validity flag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mpu_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
}

impl Telemetry {
    /// Parse a remapped telemetry line, ignoring unknown fields.
    pub fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Range sentinel: the firmware reports -1 until the first echo arrives.
pub const NO_RANGE: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn heading_round_trips_through_quaternion() {
        for &h in &[0.0, FRAC_PI_2, -FRAC_PI_2, PI * 0.75, -2.9] {
            let p = Pose::on_ground(0, 1.0, 2.0, h);
            let got = p.heading();
            let diff = (got - h).sin().atan2((got - h).cos()); // wrap to [-π, π]
            assert!(diff.abs() < 1e-9, "heading {h} came back as {got}");
        }
    }

    #[test]
    fn identity_quaternion_faces_plus_x() {
        let p = Pose { ts_ns: 0, tx: 0.0, ty: 0.0, tz: 0.0, qx: 0.0, qy: 0.0, qz: 0.0, qw: 1.0 };
        assert!(p.heading().abs() < 1e-12);
    }

    #[test]
    fn motor_command_wire_shape() {
        let c = McuCommand::set_motors(-120, 120);
        assert_eq!(c.to_line(), r#"{"N":7,"D1":-120,"D2":120}"#);
        let c = McuCommand::stop();
        assert_eq!(c.to_line(), r#"{"N":6}"#);
    }

    #[test]
    fn telemetry_ignores_unknown_keys() {
        let t = Telemetry::from_line(r#"{"ts":42,"dist_f":35,"bogus":1}"#).unwrap();
        assert_eq!(t.ts, Some(42));
        assert_eq!(t.dist_f, Some(35));
        assert!(t.battery.is_none());
    }
}

//! # world
//!
//! Minimal vehicle physics for the MCU emulator: a tank-drive robot inside
//! a rectangular room, plus a forward ultrasonic raycast with Gaussian
//! noise. Enough to exercise the mapper, the planners and both motion
//! controllers end to end without hardware.

use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// Motor PWM full scale, matching the firmware's signed byte range.
const PWM_FULL_SCALE: f64 = 255.0;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Room extent along X, metres
    pub room_w: f64,
    /// Room extent along Z, metres
    pub room_d: f64,
    pub start_x: f64,
    pub start_z: f64,
    pub start_heading: f64,
    /// Ground speed at full PWM, m/s
    pub max_speed_mps: f64,
    /// Wheel-to-wheel distance, metres
    pub track_width_m: f64,
    /// Ultrasonic noise sigma, centimetres
    pub noise_sigma_cm: f64,
    /// Sensor ceiling, centimetres
    pub max_range_cm: i32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            room_w: 3.0,
            room_d: 2.0,
            start_x: 1.5,
            start_z: 1.0,
            start_heading: 0.0,
            max_speed_mps: 0.35,
            track_width_m: 0.14,
            noise_sigma_cm: 1.0,
            max_range_cm: 400,
        }
    }
}

#[derive(Debug)]
pub struct World {
    cfg: WorldConfig,
    pub x: f64,
    pub z: f64,
    pub heading: f64,
    pub d1: i32,
    pub d2: i32,
}

impl World {
    pub fn new(cfg: WorldConfig) -> Self {
        let (x, z, heading) = (cfg.start_x, cfg.start_z, cfg.start_heading);
        Self { cfg, x, z, heading, d1: 0, d2: 0 }
    }

    pub fn set_motors(&mut self, d1: i32, d2: i32) {
        self.d1 = d1.clamp(-255, 255);
        self.d2 = d2.clamp(-255, 255);
    }

    pub fn stop(&mut self) {
        self.d1 = 0;
        self.d2 = 0;
    }

    /// Advance the vehicle by `dt` seconds of tank-drive kinematics.
    /// Walls are hard: the robot stops a hair short instead of escaping.
    pub fn step(&mut self, dt: f64) {
        let vl = self.d1 as f64 / PWM_FULL_SCALE * self.cfg.max_speed_mps;
        let vr = self.d2 as f64 / PWM_FULL_SCALE * self.cfg.max_speed_mps;
        let v = (vl + vr) / 2.0;
        let omega = (vr - vl) / self.cfg.track_width_m;

        self.heading += omega * dt;
        // Keep heading bounded for numeric hygiene
        self.heading = self.heading.sin().atan2(self.heading.cos());

        let margin = 0.05;
        self.x = (self.x + v * self.heading.cos() * dt).clamp(margin, self.cfg.room_w - margin);
        self.z = (self.z + v * self.heading.sin() * dt).clamp(margin, self.cfg.room_d - margin);
    }

    /// Noisy ultrasonic distance to the nearest wall straight ahead,
    /// integer centimetres.
    pub fn ultrasonic_cm(&self) -> i32 {
        let exact = self.raycast_m() * 100.0;
        let noise = Normal::new(0.0, self.cfg.noise_sigma_cm)
            .map(|n| n.sample(&mut rand::thread_rng()))
            .unwrap_or(0.0);
        ((exact + noise).round() as i32).clamp(0, self.cfg.max_range_cm)
    }

    /// Exact distance to the nearest wall along the current heading.
    pub fn raycast_m(&self) -> f64 {
        let (dx, dz) = (self.heading.cos(), self.heading.sin());
        let mut best = f64::INFINITY;
        // x = 0 and x = room_w walls
        if dx.abs() > 1e-9 {
            for wall_x in [0.0, self.cfg.room_w] {
                let t = (wall_x - self.x) / dx;
                if t > 0.0 {
                    let z_hit = self.z + dz * t;
                    if (0.0..=self.cfg.room_d).contains(&z_hit) {
                        best = best.min(t);
                    }
                }
            }
        }
        // z = 0 and z = room_d walls
        if dz.abs() > 1e-9 {
            for wall_z in [0.0, self.cfg.room_d] {
                let t = (wall_z - self.z) / dz;
                if t > 0.0 {
                    let x_hit = self.x + dx * t;
                    if (0.0..=self.cfg.room_w).contains(&x_hit) {
                        best = best.min(t);
                    }
                }
            }
        }
        if best.is_finite() {
            best
        } else {
            self.cfg.max_range_cm as f64 / 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn quiet_world() -> World {
        World::new(WorldConfig { noise_sigma_cm: 0.0, ..WorldConfig::default() })
    }

    #[test]
    fn raycast_hits_the_facing_wall() {
        let mut w = quiet_world();
        // From the centre facing +X: 1.5 m to the x=3 wall
        assert!((w.raycast_m() - 1.5).abs() < 1e-9);
        w.heading = PI;
        assert!((w.raycast_m() - 1.5).abs() < 1e-9);
        w.heading = FRAC_PI_2; // toward z = 2
        assert!((w.raycast_m() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn equal_motors_drive_straight() {
        let mut w = quiet_world();
        w.set_motors(255, 255);
        for _ in 0..10 {
            w.step(0.1);
        }
        // One second at full speed
        assert!((w.x - (1.5 + 0.35)).abs() < 1e-9);
        assert!((w.z - 1.0).abs() < 1e-9);
        assert!(w.heading.abs() < 1e-9);
    }

    #[test]
    fn opposite_motors_spin_in_place() {
        let mut w = quiet_world();
        w.set_motors(-255, 255);
        w.step(0.1);
        assert!((w.x - 1.5).abs() < 1e-9);
        assert!((w.z - 1.0).abs() < 1e-9);
        assert!(w.heading > 0.0);
    }

    #[test]
    fn walls_are_solid() {
        let mut w = quiet_world();
        w.set_motors(255, 255);
        for _ in 0..200 {
            w.step(0.1);
        }
        assert!(w.x <= 3.0 - 0.05 + 1e-9);
    }

    #[test]
    fn ultrasonic_is_clamped_to_range() {
        let w = quiet_world();
        let cm = w.ultrasonic_cm();
        assert!((0..=400).contains(&cm));
    }
}

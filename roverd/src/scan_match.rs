//! # scan_match
//!
//! Heading-indexed scan profiles and the translation-only matcher used for
//! drift correction. The first full 360° profile a session records becomes
//! the reference; later profiles are matched reading-by-reading against it
//! (nearest heading within 15°) and the per-axis median of the hit-point
//! deltas becomes the drift offset adjustment. Rotation drift is out of
//! scope for this matcher; see DESIGN.md.

use serde::{Deserialize, Serialize};

/// One reading captured while the robot spins in place.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScanReading {
    /// Ground-plane heading at capture time, radians
    pub heading: f64,
    /// Accepted ultrasonic range, metres
    pub range_m: f64,
    /// World hit point
    pub hit_x: f64,
    pub hit_z: f64,
}

/// An ordered set of readings from one ~360° in-place rotation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanProfile {
    pub readings: Vec<ScanReading>,
}

/// Profiles shorter than this are discarded as unusable.
pub const MIN_SCAN_READINGS: usize = 10;
/// A candidate reading must find a reference reading within this heading gap.
const MAX_HEADING_GAP_RAD: f64 = 15.0 * std::f64::consts::PI / 180.0;
/// Minimum matched pairs for a correction.
const MIN_MATCHES: usize = 8;
/// Per-axis max−min spread above which the match is considered unreliable.
const MAX_AXIS_SPREAD_M: f64 = 0.40;

/// Smallest offset magnitude that counts as a correction.
pub const MIN_CORRECTION_M: f64 = 0.01;

/// Smallest absolute angular difference, wrap-aware.
fn heading_gap(a: f64, b: f64) -> f64 {
    (a - b).sin().atan2((a - b).cos()).abs()
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Match `candidate` against `reference` and return the `(dx, dz)` the
/// candidate appears shifted by, or `None` when the match is unreliable
/// (too few pairs, or the deltas disagree too much to trust).
pub fn match_scans(reference: &ScanProfile, candidate: &ScanProfile) -> Option<(f64, f64)> {
    let mut dxs = Vec::new();
    let mut dzs = Vec::new();

    for c in &candidate.readings {
        let nearest = reference
            .readings
            .iter()
            .min_by(|a, b| {
                heading_gap(a.heading, c.heading)
                    .partial_cmp(&heading_gap(b.heading, c.heading))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })?;
        if heading_gap(nearest.heading, c.heading) > MAX_HEADING_GAP_RAD {
            continue;
        }
        dxs.push(c.hit_x - nearest.hit_x);
        dzs.push(c.hit_z - nearest.hit_z);
    }

    if dxs.len() < MIN_MATCHES {
        return None;
    }

    let spread = |vs: &[f64]| {
        let max = vs.iter().cloned().fold(f64::MIN, f64::max);
        let min = vs.iter().cloned().fold(f64::MAX, f64::min);
        max - min
    };
    if spread(&dxs) > MAX_AXIS_SPREAD_M || spread(&dzs) > MAX_AXIS_SPREAD_M {
        return None;
    }

    Some((median(&mut dxs), median(&mut dzs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn ring_profile(cx: f64, cz: f64, n: usize) -> ScanProfile {
        // Readings of a 0.5 m circular room centred on the robot
        let readings = (0..n)
            .map(|i| {
                let h = i as f64 / n as f64 * TAU;
                ScanReading {
                    heading: h,
                    range_m: 0.5,
                    hit_x: cx + 0.5 * h.cos(),
                    hit_z: cz + 0.5 * h.sin(),
                }
            })
            .collect();
        ScanProfile { readings }
    }

    #[test]
    fn identical_scans_match_at_zero() {
        let a = ring_profile(0.0, 0.0, 24);
        let (dx, dz) = match_scans(&a, &a).unwrap();
        assert!(dx.abs() < 1e-9 && dz.abs() < 1e-9);
    }

    #[test]
    fn uniform_shift_is_recovered() {
        let reference = ring_profile(0.0, 0.0, 24);
        let candidate = ring_profile(0.12, -0.07, 24);
        let (dx, dz) = match_scans(&reference, &candidate).unwrap();
        assert!((dx - 0.12).abs() < 1e-9);
        assert!((dz + 0.07).abs() < 1e-9);
    }

    #[test]
    fn too_few_matches_rejected() {
        let reference = ring_profile(0.0, 0.0, 24);
        let candidate = ScanProfile { readings: ring_profile(0.1, 0.1, 24).readings[..5].to_vec() };
        assert!(match_scans(&reference, &candidate).is_none());
    }

    #[test]
    fn wide_spread_rejected() {
        let reference = ring_profile(0.0, 0.0, 24);
        let mut candidate = ring_profile(0.1, 0.0, 24);
        // Corrupt half the hit points to blow the dx spread past 0.40 m
        for r in candidate.readings.iter_mut().step_by(2) {
            r.hit_x += 0.6;
        }
        assert!(match_scans(&reference, &candidate).is_none());
    }

    #[test]
    fn heading_gap_wraps() {
        assert!(heading_gap(0.05, TAU - 0.05) < 0.2);
        assert!(heading_gap(0.0, std::f64::consts::PI) > 3.0);
    }
}

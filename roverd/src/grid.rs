//! # grid
//!
//! Sparse log-odds occupancy grid over 0.10 m cells.
//!
//! Cells are keyed by `(ix, iz) = (floor(x / CELL_SIZE), floor(z / CELL_SIZE))`
//! and hold a log-odds scalar clamped to ±`L_MAX`: positive means likely
//! occupied, negative likely free, absent (or 0) unknown. Evidence is added
//! by ray-casting each ultrasonic return from the robot cell to the endpoint
//! cell: the endpoint gets `+L_OCC`, the cell just short of it is skipped so
//! a fresh wall is not immediately chewed back down, and every other cell on
//! the ray gets `-L_FREE`. The asymmetry (0.85 vs 0.15) makes a stale wall
//! take ~6 traversing rays to flip, which self-corrects without flapping.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Tuning constants ──────────────────────────────────────────────────────────

/// Cell edge length, metres
pub const CELL_SIZE_M: f64 = 0.10;
/// Log-odds clamp bound
pub const L_MAX: f64 = 3.5;
/// Evidence added to the endpoint cell per hit
pub const L_OCC: f64 = 0.85;
/// Evidence removed from each traversed cell per ray
pub const L_FREE: f64 = 0.15;
/// At or above this a cell counts as occupied for display/status
pub const OCC_THRESH: f64 = 0.4;
/// At or below this a cell counts as free (frontier candidates)
pub const FREE_THRESH: f64 = -0.4;
/// Stricter bar for refusing to drive through a cell
pub const NAV_BLOCK_THRESH: f64 = 1.5;

/// Accepted ultrasonic band, metres. Below 0.10 m the sensor rings; beyond
/// 0.80 m heading drift smears the endpoint over neighbouring cells.
pub const RANGE_MIN_M: f64 = 0.10;
pub const RANGE_MAX_M: f64 = 0.80;

/// Trail points closer than this to the previous one are not recorded.
const TRAIL_MIN_STEP_M: f64 = 0.10;

/// World coordinate → cell index.
pub fn world_to_cell(v: f64) -> i32 {
    (v / CELL_SIZE_M).floor() as i32
}

// ── Grid ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OccupancyGrid {
    cells: HashMap<(i32, i32), f64>,
    trail: Vec<(f64, f64)>,
}

/// Outcome of a single range fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Ray traced, evidence applied
    Applied,
    /// Range outside [RANGE_MIN_M, RANGE_MAX_M]
    OutOfBand,
}

impl OccupancyGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log-odds of a cell; unknown cells read as 0.
    pub fn log_odds(&self, ix: i32, iz: i32) -> f64 {
        self.cells.get(&(ix, iz)).copied().unwrap_or(0.0)
    }

    pub fn is_occupied(&self, ix: i32, iz: i32) -> bool {
        self.log_odds(ix, iz) >= OCC_THRESH
    }

    pub fn is_free(&self, ix: i32, iz: i32) -> bool {
        self.cells
            .get(&(ix, iz))
            .map(|&v| v <= FREE_THRESH)
            .unwrap_or(false)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Copy-on-read snapshot of the raw cell map, for planners and the hub
    /// status path. The mapper task keeps mutating the original.
    pub fn cells_snapshot(&self) -> HashMap<(i32, i32), f64> {
        self.cells.clone()
    }

    pub fn trail(&self) -> &[(f64, f64)] {
        &self.trail
    }

    /// Append a trail waypoint if it moved at least TRAIL_MIN_STEP_M.
    pub fn push_trail(&mut self, x: f64, z: f64) {
        if let Some(&(px, pz)) = self.trail.last() {
            let d2 = (x - px).powi(2) + (z - pz).powi(2);
            if d2 < TRAIL_MIN_STEP_M * TRAIL_MIN_STEP_M {
                return;
            }
        }
        self.trail.push((x, z));
    }

    /// Remove every cell and reset the robot trail.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.trail.clear();
    }

    /// Fuse one range reading taken at (x, z) facing `heading` radians.
    ///
    /// Returns the endpoint world position on success so the caller can track
    /// the last hit point.
    pub fn update(&mut self, x: f64, z: f64, heading: f64, range_m: f64) -> (UpdateOutcome, Option<(f64, f64)>) {
        if !(RANGE_MIN_M..=RANGE_MAX_M).contains(&range_m) {
            return (UpdateOutcome::OutOfBand, None);
        }

        let hit_x = x + range_m * heading.cos();
        let hit_z = z + range_m * heading.sin();

        let start = (world_to_cell(x), world_to_cell(z));
        let end = (world_to_cell(hit_x), world_to_cell(hit_z));

        let ray = bresenham(start, end);
        let n = ray.len();
        for (i, &cell) in ray.iter().enumerate() {
            if i + 1 == n {
                self.add_evidence(cell, L_OCC);
            } else if i + 2 == n {
                // The cell just short of the wall: ultrasonic beam width makes
                // its free evidence unreliable, so leave it untouched.
            } else {
                self.add_evidence(cell, -L_FREE);
            }
        }

        (UpdateOutcome::Applied, Some((hit_x, hit_z)))
    }

    fn add_evidence(&mut self, cell: (i32, i32), delta: f64) {
        let v = self.cells.entry(cell).or_insert(0.0);
        *v = (*v + delta).clamp(-L_MAX, L_MAX);
    }

    /// Look-ahead clearance test: casts three parallel rays of `dist_m`
    /// metres (centre plus ±`half_width_m` perpendicular offsets) and fails
    /// if any visited cell is at or above NAV_BLOCK_THRESH.
    pub fn is_path_clear(&self, x: f64, z: f64, heading: f64, dist_m: f64, half_width_m: f64) -> bool {
        let (sin_h, cos_h) = heading.sin_cos();
        // Perpendicular on the ground plane
        let (px, pz) = (-sin_h, cos_h);

        for &off in &[0.0, half_width_m, -half_width_m] {
            let sx = x + px * off;
            let sz = z + pz * off;
            let ex = sx + dist_m * cos_h;
            let ez = sz + dist_m * sin_h;
            let ray = bresenham(
                (world_to_cell(sx), world_to_cell(sz)),
                (world_to_cell(ex), world_to_cell(ez)),
            );
            for (ix, iz) in ray {
                if self.log_odds(ix, iz) >= NAV_BLOCK_THRESH {
                    return false;
                }
            }
        }
        true
    }

    // ── Snapshot (persisted on stop_map, see persistence.rs) ──────────────────

    pub fn snapshot(&self) -> GridSnapshot {
        let mut occupied = Vec::new();
        let mut free = Vec::new();
        let mut log_odds = Vec::new();
        for (&(ix, iz), &v) in &self.cells {
            if self.is_occupied(ix, iz) {
                occupied.push([ix, iz]);
            } else if self.is_free(ix, iz) {
                free.push([ix, iz]);
            }
            log_odds.push((ix, iz, v));
        }
        // Deterministic output so snapshots diff cleanly
        occupied.sort_unstable();
        free.sort_unstable();
        log_odds.sort_unstable_by_key(|&(ix, iz, _)| (ix, iz));
        GridSnapshot {
            cell_size: CELL_SIZE_M,
            occupied,
            free,
            log_odds,
            trail: self.trail.iter().map(|&(x, z)| [x, z]).collect(),
        }
    }

    /// Rebuild a grid from a snapshot's raw log-odds list.
    pub fn restore(snapshot: &GridSnapshot) -> Self {
        let mut cells = HashMap::with_capacity(snapshot.log_odds.len());
        for &(ix, iz, v) in &snapshot.log_odds {
            cells.insert((ix, iz), v.clamp(-L_MAX, L_MAX));
        }
        Self {
            cells,
            trail: snapshot.trail.iter().map(|p| (p[0], p[1])).collect(),
        }
    }
}

/// Serialized form of the grid, embedded in the map file written on
/// `stop_map` (mapper counters and the raw log ride alongside it there).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub cell_size: f64,
    pub occupied: Vec<[i32; 2]>,
    pub free: Vec<[i32; 2]>,
    pub log_odds: Vec<(i32, i32, f64)>,
    pub trail: Vec<[f64; 2]>,
}

// ── Ray walk ──────────────────────────────────────────────────────────────────

/// Integer Bresenham walk from `a` to `b` inclusive. Visits each cell once;
/// the number of cells is the Chebyshev distance between the endpoints + 1.
pub fn bresenham(a: (i32, i32), b: (i32, i32)) -> Vec<(i32, i32)> {
    let (mut x, mut z) = a;
    let (x1, z1) = b;
    let dx = (x1 - x).abs();
    let dz = (z1 - z).abs();
    let sx = if x < x1 { 1 } else { -1 };
    let sz = if z < z1 { 1 } else { -1 };
    let mut err = dx - dz;

    let mut cells = Vec::with_capacity((dx.max(dz) + 1) as usize);
    loop {
        cells.push((x, z));
        if x == x1 && z == z1 {
            break;
        }
        let e2 = 2 * err;
        if e2 > -dz {
            err -= dz;
            x += sx;
        }
        if e2 < dx {
            err += dx;
            z += sz;
        }
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_visits_chebyshev_plus_one_cells() {
        for &(a, b) in &[((0, 0), (5, 0)), ((0, 0), (3, 7)), ((2, 2), (-4, 1)), ((1, 1), (1, 1))] {
            let cells = bresenham(a, b);
            let cheb = (a.0 - b.0).abs().max((a.1 - b.1).abs());
            assert_eq!(cells.len() as i32, cheb + 1, "{a:?} -> {b:?}");
            assert_eq!(cells[0], a);
            assert_eq!(*cells.last().unwrap(), b);
            let unique: std::collections::HashSet<_> = cells.iter().collect();
            assert_eq!(unique.len(), cells.len());
        }
    }

    #[test]
    fn range_band_boundaries() {
        let mut g = OccupancyGrid::new();
        assert_eq!(g.update(0.0, 0.0, 0.0, 0.09).0, UpdateOutcome::OutOfBand);
        assert_eq!(g.update(0.0, 0.0, 0.0, 0.10).0, UpdateOutcome::Applied);
        assert_eq!(g.update(0.0, 0.0, 0.0, 0.80).0, UpdateOutcome::Applied);
        assert_eq!(g.update(0.0, 0.0, 0.0, 0.81).0, UpdateOutcome::OutOfBand);
    }

    #[test]
    fn single_hit_in_front() {
        // Pose (0,0) heading 0, 30 cm: endpoint cell (3,0) occupied after one
        // update, (0,0)/(1,0) free after three, (2,0) stays unknown (skipped).
        let mut g = OccupancyGrid::new();
        for _ in 0..3 {
            let (out, hit) = g.update(0.0, 0.0, 0.0, 0.30);
            assert_eq!(out, UpdateOutcome::Applied);
            let (hx, hz) = hit.unwrap();
            assert_eq!((world_to_cell(hx), world_to_cell(hz)), (3, 0));
        }
        assert!(g.is_occupied(3, 0));
        assert!(g.is_free(0, 0));
        assert!(g.is_free(1, 0));
        assert_eq!(g.log_odds(2, 0), 0.0);
    }

    #[test]
    fn endpoint_cell_is_floor_of_range() {
        let mut g = OccupancyGrid::new();
        let (_, hit) = g.update(0.0, 0.0, 0.0, 0.55);
        let (hx, hz) = hit.unwrap();
        assert_eq!((world_to_cell(hx), world_to_cell(hz)), (5, 0));
    }

    #[test]
    fn one_reading_produces_exactly_one_occupied_cell() {
        let mut g = OccupancyGrid::new();
        g.update(0.0, 0.0, 0.7, 0.62);
        let occupied = g.snapshot().occupied;
        assert_eq!(occupied.len(), 1);
    }

    #[test]
    fn wall_erodes_under_traversing_rays() {
        let mut g = OccupancyGrid::new();
        // Place a wall at (3,0), then "drive through" it six times with
        // longer readings whose rays traverse that cell.
        g.update(0.0, 0.0, 0.0, 0.30);
        assert!(g.log_odds(3, 0) > 0.0);
        for _ in 0..6 {
            g.update(0.0, 0.0, 0.0, 0.60);
        }
        // ⌈L_OCC / L_FREE⌉ = 6 traversals flip the sign; a few more cross
        // the display FREE threshold.
        assert!(g.log_odds(3, 0) < 0.0, "stale wall should flip sign");
        for _ in 0..3 {
            g.update(0.0, 0.0, 0.0, 0.60);
        }
        assert!(g.is_free(3, 0));
    }

    #[test]
    fn log_odds_stay_clamped() {
        let mut g = OccupancyGrid::new();
        for _ in 0..100 {
            g.update(0.0, 0.0, 0.0, 0.30);
        }
        for (_, &v) in g.cells.iter() {
            assert!((-L_MAX..=L_MAX).contains(&v));
        }
        // Converges to the clamp, repeated identical input is stable
        assert!((g.log_odds(3, 0) - L_MAX).abs() < 1e-9);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut g = OccupancyGrid::new();
        g.update(0.0, 0.0, 0.0, 0.30);
        g.push_trail(0.0, 0.0);
        g.clear();
        assert_eq!(g.cell_count(), 0);
        assert!(g.trail().is_empty());
        g.clear();
        assert_eq!(g.cell_count(), 0);
    }

    #[test]
    fn trail_skips_small_steps() {
        let mut g = OccupancyGrid::new();
        g.push_trail(0.0, 0.0);
        g.push_trail(0.05, 0.0); // < 0.10 m, dropped
        g.push_trail(0.15, 0.0);
        assert_eq!(g.trail().len(), 2);
    }

    #[test]
    fn snapshot_round_trips() {
        let mut g = OccupancyGrid::new();
        g.update(0.0, 0.0, 0.0, 0.30);
        g.update(0.0, 0.0, 1.2, 0.50);
        g.update(0.2, 0.1, -0.4, 0.44);
        g.push_trail(0.0, 0.0);
        g.push_trail(0.3, 0.3);

        let snap = g.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let back: GridSnapshot = serde_json::from_str(&json).unwrap();
        let restored = OccupancyGrid::restore(&back);

        assert_eq!(restored.snapshot().occupied, snap.occupied);
        assert_eq!(restored.snapshot().free, snap.free);
        assert_eq!(restored.trail().len(), 2);
        for &(ix, iz, v) in &snap.log_odds {
            assert!((restored.log_odds(ix, iz) - v).abs() < 1e-12);
        }
    }

    #[test]
    fn path_clear_blocks_on_nav_threshold() {
        let mut g = OccupancyGrid::new();
        assert!(g.is_path_clear(0.05, 0.05, 0.0, 0.5, 0.1));
        // Two hits push (3,0) to 1.7, past NAV_BLOCK_THRESH
        g.update(0.0, 0.0, 0.0, 0.30);
        g.update(0.0, 0.0, 0.0, 0.30);
        assert!(g.log_odds(3, 0) >= NAV_BLOCK_THRESH);
        assert!(!g.is_path_clear(0.05, 0.05, 0.0, 0.5, 0.1));
        // Facing away from the wall is still clear
        assert!(g.is_path_clear(0.05, 0.05, std::f64::consts::PI, 0.5, 0.1));
    }
}

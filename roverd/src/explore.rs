//! # explore
//!
//! Frontier-driven exploration: snapshot the grid, find frontier clusters,
//! plan a path to the nearest one, follow it with a short lookahead window,
//! and scan on arrival. The loop declares the map complete when no frontier
//! remains or when five targets in a row prove unreachable.

use tracing::{debug, info};

use crate::astar;
use crate::frontier::{cluster_frontiers, find_frontiers};
use crate::grid::{world_to_cell, CELL_SIZE_M};
use crate::motion::{wrap_angle, MotionCtx};

/// Waypoints ahead of the robot considered when picking the next target.
const LOOKAHEAD_CELLS: usize = 3;
/// Heading error below which the robot drives instead of rotating.
const HEADING_TOLERANCE_RAD: f64 = 15.0 * std::f64::consts::PI / 180.0;
/// Rotation steps allowed per alignment.
const MAX_ALIGN_STEPS: u32 = 15;
/// Re-plans tolerated on one target before abandoning it.
const MAX_REPLANS: u32 = 3;
/// Consecutive failed targets before exploration gives up.
const MAX_TARGET_FAILURES: u32 = 5;

/// Run until the map has no frontiers left, the failure budget empties, or
/// the stop flag trips. Returns true when exploration completed; the
/// `exploration_complete` status flag tracks the same outcome.
pub async fn run(ctx: MotionCtx) -> bool {
    info!("explore: starting");
    ctx.status.write().await.exploration_complete = false;
    if !ctx.wait_for_first_update().await {
        info!("explore: no mapper updates, exiting without motion");
        ctx.bridge.stop_motors();
        return false;
    }

    ctx.full_scan(1).await;

    let mut consecutive_failures: u32 = 0;
    let complete = loop {
        if ctx.stopped() {
            break false;
        }

        let (cells, pose) = {
            let mapper = ctx.mapper.read().await;
            match mapper.latest_pose() {
                Some(p) => (mapper.grid().cells_snapshot(), p),
                None => break false,
            }
        };
        let robot_cell = (world_to_cell(pose.x), world_to_cell(pose.z));

        let frontiers = find_frontiers(&cells);
        if frontiers.is_empty() {
            info!("explore: no frontiers left, map complete");
            break true;
        }

        let mut clusters = cluster_frontiers(&frontiers);
        clusters.sort_by(|a, b| {
            a.dist2_to(robot_cell.0, robot_cell.1)
                .partial_cmp(&b.dist2_to(robot_cell.0, robot_cell.1))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Nearest cluster that admits a real plan wins this round
        let mut attempt = None;
        for cluster in &clusters {
            let target = cluster.centroid_cell();
            if let Some(path) = astar::plan(&cells, robot_cell, target) {
                if path.len() >= 2 {
                    attempt = Some((target, path));
                    break;
                }
            }
        }

        let reached = match attempt {
            Some((target, path)) => {
                debug!("explore: heading for {target:?} over {} cells", path.len());
                follow_path(&ctx, &path).await
            }
            None => {
                debug!("explore: {} clusters but no plannable target", clusters.len());
                false
            }
        };

        if reached {
            consecutive_failures = 0;
            // Look around from the new vantage point
            ctx.full_scan(1).await;
        } else {
            if ctx.stopped() {
                break false;
            }
            consecutive_failures += 1;
            info!("explore: target failed ({consecutive_failures}/{MAX_TARGET_FAILURES})");
            if consecutive_failures >= MAX_TARGET_FAILURES {
                info!("explore: giving up after {consecutive_failures} failed targets");
                break true;
            }
        }
    };

    ctx.status.write().await.exploration_complete = complete;
    ctx.bridge.stop_motors();
    info!("explore: stopped (complete={complete})");
    complete
}

/// Drive one planned path: rotate toward the lookahead waypoint, burst
/// forward while the ultrasonic and grid both stay clear, re-plan when
/// blocked. True once the robot is within one cell of the goal.
async fn follow_path(ctx: &MotionCtx, path: &[(i32, i32)]) -> bool {
    let goal = *path.last().expect("planned path is never empty");
    let mut path = path.to_vec();
    let mut replans: u32 = 0;

    loop {
        if ctx.stopped() {
            return false;
        }
        let pose = match ctx.pose().await {
            Some(p) => p,
            None => return false,
        };
        let robot_cell = (world_to_cell(pose.x), world_to_cell(pose.z));

        if chebyshev(robot_cell, goal) <= 1 {
            return true;
        }

        let target = pick_lookahead_target(&path, robot_cell);
        let (tx, tz) = cell_centre(target);
        let desired = (tz - pose.z).atan2(tx - pose.x);

        if !align_heading(ctx, desired).await {
            return false;
        }

        let pose = match ctx.pose().await {
            Some(p) => p,
            None => return false,
        };
        if ctx.forward_is_open(&pose).await {
            ctx.forward_burst().await;
            continue;
        }

        // Blocked: burn one re-plan on this target
        replans += 1;
        debug!("explore: blocked toward {target:?} (re-plan {replans}/{MAX_REPLANS})");
        if replans >= MAX_REPLANS {
            return false;
        }
        let cells = ctx.mapper.read().await.grid().cells_snapshot();
        match astar::plan(&cells, robot_cell, goal) {
            Some(p) if p.len() >= 2 => path = p,
            _ => return false,
        }
    }
}

/// Rotate in place until the heading error drops inside the tolerance.
async fn align_heading(ctx: &MotionCtx, desired: f64) -> bool {
    for _ in 0..MAX_ALIGN_STEPS {
        if ctx.stopped() {
            return false;
        }
        let pose = match ctx.pose().await {
            Some(p) => p,
            None => return false,
        };
        let err = wrap_angle(desired - pose.heading);
        if err.abs() < HEADING_TOLERANCE_RAD {
            return true;
        }
        ctx.rotate_step(if err > 0.0 { 1 } else { -1 }).await;
    }
    // Could not line up (slipping tracks, pose jitter); let the caller
    // decide whether to re-plan
    true
}

/// The farthest path waypoint within LOOKAHEAD_CELLS of the robot's current
/// position on the path. Short-cuts jagged Bresenham staircases without
/// leaving the planned corridor.
fn pick_lookahead_target(path: &[(i32, i32)], robot_cell: (i32, i32)) -> (i32, i32) {
    let nearest = path
        .iter()
        .enumerate()
        .min_by_key(|(_, &c)| {
            let dx = (c.0 - robot_cell.0) as i64;
            let dz = (c.1 - robot_cell.1) as i64;
            dx * dx + dz * dz
        })
        .map(|(i, _)| i)
        .unwrap_or(0);
    let target_idx = (nearest + LOOKAHEAD_CELLS).min(path.len() - 1);
    path[target_idx]
}

fn cell_centre((ix, iz): (i32, i32)) -> (f64, f64) {
    ((ix as f64 + 0.5) * CELL_SIZE_M, (iz as f64 + 0.5) * CELL_SIZE_M)
}

fn chebyshev(a: (i32, i32), b: (i32, i32)) -> i32 {
    (a.0 - b.0).abs().max((a.1 - b.1).abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookahead_targets_three_cells_out() {
        let path: Vec<(i32, i32)> = (0..10).map(|i| (i, 0)).collect();
        assert_eq!(pick_lookahead_target(&path, (0, 0)), (3, 0));
        assert_eq!(pick_lookahead_target(&path, (5, 0)), (8, 0));
        // Near the end the goal itself is the target
        assert_eq!(pick_lookahead_target(&path, (8, 0)), (9, 0));
    }

    #[test]
    fn lookahead_rejoins_from_off_path() {
        let path: Vec<(i32, i32)> = (0..10).map(|i| (i, 0)).collect();
        // Robot drifted a cell sideways at x=4
        assert_eq!(pick_lookahead_target(&path, (4, 1)), (7, 0));
    }

    #[test]
    fn cell_centre_is_mid_cell() {
        let (x, z) = cell_centre((3, -1));
        assert!((x - 0.35).abs() < 1e-12);
        assert!((z + 0.05).abs() < 1e-12);
    }

    #[test]
    fn chebyshev_arrival_radius() {
        assert_eq!(chebyshev((4, 4), (5, 5)), 1);
        assert_eq!(chebyshev((4, 4), (4, 4)), 0);
        assert_eq!(chebyshev((0, 0), (2, 1)), 2);
    }
}

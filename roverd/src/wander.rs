//! # wander
//!
//! Reactive random-walk controller: drive forward while the ultrasonic and
//! the grid both say the way is open, otherwise rotate toward whichever
//! side looks clear. Builds map coverage without a plan; the safety rules
//! are the same ones Explore uses.

use std::f64::consts::FRAC_PI_2;

use tracing::{debug, info};

use crate::motion::MotionCtx;

/// Turn steps without finding clearance before backing out.
const MAX_TURN_STEPS: u32 = 15;

/// Run until the stop flag trips. An unconditional motor stop goes out on
/// every exit path.
pub async fn run(ctx: MotionCtx) {
    info!("wander: starting");
    if !ctx.wait_for_first_update().await {
        info!("wander: no mapper updates, exiting without motion");
        ctx.bridge.stop_motors();
        return;
    }

    // Random initial bias so repeated runs do not always hug one wall
    let mut preferred_dir: i32 = if rand::random::<bool>() { 1 } else { -1 };

    // Map the surroundings before the first move
    ctx.full_scan(preferred_dir).await;

    let mut turn_steps: u32 = 0;
    while !ctx.stopped() {
        let pose = match ctx.pose().await {
            Some(p) => p,
            None => break,
        };

        if ctx.forward_is_open(&pose).await {
            turn_steps = 0;
            ctx.forward_burst().await;
            continue;
        }

        if turn_steps >= MAX_TURN_STEPS {
            // Boxed in: back out and start searching the other way round
            debug!("wander: {turn_steps} fruitless turn steps, reversing");
            ctx.reverse_burst().await;
            preferred_dir = -preferred_dir;
            turn_steps = 0;
            continue;
        }

        // Probe both sides on the grid and turn toward the open one
        let left_clear = ctx.path_clear_at(&pose, pose.heading + FRAC_PI_2).await;
        let right_clear = ctx.path_clear_at(&pose, pose.heading - FRAC_PI_2).await;
        let dir = match (left_clear, right_clear) {
            (true, false) => 1,
            (false, true) => -1,
            _ => preferred_dir,
        };
        ctx.rotate_step(dir).await;
        turn_steps += 1;
    }

    ctx.bridge.stop_motors();
    info!("wander: stopped");
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use roverd::config::RuntimeConfig;
use roverd::hub::{self, Hub};
use roverd::recorder;
use roverd::status::{new_shared_status, EventLog};
use roverd::supervisor::Supervisor;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "roverd", version, about = "Rover Suite robot runtime")]
struct Args {
    /// Config file path (TOML); defaults apply when absent
    #[arg(short, long)]
    config: Option<String>,
    /// Override the hub TCP port
    #[arg(long)]
    port: Option<u16>,
    /// Override the MCU serial device
    #[arg(long)]
    serial: Option<String>,
    /// Replay a recorded dataset's poses through the mapper (development
    /// without a robot); expects a dataset_* directory
    #[arg(long)]
    replay: Option<PathBuf>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roverd=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RuntimeConfig::load(args.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        RuntimeConfig::default()
    });
    if let Some(port) = args.port {
        config.hub.port = port;
    }
    if let Some(serial) = args.serial {
        config.serial.port = serial;
    }

    info!(
        "🤖 Rover runtime v{} starting — serial {}, hub port {}",
        env!("CARGO_PKG_VERSION"),
        config.serial.port,
        config.hub.port
    );

    let status = new_shared_status();
    let log = EventLog::new();
    let hub_port = config.hub.port;
    let supervisor = Supervisor::start(config, status, log);

    if let Some(dataset) = args.replay {
        tokio::spawn(replay_dataset(supervisor.clone(), dataset));
    }

    hub::serve(Hub::new(supervisor), hub_port).await
}

/// Feed a recorded pose track back through the mapper at roughly its
/// original cadence.
async fn replay_dataset(supervisor: Arc<Supervisor>, dataset: PathBuf) {
    let poses = match recorder::load_poses(&dataset).await {
        Ok(p) if !p.is_empty() => p,
        Ok(_) => {
            warn!("replay: {} has no poses", dataset.display());
            return;
        }
        Err(e) => {
            warn!("replay: {}: {e}", dataset.display());
            return;
        }
    };

    info!("replay: {} poses from {}", poses.len(), dataset.display());
    supervisor.handle_command("start_map").await;

    let mut prev_ts = poses[0].ts_ns;
    for pose in poses {
        let dt_ns = pose.ts_ns.saturating_sub(prev_ts);
        prev_ts = pose.ts_ns;
        // Cap the gap so damaged timestamps cannot stall the replay
        tokio::time::sleep(Duration::from_nanos(dt_ns.min(100_000_000))).await;
        supervisor.offer_pose(pose).await;
    }
    info!("replay: done");
}

//! # mcu-sim
//!
//! Hardware-free emulator of the robot's microcontroller. Listens on TCP
//! and speaks the same JSON-per-line protocol as the real firmware, so the
//! runtime can be exercised end to end on a desk: bridge a pty to it with
//! `socat pty,link=/tmp/ttySIM,raw tcp:127.0.0.1:7777` and point `roverd
//! --serial /tmp/ttySIM` at the link.
//!
//! Emulated behaviours: tank-drive kinematics in a walled room, noisy
//! forward ultrasonic, short-key telemetry at the configured stream
//! period, watchdog motor cut-off, firmware version query.

mod world;

use std::time::{Duration, Instant};

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tracing::{debug, info, warn};

use rover_types::{cmd, McuCommand};
use world::{World, WorldConfig};

const FIRMWARE_VERSION: &str = "sim-1.0";
/// Physics resolution; decoupled from the telemetry stream period.
const PHYSICS_STEP: Duration = Duration::from_millis(20);

// ── CLI & config ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "mcu-sim", about = "Rover Suite MCU emulator")]
struct Args {
    /// TCP listen address
    #[arg(long, default_value = "127.0.0.1:7777")]
    listen: String,
    /// World config file (TOML); built-in room when absent
    #[arg(short, long)]
    config: Option<String>,
}

// ── Device state ──────────────────────────────────────────────────────────────

struct Device {
    world: World,
    /// Telemetry period; 0 = off
    stream_ms: u64,
    /// Motor cut-off after command silence; 0 = disarmed
    watchdog_ms: u64,
    last_command: Instant,
    battery_v: f64,
}

impl Device {
    fn new(world: World) -> Self {
        Self {
            world,
            stream_ms: 0,
            watchdog_ms: 0,
            last_command: Instant::now(),
            battery_v: 8.1,
        }
    }

    /// Apply one command line; returns an immediate reply when the command
    /// has one.
    fn apply(&mut self, command: &McuCommand) -> Option<String> {
        self.last_command = Instant::now();
        match command.n {
            cmd::PING => Some(json!({ "ok": 1 }).to_string()),
            cmd::STOP => {
                self.world.stop();
                Some(json!({ "ok": 1, "cmd": "stop" }).to_string())
            }
            cmd::SET_MOTORS => {
                self.world.set_motors(command.d1.unwrap_or(0), command.d2.unwrap_or(0));
                None
            }
            cmd::STATE_DUMP => Some(self.telemetry_line()),
            cmd::SET_WATCHDOG => {
                self.watchdog_ms = command.d1.unwrap_or(0).max(0) as u64;
                Some(json!({ "ok": 1, "watchdog": self.watchdog_ms }).to_string())
            }
            cmd::SET_STREAM_PERIOD => {
                self.stream_ms = command.d1.unwrap_or(0).max(0) as u64;
                None
            }
            cmd::GET_FW_VERSION => Some(json!({ "fv": FIRMWARE_VERSION }).to_string()),
            other => {
                debug!("unknown command N={other}");
                Some(json!({ "error": format!("unknown N={other}") }).to_string())
            }
        }
    }

    /// Short-key telemetry, exactly what the real firmware streams.
    fn telemetry_line(&self) -> String {
        json!({
            "t": self.last_command.elapsed().as_millis() as u64,
            "d": self.world.ultrasonic_cm(),
            "b": self.battery_v,
            "v": true,
        })
        .to_string()
    }

    fn tick(&mut self, dt: f64) {
        if self.watchdog_ms > 0
            && self.last_command.elapsed() > Duration::from_millis(self.watchdog_ms)
            && (self.world.d1 != 0 || self.world.d2 != 0)
        {
            warn!("watchdog tripped, motors stopped");
            self.world.stop();
        }
        self.world.step(dt);
        // Crude discharge model so the battery field moves
        self.battery_v = (self.battery_v - 0.00001).max(6.0);
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcu_sim=info".into()),
        )
        .init();

    let args = Args::parse();
    let world_cfg: WorldConfig = match &args.config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => WorldConfig::default(),
    };

    let listener = TcpListener::bind(&args.listen).await?;
    info!(
        "🔌 mcu-sim listening on {} ({}×{} m room)",
        args.listen, world_cfg.room_w, world_cfg.room_d
    );

    // One controller at a time, like a real serial port
    loop {
        let (socket, peer) = listener.accept().await?;
        info!("controller connected from {peer}");
        let device = Device::new(World::new(world_cfg.clone()));
        if let Err(e) = serve_connection(socket, device).await {
            debug!("connection ended: {e}");
        }
        info!("controller disconnected");
    }
}

async fn serve_connection(socket: TcpStream, mut device: Device) -> anyhow::Result<()> {
    let (rd, mut wr) = socket.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut physics = interval(PHYSICS_STEP);
    let mut last_stream = Instant::now();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(l) => l,
                    None => return Ok(()),
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<McuCommand>(trimmed) {
                    Ok(command) => {
                        if let Some(reply) = device.apply(&command) {
                            wr.write_all(reply.as_bytes()).await?;
                            wr.write_all(b"\n").await?;
                        }
                    }
                    Err(e) => {
                        debug!("malformed command line ({e}): {trimmed}");
                        wr.write_all(json!({ "error": "parse" }).to_string().as_bytes()).await?;
                        wr.write_all(b"\n").await?;
                    }
                }
            }
            _ = physics.tick() => {
                device.tick(PHYSICS_STEP.as_secs_f64());
                if device.stream_ms > 0
                    && last_stream.elapsed() >= Duration::from_millis(device.stream_ms)
                {
                    last_stream = Instant::now();
                    wr.write_all(device.telemetry_line().as_bytes()).await?;
                    wr.write_all(b"\n").await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_replies() {
        let mut device = Device::new(World::new(WorldConfig::default()));
        assert_eq!(device.apply(&McuCommand::ping()).unwrap(), r#"{"ok":1}"#);
        assert_eq!(
            device.apply(&McuCommand::get_fw_version()).unwrap(),
            r#"{"fv":"sim-1.0"}"#
        );
        assert!(device.apply(&McuCommand::set_motors(100, 100)).is_none());
        assert_eq!(device.world.d1, 100);
        device.apply(&McuCommand::stop());
        assert_eq!((device.world.d1, device.world.d2), (0, 0));
        // A state dump is one full telemetry line on demand
        let dump = device.apply(&McuCommand::state_dump()).unwrap();
        assert!(dump.contains("\"d\":"));
    }

    #[test]
    fn stream_and_watchdog_config() {
        let mut device = Device::new(World::new(WorldConfig::default()));
        assert!(device.apply(&McuCommand::set_stream_period(200)).is_none());
        assert_eq!(device.stream_ms, 200);
        device.apply(&McuCommand::set_watchdog(1000));
        assert_eq!(device.watchdog_ms, 1000);
        device.apply(&McuCommand::set_stream_period(0));
        assert_eq!(device.stream_ms, 0);
    }

    #[test]
    fn watchdog_cuts_motors() {
        let mut device = Device::new(World::new(WorldConfig::default()));
        device.apply(&McuCommand::set_watchdog(1));
        device.apply(&McuCommand::set_motors(120, 120));
        device.last_command = Instant::now() - Duration::from_millis(50);
        device.tick(0.02);
        assert_eq!((device.world.d1, device.world.d2), (0, 0));
    }

    #[test]
    fn telemetry_uses_short_keys() {
        let device = Device::new(World::new(WorldConfig::default()));
        let v: serde_json::Value = serde_json::from_str(&device.telemetry_line()).unwrap();
        assert!(v.get("d").is_some());
        assert!(v.get("b").is_some());
        assert!(v.get("dist_f").is_none());
    }
}

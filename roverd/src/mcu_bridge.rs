//! # mcu_bridge
//!
//! JSON-per-line codec between the serial link and everything else.
//!
//! Inbound telemetry arrives with single-letter keys (a firmware-side
//! bandwidth optimisation); the bridge remaps them to readable names before
//! any consumer sees the line, then fans the remapped text to the wire hub
//! and a parsed `Telemetry` struct to local subscribers. Outbound commands
//! are small numbered JSON objects (`{"N":7,"D1":…,"D2":…}`) enqueued on the
//! link's write queue.
//!
//! On every reconnect the bridge restores the device's streaming state:
//! watchdog 1000 ms, telemetry every 200 ms, firmware version query.

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use rover_types::{McuCommand, Telemetry};

use crate::serial_link::SerialLink;
use crate::status::{EventLog, SharedStatus};

/// Short→long key remapping applied to every telemetry line.
const KEY_MAP: &[(&str, &str)] = &[
    ("t", "ts"),
    ("d", "dist_f"),
    ("i", "ir"),
    ("a", "accel"),
    ("g", "gyro"),
    ("tp", "temp"),
    ("b", "battery"),
    ("v", "mpu_valid"),
    ("fv", "fw_version"),
];

/// Keys that make a telemetry line interesting enough for the human log.
const LOG_KEYS: &[&str] = &["tank", "cmd", "ok", "error", "estop", "watchdog", "speed", "safety"];

/// Boot-sequence parameters pushed on every connect.
const WATCHDOG_MS: i32 = 1000;
const STREAM_PERIOD_MS: i32 = 200;

const REMAP_FANOUT_CAP: usize = 256;

/// Remap top-level short keys to their long names; unknown keys pass
/// through untouched.
pub fn remap_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let key = KEY_MAP
                        .iter()
                        .find(|(short, _)| *short == k)
                        .map(|(_, long)| long.to_string())
                        .unwrap_or(k);
                    (key, v)
                })
                .collect(),
        ),
        other => other,
    }
}

fn is_log_worthy(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| map.keys().any(|k| LOG_KEYS.contains(&k.as_str())))
        .unwrap_or(false)
}

// ── Bridge ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct McuBridge {
    link: SerialLink,
    remapped_tx: broadcast::Sender<String>,
    telemetry_tx: broadcast::Sender<Telemetry>,
    range_rx: watch::Receiver<i32>,
}

impl McuBridge {
    /// Spawn the decode task and the reconnect boot-sequence task.
    pub fn spawn(link: SerialLink, status: SharedStatus, log: EventLog) -> Self {
        let (remapped_tx, _) = broadcast::channel(REMAP_FANOUT_CAP);
        let (telemetry_tx, _) = broadcast::channel(REMAP_FANOUT_CAP);
        let (range_tx, range_rx) = watch::channel(rover_types::NO_RANGE);

        let bridge = Self {
            link: link.clone(),
            remapped_tx: remapped_tx.clone(),
            telemetry_tx: telemetry_tx.clone(),
            range_rx,
        };

        tokio::spawn(decode_task(
            link.clone(),
            remapped_tx,
            telemetry_tx,
            range_tx,
            status.clone(),
            log.clone(),
        ));
        tokio::spawn(boot_task(bridge.clone(), status, log));

        bridge
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    pub fn send(&self, cmd: McuCommand) {
        self.link.send_line(cmd.to_line());
    }

    pub fn set_motors(&self, d1: i32, d2: i32) {
        self.send(McuCommand::set_motors(d1, d2));
    }

    pub fn stop_motors(&self) {
        self.send(McuCommand::stop());
    }

    pub fn set_watchdog(&self, ms: i32) {
        self.send(McuCommand::set_watchdog(ms));
    }

    pub fn set_stream_period(&self, ms: i32) {
        self.send(McuCommand::set_stream_period(ms));
    }

    pub fn query_fw_version(&self) {
        self.send(McuCommand::get_fw_version());
    }

    /// Forward a raw command object from `/control` verbatim.
    pub fn send_raw(&self, value: &Value) {
        self.link.send_line(value.to_string());
    }

    // ── Subscriptions ─────────────────────────────────────────────────────────

    /// Remapped telemetry lines, as text, for the hub `/arduino` endpoint.
    pub fn subscribe_remapped(&self) -> broadcast::Receiver<String> {
        self.remapped_tx.subscribe()
    }

    /// Parsed telemetry for the mapper and anything else downstream.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry_tx.subscribe()
    }

    /// Latest forward ultrasonic reading, centimetres (-1 until the first).
    pub fn range_watch(&self) -> watch::Receiver<i32> {
        self.range_rx.clone()
    }

    /// Quiesce the device ahead of a firmware upload: stop streaming and
    /// disarm the watchdog so the bootloader sees a silent wire. The boot
    /// sequence re-arms everything when the link comes back after the
    /// upload.
    pub fn quiesce_for_upload(&self) {
        self.set_stream_period(0);
        self.set_watchdog(0);
    }
}

// ── Decode task ───────────────────────────────────────────────────────────────

async fn decode_task(
    link: SerialLink,
    remapped_tx: broadcast::Sender<String>,
    telemetry_tx: broadcast::Sender<Telemetry>,
    range_tx: watch::Sender<i32>,
    status: SharedStatus,
    log: EventLog,
) {
    let mut lines = link.subscribe_lines();
    loop {
        let line = match lines.recv().await {
            Ok(l) => l,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("bridge lagged {n} telemetry lines");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        // Malformed lines (partial boots, line noise) are dropped here and
        // never corrupt downstream state.
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                debug!("dropped malformed telemetry line: {e} ({line})");
                continue;
            }
        };

        let remapped = remap_keys(value);

        if is_log_worthy(&remapped) {
            log.push("arduino", remapped.to_string());
        }

        if let Ok(telemetry) = serde_json::from_value::<Telemetry>(remapped.clone()) {
            {
                let mut st = status.write().await;
                if let Some(d) = telemetry.dist_f {
                    st.last_range_cm = d;
                }
                if let Some(v) = telemetry.battery {
                    st.battery_v = Some(v);
                }
                if let Some(fv) = &telemetry.fw_version {
                    if st.fw_version.as_deref() != Some(fv) {
                        info!("MCU firmware version: {fv}");
                        st.fw_version = Some(fv.clone());
                    }
                }
            }
            if let Some(d) = telemetry.dist_f {
                let _ = range_tx.send(d);
            }
            let _ = telemetry_tx.send(telemetry);
        }

        let _ = remapped_tx.send(remapped.to_string());
    }
}

// ── Boot sequence on every (re)connect ────────────────────────────────────────

async fn boot_task(bridge: McuBridge, status: SharedStatus, log: EventLog) {
    let mut connected = bridge.link.connection_watch();
    let mut was_up = false;
    // The link may have connected before this task subscribed
    if *connected.borrow() {
        bridge.set_watchdog(WATCHDOG_MS);
        bridge.set_stream_period(STREAM_PERIOD_MS);
        bridge.query_fw_version();
        was_up = true;
    }
    loop {
        if connected.changed().await.is_err() {
            return;
        }
        let up = *connected.borrow();
        if up && !was_up {
            bridge.set_watchdog(WATCHDOG_MS);
            bridge.set_stream_period(STREAM_PERIOD_MS);
            bridge.query_fw_version();
            info!("MCU boot sequence sent (watchdog {WATCHDOG_MS} ms, stream {STREAM_PERIOD_MS} ms)");
            log.push("arduino", "connected, streaming configured");
        } else if !up && was_up {
            // Best effort; the queue flushes if the device comes back
            bridge.set_stream_period(0);
            status.write().await.last_range_cm = rover_types::NO_RANGE;
        }
        was_up = up;
    }
}

//! # status
//!
//! Process-wide runtime status and the human-facing event log. One
//! `SharedStatus` handle is created at startup and passed into every
//! component at construction; the presentation layer (hub `/status`,
//! `get_status`) only ever reads snapshots of it. The event log is a
//! bounded ring with broadcast fan-out so remote consoles can tail it
//! without holding up the writers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use rover_types::NO_RANGE;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Runtime status ────────────────────────────────────────────────────────────

/// Connection and mode flags plus the handful of live values the UI shows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeStatus {
    pub arduino_connected: bool,
    pub flir_connected: bool,
    pub mapping_active: bool,
    pub wander_active: bool,
    pub explore_active: bool,
    pub recording_active: bool,
    pub exploration_complete: bool,
    pub firmware_uploading: bool,
    /// Auto-reconnect attempts consumed since the last successful open
    pub arduino_retries: u32,
    pub flir_retries: u32,
    pub fw_version: Option<String>,
    /// Latest forward ultrasonic reading, centimetres (-1 until one arrives)
    pub last_range_cm: i32,
    pub battery_v: Option<f64>,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            arduino_connected: false,
            flir_connected: false,
            mapping_active: false,
            wander_active: false,
            explore_active: false,
            recording_active: false,
            exploration_complete: false,
            firmware_uploading: false,
            arduino_retries: 0,
            flir_retries: 0,
            fw_version: None,
            last_range_cm: NO_RANGE,
            battery_v: None,
        }
    }
}

pub type SharedStatus = Arc<RwLock<RuntimeStatus>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(RuntimeStatus::default()))
}

// ── Event log ─────────────────────────────────────────────────────────────────

const LOG_RING_CAP: usize = 100;
const LOG_FANOUT_CAP: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub source: String,
    pub message: String,
}

/// Bounded in-memory log with subscription fan-out. Cheap to clone; all
/// clones share one ring.
#[derive(Clone)]
pub struct EventLog {
    ring: Arc<Mutex<VecDeque<LogEntry>>>,
    tx: broadcast::Sender<LogEntry>,
}

impl EventLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_FANOUT_CAP);
        Self { ring: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_RING_CAP))), tx }
    }

    pub fn push(&self, source: &str, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp_ms: now_ms(),
            source: source.to_string(),
            message: message.into(),
        };
        {
            let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() >= LOG_RING_CAP {
                ring.pop_front();
            }
            ring.push_back(entry.clone());
        }
        let _ = self.tx.send(entry);
    }

    /// The retained tail, oldest first.
    pub fn recent(&self) -> Vec<LogEntry> {
        self.ring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded_to_100() {
        let log = EventLog::new();
        for i in 0..150 {
            log.push("test", format!("entry {i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].message, "entry 50");
        assert_eq!(recent[99].message, "entry 149");
    }

    #[test]
    fn subscribers_see_new_entries() {
        let log = EventLog::new();
        let mut rx = log.subscribe();
        log.push("serial", "reconnected");
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.source, "serial");
        assert_eq!(entry.message, "reconnected");
    }
}

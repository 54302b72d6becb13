//! # supervisor
//!
//! Owns every bridge and mode for the life of the process: the serial link
//! and MCU bridge, the thermal driver, the mapper, the motion controllers
//! and dataset recording. The wire hub and the host layer talk to it
//! through `handle_command` (named intents) and the `offer_*` input
//! methods (pose / phone IMU / camera frames); it never holds a pointer
//! back into either of them, they subscribe to its broadcast channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rover_types::{ImuSample, Pose};

use crate::config::RuntimeConfig;
use crate::explore;
use crate::flir::{FlirDriver, ThermalFrame};
use crate::mapper::Mapper;
use crate::mcu_bridge::McuBridge;
use crate::motion::MotionCtx;
use crate::persistence::save_map_snapshot;
use crate::recorder::DatasetRecorder;
use crate::serial_link::SerialLink;
use crate::status::{EventLog, SharedStatus};
use crate::stk500::{self, UploadEvent};
use crate::wander;

const FANOUT_CAP: usize = 64;

/// Which motion controller is on the motors, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Wander,
    Explore,
}

struct MotionRun {
    mode: Mode,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    config: RuntimeConfig,
    status: SharedStatus,
    log: EventLog,
    pub link: SerialLink,
    pub bridge: McuBridge,
    pub flir: FlirDriver,
    pub mapper: Arc<RwLock<Mapper>>,
    motion: Mutex<Option<MotionRun>>,
    recorder: Mutex<Option<DatasetRecorder>>,
    // Fan-out the hub endpoints subscribe to
    imu_tx: broadcast::Sender<String>,
    camera_tx: broadcast::Sender<Bytes>,
    flir_tx: broadcast::Sender<Bytes>,
    firmware_tx: broadcast::Sender<String>,
}

impl Supervisor {
    /// Build the whole bridge stack and start the feed tasks.
    pub fn start(config: RuntimeConfig, status: SharedStatus, log: EventLog) -> Arc<Self> {
        let link = SerialLink::spawn(config.serial.clone(), status.clone(), log.clone());
        let bridge = McuBridge::spawn(link.clone(), status.clone(), log.clone());
        let mapper = Arc::new(RwLock::new(Mapper::new()));

        let (flir_frames_tx, flir_frames_rx) = mpsc::channel::<ThermalFrame>(8);
        let flir = if config.flir.enabled {
            FlirDriver::spawn(config.flir.clone(), flir_frames_tx, status.clone(), log.clone())
        } else {
            FlirDriver::disabled()
        };

        let (imu_tx, _) = broadcast::channel(FANOUT_CAP);
        let (camera_tx, _) = broadcast::channel(FANOUT_CAP);
        let (flir_tx, _) = broadcast::channel(FANOUT_CAP);
        let (firmware_tx, _) = broadcast::channel(FANOUT_CAP);

        let supervisor = Arc::new(Self {
            config,
            status,
            log,
            link,
            bridge,
            flir,
            mapper,
            motion: Mutex::new(None),
            recorder: Mutex::new(None),
            imu_tx,
            camera_tx,
            flir_tx,
            firmware_tx,
        });

        tokio::spawn(range_feed(supervisor.clone()));
        tokio::spawn(flir_feed(supervisor.clone(), flir_frames_rx));
        supervisor
    }

    // ── Host-side inputs (pose source, platform sensors) ──────────────────────

    /// Pose from the external pose source; fused while mapping is active,
    /// recorded while a dataset is open.
    pub async fn offer_pose(&self, pose: Pose) {
        if self.status.read().await.mapping_active {
            self.mapper.write().await.on_pose(pose);
        }
        if let Some(rec) = self.recorder.lock().await.as_ref() {
            rec.record_pose(pose);
        }
    }

    /// Phone IMU sample: streamed on `/imu`, recorded while a dataset is open.
    pub async fn offer_imu(&self, s: ImuSample) {
        let line = json!({
            "ts": s.ts_ns,
            "ax": s.ax, "ay": s.ay, "az": s.az,
            "gx": s.wx, "gy": s.wy, "gz": s.wz,
        });
        let _ = self.imu_tx.send(line.to_string());
        if let Some(rec) = self.recorder.lock().await.as_ref() {
            rec.record_imu(s);
        }
    }

    /// Whole JPEG frame from the platform camera.
    pub async fn offer_camera_frame(&self, ts_ns: u64, jpeg: Vec<u8>) {
        if let Some(rec) = self.recorder.lock().await.as_ref() {
            rec.record_camera(ts_ns, jpeg.clone());
        }
        let _ = self.camera_tx.send(Bytes::from(jpeg));
    }

    // ── Hub subscriptions ─────────────────────────────────────────────────────

    pub fn subscribe_imu(&self) -> broadcast::Receiver<String> {
        self.imu_tx.subscribe()
    }

    pub fn subscribe_camera(&self) -> broadcast::Receiver<Bytes> {
        self.camera_tx.subscribe()
    }

    pub fn subscribe_flir(&self) -> broadcast::Receiver<Bytes> {
        self.flir_tx.subscribe()
    }

    pub fn subscribe_firmware_events(&self) -> broadcast::Receiver<String> {
        self.firmware_tx.subscribe()
    }

    // ── Firmware ──────────────────────────────────────────────────────────────

    /// Kick off an upload from a `/firmware` hex blob; progress and the
    /// final done event stream back on the firmware broadcast.
    pub async fn start_firmware_upload(self: &Arc<Self>, hex_text: String) {
        if self.status.read().await.firmware_uploading {
            let _ = self.firmware_tx.send(
                UploadEvent::Done { success: false, message: "upload already running".into() }
                    .to_json(),
            );
            return;
        }
        // Motors off before anyone touches the port
        self.stop_motion().await;
        let sup = self.clone();
        tokio::spawn(async move {
            let events = sup.firmware_tx.clone();
            let mut emit = |e: UploadEvent| {
                let _ = events.send(e.to_json());
            };
            stk500::run_upload(&hex_text, &sup.bridge, &sup.link, &sup.status, &mut emit).await;
        });
    }

    // ── Motion modes ──────────────────────────────────────────────────────────

    async fn start_motion(self: &Arc<Self>, mode: Mode) {
        self.stop_motion().await;

        // Motion needs a live map under it
        self.status.write().await.mapping_active = true;

        let stop = Arc::new(AtomicBool::new(false));
        let ctx = MotionCtx {
            bridge: self.bridge.clone(),
            mapper: self.mapper.clone(),
            status: self.status.clone(),
            tuning: self.config.motion.clone(),
            stop: stop.clone(),
            range: self.bridge.range_watch(),
        };

        let status = self.status.clone();
        let task = match mode {
            Mode::Wander => tokio::spawn(async move {
                status.write().await.wander_active = true;
                wander::run(ctx).await;
                status.write().await.wander_active = false;
            }),
            Mode::Explore => tokio::spawn(async move {
                status.write().await.explore_active = true;
                explore::run(ctx).await;
                status.write().await.explore_active = false;
            }),
        };

        *self.motion.lock().await = Some(MotionRun { mode, stop, task });
        self.log.push("supervisor", format!("{mode:?} started"));
    }

    /// Trip the stop flag, wait for the controller to unwind, and make
    /// absolutely sure the motors are stopped.
    async fn stop_motion(&self) {
        let run = self.motion.lock().await.take();
        if let Some(run) = run {
            run.stop.store(true, Ordering::Relaxed);
            let _ = run.task.await;
            self.log.push("supervisor", format!("{:?} stopped", run.mode));
        }
        self.bridge.stop_motors();
    }

    async fn active_mode(&self) -> Option<Mode> {
        let guard = self.motion.lock().await;
        guard.as_ref().map(|r| r.mode)
    }

    // ── Remote commands ───────────────────────────────────────────────────────

    /// Named command intake; every reply echoes the command plus `ok` or
    /// `error`.
    pub async fn handle_command(self: &Arc<Self>, cmd: &str) -> Value {
        info!("command: {cmd}");
        let result: Result<Value, String> = match cmd {
            "start_map" => {
                let mut mapper = self.mapper.write().await;
                mapper.clear_grid();
                drop(mapper);
                self.status.write().await.mapping_active = true;
                Ok(json!({}))
            }
            "stop_map" => {
                self.status.write().await.mapping_active = false;
                let snapshot = self.mapper.read().await.snapshot();
                match save_map_snapshot(&snapshot, &self.config.mapping.data_dir).await {
                    Ok(path) => Ok(json!({ "saved": path.display().to_string() })),
                    Err(e) => Err(format!("snapshot failed: {e}")),
                }
            }
            "start_wander" => {
                self.start_motion(Mode::Wander).await;
                Ok(json!({}))
            }
            "stop_wander" => match self.active_mode().await {
                Some(Mode::Wander) => {
                    self.stop_motion().await;
                    Ok(json!({}))
                }
                _ => Err("wander not running".into()),
            },
            "start_explore" => {
                self.start_motion(Mode::Explore).await;
                Ok(json!({}))
            }
            "stop_explore" => match self.active_mode().await {
                Some(Mode::Explore) => {
                    self.stop_motion().await;
                    Ok(json!({}))
                }
                _ => Err("explore not running".into()),
            },
            "start_recording" => {
                let mut guard = self.recorder.lock().await;
                if guard.is_some() {
                    Err("already recording".into())
                } else {
                    match DatasetRecorder::start(&self.config.mapping.data_dir).await {
                        Ok(rec) => {
                            *guard = Some(rec);
                            self.status.write().await.recording_active = true;
                            Ok(json!({}))
                        }
                        Err(e) => Err(format!("recording failed: {e}")),
                    }
                }
            }
            "stop_recording" => {
                let rec = self.recorder.lock().await.take();
                match rec {
                    Some(rec) => {
                        self.status.write().await.recording_active = false;
                        let dir = rec.stop().await;
                        Ok(json!({ "dataset": dir.map(|d| d.display().to_string()) }))
                    }
                    None => Err("not recording".into()),
                }
            }
            "retry_arduino" => {
                self.link.request_retry();
                Ok(json!({}))
            }
            "retry_flir" => {
                self.flir.retry();
                Ok(json!({}))
            }
            "stop" => {
                self.stop_motion().await;
                Ok(json!({}))
            }
            "get_status" => {
                let status = self.status.read().await.clone();
                let mapper = self.mapper.read().await;
                Ok(json!({
                    "status": status,
                    "map": {
                        "cells": mapper.grid().cell_count(),
                        "trail": mapper.grid().trail().len(),
                        "counters": mapper.counters(),
                        "drift": mapper.drift_offset(),
                    },
                }))
            }
            other => Err(format!("unknown command: {other}")),
        };

        match result {
            Ok(extra) => {
                let mut reply = json!({ "cmd": cmd, "ok": true });
                merge(&mut reply, extra);
                reply
            }
            Err(e) => {
                warn!("command {cmd} failed: {e}");
                json!({ "cmd": cmd, "error": e })
            }
        }
    }

    /// Route one `/control` message by its `target` field.
    pub async fn handle_control_message(self: &Arc<Self>, msg: &Value) -> Option<Value> {
        match msg.get("target").and_then(Value::as_str) {
            Some("arduino") => {
                // Raw MCU command pass-through; strip the routing field
                let mut fwd = msg.clone();
                if let Some(obj) = fwd.as_object_mut() {
                    obj.remove("target");
                }
                self.bridge.send_raw(&fwd);
                None
            }
            Some("map") => {
                let cmd = msg.get("cmd").and_then(Value::as_str).unwrap_or("");
                Some(self.handle_command(cmd).await)
            }
            other => Some(json!({ "error": format!("unknown target: {other:?}") })),
        }
    }
}

fn merge(reply: &mut Value, extra: Value) {
    if let (Some(dst), Some(src)) = (reply.as_object_mut(), extra.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
}

// ── Feed tasks ────────────────────────────────────────────────────────────────

/// MCU telemetry → mapper range fusion (gated by mapping mode).
async fn range_feed(sup: Arc<Supervisor>) {
    let mut telemetry = sup.bridge.subscribe_telemetry();
    loop {
        let frame = match telemetry.recv().await {
            Ok(t) => t,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if let Some(dist) = frame.dist_f {
            if sup.status.read().await.mapping_active {
                sup.mapper.write().await.on_range_cm(dist);
            }
        }
    }
}

/// Thermal frames → `/flir` wire encoding.
async fn flir_feed(sup: Arc<Supervisor>, mut frames: mpsc::Receiver<ThermalFrame>) {
    while let Some(frame) = frames.recv().await {
        let _ = sup.flir_tx.send(Bytes::from(frame.encode_wire()));
    }
}

//! # recorder
//!
//! Dataset recording in the layout the mapping tooling expects:
//!
//! ```text
//! dataset_YYYYMMDD_HHmmss/
//!   cam0/<timestamp_ns>.jpg
//!   imu0.csv      #timestamp_ns,wx,wy,wz,ax,ay,az
//!   poses.csv     #timestamp_ns,tx,ty,tz,qx,qy,qz,qw
//!   metadata.json
//! ```
//!
//! A single writer task owns the open files; producers enqueue over a
//! bounded channel and samples are dropped (counted) rather than letting a
//! slow disk back up the sensor paths.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Local;
use serde_json::json;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use rover_types::{ImuSample, Pose};

const QUEUE_CAP: usize = 512;

enum Event {
    Camera { ts_ns: u64, jpeg: Vec<u8> },
    Imu(ImuSample),
    Pose(Pose),
    Stop(oneshot::Sender<PathBuf>),
}

/// Handle to one recording session. Cloneable; `stop` ends the session and
/// finalises `metadata.json`.
#[derive(Clone)]
pub struct DatasetRecorder {
    tx: mpsc::Sender<Event>,
}

impl DatasetRecorder {
    /// Create `dataset_YYYYMMDD_HHmmss/` under `data_dir` and start the
    /// writer task.
    pub async fn start(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(format!("dataset_{}", Local::now().format("%Y%m%d_%H%M%S")));
        fs::create_dir_all(dir.join("cam0")).await?;

        let mut imu = File::create(dir.join("imu0.csv")).await?;
        imu.write_all(b"#timestamp_ns,wx,wy,wz,ax,ay,az\n").await?;
        let mut poses = File::create(dir.join("poses.csv")).await?;
        poses.write_all(b"#timestamp_ns,tx,ty,tz,qx,qy,qz,qw\n").await?;

        let (tx, rx) = mpsc::channel(QUEUE_CAP);
        tokio::spawn(writer_task(dir.clone(), imu, poses, rx));
        info!("dataset recording into {}", dir.display());
        Ok(Self { tx })
    }

    pub fn record_camera(&self, ts_ns: u64, jpeg: Vec<u8>) {
        if self.tx.try_send(Event::Camera { ts_ns, jpeg }).is_err() {
            warn!("recorder queue full, dropped camera frame");
        }
    }

    pub fn record_imu(&self, sample: ImuSample) {
        let _ = self.tx.try_send(Event::Imu(sample));
    }

    pub fn record_pose(&self, pose: Pose) {
        let _ = self.tx.try_send(Event::Pose(pose));
    }

    /// Finish the session; resolves to the dataset directory once
    /// `metadata.json` is on disk.
    pub async fn stop(self) -> Option<PathBuf> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx.send(Event::Stop(done_tx)).await.ok()?;
        done_rx.await.ok()
    }
}

async fn writer_task(dir: PathBuf, mut imu: File, mut poses: File, mut rx: mpsc::Receiver<Event>) {
    let started_ms = crate::status::now_ms();
    let mut camera_frames: u64 = 0;
    let mut imu_samples: u64 = 0;
    let mut pose_samples: u64 = 0;
    let mut done: Option<oneshot::Sender<PathBuf>> = None;

    while let Some(event) = rx.recv().await {
        match event {
            Event::Camera { ts_ns, jpeg } => {
                let path = dir.join("cam0").join(format!("{ts_ns}.jpg"));
                match OpenOptions::new().create(true).write(true).open(&path).await {
                    Ok(mut f) => {
                        if f.write_all(&jpeg).await.is_ok() {
                            camera_frames += 1;
                        }
                    }
                    Err(e) => warn!("recorder: {}: {e}", path.display()),
                }
            }
            Event::Imu(s) => {
                let line = format!(
                    "{},{},{},{},{},{},{}\n",
                    s.ts_ns, s.wx, s.wy, s.wz, s.ax, s.ay, s.az
                );
                if imu.write_all(line.as_bytes()).await.is_ok() {
                    imu_samples += 1;
                }
            }
            Event::Pose(p) => {
                let line = format!(
                    "{},{},{},{},{},{},{},{}\n",
                    p.ts_ns, p.tx, p.ty, p.tz, p.qx, p.qy, p.qz, p.qw
                );
                if poses.write_all(line.as_bytes()).await.is_ok() {
                    pose_samples += 1;
                }
            }
            Event::Stop(reply) => {
                done = Some(reply);
                break;
            }
        }
    }

    let _ = imu.flush().await;
    let _ = poses.flush().await;

    let metadata = json!({
        "started_ms": started_ms,
        "ended_ms": crate::status::now_ms(),
        "camera_frames": camera_frames,
        "imu_samples": imu_samples,
        "poses": pose_samples,
    });
    if let Err(e) = fs::write(dir.join("metadata.json"), metadata.to_string()).await {
        warn!("recorder: metadata.json: {e}");
    }
    info!(
        "dataset closed: {camera_frames} frames, {imu_samples} imu, {pose_samples} poses"
    );
    if let Some(reply) = done {
        let _ = reply.send(dir);
    }
}

// ── Replay support ────────────────────────────────────────────────────────────

/// Load `poses.csv` from a recorded dataset for `--replay`.
pub async fn load_poses(dataset_dir: &Path) -> Result<Vec<Pose>> {
    let text = fs::read_to_string(dataset_dir.join("poses.csv")).await?;
    let mut poses = Vec::new();
    for line in text.lines() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        if let Some(pose) = parse_pose_line(line) {
            poses.push(pose);
        } else {
            warn!("replay: skipping malformed pose line: {line}");
        }
    }
    Ok(poses)
}

fn parse_pose_line(line: &str) -> Option<Pose> {
    let mut fields = line.split(',');
    let ts_ns = fields.next()?.trim().parse().ok()?;
    let mut f = [0.0f64; 7];
    for v in f.iter_mut() {
        *v = fields.next()?.trim().parse().ok()?;
    }
    Some(Pose { ts_ns, tx: f[0], ty: f[1], tz: f[2], qx: f[3], qy: f[4], qz: f[5], qw: f[6] })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_lines_parse() {
        let p = parse_pose_line("12,0.5,0,1.5,0,0,0,1").unwrap();
        assert_eq!(p.ts_ns, 12);
        assert!((p.tz - 1.5).abs() < 1e-12);
        assert!((p.qw - 1.0).abs() < 1e-12);
        assert!(parse_pose_line("not,a,pose").is_none());
    }

    #[tokio::test]
    async fn recorded_poses_load_back() {
        let base = std::env::temp_dir().join(format!("roverd-replay-{}", std::process::id()));
        let rec = DatasetRecorder::start(&base).await.unwrap();
        rec.record_pose(Pose::on_ground(5, 1.0, 2.0, 0.3));
        let dir = rec.stop().await.unwrap();

        let poses = load_poses(&dir).await.unwrap();
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].ts_ns, 5);
        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn records_the_expected_layout() {
        let base = std::env::temp_dir().join(format!("roverd-rec-{}", std::process::id()));
        let rec = DatasetRecorder::start(&base).await.unwrap();

        rec.record_camera(123_456, vec![0xFF, 0xD8, 0xFF]);
        rec.record_imu(ImuSample { ts_ns: 1, wx: 0.1, wy: 0.2, wz: 0.3, ax: 1.0, ay: 2.0, az: 3.0 });
        rec.record_pose(Pose::on_ground(2, 0.5, 0.5, 0.0));
        let dir = rec.stop().await.unwrap();

        assert!(dir.join("cam0/123456.jpg").exists());
        let imu = std::fs::read_to_string(dir.join("imu0.csv")).unwrap();
        assert!(imu.starts_with("#timestamp_ns,wx,wy,wz,ax,ay,az\n"));
        assert!(imu.contains("1,0.1,0.2,0.3,1,2,3"));
        let poses = std::fs::read_to_string(dir.join("poses.csv")).unwrap();
        assert!(poses.starts_with("#timestamp_ns,tx,ty,tz,qx,qy,qz,qw\n"));
        let meta: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("metadata.json")).unwrap())
                .unwrap();
        assert_eq!(meta["camera_frames"], 1);
        assert_eq!(meta["imu_samples"], 1);
        assert_eq!(meta["poses"], 1);

        let _ = std::fs::remove_dir_all(&base);
    }
}

//! # serial_link
//!
//! Line-framed serial transport to the motor-driver MCU at 115200 8-N-1.
//!
//! ## Architecture
//! A control task owns the port lifecycle (open, reconnect, firmware
//! handover); while connected it runs one reader task and one writer task
//! over the split stream. Received whole lines (CR stripped) fan out on a
//! broadcast channel; writes go through a bounded drop-oldest queue so a
//! stalled port can never back-pressure the motion controllers: drive
//! commands are idempotent and the freshest intent wins.
//!
//! ## Reconnect
//! Detachment closes the port and schedules reopen attempts: ~2 s after the
//! loss, then every 3 s, at most 3 automatic attempts. After that the link
//! stays down until `request_retry` (the `retry_arduino` remote command).
//! A freshly opened device gets a 2.5 s quiescence window (it may still be
//! in its bootloader) and any buffered bytes are drained before use.
//!
//! ## Firmware handover
//! `acquire_port` parks both I/O tasks and moves the raw `SerialStream` to
//! the caller; `release_port` gives it back and resumes normal operation.
//! The port is exclusively owned by one side at a time, never both.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info, warn};

use crate::config::SerialConfig;
use crate::status::{EventLog, SharedStatus};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Write queue bound; overflow drops the oldest pending command.
const WRITE_QUEUE_CAP: usize = 64;
/// Pause before the first reopen attempt after a detach.
const DETACH_SETTLE: Duration = Duration::from_secs(2);
/// Interval between automatic reopen attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Automatic attempts before requiring a manual retry.
const MAX_AUTO_RETRIES: u32 = 3;
/// A freshly opened device may still be in its bootloader.
const BOOT_QUIESCENCE: Duration = Duration::from_millis(2500);
/// Read timeout used when draining stale input after open.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(50);

const LINE_FANOUT_CAP: usize = 256;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("serial device not found: {0}")]
    NotFound(String),
    #[error("serial device permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed to open serial device: {0}")]
    OpenFailed(String),
    #[error("serial I/O error: {0}")]
    IoError(String),
    #[error("reconnect budget exhausted, retry manually")]
    RetryExhausted,
}

// ── Write queue ───────────────────────────────────────────────────────────────

/// Bounded FIFO shared by the handle (producer) and the writer task.
struct WriteQueue {
    lines: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl WriteQueue {
    fn new() -> Self {
        Self { lines: Mutex::new(VecDeque::with_capacity(WRITE_QUEUE_CAP)), notify: Notify::new() }
    }

    /// Push a line; on overflow the oldest entry makes room.
    /// Returns the dropped line, if any.
    fn push(&self, line: String) -> Option<String> {
        let dropped = {
            let mut q = self.lines.lock().unwrap_or_else(|e| e.into_inner());
            let dropped = if q.len() >= WRITE_QUEUE_CAP { q.pop_front() } else { None };
            q.push_back(line);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

enum LinkCmd {
    Acquire(oneshot::Sender<Result<SerialStream, LinkError>>),
    Release(SerialStream),
    Retry,
}

/// Cloneable handle to the link's control task.
#[derive(Clone)]
pub struct SerialLink {
    queue: Arc<WriteQueue>,
    cmd_tx: mpsc::Sender<LinkCmd>,
    line_tx: broadcast::Sender<String>,
    connected_rx: watch::Receiver<bool>,
    log: EventLog,
}

impl SerialLink {
    /// Spawn the control task and return the handle.
    pub fn spawn(cfg: SerialConfig, status: SharedStatus, log: EventLog) -> Self {
        let queue = Arc::new(WriteQueue::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (line_tx, _) = broadcast::channel(LINE_FANOUT_CAP);
        let (connected_tx, connected_rx) = watch::channel(false);

        let task = ControlTask {
            cfg,
            queue: queue.clone(),
            line_tx: line_tx.clone(),
            connected_tx,
            status,
            log: log.clone(),
        };
        tokio::spawn(task.run(cmd_rx));

        Self { queue, cmd_tx, line_tx, connected_rx, log }
    }

    /// Enqueue one command line (newline appended on the wire).
    pub fn send_line(&self, line: String) {
        if let Some(dropped) = self.queue.push(line) {
            warn!("serial write queue full, dropped oldest: {dropped}");
            self.log.push("serial", "write queue overflow, oldest command dropped");
        }
    }

    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    /// True while the port is open and running normal I/O.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Take exclusive ownership of the raw port (firmware programming).
    pub async fn acquire_port(&self) -> Result<SerialStream, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(LinkCmd::Acquire(tx))
            .await
            .map_err(|_| LinkError::IoError("link task gone".into()))?;
        rx.await.map_err(|_| LinkError::IoError("link task gone".into()))?
    }

    /// Return the port after `acquire_port` and resume normal operation.
    pub async fn release_port(&self, stream: SerialStream) {
        let _ = self.cmd_tx.send(LinkCmd::Release(stream)).await;
    }

    /// Re-arm the reconnect loop after the retry budget ran out.
    pub fn request_retry(&self) {
        let _ = self.cmd_tx.try_send(LinkCmd::Retry);
    }
}

// ── Control task ──────────────────────────────────────────────────────────────

struct ControlTask {
    cfg: SerialConfig,
    queue: Arc<WriteQueue>,
    line_tx: broadcast::Sender<String>,
    connected_tx: watch::Sender<bool>,
    status: SharedStatus,
    log: EventLog,
}

/// Why the connected session ended.
enum SessionEnd {
    /// Port is gone; go reconnect
    IoError(String),
    /// Port handed to the firmware programmer; wait for release
    HandedOver,
    /// Acquire fell through (caller vanished); keep running with the port
    Resume(SerialStream),
}

impl ControlTask {
    async fn run(self, mut cmd_rx: mpsc::Receiver<LinkCmd>) {
        let mut first_attempt = true;
        loop {
            // ── Open phase ────────────────────────────────────────────────
            let mut retries: u32 = 0;
            let stream = loop {
                if !first_attempt {
                    tokio::time::sleep(if retries == 0 { DETACH_SETTLE } else { RETRY_INTERVAL }).await;
                }
                first_attempt = false;

                match self.open_port().await {
                    Ok(s) => break s,
                    Err(e) => {
                        retries += 1;
                        self.status.write().await.arduino_retries = retries;
                        warn!("serial open failed (attempt {retries}/{MAX_AUTO_RETRIES}): {e}");
                        if retries >= MAX_AUTO_RETRIES {
                            self.log.push("serial", format!("{}: {e}", LinkError::RetryExhausted));
                            // Park until someone asks for another round
                            loop {
                                match cmd_rx.recv().await {
                                    Some(LinkCmd::Retry) => break,
                                    Some(LinkCmd::Acquire(tx)) => {
                                        let _ = tx.send(Err(LinkError::RetryExhausted));
                                    }
                                    Some(LinkCmd::Release(_)) => {}
                                    None => return,
                                }
                            }
                            retries = 0;
                        }
                    }
                }
            };

            self.status.write().await.arduino_retries = 0;

            // ── Connected phase ───────────────────────────────────────────
            let mut stream = Some(stream);
            loop {
                let s = match stream.take() {
                    Some(s) => s,
                    None => break,
                };
                match self.run_session(s, &mut cmd_rx).await {
                    SessionEnd::IoError(msg) => {
                        self.set_connected(false).await;
                        self.log.push("serial", format!("link lost: {msg}"));
                        break; // back to the open phase
                    }
                    SessionEnd::Resume(s) => stream = Some(s),
                    SessionEnd::HandedOver => {
                        self.set_connected(false).await;
                        match self.wait_for_release(&mut cmd_rx).await {
                            Some(s) => stream = Some(s),
                            None => return,
                        }
                    }
                }
            }
        }
    }

    async fn set_connected(&self, up: bool) {
        let _ = self.connected_tx.send(up);
        self.status.write().await.arduino_connected = up;
    }

    /// Rescan, open and settle the device.
    async fn open_port(&self) -> Result<SerialStream, LinkError> {
        let ports = tokio_serial::available_ports().unwrap_or_default();
        if !ports.iter().any(|p| p.port_name == self.cfg.port) {
            return Err(LinkError::NotFound(self.cfg.port.clone()));
        }

        let mut stream = tokio_serial::new(&self.cfg.port, self.cfg.baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| match e.kind {
                tokio_serial::ErrorKind::NoDevice => LinkError::NotFound(self.cfg.port.clone()),
                tokio_serial::ErrorKind::Io(ErrorKind::PermissionDenied) => {
                    LinkError::PermissionDenied(self.cfg.port.clone())
                }
                _ => LinkError::OpenFailed(e.to_string()),
            })?;

        info!("serial port {} open at {} baud", self.cfg.port, self.cfg.baud);

        // The device may still be in its bootloader; give it time, then
        // throw away whatever it printed while we were not listening.
        tokio::time::sleep(BOOT_QUIESCENCE).await;
        let mut scratch = [0u8; 512];
        while let Ok(Ok(n)) = timeout(DRAIN_READ_TIMEOUT, stream.read(&mut scratch)).await {
            if n == 0 {
                break;
            }
            debug!("drained {n} stale bytes after open");
        }

        Ok(stream)
    }

    /// Run reader + writer over the split stream until an I/O error or an
    /// acquire request. On acquire the halves are rejoined and the whole
    /// stream moves to the programmer.
    async fn run_session(
        &self,
        stream: SerialStream,
        cmd_rx: &mut mpsc::Receiver<LinkCmd>,
    ) -> SessionEnd {
        self.set_connected(true).await;
        self.log.push("serial", "link up");

        let (stop_tx, stop_rx) = watch::channel(false);
        let (err_tx, mut err_rx) = mpsc::channel::<String>(2);

        let (rd, wr) = tokio::io::split(stream);
        let reader = tokio::spawn(reader_task(rd, self.line_tx.clone(), stop_rx.clone(), err_tx.clone()));
        let writer = tokio::spawn(writer_task(wr, self.queue.clone(), stop_rx, err_tx));

        enum Why {
            Err(String),
            Acquire(oneshot::Sender<Result<SerialStream, LinkError>>),
        }

        let why = loop {
            tokio::select! {
                Some(msg) = err_rx.recv() => break Why::Err(msg),
                cmd = cmd_rx.recv() => match cmd {
                    Some(LinkCmd::Acquire(tx)) => break Why::Acquire(tx),
                    Some(LinkCmd::Retry) => {} // already connected
                    Some(LinkCmd::Release(_)) => {
                        warn!("release without acquire, dropping stray stream");
                    }
                    None => break Why::Err("handle dropped".into()),
                },
            }
        };

        let _ = stop_tx.send(true);
        let halves = match (reader.await, writer.await) {
            (Ok(rd), Ok(wr)) => Some(rd.unsplit(wr)),
            _ => None,
        };

        match why {
            Why::Err(msg) => SessionEnd::IoError(msg),
            Why::Acquire(tx) => match halves {
                Some(stream) => {
                    info!("serial port handed to firmware programmer");
                    match tx.send(Ok(stream)) {
                        Ok(()) => SessionEnd::HandedOver,
                        // Caller vanished before taking delivery; keep the port
                        Err(Ok(stream)) => SessionEnd::Resume(stream),
                        Err(Err(_)) => SessionEnd::IoError("acquire failed".into()),
                    }
                }
                None => {
                    let _ = tx.send(Err(LinkError::IoError("port task panicked".into())));
                    SessionEnd::IoError("port task panicked".into())
                }
            },
        }
    }

    /// Park (queue pushes keep landing, no I/O happens) until the
    /// programmer returns the stream.
    async fn wait_for_release(
        &self,
        cmd_rx: &mut mpsc::Receiver<LinkCmd>,
    ) -> Option<SerialStream> {
        loop {
            match cmd_rx.recv().await? {
                LinkCmd::Release(stream) => {
                    info!("serial port returned by firmware programmer");
                    return Some(stream);
                }
                LinkCmd::Acquire(tx) => {
                    let _ = tx.send(Err(LinkError::IoError("port already acquired".into())));
                }
                LinkCmd::Retry => {}
            }
        }
    }
}

// ── Reader / writer tasks ─────────────────────────────────────────────────────

async fn reader_task(
    mut rd: ReadHalf<SerialStream>,
    line_tx: broadcast::Sender<String>,
    mut stop: watch::Receiver<bool>,
    err_tx: mpsc::Sender<String>,
) -> ReadHalf<SerialStream> {
    let mut acc: Vec<u8> = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = stop.changed() => return rd,
            result = rd.read(&mut buf) => match result {
                Ok(0) => {
                    let _ = err_tx.send("EOF on serial read".into()).await;
                    return rd;
                }
                Ok(n) => {
                    acc.extend_from_slice(&buf[..n]);
                    for line in take_lines(&mut acc) {
                        let _ = line_tx.send(line);
                    }
                }
                Err(e) => {
                    let _ = err_tx.send(e.to_string()).await;
                    return rd;
                }
            },
        }
    }
}

async fn writer_task(
    mut wr: WriteHalf<SerialStream>,
    queue: Arc<WriteQueue>,
    mut stop: watch::Receiver<bool>,
    err_tx: mpsc::Sender<String>,
) -> WriteHalf<SerialStream> {
    loop {
        while let Some(line) = queue.pop() {
            let mut framed = line.into_bytes();
            framed.push(b'\n');
            if let Err(e) = wr.write_all(&framed).await {
                let _ = err_tx.send(e.to_string()).await;
                return wr;
            }
            if *stop.borrow() {
                return wr;
            }
        }
        tokio::select! {
            _ = stop.changed() => return wr,
            _ = queue.wait() => {}
        }
    }
}

/// Split accumulated bytes into complete lines; the trailing partial line
/// stays in the buffer. CR is stripped, empty lines are dropped.
fn take_lines(acc: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
        let mut raw: Vec<u8> = acc.drain(..=pos).collect();
        raw.pop(); // the newline
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.is_empty() {
            continue;
        }
        match String::from_utf8(raw) {
            Ok(s) => lines.push(s),
            Err(_) => debug!("dropped non-utf8 serial line"),
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_framed_and_cr_stripped() {
        let mut acc = b"{\"t\":1}\r\n{\"t\":2}\npartial".to_vec();
        let lines = take_lines(&mut acc);
        assert_eq!(lines, vec!["{\"t\":1}", "{\"t\":2}"]);
        assert_eq!(acc, b"partial");
        acc.extend_from_slice(b"\n");
        assert_eq!(take_lines(&mut acc), vec!["partial"]);
    }

    #[test]
    fn empty_lines_are_dropped() {
        let mut acc = b"\r\n\na\n".to_vec();
        assert_eq!(take_lines(&mut acc), vec!["a"]);
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let q = WriteQueue::new();
        for i in 0..WRITE_QUEUE_CAP {
            assert!(q.push(format!("cmd {i}")).is_none());
        }
        let dropped = q.push("newest".into());
        assert_eq!(dropped.as_deref(), Some("cmd 0"));
        assert_eq!(q.pop().as_deref(), Some("cmd 1"));
        // The newest command is still in there
        let mut last = None;
        while let Some(l) = q.pop() {
            last = Some(l);
        }
        assert_eq!(last.as_deref(), Some("newest"));
    }
}

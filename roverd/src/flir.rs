//! # flir
//!
//! Raw USB driver for the FLIR One thermal imager, independent of the
//! vendor SDK. A reader thread bulk-reads the frame endpoint into a 1 MiB
//! accumulator and a pure parser slices out complete frames; a second
//! thread drains the two auxiliary bulk endpoints, which stall the frame
//! endpoint when left unread. Parsed frames cross into the async world over
//! an mpsc channel and are broadcast on `/flir` in a compact binary format.
//!
//! Frame layout (little-endian):
//! `EF BE 00 00 | frame_size u32 | thermal_size u32 | jpeg_size u32 |
//!  status_size u32 | reserved u32 ×2 | thermal | jpeg | status`
//! The thermal section starts 4 bytes into its region; each pixel row is
//! 40 px, a 4-byte gap, then 40 more px (stride 82 u16s for the 80×60
//! sensor). Frames whose sizes disagree with that geometry are skipped
//! rather than decoded into garbage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BufMut;
use rusb::{DeviceHandle, GlobalContext};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::FlirConfig;
use crate::status::{EventLog, SharedStatus};

// ── Geometry & wire constants ─────────────────────────────────────────────────

pub const FRAME_MAGIC: [u8; 4] = [0xEF, 0xBE, 0x00, 0x00];
const HEADER_LEN: usize = 28; // magic + six u32 fields

/// The one sensor variant this driver understands.
pub const FRAME_WIDTH: usize = 80;
pub const FRAME_HEIGHT: usize = 60;
/// Bytes per pixel row: 40 px, 4-byte gap, 40 px
const ROW_STRIDE: usize = FRAME_WIDTH * 2 + 4;
/// Thermal section: 4-byte preamble + strided rows. Anything else is an
/// unknown sensor variant and is rejected.
const THERMAL_SECTION_LEN: usize = 4 + FRAME_HEIGHT * ROW_STRIDE;

/// Accumulator bound
const RING_CAP: usize = 1024 * 1024;

/// Marker in the status JSON while flat-field correction runs.
const FFC_MARKER: &str = "FFC_PROGRESS";

// ── Frame type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ThermalFrame {
    pub width: u16,
    pub height: u16,
    pub pixels: Vec<u16>,
    pub min: u16,
    pub max: u16,
    pub jpeg: Option<Vec<u8>>,
    pub status: Option<String>,
}

impl ThermalFrame {
    /// `/flir` wire format: `u16 w | u16 h | u32 min | u32 max | u16[] px`.
    pub fn encode_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.pixels.len() * 2);
        out.put_u16_le(self.width);
        out.put_u16_le(self.height);
        out.put_u32_le(self.min as u32);
        out.put_u32_le(self.max as u32);
        for &px in &self.pixels {
            out.put_u16_le(px);
        }
        out
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    /// FFC was running in the previous frame's status
    ffc_active: bool,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bulk bytes; returns every complete frame they finish.
    /// The frame right after an FFC completes is discarded (the sensor is
    /// still settling and the image is unusable).
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ThermalFrame> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > RING_CAP {
            let excess = self.buf.len() - RING_CAP;
            self.buf.drain(..excess);
        }

        let mut frames = Vec::new();
        loop {
            let pos = match find_magic(&self.buf) {
                Some(p) => p,
                None => {
                    // No sync point anywhere; keep only a potential partial
                    // magic at the very end
                    let keep = self.buf.len().min(FRAME_MAGIC.len() - 1);
                    self.buf.drain(..self.buf.len() - keep);
                    break;
                }
            };
            self.buf.drain(..pos);

            if self.buf.len() < HEADER_LEN {
                break; // wait for the rest of the header
            }

            let frame_size = read_u32(&self.buf, 4) as usize;
            let thermal_size = read_u32(&self.buf, 8) as usize;
            let jpeg_size = read_u32(&self.buf, 12) as usize;
            let status_size = read_u32(&self.buf, 16) as usize;

            let consistent = thermal_size == THERMAL_SECTION_LEN
                && frame_size == thermal_size + jpeg_size + status_size
                && HEADER_LEN + frame_size <= RING_CAP;
            if !consistent {
                debug!(
                    "skipping inconsistent frame header (frame={frame_size}, thermal={thermal_size})"
                );
                self.buf.drain(..FRAME_MAGIC.len());
                continue;
            }

            let total = HEADER_LEN + frame_size;
            if self.buf.len() < total {
                break; // wait for the full frame
            }

            let frame = decode_frame(&self.buf[HEADER_LEN..total], thermal_size, jpeg_size, status_size);
            self.buf.drain(..total);

            let ffc_now = frame
                .status
                .as_deref()
                .map(|s| s.contains(FFC_MARKER))
                .unwrap_or(false);
            let suppress = self.ffc_active && !ffc_now;
            self.ffc_active = ffc_now;
            if suppress {
                debug!("dropping first frame after FFC");
                continue;
            }
            frames.push(frame);
        }
        frames
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MAGIC.len()).position(|w| w == FRAME_MAGIC)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn decode_frame(payload: &[u8], thermal_size: usize, jpeg_size: usize, status_size: usize) -> ThermalFrame {
    let thermal = &payload[..thermal_size];
    let mut pixels = Vec::with_capacity(FRAME_WIDTH * FRAME_HEIGHT);
    let (mut min, mut max) = (u16::MAX, u16::MIN);
    for row in 0..FRAME_HEIGHT {
        let row_base = 4 + row * ROW_STRIDE;
        for half in 0..2 {
            // 40 px, then the 4-byte mid-row gap, then 40 px
            let base = row_base + half * (FRAME_WIDTH + 4);
            for col in 0..FRAME_WIDTH / 2 {
                let off = base + col * 2;
                let px = u16::from_le_bytes([thermal[off], thermal[off + 1]]);
                min = min.min(px);
                max = max.max(px);
                pixels.push(px);
            }
        }
    }

    let jpeg_start = thermal_size;
    let jpeg = (jpeg_size > 0).then(|| payload[jpeg_start..jpeg_start + jpeg_size].to_vec());

    let status_start = jpeg_start + jpeg_size;
    let status = (status_size > 0).then(|| {
        String::from_utf8_lossy(&payload[status_start..status_start + status_size])
            .trim_end_matches('\0')
            .to_string()
    });

    ThermalFrame {
        width: FRAME_WIDTH as u16,
        height: FRAME_HEIGHT as u16,
        pixels,
        min,
        max,
        jpeg,
        status,
    }
}

// ── USB driver ────────────────────────────────────────────────────────────────

const EP_FRAMES: u8 = 0x85;
const EP_AUX: [u8; 2] = [0x81, 0x83];
const USB_CONFIG: u8 = 3;
/// Vendor request toggling an interface's data stream
const REQ_STREAM: u8 = 0x0b;

const FRAME_READ_TIMEOUT: Duration = Duration::from_millis(200);
const AUX_READ_TIMEOUT: Duration = Duration::from_millis(50);
const RETRY_INTERVAL: Duration = Duration::from_secs(3);
const MAX_AUTO_RETRIES: u32 = 3;

/// Handle to the driver threads; `retry` re-arms the connect loop after the
/// automatic budget ran out.
#[derive(Clone)]
pub struct FlirDriver {
    retry_tx: std::sync::mpsc::Sender<()>,
}

impl FlirDriver {
    pub fn spawn(
        cfg: FlirConfig,
        frames_tx: mpsc::Sender<ThermalFrame>,
        status: SharedStatus,
        log: EventLog,
    ) -> Self {
        let (retry_tx, retry_rx) = std::sync::mpsc::channel();
        std::thread::Builder::new()
            .name("flir-driver".into())
            .spawn(move || driver_thread(cfg, frames_tx, status, log, retry_rx))
            .expect("spawn flir driver thread");
        Self { retry_tx }
    }

    /// Placeholder when the thermal camera is disabled in config; `retry`
    /// becomes a no-op.
    pub fn disabled() -> Self {
        let (retry_tx, _) = std::sync::mpsc::channel();
        Self { retry_tx }
    }

    pub fn retry(&self) {
        let _ = self.retry_tx.send(());
    }
}

fn driver_thread(
    cfg: FlirConfig,
    frames_tx: mpsc::Sender<ThermalFrame>,
    status: SharedStatus,
    log: EventLog,
    retry_rx: std::sync::mpsc::Receiver<()>,
) {
    let mut retries = 0u32;
    loop {
        match open_device(&cfg) {
            Ok(handle) => {
                retries = 0;
                {
                    let mut st = status.blocking_write();
                    st.flir_connected = true;
                    st.flir_retries = 0;
                }
                log.push("flir", "thermal camera connected");
                run_streams(handle, &frames_tx);
                status.blocking_write().flir_connected = false;
                log.push("flir", "thermal camera detached");
            }
            Err(e) => {
                retries += 1;
                status.blocking_write().flir_retries = retries;
                debug!("flir open failed (attempt {retries}/{MAX_AUTO_RETRIES}): {e}");
                if retries >= MAX_AUTO_RETRIES {
                    log.push("flir", format!("giving up after {retries} attempts: {e}"));
                    // Park until retry_flir
                    if retry_rx.recv().is_err() {
                        return;
                    }
                    retries = 0;
                    continue;
                }
            }
        }
        if frames_tx.is_closed() {
            return;
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

fn open_device(cfg: &FlirConfig) -> rusb::Result<DeviceHandle<GlobalContext>> {
    let mut handle = rusb::open_device_with_vid_pid(cfg.vendor_id, cfg.product_id)
        .ok_or(rusb::Error::NoDevice)?;
    handle.set_active_configuration(USB_CONFIG)?;
    for iface in 0..=2 {
        handle.claim_interface(iface)?;
    }
    // Stop then restart both data streams so the device starts from a known
    // state; index = interface, value = 1 enables.
    for (value, index) in [(0u16, 2u16), (0, 1), (1, 1), (1, 2)] {
        let request_type =
            rusb::request_type(rusb::Direction::Out, rusb::RequestType::Vendor, rusb::Recipient::Interface);
        handle.write_control(request_type, REQ_STREAM, value, index, &[], Duration::from_millis(100))?;
    }
    info!("flir device opened and streaming started");
    Ok(handle)
}

/// Frame reads on this thread, aux drains on a sibling; returns on detach.
fn run_streams(handle: DeviceHandle<GlobalContext>, frames_tx: &mpsc::Sender<ThermalFrame>) {
    let handle = Arc::new(handle);
    let alive = Arc::new(AtomicBool::new(true));

    // Aux endpoints must keep draining or the frame endpoint stalls
    let drain_handle = handle.clone();
    let drain_alive = alive.clone();
    let drainer = std::thread::Builder::new()
        .name("flir-drain".into())
        .spawn(move || {
            let mut sink = vec![0u8; 4096];
            while drain_alive.load(Ordering::Relaxed) {
                for &ep in &EP_AUX {
                    match drain_handle.read_bulk(ep, &mut sink, AUX_READ_TIMEOUT) {
                        Ok(_) | Err(rusb::Error::Timeout) => {}
                        Err(_) => return,
                    }
                }
            }
        })
        .expect("spawn flir drain thread");

    let mut parser = FrameParser::new();
    let mut buf = vec![0u8; 16384];
    loop {
        match handle.read_bulk(EP_FRAMES, &mut buf, FRAME_READ_TIMEOUT) {
            Ok(n) => {
                for frame in parser.push(&buf[..n]) {
                    if frames_tx.blocking_send(frame).is_err() {
                        alive.store(false, Ordering::Relaxed);
                        let _ = drainer.join();
                        return;
                    }
                }
            }
            Err(rusb::Error::Timeout) => {}
            Err(e) => {
                warn!("flir frame endpoint failed: {e}");
                break;
            }
        }
    }

    alive.store(false, Ordering::Relaxed);
    let _ = drainer.join();
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one wire frame with a gradient image and optional extras.
    fn make_frame(base_px: u16, jpeg: &[u8], status: &str) -> Vec<u8> {
        let mut thermal = vec![0u8; THERMAL_SECTION_LEN];
        for row in 0..FRAME_HEIGHT {
            let row_base = 4 + row * ROW_STRIDE;
            for half in 0..2 {
                let base = row_base + half * (FRAME_WIDTH + 4);
                for col in 0..FRAME_WIDTH / 2 {
                    let px = base_px + (row * FRAME_WIDTH + half * 40 + col) as u16;
                    let off = base + col * 2;
                    thermal[off..off + 2].copy_from_slice(&px.to_le_bytes());
                }
            }
        }
        let frame_size = (THERMAL_SECTION_LEN + jpeg.len() + status.len()) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&FRAME_MAGIC);
        out.extend_from_slice(&frame_size.to_le_bytes());
        out.extend_from_slice(&(THERMAL_SECTION_LEN as u32).to_le_bytes());
        out.extend_from_slice(&(jpeg.len() as u32).to_le_bytes());
        out.extend_from_slice(&(status.len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 8]); // reserved
        out.extend_from_slice(&thermal);
        out.extend_from_slice(jpeg);
        out.extend_from_slice(status.as_bytes());
        out
    }

    #[test]
    fn whole_frame_decodes() {
        let mut parser = FrameParser::new();
        let frames = parser.push(&make_frame(100, b"\xFF\xD8jpeg", "{\"bat\":88}"));
        assert_eq!(frames.len(), 1);
        let f = &frames[0];
        assert_eq!((f.width, f.height), (80, 60));
        assert_eq!(f.pixels.len(), 80 * 60);
        assert_eq!(f.pixels[0], 100);
        assert_eq!(f.min, 100);
        assert_eq!(f.max, 100 + (80 * 60 - 1) as u16);
        assert_eq!(f.jpeg.as_deref(), Some(&b"\xFF\xD8jpeg"[..]));
        assert_eq!(f.status.as_deref(), Some("{\"bat\":88}"));
    }

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let mut parser = FrameParser::new();
        let wire = [make_frame(1, b"", ""), make_frame(2, b"", "")].concat();
        let mut frames = Vec::new();
        for chunk in wire.chunks(97) {
            frames.extend(parser.push(chunk));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].pixels[0], 1);
        assert_eq!(frames[1].pixels[0], 2);
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut parser = FrameParser::new();
        let mut wire = b"usb noise \xEF\xBE partial".to_vec();
        wire.extend_from_slice(&make_frame(7, b"", ""));
        let frames = parser.push(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pixels[0], 7);
    }

    #[test]
    fn garbage_without_magic_clears_the_buffer() {
        let mut parser = FrameParser::new();
        assert!(parser.push(&vec![0xAAu8; 10_000]).is_empty());
        assert!(parser.buf.len() < FRAME_MAGIC.len());
    }

    #[test]
    fn inconsistent_header_is_skipped_not_decoded() {
        let mut parser = FrameParser::new();
        // Magic with a thermal size from some unknown sensor variant
        let mut bogus = FRAME_MAGIC.to_vec();
        bogus.extend_from_slice(&2000u32.to_le_bytes()); // frame_size
        bogus.extend_from_slice(&2000u32.to_le_bytes()); // thermal_size (wrong)
        bogus.extend_from_slice(&[0u8; 16]);
        let mut wire = bogus;
        wire.extend_from_slice(&make_frame(9, b"", ""));
        let frames = parser.push(&wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pixels[0], 9);
    }

    #[test]
    fn frame_after_ffc_is_suppressed() {
        let mut parser = FrameParser::new();
        let during = make_frame(1, b"", "{\"FFCState\":\"FFC_PROGRESS\"}");
        let after = make_frame(2, b"", "{\"FFCState\":\"FFC_DONE\"}");
        let next = make_frame(3, b"", "{\"FFCState\":\"FFC_DONE\"}");

        assert_eq!(parser.push(&during).len(), 1); // visible while running
        assert!(parser.push(&after).is_empty()); // first frame after: dropped
        let frames = parser.push(&next);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pixels[0], 3);
    }

    #[test]
    fn wire_encoding_layout() {
        let f = ThermalFrame {
            width: 2,
            height: 1,
            pixels: vec![0x1234, 0xBEEF],
            min: 0x1234,
            max: 0xBEEF,
            jpeg: None,
            status: None,
        };
        let wire = f.encode_wire();
        assert_eq!(
            wire,
            vec![
                0x02, 0x00, // width
                0x01, 0x00, // height
                0x34, 0x12, 0x00, 0x00, // min as u32
                0xEF, 0xBE, 0x00, 0x00, // max as u32
                0x34, 0x12, 0xEF, 0xBE, // pixels
            ]
        );
    }
}

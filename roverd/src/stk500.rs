//! # stk500
//!
//! STK500v1 page programming over the serial link, as spoken by the stock
//! AVR bootloader. The upload path takes exclusive ownership of the raw
//! port from the serial link (the normal reader/writer park in the
//! meantime), resets the target by pulsing DTR, syncs, verifies the chip
//! signature, streams 128-byte pages, and hands the port back whatever
//! happens. Progress is reported as discrete `{phase, percent}` events with
//! per-page throttling; any protocol mismatch aborts the upload and resumes
//! normal operation.

use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tokio_serial::SerialPort;
use tracing::{info, warn};

use crate::hex::{self, FirmwareImage, HexError, PAGE_SIZE};
use crate::mcu_bridge::McuBridge;
use crate::serial_link::SerialLink;
use crate::status::SharedStatus;

// ── Protocol constants ────────────────────────────────────────────────────────

const GET_SYNC: u8 = 0x30;
const EOP: u8 = 0x20;
const INSYNC: u8 = 0x14;
const OK: u8 = 0x10;
const ENTER_PROGMODE: u8 = 0x50;
const LEAVE_PROGMODE: u8 = 0x51;
const LOAD_ADDRESS: u8 = 0x55;
const PROG_PAGE: u8 = 0x64;
const READ_SIGN: u8 = 0x75;

/// Target part: ATmega328P.
const SIGNATURE: [u8; 3] = [0x1E, 0x95, 0x0F];
/// Flash capacity for the signature above; the hex parser fails on overflow.
pub const FLASH_CAPACITY: u32 = 32 * 1024;

const SYNC_ATTEMPTS: u32 = 10;
/// Per-attempt reply window; 10 attempts ≈ the 1.5 s sync budget.
const SYNC_REPLY_TIMEOUT: Duration = Duration::from_millis(150);
/// Per-read timeout once synced.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Pause between page programs.
const INTER_PAGE_DELAY: Duration = Duration::from_millis(5);
/// Bootloader entry wait after the DTR pulse.
const RESET_SETTLE: Duration = Duration::from_millis(200);
/// Application reboot wait after leaving programming mode.
const REBOOT_WAIT: Duration = Duration::from_secs(2);
/// Let in-flight serial I/O settle between quiesce and port acquisition.
const QUIESCE_SETTLE: Duration = Duration::from_millis(300);

/// Minimum percent step between per-page progress broadcasts.
const PROGRESS_STEP: u8 = 2;

// ── Errors & events ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum Stk500Error {
    #[error(transparent)]
    Hex(#[from] HexError),
    #[error("no sync after {0} attempts")]
    NoSync(u32),
    #[error("{context}: expected INSYNC/OK, got {got:02x?}")]
    Protocol { context: &'static str, got: [u8; 2] },
    #[error("signature mismatch: got {0:02x?}")]
    Signature([u8; 3]),
    #[error("{context}: reply timed out")]
    Timeout { context: &'static str },
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial link: {0}")]
    Link(String),
}

/// Progress stream for the `/firmware` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress { phase: &'static str, percent: u8 },
    Done { success: bool, message: String },
}

impl UploadEvent {
    pub fn to_json(&self) -> String {
        match self {
            UploadEvent::Progress { phase, percent } => {
                json!({ "phase": phase, "percent": percent }).to_string()
            }
            UploadEvent::Done { success, message } => {
                json!({ "done": true, "success": success, "message": message }).to_string()
            }
        }
    }
}

// ── Port abstraction ──────────────────────────────────────────────────────────

/// What the programmer needs from a port: byte I/O plus DTR control for the
/// reset pulse. Implemented for the real serial stream and for in-memory
/// duplex pipes in tests.
pub trait ProgrammerPort: AsyncRead + AsyncWrite + Unpin + Send {
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()>;
}

impl ProgrammerPort for tokio_serial::SerialStream {
    fn set_dtr(&mut self, level: bool) -> std::io::Result<()> {
        self.write_data_terminal_ready(level)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

// ── Programmer ────────────────────────────────────────────────────────────────

/// Program a parsed image. `emit` receives every progress event; the caller
/// owns fan-out and the done event.
pub async fn program<P: ProgrammerPort>(
    port: &mut P,
    image: &FirmwareImage,
    emit: &mut (dyn FnMut(UploadEvent) + Send),
) -> Result<(), Stk500Error> {
    // Reset the target into its bootloader
    emit(UploadEvent::Progress { phase: "reset", percent: 0 });
    port.set_dtr(true)?;
    sleep(Duration::from_millis(50)).await;
    port.set_dtr(false)?;
    sleep(Duration::from_millis(50)).await;
    port.set_dtr(true)?;
    sleep(Duration::from_millis(50)).await;
    port.set_dtr(false)?;
    sleep(RESET_SETTLE).await;

    sync(port).await?;
    emit(UploadEvent::Progress { phase: "sync", percent: 0 });

    command(port, &[ENTER_PROGMODE, EOP], "enter progmode").await?;

    let sig = read_signature(port).await?;
    if sig != SIGNATURE {
        return Err(Stk500Error::Signature(sig));
    }

    let total = image.pages.len();
    let mut last_percent = 0u8;
    for (idx, page) in image.pages.iter().enumerate() {
        let word_addr = (page.address / 2) as u16;
        command(
            port,
            &[LOAD_ADDRESS, word_addr as u8, (word_addr >> 8) as u8, EOP],
            "load address",
        )
        .await?;

        let mut frame = Vec::with_capacity(PAGE_SIZE + 5);
        frame.push(PROG_PAGE);
        frame.push((PAGE_SIZE >> 8) as u8);
        frame.push(PAGE_SIZE as u8);
        frame.push(b'F');
        frame.extend_from_slice(&page.data);
        frame.push(EOP);
        command(port, &frame, "program page").await?;

        let percent = ((idx + 1) * 100 / total) as u8;
        if idx == 0 || percent >= last_percent + PROGRESS_STEP || idx + 1 == total {
            emit(UploadEvent::Progress { phase: "program", percent });
            last_percent = percent;
        }
        sleep(INTER_PAGE_DELAY).await;
    }

    command(port, &[LEAVE_PROGMODE, EOP], "leave progmode").await?;
    emit(UploadEvent::Progress { phase: "finalize", percent: 100 });
    Ok(())
}

/// GET_SYNC up to 10 times, draining garbage between attempts.
async fn sync<P: ProgrammerPort>(port: &mut P) -> Result<(), Stk500Error> {
    for _ in 0..SYNC_ATTEMPTS {
        port.write_all(&[GET_SYNC, EOP]).await?;
        let mut reply = [0u8; 2];
        match timeout(SYNC_REPLY_TIMEOUT, port.read_exact(&mut reply)).await {
            Ok(Ok(_)) if reply == [INSYNC, OK] => {
                // A reply to an earlier attempt may still be queued; clear
                // the line so command/reply pairing starts clean.
                drain(port).await;
                return Ok(());
            }
            // Wrong bytes or silence: clear the line and try again
            Ok(Ok(_)) | Err(_) => drain(port).await,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Err(Stk500Error::NoSync(SYNC_ATTEMPTS))
}

/// Throw away whatever the target buffered (boot noise, partial replies).
async fn drain<P: ProgrammerPort>(port: &mut P) {
    let mut scratch = [0u8; 64];
    while let Ok(Ok(n)) = timeout(Duration::from_millis(20), port.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
    }
}

/// Write a frame and require the INSYNC/OK pair.
async fn command<P: ProgrammerPort>(
    port: &mut P,
    frame: &[u8],
    context: &'static str,
) -> Result<(), Stk500Error> {
    port.write_all(frame).await?;
    expect_insync_ok(port, context).await
}

async fn expect_insync_ok<P: ProgrammerPort>(
    port: &mut P,
    context: &'static str,
) -> Result<(), Stk500Error> {
    let mut reply = [0u8; 2];
    match timeout(READ_TIMEOUT, port.read_exact(&mut reply)).await {
        Ok(Ok(_)) => {
            if reply == [INSYNC, OK] {
                Ok(())
            } else {
                Err(Stk500Error::Protocol { context, got: reply })
            }
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Stk500Error::Timeout { context }),
    }
}

async fn read_signature<P: ProgrammerPort>(port: &mut P) -> Result<[u8; 3], Stk500Error> {
    port.write_all(&[READ_SIGN, EOP]).await?;
    let mut reply = [0u8; 5];
    match timeout(READ_TIMEOUT, port.read_exact(&mut reply)).await {
        Ok(Ok(_)) => {
            if reply[0] == INSYNC && reply[4] == OK {
                Ok([reply[1], reply[2], reply[3]])
            } else {
                Err(Stk500Error::Protocol { context: "read signature", got: [reply[0], reply[4]] })
            }
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Stk500Error::Timeout { context: "read signature" }),
    }
}

// ── Upload orchestration ──────────────────────────────────────────────────────

/// Full upload path driven by a `/firmware` blob: parse, quiesce the MCU
/// bridge, borrow the port, program, hand everything back. Every event
/// (including the final `{done, …}`) goes through `emit`. Always resumes
/// normal link operation; a hex parse error fails fast without touching the
/// bridge at all.
pub async fn run_upload(
    hex_text: &str,
    bridge: &McuBridge,
    link: &SerialLink,
    status: &SharedStatus,
    emit: &mut (dyn FnMut(UploadEvent) + Send),
) {
    emit(UploadEvent::Progress { phase: "parse", percent: 0 });
    let image = match hex::parse(hex_text, FLASH_CAPACITY) {
        Ok(img) => img,
        Err(e) => {
            warn!("firmware hex rejected: {e}");
            emit(UploadEvent::Done { success: false, message: e.to_string() });
            return;
        }
    };
    info!(
        "firmware image parsed: {} pages ({} bytes)",
        image.pages.len(),
        image.byte_count()
    );

    status.write().await.firmware_uploading = true;

    bridge.quiesce_for_upload();
    sleep(QUIESCE_SETTLE).await;

    let mut port = match link.acquire_port().await {
        Ok(p) => p,
        Err(e) => {
            status.write().await.firmware_uploading = false;
            emit(UploadEvent::Done { success: false, message: e.to_string() });
            return;
        }
    };

    let result = program(&mut port, &image, emit).await;

    if result.is_ok() {
        // Give the fresh application time to boot before traffic resumes
        sleep(REBOOT_WAIT).await;
    }
    link.release_port(port).await;
    status.write().await.firmware_uploading = false;

    match result {
        Ok(()) => {
            info!("firmware upload complete ({} pages)", image.pages.len());
            emit(UploadEvent::Done { success: true, message: "upload complete".into() });
        }
        Err(e) => {
            warn!("firmware upload failed: {e}");
            emit(UploadEvent::Done { success: false, message: e.to_string() });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;

    impl ProgrammerPort for DuplexStream {
        fn set_dtr(&mut self, _level: bool) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlashModel {
        loaded_addr: u16,
        pages: Vec<(u16, Vec<u8>)>,
    }

    /// Scripted bootloader on the far end of a duplex pipe.
    async fn fake_bootloader(
        mut port: DuplexStream,
        flash: Arc<Mutex<FlashModel>>,
        garbage_first: bool,
    ) {
        if garbage_first {
            let _ = port.write_all(b"noise!\x00\xFF").await;
        }
        let mut byte = [0u8; 1];
        loop {
            if port.read_exact(&mut byte).await.is_err() {
                return;
            }
            match byte[0] {
                GET_SYNC | ENTER_PROGMODE => {
                    let _ = port.read_exact(&mut byte).await; // EOP
                    let _ = port.write_all(&[INSYNC, OK]).await;
                }
                READ_SIGN => {
                    let _ = port.read_exact(&mut byte).await;
                    let _ = port
                        .write_all(&[INSYNC, SIGNATURE[0], SIGNATURE[1], SIGNATURE[2], OK])
                        .await;
                }
                LOAD_ADDRESS => {
                    let mut addr = [0u8; 3]; // lo, hi, EOP
                    if port.read_exact(&mut addr).await.is_err() {
                        return;
                    }
                    flash.lock().unwrap().loaded_addr = u16::from_le_bytes([addr[0], addr[1]]);
                    let _ = port.write_all(&[INSYNC, OK]).await;
                }
                PROG_PAGE => {
                    let mut head = [0u8; 3]; // size_hi, size_lo, 'F'
                    if port.read_exact(&mut head).await.is_err() {
                        return;
                    }
                    let size = usize::from(head[0]) << 8 | usize::from(head[1]);
                    let mut data = vec![0u8; size + 1]; // payload + EOP
                    if port.read_exact(&mut data).await.is_err() {
                        return;
                    }
                    data.pop();
                    let addr = flash.lock().unwrap().loaded_addr;
                    flash.lock().unwrap().pages.push((addr, data));
                    let _ = port.write_all(&[INSYNC, OK]).await;
                }
                LEAVE_PROGMODE => {
                    let _ = port.read_exact(&mut byte).await;
                    let _ = port.write_all(&[INSYNC, OK]).await;
                    return;
                }
                _ => {} // reset-pulse noise etc.
            }
        }
    }

    fn two_page_hex() -> String {
        // 4 data bytes at 0x0000 and 4 at 0x0080: two non-empty pages
        ":04000000AABBCCDDAE\n:0400800011223344D2\n:00000001FF\n".to_string()
    }

    #[tokio::test]
    async fn uploads_every_page_with_insync_ok() {
        let (mut near, far) = tokio::io::duplex(4096);
        let flash = Arc::new(Mutex::new(FlashModel::default()));
        let boot = tokio::spawn(fake_bootloader(far, flash.clone(), false));

        let image = hex::parse(&two_page_hex(), FLASH_CAPACITY).unwrap();
        assert_eq!(image.pages.len(), 2);

        let mut events = Vec::new();
        program(&mut near, &image, &mut |e| events.push(e)).await.unwrap();
        boot.await.unwrap();

        let flash = flash.lock().unwrap();
        assert_eq!(flash.pages.len(), 2);
        // Word addresses 0x0000 and 0x0040 for byte pages 0x00 / 0x80
        assert_eq!(flash.pages[0].0, 0x0000);
        assert_eq!(flash.pages[1].0, 0x0040);
        assert_eq!(&flash.pages[0].1[..4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&flash.pages[1].1[..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(flash.pages[0].1.len(), PAGE_SIZE);

        // Phases appear in order, programming reaches 100
        let phases: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Progress { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec!["reset", "sync", "program", "program", "finalize"]);
        assert!(matches!(
            events.last(),
            Some(UploadEvent::Progress { phase: "finalize", percent: 100 })
        ));
    }

    #[tokio::test]
    async fn syncs_through_boot_garbage() {
        let (mut near, far) = tokio::io::duplex(4096);
        let flash = Arc::new(Mutex::new(FlashModel::default()));
        tokio::spawn(fake_bootloader(far, flash.clone(), true));

        let image = hex::parse(&two_page_hex(), FLASH_CAPACITY).unwrap();
        let mut sink = |_e: UploadEvent| {};
        program(&mut near, &image, &mut sink).await.unwrap();
        assert_eq!(flash.lock().unwrap().pages.len(), 2);
    }

    #[tokio::test]
    async fn dead_target_reports_no_sync() {
        // Far end reads but never answers
        let (mut near, mut far) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut sink = [0u8; 64];
            while far.read(&mut sink).await.unwrap_or(0) > 0 {}
        });

        let image = hex::parse(&two_page_hex(), FLASH_CAPACITY).unwrap();
        let mut sink = |_e: UploadEvent| {};
        let err = program(&mut near, &image, &mut sink).await.unwrap_err();
        assert!(matches!(err, Stk500Error::NoSync(10)), "got {err:?}");
    }

    #[test]
    fn progress_events_serialize_for_the_wire() {
        let p = UploadEvent::Progress { phase: "program", percent: 42 };
        assert_eq!(p.to_json(), r#"{"percent":42,"phase":"program"}"#);
        let d = UploadEvent::Done { success: false, message: "checksum".into() };
        let v: serde_json::Value = serde_json::from_str(&d.to_json()).unwrap();
        assert_eq!(v["done"], true);
        assert_eq!(v["success"], false);
    }
}

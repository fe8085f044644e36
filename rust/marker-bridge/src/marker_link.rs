// marker-bridge: serial link to the marking engine
//
// One serial port, two dedicated I/O threads. The reader consumes the
// marker's byte stream one byte at a time and demultiplexes it: completion
// codes (0x1F, 0x87) are latched and wake async waiters, everything else
// accumulates in the rx buffer until a collector drains it. The writer
// drains a frame queue, honoring a minimum inter-emit interval. Callers
// must `clear()` before transmitting a command whose reply they intend to
// attribute to that command.

use std::io::{Read, Write};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use marker_protocol::tokens;
use marker_protocol::{PrintMode, COMPLETE_OK, COMPLETE_RESET};

use crate::config::MarkerDeviceSection;
use crate::error::{BridgeError, BridgeResult};

/// Serial read timeout; bounds how quickly the reader observes the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A latched completion byte with its arrival time.
#[derive(Debug, Clone, Copy)]
pub struct CompletionCode {
    pub code: u8,
    pub at: Instant,
}

#[derive(Default)]
struct RxState {
    buffer: Vec<u8>,
    last_code: Option<CompletionCode>,
}

struct RxShared {
    state: parking_lot::Mutex<RxState>,
    notify: Notify,
}

impl RxShared {
    /// Classify one received byte. Only the latest completion code is
    /// retained between clears.
    fn accept(&self, byte: u8) {
        let mut state = self.state.lock();
        if byte == COMPLETE_OK || byte == COMPLETE_RESET {
            state.last_code = Some(CompletionCode {
                code: byte,
                at: Instant::now(),
            });
            drop(state);
            self.notify.notify_waiters();
        } else {
            state.buffer.push(byte);
        }
    }
}

/// Result of waiting on a completion byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A matching completion byte arrived.
    Code(u8),
    /// The deadline passed; carries the last code seen, if any.
    TimedOut(Option<u8>),
}

/// Payload bytes collected up to a completion byte (which is not included).
#[derive(Debug, Clone)]
pub struct Collected {
    pub bytes: Vec<u8>,
    pub code: Option<u8>,
}

/// Owns the marker serial port and its reader/writer threads.
pub struct MarkerLink {
    shared: Arc<RxShared>,
    writer_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    raw_port: Option<tokio::sync::Mutex<Box<dyn SerialPort>>>,
    reader_enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    dry_run: AtomicBool,
    dry_run_complete_ms: u64,
    print_mode: PrintMode,
}

impl MarkerLink {
    /// Open the configured port and start the I/O threads. A missing
    /// `com_port` yields a disconnected link that dumps frames instead of
    /// transmitting them.
    pub fn open(cfg: &MarkerDeviceSection, print_mode: PrintMode) -> BridgeResult<Arc<Self>> {
        let shared = Arc::new(RxShared {
            state: parking_lot::Mutex::new(RxState::default()),
            notify: Notify::new(),
        });
        let reader_enabled = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));

        let (writer_tx, raw_port) = match &cfg.com_port {
            None => (None, None),
            Some(path) => {
                let flow = if cfg.xonxoff {
                    serialport::FlowControl::Software
                } else {
                    serialport::FlowControl::None
                };
                let port = serialport::new(path.as_str(), cfg.baud_rate)
                    .parity(serialport::Parity::None)
                    .stop_bits(serialport::StopBits::One)
                    .flow_control(flow)
                    .timeout(READ_TIMEOUT)
                    .open()?;
                let reader_port = port.try_clone()?;
                let raw_port = port.try_clone()?;
                info!(port = %path, baud = cfg.baud_rate, "marker port opened");

                let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
                spawn_reader(
                    reader_port,
                    Arc::clone(&shared),
                    Arc::clone(&reader_enabled),
                    Arc::clone(&stop),
                )?;
                spawn_writer(
                    port,
                    rx,
                    Duration::from_millis(cfg.emit_options.min_interval_ms),
                    Arc::clone(&stop),
                )?;
                (Some(tx), Some(tokio::sync::Mutex::new(raw_port)))
            }
        };

        Ok(Arc::new(Self {
            shared,
            writer_tx,
            raw_port,
            reader_enabled,
            stop,
            dry_run: AtomicBool::new(cfg.dry_run),
            dry_run_complete_ms: cfg.dry_run_complete_ms,
            print_mode,
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.writer_tx.is_some()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::Relaxed);
    }

    /// Whether writes are simulated rather than transmitted.
    pub fn dry_run_active(&self) -> bool {
        self.is_dry_run() || !self.is_connected()
    }

    /// Empty the rx buffer and forget the latched completion code.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.buffer.clear();
        state.last_code = None;
    }

    /// Enqueue a frame to the writer, or dump it when running dry.
    pub fn send(&self, bytes: &[u8]) {
        if self.dry_run_active() {
            info!("[SC TX] {}", tokens::dump(bytes, self.print_mode));
            return;
        }
        if let Some(tx) = &self.writer_tx {
            if tx.send(bytes.to_vec()).is_err() {
                error!("marker writer thread is gone; frame dropped");
            }
        }
    }

    /// Simulate the device completion after the configured delay.
    pub fn schedule_dry_run_complete(self: &Arc<Self>) {
        let link = Arc::clone(self);
        let delay = Duration::from_millis(self.dry_run_complete_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            link.inject(COMPLETE_OK);
            debug!("simulated marker completion (0x1F)");
        });
    }

    /// Feed one byte through the reader classification. Used by the dry-run
    /// timer and by tests.
    pub fn inject(&self, byte: u8) {
        self.shared.accept(byte);
    }

    /// Wait until a completion byte in `codes` is latched or the deadline
    /// passes. A matching code latched before entry returns immediately.
    pub async fn wait_complete(&self, timeout: Duration, codes: &[u8]) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock();
                if let Some(latched) = state.last_code {
                    if codes.contains(&latched.code) {
                        return WaitOutcome::Code(latched.code);
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let state = self.shared.state.lock();
                return WaitOutcome::TimedOut(state.last_code.map(|c| c.code));
            }
        }
    }

    /// Wait for any completion byte, then drain and return the buffer
    /// accumulated since the last `clear`. On deadline the partial buffer
    /// is drained and returned with no code.
    pub async fn collect_until_complete(&self, timeout: Duration) -> Collected {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if let Some(latched) = state.last_code {
                    return Collected {
                        bytes: std::mem::take(&mut state.buffer),
                        code: Some(latched.code),
                    };
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.shared.state.lock();
                return Collected {
                    bytes: std::mem::take(&mut state.buffer),
                    code: state.last_code.map(|c| c.code),
                };
            }
        }
    }

    pub fn suspend_reader(&self) {
        self.reader_enabled.store(false, Ordering::Relaxed);
    }

    pub fn resume_reader(&self) {
        self.reader_enabled.store(true, Ordering::Relaxed);
    }

    /// Take exclusive use of the port for a raw read window. The reader is
    /// suspended for the lifetime of the lease and resumed on drop, on
    /// every exit path. Returns `None` on a disconnected link.
    pub async fn raw_lease(&self) -> Option<RawLease<'_>> {
        let mutex = self.raw_port.as_ref()?;
        self.suspend_reader();
        let port = mutex.lock().await;
        Some(RawLease { link: self, port })
    }

    /// Stop the I/O threads. Frames already queued are abandoned.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(tx) = &self.writer_tx {
            // nudge the writer out of blocking_recv
            let _ = tx.send(Vec::new());
        }
    }
}

/// Exclusive raw-read window on the marker port (reader suspended).
pub struct RawLease<'a> {
    link: &'a MarkerLink,
    port: tokio::sync::MutexGuard<'a, Box<dyn SerialPort>>,
}

impl RawLease<'_> {
    /// Read everything the device sends until a completion byte has been
    /// seen and the line goes quiet, or the deadline passes. Returns the
    /// raw bytes including any embedded completion codes.
    pub async fn read_with_flush(&mut self, timeout: Duration) -> BridgeResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut saw_complete = false;
        let mut buf = [0u8; 256];
        while Instant::now() < deadline {
            match self.port.read(&mut buf) {
                Ok(0) => {
                    if saw_complete {
                        break;
                    }
                }
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    if buf[..n]
                        .iter()
                        .any(|&b| b == COMPLETE_OK || b == COMPLETE_RESET)
                    {
                        saw_complete = true;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if saw_complete {
                        break;
                    }
                    // stay cooperative while the device is silent
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(BridgeError::from(e)),
            }
        }
        Ok(out)
    }
}

impl Drop for RawLease<'_> {
    fn drop(&mut self) {
        self.link.resume_reader();
    }
}

fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    shared: Arc<RxShared>,
    enabled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> BridgeResult<()> {
    std::thread::Builder::new()
        .name("marker-rx".to_string())
        .spawn(move || {
            let _ = port.clear(serialport::ClearBuffer::Input);
            let mut byte = [0u8; 1];
            while !stop.load(Ordering::Relaxed) {
                if !enabled.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                match port.read(&mut byte) {
                    Ok(0) => {}
                    Ok(_) => shared.accept(byte[0]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        warn!(error = %e, "marker rx read error");
                        std::thread::sleep(Duration::from_millis(200));
                    }
                }
            }
            debug!("marker reader thread exiting");
        })
        .map_err(|e| BridgeError::Os(format!("spawn marker-rx: {e}")))?;
    Ok(())
}

fn spawn_writer(
    mut port: Box<dyn SerialPort>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    min_interval: Duration,
    stop: Arc<AtomicBool>,
) -> BridgeResult<()> {
    std::thread::Builder::new()
        .name("marker-tx".to_string())
        .spawn(move || {
            let mut last_emit: Option<Instant> = None;
            while let Some(frame) = rx.blocking_recv() {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if frame.is_empty() {
                    continue;
                }
                if !min_interval.is_zero() {
                    if let Some(prev) = last_emit {
                        let since = prev.elapsed();
                        if since < min_interval {
                            std::thread::sleep(min_interval - since);
                        }
                    }
                }
                match port.write_all(&frame).and_then(|()| port.flush()) {
                    Ok(()) => {
                        last_emit = Some(Instant::now());
                        debug!("[SC TX RAW] {}", tokens::hex_string(&frame));
                    }
                    Err(e) => error!(error = %e, "marker tx write error"),
                }
            }
            debug!("marker writer thread exiting");
        })
        .map_err(|e| BridgeError::Os(format!("spawn marker-tx: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarkerDeviceSection;

    fn dry_link() -> Arc<MarkerLink> {
        let cfg = MarkerDeviceSection {
            dry_run: true,
            dry_run_complete_ms: 50,
            ..MarkerDeviceSection::default()
        };
        MarkerLink::open(&cfg, PrintMode::HexAscii).expect("open dry link")
    }

    #[tokio::test]
    async fn wait_complete_sees_injected_code() {
        let link = dry_link();
        link.clear();
        link.inject(COMPLETE_OK);
        let outcome = link
            .wait_complete(Duration::from_millis(500), &[COMPLETE_OK])
            .await;
        assert_eq!(outcome, WaitOutcome::Code(COMPLETE_OK));
    }

    #[tokio::test]
    async fn wait_complete_times_out_with_last_code() {
        let link = dry_link();
        link.clear();
        // a non-matching completion is reported as last seen
        link.inject(COMPLETE_RESET);
        let started = Instant::now();
        let outcome = link
            .wait_complete(Duration::from_millis(100), &[COMPLETE_OK])
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut(Some(COMPLETE_RESET)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(400), "returns near deadline");
    }

    #[tokio::test]
    async fn wait_complete_wakes_on_late_arrival() {
        let link = dry_link();
        link.clear();
        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.wait_complete(Duration::from_secs(2), &[COMPLETE_OK])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        link.inject(COMPLETE_OK);
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome, WaitOutcome::Code(COMPLETE_OK));
    }

    #[tokio::test]
    async fn collect_returns_payload_without_completion_byte() {
        let link = dry_link();
        link.clear();
        for b in b"J 20_2.3" {
            link.inject(*b);
        }
        link.inject(COMPLETE_OK);
        let collected = link.collect_until_complete(Duration::from_millis(500)).await;
        assert_eq!(collected.bytes, b"J 20_2.3");
        assert_eq!(collected.code, Some(COMPLETE_OK));

        // buffer was drained
        let again = link.collect_until_complete(Duration::from_millis(20)).await;
        assert!(again.bytes.is_empty());
    }

    #[tokio::test]
    async fn collect_honors_pre_entry_completion() {
        let link = dry_link();
        link.clear();
        link.inject(b'A');
        link.inject(COMPLETE_OK);
        let started = Instant::now();
        let collected = link.collect_until_complete(Duration::from_secs(5)).await;
        assert_eq!(collected.bytes, b"A");
        assert!(started.elapsed() < Duration::from_millis(100), "no waiting needed");
    }

    #[tokio::test]
    async fn clear_resets_buffer_and_code() {
        let link = dry_link();
        link.inject(b'X');
        link.inject(COMPLETE_OK);
        link.clear();
        let outcome = link
            .wait_complete(Duration::from_millis(30), &[COMPLETE_OK])
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut(None));
    }

    #[tokio::test]
    async fn only_latest_completion_code_is_retained() {
        let link = dry_link();
        link.clear();
        link.inject(COMPLETE_OK);
        link.inject(COMPLETE_RESET);
        let outcome = link
            .wait_complete(Duration::from_millis(50), &[COMPLETE_RESET])
            .await;
        assert_eq!(outcome, WaitOutcome::Code(COMPLETE_RESET));
    }

    #[tokio::test]
    async fn dry_run_schedules_completion() {
        let link = dry_link();
        link.clear();
        link.send(&[0x25, 0x48, 0x0A, 0x0D]);
        link.schedule_dry_run_complete();
        let outcome = link
            .wait_complete(Duration::from_millis(500), &[COMPLETE_OK])
            .await;
        assert_eq!(outcome, WaitOutcome::Code(COMPLETE_OK));
    }

    #[test]
    fn disconnected_link_is_dry() {
        let cfg = MarkerDeviceSection::default();
        let link = MarkerLink::open(&cfg, PrintMode::Hex).expect("open");
        assert!(!link.is_connected());
        assert!(link.dry_run_active());
    }
}

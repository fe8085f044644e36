// marker-bridge: Modbus-RTU client for the relay/PLC board
//
// Function 03 (read holding registers) and function 0x10 (write multiple
// registers, one action code per register). The board is strict about
// timing: one request/response pair at a time, ~20ms bus turnaround between
// write and read. All users share the port through a single async mutex.

use std::io::Write;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_16_MODBUS};
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::RelayDeviceSection;
use crate::error::{BridgeError, BridgeResult};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Relay action codes understood by the board (high byte of the register
/// payload; low byte is always 0x00).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    /// 1 = energize (ON)
    Open,
    /// 2 = release (OFF)
    Close,
    /// 3 = invert current state
    Toggle,
    /// 4 = latch until released
    Latch,
    /// 5 = momentary pulse
    Momentary,
}

impl RelayAction {
    pub fn code(self) -> u8 {
        match self {
            RelayAction::Open => 1,
            RelayAction::Close => 2,
            RelayAction::Toggle => 3,
            RelayAction::Latch => 4,
            RelayAction::Momentary => 5,
        }
    }
}

/// One relay write as recorded by the dry-run board.
#[derive(Debug, Clone)]
pub struct RelayWrite {
    pub addr: u16,
    pub action: RelayAction,
    pub at: Instant,
}

/// Highest relay address the board accepts in one frame.
const MAX_RELAYS_PER_WRITE: usize = 12;

enum ModbusInner {
    Serial {
        port: Mutex<Option<Box<dyn SerialPort>>>,
        path: String,
        baud: u32,
    },
    DryRun {
        registers: parking_lot::Mutex<Vec<u16>>,
        writes: parking_lot::Mutex<Vec<RelayWrite>>,
    },
}

/// Client for the relay/PLC board. Retries live here and nowhere above.
pub struct ModbusClient {
    slave_id: u8,
    retries: u32,
    turnaround: Duration,
    inner: ModbusInner,
}

impl ModbusClient {
    /// Open the configured serial port.
    pub fn connect(cfg: &RelayDeviceSection) -> BridgeResult<Self> {
        let path = cfg
            .com_port
            .clone()
            .ok_or_else(|| BridgeError::NotConnected("BOARD_RELAY com_port not set".into()))?;
        let port = open_port(&path, cfg.baud_rate)?;
        Ok(Self {
            slave_id: cfg.slave_id,
            retries: 2,
            turnaround: Duration::from_millis(20),
            inner: ModbusInner::Serial {
                port: Mutex::new(Some(port)),
                path,
                baud: cfg.baud_rate,
            },
        })
    }

    /// Simulated board: reads answer from a mutable register vector, writes
    /// are logged and recorded.
    pub fn dry_run(cfg: &RelayDeviceSection) -> Self {
        let mut registers = vec![
            cfg.dry_run_state.ready,
            cfg.dry_run_state.home,
            cfg.dry_run_state.reset,
        ];
        registers.extend_from_slice(&cfg.dry_run_state.other_registers);
        registers.resize(cfg.read_settings.num_registers as usize, 0);
        Self {
            slave_id: cfg.slave_id,
            retries: 2,
            turnaround: Duration::from_millis(20),
            inner: ModbusInner::DryRun {
                registers: parking_lot::Mutex::new(registers),
                writes: parking_lot::Mutex::new(Vec::new()),
            },
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self.inner, ModbusInner::DryRun { .. })
    }

    /// Patch the simulated input registers (index, value pairs). Only
    /// meaningful on a dry-run board.
    pub fn patch_dry_run_registers(&self, patch: &[(usize, u16)]) -> BridgeResult<()> {
        match &self.inner {
            ModbusInner::DryRun { registers, .. } => {
                let mut regs = registers.lock();
                for &(idx, value) in patch {
                    if idx < regs.len() {
                        regs[idx] = value;
                    }
                }
                Ok(())
            }
            ModbusInner::Serial { .. } => Err(BridgeError::ValueOutOfRange(
                "BOARD_RELAY is not in dry-run mode".into(),
            )),
        }
    }

    /// Relay writes recorded by the dry-run board, oldest first.
    pub fn relay_write_log(&self) -> Vec<RelayWrite> {
        match &self.inner {
            ModbusInner::DryRun { writes, .. } => writes.lock().clone(),
            ModbusInner::Serial { .. } => Vec::new(),
        }
    }

    /// Read `qty` holding registers starting at `start` (function 03).
    pub async fn read_holding_registers(&self, start: u16, qty: u16) -> BridgeResult<Vec<u16>> {
        match &self.inner {
            ModbusInner::DryRun { registers, .. } => {
                let mut values = registers.lock().clone();
                values.resize(qty as usize, 0);
                Ok(values)
            }
            ModbusInner::Serial { .. } => {
                let frame = read_frame(self.slave_id, start, qty);
                let expected = 3 + qty as usize * 2 + 2;
                let resp = self.transact(&frame, expected).await?;
                if resp.is_empty() {
                    return Err(BridgeError::Timeout("no response from relay board".into()));
                }
                if resp.len() != expected {
                    return Err(BridgeError::ShortRead(format!(
                        "expected {expected} bytes, got {}",
                        resp.len()
                    )));
                }
                check_crc(&resp)?;
                let mut values = Vec::with_capacity(qty as usize);
                for chunk in resp[3..resp.len() - 2].chunks_exact(2) {
                    values.push(u16::from_be_bytes([chunk[0], chunk[1]]));
                }
                Ok(values)
            }
        }
    }

    /// Apply one action to one relay (function 0x10, qty=1).
    pub async fn write_relay(&self, addr: u16, action: RelayAction) -> BridgeResult<()> {
        self.write_relays(addr, &[action]).await
    }

    /// Apply actions to consecutive relays starting at `start` in one frame
    /// (function 0x10). The echo is validated against the request and the
    /// write retried on CRC mismatch or short read.
    pub async fn write_relays(&self, start: u16, actions: &[RelayAction]) -> BridgeResult<()> {
        if actions.is_empty() || actions.len() > MAX_RELAYS_PER_WRITE {
            return Err(BridgeError::ValueOutOfRange(format!(
                "relay write must cover 1..={MAX_RELAYS_PER_WRITE} registers, got {}",
                actions.len()
            )));
        }
        match &self.inner {
            ModbusInner::DryRun { writes, .. } => {
                let mut log = writes.lock();
                for (offset, &action) in actions.iter().enumerate() {
                    let addr = start + offset as u16;
                    debug!(relay = addr, code = action.code(), "dry-run relay write");
                    log.push(RelayWrite {
                        addr,
                        action,
                        at: Instant::now(),
                    });
                }
                Ok(())
            }
            ModbusInner::Serial { .. } => self.write_relays_serial(start, actions).await,
        }
    }

    async fn write_relays_serial(&self, start: u16, actions: &[RelayAction]) -> BridgeResult<()> {
        let frame = write_frame(self.slave_id, start, actions);
        let mut last_err = BridgeError::InternalInvariant("relay write never attempted".into());

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!(attempt, relay = start, "retrying relay write");
            }
            let resp = self.transact(&frame, 8).await?;

            // Exception response: function code with the high bit set
            if resp.len() >= 5 && resp[1] & 0x80 != 0 {
                let ex = &resp[..5];
                if verify_crc(ex).is_err() {
                    last_err = BridgeError::Crc("exception response CRC mismatch".into());
                    continue;
                }
                return Err(BridgeError::DeviceException(ex[2]));
            }

            if resp.len() == 8 {
                if verify_crc(&resp).is_err() {
                    last_err = BridgeError::Crc("relay echo CRC mismatch".into());
                    continue;
                }
                let echo_ok = resp[0] == self.slave_id
                    && resp[1] == 0x10
                    && u16::from_be_bytes([resp[2], resp[3]]) == start
                    && u16::from_be_bytes([resp[4], resp[5]]) == actions.len() as u16;
                if echo_ok {
                    return Ok(());
                }
                return Err(BridgeError::SerialTransport(format!(
                    "relay echo mismatch: {resp:02X?}"
                )));
            }

            last_err = BridgeError::ShortRead(format!("relay echo was {} bytes", resp.len()));
        }
        Err(last_err)
    }

    /// One request/response exchange on the shared port. Collects up to
    /// `expected` bytes; a zero-length first pass gets exactly one immediate
    /// re-read before the result is handed back.
    async fn transact(&self, frame: &[u8], expected: usize) -> BridgeResult<Vec<u8>> {
        let ModbusInner::Serial { port, .. } = &self.inner else {
            return Err(BridgeError::InternalInvariant(
                "transact called on dry-run board".into(),
            ));
        };
        let mut guard = port.lock().await;
        let port = guard
            .as_mut()
            .ok_or_else(|| BridgeError::NotConnected("relay port is closed".into()))?;

        port.clear(serialport::ClearBuffer::Input)?;
        port.write_all(frame).map_err(BridgeError::from)?;
        tokio::time::sleep(self.turnaround).await;

        let mut resp = read_up_to(port.as_mut(), expected)?;
        if resp.is_empty() {
            // one immediate re-read before the attempt counts as failed
            resp = read_up_to(port.as_mut(), expected)?;
        }
        Ok(resp)
    }

    /// Reopen the serial port after repeated read failures.
    pub async fn reconnect(&self) -> BridgeResult<()> {
        match &self.inner {
            ModbusInner::DryRun { .. } => Ok(()),
            ModbusInner::Serial { port, path, baud } => {
                let mut guard = port.lock().await;
                *guard = None;
                match open_port(path, *baud) {
                    Ok(fresh) => {
                        *guard = Some(fresh);
                        debug!(port = %path, "relay port reopened");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(port = %path, error = %e, "relay port reopen failed");
                        Err(e)
                    }
                }
            }
        }
    }
}

fn open_port(path: &str, baud: u32) -> BridgeResult<Box<dyn SerialPort>> {
    let port = serialport::new(path, baud)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(Duration::from_millis(1000))
        .open()?;
    Ok(port)
}

fn read_up_to(port: &mut dyn SerialPort, expected: usize) -> BridgeResult<Vec<u8>> {
    let mut resp = Vec::with_capacity(expected);
    let mut buf = [0u8; 64];
    while resp.len() < expected {
        let want = (expected - resp.len()).min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => resp.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(BridgeError::from(e)),
        }
    }
    Ok(resp)
}

/// Append the CRC16-IBM checksum (poly 0xA001, init 0xFFFF, low byte first).
pub fn crc16(data: &[u8]) -> [u8; 2] {
    MODBUS_CRC.checksum(data).to_le_bytes()
}

fn check_crc(resp: &[u8]) -> BridgeResult<()> {
    verify_crc(resp).map_err(|()| BridgeError::Crc(format!("bad CRC on {} byte frame", resp.len())))
}

fn verify_crc(frame: &[u8]) -> Result<(), ()> {
    if frame.len() < 3 {
        return Err(());
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    if crc16(body) == [tail[0], tail[1]] {
        Ok(())
    } else {
        Err(())
    }
}

/// Function 03 request frame.
fn read_frame(slave: u8, start: u16, qty: u16) -> Vec<u8> {
    let mut frame = vec![
        slave,
        0x03,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (qty >> 8) as u8,
        (qty & 0xFF) as u8,
    ];
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc);
    frame
}

/// Function 0x10 request frame with the board's `[code, 0x00]` register
/// payload.
fn write_frame(slave: u8, start: u16, actions: &[RelayAction]) -> Vec<u8> {
    let qty = actions.len() as u16;
    let mut frame = vec![
        slave,
        0x10,
        (start >> 8) as u8,
        (start & 0xFF) as u8,
        (qty >> 8) as u8,
        (qty & 0xFF) as u8,
        (qty * 2) as u8,
    ];
    for action in actions {
        frame.push(action.code());
        frame.push(0x00);
    }
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc);
    frame
}

// marker-bridge: PLC input watcher
//
// Polls the relay board's holding registers, publishes snapshots to
// subscribers, and turns rising edges on the Home/Reset inputs into marker
// operations. Edge operations are fired on detached tasks through the
// coordinator's non-blocking entry: a busy marker drops the edge rather
// than stalling the poll loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use marker_protocol::MarkerCommand;

use crate::config::{BridgeConfig, ReadSettings};
use crate::coordinator::{Coordinator, OpSource};
use crate::error::BridgeError;
use crate::modbus::ModbusClient;
use crate::store::iso_now;
use crate::timeouts::TimeoutPolicy;

/// Fixed input register semantics.
pub const READY_INDEX: usize = 0;
pub const HOME_INDEX: usize = 1;
pub const RESET_INDEX: usize = 2;

/// Consecutive read failures before the watcher asks for a reconnect.
pub const RECONNECT_THRESHOLD: u32 = 5;

/// One observed register state, published on every change.
#[derive(Debug, Clone, Serialize)]
pub struct PlcSnapshot {
    pub values: Vec<u16>,
    #[serde(rename = "Ready")]
    pub ready: bool,
    #[serde(rename = "Home")]
    pub home: bool,
    #[serde(rename = "Reset")]
    pub reset: bool,
    pub ts: String,
}

impl PlcSnapshot {
    fn from_values(values: Vec<u16>) -> Self {
        let at = |idx: usize| values.get(idx).copied().unwrap_or(0) != 0;
        Self {
            ready: at(READY_INDEX),
            home: at(HOME_INDEX),
            reset: at(RESET_INDEX),
            ts: iso_now(),
            values,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum EdgeSignal {
    Home,
    Reset,
}

impl EdgeSignal {
    fn name(self) -> &'static str {
        match self {
            EdgeSignal::Home => "Home",
            EdgeSignal::Reset => "Reset",
        }
    }

    fn index(self) -> usize {
        match self {
            EdgeSignal::Home => HOME_INDEX,
            EdgeSignal::Reset => RESET_INDEX,
        }
    }
}

/// Periodic reader of the PLC inputs.
pub struct PlcWatcher {
    modbus: Arc<ModbusClient>,
    coordinator: Arc<Coordinator>,
    timeouts: TimeoutPolicy,
    read: ReadSettings,
    slave_id: u8,
    debounce: Duration,
    edge_only: bool,
    snapshot_tx: broadcast::Sender<PlcSnapshot>,
    stop: AtomicBool,
}

impl PlcWatcher {
    pub fn new(
        modbus: Arc<ModbusClient>,
        coordinator: Arc<Coordinator>,
        cfg: &BridgeConfig,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = broadcast::channel(32);
        Arc::new(Self {
            modbus,
            coordinator,
            timeouts: TimeoutPolicy::new(cfg.timeouts.clone()),
            read: cfg.devices.board_relay.read_settings.clone(),
            slave_id: cfg.devices.board_relay.slave_id,
            debounce: Duration::from_millis(cfg.devices.software_command.emit_options.debounce_ms),
            edge_only: cfg.devices.software_command.emit_options.edge_only,
            snapshot_tx,
            stop: AtomicBool::new(false),
        })
    }

    /// Observe register snapshots. Lagging subscribers lose old snapshots
    /// rather than slowing the watcher down.
    pub fn subscribe(&self) -> broadcast::Receiver<PlcSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run().await })
    }

    async fn run(self: Arc<Self>) {
        info!(
            slave = self.slave_id,
            address = self.read.start_address,
            registers = self.read.num_registers,
            interval_ms = self.read.interval_ms,
            "PLC watcher started"
        );
        let interval = Duration::from_millis(self.read.interval_ms.max(10));
        let mut prev: Option<Vec<u16>> = None;
        let mut failures = 0u32;
        let mut last_edge: [Option<Instant>; 2] = [None, None];

        while !self.stop.load(Ordering::Relaxed) {
            match self
                .modbus
                .read_holding_registers(self.read.start_address, self.read.num_registers)
                .await
            {
                Ok(values) => {
                    failures = 0;
                    if prev.as_ref() != Some(&values) {
                        self.publish(&values, prev.as_deref());
                        if let Some(prev_values) = &prev {
                            for (slot, signal) in [EdgeSignal::Home, EdgeSignal::Reset]
                                .into_iter()
                                .enumerate()
                            {
                                if rising(prev_values, &values, signal.index())
                                    && self.debounced(&mut last_edge[slot])
                                {
                                    self.fire_edge(signal);
                                }
                            }
                        }
                        prev = Some(values);
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.log_read_failure(&e, failures);
                    if failures >= RECONNECT_THRESHOLD {
                        failures = 0;
                        if self.modbus.reconnect().await.is_ok() {
                            info!("relay board reconnected");
                        }
                    }
                }
            }
            tokio::time::sleep(interval).await;
        }
        debug!("PLC watcher stopped");
    }

    fn publish(&self, values: &[u16], prev: Option<&[u16]>) {
        if self.edge_only {
            // only announce changes that touch the named signals
            let named_changed = prev.map_or(true, |p| {
                [READY_INDEX, HOME_INDEX, RESET_INDEX]
                    .iter()
                    .any(|&i| p.get(i) != values.get(i))
            });
            if !named_changed {
                return;
            }
        }
        let snapshot = PlcSnapshot::from_values(values.to_vec());
        debug!(values = ?snapshot.values, ready = snapshot.ready, "PLC state change");
        let _ = self.snapshot_tx.send(snapshot);
    }

    fn debounced(&self, last: &mut Option<Instant>) -> bool {
        let now = Instant::now();
        match last {
            Some(at) if now.duration_since(*at) < self.debounce => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Run the edge-triggered marker command on a detached task.
    fn fire_edge(&self, signal: EdgeSignal) {
        let link = self.coordinator.link();
        if !link.is_connected() && !link.is_dry_run() {
            warn!(signal = signal.name(), "input edge ignored: marker not connected");
            return;
        }
        info!(signal = signal.name(), "input edge detected");
        let cmd = match signal {
            EdgeSignal::Home => MarkerCommand::home(),
            EdgeSignal::Reset => MarkerCommand::reset(),
        };
        let timeout = self.timeouts.for_command(&cmd);
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            match coordinator.try_execute(&cmd, timeout, OpSource::PlcInput).await {
                None => warn!(signal = ?cmd.kind, "input edge dropped: marker busy"),
                Some(result) if result.is_ok() => {
                    debug!(signal = ?cmd.kind, "input operation complete");
                }
                Some(result) => warn!(signal = ?cmd.kind, ?result, "input operation failed"),
            }
        });
    }

    fn log_read_failure(&self, err: &BridgeError, failures: u32) {
        match err {
            BridgeError::Timeout(_) | BridgeError::ShortRead(_) | BridgeError::Crc(_) => {
                if failures == RECONNECT_THRESHOLD {
                    warn!(failures, error = %err, "PLC reads failing; check the connection");
                }
            }
            BridgeError::SerialTransport(_) | BridgeError::Os(_) | BridgeError::NotConnected(_) => {
                if failures == RECONNECT_THRESHOLD {
                    error!(failures, error = %err, "PLC transport failure");
                }
            }
            other => warn!(failures, error = %other, "unexpected PLC read failure"),
        }
    }
}

fn rising(prev: &[u16], current: &[u16], index: usize) -> bool {
    let old = prev.get(index).copied().unwrap_or(0) != 0;
    let new = current.get(index).copied().unwrap_or(0) != 0;
    !old && new
}

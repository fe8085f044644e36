// marker-bridge: single-flight operation coordinator
//
// Every marker operation, from any entry path, funnels through one gate:
// relay on_send, clear, transmit, wait (or collect), relay on_complete or
// on_timeout. The gate guarantees that every byte the reader attributes to
// an operation really belongs to it. UI callers block on the gate; PLC
// edge callers are dropped when it is busy.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use marker_protocol::{MarkerCommand, WaitMode, COMPLETE_OK, COMPLETE_RESET};

use crate::marker_link::{MarkerLink, WaitOutcome};
use crate::relay::RelaySequencer;

/// Where an operation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Ui,
    PlcInput,
}

impl fmt::Display for OpSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpSource::Ui => write!(f, "ui"),
            OpSource::PlcInput => write!(f, "input"),
        }
    }
}

/// Unified outcome of one operation.
#[derive(Debug, Clone)]
pub enum OperationResult {
    Ok {
        code: Option<u8>,
        elapsed_ms: u64,
        payload: Option<Vec<u8>>,
        relay_errors: Vec<String>,
    },
    Timeout {
        last_code: Option<u8>,
        elapsed_ms: u64,
    },
    DeviceError {
        reason: String,
    },
    RelayError {
        messages: Vec<String>,
    },
}

impl OperationResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, OperationResult::Ok { .. })
    }
}

/// Serializes all marker operations behind one mutex.
pub struct Coordinator {
    link: Arc<MarkerLink>,
    relays: RelaySequencer,
    gate: tokio::sync::Mutex<()>,
}

impl Coordinator {
    pub fn new(link: Arc<MarkerLink>, relays: RelaySequencer) -> Self {
        Self {
            link,
            relays,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn link(&self) -> &Arc<MarkerLink> {
        &self.link
    }

    /// Execute an operation, waiting for the gate if another is in flight.
    pub async fn execute(
        &self,
        cmd: &MarkerCommand,
        timeout: Duration,
        source: OpSource,
    ) -> OperationResult {
        let _guard = self.gate.lock().await;
        self.run(cmd, timeout, source).await
    }

    /// Execute an operation only if the gate is free. Edge-originated
    /// operations use this path and are dropped while the marker is busy.
    pub async fn try_execute(
        &self,
        cmd: &MarkerCommand,
        timeout: Duration,
        source: OpSource,
    ) -> Option<OperationResult> {
        match self.gate.try_lock() {
            Ok(_guard) => Some(self.run(cmd, timeout, source).await),
            Err(_) => {
                debug!(kind = ?cmd.kind, %source, "operation dropped: marker busy");
                None
            }
        }
    }

    async fn run(&self, cmd: &MarkerCommand, timeout: Duration, source: OpSource) -> OperationResult {
        debug!(kind = ?cmd.kind, %source, timeout_ms = timeout.as_millis() as u64, "operation started");
        let mut relay_errors = self.relays.on_send().await;

        if cmd.wait_mode != WaitMode::FireAndForget {
            self.link.clear();
        }
        self.link.send(&cmd.bytes);
        if self.link.dry_run_active() {
            self.link.schedule_dry_run_complete();
        }
        let started = Instant::now();

        match cmd.wait_mode {
            WaitMode::FireAndForget => OperationResult::Ok {
                code: None,
                elapsed_ms: 0,
                payload: None,
                relay_errors,
            },
            WaitMode::AwaitCode => {
                match self.link.wait_complete(timeout, &cmd.expected_codes).await {
                    WaitOutcome::Code(code) => {
                        relay_errors.extend(self.relays.on_complete().await);
                        OperationResult::Ok {
                            code: Some(code),
                            elapsed_ms: elapsed_ms(started),
                            payload: None,
                            relay_errors,
                        }
                    }
                    WaitOutcome::TimedOut(last_code) => {
                        self.finish_timeout(cmd, last_code).await;
                        OperationResult::Timeout {
                            last_code,
                            elapsed_ms: elapsed_ms(started),
                        }
                    }
                }
            }
            WaitMode::CollectUntilCode => {
                let collected = self.link.collect_until_complete(timeout).await;
                match collected.code {
                    Some(code) => {
                        relay_errors.extend(self.relays.on_complete().await);
                        OperationResult::Ok {
                            code: Some(code),
                            elapsed_ms: elapsed_ms(started),
                            payload: Some(collected.bytes),
                            relay_errors,
                        }
                    }
                    None => {
                        self.finish_timeout(cmd, None).await;
                        OperationResult::Timeout {
                            last_code: None,
                            elapsed_ms: elapsed_ms(started),
                        }
                    }
                }
            }
        }
    }

    /// Raw-read variant for the GET_JOB fallback: the reader is suspended
    /// under an exclusive lease and the reply (including any embedded
    /// completion bytes) is read straight off the port.
    pub async fn execute_raw_collect(
        &self,
        cmd: &MarkerCommand,
        timeout: Duration,
        source: OpSource,
    ) -> OperationResult {
        let _guard = self.gate.lock().await;
        debug!(kind = ?cmd.kind, %source, "raw-read operation started");

        let Some(mut lease) = self.link.raw_lease().await else {
            return OperationResult::DeviceError {
                reason: "raw read requires a connected marker port".to_string(),
            };
        };

        let mut relay_errors = self.relays.on_send().await;
        self.link.clear();
        self.link.send(&cmd.bytes);
        let started = Instant::now();

        let raw = lease.read_with_flush(timeout).await;
        drop(lease);

        match raw {
            Ok(bytes) => {
                let code = bytes
                    .iter()
                    .rev()
                    .find(|&&b| b == COMPLETE_OK || b == COMPLETE_RESET)
                    .copied();
                if code.is_some() {
                    relay_errors.extend(self.relays.on_complete().await);
                    OperationResult::Ok {
                        code,
                        elapsed_ms: elapsed_ms(started),
                        payload: Some(bytes),
                        relay_errors,
                    }
                } else {
                    self.finish_timeout(cmd, None).await;
                    OperationResult::Timeout {
                        last_code: None,
                        elapsed_ms: elapsed_ms(started),
                    }
                }
            }
            Err(e) => {
                self.finish_timeout(cmd, None).await;
                OperationResult::DeviceError {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn finish_timeout(&self, cmd: &MarkerCommand, last_code: Option<u8>) {
        warn!(kind = ?cmd.kind, ?last_code, "operation timed out");
        let errors = self.relays.on_timeout().await;
        for e in errors {
            warn!("[RELAY] after timeout: {e}");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

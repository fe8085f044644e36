// marker-bridge: relay side-effects around marker operations
//
// Relay 2 signals "operation in progress", relay 3 signals "finished".
// Relay failures never abort the marker wait; each phase hands back the
// error strings it accumulated so the coordinator can surface them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::BridgeResult;
use crate::modbus::{ModbusClient, RelayAction};

/// Relay address raised while an operation is in flight.
pub const DOING_RELAY: u16 = 2;

/// Relay address pulsed when an operation completes.
pub const FINISH_RELAY: u16 = 3;

/// How long the finish relay stays up after a completion.
pub const FINISH_HOLD_MS: u64 = 1000;

/// Drives the per-operation relay sequence against the shared Modbus client.
pub struct RelaySequencer {
    modbus: Arc<ModbusClient>,
}

impl RelaySequencer {
    pub fn new(modbus: Arc<ModbusClient>) -> Self {
        Self { modbus }
    }

    /// Before the frame is transmitted: DOING up.
    pub async fn on_send(&self) -> Vec<String> {
        let mut errors = Vec::new();
        self.step(
            &mut errors,
            self.modbus.write_relay(DOING_RELAY, RelayAction::Open).await,
            "on_send: DOING on",
        );
        errors
    }

    /// After a completion code: DOING down and FINISH up in one frame, then
    /// FINISH released after the hold time from a detached task.
    pub async fn on_complete(&self) -> Vec<String> {
        let mut errors = Vec::new();
        // DOING and FINISH are adjacent, so one frame covers both
        let result = self
            .modbus
            .write_relays(DOING_RELAY, &[RelayAction::Close, RelayAction::Open])
            .await;
        self.step(&mut errors, result, "on_complete: DOING off, FINISH on");

        let modbus = Arc::clone(&self.modbus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(FINISH_HOLD_MS)).await;
            if let Err(e) = modbus.write_relay(FINISH_RELAY, RelayAction::Close).await {
                warn!(error = %e, "deferred FINISH release failed");
            } else {
                debug!("FINISH relay released");
            }
        });
        errors
    }

    /// After a deadline passes with no completion: DOING down, nothing else.
    pub async fn on_timeout(&self) -> Vec<String> {
        let mut errors = Vec::new();
        self.step(
            &mut errors,
            self.modbus.write_relay(DOING_RELAY, RelayAction::Close).await,
            "on_timeout: DOING off",
        );
        errors
    }

    fn step(&self, errors: &mut Vec<String>, result: BridgeResult<()>, what: &str) {
        if let Err(e) = result {
            warn!(error = %e, "[RELAY] {what} failed");
            errors.push(format!("{what}: {e}"));
        }
    }
}

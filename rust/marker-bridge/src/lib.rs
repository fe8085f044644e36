// marker-bridge: bridge controller between a request socket, a VM-series
// laser marking engine, and a Modbus-RTU relay/PLC board
//
// The marker accepts one operation at a time: relay side-effects fire
// around each command, a completion byte (or a timeout) ends it, and PLC
// input edges can start operations of their own. Everything funnels
// through the coordinator so those paths never interleave on the wire.

#![deny(clippy::unwrap_used)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod marker_link;
pub mod modbus;
pub mod plc;
pub mod relay;
pub mod server;
pub mod service;
pub mod store;
pub mod timeouts;

pub use config::BridgeConfig;
pub use coordinator::{Coordinator, OpSource, OperationResult};
pub use error::{BridgeError, BridgeResult};
pub use marker_link::MarkerLink;
pub use modbus::ModbusClient;
pub use plc::PlcWatcher;
pub use relay::RelaySequencer;
pub use service::{BridgeService, Envelope, Reply};
pub use store::{JobRecord, JobStore, JsonFileStore};

// marker-protocol: wire protocol for the VM-series laser marking engine
//
// The marker speaks a mixed ASCII/binary protocol over a serial line:
// CR-terminated text commands with an even-total-length rule, a handful of
// bare control bytes, and single-byte completion codes (0x1F normal,
// 0x87 reset-complete) interleaved with ASCII reply payloads.

#![deny(clippy::unwrap_used)]

pub mod command;
pub mod job;
pub mod tokens;

pub use command::{Axis, CommandKind, MarkerCommand, WaitMode};
pub use job::{parse_get_job, JobFields, ParsedJob};
pub use tokens::{encode_tokens, ensure_even_before_cr, PrintMode};

use thiserror::Error;

/// Completion byte emitted by the marker when an operation finishes normally.
pub const COMPLETE_OK: u8 = 0x1F;

/// Completion byte emitted by the marker when a reset finishes.
pub const COMPLETE_RESET: u8 = 0x87;

/// Default set of completion codes a command waits for.
pub const DEFAULT_COMPLETION_CODES: [u8; 2] = [COMPLETE_OK, COMPLETE_RESET];

/// Protocol result type
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Protocol error types
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("{axis} value out of range: {value} (allowed {min}..={max})")]
    AxisOutOfRange {
        axis: Axis,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("decimal token out of range: <{0}>")]
    DecTokenOutOfRange(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

// marker-bridge: error types

use thiserror::Error;

/// Bridge result type
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge error types
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("{0}")]
    ValueOutOfRange(String),

    #[error("NOT_READY: {0}")]
    NotReady(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("device exception: {} ({})", exception_name(*.0), .0)]
    DeviceException(u8),

    #[error("CRC mismatch: {0}")]
    Crc(String),

    #[error("short read: {0}")]
    ShortRead(String),

    #[error("serial transport error: {0}")]
    SerialTransport(String),

    #[error("OS error: {0}")]
    Os(String),

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("relay errors: {}", .0.join("; "))]
    Relay(Vec<String>),
}

/// Check if an error is transient (worth an in-layer retry)
pub fn is_transient_error(err: &BridgeError) -> bool {
    matches!(
        err,
        BridgeError::Crc(_)
            | BridgeError::ShortRead(_)
            | BridgeError::Timeout(_)
            | BridgeError::SerialTransport(_)
    )
}

/// Standard Modbus exception code names
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        _ => "Unknown Exception",
    }
}

impl From<marker_protocol::ProtocolError> for BridgeError {
    fn from(err: marker_protocol::ProtocolError) -> Self {
        match err {
            marker_protocol::ProtocolError::AxisOutOfRange { .. }
            | marker_protocol::ProtocolError::DecTokenOutOfRange(_) => {
                BridgeError::ValueOutOfRange(err.to_string())
            }
            marker_protocol::ProtocolError::InvalidFrame(msg) => {
                BridgeError::InternalInvariant(msg)
            }
        }
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => BridgeError::Timeout(err.to_string()),
            _ => BridgeError::Os(err.to_string()),
        }
    }
}

impl From<serialport::Error> for BridgeError {
    fn from(err: serialport::Error) -> Self {
        match err.kind {
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
                BridgeError::Timeout(err.to_string())
            }
            serialport::ErrorKind::NoDevice => BridgeError::NotConnected(err.to_string()),
            _ => BridgeError::SerialTransport(err.to_string()),
        }
    }
}

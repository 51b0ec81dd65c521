use thiserror::Error;

/// Errors raised by the SMP client and its transports.
#[derive(Debug, Error)]
pub enum SmpError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("transport is not open")]
    NotOpen,

    #[error("no response to sequence {seq} within {timeout_ms} ms")]
    Timeout { seq: u8, timeout_ms: u128 },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Crc { expected: u16, actual: u16 },

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("unexpected response payload: {0}")]
    Payload(String),

    #[error("upload offset {offset} does not advance past previous offset {previous}")]
    OffsetRegression { previous: usize, offset: usize },

    #[error("{0} transport is not supported on this platform")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, SmpError>;

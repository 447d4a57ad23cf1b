//! OBD-II Error Types

use thiserror::Error;

/// Errors produced by the metric decoder table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// No formula registered for this PID
    #[error("unsupported PID: {0}")]
    UnsupportedPid(String),

    /// Payload does not have the fixed length the PID requires
    #[error("PID {pid}: expected {expected} data bytes, got {actual}")]
    PayloadLength {
        pid: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors produced while validating a delimited ELM327 response
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Too short, or does not start with a mode response digit
    #[error("invalid response format: {0:?}")]
    InvalidFormat(String),

    /// Fewer than three whitespace separated tokens
    #[error("response too short: {0:?}")]
    TooShort(String),

    /// Echo token is not two hex characters starting with '4'
    #[error("invalid echo format: {0:?}")]
    InvalidEcho(String),

    /// PID token is not two hex characters
    #[error("invalid PID format: {0:?}")]
    InvalidPid(String),

    /// A data token is not an 8-bit hex byte
    #[error("invalid hex data {0:?}")]
    InvalidData(String),

    /// The payload was well formed but could not be decoded
    #[error("failed to decode: {0}")]
    Decode(#[from] DecodeError),
}

/// Errors on the serial link
#[derive(Debug, Error)]
pub enum LinkError {
    /// The configured device path does not exist
    #[error("device {0} does not exist, bind the RFCOMM channel first")]
    DeviceAbsent(String),

    /// Opening the device failed
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// Opening the device did not complete in time
    #[error("timed out opening {path} after {timeout_ms}ms")]
    OpenTimeout { path: String, timeout_ms: u64 },

    /// Reading from the device failed or hit end of stream
    #[error("read from {path} failed: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the device failed or did not complete in time
    #[error("write to {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the bus-safe frame codec
#[derive(Debug, Error)]
pub enum FrameCodecError {
    #[error("invalid base64 frame: {0}")]
    Base64(#[from] base64::DecodeError),
}

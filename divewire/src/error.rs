//! Error types for divewire.

use std::io;
use thiserror::Error;

/// Result type for divewire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for divewire operations.
///
/// Every operation reports the most specific kind; callers never need to
/// inspect an underlying errno. Protocol errors are not retried internally;
/// retries are the caller's policy.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (transport open failure, write failure).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The operation is not available on this device or family.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Invalid argument (wrong fingerprint length, oversized packet, ...).
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// A fixed-capacity table or buffer ran out of room.
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// The operation was cancelled through the device's cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// A read returned fewer bytes than requested within the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Echo, ready byte or checksum mismatch on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A dive blob is inconsistent with the declared memory layout.
    #[error("Data format error: {0}")]
    DataFormat(String),
}

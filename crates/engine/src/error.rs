//! Engine error types

use thiserror::Error;

/// Errors returned synchronously to engine callers.
#[derive(Debug, Error)]
pub enum Error {
    /// A channel capacity of zero was requested.
    #[error("channel capacity must be greater than zero")]
    InvalidCapacity,

    /// The device could not be opened.
    #[error("USB device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Operation on a shut-down (or never-initialized) engine.
    #[error("engine is not initialized")]
    NotInitialized,

    /// The device rejected or failed a write. Never retried internally;
    /// retry policy belongs to the caller.
    #[error("device write failed: {0}")]
    WriteFailed(#[source] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for engine results.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport-level errors, classified for the dispatcher's retry decision.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transfer timed out before completing.
    #[error("transfer timed out")]
    Timeout,

    /// The transfer was interrupted by a signal.
    #[error("transfer interrupted")]
    Interrupted,

    /// The device was removed or is no longer reachable.
    #[error("device disconnected")]
    Disconnected,

    /// The endpoint stalled.
    #[error("endpoint stalled")]
    Stall,

    /// Any other device-level failure.
    #[error("transfer failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the dispatcher should keep looping after this error.
    ///
    /// Timeouts and signal interruptions are the only recoverable cases;
    /// unknown I/O errors are treated as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Interrupted)
    }
}

/// Map rusb errors onto the transport taxonomy.
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::Interrupted => TransportError::Interrupted,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        rusb::Error::Pipe => TransportError::Stall,
        _ => TransportError::Other(err.to_string()),
    }
}

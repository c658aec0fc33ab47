//! Bus error taxonomy

use crate::types::{BusStatus, TimeoutTarget};
use thiserror::Error;

/// Errors raised by transports, the bounded-wait primitives and the command layer
#[derive(Debug, Error)]
pub enum BusError {
    /// Controller or device could not be located
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Device was located but failed the liveness check
    #[error("Instrument not responding: {0}")]
    TransportUnresponsive(String),

    /// Protocol-level error bits were set during a transfer
    #[error("Bus error during {context} (status {status})")]
    Bus { context: String, status: BusStatus },

    /// Bounded wait exceeded without resolution
    #[error("Timed out during {context}")]
    Timeout { context: String },

    /// Caller-initiated cancellation observed mid-operation
    #[error("Operation aborted")]
    Aborted,

    /// Service request seen but the expected completion flag was absent
    #[error(
        "Protocol mismatch: event status {event_status:#04x} lacks completion bit {expected:#04x}"
    )]
    ProtocolMismatch { expected: u8, event_status: u8 },

    /// A previous operation left the error bit set on the connection
    #[error("Refusing transfer: previous operation left an error pending")]
    PreviousError,

    /// A restore was requested without a matching save
    #[error("No saved {0} timeout to restore")]
    NoSavedTimeout(TimeoutTarget),

    /// Malformed `#A` data block
    #[error("Invalid data block: {0}")]
    InvalidBlock(String),

    /// Instrument replied with something unparsable
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Work item is missing data or carries an out-of-range argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation not available on this transport or build
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error from the underlying device file or port
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// Build a [`BusError::Bus`] from a context string and raw status
    pub fn bus(context: impl Into<String>, status: BusStatus) -> Self {
        BusError::Bus {
            context: context.into(),
            status,
        }
    }

    /// Whether this error means the work item must not touch the bus again
    pub fn halts_item(&self) -> bool {
        matches!(self, BusError::Aborted | BusError::Timeout { .. })
    }
}

/// Type alias for bus results
pub type Result<T> = std::result::Result<T, BusError>;

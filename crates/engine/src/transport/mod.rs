//! Bus transports
//!
//! Every physical access method (native controller card, USB class device,
//! serial relay adapter, simulated instrument) implements [`Transport`], a
//! small set of primitives modelled on the IEEE-488 controller library:
//! synchronous transfers, one asynchronous operation at a time polled with the
//! device timeout, service-request waits bounded by the controller timeout,
//! and a status word with the controller's bit layout.
//!
//! [`Connector`] turns a [`TransportConfig`] into an open transport;
//! [`Connection`] wraps the result with the saved-timeout record and the
//! previous-error short circuit.

mod connection;
pub mod native;
pub mod prologix;
pub mod sim;
pub mod usbtmc;

pub use connection::{Connection, PING_TIMEOUT};

use protocol::{BusError, BusStatus, Result, TimeoutClass, TimeoutTarget, TransportConfig, TransportKind};
use std::collections::HashMap;
use tracing::debug;

/// Asynchronous operation handed to [`Transport::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRequest {
    Write(Vec<u8>),
    /// Read up to `max` bytes, stopping early at end-of-data or at `until`
    Read { max: usize, until: Option<u8> },
}

impl AsyncRequest {
    /// Short label for logs and progress messages
    pub fn label(&self) -> &'static str {
        match self {
            AsyncRequest::Write(_) => "write",
            AsyncRequest::Read { .. } => "read",
        }
    }
}

/// One open path to one instrument
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Human readable address for logs
    fn describe(&self) -> String;

    /// Status word of the last operation
    fn status(&self) -> BusStatus;

    /// Byte count of the last completed transfer
    fn byte_count(&self) -> usize;

    /// Latch the error bit so later transfers are refused
    fn set_error_flag(&mut self);

    /// Current timeout class of `target`
    fn timeout(&mut self, target: TimeoutTarget) -> Result<TimeoutClass>;

    fn set_timeout(&mut self, target: TimeoutTarget, class: TimeoutClass) -> Result<()>;

    /// Check that a listener answers at the device address
    ///
    /// Bounded by the device timeout.
    fn listen_probe(&mut self) -> Result<bool>;

    /// Return the instrument to front-panel control
    fn local(&mut self) -> BusStatus;

    /// Selected device clear; also resets the latched error bit
    fn clear(&mut self) -> BusStatus;

    /// Synchronous write bounded by the device timeout
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Synchronous read bounded by the device timeout
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Start an asynchronous operation; at most one may be in flight
    fn submit(&mut self, request: AsyncRequest) -> Result<()>;

    /// Wait up to the device timeout for the in-flight operation
    ///
    /// Returns a status with `CMPL`/`END` once it finished, `TIMO` while it is
    /// still pending and `ERR` if it failed.
    fn poll_once(&mut self) -> BusStatus;

    /// Stop the in-flight operation, if any
    fn cancel(&mut self);

    /// Bytes delivered by the last completed asynchronous read
    fn take_read(&mut self) -> Vec<u8>;

    /// Wait up to the controller timeout for a service request
    ///
    /// Returns `SRQI` when one is asserted, `TIMO` otherwise.
    fn wait_service_request(&mut self) -> BusStatus;

    /// Serial-poll the device and return its status byte
    fn serial_poll(&mut self) -> Result<u8>;

    fn close(&mut self) -> Result<()>;
}

/// Opens transports
pub trait Connector: Send {
    fn connect(&mut self, config: &TransportConfig) -> Result<Box<dyn Transport>>;
}

/// Connector for real hardware
///
/// Named configurations are resolved through the identity table first; names
/// the table does not know are handed to the native library's own device
/// configuration, which only the native bus has.
#[derive(Debug, Default)]
pub struct HardwareConnector {
    identities: HashMap<String, TransportConfig>,
}

impl HardwareConnector {
    pub fn new(identities: HashMap<String, TransportConfig>) -> Self {
        Self { identities }
    }

    /// Resolve a named configuration to an explicit one
    pub fn resolve(&self, config: &TransportConfig) -> Result<TransportConfig> {
        if !config.use_named {
            return Ok(config.clone());
        }
        let name = config.name.as_deref().ok_or_else(|| {
            BusError::TransportNotFound("named configuration without a name".to_string())
        })?;

        if let Some(found) = self.identities.get(name) {
            debug!("Resolved identity '{}' to {}", name, found.describe());
            let mut resolved = found.clone();
            resolved.use_named = false;
            resolved.name = Some(name.to_string());
            return Ok(resolved);
        }

        match config.kind {
            TransportKind::NativeBus => Ok(config.clone()),
            _ => Err(BusError::TransportNotFound(format!(
                "unknown identity '{}'",
                name
            ))),
        }
    }
}

impl Connector for HardwareConnector {
    fn connect(&mut self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        let config = self.resolve(config)?;
        debug!("Connecting to {}", config.describe());

        match config.kind {
            TransportKind::NativeBus => native::connect(&config),
            TransportKind::UsbClass => {
                usbtmc::UsbTmc::open(&config).map(|t| Box::new(t) as Box<dyn Transport>)
            }
            TransportKind::SerialRelay => {
                prologix::Prologix::open(&config).map(|t| Box::new(t) as Box<dyn Transport>)
            }
        }
    }
}

//! Open connection to one instrument

use super::{Connector, Transport};
use protocol::{
    BusError, BusStatus, Outcome, Result, TimeoutClass, TimeoutPurpose, TimeoutTarget,
    TransportConfig, TransportKind,
};
use tracing::{debug, info, warn};

/// Device timeout used by the liveness check
pub const PING_TIMEOUT: TimeoutClass = TimeoutClass::T3s;

/// An open transport plus the bookkeeping shared by the bus primitives
///
/// Saved timeouts are kept per target as a stack, so a save made by an
/// inner primitive never clobbers the one made by its caller.
pub struct Connection {
    transport: Box<dyn Transport>,
    saved: [Vec<TimeoutClass>; 2],
    last_fault: Option<BusError>,
    closed: bool,
}

fn slot(target: TimeoutTarget) -> usize {
    match target {
        TimeoutTarget::Controller => 0,
        TimeoutTarget::Device => 1,
    }
}

impl Connection {
    /// Wrap an already open transport
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            saved: [Vec::new(), Vec::new()],
            last_fault: None,
            closed: false,
        }
    }

    /// Open and verify a connection
    ///
    /// A device the connector cannot locate yields `TransportNotFound`; one
    /// that is located but does not answer the liveness check is closed again
    /// and yields `TransportUnresponsive`.
    pub fn open(connector: &mut dyn Connector, config: &TransportConfig) -> Result<Self> {
        let transport = connector.connect(config)?;
        let mut conn = Self::new(transport);

        if !conn.ping() {
            warn!("{} did not answer the liveness check", conn.describe());
            conn.close();
            return Err(BusError::TransportUnresponsive(config.describe()));
        }

        info!("Opened {}", conn.describe());
        Ok(conn)
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    pub fn status(&self) -> BusStatus {
        self.transport.status()
    }

    pub fn byte_count(&self) -> usize {
        self.transport.byte_count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Liveness check with a short bounded timeout
    ///
    /// The device timeout in effect before the call is put back whatever the
    /// outcome, so a ping never disturbs a surrounding save/restore pair.
    pub fn ping(&mut self) -> bool {
        let prior = match self.transport.timeout(TimeoutTarget::Device) {
            Ok(class) => class,
            Err(e) => {
                debug!("Ping could not read the device timeout: {}", e);
                return false;
            }
        };
        if let Err(e) = self.transport.set_timeout(TimeoutTarget::Device, PING_TIMEOUT) {
            debug!("Ping could not set the device timeout: {}", e);
            return false;
        }

        let alive = match self.transport.listen_probe() {
            Ok(alive) => alive,
            Err(e) => {
                debug!("Listener probe failed: {}", e);
                false
            }
        };

        if let Err(e) = self.transport.set_timeout(TimeoutTarget::Device, prior) {
            warn!("Failed to put back device timeout {} after ping: {}", prior, e);
        }
        alive
    }

    /// Change a timeout according to `purpose`
    ///
    /// `Restore` ignores `class` and puts back the most recent saved value;
    /// without one it fails with `NoSavedTimeout`.
    pub fn timeout(
        &mut self,
        target: TimeoutTarget,
        class: TimeoutClass,
        purpose: TimeoutPurpose,
    ) -> Result<()> {
        match purpose {
            TimeoutPurpose::Set => self.transport.set_timeout(target, class),
            TimeoutPurpose::SaveAndSet => {
                let current = self.transport.timeout(target)?;
                self.transport.set_timeout(target, class)?;
                self.saved[slot(target)].push(current);
                Ok(())
            }
            TimeoutPurpose::Restore => {
                let saved = self.saved[slot(target)]
                    .pop()
                    .ok_or(BusError::NoSavedTimeout(target))?;
                self.transport.set_timeout(target, saved)
            }
        }
    }

    /// Shorthand for `timeout(target, _, Restore)`
    pub fn restore_timeout(&mut self, target: TimeoutTarget) -> Result<()> {
        self.timeout(target, TimeoutClass::None, TimeoutPurpose::Restore)
    }

    /// Current timeout of `target` as reported by the transport
    pub fn current_timeout(&mut self, target: TimeoutTarget) -> Result<TimeoutClass> {
        self.transport.timeout(target)
    }

    /// Synchronous write; refused while an earlier error is pending
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.refuse_if_failed()?;
        self.transport.write(data)
    }

    /// Synchronous read; refused while an earlier error is pending
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.refuse_if_failed()?;
        self.transport.read(buf)
    }

    fn refuse_if_failed(&self) -> Result<()> {
        if self.status().is_error() {
            return Err(BusError::PreviousError);
        }
        Ok(())
    }

    /// Latch the error bit so the rest of the work item stays off the bus
    pub fn flag_error(&mut self) {
        self.transport.set_error_flag();
    }

    /// Device clear; drops any recorded fault
    pub fn clear(&mut self) -> BusStatus {
        self.last_fault = None;
        let status = self.transport.clear();
        debug!("Device clear on {} ({})", self.describe(), status);
        status
    }

    pub fn local(&mut self) -> BusStatus {
        self.transport.local()
    }

    /// Remember why the last primitive failed
    pub fn record_fault(&mut self, fault: BusError) {
        debug!("Recording fault: {}", fault);
        self.last_fault = Some(fault);
    }

    /// Turn a primitive's outcome into a `Result`
    ///
    /// An `Error` outcome reports the fault recorded by the primitive, or the
    /// raw status word when none was recorded.
    pub fn check(&mut self, outcome: Outcome, context: &str) -> Result<()> {
        match outcome {
            Outcome::Ok => Ok(()),
            Outcome::Timeout => Err(BusError::Timeout {
                context: context.to_string(),
            }),
            Outcome::Aborted => Err(BusError::Aborted),
            Outcome::PreviousError => Err(BusError::PreviousError),
            Outcome::Error => Err(self
                .last_fault
                .take()
                .unwrap_or_else(|| BusError::bus(context, self.status()))),
        }
    }

    pub(crate) fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Return the instrument to local control and release the transport
    ///
    /// Idempotent; failures are logged and otherwise ignored.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.transport.local();
        match self.transport.close() {
            Ok(()) => info!("Closed {}", self.describe()),
            Err(e) => warn!("Failed to close {}: {}", self.describe(), e),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::{SimConnector, SimInstrument};

    fn open_sim() -> (SimInstrument, Connection) {
        let sim = SimInstrument::new();
        let mut connector = SimConnector::new(sim.clone());
        let conn = Connection::open(&mut connector, &TransportConfig::default()).unwrap();
        (sim, conn)
    }

    #[test]
    fn test_open_missing_device() {
        let sim = SimInstrument::new();
        sim.set_present(false);
        let mut connector = SimConnector::new(sim);
        let result = Connection::open(&mut connector, &TransportConfig::default());
        assert!(matches!(result, Err(BusError::TransportNotFound(_))));
    }

    #[test]
    fn test_open_unresponsive_device_is_closed() {
        let sim = SimInstrument::new();
        sim.set_responsive(false);
        let mut connector = SimConnector::new(sim.clone());
        let result = Connection::open(&mut connector, &TransportConfig::default());
        assert!(matches!(result, Err(BusError::TransportUnresponsive(_))));
        assert!(sim.is_closed());
    }

    #[test]
    fn test_ping_restores_device_timeout() {
        let (sim, mut conn) = open_sim();
        conn.timeout(TimeoutTarget::Device, TimeoutClass::T10s, TimeoutPurpose::Set)
            .unwrap();
        assert!(conn.ping());
        assert_eq!(sim.timeout(TimeoutTarget::Device), TimeoutClass::T10s);

        sim.set_responsive(false);
        assert!(!conn.ping());
        assert_eq!(sim.timeout(TimeoutTarget::Device), TimeoutClass::T10s);
    }

    #[test]
    fn test_restore_without_save() {
        let (_sim, mut conn) = open_sim();
        let err = conn.restore_timeout(TimeoutTarget::Controller).unwrap_err();
        assert!(matches!(
            err,
            BusError::NoSavedTimeout(TimeoutTarget::Controller)
        ));
    }

    #[test]
    fn test_nested_save_and_restore() {
        let (sim, mut conn) = open_sim();
        let ambient = sim.timeout(TimeoutTarget::Device);

        conn.timeout(TimeoutTarget::Device, TimeoutClass::T1s, TimeoutPurpose::SaveAndSet)
            .unwrap();
        conn.timeout(TimeoutTarget::Device, TimeoutClass::T30ms, TimeoutPurpose::SaveAndSet)
            .unwrap();
        conn.restore_timeout(TimeoutTarget::Device).unwrap();
        assert_eq!(sim.timeout(TimeoutTarget::Device), TimeoutClass::T1s);
        conn.restore_timeout(TimeoutTarget::Device).unwrap();
        assert_eq!(sim.timeout(TimeoutTarget::Device), ambient);
    }

    #[test]
    fn test_previous_error_short_circuits() {
        let (sim, mut conn) = open_sim();
        conn.flag_error();

        assert!(matches!(conn.write(b"SING;"), Err(BusError::PreviousError)));
        let mut buf = [0u8; 8];
        assert!(matches!(conn.read(&mut buf), Err(BusError::PreviousError)));
        assert!(sim.traffic().is_empty());

        conn.clear();
        assert!(conn.write(b"SING;").is_ok());
    }

    #[test]
    fn test_check_reports_recorded_fault() {
        let (_sim, mut conn) = open_sim();
        conn.record_fault(BusError::ProtocolMismatch {
            expected: 1,
            event_status: 0,
        });
        assert!(matches!(
            conn.check(Outcome::Error, "signal"),
            Err(BusError::ProtocolMismatch { .. })
        ));
        assert!(matches!(
            conn.check(Outcome::Error, "signal"),
            Err(BusError::Bus { .. })
        ));
        assert!(conn.check(Outcome::Ok, "signal").is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (sim, mut conn) = open_sim();
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(sim.close_count(), 1);
        drop(conn);
        assert_eq!(sim.close_count(), 1);
    }
}

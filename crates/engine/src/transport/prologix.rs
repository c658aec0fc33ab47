//! Serial relay transport (Prologix-style GPIB-USB adapter)
//!
//! The adapter runs in controller mode with automatic read-after-write off.
//! Lines starting with `++` are adapter commands; every other line is sent to
//! the addressed instrument with EOI on its last byte. Data bytes that the
//! adapter would interpret (CR, LF, ESC, `+`) are escaped with ESC.
//!
//! End-of-message markers are disabled so binary blocks pass through
//! untouched, which leaves three ways for a read to finish: the requested
//! byte count, the terminator byte, or an idle gap after data has started.

use super::{AsyncRequest, Transport};
use bytes::BytesMut;
use protocol::{
    BusError, BusStatus, Result, TimeoutClass, TimeoutTarget, TransportConfig, TransportKind,
};
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ESC: u8 = 0x1B;

/// Adapter read timeout, programmed with `++read_tmo_ms`
const ADAPTER_READ_TMO: Duration = Duration::from_millis(1000);
/// Quiet time after the last byte that ends a read
const IDLE_GAP: Duration = Duration::from_millis(250);
/// Longest single blocking port call
const FILL_SLICE: Duration = Duration::from_millis(50);
const WRITE_CHUNK: usize = 256;
const ADAPTER_REPLY_WAIT: Duration = Duration::from_secs(1);
const SRQ_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Escape bytes the adapter would otherwise act on
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8 + 1);
    for &b in data {
        if matches!(b, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(b);
    }
    out
}

/// Escaped data line for the instrument
pub fn frame_data(data: &[u8]) -> Vec<u8> {
    let mut line = escape(data);
    line.push(b'\n');
    line
}

/// Adapter setup sequence for the instrument at `address`
pub fn setup_commands(address: u8) -> Vec<String> {
    vec![
        "++mode 1".to_string(),
        "++auto 0".to_string(),
        "++eoi 1".to_string(),
        "++eos 3".to_string(),
        "++eot_enable 0".to_string(),
        format!("++read_tmo_ms {}", ADAPTER_READ_TMO.as_millis()),
        format!("++addr {}", address),
    ]
}

/// Parse the adapter's reply to `++spoll`
pub fn parse_status_byte(reply: &str) -> Result<u8> {
    reply
        .trim()
        .parse::<u8>()
        .map_err(|_| BusError::InvalidResponse(format!("serial poll reply {:?}", reply)))
}

pub fn map_serial_error(context: &str, err: serialport::Error) -> BusError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => {
            BusError::TransportNotFound(format!("{}: {}", context, err))
        }
        serialport::ErrorKind::Io(kind) => {
            BusError::Io(std::io::Error::new(kind, format!("{}: {}", context, err)))
        }
        _ => BusError::Io(std::io::Error::other(format!("{}: {}", context, err))),
    }
}

/// Wait for the next blocking port call; `None` once `deadline` has passed
fn budget(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(FILL_SLICE),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            (!left.is_zero()).then(|| left.min(FILL_SLICE))
        }
    }
}

#[derive(Debug)]
enum Pending {
    Write {
        line: Vec<u8>,
        sent: usize,
        len: usize,
    },
    Read {
        max: usize,
        until: Option<u8>,
        requested: bool,
        end: bool,
        data: BytesMut,
    },
}

/// Serial line to the adapter with its receive buffer
struct Line {
    port: Box<dyn SerialPort>,
    rx: BytesMut,
    /// A `++read` is still delivering bytes
    streaming: bool,
    requested_at: Instant,
    last_rx: Option<Instant>,
}

impl Line {
    fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            rx: BytesMut::with_capacity(4096),
            streaming: false,
            requested_at: Instant::now(),
            last_rx: None,
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn command(&mut self, cmd: &str) -> Result<()> {
        debug!("Adapter command: {}", cmd);
        self.send(format!("{}\n", cmd).as_bytes())
    }

    /// Read whatever arrives within `wait` into the buffer
    fn fill(&mut self, wait: Duration) -> Result<usize> {
        self.port
            .set_timeout(wait.max(Duration::from_millis(1)))
            .map_err(|e| map_serial_error("set port timeout", e))?;
        let mut chunk = [0u8; 512];
        match self.port.read(&mut chunk) {
            Ok(n) => {
                if n > 0 {
                    self.rx.extend_from_slice(&chunk[..n]);
                    self.last_rx = Some(Instant::now());
                }
                Ok(n)
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop buffered input and any read the adapter is still delivering
    fn reset_input(&mut self) {
        self.rx.clear();
        self.streaming = false;
        self.last_rx = None;
    }

    fn read_line(&mut self, deadline: Instant) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.rx.iter().position(|&b| b == b'\n') {
                let line = self.rx.split_to(pos + 1);
                return Ok(Some(String::from_utf8_lossy(&line).trim().to_string()));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.fill(left.min(FILL_SLICE))?;
        }
    }

    /// Adapter command with a one-line reply
    fn query(&mut self, cmd: &str, wait: Duration) -> Result<Option<String>> {
        self.reset_input();
        self.command(cmd)?;
        self.read_line(Instant::now() + wait)
    }

    fn advance(&mut self, op: &mut Pending, deadline: Option<Instant>) -> Result<bool> {
        match op {
            Pending::Write { line, sent, .. } => {
                if *sent == 0 && self.streaming {
                    // The data line ends the adapter's read
                    self.reset_input();
                }
                loop {
                    if *sent >= line.len() {
                        self.port.flush()?;
                        return Ok(true);
                    }
                    let Some(wait) = budget(deadline) else {
                        return Ok(false);
                    };
                    self.port
                        .set_timeout(wait)
                        .map_err(|e| map_serial_error("set port timeout", e))?;
                    let end = (*sent + WRITE_CHUNK).min(line.len());
                    match self.port.write(&line[*sent..end]) {
                        Ok(n) => *sent += n,
                        Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(false),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Pending::Read {
                max,
                until,
                requested,
                end,
                data,
            } => loop {
                let room = *max - data.len();
                let available = room.min(self.rx.len());
                let take = until
                    .and_then(|t| self.rx[..available].iter().position(|&b| b == t))
                    .map_or(available, |pos| pos + 1);
                let chunk = self.rx.split_to(take);
                data.extend_from_slice(&chunk);

                if until.is_some_and(|t| chunk.last() == Some(&t)) {
                    *end = true;
                    return Ok(true);
                }
                if data.len() >= *max {
                    return Ok(true);
                }

                if !*requested {
                    if !self.streaming {
                        self.command("++read eoi")?;
                        self.streaming = true;
                        self.requested_at = Instant::now();
                        self.last_rx = None;
                    }
                    *requested = true;
                }

                let Some(wait) = budget(deadline) else {
                    return Ok(false);
                };
                if self.fill(wait)? > 0 {
                    continue;
                }

                match self.last_rx {
                    Some(at) if at.elapsed() >= IDLE_GAP => {
                        self.streaming = false;
                        if !data.is_empty() {
                            *end = true;
                            return Ok(true);
                        }
                        *requested = false;
                    }
                    None if self.requested_at.elapsed() >= ADAPTER_READ_TMO => {
                        // Adapter gave up before the instrument talked; ask again
                        self.streaming = false;
                        *requested = false;
                    }
                    _ => {}
                }
            },
        }
    }

    fn abort(&mut self, op: &Pending) {
        let result = match op {
            Pending::Write { sent, line, .. } if *sent > 0 && *sent < line.len() => {
                // Adapter buffers up to the line end; close the fragment
                self.send(b"\n")
            }
            Pending::Read { .. } if self.streaming => {
                // Any input ends a pending ++read
                self.command("++ver").and_then(|_| {
                    let until = Instant::now() + FILL_SLICE * 2;
                    while Instant::now() < until {
                        self.fill(FILL_SLICE)?;
                    }
                    Ok(())
                })
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!("Abort incomplete: {}", e);
        }
        self.reset_input();
    }
}

/// Instrument behind a serial GPIB relay adapter
pub struct Prologix {
    line: Line,
    description: String,
    status: BusStatus,
    count: usize,
    timeouts: [TimeoutClass; 2],
    pending: Option<Pending>,
    read_data: Vec<u8>,
}

impl Prologix {
    pub fn open(config: &TransportConfig) -> Result<Self> {
        let path = config.serial_port.as_deref().ok_or_else(|| {
            BusError::TransportNotFound(format!("{}: no serial port configured", config.describe()))
        })?;

        let port = serialport::new(path, config.baud_rate)
            .timeout(FILL_SLICE)
            .open()
            .map_err(|e| map_serial_error(path, e))?;
        let mut line = Line::new(port);

        for cmd in setup_commands(config.device_address) {
            line.command(&cmd)?;
        }
        let version = line
            .query("++ver", ADAPTER_REPLY_WAIT)?
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                BusError::TransportNotFound(format!("no relay adapter answered on {}", path))
            })?;

        let description = format!(
            "serial relay {} address {} ({})",
            path, config.device_address, version
        );
        debug!("Opened {}", description);

        Ok(Self {
            line,
            description,
            status: BusStatus::empty(),
            count: 0,
            timeouts: [TimeoutClass::T1s, TimeoutClass::T3s],
            pending: None,
            read_data: Vec::new(),
        })
    }

    fn slot(target: TimeoutTarget) -> usize {
        match target {
            TimeoutTarget::Controller => 0,
            TimeoutTarget::Device => 1,
        }
    }

    fn deadline(&self, target: TimeoutTarget) -> Option<Instant> {
        self.timeouts[Self::slot(target)]
            .duration()
            .map(|d| Instant::now() + d)
    }

    fn reply_wait(&self) -> Duration {
        self.timeouts[Self::slot(TimeoutTarget::Device)]
            .duration()
            .unwrap_or(ADAPTER_REPLY_WAIT)
            .max(ADAPTER_READ_TMO + FILL_SLICE)
    }

    fn start(request: AsyncRequest) -> Pending {
        match request {
            AsyncRequest::Write(data) => Pending::Write {
                line: frame_data(&data),
                sent: 0,
                len: data.len(),
            },
            AsyncRequest::Read { max, until } => Pending::Read {
                max,
                until,
                requested: false,
                end: false,
                data: BytesMut::with_capacity(max.min(64 * 1024)),
            },
        }
    }

    fn finish(&mut self, op: Pending) -> BusStatus {
        self.status = match op {
            Pending::Write { len, .. } => {
                self.count = len;
                BusStatus::CMPL
            }
            Pending::Read { data, end, .. } => {
                self.count = data.len();
                self.read_data = data.to_vec();
                if end {
                    BusStatus::CMPL | BusStatus::END
                } else {
                    BusStatus::CMPL
                }
            }
        };
        self.status
    }

    fn transfer(&mut self, request: AsyncRequest) -> Result<BusStatus> {
        if self.pending.is_some() {
            return Err(BusError::Unsupported(
                "an asynchronous operation is already in flight".into(),
            ));
        }
        let label = request.label();
        let mut op = Self::start(request);
        let deadline = self.deadline(TimeoutTarget::Device);

        match self.line.advance(&mut op, deadline) {
            Ok(true) => Ok(self.finish(op)),
            Ok(false) => {
                self.line.abort(&op);
                self.status = BusStatus::ERR | BusStatus::TIMO;
                Err(BusError::Timeout {
                    context: label.to_string(),
                })
            }
            Err(e) => {
                self.line.abort(&op);
                self.status = BusStatus::ERR;
                Err(e)
            }
        }
    }
}

impl Transport for Prologix {
    fn kind(&self) -> TransportKind {
        TransportKind::SerialRelay
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn status(&self) -> BusStatus {
        self.status
    }

    fn byte_count(&self) -> usize {
        self.count
    }

    fn set_error_flag(&mut self) {
        self.status.insert(BusStatus::ERR);
    }

    fn timeout(&mut self, target: TimeoutTarget) -> Result<TimeoutClass> {
        Ok(self.timeouts[Self::slot(target)])
    }

    fn set_timeout(&mut self, target: TimeoutTarget, class: TimeoutClass) -> Result<()> {
        self.timeouts[Self::slot(target)] = class;
        Ok(())
    }

    /// The adapter cannot address a bare listener; a serial poll that gets
    /// an answer proves the instrument is on the bus.
    fn listen_probe(&mut self) -> Result<bool> {
        let wait = self.reply_wait();
        Ok(self
            .line
            .query("++spoll", wait)?
            .is_some_and(|reply| parse_status_byte(&reply).is_ok()))
    }

    fn local(&mut self) -> BusStatus {
        match self.line.command("++loc") {
            Ok(()) => BusStatus::empty(),
            Err(e) => {
                warn!("Go-to-local failed on {}: {}", self.description, e);
                BusStatus::ERR
            }
        }
    }

    fn clear(&mut self) -> BusStatus {
        self.cancel();
        self.line.reset_input();
        self.status = match self.line.command("++clr") {
            Ok(()) => BusStatus::empty(),
            Err(e) => {
                warn!("Device clear failed on {}: {}", self.description, e);
                BusStatus::ERR
            }
        };
        self.status
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.transfer(AsyncRequest::Write(data.to_vec()))?;
        Ok(self.count)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.transfer(AsyncRequest::Read {
            max: buf.len(),
            until: None,
        })?;
        let data = std::mem::take(&mut self.read_data);
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn submit(&mut self, request: AsyncRequest) -> Result<()> {
        if self.pending.is_some() {
            return Err(BusError::Unsupported(
                "an asynchronous operation is already in flight".into(),
            ));
        }
        self.pending = Some(Self::start(request));
        Ok(())
    }

    fn poll_once(&mut self) -> BusStatus {
        let deadline = self.deadline(TimeoutTarget::Device);
        let result = match self.pending.as_mut() {
            Some(op) => self.line.advance(op, deadline),
            None => return self.status,
        };

        match result {
            Ok(true) => match self.pending.take() {
                Some(op) => self.finish(op),
                None => self.status,
            },
            Ok(false) => BusStatus::TIMO,
            Err(e) => {
                warn!("Transfer failed on {}: {}", self.description, e);
                if let Some(op) = self.pending.take() {
                    self.line.abort(&op);
                }
                self.status = BusStatus::ERR;
                self.status
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(op) = self.pending.take() {
            self.line.abort(&op);
        }
    }

    fn take_read(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_data)
    }

    fn wait_service_request(&mut self) -> BusStatus {
        let deadline = self.deadline(TimeoutTarget::Controller);
        loop {
            match self.line.query("++srq", ADAPTER_REPLY_WAIT) {
                Ok(Some(reply)) if reply == "1" => return BusStatus::SRQI,
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("Relay adapter on {} did not answer ++srq", self.description);
                    return BusStatus::ERR;
                }
                Err(e) => {
                    warn!("Service request poll failed on {}: {}", self.description, e);
                    return BusStatus::ERR;
                }
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return BusStatus::TIMO,
                Some(deadline) => std::thread::sleep(
                    deadline
                        .saturating_duration_since(Instant::now())
                        .min(SRQ_POLL_INTERVAL),
                ),
                None => std::thread::sleep(SRQ_POLL_INTERVAL),
            }
        }
    }

    fn serial_poll(&mut self) -> Result<u8> {
        let wait = self.reply_wait();
        match self.line.query("++spoll", wait)? {
            Some(reply) => parse_status_byte(&reply),
            None => Err(BusError::Timeout {
                context: "serial poll".to_string(),
            }),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_reserved_bytes() {
        assert_eq!(escape(b"SING;"), b"SING;".to_vec());
        assert_eq!(
            escape(&[b'+', b'\r', b'\n', ESC, b'A']),
            vec![ESC, b'+', ESC, b'\r', ESC, b'\n', ESC, ESC, b'A']
        );
    }

    #[test]
    fn test_frame_binary_block() {
        // A block body may contain a line feed; it must not end the line early
        let line = frame_data(&[b'#', b'A', 0x00, 0x0A]);
        assert_eq!(line, vec![b'#', b'A', 0x00, ESC, 0x0A, b'\n']);
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 2);
        assert_eq!(line.last(), Some(&b'\n'));
    }

    #[test]
    fn test_setup_addresses_instrument() {
        let cmds = setup_commands(16);
        assert_eq!(cmds.first().map(String::as_str), Some("++mode 1"));
        assert!(cmds.contains(&"++auto 0".to_string()));
        assert!(cmds.contains(&"++eot_enable 0".to_string()));
        assert_eq!(cmds.last().map(String::as_str), Some("++addr 16"));
    }

    #[test]
    fn test_parse_status_byte() {
        assert_eq!(parse_status_byte("96").unwrap(), 0x60);
        assert_eq!(parse_status_byte(" 0\r").unwrap(), 0);
        assert!(matches!(
            parse_status_byte("256"),
            Err(BusError::InvalidResponse(_))
        ));
        assert!(parse_status_byte("").is_err());
    }

    #[test]
    fn test_budget_slices() {
        assert_eq!(budget(None), Some(FILL_SLICE));
        assert_eq!(
            budget(Some(Instant::now() + Duration::from_secs(10))),
            Some(FILL_SLICE)
        );
        assert_eq!(budget(Some(Instant::now() - Duration::from_millis(1))), None);
    }

    #[test]
    fn test_map_serial_error() {
        let err = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        assert!(matches!(
            map_serial_error("/dev/ttyUSB0", err),
            BusError::TransportNotFound(_)
        ));

        let err = serialport::Error::new(
            serialport::ErrorKind::Io(ErrorKind::PermissionDenied),
            "denied",
        );
        match map_serial_error("/dev/ttyUSB0", err) {
            BusError::Io(e) => assert_eq!(e.kind(), ErrorKind::PermissionDenied),
            other => panic!("unexpected {:?}", other),
        }
    }
}

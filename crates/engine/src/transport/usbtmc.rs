//! USB Test & Measurement Class transport (USB488 subclass)
//!
//! Messages travel on the bulk pipes behind a 12-byte header; control
//! requests on endpoint zero handle clear, abort, status byte and go-to-local.
//! Service requests arrive on the interrupt pipe when the device has one and
//! are polled through `READ_STATUS_BYTE` otherwise.
//!
//! The asynchronous operations are state machines advanced by
//! [`Transport::poll_once`], one packet at a time, so a pending transfer never
//! blocks longer than the device timeout and can be aborted between packets.

use super::{AsyncRequest, Transport};
use protocol::{
    BusError, BusStatus, Result, TimeoutClass, TimeoutTarget, TransportConfig, TransportKind,
};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TMC_CLASS: u8 = 0xFE;
const TMC_SUBCLASS: u8 = 0x03;

const DEV_DEP_MSG_OUT: u8 = 1;
const DEV_DEP_MSG_IN: u8 = 2;

/// Bulk message header length
pub const HEADER_LEN: usize = 12;

const INITIATE_ABORT_BULK_OUT: u8 = 1;
const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
const INITIATE_ABORT_BULK_IN: u8 = 3;
const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
const INITIATE_CLEAR: u8 = 5;
const CHECK_CLEAR_STATUS: u8 = 6;
const GET_CAPABILITIES: u8 = 7;
const READ_STATUS_BYTE: u8 = 128;
const GO_TO_LOCAL: u8 = 161;

const STATUS_SUCCESS: u8 = 0x01;
const STATUS_PENDING: u8 = 0x02;

/// Class request, device-to-host, addressed to the interface
const REQUEST_TO_INTERFACE: u8 = 0xA1;
/// Class request, device-to-host, addressed to an endpoint
const REQUEST_TO_ENDPOINT: u8 = 0xA2;

/// First byte of an interrupt-IN service request notification
const SRQ_NOTIFY: u8 = 0x81;
const RQS_BIT: u8 = 0x40;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(30);

/// Next bulk transfer tag; tags run 1..=255
pub fn next_tag(tag: u8) -> u8 {
    tag.checked_add(1).unwrap_or(1)
}

fn header(msg_id: u8, tag: u8, size: u32, attributes: u8, term_char: u8) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0] = msg_id;
    h[1] = tag;
    h[2] = !tag;
    h[4..8].copy_from_slice(&size.to_le_bytes());
    h[8] = attributes;
    h[9] = term_char;
    h
}

/// Frame `data` as one complete `DEV_DEP_MSG_OUT` message, padded to four bytes
pub fn frame_out(tag: u8, data: &[u8]) -> Result<Vec<u8>> {
    let size = u32::try_from(data.len())
        .map_err(|_| BusError::InvalidRequest(format!("{} byte message", data.len())))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + data.len() + 3);
    frame.extend_from_slice(&header(DEV_DEP_MSG_OUT, tag, size, 0x01, 0));
    frame.extend_from_slice(data);
    frame.resize(frame.len().next_multiple_of(4), 0);
    Ok(frame)
}

/// `REQUEST_DEV_DEP_MSG_IN` asking for up to `max` bytes
pub fn frame_request_in(tag: u8, max: usize, until: Option<u8>) -> [u8; HEADER_LEN] {
    let size = u32::try_from(max).unwrap_or(u32::MAX);
    match until {
        Some(term) => header(DEV_DEP_MSG_IN, tag, size, 0x02, term),
        None => header(DEV_DEP_MSG_IN, tag, size, 0, 0),
    }
}

/// Transfer size and end-of-message flag of a `DEV_DEP_MSG_IN` header
pub fn parse_in_header(packet: &[u8], tag: u8) -> Result<(usize, bool)> {
    if packet.len() < HEADER_LEN {
        return Err(BusError::InvalidResponse(format!(
            "{} byte bulk-in packet is shorter than its header",
            packet.len()
        )));
    }
    if packet[0] != DEV_DEP_MSG_IN || packet[1] != tag || packet[2] != !tag {
        return Err(BusError::InvalidResponse(format!(
            "unexpected bulk-in header {:02x?} for tag {}",
            &packet[..4],
            tag
        )));
    }
    let size = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]) as usize;
    Ok((size, packet[8] & 0x01 != 0))
}

/// Map rusb errors into the bus error taxonomy
pub fn map_rusb_error(context: &str, err: rusb::Error) -> BusError {
    match err {
        rusb::Error::Timeout => BusError::Timeout {
            context: context.to_string(),
        },
        rusb::Error::NoDevice | rusb::Error::NotFound => {
            BusError::TransportNotFound(format!("{}: {}", context, err))
        }
        rusb::Error::Access => BusError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            format!("{}: {}", context, err),
        )),
        _ => BusError::Io(std::io::Error::other(format!("{}: {}", context, err))),
    }
}

/// Time left before `deadline` in rusb's convention
///
/// `Some(Duration::ZERO)` means wait forever (no deadline); `None` means the
/// deadline has passed.
fn slice(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        None => Some(Duration::ZERO),
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            (!left.is_zero()).then_some(left)
        }
    }
}

#[derive(Debug)]
enum Pending {
    Write {
        tag: u8,
        frame: Vec<u8>,
        sent: usize,
        len: usize,
    },
    Read {
        tag: u8,
        max: usize,
        until: Option<u8>,
        requested: bool,
        expected: Option<usize>,
        received: usize,
        eom: bool,
        data: Vec<u8>,
    },
}

impl Pending {
    fn tag(&self) -> u8 {
        match self {
            Pending::Write { tag, .. } | Pending::Read { tag, .. } => *tag,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Endpoints {
    interface: u8,
    bulk_out: u8,
    bulk_in: u8,
    interrupt_in: Option<u8>,
    max_packet: usize,
}

/// Find the USBTMC interface of `device`, honouring the id filters
fn probe(device: &Device<Context>, config: &TransportConfig) -> Option<Endpoints> {
    let descriptor = device.device_descriptor().ok()?;
    if config
        .usb_vendor_id
        .is_some_and(|vid| vid != descriptor.vendor_id())
        || config
            .usb_product_id
            .is_some_and(|pid| pid != descriptor.product_id())
    {
        return None;
    }

    let active = device.active_config_descriptor().ok()?;
    for interface in active.interfaces() {
        for alt in interface.descriptors() {
            if alt.class_code() != TMC_CLASS || alt.sub_class_code() != TMC_SUBCLASS {
                continue;
            }

            let mut bulk_out = None;
            let mut bulk_in = None;
            let mut interrupt_in = None;
            let mut max_packet = 64;
            for endpoint in alt.endpoint_descriptors() {
                match (endpoint.transfer_type(), endpoint.direction()) {
                    (TransferType::Bulk, Direction::Out) => {
                        bulk_out = Some(endpoint.address());
                        max_packet = usize::from(endpoint.max_packet_size());
                    }
                    (TransferType::Bulk, Direction::In) => bulk_in = Some(endpoint.address()),
                    (TransferType::Interrupt, Direction::In) => {
                        interrupt_in = Some(endpoint.address())
                    }
                    _ => {}
                }
            }

            if let (Some(bulk_out), Some(bulk_in)) = (bulk_out, bulk_in) {
                return Some(Endpoints {
                    interface: alt.interface_number(),
                    bulk_out,
                    bulk_in,
                    interrupt_in,
                    max_packet: max_packet.max(HEADER_LEN),
                });
            }
        }
    }
    None
}

/// Claimed interface of an open device
struct Link {
    handle: DeviceHandle<Context>,
    endpoints: Endpoints,
    kernel_detached: bool,
    term_char: bool,
}

impl Link {
    fn open(device: &Device<Context>, endpoints: Endpoints) -> Result<Self> {
        let mut handle = device
            .open()
            .map_err(|e| map_rusb_error("open USB device", e))?;
        let interface = endpoints.interface;

        let kernel_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                handle
                    .detach_kernel_driver(interface)
                    .map_err(|e| map_rusb_error("detach kernel driver", e))?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            if kernel_detached && let Err(e) = handle.attach_kernel_driver(interface) {
                debug!("Could not reattach kernel driver: {}", e);
            }
            return Err(map_rusb_error("claim interface", e));
        }

        let mut link = Self {
            handle,
            endpoints,
            kernel_detached,
            term_char: false,
        };
        link.term_char = link
            .capabilities()
            .map(|caps| caps.get(5).is_some_and(|b| b & 0x01 != 0))
            .unwrap_or(false);
        Ok(link)
    }

    fn control_in(&self, request_type: u8, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, CONTROL_TIMEOUT)
            .map_err(|e| map_rusb_error("control request", e))?;
        buf.truncate(n);
        Ok(buf)
    }

    fn interface_index(&self) -> u16 {
        u16::from(self.endpoints.interface)
    }

    fn capabilities(&self) -> Result<Vec<u8>> {
        let caps = self.control_in(
            REQUEST_TO_INTERFACE,
            GET_CAPABILITIES,
            0,
            self.interface_index(),
            0x18,
        )?;
        if caps.first() != Some(&STATUS_SUCCESS) {
            return Err(BusError::InvalidResponse(format!(
                "GET_CAPABILITIES status {:02x?}",
                caps.first()
            )));
        }
        Ok(caps)
    }

    /// Poll a class request until its status leaves PENDING
    fn await_status(&self, request_type: u8, request: u8, index: u16, len: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + CONTROL_TIMEOUT;
        loop {
            let reply = self.control_in(request_type, request, 0, index, len)?;
            if reply.first() != Some(&STATUS_PENDING) || Instant::now() >= deadline {
                return Ok(reply);
            }
            if reply.get(1).is_some_and(|b| b & 0x01 != 0) {
                self.drain_bulk_in();
            }
            std::thread::sleep(STATUS_POLL_INTERVAL);
        }
    }

    fn drain_bulk_in(&self) {
        let mut packet = vec![0u8; self.endpoints.max_packet];
        while let Ok(n) = self.handle.read_bulk(
            self.endpoints.bulk_in,
            &mut packet,
            Duration::from_millis(50),
        ) {
            if n < packet.len() {
                break;
            }
        }
    }

    /// Move `op` forward until it completes (`true`) or `deadline` passes
    fn advance(&self, op: &mut Pending, deadline: Option<Instant>) -> Result<bool> {
        let max_packet = self.endpoints.max_packet;
        match op {
            Pending::Write { frame, sent, .. } => loop {
                if *sent >= frame.len() {
                    return Ok(true);
                }
                let Some(timeout) = slice(deadline) else {
                    return Ok(false);
                };
                let end = (*sent + max_packet).min(frame.len());
                match self
                    .handle
                    .write_bulk(self.endpoints.bulk_out, &frame[*sent..end], timeout)
                {
                    Ok(n) => *sent += n,
                    Err(rusb::Error::Timeout) => return Ok(false),
                    Err(e) => return Err(map_rusb_error("bulk write", e)),
                }
            },
            Pending::Read {
                tag,
                max,
                until,
                requested,
                expected,
                received,
                eom,
                data,
            } => loop {
                if !*requested {
                    let Some(timeout) = slice(deadline) else {
                        return Ok(false);
                    };
                    let term = until.filter(|_| self.term_char);
                    let request = frame_request_in(*tag, *max - data.len(), term);
                    match self
                        .handle
                        .write_bulk(self.endpoints.bulk_out, &request, timeout)
                    {
                        Ok(_) => {
                            *requested = true;
                            *expected = None;
                            *received = 0;
                        }
                        Err(rusb::Error::Timeout) => return Ok(false),
                        Err(e) => return Err(map_rusb_error("read request", e)),
                    }
                }

                let Some(timeout) = slice(deadline) else {
                    return Ok(false);
                };
                let mut packet = vec![0u8; max_packet];
                let n = match self
                    .handle
                    .read_bulk(self.endpoints.bulk_in, &mut packet, timeout)
                {
                    Ok(n) => n,
                    Err(rusb::Error::Timeout) => return Ok(false),
                    Err(e) => return Err(map_rusb_error("bulk read", e)),
                };

                let mut payload = &packet[..n];
                let want = match *expected {
                    Some(want) => want,
                    None => {
                        let (size, end) = parse_in_header(payload, *tag)?;
                        *expected = Some(size);
                        *eom = end;
                        payload = &payload[HEADER_LEN..];
                        size
                    }
                };

                let take = want.saturating_sub(*received).min(payload.len());
                data.extend_from_slice(&payload[..take]);
                *received += take;

                if *received >= want {
                    let terminated = until.is_some_and(|t| data.last() == Some(&t));
                    if *eom || terminated || data.len() >= *max {
                        return Ok(true);
                    }
                    // Message continues in another transfer
                    *tag = next_tag(*tag);
                    *requested = false;
                }
            },
        }
    }

    fn abort(&mut self, op: &Pending) {
        let tag = u16::from(op.tag());
        let result = match op {
            Pending::Write { .. } => self.abort_bulk_out(tag),
            Pending::Read { .. } => self.abort_bulk_in(tag),
        };
        if let Err(e) = result {
            debug!("Bulk abort incomplete: {}", e);
        }
    }

    fn abort_bulk_out(&mut self, tag: u16) -> Result<()> {
        let endpoint = u16::from(self.endpoints.bulk_out);
        let reply = self.control_in(REQUEST_TO_ENDPOINT, INITIATE_ABORT_BULK_OUT, tag, endpoint, 2)?;
        if reply.first() == Some(&STATUS_SUCCESS) {
            self.await_status(REQUEST_TO_ENDPOINT, CHECK_ABORT_BULK_OUT_STATUS, endpoint, 8)?;
        }
        self.handle
            .clear_halt(self.endpoints.bulk_out)
            .map_err(|e| map_rusb_error("clear halt", e))
    }

    fn abort_bulk_in(&mut self, tag: u16) -> Result<()> {
        let endpoint = u16::from(self.endpoints.bulk_in);
        let reply = self.control_in(REQUEST_TO_ENDPOINT, INITIATE_ABORT_BULK_IN, tag, endpoint, 2)?;
        if reply.first() == Some(&STATUS_SUCCESS) {
            self.drain_bulk_in();
            self.await_status(REQUEST_TO_ENDPOINT, CHECK_ABORT_BULK_IN_STATUS, endpoint, 8)?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let index = self.interface_index();
        let reply = self.control_in(REQUEST_TO_INTERFACE, INITIATE_CLEAR, 0, index, 1)?;
        if reply.first() != Some(&STATUS_SUCCESS) {
            return Err(BusError::InvalidResponse(format!(
                "INITIATE_CLEAR status {:02x?}",
                reply.first()
            )));
        }
        self.await_status(REQUEST_TO_INTERFACE, CHECK_CLEAR_STATUS, index, 2)?;
        self.handle
            .clear_halt(self.endpoints.bulk_out)
            .map_err(|e| map_rusb_error("clear halt", e))
    }

    fn read_status_byte(&self, tag: u8, deadline: Option<Instant>) -> Result<u8> {
        let reply = self.control_in(
            REQUEST_TO_INTERFACE,
            READ_STATUS_BYTE,
            u16::from(tag),
            self.interface_index(),
            3,
        )?;
        if reply.len() < 3 || reply[0] != STATUS_SUCCESS {
            return Err(BusError::InvalidResponse(format!(
                "READ_STATUS_BYTE reply {:02x?}",
                reply
            )));
        }

        let Some(endpoint) = self.endpoints.interrupt_in else {
            return Ok(reply[2]);
        };

        // With an interrupt pipe the status byte arrives there, tagged
        let mut notify = [0u8; 2];
        loop {
            let timeout = slice(deadline).ok_or_else(|| BusError::Timeout {
                context: "serial poll".to_string(),
            })?;
            let n = self
                .handle
                .read_interrupt(endpoint, &mut notify, timeout)
                .map_err(|e| map_rusb_error("serial poll", e))?;
            if n >= 2 && notify[0] == 0x80 | tag {
                return Ok(notify[1]);
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let interface = self.endpoints.interface;
        let released = self
            .handle
            .release_interface(interface)
            .map_err(|e| map_rusb_error("release interface", e));
        if self.kernel_detached {
            match self.handle.attach_kernel_driver(interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                Err(e) => debug!("Could not reattach kernel driver: {}", e),
            }
            self.kernel_detached = false;
        }
        released
    }
}

/// Instrument behind a USBTMC/USB488 interface
pub struct UsbTmc {
    link: Link,
    description: String,
    status: BusStatus,
    count: usize,
    tag: u8,
    status_tag: u8,
    timeouts: [TimeoutClass; 2],
    pending: Option<Pending>,
    read_data: Vec<u8>,
    srq_stb: Option<u8>,
    closed: bool,
}

impl UsbTmc {
    /// Open the `controller_index`th matching USBTMC device
    pub fn open(config: &TransportConfig) -> Result<Self> {
        let context = Context::new().map_err(|e| map_rusb_error("USB context", e))?;
        let devices = context
            .devices()
            .map_err(|e| map_rusb_error("enumerate USB devices", e))?;

        let (device, endpoints) = devices
            .iter()
            .filter_map(|device| probe(&device, config).map(|found| (device, found)))
            .nth(config.controller_index as usize)
            .ok_or_else(|| BusError::TransportNotFound(config.describe()))?;

        let link = Link::open(&device, endpoints)?;
        let ids = device
            .device_descriptor()
            .map(|d| format!("{:04x}:{:04x}", d.vendor_id(), d.product_id()))
            .unwrap_or_else(|_| "????:????".to_string());
        let description = format!(
            "USB class device {} (bus {} address {})",
            ids,
            device.bus_number(),
            device.address()
        );
        debug!(
            "Opened {} interface {} (interrupt pipe: {})",
            description,
            endpoints.interface,
            endpoints.interrupt_in.is_some()
        );

        Ok(Self {
            link,
            description,
            status: BusStatus::empty(),
            count: 0,
            tag: 1,
            status_tag: 2,
            timeouts: [TimeoutClass::T1s, TimeoutClass::T3s],
            pending: None,
            read_data: Vec::new(),
            srq_stb: None,
            closed: false,
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

    fn take_tag(&mut self) -> u8 {
        let tag = self.tag;
        self.tag = next_tag(tag);
        tag
    }

    fn take_status_tag(&mut self) -> u8 {
        let tag = self.status_tag;
        self.status_tag = if tag >= 127 { 2 } else { tag + 1 };
        tag
    }

    fn start(&mut self, request: AsyncRequest) -> Result<Pending> {
        let tag = self.take_tag();
        Ok(match request {
            AsyncRequest::Write(data) => Pending::Write {
                tag,
                frame: frame_out(tag, &data)?,
                sent: 0,
                len: data.len(),
            },
            AsyncRequest::Read { max, until } => Pending::Read {
                tag,
                max,
                until,
                requested: false,
                expected: None,
                received: 0,
                eom: false,
                data: Vec::with_capacity(max.min(64 * 1024)),
            },
        })
    }

    /// Record a finished operation and return its status word
    fn finish(&mut self, op: Pending) -> BusStatus {
        self.tag = next_tag(op.tag());
        self.status = match op {
            Pending::Write { len, .. } => {
                self.count = len;
                BusStatus::CMPL
            }
            Pending::Read {
                data, eom, until, ..
            } => {
                self.count = data.len();
                let terminated = until.is_some_and(|t| data.last() == Some(&t));
                self.read_data = data;
                if eom || terminated {
                    BusStatus::CMPL | BusStatus::END
                } else {
                    BusStatus::CMPL
                }
            }
        };
        self.status
    }

    /// Run `request` to completion within the device timeout
    fn transfer(&mut self, request: AsyncRequest) -> Result<BusStatus> {
        if self.pending.is_some() {
            return Err(BusError::Unsupported(
                "an asynchronous operation is already in flight".into(),
            ));
        }
        let label = request.label();
        let mut op = self.start(request)?;
        let deadline = self.deadline(TimeoutTarget::Device);

        match self.link.advance(&mut op, deadline) {
            Ok(true) => Ok(self.finish(op)),
            Ok(false) => {
                self.link.abort(&op);
                self.status = BusStatus::ERR | BusStatus::TIMO;
                Err(BusError::Timeout {
                    context: label.to_string(),
                })
            }
            Err(e) => {
                self.link.abort(&op);
                self.status = BusStatus::ERR;
                Err(e)
            }
        }
    }
}

impl Transport for UsbTmc {
    fn kind(&self) -> TransportKind {
        TransportKind::UsbClass
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

    fn listen_probe(&mut self) -> Result<bool> {
        match self.link.capabilities() {
            Ok(_) => Ok(true),
            Err(BusError::Timeout { .. }) | Err(BusError::InvalidResponse(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn local(&mut self) -> BusStatus {
        let reply = self.link.control_in(
            REQUEST_TO_INTERFACE,
            GO_TO_LOCAL,
            0,
            self.link.interface_index(),
            1,
        );
        match reply {
            Ok(reply) if reply.first() == Some(&STATUS_SUCCESS) => BusStatus::empty(),
            Ok(reply) => {
                warn!("GO_TO_LOCAL refused by {} ({:02x?})", self.description, reply);
                BusStatus::ERR
            }
            Err(e) => {
                warn!("GO_TO_LOCAL failed on {}: {}", self.description, e);
                BusStatus::ERR
            }
        }
    }

    fn clear(&mut self) -> BusStatus {
        self.cancel();
        self.srq_stb = None;
        self.status = match self.link.clear() {
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
        let op = self.start(request)?;
        self.pending = Some(op);
        Ok(())
    }

    fn poll_once(&mut self) -> BusStatus {
        let deadline = self.deadline(TimeoutTarget::Device);
        let result = match self.pending.as_mut() {
            Some(op) => self.link.advance(op, deadline),
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
                    self.link.abort(&op);
                }
                self.status = BusStatus::ERR;
                self.status
            }
        }
    }

    fn cancel(&mut self) {
        if let Some(op) = self.pending.take() {
            debug!("Aborting bulk transfer tag {}", op.tag());
            self.link.abort(&op);
        }
    }

    fn take_read(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.read_data)
    }

    fn wait_service_request(&mut self) -> BusStatus {
        if self.srq_stb.is_some() {
            return BusStatus::SRQI;
        }
        let deadline = self.deadline(TimeoutTarget::Controller);

        if let Some(endpoint) = self.link.endpoints.interrupt_in {
            let mut notify = [0u8; 2];
            loop {
                let Some(timeout) = slice(deadline) else {
                    return BusStatus::TIMO;
                };
                match self.link.handle.read_interrupt(endpoint, &mut notify, timeout) {
                    Ok(n) if n >= 2 && notify[0] == SRQ_NOTIFY => {
                        self.srq_stb = Some(notify[1]);
                        return BusStatus::SRQI;
                    }
                    Ok(_) => continue,
                    Err(rusb::Error::Timeout) => return BusStatus::TIMO,
                    Err(e) => {
                        warn!("Interrupt pipe failed on {}: {}", self.description, e);
                        return BusStatus::ERR;
                    }
                }
            }
        }

        loop {
            let tag = self.take_status_tag();
            match self.link.read_status_byte(tag, deadline) {
                Ok(stb) if stb & RQS_BIT != 0 => {
                    self.srq_stb = Some(stb);
                    return BusStatus::SRQI;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Status byte poll failed on {}: {}", self.description, e);
                    return BusStatus::ERR;
                }
            }
            match slice(deadline) {
                None => return BusStatus::TIMO,
                Some(left) if left.is_zero() => std::thread::sleep(STATUS_POLL_INTERVAL),
                Some(left) => std::thread::sleep(left.min(STATUS_POLL_INTERVAL)),
            }
        }
    }

    fn serial_poll(&mut self) -> Result<u8> {
        if let Some(stb) = self.srq_stb.take() {
            return Ok(stb);
        }
        let tag = self.take_status_tag();
        let deadline = self.deadline(TimeoutTarget::Device);
        self.link.read_status_byte(tag, deadline)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel();
        self.link.close()
    }
}

impl Drop for UsbTmc {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Closing {} on drop: {}", self.description, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_wraps_past_zero() {
        assert_eq!(next_tag(1), 2);
        assert_eq!(next_tag(254), 255);
        assert_eq!(next_tag(255), 1);
    }

    #[test]
    fn test_frame_out_header_and_padding() {
        let frame = frame_out(7, b"OPC;").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 4);
        assert_eq!(&frame[..4], &[DEV_DEP_MSG_OUT, 7, !7u8, 0]);
        assert_eq!(&frame[4..8], &4u32.to_le_bytes());
        assert_eq!(frame[8], 0x01, "end of message");
        assert_eq!(&frame[HEADER_LEN..], b"OPC;");

        let frame = frame_out(8, b"SING;").unwrap();
        assert_eq!(frame.len(), HEADER_LEN + 8);
        assert_eq!(&frame[4..8], &5u32.to_le_bytes());
        assert_eq!(&frame[HEADER_LEN + 5..], &[0, 0, 0]);
    }

    #[test]
    fn test_request_in_term_char() {
        let plain = frame_request_in(3, 256, None);
        assert_eq!(plain[0], DEV_DEP_MSG_IN);
        assert_eq!(&plain[4..8], &256u32.to_le_bytes());
        assert_eq!(plain[8], 0);

        let term = frame_request_in(3, 256, Some(b'\n'));
        assert_eq!(term[8], 0x02);
        assert_eq!(term[9], b'\n');
    }

    #[test]
    fn test_parse_in_header() {
        let mut packet = header(DEV_DEP_MSG_IN, 9, 20, 0x01, 0).to_vec();
        packet.extend_from_slice(b"HEWLETT PACKARD,8753");
        assert_eq!(parse_in_header(&packet, 9).unwrap(), (20, true));

        let partial = header(DEV_DEP_MSG_IN, 9, 20, 0, 0);
        assert_eq!(parse_in_header(&partial, 9).unwrap(), (20, false));
    }

    #[test]
    fn test_parse_in_header_rejects_mismatch() {
        let packet = header(DEV_DEP_MSG_IN, 9, 20, 0x01, 0);
        assert!(matches!(
            parse_in_header(&packet, 10),
            Err(BusError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_in_header(&packet[..8], 9),
            Err(BusError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_map_rusb_error() {
        assert!(matches!(
            map_rusb_error("bulk read", rusb::Error::Timeout),
            BusError::Timeout { .. }
        ));
        assert!(matches!(
            map_rusb_error("open", rusb::Error::NoDevice),
            BusError::TransportNotFound(_)
        ));
        match map_rusb_error("open", rusb::Error::Access) {
            BusError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::PermissionDenied),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_slice_conventions() {
        assert_eq!(slice(None), Some(Duration::ZERO));
        assert!(slice(Some(Instant::now() + Duration::from_secs(5))).is_some_and(|d| !d.is_zero()));
        assert_eq!(slice(Some(Instant::now() - Duration::from_millis(1))), None);
    }
}

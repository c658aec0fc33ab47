//! Simulated instrument
//!
//! A network analyzer that understands the mnemonics used by the command
//! layer and behaves like a real device on the bus: replies are queued until
//! read, `OPC`-prefixed commands raise a service request after a configurable
//! number of polls, and asynchronous operations can be made to hang. Used by
//! the test suites and by `bench-engine --simulate`.

use super::{AsyncRequest, Connector, Transport};
use common::test_utils::{MOCK_IDENTITY, create_mock_state, create_mock_trace_points};
use protocol::{
    BLOCK_HEADER_LEN, BusError, BusStatus, CalType, Result, TimeoutClass, TimeoutTarget,
    TransportConfig, TransportKind, encode_block, encode_form3, parse_block_header,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

/// Status byte reported once an armed operation completed (RQS | ESB)
const COMPLETION_STB: u8 = 0x60;

/// Longest real-time pause per poll
const MAX_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
enum BlockTarget {
    LearnString,
    CalArray(usize),
}

#[derive(Debug)]
struct SimState {
    // Behaviour knobs
    present: bool,
    responsive: bool,
    hang_ops: u32,
    sweep_polls: u32,
    event_status: u8,
    foreign_srq: bool,
    real_time: bool,
    rules: Vec<(String, usize, u8)>,

    // Instrument memory
    learn_string: Vec<u8>,
    cal_type: CalType,
    cal_arrays: Vec<Vec<u8>>,
    points: usize,
    start_hz: f64,
    stop_hz: f64,
    channel: u8,

    // Bus state
    status: BusStatus,
    count: usize,
    timeouts: [TimeoutClass; 2],
    output: VecDeque<u8>,
    in_flight: Option<AsyncRequest>,
    hanging: bool,
    read_buf: Vec<u8>,
    srq_countdown: Option<u32>,
    foreign_pending: bool,
    block_target: Option<BlockTarget>,

    // Observations
    traffic: Vec<String>,
    polls: u64,
    clears: u32,
    locals: u32,
    closes: u32,
    closed: bool,
}

impl Default for SimState {
    fn default() -> Self {
        let state = create_mock_state(CalType::S11OnePort);
        Self {
            present: true,
            responsive: true,
            hang_ops: 0,
            sweep_polls: 3,
            event_status: 0x01,
            foreign_srq: false,
            real_time: false,
            rules: Vec::new(),
            learn_string: state.learn_string,
            cal_type: state.cal_type,
            cal_arrays: state.cal_arrays,
            points: 201,
            start_hz: 30e3,
            stop_hz: 6e9,
            channel: 1,
            status: BusStatus::empty(),
            count: 0,
            timeouts: [TimeoutClass::T1s, TimeoutClass::T10s],
            output: VecDeque::new(),
            in_flight: None,
            hanging: false,
            read_buf: Vec::new(),
            srq_countdown: None,
            foreign_pending: false,
            block_target: None,
            traffic: Vec::new(),
            polls: 0,
            clears: 0,
            locals: 0,
            closes: 0,
            closed: false,
        }
    }
}

fn slot(target: TimeoutTarget) -> usize {
    match target {
        TimeoutTarget::Controller => 0,
        TimeoutTarget::Device => 1,
    }
}

fn array_index(token: &str, prefix: &str) -> Option<usize> {
    token
        .strip_prefix(prefix)?
        .parse::<usize>()
        .ok()
        .filter(|n| *n >= 1)
        .map(|n| n - 1)
}

impl SimState {
    fn pause(&self, target: TimeoutTarget) -> Option<Duration> {
        if !self.real_time {
            return None;
        }
        let class = self.timeouts[slot(target)];
        Some(
            class
                .duration()
                .unwrap_or(Duration::from_millis(30))
                .min(MAX_PAUSE),
        )
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(BusError::TransportNotFound("simulated instrument closed".into()));
        }
        Ok(())
    }

    fn respond_line(&mut self, line: impl AsRef<str>) {
        self.output.extend(line.as_ref().bytes());
        self.output.push_back(b'\n');
    }

    fn respond_block(&mut self, body: &[u8]) {
        match encode_block(body) {
            Ok(framed) => self.output.extend(framed),
            Err(e) => debug!("Simulated block dropped: {}", e),
        }
    }

    /// Run a `;`-separated command string, including embedded `#A` blocks
    fn execute(&mut self, data: &[u8]) {
        self.traffic.push(String::from_utf8_lossy(data).into_owned());

        let mut armed = false;
        let mut i = 0;
        while i < data.len() {
            if data[i..].starts_with(b"#A") {
                let Ok(len) = parse_block_header(&data[i..]) else {
                    debug!("Truncated block header in simulated input");
                    break;
                };
                let start = i + BLOCK_HEADER_LEN;
                let end = (start + len).min(data.len());
                self.accept_block(data[start..end].to_vec());
                i = end;
                continue;
            }

            let end = data[i..]
                .iter()
                .position(|b| *b == b';' || *b == b'#')
                .map_or(data.len(), |p| i + p);
            let token = String::from_utf8_lossy(&data[i..end])
                .trim()
                .to_ascii_uppercase();
            i = if data.get(end) == Some(&b';') {
                end + 1
            } else {
                end
            };

            if token.is_empty() {
                continue;
            }
            if token == "OPC" {
                armed = true;
                continue;
            }
            self.command(&token);
            if armed {
                self.srq_countdown = Some(self.sweep_polls);
                self.foreign_pending = self.foreign_srq;
                armed = false;
            }
        }
    }

    fn command(&mut self, token: &str) {
        trace!("Simulated instrument executing {}", token);
        match token {
            "OUTPIDEN" => self.respond_line(MOCK_IDENTITY),
            "ESR?" => self.respond_line(self.event_status.to_string()),
            "CALI?" => self.respond_line(format!("\"{}\"", self.cal_type.mnemonic())),
            "POIN?" => self.respond_line(self.points.to_string()),
            "STAR?" => self.respond_line(format!("{:E}", self.start_hz)),
            "STOP?" => self.respond_line(format!("{:E}", self.stop_hz)),
            "OUTPFORM" | "OUTPDATA" => {
                let body = encode_form3(&create_mock_trace_points(self.points));
                self.respond_block(&body);
            }
            "OUTPLEAS" => {
                let body = self.learn_string.clone();
                self.respond_block(&body);
            }
            "INPULEAS" => self.block_target = Some(BlockTarget::LearnString),
            t if t.starts_with("OUTPCALC") => {
                let body = array_index(t, "OUTPCALC")
                    .and_then(|n| self.cal_arrays.get(n).cloned())
                    .unwrap_or_default();
                self.respond_block(&body);
            }
            t if t.starts_with("INPUCALC") => {
                self.block_target = array_index(t, "INPUCALC").map(BlockTarget::CalArray);
            }
            t if t.starts_with("CHAN") => {
                if let Ok(channel) = t[4..].parse() {
                    self.channel = channel;
                }
            }
            t => {
                if let Some(cal) = CalType::from_mnemonic(t) {
                    self.cal_type = cal;
                    self.cal_arrays = vec![Vec::new(); cal.array_count()];
                }
            }
        }

        for (mnemonic, offset, mask) in &self.rules {
            if mnemonic.as_str() == token
                && let Some(byte) = self.learn_string.get_mut(*offset)
            {
                *byte ^= mask;
            }
        }
    }

    fn accept_block(&mut self, body: Vec<u8>) {
        match self.block_target.take() {
            Some(BlockTarget::LearnString) => self.learn_string = body,
            Some(BlockTarget::CalArray(n)) => {
                if n >= self.cal_arrays.len() {
                    self.cal_arrays.resize(n + 1, Vec::new());
                }
                self.cal_arrays[n] = body;
            }
            None => debug!("Simulated instrument ignored a {} byte block", body.len()),
        }
    }

    fn complete_read(&mut self, max: usize, until: Option<u8>) -> bool {
        if self.output.is_empty() {
            return false;
        }
        let mut data = Vec::new();
        let mut terminated = false;
        while data.len() < max {
            let Some(byte) = self.output.pop_front() else {
                break;
            };
            data.push(byte);
            if until == Some(byte) {
                terminated = true;
                break;
            }
        }
        self.status = BusStatus::CMPL;
        if terminated || self.output.is_empty() {
            self.status.insert(BusStatus::END);
        }
        self.count = data.len();
        self.read_buf = data;
        true
    }
}

/// Handle to a simulated instrument; clones share the same instrument
#[derive(Debug, Clone, Default)]
pub struct SimInstrument {
    state: Arc<Mutex<SimState>>,
}

impl SimInstrument {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the connector can locate the instrument
    pub fn set_present(&self, present: bool) {
        self.lock().present = present;
    }

    /// An unresponsive instrument fails the liveness check and never
    /// completes transfers
    pub fn set_responsive(&self, responsive: bool) {
        self.lock().responsive = responsive;
    }

    /// Make the next `count` asynchronous operations hang
    pub fn hang_next(&self, count: u32) {
        self.lock().hang_ops = count;
    }

    /// Controller-timeout polls between an armed command and its SRQ
    pub fn set_sweep_polls(&self, polls: u32) {
        self.lock().sweep_polls = polls;
    }

    /// Event status register value returned by `ESR?`
    pub fn set_event_status(&self, value: u8) {
        self.lock().event_status = value;
    }

    /// Assert one service request from another device before ours
    pub fn set_foreign_srq(&self, enabled: bool) {
        self.lock().foreign_srq = enabled;
    }

    /// Sleep for the programmed timeout on every poll
    pub fn set_real_time(&self, enabled: bool) {
        self.lock().real_time = enabled;
    }

    pub fn set_points(&self, points: usize) {
        self.lock().points = points;
    }

    pub fn set_learn_string(&self, learn_string: Vec<u8>) {
        self.lock().learn_string = learn_string;
    }

    pub fn learn_string(&self) -> Vec<u8> {
        self.lock().learn_string.clone()
    }

    pub fn set_calibration(&self, cal_type: CalType, arrays: Vec<Vec<u8>>) {
        let mut st = self.lock();
        st.cal_type = cal_type;
        st.cal_arrays = arrays;
    }

    pub fn calibration(&self) -> (CalType, Vec<Vec<u8>>) {
        let st = self.lock();
        (st.cal_type, st.cal_arrays.clone())
    }

    /// XOR `mask` into the learn string at `offset` whenever `mnemonic` runs
    pub fn on_command(&self, mnemonic: &str, offset: usize, mask: u8) {
        self.lock()
            .rules
            .push((mnemonic.to_ascii_uppercase(), offset, mask));
    }

    pub fn timeout(&self, target: TimeoutTarget) -> TimeoutClass {
        self.lock().timeouts[slot(target)]
    }

    pub fn set_timeout(&self, target: TimeoutTarget, class: TimeoutClass) {
        self.lock().timeouts[slot(target)] = class;
    }

    /// Every command string written to the instrument, oldest first
    pub fn traffic(&self) -> Vec<String> {
        self.lock().traffic.clone()
    }

    pub fn poll_count(&self) -> u64 {
        self.lock().polls
    }

    pub fn clear_count(&self) -> u32 {
        self.lock().clears
    }

    pub fn local_count(&self) -> u32 {
        self.lock().locals
    }

    pub fn close_count(&self) -> u32 {
        self.lock().closes
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Transport to a [`SimInstrument`]
#[derive(Debug)]
pub struct SimTransport {
    sim: SimInstrument,
    kind: TransportKind,
    description: String,
}

impl Transport for SimTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn status(&self) -> BusStatus {
        self.sim.lock().status
    }

    fn byte_count(&self) -> usize {
        self.sim.lock().count
    }

    fn set_error_flag(&mut self) {
        self.sim.lock().status.insert(BusStatus::ERR);
    }

    fn timeout(&mut self, target: TimeoutTarget) -> Result<TimeoutClass> {
        let st = self.sim.lock();
        st.check_open()?;
        Ok(st.timeouts[slot(target)])
    }

    fn set_timeout(&mut self, target: TimeoutTarget, class: TimeoutClass) -> Result<()> {
        let mut st = self.sim.lock();
        st.check_open()?;
        st.timeouts[slot(target)] = class;
        Ok(())
    }

    fn listen_probe(&mut self) -> Result<bool> {
        let st = self.sim.lock();
        st.check_open()?;
        Ok(st.responsive)
    }

    fn local(&mut self) -> BusStatus {
        let mut st = self.sim.lock();
        st.locals += 1;
        st.status
    }

    fn clear(&mut self) -> BusStatus {
        let mut st = self.sim.lock();
        st.clears += 1;
        st.output.clear();
        st.in_flight = None;
        st.hanging = false;
        st.srq_countdown = None;
        st.foreign_pending = false;
        st.block_target = None;
        st.status = BusStatus::CMPL;
        st.status
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut st = self.sim.lock();
        st.check_open()?;
        if !st.responsive {
            st.status = BusStatus::ERR | BusStatus::TIMO;
            return Err(BusError::bus("write", st.status));
        }
        st.execute(data);
        st.count = data.len();
        st.status = BusStatus::CMPL;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.sim.lock();
        st.check_open()?;
        if st.output.is_empty() {
            st.status = BusStatus::ERR | BusStatus::TIMO;
            return Err(BusError::bus("read", st.status));
        }
        let n = buf.len().min(st.output.len());
        for (dst, byte) in buf.iter_mut().zip(st.output.drain(..n)) {
            *dst = byte;
        }
        st.count = n;
        st.status = BusStatus::CMPL;
        if st.output.is_empty() {
            st.status.insert(BusStatus::END);
        }
        Ok(n)
    }

    fn submit(&mut self, request: AsyncRequest) -> Result<()> {
        let mut st = self.sim.lock();
        st.check_open()?;
        if st.in_flight.is_some() {
            return Err(BusError::Unsupported(
                "an asynchronous operation is already in flight".into(),
            ));
        }
        if st.hang_ops > 0 || !st.responsive {
            st.hang_ops = st.hang_ops.saturating_sub(1);
            st.hanging = true;
            debug!("Simulated {} will hang", request.label());
        }
        st.in_flight = Some(request);
        st.status = BusStatus::empty();
        st.count = 0;
        Ok(())
    }

    fn poll_once(&mut self) -> BusStatus {
        let pause = {
            let mut st = self.sim.lock();
            st.polls += 1;
            st.pause(TimeoutTarget::Device)
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }

        let mut st = self.sim.lock();
        if st.hanging {
            st.status = BusStatus::TIMO;
            return st.status;
        }
        match st.in_flight.take() {
            None => {}
            Some(AsyncRequest::Write(data)) => {
                st.execute(&data);
                st.count = data.len();
                st.status = BusStatus::CMPL;
            }
            Some(AsyncRequest::Read { max, until }) => {
                if !st.complete_read(max, until) {
                    st.in_flight = Some(AsyncRequest::Read { max, until });
                    st.status = BusStatus::TIMO;
                }
            }
        }
        st.status
    }

    fn cancel(&mut self) {
        let mut st = self.sim.lock();
        if st.in_flight.take().is_some() {
            debug!("Simulated operation cancelled");
        }
        st.hanging = false;
    }

    fn take_read(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.sim.lock().read_buf)
    }

    fn wait_service_request(&mut self) -> BusStatus {
        let pause = {
            let mut st = self.sim.lock();
            st.polls += 1;
            st.pause(TimeoutTarget::Controller)
        };
        if let Some(pause) = pause {
            std::thread::sleep(pause);
        }

        let mut st = self.sim.lock();
        if st.foreign_pending {
            return BusStatus::SRQI;
        }
        match st.srq_countdown {
            Some(0) => BusStatus::SRQI,
            Some(n) => {
                st.srq_countdown = Some(n - 1);
                BusStatus::TIMO
            }
            None => BusStatus::TIMO,
        }
    }

    fn serial_poll(&mut self) -> Result<u8> {
        let mut st = self.sim.lock();
        st.check_open()?;
        if st.foreign_pending {
            st.foreign_pending = false;
            return Ok(0);
        }
        if st.srq_countdown == Some(0) {
            st.srq_countdown = None;
            return Ok(COMPLETION_STB);
        }
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        let mut st = self.sim.lock();
        st.closes += 1;
        st.closed = true;
        Ok(())
    }
}

/// Connector that always reaches the same simulated instrument
#[derive(Debug, Clone)]
pub struct SimConnector {
    sim: SimInstrument,
}

impl SimConnector {
    pub fn new(sim: SimInstrument) -> Self {
        Self { sim }
    }
}

impl Connector for SimConnector {
    fn connect(&mut self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        let mut st = self.sim.lock();
        if !st.present {
            return Err(BusError::TransportNotFound(config.describe()));
        }
        st.closed = false;
        st.status = BusStatus::empty();
        drop(st);

        Ok(Box::new(SimTransport {
            sim: self.sim.clone(),
            kind: config.kind,
            description: format!("simulated {}", config.describe()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{block_body, decode_form3};

    fn transport(sim: &SimInstrument) -> Box<dyn Transport> {
        SimConnector::new(sim.clone())
            .connect(&TransportConfig::default())
            .unwrap()
    }

    #[test]
    fn test_identity_query() {
        let sim = SimInstrument::new();
        let mut t = transport(&sim);
        t.write(b"OUTPIDEN;").unwrap();
        let mut buf = [0u8; 64];
        let n = t.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], format!("{}\n", MOCK_IDENTITY).as_bytes());
        assert!(t.status().contains(BusStatus::END));
    }

    #[test]
    fn test_async_block_read() {
        let sim = SimInstrument::new();
        sim.set_points(11);
        let mut t = transport(&sim);

        t.submit(AsyncRequest::Write(b"FORM3;OUTPFORM;".to_vec()))
            .unwrap();
        assert!(t.poll_once().is_complete());

        t.submit(AsyncRequest::Read {
            max: 1024,
            until: None,
        })
        .unwrap();
        assert!(t.poll_once().contains(BusStatus::END));
        let framed = t.take_read();
        assert_eq!(decode_form3(block_body(&framed).unwrap()).unwrap().len(), 11);
    }

    #[test]
    fn test_read_without_reply_stays_pending() {
        let sim = SimInstrument::new();
        let mut t = transport(&sim);
        t.submit(AsyncRequest::Read {
            max: 8,
            until: Some(b'\n'),
        })
        .unwrap();
        assert_eq!(t.poll_once(), BusStatus::TIMO);
        assert_eq!(t.poll_once(), BusStatus::TIMO);
        t.cancel();
        assert!(t.submit(AsyncRequest::Write(b"CLES;".to_vec())).is_ok());
    }

    #[test]
    fn test_hang_then_recover() {
        let sim = SimInstrument::new();
        sim.hang_next(1);
        let mut t = transport(&sim);

        t.submit(AsyncRequest::Write(b"SING;".to_vec())).unwrap();
        assert_eq!(t.poll_once(), BusStatus::TIMO);
        t.cancel();
        assert!(sim.traffic().is_empty());

        t.submit(AsyncRequest::Write(b"SING;".to_vec())).unwrap();
        assert!(t.poll_once().is_complete());
        assert_eq!(sim.traffic(), vec!["SING;".to_string()]);
    }

    #[test]
    fn test_opc_arms_service_request() {
        let sim = SimInstrument::new();
        sim.set_sweep_polls(2);
        sim.set_foreign_srq(true);
        let mut t = transport(&sim);

        t.write(b"OPC;SING;").unwrap();
        assert_eq!(t.wait_service_request(), BusStatus::SRQI);
        assert_eq!(t.serial_poll().unwrap(), 0);
        assert_eq!(t.wait_service_request(), BusStatus::TIMO);
        assert_eq!(t.wait_service_request(), BusStatus::TIMO);
        assert_eq!(t.wait_service_request(), BusStatus::SRQI);
        assert_eq!(t.serial_poll().unwrap() & 0x40, 0x40);
        assert_eq!(t.wait_service_request(), BusStatus::TIMO);
    }

    #[test]
    fn test_learn_string_upload_and_rules() {
        let sim = SimInstrument::new();
        sim.on_command("DUACON", 2, 0x04);
        let mut t = transport(&sim);

        let mut cmd = b"FORM1;INPULEAS;".to_vec();
        cmd.extend(encode_block(&[0u8, 1, 2, 3]).unwrap());
        cmd.extend_from_slice(b"OPC;NOOP;");
        t.write(&cmd).unwrap();
        assert_eq!(sim.learn_string(), vec![0, 1, 2, 3]);
        assert_eq!(t.wait_service_request(), BusStatus::TIMO);

        t.write(b"DUACON;").unwrap();
        assert_eq!(sim.learn_string(), vec![0, 1, 6, 3]);
    }

    #[test]
    fn test_calibration_select_and_upload() {
        let sim = SimInstrument::new();
        let mut t = transport(&sim);

        let mut cmd = b"CALIRESP;FORM3;INPUCALC01;".to_vec();
        cmd.extend(encode_block(&[9u8; 16]).unwrap());
        t.write(&cmd).unwrap();

        let (cal, arrays) = sim.calibration();
        assert_eq!(cal, CalType::Response);
        assert_eq!(arrays, vec![vec![9u8; 16]]);
    }

    #[test]
    fn test_clear_resets_error_and_output() {
        let sim = SimInstrument::new();
        let mut t = transport(&sim);
        t.write(b"OUTPIDEN;").unwrap();
        t.set_error_flag();
        assert!(t.status().is_error());

        t.clear();
        assert!(!t.status().is_error());
        let mut buf = [0u8; 4];
        assert!(t.read(&mut buf).is_err());
        assert_eq!(sim.clear_count(), 1);
    }
}

//! Instrument command sequences
//!
//! Each work item that needs the bus is a short script of mnemonics run
//! through the bounded-wait primitives. Any failed step ends the script; the
//! dispatcher reports the error and cleans up.

use crate::config::OperationTimeouts;
use crate::io::{self, OpContext};
use crate::transport::Connection;
use protocol::{
    BusError, CalType, FirmwareInfo, InstrumentState, LearnDiff, MultiPortData, Result,
    ResultItem, SParameter, SParameterTrace, Trace, TracePoint, decode_form3,
    diff_learn_strings, diff_runs, encode_block, layout_for, parse_number, recover_settings,
};
use tracing::{debug, info, warn};

/// A connection plus everything a command script needs
pub struct Session<'a> {
    pub conn: &'a mut Connection,
    pub ctx: &'a OpContext,
    pub timeouts: &'a OperationTimeouts,
}

impl Session<'_> {
    fn write(&mut self, command: &str) -> Result<()> {
        io::write_async(self.conn, command, self.timeouts.io_seconds, self.ctx)
    }

    fn write_bytes(&mut self, data: Vec<u8>) -> Result<()> {
        io::write_async(self.conn, data, self.timeouts.transfer_seconds, self.ctx)
    }

    fn query(&mut self, command: &str) -> Result<String> {
        io::query(self.conn, command, self.timeouts.io_seconds, self.ctx)
    }

    fn query_number(&mut self, command: &str) -> Result<f64> {
        parse_number(&self.query(command)?)
    }

    fn read_block(&mut self) -> Result<Vec<u8>> {
        io::read_block(self.conn, self.timeouts.transfer_seconds, self.ctx)
    }

    fn read_points(&mut self, command: &str) -> Result<Vec<TracePoint>> {
        self.write(command)?;
        decode_form3(&self.read_block()?)
    }

    /// Completion-signalled text command
    fn signal(&mut self, command: &str, max_seconds: f64) -> Result<()> {
        let outcome = io::signal_write(self.conn, command.as_bytes(), true, max_seconds, self.ctx);
        self.conn.check(outcome, command)
    }

    /// Completion-signalled binary transfer
    fn signal_binary(&mut self, data: &[u8], context: &str) -> Result<()> {
        let outcome =
            io::signal_write(self.conn, data, false, self.timeouts.transfer_seconds, self.ctx);
        self.conn.check(outcome, context)
    }

    fn post(&self, item: ResultItem) {
        self.ctx.results.post(item);
    }

    fn fetch_learn_string(&mut self) -> Result<Vec<u8>> {
        self.write("FORM1;OUTPLEAS;")?;
        self.read_block()
    }

    fn send_learn_string(&mut self, learn_string: &[u8]) -> Result<()> {
        let mut data = b"FORM1;INPULEAS;".to_vec();
        data.extend(encode_block(learn_string)?);
        self.signal_binary(&data, "learn string upload")
    }
}

/// Read and parse the identification string
pub fn identify(s: &mut Session<'_>) -> Result<FirmwareInfo> {
    let reply = s.query("OUTPIDEN;")?;
    FirmwareInfo::parse(&reply)
        .ok_or_else(|| BusError::InvalidResponse(format!("identification {:?}", reply)))
}

/// Formatted trace of one display channel
pub fn retrieve_trace(s: &mut Session<'_>, channel: u8) -> Result<Trace> {
    if !(1..=2).contains(&channel) {
        return Err(BusError::InvalidRequest(format!(
            "channel {} (expected 1 or 2)",
            channel
        )));
    }

    s.write(&format!("CHAN{};", channel))?;
    let expected = s.query_number("POIN?;")? as usize;
    let start_hz = s.query_number("STAR?;")?;
    let stop_hz = s.query_number("STOP?;")?;
    let points = s.read_points("FORM3;OUTPFORM;")?;

    if points.len() != expected {
        warn!(
            "Channel {} announced {} points but sent {}",
            channel,
            expected,
            points.len()
        );
    }
    info!("Retrieved {} points from channel {}", points.len(), channel);

    Ok(Trace {
        channel,
        start_hz,
        stop_hz,
        points,
    })
}

/// Sweep and read all four S-parameters
pub fn measure_multiport(s: &mut Session<'_>) -> Result<MultiPortData> {
    let start_hz = s.query_number("STAR?;")?;
    let stop_hz = s.query_number("STOP?;")?;

    let mut traces = Vec::with_capacity(SParameter::ALL.len());
    for parameter in SParameter::ALL {
        s.post(ResultItem::info(format!("Measuring {}", parameter.mnemonic())));
        s.write(&format!("{};", parameter.mnemonic()))?;
        s.signal("SING;", s.timeouts.sweep_seconds)?;
        let points = s.read_points("FORM3;OUTPDATA;")?;
        debug!("{}: {} points", parameter.mnemonic(), points.len());
        traces.push(SParameterTrace { parameter, points });
    }

    s.write("CONT;")?;
    Ok(MultiPortData {
        start_hz,
        stop_hz,
        traces,
    })
}

/// Learn string, calibration type and error-coefficient arrays
pub fn retrieve_state_and_cal(
    s: &mut Session<'_>,
    firmware: Option<&FirmwareInfo>,
) -> Result<InstrumentState> {
    let learn_string = s.fetch_learn_string()?;

    let reply = s.query("CALI?;")?;
    let cal_type = CalType::from_mnemonic(&reply)
        .ok_or_else(|| BusError::InvalidResponse(format!("calibration type {:?}", reply)))?;

    let mut cal_arrays = Vec::with_capacity(cal_type.array_count());
    for n in 1..=cal_type.array_count() {
        s.write(&format!("FORM3;OUTPCALC{:02};", n))?;
        cal_arrays.push(s.read_block()?);
    }

    let settings = firmware
        .and_then(|fw| layout_for(fw.revision))
        .map(|layout| recover_settings(layout, &learn_string))
        .unwrap_or_default();

    info!(
        "Retrieved {} byte learn string and {} calibration arrays ({:?})",
        learn_string.len(),
        cal_arrays.len(),
        cal_type
    );
    Ok(InstrumentState {
        firmware: firmware.cloned(),
        learn_string,
        cal_type,
        cal_arrays,
        settings,
    })
}

/// Restore a saved learn string and calibration
pub fn send_state_and_cal(s: &mut Session<'_>, state: &InstrumentState) -> Result<()> {
    if state.cal_type != CalType::None && state.cal_arrays.len() != state.cal_type.array_count() {
        return Err(BusError::InvalidRequest(format!(
            "{:?} needs {} arrays, state holds {}",
            state.cal_type,
            state.cal_type.array_count(),
            state.cal_arrays.len()
        )));
    }

    s.send_learn_string(&state.learn_string)?;

    if state.cal_type == CalType::None {
        return Ok(());
    }

    s.write(&format!("{};FORM3;", state.cal_type.mnemonic()))?;
    for (i, array) in state.cal_arrays.iter().enumerate() {
        let mut data = format!("INPUCALC{:02};", i + 1).into_bytes();
        data.extend(encode_block(array)?);
        s.write_bytes(data)?;
    }
    s.signal("SAVC;", s.timeouts.transfer_seconds)?;

    info!(
        "Sent learn string and {} calibration arrays",
        state.cal_arrays.len()
    );
    Ok(())
}

/// Learn-string differences caused by one modifying command
///
/// The baseline learn string is uploaded again afterwards so the analysis
/// leaves the instrument as it found it.
pub fn analyze_learn_string(s: &mut Session<'_>, modification: &str) -> Result<Vec<LearnDiff>> {
    let modification = modification.trim();
    if modification.is_empty() {
        return Err(BusError::InvalidRequest(
            "learn string analysis needs a modifying command".to_string(),
        ));
    }

    let baseline = s.fetch_learn_string()?;
    s.signal(modification, s.timeouts.io_seconds)?;
    let modified = s.fetch_learn_string()?;
    s.send_learn_string(&baseline)?;

    let diffs = diff_learn_strings(&baseline, &modified);
    let runs = diff_runs(&diffs);
    s.post(ResultItem::highlight(format!(
        "'{}' changed {} bytes in {} runs",
        modification,
        diffs.len(),
        runs.len()
    )));
    for (start, end) in runs {
        debug!("Changed run {:#06x}..={:#06x}", start, end);
    }
    Ok(diffs)
}

/// Define and save a user calibration kit
pub fn send_cal_kit(s: &mut Session<'_>, definition: &str) -> Result<()> {
    let definition = definition.trim();
    if definition.is_empty() {
        return Err(BusError::InvalidRequest(
            "calibration kit definition is empty".to_string(),
        ));
    }

    let mut command = String::from("MODI1;");
    command.push_str(definition);
    if !definition.ends_with(';') {
        command.push(';');
    }
    command.push_str("KITD;SAVEUSEK;");

    s.signal(&command, s.timeouts.transfer_seconds)?;
    s.post(ResultItem::highlight("Calibration kit saved"));
    Ok(())
}

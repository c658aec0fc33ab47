//! Asynchronous transfers with a bounded, cancellable wait

use super::{OpContext, POLL_CLASS, WaitClock};
use crate::transport::{AsyncRequest, Connection};
use protocol::{
    BLOCK_HEADER_LEN, BusError, Outcome, Result, TimeoutClass, TimeoutPurpose, TimeoutTarget,
    parse_block_header,
};
use tracing::{debug, warn};

/// Largest ASCII reply accepted by [`query`]
const MAX_REPLY: usize = 256;

enum Step {
    Continue,
    Done(Outcome),
}

/// Run one asynchronous transfer to completion, timeout or abort
///
/// The device timeout is saved and cleared before submission, polled in
/// [`POLL_CLASS`] increments and restored afterwards no matter how the wait
/// ended. Any outcome other than `Ok` stops the in-flight transfer; timeouts
/// and aborts also latch the error bit so the rest of the work item stays off
/// the bus. A connection already carrying the error bit is refused with
/// `PreviousError` before anything is submitted.
pub fn bounded_wait_op(
    conn: &mut Connection,
    request: AsyncRequest,
    max_seconds: f64,
    ctx: &OpContext,
) -> Outcome {
    if conn.status().is_error() {
        debug!("Refusing {}: error bit already set", request.label());
        return Outcome::PreviousError;
    }

    if let Err(e) = conn.timeout(
        TimeoutTarget::Device,
        TimeoutClass::None,
        TimeoutPurpose::SaveAndSet,
    ) {
        conn.record_fault(e);
        return Outcome::Error;
    }

    let outcome = wait_for(conn, request, max_seconds, ctx);

    if let Err(e) = conn.restore_timeout(TimeoutTarget::Device) {
        warn!("Failed to restore device timeout: {}", e);
    }
    outcome
}

fn wait_for(
    conn: &mut Connection,
    request: AsyncRequest,
    max_seconds: f64,
    ctx: &OpContext,
) -> Outcome {
    let label = request.label();

    if let Err(e) = conn.transport_mut().submit(request) {
        warn!("Failed to start {}: {}", label, e);
        conn.record_fault(e);
        return Outcome::Error;
    }

    if let Err(e) = conn.timeout(TimeoutTarget::Device, POLL_CLASS, TimeoutPurpose::Set) {
        conn.transport_mut().cancel();
        conn.record_fault(e);
        return Outcome::Error;
    }

    let mut clock = WaitClock::new(max_seconds);
    let outcome = loop {
        match step(conn, &mut clock, ctx, label) {
            Step::Continue => continue,
            Step::Done(outcome) => break outcome,
        }
    };

    if !outcome.is_ok() {
        conn.transport_mut().cancel();
    }
    if outcome.halts_item() {
        conn.flag_error();
    }
    debug!("Asynchronous {} finished: {}", label, outcome);
    outcome
}

fn step(conn: &mut Connection, clock: &mut WaitClock, ctx: &OpContext, label: &str) -> Step {
    if ctx.cancelled() {
        debug!("Asynchronous {} aborted", label);
        return Step::Done(Outcome::Aborted);
    }

    let status = conn.transport_mut().poll_once();
    if status.is_error() {
        conn.record_fault(BusError::bus(label, status));
        return Step::Done(Outcome::Error);
    }
    if status.is_complete() {
        return Step::Done(Outcome::Ok);
    }

    clock.tick();
    if let Some(seconds) = clock.report_due() {
        ctx.progress(format!("Waiting for {} to complete: {} s", label, seconds));
    }
    if clock.expired(ctx.disable_timeouts) {
        warn!("Asynchronous {} timed out after {} s", label, clock.max_seconds());
        return Step::Done(Outcome::Timeout);
    }
    Step::Continue
}

/// Write `data` and check the outcome
pub fn write_async(
    conn: &mut Connection,
    data: impl Into<Vec<u8>>,
    max_seconds: f64,
    ctx: &OpContext,
) -> Result<()> {
    let outcome = bounded_wait_op(conn, AsyncRequest::Write(data.into()), max_seconds, ctx);
    conn.check(outcome, "write")
}

/// Read up to `max` bytes, stopping early at `until` or end-of-data
pub fn read_async(
    conn: &mut Connection,
    max: usize,
    until: Option<u8>,
    max_seconds: f64,
    ctx: &OpContext,
) -> Result<Vec<u8>> {
    let outcome = bounded_wait_op(conn, AsyncRequest::Read { max, until }, max_seconds, ctx);
    conn.check(outcome, "read")?;
    Ok(conn.transport_mut().take_read())
}

/// Send a query and return its ASCII reply without the line terminator
pub fn query(conn: &mut Connection, command: &str, max_seconds: f64, ctx: &OpContext) -> Result<String> {
    write_async(conn, command, max_seconds, ctx)?;
    let reply = read_async(conn, MAX_REPLY, Some(b'\n'), max_seconds, ctx)?;
    Ok(String::from_utf8_lossy(&reply).trim().to_string())
}

/// Read one `#A` block and return its body
///
/// The header is read first so the body transfer asks for exactly the
/// announced number of bytes.
pub fn read_block(conn: &mut Connection, max_seconds: f64, ctx: &OpContext) -> Result<Vec<u8>> {
    let header = read_async(conn, BLOCK_HEADER_LEN, None, max_seconds, ctx)?;
    let len = parse_block_header(&header)?;
    if len == 0 {
        return Ok(Vec::new());
    }

    let body = read_async(conn, len, None, max_seconds, ctx)?;
    if body.len() != len {
        return Err(BusError::InvalidBlock(format!(
            "expected {} body bytes, got {}",
            len,
            body.len()
        )));
    }
    Ok(body)
}

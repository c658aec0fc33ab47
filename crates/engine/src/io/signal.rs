//! Completion-signalled writes
//!
//! The instrument is told to raise a service request once the payload has
//! been executed (`OPC` in front of a text command, or after a binary one).
//! The wait then alternates short service-request waits with cancellation and
//! timeout checks; a request from our device is confirmed by reading the
//! event status register.

use super::{OpContext, WaitClock, bounded_wait_op};
use crate::transport::{AsyncRequest, Connection};
use protocol::{
    BusError, BusStatus, Outcome, TimeoutClass, TimeoutPurpose, TimeoutTarget, parse_number,
};
use tracing::{debug, info, warn};

/// Clears status, enables the OPC bit and routes the event summary to SRQ
pub const SIGNAL_ARM: &str = "CLES;ESE1;SRE32;";

/// Status-byte bit set by the device that asserted SRQ
pub const RQS_BIT: u8 = 0x40;

/// Operation-complete bit of the event status register
pub const COMPLETION_BIT: u8 = 0x01;

/// Payloads containing this marker are long operations with a known duration
pub const LONG_WAIT_MARKER: &str = "WAIT";

/// Bound for transferring the payload itself
pub const SIGNAL_WRITE_SECONDS: f64 = 10.0;

const TEXT_PREFIX: &[u8] = b"OPC;";
const BINARY_TRAILER: &[u8] = b"OPC;NOOP;";

/// Assemble the bytes sent for a completion-signalled payload
fn frame_payload(payload: &[u8], is_text: bool) -> Vec<u8> {
    let mut framed = Vec::with_capacity(SIGNAL_ARM.len() + payload.len() + BINARY_TRAILER.len());
    framed.extend_from_slice(SIGNAL_ARM.as_bytes());
    if is_text {
        framed.extend_from_slice(TEXT_PREFIX);
        framed.extend_from_slice(payload);
    } else {
        framed.extend_from_slice(payload);
        framed.extend_from_slice(BINARY_TRAILER);
    }
    framed
}

fn has_long_wait_marker(payload: &[u8]) -> bool {
    payload
        .windows(LONG_WAIT_MARKER.len())
        .any(|w| w == LONG_WAIT_MARKER.as_bytes())
}

/// Send `payload` and wait until the instrument signals it has executed it
///
/// Both timeouts are saved before the wait and restored on every exit path.
pub fn signal_write(
    conn: &mut Connection,
    payload: &[u8],
    is_text: bool,
    max_seconds: f64,
    ctx: &OpContext,
) -> Outcome {
    let long_wait = has_long_wait_marker(payload);
    let framed = frame_payload(payload, is_text);

    let written = bounded_wait_op(conn, AsyncRequest::Write(framed), SIGNAL_WRITE_SECONDS, ctx);
    if !written.is_ok() {
        return written;
    }

    if let Err(e) = conn.timeout(
        TimeoutTarget::Controller,
        TimeoutClass::T30ms,
        TimeoutPurpose::SaveAndSet,
    ) {
        conn.record_fault(e);
        return Outcome::Error;
    }
    if let Err(e) = conn.timeout(
        TimeoutTarget::Device,
        TimeoutClass::T1s,
        TimeoutPurpose::SaveAndSet,
    ) {
        if let Err(e) = conn.restore_timeout(TimeoutTarget::Controller) {
            warn!("Failed to restore controller timeout: {}", e);
        }
        conn.record_fault(e);
        return Outcome::Error;
    }

    let outcome = wait_for_completion(conn, max_seconds, long_wait, ctx);

    for target in [TimeoutTarget::Device, TimeoutTarget::Controller] {
        if let Err(e) = conn.restore_timeout(target) {
            warn!("Failed to restore {} timeout: {}", target, e);
        }
    }
    debug!("Signalled write finished: {}", outcome);
    outcome
}

fn wait_for_completion(
    conn: &mut Connection,
    max_seconds: f64,
    long_wait: bool,
    ctx: &OpContext,
) -> Outcome {
    let mut clock = WaitClock::new(max_seconds);

    loop {
        if ctx.cancelled() {
            info!("Completion wait aborted");
            conn.flag_error();
            return Outcome::Aborted;
        }

        let status = conn.transport_mut().wait_service_request();
        if status.is_error() {
            conn.record_fault(BusError::bus("service request wait", status));
            return Outcome::Error;
        }

        if status.contains(BusStatus::SRQI) {
            match conn.transport_mut().serial_poll() {
                Err(e) => {
                    conn.record_fault(e);
                    return Outcome::Error;
                }
                Ok(stb) if stb & RQS_BIT != 0 => return confirm_completion(conn),
                Ok(stb) => debug!("Service request from another device (stb {:#04x})", stb),
            }
        }

        clock.tick();
        if let Some(seconds) = clock.report_due() {
            let message = if long_wait {
                format!(
                    "Waiting for instrument: {} s of {:.0} s ({:.0}%)",
                    seconds,
                    clock.max_seconds(),
                    clock.fraction() * 100.0
                )
            } else {
                format!("Waiting for instrument: {} s", seconds)
            };
            ctx.progress(message);
        }
        if clock.expired(ctx.disable_timeouts) {
            warn!("No completion signal after {} s", clock.max_seconds());
            conn.flag_error();
            return Outcome::Timeout;
        }
    }
}

/// Read the event status register and check the completion bit
fn confirm_completion(conn: &mut Connection) -> Outcome {
    if let Err(e) = conn.write(b"ESR?;") {
        conn.record_fault(e);
        return Outcome::Error;
    }

    let mut buf = [0u8; 32];
    let n = match conn.read(&mut buf) {
        Ok(n) => n,
        Err(e) => {
            conn.record_fault(e);
            return Outcome::Error;
        }
    };

    let reply = String::from_utf8_lossy(&buf[..n]);
    let event_status = match parse_number(&reply) {
        Ok(value) if (0.0..=255.0).contains(&value) => value as u8,
        Ok(_) | Err(_) => {
            conn.record_fault(BusError::InvalidResponse(format!(
                "event status {:?}",
                reply.trim()
            )));
            return Outcome::Error;
        }
    };

    if event_status & COMPLETION_BIT != 0 {
        Outcome::Ok
    } else {
        conn.record_fault(BusError::ProtocolMismatch {
            expected: COMPLETION_BIT,
            event_status,
        });
        Outcome::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_payload_framing() {
        assert_eq!(frame_payload(b"SING;", true), b"CLES;ESE1;SRE32;OPC;SING;");
    }

    #[test]
    fn test_binary_payload_framing() {
        let framed = frame_payload(b"INPULEAS;#A\x00\x01\x7f", false);
        assert!(framed.starts_with(SIGNAL_ARM.as_bytes()));
        assert!(framed.ends_with(b"\x7fOPC;NOOP;"));
    }

    #[test]
    fn test_long_wait_marker() {
        assert!(has_long_wait_marker(b"SWET 20;WAIT;SING;"));
        assert!(!has_long_wait_marker(b"SING;"));
        assert!(!has_long_wait_marker(b""));
    }
}

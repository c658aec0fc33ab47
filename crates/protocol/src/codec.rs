//! `#A` data block framing
//!
//! Binary transfers (learn strings, calibration arrays, FORM3 traces) are
//! framed by the instrument as:
//! ```text
//! ['#']['A'][Length: u16 (big-endian)][Body bytes]
//! ```
//! FORM3 bodies are sequences of big-endian IEEE-754 f64 pairs (real, imaginary).

use crate::error::{BusError, Result};
use crate::types::TracePoint;
use byteorder::{BigEndian, ByteOrder};

/// Length of the `#A` + u16 header
pub const BLOCK_HEADER_LEN: usize = 4;

/// Largest body a single block can carry
pub const MAX_BLOCK_BODY: usize = u16::MAX as usize;

/// Bytes per FORM3 point (two f64)
pub const FORM3_POINT_LEN: usize = 16;

/// Parse a block header and return the body length
pub fn parse_block_header(header: &[u8]) -> Result<usize> {
    if header.len() < BLOCK_HEADER_LEN {
        return Err(BusError::InvalidBlock(format!(
            "header needs {} bytes, got {}",
            BLOCK_HEADER_LEN,
            header.len()
        )));
    }
    if &header[..2] != b"#A" {
        return Err(BusError::InvalidBlock(format!(
            "bad block marker {:02x?}",
            &header[..2]
        )));
    }
    Ok(BigEndian::read_u16(&header[2..4]) as usize)
}

/// Frame `body` with an `#A` header
pub fn encode_block(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_BLOCK_BODY {
        return Err(BusError::InvalidBlock(format!(
            "body of {} bytes exceeds {}",
            body.len(),
            MAX_BLOCK_BODY
        )));
    }
    let mut framed = Vec::with_capacity(BLOCK_HEADER_LEN + body.len());
    framed.extend_from_slice(b"#A");
    let mut len = [0u8; 2];
    BigEndian::write_u16(&mut len, body.len() as u16);
    framed.extend_from_slice(&len);
    framed.extend_from_slice(body);
    Ok(framed)
}

/// Extract the body of a complete framed block
pub fn block_body(framed: &[u8]) -> Result<&[u8]> {
    let len = parse_block_header(framed)?;
    let available = framed.len() - BLOCK_HEADER_LEN;
    if available < len {
        return Err(BusError::InvalidBlock(format!(
            "incomplete block: expected {} bytes, got {}",
            len, available
        )));
    }
    Ok(&framed[BLOCK_HEADER_LEN..BLOCK_HEADER_LEN + len])
}

/// Decode a FORM3 body into complex points
pub fn decode_form3(body: &[u8]) -> Result<Vec<TracePoint>> {
    if body.len() % FORM3_POINT_LEN != 0 {
        return Err(BusError::InvalidBlock(format!(
            "FORM3 body of {} bytes is not a whole number of points",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(FORM3_POINT_LEN)
        .map(|chunk| TracePoint {
            re: BigEndian::read_f64(&chunk[..8]),
            im: BigEndian::read_f64(&chunk[8..]),
        })
        .collect())
}

/// Encode points as a FORM3 body
pub fn encode_form3(points: &[TracePoint]) -> Vec<u8> {
    let mut body = vec![0u8; points.len() * FORM3_POINT_LEN];
    for (chunk, point) in body.chunks_exact_mut(FORM3_POINT_LEN).zip(points) {
        BigEndian::write_f64(&mut chunk[..8], point.re);
        BigEndian::write_f64(&mut chunk[8..], point.im);
    }
    body
}

/// Parse a numeric ASCII reply such as `+1.00000000000E+06\n`
pub fn parse_number(reply: &str) -> Result<f64> {
    reply
        .trim()
        .trim_end_matches(';')
        .parse::<f64>()
        .map_err(|_| BusError::InvalidResponse(format!("expected a number, got {:?}", reply)))
}

//! Fixed-width little-endian field access over raw message buffers.

use std::fmt::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::types::RelayError;

fn field(buf: &[u8], offset: usize, width: usize) -> Result<&[u8], RelayError> {
    offset
        .checked_add(width)
        .and_then(|end| buf.get(offset..end))
        .ok_or(RelayError::OutOfRange {
            offset,
            width,
            len: buf.len(),
        })
}

/// Read a CARD8 at `offset`.
pub fn uint8(buf: &[u8], offset: usize) -> Result<u8, RelayError> {
    Ok(field(buf, offset, 1)?[0])
}

/// Read a little-endian CARD16 at `offset`.
pub fn uint16le(buf: &[u8], offset: usize) -> Result<u16, RelayError> {
    Ok(LittleEndian::read_u16(field(buf, offset, 2)?))
}

/// Read a little-endian CARD32 at `offset`.
pub fn uint32le(buf: &[u8], offset: usize) -> Result<u32, RelayError> {
    Ok(LittleEndian::read_u32(field(buf, offset, 4)?))
}

/// Render a buffer as offset-prefixed rows of four bytes for diagnostics.
pub fn hex_dump(buf: &[u8]) -> String {
    let mut out = format!("length={}", buf.len());
    for (row, chunk) in buf.chunks(4).enumerate() {
        let _ = write!(out, "\n{:06x}:", row * 4);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
    }
    out
}

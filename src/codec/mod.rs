//! Byte codec: fixed-width little-endian integers, checksums and MS-DOS
//! timestamps.
//!
//! # Endianness
//! Every multi-byte field of the block format is little-endian.  A value is
//! written as exactly `width` bytes; a value that does not fit is rejected
//! rather than silently truncated.
//!
//! # Checksums
//! - Header checksum: CRC-32 (IEEE) over the header bytes from the type code
//!   to the end of the payload, truncated to the low 16 bits.
//! - Content checksum: full CRC-32 over the stored entry bytes.

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

/// Largest supported field width in bytes.
pub const MAX_WIDTH: usize = 8;

/// First year representable in a DOS timestamp.
pub const DOS_EPOCH_YEAR: i32 = 1980;
/// Last year representable in a DOS timestamp (7-bit year offset).
pub const DOS_MAX_YEAR:   i32 = DOS_EPOCH_YEAR + 127;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Read of {width} byte(s) at offset {offset} exceeds buffer of {len} byte(s)")]
    OutOfBounds { offset: usize, width: usize, len: usize },
    #[error("Unsupported field width: {0}")]
    UnsupportedWidth(usize),
    #[error("Value {value} does not fit in {width} byte(s)")]
    Overflow { value: u64, width: usize },
}

// ── Integers ─────────────────────────────────────────────────────────────────

fn check_width(width: usize) -> Result<(), CodecError> {
    if width == 0 || width > MAX_WIDTH {
        return Err(CodecError::UnsupportedWidth(width));
    }
    Ok(())
}

/// Encode `value` as `width` little-endian bytes.
pub fn encode_int(value: u64, width: usize) -> Result<Vec<u8>, CodecError> {
    check_width(width)?;
    if width < MAX_WIDTH && value >> (width * 8) != 0 {
        return Err(CodecError::Overflow { value, width });
    }
    let mut out = vec![0u8; width];
    LittleEndian::write_uint(&mut out, value, width);
    Ok(out)
}

/// Decode `width` little-endian bytes starting at `offset`.
pub fn decode_int(buf: &[u8], offset: usize, width: usize) -> Result<u64, CodecError> {
    check_width(width)?;
    let end = offset
        .checked_add(width)
        .filter(|&end| end <= buf.len())
        .ok_or(CodecError::OutOfBounds { offset, width, len: buf.len() })?;
    Ok(LittleEndian::read_uint(&buf[offset..end], width))
}

/// `decode_int` for 16-bit fields.
pub fn decode_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    decode_int(buf, offset, 2).map(|v| v as u16)
}

/// `decode_int` for 32-bit fields.
pub fn decode_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    decode_int(buf, offset, 4).map(|v| v as u32)
}

// ── Checksums ────────────────────────────────────────────────────────────────

/// Low 16 bits of the CRC-32 of `bytes`.
pub fn header_crc(bytes: &[u8]) -> u16 {
    (crc32fast::hash(bytes) & 0xFFFF) as u16
}

/// Header checksum in its on-disk (little-endian) form.
pub fn header_checksum(bytes: &[u8]) -> [u8; 2] {
    header_crc(bytes).to_le_bytes()
}

/// CRC-32 of an entry's stored content.
pub fn content_checksum(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

// ── MS-DOS date/time ─────────────────────────────────────────────────────────

/// Pack a local date-time into the 32-bit MS-DOS layout.
///
/// Bits, least significant first: seconds/2 (5), minutes (6), hours (5),
/// day (5), month (4), year-1980 (7).  Years outside 1980..=2107 are clamped.
/// `None` packs the current local time.
pub fn pack_dos_datetime(instant: Option<NaiveDateTime>) -> u32 {
    let t = instant.unwrap_or_else(|| Local::now().naive_local());
    let (year, month, day) = match t.year() {
        y if y < DOS_EPOCH_YEAR => (DOS_EPOCH_YEAR, 1, 1),
        y if y > DOS_MAX_YEAR   => (DOS_MAX_YEAR, 12, 31),
        y                       => (y, t.month(), t.day()),
    };
    (t.second() / 2)
        | (t.minute() << 5)
        | (t.hour() << 11)
        | (day << 16)
        | (month << 21)
        | (((year - DOS_EPOCH_YEAR) as u32) << 25)
}

/// Inverse of [`pack_dos_datetime`].  Returns `None` for impossible dates.
pub fn unpack_dos_datetime(packed: u32) -> Option<NaiveDateTime> {
    let sec   = (packed & 0x1F) * 2;
    let min   = (packed >> 5) & 0x3F;
    let hour  = (packed >> 11) & 0x1F;
    let day   = (packed >> 16) & 0x1F;
    let month = (packed >> 21) & 0x0F;
    let year  = DOS_EPOCH_YEAR + ((packed >> 25) & 0x7F) as i32;
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, min, sec)
}

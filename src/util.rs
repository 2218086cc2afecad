//! Small helpers for binary data processing.
//!
//! This module provides:
//! - Unaligned little-endian reads (using byteorder for optimal codegen)
//! - SIMD-accelerated NUL searches (via memchr)
//! - Text helpers for fixed-width name and UUID fields

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Fast Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

/// Reads a little-endian u16 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 2`.
#[inline(always)]
pub fn read_u16_le(data: &[u8]) -> u16 {
    LittleEndian::read_u16(data)
}

/// Reads an unsigned little-endian integer of 1, 2, 4 or 8 bytes.
///
/// Returns `None` for any other width.
#[inline]
pub fn read_uint_le(data: &[u8]) -> Option<u64> {
    match data.len() {
        1 => Some(data[0] as u64),
        2 => Some(read_u16_le(data) as u64),
        4 => Some(read_u32_le(data) as u64),
        8 => Some(read_u64_le(data)),
        _ => None,
    }
}

// =============================================================================
// SIMD-Accelerated Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when there is no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Returns the NUL-terminated prefix of `data` as a lossy UTF-8 string.
pub fn c_string(data: &[u8]) -> String {
    let end = memchr_null(data);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

// =============================================================================
// Text Helpers
// =============================================================================

/// Formats a fixed-width character array, dropping trailing NUL padding.
///
/// Interior bytes are kept as-is so that space-padded fields such as the
/// cache magic (`"dyld_v1   arm64e"`) keep their full width.
pub fn trimmed_ascii(data: &[u8]) -> String {
    let end = data
        .iter()
        .rposition(|&b| b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    data[..end]
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Formats a UUID as a hex string.
pub fn uuid_to_string(uuid: &[u8]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

/// Returns the last path component of a slash-separated path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

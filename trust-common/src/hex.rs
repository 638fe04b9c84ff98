//! Encode and decode lowercase hex strings.
//!
//! Key material (session keys, nonces) gets hex-encoded in tests and debug
//! output, so the nibble conversions avoid data-dependent branches.

use std::fmt::{self, Write};

use thiserror::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum DecodeError {
    #[error("hex decode error: input string length must be even")]
    OddInputLength,
    #[error("hex decode error: decoded length {actual} != expected {expected}")]
    BadOutputLength { actual: usize, expected: usize },
    #[error("hex decode error: input contains non-hex character")]
    InvalidCharacter,
}

/// Encode a byte slice as an owned lowercase hex string.
pub fn encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(encode_nibble(byte >> 4) as char);
        out.push(encode_nibble(byte & 0x0f) as char);
    }
    out
}

/// Decode a lowercase hex string into owned bytes.
pub fn decode(hex: &str) -> Result<Vec<u8>, DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    let mut out = vec![0u8; hex.len() / 2];
    decode_into(hex, &mut out)?;
    Ok(out)
}

/// Decode a hex string into a fixed-size array.
pub fn decode_array<const N: usize>(hex: &str) -> Result<[u8; N], DecodeError> {
    let hex = hex.as_bytes();
    if hex.len() % 2 != 0 {
        return Err(DecodeError::OddInputLength);
    }
    if hex.len() / 2 != N {
        return Err(DecodeError::BadOutputLength {
            actual: hex.len() / 2,
            expected: N,
        });
    }
    let mut out = [0u8; N];
    decode_into(hex, &mut out)?;
    Ok(out)
}

/// Decode a hex literal at compile time. Panics on malformed input.
pub const fn decode_const<const N: usize>(hex: &[u8]) -> [u8; N] {
    if hex.len() != N * 2 {
        panic!("hex literal has the wrong length");
    }
    let mut out = [0u8; N];
    let mut bad = 0u16;
    let mut i = 0;
    while i < N {
        let hi = decode_nibble(hex[2 * i]);
        let lo = decode_nibble(hex[2 * i + 1]);
        let byte = (hi << 4) | lo;
        bad |= byte >> 8;
        out[i] = byte as u8;
        i += 1;
    }
    if bad != 0 {
        panic!("hex literal contains a non-hex character");
    }
    out
}

/// Display a byte slice as hex without allocating.
#[inline]
pub fn display(bytes: &[u8]) -> HexDisplay<'_> {
    HexDisplay(bytes)
}

pub struct HexDisplay<'a>(&'a [u8]);

impl fmt::Display for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in self.0 {
            f.write_char(encode_nibble(byte >> 4) as char)?;
            f.write_char(encode_nibble(byte & 0x0f) as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HexDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

fn decode_into(hex: &[u8], out: &mut [u8]) -> Result<(), DecodeError> {
    let mut bad = 0u16;
    for (pair, dst) in hex.chunks_exact(2).zip(out.iter_mut()) {
        let byte = (decode_nibble(pair[0]) << 4) | decode_nibble(pair[1]);
        bad |= byte >> 8;
        *dst = byte as u8;
    }
    if bad == 0 {
        Ok(())
    } else {
        Err(DecodeError::InvalidCharacter)
    }
}

/// `0..=9 -> '0'..='9'`, `10..=15 -> 'a'..='f'`
#[inline(always)]
const fn encode_nibble(nib: u8) -> u8 {
    let nib = nib as i16;
    // all ones when nib >= 10, zero otherwise
    let is_alpha = (9 - nib) >> 8;
    (nib + b'0' as i16 + (is_alpha & (b'a' as i16 - b'0' as i16 - 10))) as u8
}

/// Returns the nibble value, or a value with the high byte set if `c` is not
/// a lowercase hex character.
#[inline(always)]
const fn decode_nibble(c: u8) -> u16 {
    let c = c as i16;
    // masks are all ones when `c` falls in the range
    let is_digit = ((b'0' as i16 - 1 - c) & (c - b'9' as i16 - 1)) >> 8;
    let is_alpha = ((b'a' as i16 - 1 - c) & (c - b'f' as i16 - 1)) >> 8;
    let value = (is_digit & (c - b'0' as i16))
        | (is_alpha & (c - b'a' as i16 + 10))
        | !(is_digit | is_alpha);
    value as u16
}

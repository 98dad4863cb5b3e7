//! Variable-length integer encodings.
//!
//! Two flavors are used: the LEB128-style encoding embedded inside
//! transaction-extra fields, and an order-preserving encoding for storage
//! keys, where byte-wise lexicographic comparison of the encoded form
//! matches numeric comparison of the values. The latter is what makes
//! prefix cursors over per-amount output keys return indices in order.

use crate::{Error, Result};

/// Appends the LEB128 encoding of `value` to `out`.
pub fn write(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Reads a LEB128 varint from the front of `input`, advancing it.
pub fn read(input: &mut &[u8]) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input
            .split_first()
            .ok_or_else(|| Error::Varint("truncated varint".to_string()))?;
        *input = rest;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(Error::Varint("varint overflows u64".to_string()));
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Appends an order-preserving encoding of `value` to `out`.
///
/// Single byte for values up to 240, then progressively longer forms with a
/// leading tag byte that sorts after all shorter forms.
pub fn write_ordered(value: u64, out: &mut Vec<u8>) {
    if value <= 240 {
        out.push(value as u8);
    } else if value <= 2287 {
        let v = value - 240;
        out.push((v / 256 + 241) as u8);
        out.push((v % 256) as u8);
    } else if value <= 67823 {
        let v = value - 2288;
        out.push(249);
        out.push((v / 256) as u8);
        out.push((v % 256) as u8);
    } else {
        let bytes = value.to_be_bytes();
        let significant = 8 - value.leading_zeros() as usize / 8;
        out.push((250 + significant - 3) as u8);
        out.extend_from_slice(&bytes[8 - significant..]);
    }
}

/// Reads an order-preserving varint from the front of `input`, advancing it.
pub fn read_ordered(input: &mut &[u8]) -> Result<u64> {
    let (&first, rest) = input
        .split_first()
        .ok_or_else(|| Error::Varint("truncated ordered varint".to_string()))?;
    *input = rest;
    let take = |input: &mut &[u8], n: usize| -> Result<Vec<u8>> {
        if input.len() < n {
            return Err(Error::Varint("truncated ordered varint".to_string()));
        }
        let (head, tail) = input.split_at(n);
        let bytes = head.to_vec();
        *input = tail;
        Ok(bytes)
    };
    match first {
        0..=240 => Ok(u64::from(first)),
        241..=248 => {
            let b = take(input, 1)?;
            Ok(240 + 256 * (u64::from(first) - 241) + u64::from(b[0]))
        }
        249 => {
            let b = take(input, 2)?;
            Ok(2288 + 256 * u64::from(b[0]) + u64::from(b[1]))
        }
        250..=255 => {
            let n = (first - 250 + 3) as usize;
            let b = take(input, n)?;
            let mut buf = [0u8; 8];
            buf[8 - n..].copy_from_slice(&b);
            Ok(u64::from_be_bytes(buf))
        }
    }
}

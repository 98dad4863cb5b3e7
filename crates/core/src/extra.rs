//! Transaction-extra field parsing.
//!
//! The extra field is a sequence of tagged records. Unknown tags are
//! skipped when they carry a length, so old nodes tolerate new records.

use crate::primitives::Hash;
use crate::{varint, Error, Result};

const TAG_PADDING: u8 = 0x00;
const TAG_PUBLIC_KEY: u8 = 0x01;
const TAG_NONCE: u8 = 0x02;
const TAG_MERGE_MINING: u8 = 0x03;
const TAG_CAPACITY_VOTE: u8 = 0x04;

/// Merge-mining record embedded in a root block's coinbase extra.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeMiningTag {
    pub depth: u64,
    pub merkle_root: Hash,
}

/// Appends an arbitrary miner nonce record.
pub fn add_nonce(extra: &mut Vec<u8>, nonce: &[u8]) {
    extra.push(TAG_NONCE);
    varint::write(nonce.len() as u64, extra);
    extra.extend_from_slice(nonce);
}

/// Appends a merge-mining tag record.
pub fn add_merge_mining_tag(extra: &mut Vec<u8>, tag: MergeMiningTag) {
    let mut body = Vec::with_capacity(40);
    varint::write(tag.depth, &mut body);
    body.extend_from_slice(tag.merkle_root.as_bytes());
    extra.push(TAG_MERGE_MINING);
    varint::write(body.len() as u64, extra);
    extra.extend_from_slice(&body);
}

/// Appends a block capacity vote record.
pub fn add_capacity_vote(extra: &mut Vec<u8>, vote: u64) {
    let mut body = Vec::with_capacity(9);
    varint::write(vote, &mut body);
    extra.push(TAG_CAPACITY_VOTE);
    varint::write(body.len() as u64, extra);
    extra.extend_from_slice(&body);
}

/// Extracts the first merge-mining tag record, if any.
pub fn get_merge_mining_tag(extra: &[u8]) -> Option<MergeMiningTag> {
    let body = find_record(extra, TAG_MERGE_MINING)?;
    let mut slice = body;
    let depth = varint::read(&mut slice).ok()?;
    let merkle_root = Hash::from_slice(slice.get(..32)?)?;
    Some(MergeMiningTag { depth, merkle_root })
}

/// Extracts the first block capacity vote record, if any.
pub fn get_capacity_vote(extra: &[u8]) -> Option<u64> {
    let body = find_record(extra, TAG_CAPACITY_VOTE)?;
    let mut slice = body;
    varint::read(&mut slice).ok()
}

/// Walks the records of an extra field, returning the body of the first
/// record with the requested tag. Trailing zero bytes are padding.
fn find_record(extra: &[u8], wanted: u8) -> Option<&[u8]> {
    let mut slice = extra;
    while let Some((&tag, rest)) = slice.split_first() {
        slice = rest;
        match tag {
            TAG_PADDING => {
                // Padding normally runs to the end of the field.
                if slice.iter().all(|&b| b == 0) {
                    return None;
                }
                continue;
            }
            TAG_PUBLIC_KEY => {
                let body = slice.get(..32)?;
                slice = &slice[32..];
                if wanted == TAG_PUBLIC_KEY {
                    return Some(body);
                }
            }
            _ => {
                let mut cursor = slice;
                let len = varint::read(&mut cursor).ok()? as usize;
                let body = cursor.get(..len)?;
                slice = &cursor[len..];
                if tag == wanted {
                    return Some(body);
                }
            }
        }
    }
    None
}

/// Appends `count` zero padding bytes, used by the template builder to make
/// the coinbase transaction hit an exact serialized size.
pub fn add_padding(extra: &mut Vec<u8>, count: usize) {
    extra.resize(extra.len() + count, 0);
}

/// Validates that an extra field parses to the end.
pub fn check_extra(extra: &[u8]) -> Result<()> {
    let mut slice = extra;
    while let Some((&tag, rest)) = slice.split_first() {
        slice = rest;
        match tag {
            TAG_PADDING => continue,
            TAG_PUBLIC_KEY => {
                slice = slice
                    .get(32..)
                    .ok_or_else(|| Error::Extra("truncated public key record".to_string()))?;
            }
            _ => {
                let len = varint::read(&mut slice)? as usize;
                slice = slice
                    .get(len..)
                    .ok_or_else(|| Error::Extra("truncated tagged record".to_string()))?;
            }
        }
    }
    Ok(())
}

//! Key and value encoding for the flat storage namespace.
//!
//! Records are addressed by `[tag][len(account) u32 BE][account][id]`. The
//! length prefix keeps `("ab", "c")` and `("a", "bc")` distinct; the tag
//! keeps counters and sequences in disjoint ranges of the same partition.

use anyhow::{ensure, Result};

/// Tag byte for counter records.
pub const TAG_COUNTER: u8 = 1;
/// Tag byte for sequence records.
pub const TAG_SEQUENCE: u8 = 2;

pub fn encode_key(tag: u8, account: &str, id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + account.len() + id.len());
    out.push(tag);
    out.extend_from_slice(&(account.len() as u32).to_be_bytes());
    out.extend_from_slice(account.as_bytes());
    out.extend_from_slice(id.as_bytes());
    out
}

pub fn encode_i64(value: i64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_i64(raw: &[u8]) -> Result<i64> {
    ensure!(raw.len() == 8, "counter value has {} bytes, want 8", raw.len());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(i64::from_be_bytes(buf))
}

pub fn encode_u64(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_u64(raw: &[u8]) -> Result<u64> {
    ensure!(raw.len() == 8, "sequence value has {} bytes, want 8", raw.len());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Ok(u64::from_be_bytes(buf))
}

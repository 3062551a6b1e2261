//! CONCLAVE - Line Codec
//! Shared on-disk record encoding for the WAL and segment files.
//!
//! ## Line Format
//! ```text
//! live record:  base64(key) ":" base64(value) "\n"
//! tombstone:    base64(key) "\n"
//! ```
//! Base64 never produces `:`, so the first colon always separates key from value.
//! An empty value (`base64(key) ":"`) is a present value, not a tombstone.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{ConclaveError, Result};
use crate::types::Record;

const DELIMITER: u8 = b':';

/// Encode a live key/value record, newline included.
pub fn encode_put(key: &str, value: &str) -> String {
    let mut line = STANDARD.encode(key);
    line.push(DELIMITER as char);
    line.push_str(&STANDARD.encode(value));
    line.push('\n');
    line
}

/// Encode a tombstone record, newline included.
pub fn encode_tombstone(key: &str) -> String {
    let mut line = STANDARD.encode(key);
    line.push('\n');
    line
}

/// Encode any record.
pub fn encode(key: &str, record: &Record) -> String {
    match record {
        Record::Value(value) => encode_put(key, value),
        Record::Tombstone => encode_tombstone(key),
    }
}

/// Decode one line (with or without its trailing newline) into a key and record.
pub fn decode_line(line: &[u8]) -> Result<(String, Record)> {
    let line = trim_newline(line);
    match split(line) {
        (key, None) => Ok((decode_text(key)?, Record::Tombstone)),
        (key, Some(value)) => Ok((decode_text(key)?, Record::Value(decode_text(value)?))),
    }
}

/// Decode only the key of a line and report whether it is a tombstone.
/// The value is never base64-decoded.
pub fn decode_key(line: &[u8]) -> Result<(String, bool)> {
    let (key, value) = split(trim_newline(line));
    Ok((decode_text(key)?, value.is_none()))
}

fn split(line: &[u8]) -> (&[u8], Option<&[u8]>) {
    match line.iter().position(|b| *b == DELIMITER) {
        Some(at) => (&line[..at], Some(&line[at + 1..])),
        None => (line, None),
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_text(encoded: &[u8]) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| ConclaveError::Corruption(format!("bad base64: {e}")))?;
    String::from_utf8(bytes).map_err(|e| ConclaveError::Corruption(format!("bad utf-8: {e}")))
}

//! Canonical key codec.
//!
//! The chain emits contract storage keys as base64 of raw bytes; composite
//! keys concatenate length-prefixed (u16 big-endian) namespace segments
//! followed by the final key bytes. The canonical stored form is a
//! comma-separated decimal byte list, which sorts and prefix-matches
//! stably in SQL and in memory.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::ParseError;

/// Render raw key bytes as the canonical comma-separated decimal form.
pub fn key_to_comma(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 4);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{b}");
    }
    out
}

/// Parse a canonical comma form back into raw key bytes.
pub fn comma_to_key(key: &str) -> Result<Vec<u8>, ParseError> {
    if key.is_empty() {
        return Ok(Vec::new());
    }
    key.split(',')
        .map(|part| {
            part.parse::<u8>()
                .map_err(|_| ParseError::Key(format!("bad byte '{part}'")))
        })
        .collect()
}

/// Decode a base64-encoded key into its canonical comma form.
pub fn base64_key_to_event_key(b64: &str) -> Result<String, ParseError> {
    let bytes = BASE64.decode(b64).map_err(|e| ParseError::Base64 {
        field: "key".into(),
        reason: e.to_string(),
    })?;
    Ok(key_to_comma(&bytes))
}

/// Inverse of [`base64_key_to_event_key`]: canonical comma form → base64.
pub fn event_key_to_base64(key: &str) -> Result<String, ParseError> {
    let bytes = comma_to_key(key)?;
    Ok(BASE64.encode(bytes))
}

/// Encode namespace segments as a composite-key byte prefix.
///
/// Every segment gets a u16 big-endian length prefix, matching how the
/// contract storage layer namespaces its maps. Appending raw key bytes to
/// the result yields a full composite key.
pub fn namespace_prefix(segments: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(segments.iter().map(|s| s.len() + 2).sum());
    for seg in segments {
        out.extend_from_slice(&(seg.len() as u16).to_be_bytes());
        out.extend_from_slice(seg);
    }
    out
}

/// Split a composite key into `n - 1` length-prefixed segments plus the
/// unprefixed remainder.
///
/// Returns `None` when the bytes don't hold `n` well-formed segments.
pub fn split_segments(bytes: &[u8], n: usize) -> Option<Vec<Vec<u8>>> {
    if n == 0 {
        return None;
    }
    let mut rest = bytes;
    let mut segments = Vec::with_capacity(n);
    for _ in 0..n - 1 {
        if rest.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        rest = &rest[2..];
        if rest.len() < len {
            return None;
        }
        segments.push(rest[..len].to_vec());
        rest = &rest[len..];
    }
    segments.push(rest.to_vec());
    Some(segments)
}

/// Prefix test on canonical comma forms.
///
/// "1,2" must not match "1,23", so a non-exact match requires the boundary
/// comma. The empty prefix matches every key.
pub fn key_matches_prefix(key: &str, prefix: &str) -> bool {
    if prefix.is_empty() || key == prefix {
        return true;
    }
    key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b','
}

//! Composite key helpers.
//!
//! Keys are ordered tuples in memory. The `:`-joined string form exists only
//! because MessagePack maps need scalar keys on disk.

use crate::error::ValidationError;

/// Separator used by every flattened key.
pub const KEY_DELIMITER: char = ':';

/// Check one string component of a key.
pub fn require_component(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    if value.contains(KEY_DELIMITER) {
        return Err(ValidationError::ContainsDelimiter { field });
    }
    Ok(())
}

/// Check one integer component of a key.
pub fn require_positive(field: &'static str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::NonPositive {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Join already-validated components.
#[must_use]
pub fn join_key(parts: &[&str]) -> String {
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(KEY_DELIMITER);
        }
        out.push_str(part);
    }
    out
}

/// Split a flattened key into exactly `N` components.
pub fn split_key<'a, const N: usize>(
    kind: &'static str,
    input: &'a str,
) -> Result<[&'a str; N], ValidationError> {
    let malformed = || ValidationError::MalformedKey {
        kind,
        input: input.to_string(),
    };
    let mut parts = input.split(KEY_DELIMITER);
    let mut out = [""; N];
    for slot in &mut out {
        *slot = parts.next().ok_or_else(malformed)?;
    }
    if parts.next().is_some() {
        return Err(malformed());
    }
    Ok(out)
}

/// Parse an integer component of a flattened key.
pub fn parse_int_component(kind: &'static str, input: &str, part: &str) -> Result<u64, ValidationError> {
    part.parse::<u64>().map_err(|_| ValidationError::MalformedKey {
        kind,
        input: input.to_string(),
    })
}

//! Pre-response meta frames.
//!
//! A service may answer a request with a meta frame before the real
//! response. Meta frames start with an ASCII letter and carry `key:"value"`
//! pairs separated by spaces, e.g. `timeout:"5000"`. The `key=value` form is
//! accepted as well.

use std::time::Duration;

/// Check whether a response payload is a meta frame.
pub(crate) fn is_meta(payload: &[u8]) -> bool {
    match payload.first() {
        Some(c) => (b'a'..=b'z').contains(&(c | 32)),
        None => false,
    }
}

/// Look up `key` in a meta frame.
pub(crate) fn lookup<'a>(payload: &'a str, key: &str) -> Option<&'a str> {
    let mut rest = payload.trim_start();
    while !rest.is_empty() {
        let sep = rest.find([':', '='])?;
        let name = &rest[..sep];
        let after = &rest[sep + 1..];
        let (value, remainder) = if rest.as_bytes()[sep] == b':' {
            let quoted = after.strip_prefix('"')?;
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(char::is_whitespace).unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        if name == key {
            return Some(value);
        }
        rest = remainder.trim_start();
    }
    None
}

/// Extract the extended deadline from a meta frame.
pub(crate) fn parse_timeout(payload: &[u8]) -> Option<Duration> {
    let text = std::str::from_utf8(payload).ok()?;
    let ms: u64 = lookup(text, "timeout")?.parse().ok()?;
    Some(Duration::from_millis(ms))
}

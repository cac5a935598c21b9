//! Resource pattern matching with wildcard support.
//!
//! Used by system reset events to select cached resources. Supports
//! NATS-style wildcards:
//! - `*` matches any single token
//! - `>` matches one or more tokens (only as the last token)

/// A parsed resource pattern.
///
/// An invalid pattern is represented by an empty pattern and matches nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePattern {
    pattern: String,
    has_wild: bool,
}

impl ResourcePattern {
    /// Parse a pattern. Use [`is_valid`](Self::is_valid) to check the result.
    ///
    /// Examples:
    /// - `test.model` matches only `test.model`
    /// - `test.*.items` matches `test.a.items`
    /// - `test.>` matches `test.a` and `test.a.b`, but not `test`
    pub fn parse(pattern: &str) -> Self {
        if validate_pattern(pattern).is_some() {
            return Self::default();
        }
        Self {
            pattern: pattern.to_string(),
            has_wild: is_wildcard_pattern(pattern),
        }
    }

    /// Check whether the pattern is valid.
    pub fn is_valid(&self) -> bool {
        !self.pattern.is_empty()
    }

    /// Check whether a resource name matches the pattern.
    pub fn matches(&self, name: &str) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        if !self.has_wild {
            return self.pattern == name;
        }
        let pattern_parts: Vec<&str> = self.pattern.split('.').collect();
        let name_parts: Vec<&str> = name.split('.').collect();
        matches_parts(&pattern_parts, &name_parts)
    }
}

#[inline]
fn is_wildcard_pattern(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('>')
}

fn matches_parts(pattern_parts: &[&str], name_parts: &[&str]) -> bool {
    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_parts.len() && si < name_parts.len() {
        let p = pattern_parts[pi];

        if p == ">" {
            // Consumes the rest, which is known to be non-empty
            return true;
        } else if p == "*" || p == name_parts[si] {
            pi += 1;
            si += 1;
        } else {
            return false;
        }
    }

    pi == pattern_parts.len() && si == name_parts.len()
}

/// Validate a resource pattern.
/// Returns an error message if invalid, None if valid.
pub fn validate_pattern(pattern: &str) -> Option<String> {
    if pattern.is_empty() {
        return Some("Empty pattern".to_string());
    }

    let parts: Vec<&str> = pattern.split('.').collect();

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            return Some("Empty token in pattern".to_string());
        }
        if part.contains('>') && (*part != ">" || i != parts.len() - 1) {
            return Some("> wildcard must be the last token".to_string());
        }
        if part.contains('*') && *part != "*" {
            return Some("* wildcard must be a full token".to_string());
        }
    }

    None
}

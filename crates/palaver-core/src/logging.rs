//! Logging helpers that keep credentials and payloads out of log output.
//!
//! Command lines are logged at debug level; `LOGIN` may carry a password,
//! and transfer chunks carry user data that only its length is useful for.

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact a byte slice, showing only length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl fmt::Display for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl fmt::Debug for RedactedBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Mask the password argument of a `LOGIN` command line.
///
/// Any other line is returned as-is, truncated to a sane length.
pub fn redact_command(line: &str) -> String {
    const MAX_LOGGED: usize = 120;

    let mut parts = line.split_whitespace();
    if let Some(verb) = parts.next() {
        if verb.eq_ignore_ascii_case("LOGIN") {
            let name = parts.next().unwrap_or("");
            return match parts.next() {
                Some(_) => format!("{} {} {}", verb, name, Redacted(())),
                None => format!("{} {}", verb, name),
            };
        }
    }

    if line.len() > MAX_LOGGED {
        let mut end = MAX_LOGGED;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    } else {
        line.to_string()
    }
}

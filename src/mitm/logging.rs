//! Logging Policy - redaction of sensitive header values
//!
//! Header names are always logged; values of credential-bearing headers are
//! replaced before they reach a log line.

use std::fmt;

use super::http_parser::Headers;

/// Sensitive headers that should be redacted
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "proxy-authorization",
];

/// Replacement for redacted values
pub const REDACTED: &str = "[REDACTED]";

/// Check if a header carries credentials
pub fn is_sensitive_header(name: &str) -> bool {
    SENSITIVE_HEADERS
        .iter()
        .any(|sensitive| sensitive.eq_ignore_ascii_case(name))
}

/// Redact sensitive headers, keeping order and names
pub fn redact_headers(headers: &Headers) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_sensitive_header(name) {
                REDACTED
            } else {
                value
            };
            (name.to_string(), value.to_string())
        })
        .collect()
}

/// `Display` adapter rendering headers as `name: value; ...` with redaction
pub struct RedactedHeaders<'a>(pub &'a Headers);

impl fmt::Display for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            let value = if is_sensitive_header(name) {
                REDACTED
            } else {
                value
            };
            write!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

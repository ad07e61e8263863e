//! Caller identification from request metadata.

use axum::http::HeaderMap;

/// Header carrying the proxy chain, client first.
pub const FORWARDED_FOR: &str = "x-forwarded-for";
/// Header set by a single reverse proxy.
pub const REAL_IP: &str = "x-real-ip";

/// Longest accepted address literal (the longest textual IPv6 literal, 45, fits below this).
const MAX_ADDRESS_LEN: usize = 46;

/// A caller key scoped to one limiter's namespace.
///
/// Callers behind the same NAT share an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Identifier used when no header yields an address.
    pub const UNKNOWN: &'static str = "unknown";

    /// Wrap an arbitrary key.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The shared fallback identifier.
    pub fn unknown() -> Self {
        Self(Self::UNKNOWN.to_string())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the shared fallback identifier.
    pub fn is_unknown(&self) -> bool {
        self.0 == Self::UNKNOWN
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Extract the caller identifier from request headers.
///
/// Precedence: the left-most entry of `x-forwarded-for`, then `x-real-ip`,
/// then `"unknown"`. A value that does not look like an address literal is
/// skipped in favour of the next header.
pub fn resolve_identifier(headers: &HeaderMap) -> Identifier {
    [FORWARDED_FOR, REAL_IP]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(',').next())
        .map(str::trim)
        .find(|candidate| is_address_like(candidate))
        .map(Identifier::new)
        .unwrap_or_else(Identifier::unknown)
}

/// Non-empty, bounded, and only IPv4/IPv6 literal characters.
fn is_address_like(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() < MAX_ADDRESS_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':')
}

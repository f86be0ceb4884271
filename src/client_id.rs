//! Client identity derived from the caller's network identifier.
//!
//! The identity is used as a store key segment, so it must avoid the
//! characters document stores reserve for path syntax (`. # $ [ ] /`)
//! as well as anything non-printable. Encoding is injective: distinct
//! network identifiers never collide.

use std::fmt;

/// Opaque, key-segment-safe client identity. One per session.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ClientId(String);

impl ClientId {
    /// Derive an identity from a caller-supplied network identifier
    /// (typically the peer IP).
    ///
    /// ASCII alphanumerics, `-`, and `_` pass through; every other byte is
    /// escaped as `~` followed by two lowercase hex digits. `~` itself is
    /// escaped, which keeps the mapping injective.
    pub fn from_network_id(raw: &str) -> Self {
        let mut out = String::with_capacity(raw.len());
        for b in raw.bytes() {
            match b {
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' => {
                    out.push(b as char);
                }
                _ => {
                    out.push('~');
                    out.push_str(&format!("{b:02x}"));
                }
            }
        }
        Self(out)
    }

    /// The encoded identity as a key segment.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(raw: &str) -> Self {
        Self::from_network_id(raw)
    }
}

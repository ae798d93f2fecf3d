//! Typed identifier wrappers.
//!
//! A broadcaster id and a credential are both plain strings on the wire;
//! wrapping them keeps an id from being passed where a cookie is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

/// Identifier of a stream source (the broadcaster's screen id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BroadcasterId(String);

impl BroadcasterId {
    /// Parse a broadcaster id, rejecting empty or whitespace-only input.
    ///
    /// Surrounding whitespace is trimmed.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_input("broadcaster id must not be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BroadcasterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Opaque credential (a cookie header value) used for an authenticated attempt.
///
/// An empty string never produces a token, so "configured" and "non-empty"
/// are the same question.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a credential, returning `None` when it is empty or blank.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw header value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Never print the credential itself.
impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

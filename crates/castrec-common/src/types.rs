//! Core type definitions shared by the resolver, transport, and CLI.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery variant of a live stream.
///
/// Serialized in lowercase, matching the `mode` query parameter the origin
/// expects on constructed endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Source-quality stream.
    Main,
    /// Mobile-optimised source stream.
    MobileSource,
    /// Baseline transcode.
    Base,
}

impl StreamMode {
    /// Query-string value for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::MobileSource => "mobilesource",
            Self::Base => "base",
        }
    }
}

impl fmt::Display for StreamMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Artifact path layout and filename sanitisation.
//!
//! Recordings land at
//! `<base_dir>/<sanitized id>/<YYYYMMDD-HHMM>-<sanitized title>.<ext>`.
//! Protected streams get [`PROTECTED_MARKER`] in front of the file name so
//! they stand out in a directory listing.

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Extension of the raw capture written by the sink.
pub const RAW_EXTENSION: &str = "ts";

/// Extension of the transcoded artifact.
pub const TRANSCODED_EXTENSION: &str = "mp4";

/// Prefix placed on file names of protected (membership-only) streams.
pub const PROTECTED_MARKER: char = '🔒';

/// Default cap on the file stem length, in characters.
pub const DEFAULT_MAX_STEM_CHARS: usize = 120;

/// Directory used when a broadcaster id sanitizes to nothing.
pub const UNNAMED_BROADCASTER_DIR: &str = "unnamed";

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M";

/// Characters dropped outright from path components.
const UNSAFE_CHARS: &[char] = &[
    '{', '}', '[', ']', '/', '?', '.', ',', ';', ':', '|', ')', '(', '*', '~', '!', '^', '-',
    '_', '+', '<', '>', '@', '#', '$', '%', '&', '\\', '=', '\'', '"',
];

/// Paths belonging to one recording attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    /// Per-broadcaster directory holding both artifacts.
    pub dir: PathBuf,
    /// Raw capture (`.ts`).
    pub raw: PathBuf,
    /// Transcoded output (`.mp4`).
    pub transcoded: PathBuf,
}

impl ArtifactPaths {
    /// Build the artifact paths for a recording started at `started_at`.
    ///
    /// `max_stem_chars` bounds the file name without its extension,
    /// marker included. Truncation always lands on a char boundary.
    pub fn new(
        base_dir: &Path,
        broadcaster: &str,
        title: &str,
        protected: bool,
        started_at: NaiveDateTime,
        max_stem_chars: usize,
    ) -> Self {
        let mut dir_name = sanitize_component(broadcaster);
        if dir_name.is_empty() {
            dir_name = UNNAMED_BROADCASTER_DIR.to_string();
        }
        let dir = base_dir.join(dir_name);

        let mut stem = String::new();
        if protected {
            stem.push(PROTECTED_MARKER);
        }
        stem.push_str(&started_at.format(TIMESTAMP_FORMAT).to_string());
        stem.push('-');
        stem.push_str(&sanitize_component(title));
        let stem = truncate_chars(&stem, max_stem_chars);

        Self {
            raw: dir.join(format!("{stem}.{RAW_EXTENSION}")),
            transcoded: dir.join(format!("{stem}.{TRANSCODED_EXTENSION}")),
            dir,
        }
    }
}

/// Strip path-unsafe characters and collapse whitespace runs to `_`.
///
/// Full-width spaces (U+3000) count as whitespace.
///
/// # Examples
///
/// ```
/// use castrec_common::paths::sanitize_component;
///
/// assert_eq!(sanitize_component("a/b c"), "ab_c");
/// assert_eq!(sanitize_component("夜の　配信"), "夜の_配信");
/// ```
pub fn sanitize_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;

    for c in input.trim().chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if UNSAFE_CHARS.contains(&c) || c.is_control() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push('_');
        }
        pending_space = false;
        out.push(c);
    }

    out
}

/// Keep at most `max` characters of `s`.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

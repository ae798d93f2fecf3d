//! # castrec-av
//!
//! External tool handling for castrec.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`check_tool`], [`get_tool_path`]) -- find ffmpeg and
//!   report its version.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout
//!   support for running external processes.
//! - **Transcoding** ([`Transcoder`], [`FfmpegTranscoder`]) -- turn a raw
//!   capture into an mp4.
//!
//! ## Example
//!
//! ```no_run
//! use castrec_av::{FfmpegTranscoder, Transcoder};
//! use std::path::Path;
//!
//! # async fn example() -> castrec_av::Result<()> {
//! let ffmpeg = FfmpegTranscoder::discover(None);
//! if ffmpeg.is_available().await {
//!     ffmpeg
//!         .transcode(Path::new("in.ts"), Path::new("out.mp4"), Some("copy"))
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod command;
mod error;
pub mod tools;
pub mod transcode;

// Re-exports
pub use command::{ToolCommand, ToolOutput};
pub use error::{Error, Result};
pub use tools::{check_tool, check_tools, get_tool_path, require_tool, ToolInfo};
pub use transcode::{FfmpegTranscoder, Transcoder, DEFAULT_ENCODE_OPTION};

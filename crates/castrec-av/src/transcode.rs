//! Raw capture to mp4 transcoding.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Error, Result, ToolCommand};

/// Encode option used when a broadcaster has none configured.
pub const DEFAULT_ENCODE_OPTION: &str = "copy";

/// Upper bound on a single transcode. Long streams re-encoded with a slow
/// preset can legitimately take hours.
pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Converts a finished raw capture into its final container.
///
/// Implementations must leave `input` untouched; deleting the raw capture
/// after a successful transcode is the caller's decision.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Whether the backing tool can run right now.
    async fn is_available(&self) -> bool;

    /// Transcode `input` into `output`.
    ///
    /// `encode_option` is a whitespace-separated list of video codec
    /// arguments; `None` or blank means [`DEFAULT_ENCODE_OPTION`].
    async fn transcode(&self, input: &Path, output: &Path, encode_option: Option<&str>)
        -> Result<()>;
}

/// [`Transcoder`] backed by the ffmpeg CLI.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    /// Use the given ffmpeg executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    /// Resolve ffmpeg from an optional configured path, falling back to PATH.
    ///
    /// Resolution failure is not an error here: availability is checked on
    /// every finalize, so a missing binary only means transcodes are skipped.
    pub fn discover(configured: Option<&Path>) -> Self {
        let program = crate::tools::get_tool_path("ffmpeg", configured)
            .unwrap_or_else(|_| PathBuf::from("ffmpeg"));
        Self::new(program)
    }

    /// Override the transcode timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Path of the ffmpeg executable this transcoder invokes.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Build the ffmpeg argument list for a transcode.
///
/// Produces `-i <input> -c:v <encode tokens...> -c:a copy <output>`.
pub fn ffmpeg_args(input: &Path, output: &Path, encode_option: Option<&str>) -> Vec<String> {
    let encode = encode_option
        .filter(|o| !o.trim().is_empty())
        .unwrap_or(DEFAULT_ENCODE_OPTION);

    let mut args = vec![
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-c:v".to_string(),
    ];
    args.extend(encode.split_whitespace().map(str::to_string));
    args.extend([
        "-c:a".to_string(),
        "copy".to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn is_available(&self) -> bool {
        ToolCommand::new(self.program.clone())
            .arg("-version")
            .timeout(CHECK_TIMEOUT)
            .execute()
            .await
            .is_ok()
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        encode_option: Option<&str>,
    ) -> Result<()> {
        if !input.exists() {
            return Err(Error::file_not_found(input));
        }

        let args = ffmpeg_args(input, output, encode_option);
        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            args = ?args,
            "Starting transcode"
        );

        ToolCommand::new(self.program.clone())
            .args(args)
            .timeout(self.timeout)
            .execute()
            .await?;

        tracing::info!(output = %output.display(), "Transcode completed");
        Ok(())
    }
}

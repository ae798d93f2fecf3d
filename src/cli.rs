use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "castrec")]
#[command(author, version, about = "Scheduled live-stream recorder")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Defaults to `croned` when omitted
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Record every configured streamer on its schedule
    Croned,

    /// Record one streamer now, with optional retries
    Direct {
        /// Streamer screen id
        #[arg(long)]
        streamer: String,

        /// Extra attempts after the first one
        #[arg(long, default_value_t = 0)]
        retries: u32,

        /// Pause between attempts (e.g. 90, 15s, 2m, 1h30m, 500ms)
        #[arg(long, default_value = "15s", value_parser = parse_duration)]
        retry_backoff: Duration,

        /// ffmpeg video encode options (default "copy")
        #[arg(long)]
        encode_option: Option<String>,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

/// Parse a human duration: bare seconds (`90`) or unit-suffixed parts
/// (`15s`, `2m`, `1h30m`, `500ms`).
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(format!("invalid duration {raw:?}: expected a number"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {raw:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs_per_unit = match unit {
            "ms" => {
                total += Duration::from_millis(value);
                continue;
            }
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "" => return Err(format!("invalid duration {raw:?}: missing unit")),
            other => return Err(format!("invalid duration {raw:?}: unknown unit {other:?}")),
        };
        let secs = value
            .checked_mul(secs_per_unit)
            .ok_or_else(|| format!("invalid duration {raw:?}: too large"))?;
        total += Duration::from_secs(secs);
    }

    Ok(total)
}

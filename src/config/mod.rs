mod types;

pub use types::*;

use anyhow::{Context, Result};
use castrec_common::AuthToken;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./config.toml",
        "./castrec.toml",
        "~/.config/castrec/config.toml",
        "/etc/castrec/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            tracing::debug!("Using config file {:?}", path);
            return load_config(path);
        }
    }

    tracing::info!("No config file found; using defaults");
    Ok(Config::default())
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    for (i, streamer) in config.streamers.iter().enumerate() {
        if streamer.screen_id.trim().is_empty() {
            anyhow::bail!("streamers[{}].screen_id is empty", i);
        }
    }

    if config.scheduler.jitter_min_secs > config.scheduler.jitter_max_secs {
        anyhow::bail!(
            "scheduler.jitter_min_secs ({}) is greater than jitter_max_secs ({})",
            config.scheduler.jitter_min_secs,
            config.scheduler.jitter_max_secs
        );
    }

    if config.recording.filename_max_chars < 16 {
        anyhow::bail!(
            "recording.filename_max_chars must be at least 16 (got {})",
            config.recording.filename_max_chars
        );
    }

    Ok(())
}

impl Config {
    /// Credential for the authenticated retry, if one is configured.
    pub fn credential(&self) -> Option<AuthToken> {
        self.origin.cookie.clone().and_then(AuthToken::new)
    }

    /// R2 settings when upload is enabled and complete.
    ///
    /// An enabled but incomplete section is logged and treated as disabled;
    /// recording still works without upload.
    pub fn active_r2(&self) -> Option<&R2Config> {
        let r2 = self.r2.as_ref().filter(|r2| r2.enabled)?;
        let missing = r2.missing_fields();
        if missing.is_empty() {
            Some(r2)
        } else {
            tracing::warn!(
                missing = ?missing,
                "R2 upload is enabled but incomplete. Upload will be disabled."
            );
            None
        }
    }
}

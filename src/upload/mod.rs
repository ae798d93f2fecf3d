//! Artifact upload to object storage.

mod r2;
pub mod sigv4;

pub use r2::R2Uploader;

use std::path::Path;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upload rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid upload endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Signing(#[from] sigv4::SigningError),
}

/// Ships a finished artifact somewhere durable.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `local` under `remote_key`. The local file is left in place.
    async fn upload(&self, local: &Path, remote_key: &str) -> Result<(), UploadError>;
}

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Client, Url};
use tokio_util::io::ReaderStream;

use super::sigv4::{self, CanonicalRequest, Credentials, UNSIGNED_PAYLOAD};
use super::{UploadError, Uploader};
use crate::config::R2Config;

/// Bounds connection setup only; a multi-gigabyte body may legitimately
/// take a long time to stream.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Uploads to Cloudflare R2 (or any S3-compatible store) with path-style
/// `PUT` requests signed with SigV4.
#[derive(Debug)]
pub struct R2Uploader {
    client: Client,
    scheme: String,
    host: String,
    base_path: String,
    bucket: String,
    key_prefix: String,
    credentials: Credentials,
}

impl R2Uploader {
    pub fn new(config: &R2Config) -> Result<Self, UploadError> {
        let endpoint = Url::parse(config.endpoint.trim())
            .map_err(|e| UploadError::InvalidEndpoint(format!("{}: {e}", config.endpoint)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(UploadError::InvalidEndpoint(format!(
                    "{}: missing host",
                    config.endpoint
                )))
            }
        };

        let client = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client: {}", e);
                Client::new()
            });

        Ok(Self {
            client,
            scheme: endpoint.scheme().to_string(),
            host,
            base_path: endpoint.path().trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            key_prefix: config.key_prefix.clone(),
            credentials: Credentials {
                access_key_id: config.access_key_id.clone(),
                secret_access_key: config.secret_access_key.clone(),
                region: config.region.clone(),
            },
        })
    }

    /// Full object key for `remote_key`, prefix included.
    pub fn object_key(&self, remote_key: &str) -> String {
        format!("{}{}", self.key_prefix, remote_key.trim_start_matches('/'))
    }

    fn object_path(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_path,
            self.bucket,
            sigv4::encode_key(key)
        )
    }
}

#[async_trait]
impl Uploader for R2Uploader {
    async fn upload(&self, local: &Path, remote_key: &str) -> Result<(), UploadError> {
        let read_err = |source| UploadError::Read {
            path: local.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(local).await.map_err(read_err)?;
        let len = file.metadata().await.map_err(read_err)?.len();

        let key = self.object_key(remote_key);
        let path = self.object_path(&key);
        let now = Utc::now();
        let amz_date = sigv4::amz_date(now);

        let canonical = CanonicalRequest {
            method: "PUT",
            uri: &path,
            query: "",
            headers: vec![
                ("host", self.host.clone()),
                ("x-amz-content-sha256", UNSIGNED_PAYLOAD.to_string()),
                ("x-amz-date", amz_date.clone()),
            ],
            payload_hash: UNSIGNED_PAYLOAD,
        };
        let authorization = sigv4::authorization(&self.credentials, &canonical, now)?;

        tracing::info!(
            file = %local.display(),
            bucket = %self.bucket,
            key = %key,
            bytes = len,
            "Start uploading"
        );

        let url = format!("{}://{}{}", self.scheme, self.host, path);
        let response = self
            .client
            .put(&url)
            .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
            .header("x-amz-date", amz_date)
            .header(AUTHORIZATION, authorization)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(key = %key, "Completed uploading");
        Ok(())
    }
}

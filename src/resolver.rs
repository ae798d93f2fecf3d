//! Stream endpoint resolution.
//!
//! Asks the origin's status endpoint whether a broadcaster is live and, if
//! so, where the live feed can be pulled from.

use std::time::Duration;

use async_trait::async_trait;
use castrec_common::{AuthToken, BroadcasterId, StreamMode};
use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Upper bound on one status query.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Direct stream variants in preference order.
const DIRECT_VARIANTS: [(&str, StreamMode); 3] = [
    ("/llfmp4/streams/main", StreamMode::Main),
    ("/llfmp4/streams/mobilesource", StreamMode::MobileSource),
    ("/llfmp4/streams/base", StreamMode::Base),
];

/// A playable live endpoint. Produced per resolution and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub url: String,
    pub mode: StreamMode,
    /// Sent as the WebSocket sub-protocol on protected streams.
    pub access_secret: Option<String>,
    pub is_protected: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("live stream is offline")]
    NotLive,

    #[error("malformed stream status response: {0}")]
    MalformedResponse(String),

    #[error("stream status request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("stream resolution cancelled")]
    Cancelled,
}

impl ResolveError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }
}

/// Resolves a broadcaster id into a live endpoint.
#[async_trait]
pub trait StreamResolver: Send + Sync {
    /// Query the origin for `broadcaster`.
    ///
    /// `credential` is attached to the query when present. The call is
    /// abandoned with [`ResolveError::Cancelled`] when `cancel` fires.
    async fn resolve(
        &self,
        broadcaster: &BroadcasterId,
        credential: Option<&AuthToken>,
        cancel: &CancellationToken,
    ) -> Result<StreamEndpoint, ResolveError>;
}

/// [`StreamResolver`] backed by the origin's HTTP status endpoint.
pub struct HttpStreamResolver {
    client: Client,
    api_endpoint: String,
}

impl HttpStreamResolver {
    pub fn new(api_endpoint: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client: {}", e);
                Client::new()
            });

        Self {
            client,
            api_endpoint: api_endpoint.into(),
        }
    }

    async fn fetch(
        &self,
        broadcaster: &BroadcasterId,
        credential: Option<&AuthToken>,
    ) -> Result<StreamEndpoint, ResolveError> {
        let mut request = self
            .client
            .get(&self.api_endpoint)
            .query(&[("target", broadcaster.as_str()), ("mode", "client")]);
        if let Some(token) = credential {
            request = request.header(reqwest::header::COOKIE, token.expose());
        }

        let body = request.send().await?.error_for_status()?.text().await?;
        let status: Value = serde_json::from_str(&body)
            .map_err(|e| ResolveError::malformed(format!("invalid JSON: {e}")))?;

        let endpoint = parse_status(&status)?;
        if !is_direct(&status) {
            tracing::info!(
                streamer = %broadcaster,
                "Direct stream URL not available; using constructed endpoint"
            );
        }
        tracing::debug!(
            streamer = %broadcaster,
            mode = %endpoint.mode,
            protected = endpoint.is_protected,
            "Resolved stream endpoint"
        );
        Ok(endpoint)
    }
}

#[async_trait]
impl StreamResolver for HttpStreamResolver {
    async fn resolve(
        &self,
        broadcaster: &BroadcasterId,
        credential: Option<&AuthToken>,
        cancel: &CancellationToken,
    ) -> Result<StreamEndpoint, ResolveError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolveError::Cancelled),
            result = self.fetch(broadcaster, credential) => result,
        }
    }
}

fn is_direct(status: &Value) -> bool {
    DIRECT_VARIANTS
        .iter()
        .any(|(pointer, _)| non_empty_str(status, pointer).is_some())
}

/// Turn a status document into an endpoint.
///
/// Direct variants win in the order main, mobilesource, base. Without any,
/// the endpoint is built from `fmp4.proto`, `fmp4.host` and `movie.id`, with
/// the mode picked by checking `fmp4.source` before `fmp4.mobilesource`.
pub fn parse_status(status: &Value) -> Result<StreamEndpoint, ResolveError> {
    let live = status
        .pointer("/movie/live")
        .and_then(Value::as_bool)
        .ok_or_else(|| ResolveError::malformed("movie.live missing or not a bool"))?;
    if !live {
        return Err(ResolveError::NotLive);
    }

    let is_protected = status
        .pointer("/movie/protected")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let access_secret = non_empty_str(status, "/movie/password").map(str::to_string);

    for (pointer, mode) in DIRECT_VARIANTS {
        if let Some(url) = non_empty_str(status, pointer) {
            return Ok(StreamEndpoint {
                url: url.to_string(),
                mode,
                access_secret,
                is_protected,
            });
        }
    }

    let mode = fallback_mode(status);
    let proto = non_empty_str(status, "/fmp4/proto")
        .ok_or_else(|| ResolveError::malformed("fmp4.proto missing"))?;
    let host = non_empty_str(status, "/fmp4/host")
        .ok_or_else(|| ResolveError::malformed("fmp4.host missing"))?;
    let movie_id =
        movie_id(status).ok_or_else(|| ResolveError::malformed("movie.id missing"))?;

    Ok(StreamEndpoint {
        url: format!("{proto}://{host}/ws.app/stream/{movie_id}/fmp4/bd/1/1500?mode={mode}"),
        mode,
        access_secret,
        is_protected,
    })
}

fn fallback_mode(status: &Value) -> StreamMode {
    let flag = |pointer: &str| {
        status
            .pointer(pointer)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    };

    if flag("/fmp4/source") {
        StreamMode::Main
    } else if flag("/fmp4/mobilesource") {
        StreamMode::MobileSource
    } else {
        StreamMode::Base
    }
}

fn movie_id(status: &Value) -> Option<String> {
    match status.pointer("/movie/id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_empty_str<'a>(status: &'a Value, pointer: &str) -> Option<&'a str> {
    status
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

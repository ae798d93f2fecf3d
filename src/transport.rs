//! Live transport: the duplex connection a session pulls chunks from.
//!
//! The session only sees [`Transport`] and [`LiveFeed`]; [`WsTransport`] is
//! the WebSocket implementation used against the real origin.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use castrec_common::AuthToken;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::resolver::StreamEndpoint;

/// Upper bound on establishing a live connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server answered the upgrade with a non-101 status.
    #[error("handshake rejected with HTTP {status}")]
    HandshakeRejected { status: u16 },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect cancelled")]
    Cancelled,

    #[error("stream error: {0}")]
    Stream(String),
}

impl TransportError {
    /// Whether the failure may be fixed by retrying with a credential.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::HandshakeRejected { .. })
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Self::HandshakeRejected {
                status: response.status().as_u16(),
            },
            other => Self::Connect(other.to_string()),
        }
    }
}

/// Opens live feeds.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        endpoint: &StreamEndpoint,
        credential: Option<&AuthToken>,
    ) -> Result<Box<dyn LiveFeed>, TransportError>;
}

/// An established live connection.
#[async_trait]
pub trait LiveFeed: Send {
    /// Next binary chunk, in delivery order. `None` once the peer has closed.
    async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>>;

    /// Close the connection. Errors are swallowed; the feed is done either way.
    async fn close(&mut self);
}

/// Connect through `transport`, bounded by `timeout` and by `cancel`.
pub async fn connect_with_timeout(
    transport: &dyn Transport,
    endpoint: &StreamEndpoint,
    credential: Option<&AuthToken>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn LiveFeed>, TransportError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = tokio::time::timeout(timeout, transport.connect(endpoint, credential)) => {
            result.unwrap_or(Err(TransportError::Timeout(timeout)))
        }
    }
}

/// WebSocket [`Transport`].
///
/// Sends the browser-like headers the origin expects, the endpoint's access
/// secret as the sub-protocol, and the credential as a cookie.
#[derive(Debug, Clone)]
pub struct WsTransport {
    origin: String,
    user_agent: String,
}

impl WsTransport {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::Connect(format!("invalid {name} header: {e}")))
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(
        &self,
        endpoint: &StreamEndpoint,
        credential: Option<&AuthToken>,
    ) -> Result<Box<dyn LiveFeed>, TransportError> {
        let mut request = endpoint.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Origin", header_value("Origin", &self.origin)?);
        headers.insert("User-Agent", header_value("User-Agent", &self.user_agent)?);
        if let Some(secret) = &endpoint.access_secret {
            headers.insert(
                "Sec-WebSocket-Protocol",
                header_value("Sec-WebSocket-Protocol", secret)?,
            );
        }
        if let Some(token) = credential {
            headers.insert("Cookie", header_value("Cookie", token.expose())?);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request).await?;
        tracing::debug!(status = %response.status(), mode = %endpoint.mode, "WebSocket connected");

        Ok(Box::new(WsFeed { stream }))
    }
}

struct WsFeed {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveFeed for WsFeed {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => {
                    tracing::debug!(message = %text, "Received text message");
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(frame = ?frame, "Peer closed live stream");
                    return None;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                }
                Err(e) => return Some(Err(TransportError::Stream(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::trace!("WebSocket close: {e}");
        }
        // Give the peer a moment to answer the close frame.
        let drain = async { while let Some(Ok(_)) = self.stream.next().await {} };
        let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
    }
}

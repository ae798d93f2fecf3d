//! The per-attempt recording state machine.
//!
//! ```text
//! Resolving -> Sinking -> Streaming -> Completed -> Finalizing (own task)
//!                             |
//!                             +-- handshake rejected, first attempt,
//!                                 credential configured
//!                                   -> AuthRetry -> Resolving (with credential)
//! ```
//!
//! Each attempt owns a fresh [`RecordingSession`]. The authenticated retry
//! consumes the first session and builds a new one, and [`Attempt`] has no
//! successor after [`Attempt::Retry`], so a second retry cannot be expressed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use castrec_common::paths::{ArtifactPaths, DEFAULT_MAX_STEM_CHARS};
use castrec_common::{AuthToken, BroadcasterId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::Shutdown;
use crate::resolver::{ResolveError, StreamEndpoint, StreamResolver};
use crate::sink::{self, FinalizeReport, Finalizer, SinkError, SinkHandle, DEFAULT_MIN_VIABLE_BYTES};
use crate::title::TitleLookup;
use crate::transport::{self, LiveFeed, Transport, TransportError, CONNECT_TIMEOUT};

/// Which attempt of a session this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Unauthenticated.
    First,
    /// The single authenticated retry after a handshake rejection.
    Retry,
}

impl Attempt {
    /// The attempt that may follow this one, if any.
    pub fn next(self) -> Option<Attempt> {
        match self {
            Attempt::First => Some(Attempt::Retry),
            Attempt::Retry => None,
        }
    }

    fn credential(self, configured: Option<&AuthToken>) -> Option<&AuthToken> {
        match self {
            Attempt::First => None,
            Attempt::Retry => configured,
        }
    }
}

/// What to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordJob {
    pub broadcaster: BroadcasterId,
    pub encode_option: Option<String>,
}

impl RecordJob {
    pub fn new(broadcaster: BroadcasterId, encode_option: Option<String>) -> Self {
        Self {
            broadcaster,
            encode_option,
        }
    }
}

/// Immutable facts about one recording attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub broadcaster: BroadcasterId,
    pub title: String,
    pub encode_option: Option<String>,
    pub is_protected: bool,
}

/// One recording attempt: its descriptor, cancellation token, and artifacts.
#[derive(Debug)]
pub struct RecordingSession {
    pub descriptor: SessionDescriptor,
    pub attempt: Attempt,
    pub cancel: CancellationToken,
    pub paths: ArtifactPaths,
}

impl RecordingSession {
    /// End this attempt and hand back the attempt that replaces it.
    ///
    /// Cancels this session's token. Returns `None` when no retry is left.
    pub fn into_retry(self) -> Option<Attempt> {
        self.cancel.cancel();
        self.attempt.next()
    }
}

/// How the live stream ended for a recorded session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    PeerClosed,
    StreamError,
    SinkFailed,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("stream resolution failed: {0}")]
    Resolve(#[source] ResolveError),

    #[error("could not open recording sink: {0}")]
    SinkOpen(#[source] SinkError),

    #[error("live connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("recording write failed: {0}")]
    Write(#[source] SinkError),
}

/// A session that streamed into its sink and was handed to finalize.
#[derive(Debug)]
pub struct RecordedSession {
    pub descriptor: SessionDescriptor,
    pub attempt: Attempt,
    pub paths: ArtifactPaths,
    pub bytes_written: u64,
    pub end: StreamEnd,
    pub finalize: JoinHandle<FinalizeReport>,
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// The broadcaster is offline. Nothing was created.
    NotLive,
    /// The attempt was abandoned; undersized artifacts were removed.
    Failed {
        attempt: Attempt,
        error: SessionError,
    },
    Recorded(RecordedSession),
}

impl SessionOutcome {
    pub fn is_recorded(&self) -> bool {
        matches!(self, SessionOutcome::Recorded(_))
    }
}

/// Runs one session for a job. The drivers only depend on this.
#[async_trait]
pub trait SessionRunner: Send + Sync {
    async fn run(&self, job: &RecordJob) -> SessionOutcome;
}

/// Tunables for [`Recorder`].
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub base_dir: PathBuf,
    pub max_stem_chars: usize,
    pub min_viable_bytes: u64,
    pub connect_timeout: Duration,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./file"),
            max_stem_chars: DEFAULT_MAX_STEM_CHARS,
            min_viable_bytes: DEFAULT_MIN_VIABLE_BYTES,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

/// Outcome of a single attempt, before the retry decision.
enum Step {
    Done(SessionOutcome),
    Rejected {
        session: RecordingSession,
        error: TransportError,
    },
}

/// The recording engine: drives sessions through resolve, sink, stream and
/// finalize.
pub struct Recorder {
    resolver: Arc<dyn StreamResolver>,
    titles: Arc<dyn TitleLookup>,
    transport: Arc<dyn Transport>,
    finalizer: Finalizer,
    shutdown: Shutdown,
    credential: Option<AuthToken>,
    settings: RecorderSettings,
}

impl Recorder {
    pub fn new(
        resolver: Arc<dyn StreamResolver>,
        titles: Arc<dyn TitleLookup>,
        transport: Arc<dyn Transport>,
        finalizer: Finalizer,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            resolver,
            titles,
            transport,
            finalizer,
            shutdown,
            credential: None,
            settings: RecorderSettings::default(),
        }
    }

    /// Credential used for the authenticated retry.
    pub fn with_credential(mut self, credential: Option<AuthToken>) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_settings(mut self, settings: RecorderSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Record `job` once, including at most one authenticated retry.
    pub async fn record(&self, job: &RecordJob) -> SessionOutcome {
        let (session, error) = match self.attempt(job, Attempt::First, None).await {
            Step::Done(outcome) => return outcome,
            Step::Rejected { session, error } => (session, error),
        };

        let title = session.descriptor.title.clone();
        let raw = session.paths.raw.clone();
        let Some(next) = session.into_retry() else {
            return self.fail(Attempt::First, &raw, SessionError::Connect(error)).await;
        };

        tracing::warn!(
            streamer = %job.broadcaster,
            error = %error,
            "Authentication error. Retrying with credential"
        );
        self.remove_if_small(&raw).await;

        match self.attempt(job, next, Some(title)).await {
            Step::Done(outcome) => outcome,
            Step::Rejected { session, error } => {
                let raw = session.paths.raw.clone();
                session.cancel.cancel();
                self.fail(session.attempt, &raw, SessionError::Connect(error))
                    .await
            }
        }
    }

    async fn attempt(&self, job: &RecordJob, attempt: Attempt, title: Option<String>) -> Step {
        let streamer = &job.broadcaster;
        let cancel = self.shutdown.session_token();
        let credential = attempt.credential(self.credential.as_ref());

        // Resolving
        let endpoint = match self.resolver.resolve(streamer, credential, &cancel).await {
            Ok(endpoint) => endpoint,
            Err(ResolveError::NotLive) => {
                tracing::debug!(streamer = %streamer, "Live stream is offline");
                return Step::Done(SessionOutcome::NotLive);
            }
            Err(e) => {
                if matches!(e, ResolveError::MalformedResponse(_)) {
                    tracing::warn!(streamer = %streamer, ?attempt, "Error fetching stream info: {}", e);
                } else {
                    tracing::debug!(streamer = %streamer, ?attempt, "Error fetching stream info: {}", e);
                }
                return Step::Done(SessionOutcome::Failed {
                    attempt,
                    error: SessionError::Resolve(e),
                });
            }
        };
        tracing::info!(
            streamer = %streamer,
            mode = %endpoint.mode,
            protected = endpoint.is_protected,
            ?attempt,
            "Live stream found"
        );

        let title = match title {
            Some(title) => title,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(streamer = %streamer, ?attempt, "Cancelled during title lookup");
                    return Step::Done(SessionOutcome::Failed {
                        attempt,
                        error: SessionError::Resolve(ResolveError::Cancelled),
                    });
                }
                title = self.lookup_title(streamer) => title,
            },
        };

        let session = RecordingSession {
            paths: ArtifactPaths::new(
                &self.settings.base_dir,
                streamer.as_str(),
                &title,
                endpoint.is_protected,
                chrono::Local::now().naive_local(),
                self.settings.max_stem_chars,
            ),
            descriptor: SessionDescriptor {
                broadcaster: streamer.clone(),
                title,
                encode_option: job.encode_option.clone(),
                is_protected: endpoint.is_protected,
            },
            attempt,
            cancel,
        };

        // Sinking
        let (handle, task) = match sink::open(&session.paths, session.cancel.clone()).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!(streamer = %streamer, "Error creating recording file: {}", e);
                session.cancel.cancel();
                return Step::Done(SessionOutcome::Failed {
                    attempt,
                    error: SessionError::SinkOpen(e),
                });
            }
        };

        // Streaming
        let feed = match self.connect(&session, &endpoint, credential).await {
            Ok(feed) => feed,
            Err(error) => {
                handle.close();
                task.wait().await;

                if error.is_auth_rejection() && self.credential.is_some() && attempt == Attempt::First {
                    return Step::Rejected { session, error };
                }

                tracing::warn!(streamer = %streamer, ?attempt, "Connection failed: {}", error);
                session.cancel.cancel();
                let raw = session.paths.raw.clone();
                return Step::Done(self.fail(attempt, &raw, SessionError::Connect(error)).await);
            }
        };

        tracing::info!(
            streamer = %streamer,
            file = %session.paths.raw.display(),
            "Connected to live stream, recording start"
        );
        let end = pump(feed, &handle, &session.cancel).await;
        handle.close();
        let report = task.wait().await;
        session.cancel.cancel();

        if let Some(e) = report.error {
            let raw = session.paths.raw.clone();
            return Step::Done(self.fail(attempt, &raw, SessionError::Write(e)).await);
        }

        tracing::info!(
            streamer = %streamer,
            bytes = report.bytes_written,
            end = ?end,
            "Recording finished"
        );

        let finalize = self
            .finalizer
            .spawn(session.paths.clone(), session.descriptor.encode_option.clone());

        Step::Done(SessionOutcome::Recorded(RecordedSession {
            descriptor: session.descriptor,
            attempt,
            paths: session.paths,
            bytes_written: report.bytes_written,
            end,
            finalize,
        }))
    }

    async fn connect(
        &self,
        session: &RecordingSession,
        endpoint: &StreamEndpoint,
        credential: Option<&AuthToken>,
    ) -> Result<Box<dyn LiveFeed>, TransportError> {
        transport::connect_with_timeout(
            self.transport.as_ref(),
            endpoint,
            credential,
            self.settings.connect_timeout,
            &session.cancel,
        )
        .await
    }

    async fn lookup_title(&self, streamer: &BroadcasterId) -> String {
        match self.titles.title(streamer).await {
            Ok(title) => {
                tracing::info!(streamer = %streamer, title = %title, "Stream title");
                title
            }
            Err(e) => {
                tracing::warn!(streamer = %streamer, "Error fetching stream title: {:#}", e);
                String::new()
            }
        }
    }

    async fn fail(&self, attempt: Attempt, raw: &Path, error: SessionError) -> SessionOutcome {
        tracing::warn!(?attempt, file = %raw.display(), "Recording failed: {}", error);
        self.remove_if_small(raw).await;
        SessionOutcome::Failed { attempt, error }
    }

    async fn remove_if_small(&self, raw: &Path) {
        if let Err(e) = sink::remove_if_below_threshold(raw, self.settings.min_viable_bytes).await
        {
            tracing::warn!(file = %raw.display(), "Failed to remove undersized recording: {}", e);
        }
    }
}

#[async_trait]
impl SessionRunner for Recorder {
    async fn run(&self, job: &RecordJob) -> SessionOutcome {
        self.record(job).await
    }
}

/// Forward chunks from `feed` into `sink` until either side stops.
async fn pump(
    mut feed: Box<dyn LiveFeed>,
    sink: &SinkHandle,
    cancel: &CancellationToken,
) -> StreamEnd {
    // A failing drain cancels the session too; tell the two apart.
    let stopped = || {
        if sink.is_closed() {
            StreamEnd::SinkFailed
        } else {
            StreamEnd::Cancelled
        }
    };

    let end = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break stopped(),
            chunk = feed.next_chunk() => chunk,
        };

        match chunk {
            None => break StreamEnd::PeerClosed,
            Some(Err(e)) => {
                tracing::warn!("Live stream error: {}", e);
                break StreamEnd::StreamError;
            }
            Some(Ok(data)) => {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break stopped(),
                    sent = sink.send(data) => sent,
                };
                if sent.is_err() {
                    break StreamEnd::SinkFailed;
                }
            }
        }
    };

    feed.close().await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_has_no_successor() {
        assert_eq!(Attempt::First.next(), Some(Attempt::Retry));
        assert_eq!(Attempt::Retry.next(), None);
    }

    #[test]
    fn only_retry_uses_credential() {
        let token = AuthToken::new("tc_ss=abc");
        assert!(Attempt::First.credential(token.as_ref()).is_none());
        assert_eq!(
            Attempt::Retry.credential(token.as_ref()).map(AuthToken::expose),
            Some("tc_ss=abc")
        );
    }

    #[tokio::test]
    async fn into_retry_cancels_session_token() {
        let shutdown = Shutdown::default();
        let session = RecordingSession {
            descriptor: SessionDescriptor {
                broadcaster: BroadcasterId::parse("caster").unwrap(),
                title: String::new(),
                encode_option: None,
                is_protected: false,
            },
            attempt: Attempt::First,
            cancel: shutdown.session_token(),
            paths: ArtifactPaths::new(
                Path::new("/tmp"),
                "caster",
                "",
                false,
                chrono::Local::now().naive_local(),
                120,
            ),
        };
        let token = session.cancel.clone();

        assert_eq!(session.into_retry(), Some(Attempt::Retry));
        assert!(token.is_cancelled());
        assert!(!shutdown.root_token().is_cancelled());
    }

    struct ChunkFeed {
        chunks: Vec<bytes::Bytes>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl LiveFeed for ChunkFeed {
        async fn next_chunk(&mut self) -> Option<Result<bytes::Bytes, TransportError>> {
            if self.chunks.is_empty() {
                return None;
            }
            Some(Ok(self.chunks.remove(0)))
        }

        async fn close(&mut self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn pump_forwards_until_peer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(
            dir.path(),
            "caster",
            "t",
            false,
            chrono::Local::now().naive_local(),
            120,
        );
        let cancel = CancellationToken::new();
        let (handle, task) = sink::open(&paths, cancel.clone()).await.unwrap();
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let feed = Box::new(ChunkFeed {
            chunks: vec![
                bytes::Bytes::from("b1"),
                bytes::Bytes::from("b2"),
                bytes::Bytes::from("b3"),
            ],
            closed: closed.clone(),
        });

        let end = pump(feed, &handle, &cancel).await;
        handle.close();
        task.wait().await;

        assert_eq!(end, StreamEnd::PeerClosed);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(std::fs::read(&paths.raw).unwrap(), b"b1b2b3");
    }

    /// Yields `chunk` until `fail_after` chunks, then a stream error (or
    /// forever when `fail_after` is `None`).
    struct RepeatFeed {
        chunk: bytes::Bytes,
        fail_after: Option<usize>,
        sent: usize,
    }

    #[async_trait]
    impl LiveFeed for RepeatFeed {
        async fn next_chunk(&mut self) -> Option<Result<bytes::Bytes, TransportError>> {
            if self.fail_after == Some(self.sent) {
                return Some(Err(TransportError::Stream("connection reset".into())));
            }
            self.sent += 1;
            Some(Ok(self.chunk.clone()))
        }

        async fn close(&mut self) {}
    }

    #[tokio::test]
    async fn pump_stops_on_stream_error() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(
            dir.path(),
            "caster",
            "t",
            false,
            chrono::Local::now().naive_local(),
            120,
        );
        let cancel = CancellationToken::new();
        let (handle, task) = sink::open(&paths, cancel.clone()).await.unwrap();
        let feed = Box::new(RepeatFeed {
            chunk: bytes::Bytes::from("ab"),
            fail_after: Some(2),
            sent: 0,
        });

        let end = pump(feed, &handle, &cancel).await;
        handle.close();
        let report = task.wait().await;

        assert_eq!(end, StreamEnd::StreamError);
        assert!(!cancel.is_cancelled());
        assert!(report.error.is_none());
        assert_eq!(std::fs::read(&paths.raw).unwrap(), b"abab");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn pump_stops_when_sink_fails() {
        let paths = ArtifactPaths {
            dir: PathBuf::from("/dev"),
            raw: PathBuf::from("/dev/full"),
            transcoded: PathBuf::from("/dev/full.mp4"),
        };
        let cancel = CancellationToken::new();
        let (handle, task) = sink::open(&paths, cancel.clone()).await.unwrap();
        let feed = Box::new(RepeatFeed {
            chunk: bytes::Bytes::from(vec![0u8; 64 * 1024]),
            fail_after: None,
            sent: 0,
        });

        let end = tokio::time::timeout(Duration::from_secs(5), pump(feed, &handle, &cancel))
            .await
            .expect("pump kept running after the sink failed");
        handle.close();
        let report = task.wait().await;

        assert_eq!(end, StreamEnd::SinkFailed);
        assert!(cancel.is_cancelled());
        assert!(matches!(report.error, Some(SinkError::Write { .. })));
    }
}

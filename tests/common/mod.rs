//! Shared test harness for engine integration tests.
//!
//! Provides [`TestHarness`], which wires a [`Recorder`] to scripted fakes for
//! every collaborator (resolver, title lookup, transport, transcoder,
//! uploader) and a temporary recording directory.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use castrec::lifecycle::Shutdown;
use castrec::resolver::{ResolveError, StreamEndpoint, StreamResolver};
use castrec::session::{RecordJob, Recorder, RecorderSettings};
use castrec::sink::Finalizer;
use castrec::title::TitleLookup;
use castrec::transport::{LiveFeed, Transport, TransportError};
use castrec::upload::{UploadError, Uploader};
use castrec_av::Transcoder;
use castrec_common::{AuthToken, BroadcasterId, StreamMode};

pub const CREDENTIAL: &str = "tc_ss=secret-cookie";

pub fn endpoint(protected: bool) -> StreamEndpoint {
    StreamEndpoint {
        url: "wss://origin.example/ws.app/stream/123/fmp4/bd/1/1500?mode=main".into(),
        mode: StreamMode::Main,
        access_secret: protected.then(|| "pass".to_string()),
        is_protected: protected,
    }
}

pub fn chunks(parts: &[&'static str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(*p)).collect()
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Returns queued results in order; `NotLive` once the queue is empty.
#[derive(Default)]
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<StreamEndpoint, ResolveError>>>,
    pub credentials: Mutex<Vec<Option<String>>>,
}

impl ScriptedResolver {
    pub fn push(&self, result: Result<StreamEndpoint, ResolveError>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> Vec<Option<String>> {
        self.credentials.lock().clone()
    }
}

#[async_trait]
impl StreamResolver for ScriptedResolver {
    async fn resolve(
        &self,
        _broadcaster: &BroadcasterId,
        credential: Option<&AuthToken>,
        _cancel: &CancellationToken,
    ) -> Result<StreamEndpoint, ResolveError> {
        self.credentials
            .lock()
            .push(credential.map(|c| c.expose().to_string()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or(Err(ResolveError::NotLive))
    }
}

// ---------------------------------------------------------------------------
// Title lookup
// ---------------------------------------------------------------------------

pub struct StaticTitle(pub Option<&'static str>);

#[async_trait]
impl TitleLookup for StaticTitle {
    async fn title(&self, _broadcaster: &BroadcasterId) -> anyhow::Result<String> {
        match self.0 {
            Some(title) => Ok(title.to_string()),
            None => anyhow::bail!("stream page unavailable"),
        }
    }
}

/// Never answers.
pub struct PendingTitle;

#[async_trait]
impl TitleLookup for PendingTitle {
    async fn title(&self, _broadcaster: &BroadcasterId) -> anyhow::Result<String> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub enum Connect {
    /// Handshake rejected with this HTTP status.
    Reject(u16),
    /// Never completes.
    Hang,
    /// Delivers these chunks, then the peer closes.
    Chunks(Vec<Bytes>),
    /// Delivers whatever is sent on the channel until the sender is dropped.
    Live(mpsc::Receiver<Bytes>),
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Connect>>,
    pub credentials: Mutex<Vec<Option<String>>>,
}

impl ScriptedTransport {
    pub fn push(&self, connect: Connect) {
        self.script.lock().push_back(connect);
    }

    pub fn calls(&self) -> Vec<Option<String>> {
        self.credentials.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        _endpoint: &StreamEndpoint,
        credential: Option<&AuthToken>,
    ) -> Result<Box<dyn LiveFeed>, TransportError> {
        self.credentials
            .lock()
            .push(credential.map(|c| c.expose().to_string()));
        let next = self.script.lock().pop_front();
        match next {
            Some(Connect::Reject(status)) => Err(TransportError::HandshakeRejected { status }),
            Some(Connect::Hang) => std::future::pending().await,
            Some(Connect::Chunks(chunks)) => Ok(Box::new(VecFeed(chunks.into()))),
            Some(Connect::Live(rx)) => Ok(Box::new(ChannelFeed(rx))),
            None => Err(TransportError::Connect("connection refused".into())),
        }
    }
}

struct VecFeed(VecDeque<Bytes>);

#[async_trait]
impl LiveFeed for VecFeed {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.0.pop_front().map(Ok)
    }

    async fn close(&mut self) {}
}

struct ChannelFeed(mpsc::Receiver<Bytes>);

#[async_trait]
impl LiveFeed for ChannelFeed {
    async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.0.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.0.close();
    }
}

// ---------------------------------------------------------------------------
// Finalize collaborators
// ---------------------------------------------------------------------------

/// Copies input to output, recording the encode options it was given.
pub struct CopyTranscoder {
    pub available: bool,
    pub calls: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Transcoder for CopyTranscoder {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        encode_option: Option<&str>,
    ) -> castrec_av::Result<()> {
        self.calls.lock().push(encode_option.map(str::to_string));
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingUploader {
    pub keys: Mutex<Vec<String>>,
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, _local: &Path, remote_key: &str) -> Result<(), UploadError> {
        self.keys.lock().push(remote_key.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub dir: TempDir,
    pub shutdown: Shutdown,
    pub resolver: Arc<ScriptedResolver>,
    pub transport: Arc<ScriptedTransport>,
    pub transcoder: Arc<CopyTranscoder>,
    pub uploader: Arc<RecordingUploader>,
    pub title: Option<&'static str>,
    pub title_hangs: bool,
    pub credential: Option<AuthToken>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create temp dir"),
            shutdown: Shutdown::new(Duration::from_millis(50)),
            resolver: Arc::new(ScriptedResolver::default()),
            transport: Arc::new(ScriptedTransport::default()),
            transcoder: Arc::new(CopyTranscoder {
                available: true,
                calls: Mutex::new(Vec::new()),
            }),
            uploader: Arc::new(RecordingUploader::default()),
            title: Some("night talk"),
            title_hangs: false,
            credential: None,
        }
    }

    pub fn with_credential(mut self) -> Self {
        self.credential = AuthToken::new(CREDENTIAL);
        self
    }

    pub fn without_title(mut self) -> Self {
        self.title = None;
        self
    }

    pub fn with_hanging_title(mut self) -> Self {
        self.title_hangs = true;
        self
    }

    pub fn base_dir(&self) -> PathBuf {
        self.dir.path().join("file")
    }

    pub fn broadcaster_dir(&self) -> PathBuf {
        self.base_dir().join("caster")
    }

    pub fn job(&self) -> RecordJob {
        RecordJob::new(BroadcasterId::parse("caster").unwrap(), None)
    }

    pub fn recorder(&self) -> Recorder {
        let finalizer = Finalizer::new(
            self.transcoder.clone(),
            Some(self.uploader.clone()),
            self.shutdown.clone(),
        );
        let titles: Arc<dyn TitleLookup> = if self.title_hangs {
            Arc::new(PendingTitle)
        } else {
            Arc::new(StaticTitle(self.title))
        };
        Recorder::new(
            self.resolver.clone(),
            titles,
            self.transport.clone(),
            finalizer,
            self.shutdown.clone(),
        )
        .with_credential(self.credential.clone())
        .with_settings(RecorderSettings {
            base_dir: self.base_dir(),
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        })
    }

    /// Raw captures currently on disk for the test broadcaster.
    pub fn raw_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.broadcaster_dir()) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "ts"))
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

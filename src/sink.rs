//! Sink pipeline: a bounded chunk queue drained into an append-only raw
//! capture, followed by the finalize step (upload, transcode, cleanup).
//!
//! Exactly one drain task owns the file. Dropping every [`SinkHandle`] is
//! the only way to tell it no more data is coming.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use castrec_av::Transcoder;
use castrec_common::paths::ArtifactPaths;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::lifecycle::Shutdown;
use crate::upload::Uploader;

/// Chunks buffered between the transport and the drain task.
pub const CHANNEL_CAPACITY: usize = 16;

/// Captures smaller than this are treated as failed attempts.
pub const DEFAULT_MIN_VIABLE_BYTES: u64 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create recording directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to open recording file {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },

    #[error("failed to write recording file {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    fn create_dir(path: &Path, source: io::Error) -> Self {
        Self::CreateDir {
            path: path.to_path_buf(),
            source,
        }
    }

    fn open(path: &Path, source: io::Error) -> Self {
        Self::Open {
            path: path.to_path_buf(),
            source,
        }
    }

    fn write(path: &Path, source: io::Error) -> Self {
        Self::Write {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Producer side of an open sink.
#[derive(Debug)]
pub struct SinkHandle {
    tx: mpsc::Sender<Bytes>,
}

impl SinkHandle {
    /// Queue a chunk, waiting while the buffer is full.
    ///
    /// Fails with [`SinkError::Closed`] once the drain task has stopped.
    pub async fn send(&self, chunk: Bytes) -> Result<(), SinkError> {
        self.tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    /// Whether the drain task has stopped accepting chunks.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close the sink. Queued chunks are still written.
    pub fn close(self) {}
}

/// Result of draining one sink.
#[derive(Debug)]
pub struct WriteReport {
    pub path: PathBuf,
    pub bytes_written: u64,
    /// Set when the drain stopped on a write failure.
    pub error: Option<SinkError>,
}

/// The drain task of an open sink.
#[derive(Debug)]
pub struct SinkTask {
    path: PathBuf,
    handle: JoinHandle<WriteReport>,
}

impl SinkTask {
    /// Wait for the drain task to flush and close the file.
    pub async fn wait(self) -> WriteReport {
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(file = %self.path.display(), "Sink drain task failed: {}", e);
                let error = SinkError::write(&self.path, io::Error::other(e.to_string()));
                WriteReport {
                    path: self.path,
                    bytes_written: 0,
                    error: Some(error),
                }
            }
        }
    }
}

/// Open the raw capture for `paths` and spawn its drain task.
///
/// Creates the base and per-broadcaster directories as needed and opens the
/// file for create+append. A write failure cancels `cancel`.
pub async fn open(
    paths: &ArtifactPaths,
    cancel: CancellationToken,
) -> Result<(SinkHandle, SinkTask), SinkError> {
    tokio::fs::create_dir_all(&paths.dir)
        .await
        .map_err(|e| SinkError::create_dir(&paths.dir, e))?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.raw)
        .await
        .map_err(|e| SinkError::open(&paths.raw, e))?;

    tracing::info!(file = %paths.raw.display(), "Recording file opened");

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let path = paths.raw.clone();
    let handle = tokio::spawn(drain(file, rx, cancel, path.clone()));

    Ok((SinkHandle { tx }, SinkTask { path, handle }))
}

async fn drain(
    mut file: File,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    path: PathBuf,
) -> WriteReport {
    let mut bytes_written = 0u64;
    let mut error = None;

    while let Some(chunk) = rx.recv().await {
        if let Err(e) = file.write_all(&chunk).await {
            error = Some(e);
            break;
        }
        bytes_written += chunk.len() as u64;
    }

    if error.is_none() {
        if let Err(e) = file.flush().await {
            error = Some(e);
        }
    }

    let error = error.map(|e| {
        tracing::error!(file = %path.display(), "Error writing recording file: {}", e);
        rx.close();
        cancel.cancel();
        SinkError::write(&path, e)
    });

    drop(file);
    if error.is_none() {
        tracing::info!(
            file = %path.display(),
            bytes = bytes_written,
            "Completed writing all data"
        );
    }

    WriteReport {
        path,
        bytes_written,
        error,
    }
}

/// Delete `path` when it is smaller than `threshold` bytes.
///
/// A missing file is not an error. Returns whether the file was removed.
pub async fn remove_if_below_threshold(path: &Path, threshold: u64) -> io::Result<bool> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.len() >= threshold {
        return Ok(false);
    }

    tokio::fs::remove_file(path).await?;
    tracing::info!(
        file = %path.display(),
        bytes = metadata.len(),
        "Removed undersized recording"
    );
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeOutcome {
    Transcoded,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Skipped,
    Failed,
}

/// What finalize did with one capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    pub raw_upload: UploadOutcome,
    pub transcode: TranscodeOutcome,
    pub transcoded_upload: UploadOutcome,
    pub raw_retained: bool,
}

impl FinalizeReport {
    pub fn skipped() -> Self {
        Self {
            raw_upload: UploadOutcome::Skipped,
            transcode: TranscodeOutcome::Skipped,
            transcoded_upload: UploadOutcome::Skipped,
            raw_retained: true,
        }
    }
}

/// Post-recording processing for finished captures.
#[derive(Clone)]
pub struct Finalizer {
    transcoder: Arc<dyn Transcoder>,
    uploader: Option<Arc<dyn Uploader>>,
    shutdown: Shutdown,
    tracker: TaskTracker,
}

impl Finalizer {
    pub fn new(
        transcoder: Arc<dyn Transcoder>,
        uploader: Option<Arc<dyn Uploader>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            transcoder,
            uploader,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Run [`Finalizer::finalize`] on its own task.
    pub fn spawn(
        &self,
        paths: ArtifactPaths,
        encode_option: Option<String>,
    ) -> JoinHandle<FinalizeReport> {
        let finalizer = self.clone();
        self.tracker
            .spawn(async move { finalizer.finalize(&paths, encode_option.as_deref()).await })
    }

    /// Stop accepting work and wait for every spawned finalize to finish.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Upload the raw capture, transcode it, and upload the result.
    ///
    /// Skipped entirely while the process is terminating. The raw capture is
    /// deleted only after a successful transcode.
    pub async fn finalize(&self, paths: &ArtifactPaths, encode_option: Option<&str>) -> FinalizeReport {
        if self.shutdown.is_terminating() {
            tracing::info!(file = %paths.raw.display(), "Terminating; skipping finalize");
            return FinalizeReport::skipped();
        }

        let raw_upload = self.upload(&paths.raw).await;

        if !self.transcoder.is_available().await {
            tracing::warn!("ffmpeg is not available, skipping conversion to mp4");
            return FinalizeReport {
                raw_upload,
                ..FinalizeReport::skipped()
            };
        }

        tracing::info!(
            input = %paths.raw.display(),
            output = %paths.transcoded.display(),
            encode_option = encode_option.unwrap_or(castrec_av::DEFAULT_ENCODE_OPTION),
            "Start converting"
        );
        if let Err(e) = self
            .transcoder
            .transcode(&paths.raw, &paths.transcoded, encode_option)
            .await
        {
            tracing::error!(file = %paths.raw.display(), "Conversion failed, keeping raw recording: {}", e);
            return FinalizeReport {
                raw_upload,
                transcode: TranscodeOutcome::Failed,
                transcoded_upload: UploadOutcome::Skipped,
                raw_retained: true,
            };
        }
        tracing::info!(file = %paths.transcoded.display(), "Conversion completed");

        let raw_retained = match tokio::fs::remove_file(&paths.raw).await {
            Ok(()) => {
                tracing::info!(file = %paths.raw.display(), "Removed raw recording");
                false
            }
            Err(e) => {
                tracing::warn!(file = %paths.raw.display(), "Failed to remove raw recording: {}", e);
                true
            }
        };

        let transcoded_upload = self.upload(&paths.transcoded).await;

        FinalizeReport {
            raw_upload,
            transcode: TranscodeOutcome::Transcoded,
            transcoded_upload,
            raw_retained,
        }
    }

    async fn upload(&self, local: &Path) -> UploadOutcome {
        let Some(uploader) = &self.uploader else {
            return UploadOutcome::Skipped;
        };
        let Some(key) = remote_key(local) else {
            tracing::warn!(file = %local.display(), "Cannot derive upload key");
            return UploadOutcome::Failed;
        };

        match uploader.upload(local, &key).await {
            Ok(()) => UploadOutcome::Uploaded,
            Err(e) => {
                tracing::error!(file = %local.display(), key = %key, "Upload failed: {}", e);
                UploadOutcome::Failed
            }
        }
    }
}

/// Upload key for an artifact: `<broadcaster dir>/<file name>`.
pub fn remote_key(local: &Path) -> Option<String> {
    let file = local.file_name()?.to_str()?;
    match local
        .parent()
        .and_then(Path::file_name)
        .and_then(|d| d.to_str())
    {
        Some(dir) => Some(format!("{dir}/{file}")),
        None => Some(file.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::UploadError;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn paths(base: &Path) -> ArtifactPaths {
        let started = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(21, 5, 0)
            .unwrap();
        ArtifactPaths::new(base, "caster", "night talk", false, started, 120)
    }

    struct FakeTranscoder {
        available: bool,
        succeed: bool,
        calls: Mutex<Vec<Option<String>>>,
    }

    impl FakeTranscoder {
        fn new(available: bool, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                available,
                succeed,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
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
            if !self.succeed {
                return Err(castrec_av::Error::tool_failed("ffmpeg", "exit status: 1"));
            }
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        keys: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, local: &Path, remote_key: &str) -> Result<(), UploadError> {
            assert!(local.exists(), "uploaded file must exist");
            self.keys.lock().push(remote_key.to_string());
            if self.fail {
                return Err(UploadError::Rejected {
                    status: 500,
                    body: String::new(),
                });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn writes_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(&dir.path().join("file"));

        let (handle, task) = open(&paths, CancellationToken::new()).await.unwrap();
        for chunk in ["b1", "b2", "b3"] {
            handle.send(Bytes::from(chunk)).await.unwrap();
        }
        handle.close();

        let report = task.wait().await;
        assert!(report.error.is_none());
        assert_eq!(report.bytes_written, 6);
        assert_eq!(std::fs::read(&paths.raw).unwrap(), b"b1b2b3");
    }

    #[tokio::test]
    async fn appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.raw, b"old").unwrap();

        let (handle, task) = open(&paths, CancellationToken::new()).await.unwrap();
        handle.send(Bytes::from_static(b"new")).await.unwrap();
        drop(handle);
        task.wait().await;

        assert_eq!(std::fs::read(&paths.raw).unwrap(), b"oldnew");
    }

    #[tokio::test]
    async fn many_chunks_pass_through_bounded_channel() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());

        let (handle, task) = open(&paths, CancellationToken::new()).await.unwrap();
        let mut expected = Vec::new();
        for i in 0..(CHANNEL_CAPACITY * 8) {
            let chunk = vec![i as u8; 64];
            expected.extend_from_slice(&chunk);
            handle.send(Bytes::from(chunk)).await.unwrap();
        }
        drop(handle);

        let report = task.wait().await;
        assert_eq!(report.bytes_written, expected.len() as u64);
        assert_eq!(std::fs::read(&paths.raw).unwrap(), expected);
    }

    #[tokio::test]
    async fn open_fails_when_directory_is_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();

        let err = open(&paths(&blocker), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::CreateDir { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn write_failure_cancels_session_and_refuses_chunks() {
        let paths = ArtifactPaths {
            dir: PathBuf::from("/dev"),
            raw: PathBuf::from("/dev/full"),
            transcoded: PathBuf::from("/dev/full.mp4"),
        };
        let cancel = CancellationToken::new();
        let (handle, task) = open(&paths, cancel.clone()).await.unwrap();

        let chunk = Bytes::from(vec![0u8; 64 * 1024]);
        let refused = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = handle.send(chunk.clone()).await {
                    return e;
                }
            }
        })
        .await
        .expect("sink kept accepting chunks after a write failure");

        assert!(matches!(refused, SinkError::Closed));
        assert!(handle.is_closed());
        assert!(cancel.is_cancelled());

        handle.close();
        let report = task.wait().await;
        assert!(matches!(report.error, Some(SinkError::Write { .. })));
    }

    #[tokio::test]
    async fn remove_if_below_threshold_cases() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("small.ts");
        let exact = dir.path().join("exact.ts");
        std::fs::write(&small, vec![0u8; 1023]).unwrap();
        std::fs::write(&exact, vec![0u8; 1024]).unwrap();

        assert!(remove_if_below_threshold(&small, 1024).await.unwrap());
        assert!(!small.exists());

        assert!(!remove_if_below_threshold(&exact, 1024).await.unwrap());
        assert!(exact.exists());

        let missing = dir.path().join("missing.ts");
        assert!(!remove_if_below_threshold(&missing, 1024).await.unwrap());
    }

    #[test]
    fn remote_key_uses_broadcaster_dir() {
        assert_eq!(
            remote_key(Path::new("./file/caster/20240102-2105-x.ts")).as_deref(),
            Some("caster/20240102-2105-x.ts")
        );
        assert_eq!(remote_key(Path::new("a.ts")).as_deref(), Some("a.ts"));
    }

    async fn write_capture(paths: &ArtifactPaths) {
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(&paths.raw, vec![1u8; 2048]).unwrap();
    }

    #[tokio::test]
    async fn finalize_transcodes_then_removes_raw_and_uploads_both() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let transcoder = FakeTranscoder::new(true, true);
        let uploader = Arc::new(RecordingUploader::default());
        let finalizer = Finalizer::new(
            transcoder.clone(),
            Some(uploader.clone()),
            Shutdown::default(),
        );

        let report = finalizer.finalize(&paths, Some("libx264 -crf 23")).await;
        assert_eq!(
            report,
            FinalizeReport {
                raw_upload: UploadOutcome::Uploaded,
                transcode: TranscodeOutcome::Transcoded,
                transcoded_upload: UploadOutcome::Uploaded,
                raw_retained: false,
            }
        );
        assert!(!paths.raw.exists());
        assert!(paths.transcoded.exists());
        assert_eq!(
            *transcoder.calls.lock(),
            vec![Some("libx264 -crf 23".to_string())]
        );
        assert_eq!(
            *uploader.keys.lock(),
            vec![
                "caster/20240102-2105-night_talk.ts".to_string(),
                "caster/20240102-2105-night_talk.mp4".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failed_transcode_retains_raw() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let uploader = Arc::new(RecordingUploader::default());
        let finalizer = Finalizer::new(
            FakeTranscoder::new(true, false),
            Some(uploader.clone()),
            Shutdown::default(),
        );

        let report = finalizer.finalize(&paths, None).await;
        assert_eq!(report.transcode, TranscodeOutcome::Failed);
        assert_eq!(report.raw_upload, UploadOutcome::Uploaded);
        assert_eq!(report.transcoded_upload, UploadOutcome::Skipped);
        assert!(report.raw_retained);
        assert!(paths.raw.exists());
        assert_eq!(uploader.keys.lock().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_transcoder_skips_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let transcoder = FakeTranscoder::new(false, true);
        let finalizer = Finalizer::new(transcoder.clone(), None, Shutdown::default());

        let report = finalizer.finalize(&paths, None).await;
        assert_eq!(report, FinalizeReport::skipped());
        assert!(paths.raw.exists());
        assert!(transcoder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn upload_failure_does_not_affect_retention() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let uploader = Arc::new(RecordingUploader {
            fail: true,
            ..Default::default()
        });
        let finalizer = Finalizer::new(
            FakeTranscoder::new(true, true),
            Some(uploader.clone()),
            Shutdown::default(),
        );

        let report = finalizer.finalize(&paths, None).await;
        assert_eq!(report.raw_upload, UploadOutcome::Failed);
        assert_eq!(report.transcode, TranscodeOutcome::Transcoded);
        assert_eq!(report.transcoded_upload, UploadOutcome::Failed);
        assert!(!report.raw_retained);
        assert_eq!(uploader.keys.lock().len(), 2);
    }

    #[tokio::test]
    async fn finalize_skipped_while_terminating() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let shutdown = Shutdown::new(Duration::from_millis(1));
        shutdown.trigger().await;

        let transcoder = FakeTranscoder::new(true, true);
        let uploader = Arc::new(RecordingUploader::default());
        let finalizer = Finalizer::new(transcoder.clone(), Some(uploader.clone()), shutdown);

        let report = finalizer.spawn(paths.clone(), None).await.unwrap();
        assert_eq!(report, FinalizeReport::skipped());
        assert!(paths.raw.exists());
        assert!(transcoder.calls.lock().is_empty());
        assert!(uploader.keys.lock().is_empty());
    }

    #[tokio::test]
    async fn wait_idle_waits_for_spawned_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths(dir.path());
        write_capture(&paths).await;

        let transcoder = FakeTranscoder::new(true, true);
        let finalizer = Finalizer::new(transcoder.clone(), None, Shutdown::default());
        let handle = finalizer.spawn(paths.clone(), None);

        tokio::time::timeout(Duration::from_secs(5), finalizer.wait_idle())
            .await
            .expect("finalize should finish");
        assert!(paths.transcoded.exists());
        assert_eq!(handle.await.unwrap().transcode, TranscodeOutcome::Transcoded);
    }
}

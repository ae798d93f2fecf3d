use std::sync::Arc;
use std::time::Duration;

use crate::lifecycle::Shutdown;
use crate::session::{RecordJob, SessionOutcome, SessionRunner};

/// Default pause between direct-mode attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Every attempt ran.
    Finished { attempts: u32 },
    /// An interrupt arrived; the grace period has already elapsed.
    Interrupted { attempts: u32 },
}

/// Bounded-retry driver: runs a session `retries + 1` times with a fixed
/// backoff between attempts.
pub struct RetryDriver {
    runner: Arc<dyn SessionRunner>,
    shutdown: Shutdown,
    retries: u32,
    backoff: Duration,
}

impl RetryDriver {
    pub fn new(runner: Arc<dyn SessionRunner>, shutdown: Shutdown) -> Self {
        Self {
            runner,
            shutdown,
            retries: 0,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(&self, job: &RecordJob) -> RetryOutcome {
        let total = self.retries.saturating_add(1);
        let cancel = self.shutdown.root_token();

        for attempt in 1..=total {
            tracing::info!(
                streamer = %job.broadcaster,
                retries_left = total - attempt,
                backoff = ?self.backoff,
                "Recording streamer"
            );

            match self.runner.run(job).await {
                SessionOutcome::Recorded(recorded) => {
                    tracing::info!(
                        streamer = %job.broadcaster,
                        file = %recorded.paths.raw.display(),
                        bytes = recorded.bytes_written,
                        "Recording finished"
                    );
                }
                SessionOutcome::NotLive => {
                    tracing::info!(streamer = %job.broadcaster, "Live stream is offline");
                }
                SessionOutcome::Failed { error, .. } => {
                    tracing::warn!(streamer = %job.broadcaster, "Recording failed: {}", error);
                }
            }

            if cancel.is_cancelled() {
                return self.interrupted(attempt).await;
            }
            if attempt == total {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => return self.interrupted(attempt).await,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        tracing::info!(streamer = %job.broadcaster, "Recording all finished");
        RetryOutcome::Finished { attempts: total }
    }

    async fn interrupted(&self, attempts: u32) -> RetryOutcome {
        self.shutdown.grace_complete().await;
        RetryOutcome::Interrupted { attempts }
    }
}

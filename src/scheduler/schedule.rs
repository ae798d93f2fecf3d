use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::lifecycle::Shutdown;
use crate::session::{RecordJob, SessionOutcome, SessionRunner};

/// Parse a schedule expression.
///
/// Classic five-field expressions get a `0` seconds field prepended; six or
/// seven fields and `@hourly`-style shorthands are passed through.
pub fn parse_schedule(expression: &str) -> Result<::cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    ::cron::Schedule::from_str(&normalized)
        .with_context(|| format!("Invalid schedule expression: {:?}", expression))
}

/// Random delay applied before each scheduled start, so many broadcasters
/// sharing one schedule do not hit the origin at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// A broadcaster and the schedule it is recorded on.
#[derive(Debug, Clone)]
pub struct CronEntry {
    pub job: RecordJob,
    pub expression: String,
    pub schedule: ::cron::Schedule,
}

impl CronEntry {
    pub fn new(job: RecordJob, expression: &str) -> Result<Self> {
        Ok(Self {
            schedule: parse_schedule(expression)?,
            expression: expression.to_string(),
            job,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireResult {
    Started,
    /// The previous run for this broadcaster is still going; the fire is dropped.
    SkippedStillRunning,
    /// The driver is shutting down.
    Stopped,
}

/// Repeating driver: fires each entry on its schedule until shutdown.
pub struct CronDriver {
    runner: Arc<dyn SessionRunner>,
    entries: Vec<CronEntry>,
    // One permit per entry; held for the whole run of a job.
    slots: Vec<Arc<Semaphore>>,
    jitter: Jitter,
    shutdown: Shutdown,
    tracker: TaskTracker,
}

impl CronDriver {
    pub fn new(
        runner: Arc<dyn SessionRunner>,
        entries: Vec<CronEntry>,
        jitter: Jitter,
        shutdown: Shutdown,
    ) -> Self {
        let slots = entries.iter().map(|_| Arc::new(Semaphore::new(1))).collect();
        Self {
            runner,
            entries,
            slots,
            jitter,
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    pub fn entries(&self) -> &[CronEntry] {
        &self.entries
    }

    /// Fire entry `index` now.
    ///
    /// Starts a job on its own task unless the previous one for the same
    /// entry is still running.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn fire(&self, index: usize) -> FireResult {
        let cancel = self.shutdown.root_token().clone();
        if cancel.is_cancelled() || self.tracker.is_closed() {
            return FireResult::Stopped;
        }

        let entry = &self.entries[index];
        let streamer = entry.job.broadcaster.clone();
        let Ok(permit) = self.slots[index].clone().try_acquire_owned() else {
            tracing::info!(streamer = %streamer, "Previous recording still running, skipping");
            return FireResult::SkippedStillRunning;
        };

        let runner = self.runner.clone();
        let job = entry.job.clone();
        let delay = self.jitter.sample();

        self.tracker.spawn(async move {
            let _permit = permit;

            tracing::debug!(streamer = %streamer, delay = ?delay, "Schedule triggered");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let run = tokio::spawn(async move { runner.run(&job).await });
            match run.await {
                Ok(SessionOutcome::Recorded(recorded)) => {
                    tracing::info!(
                        streamer = %streamer,
                        file = %recorded.paths.raw.display(),
                        bytes = recorded.bytes_written,
                        "Scheduled recording finished"
                    );
                }
                Ok(SessionOutcome::NotLive) => {}
                Ok(SessionOutcome::Failed { error, .. }) => {
                    tracing::debug!(streamer = %streamer, "Scheduled recording failed: {}", error);
                }
                Err(e) if e.is_panic() => {
                    tracing::error!(streamer = %streamer, "Recording job panicked: {}", e);
                }
                Err(e) => {
                    tracing::warn!(streamer = %streamer, "Recording job aborted: {}", e);
                }
            }
        });

        FireResult::Started
    }

    /// Run every schedule until the root token is cancelled, then stop
    /// firing and wait for in-flight jobs to finish.
    pub async fn run(self: Arc<Self>) {
        for (index, entry) in self.entries.iter().enumerate() {
            tracing::info!(
                streamer = %entry.job.broadcaster,
                schedule = %entry.expression,
                "Added record schedule"
            );
            let driver = self.clone();
            self.tracker.spawn(async move { driver.tick(index).await });
        }
        tracing::info!(schedules = self.entries.len(), "Croned recorder started");

        self.shutdown.root_token().cancelled().await;
        self.tracker.close();
        tracing::info!("Waiting for running recordings to stop");
        self.tracker.wait().await;
        tracing::info!("All scheduled recordings stopped");
    }

    async fn tick(&self, index: usize) {
        let entry = &self.entries[index];
        let cancel = self.shutdown.root_token();

        let mut next = entry.schedule.upcoming(Local).next();
        while let Some(at) = next {
            let wait = (at - Local::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if self.fire(index) == FireResult::Stopped {
                return;
            }
            next = following(&entry.schedule, at, Local::now());
        }

        tracing::warn!(
            streamer = %entry.job.broadcaster,
            schedule = %entry.expression,
            "Schedule has no upcoming runs"
        );
    }
}

/// The occurrence after `fired`, skipping any already missed by `now`.
fn following(
    schedule: &::cron::Schedule,
    fired: DateTime<Local>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    schedule.after(&fired.max(now)).next()
}

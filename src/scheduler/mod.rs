//! Drivers that decide when sessions run.
//!
//! - [`CronDriver`]: one repeating schedule per broadcaster, with jittered
//!   starts and skip-if-still-running.
//! - [`RetryDriver`]: one broadcaster, a fixed number of extra attempts with
//!   a fixed backoff.

mod retry;
mod schedule;

pub use retry::{RetryDriver, RetryOutcome, DEFAULT_RETRY_BACKOFF};
pub use schedule::{parse_schedule, CronDriver, CronEntry, FireResult, Jitter};

mod driver;
pub mod handles;
mod scheduler;

pub use scheduler::{Scheduler, SchedulerConfig};

use cronwork_cron::CronParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The only error surfaced to the RPC caller: a malformed cron
    /// expression rejected at add time, before any Handle is installed.
    #[error(transparent)]
    Parse(#[from] CronParseError),
    #[error("scheduler command queue closed")]
    QueueClosed,
}

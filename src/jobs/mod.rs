//! Scheduled jobs: persistent schedules with cron expressions, executed by
//! named executors through a polling scheduler.
//!
//! Schedules live under the scheduled-jobs key prefix, one encoded record per
//! key. Every run of a schedule happens inside one transaction, which both
//! reserves the next run and persists whatever the executor changed.

mod cron;
mod executor;
mod job;
mod poller;
mod scheduled_job;

pub use cron::CronExpr;
pub use executor::{
    default_handle_failed_run, ExecutorFactory, ExecutorRegistry, JobExecutionConfig,
    ScheduledJobExecutor,
};
pub use job::{Job, JobMetadata, JobRegistry, JobStatus};
pub use poller::JobScheduler;
pub use scheduled_job::{
    schedule_key, Column, JobSchedulerEnv, ManualJobSchedulerEnv, OnError,
    ProdJobSchedulerEnv, ScheduleChange, ScheduleDetails, ScheduledJob, ScheduledJobRecord,
};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub enabled: bool,

    /// Interval between scans for due schedules.
    pub poll_interval_ms: u64,

    /// Cap on schedules started by one scan.
    pub max_schedules_per_poll: usize,

    /// Delay before retrying a failed run under `OnError::RetrySoon`.
    pub retry_failed_after_secs: i64,
}

#[allow(clippy::derivable_impls)]
impl Default for JobsConfig {
    fn default() -> Self {
        JobsConfig {
            enabled: true,
            poll_interval_ms: 60_000,
            max_schedules_per_poll: 10,
            retry_failed_after_secs: 60,
        }
    }
}

//! Executors run schedules; they are looked up by the schedule's executor
//! type in a registry owned by the job scheduler.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::jobs::job::{JobMetadata, JobRegistry};
use crate::jobs::scheduled_job::{OnError, ScheduledJob};
use crate::kv::Txn;
use crate::utils::{Ctx, KvError, RwLockExt};

use async_trait::async_trait;

/// Shared state handed to executors.
pub struct JobExecutionConfig {
    pub jobs: Arc<JobRegistry>,
}

/// Runs one kind of schedule. Changes made to the schedule in either hook
/// are persisted in the same transaction.
#[async_trait]
pub trait ScheduledJobExecutor: Send + Sync {
    async fn execute_job(
        &self,
        ctx: &Ctx,
        cfg: &JobExecutionConfig,
        schedule: &mut ScheduledJob,
        txn: &Txn,
    ) -> Result<(), KvError>;

    /// Called once a job started by the schedule reached a terminal state.
    async fn notify_job_termination(
        &self,
        ctx: &Ctx,
        cfg: &JobExecutionConfig,
        md: &JobMetadata,
        schedule: &mut ScheduledJob,
        txn: &Txn,
    ) -> Result<(), KvError>;
}

pub type ExecutorFactory =
    Arc<dyn Fn() -> Result<Arc<dyn ScheduledJobExecutor>, KvError> + Send + Sync>;

/// Executor factories by executor type.
#[derive(Default)]
pub struct ExecutorRegistry {
    factories: RwLock<HashMap<String, ExecutorFactory>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, factory: ExecutorFactory) -> Result<(), KvError> {
        let mut factories = self.factories.write_locked();
        if factories.contains_key(name) {
            return logged_err!("jobs"; "executor '{}' already registered", name);
        }
        factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn new_executor(&self, name: &str) -> Result<Arc<dyn ScheduledJobExecutor>, KvError> {
        let factory = self
            .factories
            .read_locked()
            .get(name)
            .cloned()
            .ok_or_else(|| KvError::msg(format!("executor '{}' is not registered", name)))?;
        factory()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read_locked().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Reacts to a failed run (of the job, or of the schedule itself) per the
/// schedule's `OnError` policy.
pub fn default_handle_failed_run(
    schedule: &mut ScheduledJob,
    job_id: Option<i64>,
    err: &dyn fmt::Display,
    retry_after_secs: i64,
    now: i64,
) {
    let job = job_id.map_or_else(|| "-".to_string(), |id| id.to_string());
    match schedule.schedule_details().on_error {
        OnError::RetrySoon => {
            schedule.add_schedule_change_reason(format!(
                "retrying job {} due to failure: {}",
                job, err
            ));
            schedule.set_next_run(Some(now + retry_after_secs));
        }
        OnError::PauseSched => {
            schedule.pause(format!("schedule paused due to job {} failure: {}", job, err));
        }
        // next run was already set when the run started
        OnError::RetrySched => {}
    }
}

#[cfg(test)]
mod executor_tests {
    use super::*;
    use crate::jobs::scheduled_job::{ManualJobSchedulerEnv, ScheduleDetails};

    struct Noop;

    #[async_trait]
    impl ScheduledJobExecutor for Noop {
        async fn execute_job(
            &self,
            _ctx: &Ctx,
            _cfg: &JobExecutionConfig,
            _schedule: &mut ScheduledJob,
            _txn: &Txn,
        ) -> Result<(), KvError> {
            Ok(())
        }

        async fn notify_job_termination(
            &self,
            _ctx: &Ctx,
            _cfg: &JobExecutionConfig,
            _md: &JobMetadata,
            _schedule: &mut ScheduledJob,
            _txn: &Txn,
        ) -> Result<(), KvError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup() -> Result<(), KvError> {
        let registry = ExecutorRegistry::new();
        registry.register("noop", Arc::new(|| Ok(Arc::new(Noop) as Arc<dyn ScheduledJobExecutor>)))?;
        assert!(registry
            .register("noop", Arc::new(|| Ok(Arc::new(Noop) as Arc<dyn ScheduledJobExecutor>)))
            .is_err());
        assert!(registry.new_executor("noop").is_ok());
        assert!(registry.new_executor("missing").is_err());
        assert_eq!(registry.names(), vec!["noop".to_string()]);
        Ok(())
    }

    #[test]
    fn failure_policies() -> Result<(), KvError> {
        let now = 1_000_000;
        let env = ManualJobSchedulerEnv::new(now);
        let schedule = |on_error| -> Result<ScheduledJob, KvError> {
            let mut s = ScheduledJob::new(env.clone());
            s.set_schedule("0 * * * *")?;
            s.set_schedule_details(ScheduleDetails { on_error });
            Ok(s)
        };

        let mut soon = schedule(OnError::RetrySoon)?;
        default_handle_failed_run(&mut soon, Some(4), &"boom", 60, now);
        assert_eq!(soon.next_run(), Some(now + 60));
        assert!(soon.record().schedule_changes[0].reason.contains("job 4"));

        let mut pause = schedule(OnError::PauseSched)?;
        default_handle_failed_run(&mut pause, None, &"boom", 60, now);
        assert!(pause.is_paused());

        let mut sched = schedule(OnError::RetrySched)?;
        let before = sched.next_run();
        default_handle_failed_run(&mut sched, None, &"boom", 60, now);
        assert_eq!(sched.next_run(), before);
        assert!(sched.record().schedule_changes.is_empty());
        Ok(())
    }
}

//! The job scheduler: polls for due schedules and runs each through its
//! executor, one transaction per schedule.

use std::sync::Arc;

use crate::jobs::executor::{default_handle_failed_run, ExecutorRegistry, JobExecutionConfig};
use crate::jobs::job::{JobMetadata, JobRegistry, JobStatus};
use crate::jobs::scheduled_job::{JobSchedulerEnv, ScheduledJob};
use crate::jobs::JobsConfig;
use crate::kv::{Txn, DB};
use crate::utils::{Ctx, KvError, Stopper};

use tokio::time::{self, Duration, MissedTickBehavior};

pub struct JobScheduler {
    tag: String,
    config: JobsConfig,
    db: Arc<DB>,
    env: Arc<dyn JobSchedulerEnv>,
    executors: ExecutorRegistry,
    exec_cfg: JobExecutionConfig,
    stopper: Stopper,
}

impl JobScheduler {
    pub fn new(
        node_tag: &str,
        config: JobsConfig,
        db: Arc<DB>,
        env: Arc<dyn JobSchedulerEnv>,
        stopper: Stopper,
    ) -> Arc<Self> {
        Arc::new(JobScheduler {
            tag: format!("{},jobs", node_tag),
            config,
            db,
            env,
            executors: ExecutorRegistry::new(),
            exec_cfg: JobExecutionConfig {
                jobs: Arc::new(JobRegistry::new()),
            },
            stopper,
        })
    }

    /// Executors known to this scheduler; populated at startup.
    #[inline]
    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    #[inline]
    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.exec_cfg.jobs
    }

    #[inline]
    pub fn env(&self) -> &Arc<dyn JobSchedulerEnv> {
        &self.env
    }

    /// Starts the polling loop.
    pub fn start(self: &Arc<Self>) -> Result<(), KvError> {
        if !self.config.enabled {
            pf_info!(self.tag; "job scheduler disabled");
            return Ok(());
        }
        let me = self.clone();
        let mut rx_quiesce = self.stopper.subscribe();
        self.stopper.run_worker("job-scheduler", async move {
            let mut ticker = time::interval(Duration::from_millis(me.config.poll_interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match me.poll_once(&Ctx::background()).await {
                            Ok(0) => {}
                            Ok(n) => pf_debug!(me.tag; "ran {} schedules", n),
                            Err(e) => pf_warn!(me.tag; "polling schedules failed: {}", e),
                        }
                    },
                    _ = rx_quiesce.changed() => break,
                }
            }
        })
    }

    /// Runs every due schedule once; returns how many ran.
    pub async fn poll_once(&self, ctx: &Ctx) -> Result<usize, KvError> {
        let now = self.env.now();
        let mut due: Vec<(i64, i64)> = ScheduledJob::load_all(ctx, &self.db)
            .await?
            .into_iter()
            .filter_map(|r| match r.next_run {
                Some(t) if t <= now => Some((t, r.schedule_id)),
                _ => None,
            })
            .collect();
        due.sort();
        due.truncate(self.config.max_schedules_per_poll);

        let mut ran = 0;
        for (_, schedule_id) in due {
            match self.execute_schedule(ctx, schedule_id, now).await {
                Ok(true) => ran += 1,
                Ok(false) => {}
                Err(e) => {
                    pf_warn!(self.tag; "schedule {} failed: {}", schedule_id, e);
                }
            }
        }
        Ok(ran)
    }

    async fn execute_schedule(
        &self,
        ctx: &Ctx,
        schedule_id: i64,
        now: i64,
    ) -> Result<bool, KvError> {
        self.db
            .txn(ctx, |txn| async move {
                let mut schedule =
                    match ScheduledJob::load(self.env.clone(), ctx, &txn, schedule_id).await? {
                        Some(s) => s,
                        None => return Ok(false),
                    };
                // ran or paused by someone else meanwhile
                match schedule.next_run() {
                    Some(t) if t <= now => {}
                    _ => return Ok(false),
                }

                let executor = match self.executors.new_executor(schedule.executor_type()) {
                    Ok(executor) => executor,
                    Err(e) => {
                        pf_warn!(self.tag; "schedule {}: {}", schedule_id, e);
                        self.handle_failed_run(&mut schedule, None, &e);
                        schedule.update(ctx, &txn).await?;
                        return Ok(false);
                    }
                };

                if schedule.has_recurring_schedule() {
                    if let Err(e) = schedule.schedule_next_run() {
                        schedule.pause(format!("cannot compute next run: {}", e));
                    }
                } else {
                    schedule.set_next_run(None);
                }

                if let Err(e) = executor
                    .execute_job(ctx, &self.exec_cfg, &mut schedule, &txn)
                    .await
                {
                    if e.is_client_retryable() {
                        return Err(e);
                    }
                    pf_warn!(self.tag; "executing schedule {} failed: {}", schedule_id, e);
                    self.handle_failed_run(&mut schedule, None, &e);
                }
                schedule.update(ctx, &txn).await?;
                Ok(true)
            })
            .await
    }

    fn handle_failed_run(&self, schedule: &mut ScheduledJob, job_id: Option<i64>, err: &KvError) {
        default_handle_failed_run(
            schedule,
            job_id,
            err,
            self.config.retry_failed_after_secs,
            self.env.now(),
        );
    }

    /// Lets the executor of `schedule_id` react to a finished job, inside
    /// `txn`.
    pub async fn notify_job_termination(
        &self,
        ctx: &Ctx,
        md: &JobMetadata,
        schedule_id: i64,
        txn: &Txn,
    ) -> Result<(), KvError> {
        if !md.status.is_terminal() {
            return logged_err!(self.tag; "job completion expects terminal state, found {} instead for job {}",
                                         md.status, md.id);
        }
        let mut schedule = ScheduledJob::load(self.env.clone(), ctx, txn, schedule_id)
            .await?
            .ok_or_else(|| KvError::msg(format!("schedule {} not found", schedule_id)))?;
        let executor = self.executors.new_executor(schedule.executor_type())?;
        executor
            .notify_job_termination(ctx, &self.exec_cfg, md, &mut schedule, txn)
            .await?;
        schedule.update(ctx, txn).await
    }

    /// Records the outcome of job `job_id` and notifies its schedule.
    pub async fn complete_job(
        &self,
        ctx: &Ctx,
        job_id: i64,
        outcome: Result<(), String>,
    ) -> Result<(), KvError> {
        let job = self.jobs().update(job_id, |job| match &outcome {
            Ok(()) => job.succeeded(),
            Err(e) => job.failed(e),
        })?;
        let schedule_id = match job.schedule_id() {
            Some(id) => id,
            None => return Ok(()),
        };
        let md = job.metadata();
        debug_assert!(md.status == JobStatus::Succeeded || md.status == JobStatus::Failed);
        let md = &md;
        self.db
            .txn(ctx, |txn| async move {
                self.notify_job_termination(ctx, md, schedule_id, &txn).await
            })
            .await
    }
}

#[cfg(test)]
mod poller_tests {
    use super::*;
    use crate::jobs::executor::ScheduledJobExecutor;
    use crate::jobs::scheduled_job::{ManualJobSchedulerEnv, OnError, ScheduleDetails};
    use crate::storage::store_tests::single_store;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // 2021-05-04 10:30:00 UTC
    const NOW: i64 = 1_620_124_200;

    #[derive(Default)]
    struct Recorder {
        runs: AtomicUsize,
        started_jobs: Mutex<Vec<i64>>,
        terminations: Mutex<Vec<JobMetadata>>,
    }

    struct TestExecutor {
        rec: Arc<Recorder>,
        fail: bool,
    }

    #[async_trait]
    impl ScheduledJobExecutor for TestExecutor {
        async fn execute_job(
            &self,
            _ctx: &Ctx,
            cfg: &JobExecutionConfig,
            schedule: &mut ScheduledJob,
            _txn: &Txn,
        ) -> Result<(), KvError> {
            self.rec.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(KvError::msg("executor failure"));
            }
            let id = cfg.jobs.create_job(Some(schedule.schedule_id()));
            self.rec.started_jobs.lock().unwrap().push(id);
            Ok(())
        }

        async fn notify_job_termination(
            &self,
            _ctx: &Ctx,
            _cfg: &JobExecutionConfig,
            md: &JobMetadata,
            schedule: &mut ScheduledJob,
            _txn: &Txn,
        ) -> Result<(), KvError> {
            self.rec.terminations.lock().unwrap().push(md.clone());
            if md.status == JobStatus::Failed {
                let err = md.error.clone().unwrap_or_default();
                default_handle_failed_run(schedule, Some(md.id), &err, 60, NOW);
            }
            Ok(())
        }
    }

    async fn setup() -> Result<(Arc<JobScheduler>, Arc<ManualJobSchedulerEnv>, Arc<Recorder>, Stopper), KvError> {
        let (store, stopper) = single_store().await?;
        let env = ManualJobSchedulerEnv::new(NOW);
        let config = JobsConfig {
            retry_failed_after_secs: 60,
            ..Default::default()
        };
        let scheduler = JobScheduler::new("n1", config, store.db()?, env.clone(), stopper.clone());
        let rec = Arc::new(Recorder::default());
        for (name, fail) in [("ok", false), ("failing", true)] {
            let rec = rec.clone();
            scheduler.executors().register(
                name,
                Arc::new(move || {
                    Ok(Arc::new(TestExecutor {
                        rec: rec.clone(),
                        fail,
                    }) as Arc<dyn ScheduledJobExecutor>)
                }),
            )?;
        }
        Ok((scheduler, env, rec, stopper))
    }

    async fn create(
        scheduler: &JobScheduler,
        expr: &str,
        executor: &str,
        on_error: OnError,
    ) -> Result<i64, KvError> {
        let ctx = Ctx::background();
        let mut schedule = ScheduledJob::new(scheduler.env().clone());
        schedule.set_schedule_name(format!("{}-{}", executor, expr));
        schedule.set_execution_details(executor, Bytes::new());
        schedule.set_schedule_details(ScheduleDetails { on_error });
        if !expr.is_empty() {
            schedule.set_schedule(expr)?;
        }
        // due right away
        schedule.set_next_run(Some(NOW));
        let txn = scheduler.db.new_txn("create-schedule");
        let id = schedule.create(&ctx, &txn).await?;
        txn.commit(&ctx).await?;
        Ok(id)
    }

    async fn next_run(scheduler: &JobScheduler, id: i64) -> Result<Option<i64>, KvError> {
        let all = ScheduledJob::load_all(&Ctx::background(), &scheduler.db).await?;
        let rec = all
            .into_iter()
            .find(|r| r.schedule_id == id)
            .ok_or_else(|| KvError::msg("missing schedule"))?;
        Ok(rec.next_run)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn due_schedule_runs_and_advances() -> Result<(), KvError> {
        let (scheduler, env, rec, _stopper) = setup().await?;
        let ctx = Ctx::background();
        let id = create(&scheduler, "@hourly", "ok", OnError::RetrySoon).await?;

        assert_eq!(scheduler.poll_once(&ctx).await?, 1);
        assert_eq!(rec.runs.load(Ordering::SeqCst), 1);
        assert_eq!(next_run(&scheduler, id).await?, Some(NOW + 30 * 60));

        assert_eq!(scheduler.poll_once(&ctx).await?, 0);
        env.advance(30 * 60);
        assert_eq!(scheduler.poll_once(&ctx).await?, 1);
        assert_eq!(next_run(&scheduler, id).await?, Some(NOW + 90 * 60));
        assert_eq!(scheduler.jobs().jobs_of_schedule(id).len(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_off_schedule_pauses_after_run() -> Result<(), KvError> {
        let (scheduler, _env, _rec, _stopper) = setup().await?;
        let ctx = Ctx::background();
        let id = create(&scheduler, "", "ok", OnError::RetrySoon).await?;
        assert_eq!(scheduler.poll_once(&ctx).await?, 1);
        assert_eq!(next_run(&scheduler, id).await?, None);
        assert_eq!(scheduler.poll_once(&ctx).await?, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_runs_follow_policy() -> Result<(), KvError> {
        let (scheduler, _env, rec, _stopper) = setup().await?;
        let ctx = Ctx::background();
        let soon = create(&scheduler, "@hourly", "failing", OnError::RetrySoon).await?;
        let pause = create(&scheduler, "@hourly", "failing", OnError::PauseSched).await?;
        let sched = create(&scheduler, "@hourly", "failing", OnError::RetrySched).await?;
        let unknown = create(&scheduler, "@hourly", "missing", OnError::RetrySoon).await?;

        assert_eq!(scheduler.poll_once(&ctx).await?, 3);
        assert_eq!(rec.runs.load(Ordering::SeqCst), 3);
        assert_eq!(next_run(&scheduler, soon).await?, Some(NOW + 60));
        assert_eq!(next_run(&scheduler, pause).await?, None);
        assert_eq!(next_run(&scheduler, sched).await?, Some(NOW + 30 * 60));
        assert_eq!(next_run(&scheduler, unknown).await?, Some(NOW + 60));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn job_termination_reaches_executor() -> Result<(), KvError> {
        let (scheduler, _env, rec, _stopper) = setup().await?;
        let ctx = Ctx::background();
        let id = create(&scheduler, "@hourly", "ok", OnError::PauseSched).await?;
        assert_eq!(scheduler.poll_once(&ctx).await?, 1);
        let job_id = rec.started_jobs.lock().unwrap()[0];

        let md = scheduler.jobs().get(job_id).unwrap().metadata();
        let txn = scheduler.db.new_txn("early");
        assert!(scheduler.notify_job_termination(&ctx, &md, id, &txn).await.is_err());
        txn.rollback(&ctx).await?;

        scheduler.jobs().update(job_id, |j| j.started())?;
        scheduler.complete_job(&ctx, job_id, Err("disk full".into())).await?;
        let terms = rec.terminations.lock().unwrap().clone();
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].status, JobStatus::Failed);
        assert_eq!(next_run(&scheduler, id).await?, None);
        Ok(())
    }
}

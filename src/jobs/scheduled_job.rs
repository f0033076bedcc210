//! Scheduled job records and their persistence.
//!
//! A schedule is stored as one MessagePack value under
//! `SCHEDULED_JOBS_PREFIX + id`. Setters mark the columns they touch dirty;
//! `update()` rewrites only the dirty columns of the stored record, so
//! concurrent changes to other columns survive.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::hlc::unix_nanos;
use crate::jobs::cron::CronExpr;
use crate::kv::{Txn, DB};
use crate::kvpb::keys::{prefix_end, SCHEDULED_JOBS_PREFIX, SCHEDULED_JOBS_SEQ};
use crate::kvpb::Key;
use crate::utils::{Ctx, KvError};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Changes remembered in a schedule's change log.
const MAX_SCHEDULE_CHANGES: usize = 10;

/// Source of wall time for schedules, in unix seconds.
pub trait JobSchedulerEnv: Send + Sync {
    fn now(&self) -> i64;
}

/// System wall clock.
pub struct ProdJobSchedulerEnv;

impl JobSchedulerEnv for ProdJobSchedulerEnv {
    fn now(&self) -> i64 {
        unix_nanos() / 1_000_000_000
    }
}

/// Manually driven wall clock.
#[derive(Debug, Default)]
pub struct ManualJobSchedulerEnv(AtomicI64);

impl ManualJobSchedulerEnv {
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(ManualJobSchedulerEnv(AtomicI64::new(now)))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl JobSchedulerEnv for ManualJobSchedulerEnv {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// What to do with a schedule whose run failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnError {
    /// Run again after the retry delay.
    #[default]
    RetrySoon,

    /// Stop scheduling until resumed.
    PauseSched,

    /// Keep the regular schedule.
    RetrySched,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDetails {
    pub on_error: OnError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleChange {
    /// Unix seconds.
    pub time: i64,
    pub reason: String,
}

/// Persisted columns of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Column {
    ScheduleName,
    Owner,
    NextRun,
    ScheduleExpr,
    ScheduleDetails,
    ExecutorType,
    ExecutionArgs,
    ScheduleChanges,
    DefaultDatabase,
    DefaultSearchPath,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJobRecord {
    pub schedule_id: i64,
    pub schedule_name: String,
    pub owner: String,

    /// Unix seconds of the next run; `None` while paused.
    pub next_run: Option<i64>,

    /// Cron expression; empty for one-off schedules.
    pub schedule_expr: String,
    pub schedule_details: ScheduleDetails,
    pub executor_type: String,
    pub execution_args: Bytes,
    pub schedule_changes: Vec<ScheduleChange>,
    pub default_database: String,
    pub default_search_path: String,
}

impl ScheduledJobRecord {
    fn copy_column(&mut self, from: &ScheduledJobRecord, col: Column) {
        match col {
            Column::ScheduleName => self.schedule_name = from.schedule_name.clone(),
            Column::Owner => self.owner = from.owner.clone(),
            Column::NextRun => self.next_run = from.next_run,
            Column::ScheduleExpr => self.schedule_expr = from.schedule_expr.clone(),
            Column::ScheduleDetails => self.schedule_details = from.schedule_details.clone(),
            Column::ExecutorType => self.executor_type = from.executor_type.clone(),
            Column::ExecutionArgs => self.execution_args = from.execution_args.clone(),
            Column::ScheduleChanges => self.schedule_changes = from.schedule_changes.clone(),
            Column::DefaultDatabase => self.default_database = from.default_database.clone(),
            Column::DefaultSearchPath => {
                self.default_search_path = from.default_search_path.clone()
            }
        }
    }

    pub(crate) fn encode(&self) -> Result<Bytes, KvError> {
        Ok(Bytes::from(rmp_serde::to_vec(self)?))
    }

    pub(crate) fn decode(raw: &[u8]) -> Result<Self, KvError> {
        Ok(rmp_serde::from_slice(raw)?)
    }
}

pub fn schedule_key(schedule_id: i64) -> Key {
    let mut key = SCHEDULED_JOBS_PREFIX.to_vec();
    key.extend_from_slice(&schedule_id.to_be_bytes());
    Bytes::from(key)
}

/// In-memory handle to one schedule.
pub struct ScheduledJob {
    env: Arc<dyn JobSchedulerEnv>,
    rec: ScheduledJobRecord,

    /// `next_run` as loaded, before any changes.
    scheduled_time: Option<i64>,

    dirty: BTreeSet<Column>,
}

impl ScheduledJob {
    pub fn new(env: Arc<dyn JobSchedulerEnv>) -> Self {
        ScheduledJob {
            env,
            rec: ScheduledJobRecord::default(),
            scheduled_time: None,
            dirty: BTreeSet::new(),
        }
    }

    pub fn from_record(env: Arc<dyn JobSchedulerEnv>, rec: ScheduledJobRecord) -> Self {
        ScheduledJob {
            env,
            scheduled_time: rec.next_run,
            rec,
            dirty: BTreeSet::new(),
        }
    }

    /// Reads schedule `schedule_id` inside `txn`.
    pub async fn load(
        env: Arc<dyn JobSchedulerEnv>,
        ctx: &Ctx,
        txn: &Txn,
        schedule_id: i64,
    ) -> Result<Option<Self>, KvError> {
        match txn.get(ctx, schedule_key(schedule_id)).await? {
            Some(raw) => Ok(Some(Self::from_record(env, ScheduledJobRecord::decode(&raw)?))),
            None => Ok(None),
        }
    }

    /// Reads every schedule outside of any transaction.
    pub async fn load_all(ctx: &Ctx, db: &DB) -> Result<Vec<ScheduledJobRecord>, KvError> {
        let rows = db
            .scan(ctx, Bytes::from_static(SCHEDULED_JOBS_PREFIX), prefix_end(SCHEDULED_JOBS_PREFIX))
            .await?;
        rows.iter()
            .map(|kv| ScheduledJobRecord::decode(&kv.value))
            .collect()
    }

    fn mark_dirty(&mut self, cols: &[Column]) {
        self.dirty.extend(cols.iter().copied());
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    #[inline]
    pub fn record(&self) -> &ScheduledJobRecord {
        &self.rec
    }

    #[inline]
    pub fn schedule_id(&self) -> i64 {
        self.rec.schedule_id
    }

    #[inline]
    pub fn next_run(&self) -> Option<i64> {
        self.rec.next_run
    }

    /// When this run was supposed to start, as loaded.
    #[inline]
    pub fn scheduled_run_time(&self) -> Option<i64> {
        self.scheduled_time
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.rec.next_run.is_none()
    }

    #[inline]
    pub fn executor_type(&self) -> &str {
        &self.rec.executor_type
    }

    #[inline]
    pub fn execution_args(&self) -> &Bytes {
        &self.rec.execution_args
    }

    #[inline]
    pub fn schedule_details(&self) -> &ScheduleDetails {
        &self.rec.schedule_details
    }

    pub fn has_recurring_schedule(&self) -> bool {
        !self.rec.schedule_expr.is_empty()
    }

    pub fn set_schedule_name(&mut self, name: impl Into<String>) {
        self.rec.schedule_name = name.into();
        self.mark_dirty(&[Column::ScheduleName]);
    }

    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.rec.owner = owner.into();
        self.mark_dirty(&[Column::Owner]);
    }

    pub fn set_next_run(&mut self, next_run: Option<i64>) {
        self.rec.next_run = next_run;
        self.mark_dirty(&[Column::NextRun]);
    }

    /// Sets the cron expression and recomputes the next run from it.
    pub fn set_schedule(&mut self, expr: impl Into<String>) -> Result<(), KvError> {
        self.rec.schedule_expr = expr.into();
        self.mark_dirty(&[Column::ScheduleExpr]);
        self.schedule_next_run()
    }

    /// Moves `next_run` to the first tick of the cron expression after now.
    pub fn schedule_next_run(&mut self) -> Result<(), KvError> {
        let expr = CronExpr::parse(&self.rec.schedule_expr)?;
        let now = self.env.now();
        match expr.next_after(now) {
            Some(next) => {
                self.set_next_run(Some(next));
                Ok(())
            }
            None => Err(KvError::msg(format!(
                "schedule expression '{}' never fires after {}",
                self.rec.schedule_expr, now
            ))),
        }
    }

    pub fn set_schedule_details(&mut self, details: ScheduleDetails) {
        self.rec.schedule_details = details;
        self.mark_dirty(&[Column::ScheduleDetails]);
    }

    pub fn set_execution_details(&mut self, executor_type: impl Into<String>, args: Bytes) {
        self.rec.executor_type = executor_type.into();
        self.rec.execution_args = args;
        self.mark_dirty(&[Column::ExecutorType, Column::ExecutionArgs]);
    }

    pub fn set_execution_args(&mut self, args: Bytes) {
        self.rec.execution_args = args;
        self.mark_dirty(&[Column::ExecutionArgs]);
    }

    pub fn set_default_database(&mut self, database: impl Into<String>) {
        self.rec.default_database = database.into();
        self.mark_dirty(&[Column::DefaultDatabase]);
    }

    pub fn set_default_search_path(&mut self, path: impl Into<String>) {
        self.rec.default_search_path = path.into();
        self.mark_dirty(&[Column::DefaultSearchPath]);
    }

    /// Appends to the change log, dropping the oldest entries beyond the
    /// limit.
    pub fn add_schedule_change_reason(&mut self, reason: impl Into<String>) {
        let changes = &mut self.rec.schedule_changes;
        while changes.len() >= MAX_SCHEDULE_CHANGES {
            changes.remove(0);
        }
        changes.push(ScheduleChange {
            time: self.env.now(),
            reason: reason.into(),
        });
        self.mark_dirty(&[Column::ScheduleChanges]);
    }

    pub fn pause(&mut self, reason: impl Into<String>) {
        self.set_next_run(None);
        self.add_schedule_change_reason(reason);
    }

    /// Resumes a paused schedule at its next cron tick.
    pub fn unpause(&mut self, reason: impl Into<String>) -> Result<(), KvError> {
        self.schedule_next_run()?;
        self.add_schedule_change_reason(reason);
        Ok(())
    }

    /// Inserts the schedule with its dirty columns; returns the new id.
    pub async fn create(&mut self, ctx: &Ctx, txn: &Txn) -> Result<i64, KvError> {
        if self.rec.schedule_id != 0 {
            return Err(KvError::msg(
                "cannot specify schedule id when creating new schedule",
            ));
        }
        if !self.is_dirty() {
            return Err(KvError::msg("no settings specified for scheduled job"));
        }
        let id = txn.inc(ctx, Bytes::from_static(SCHEDULED_JOBS_SEQ), 1).await?;
        let mut rec = ScheduledJobRecord {
            schedule_id: id,
            ..Default::default()
        };
        for col in &self.dirty {
            rec.copy_column(&self.rec, *col);
        }
        txn.cput(ctx, schedule_key(id), rec.encode()?, None).await?;

        self.rec.schedule_id = id;
        self.scheduled_time = self.rec.next_run;
        self.dirty.clear();
        Ok(id)
    }

    /// Writes the dirty columns back; a no-op when nothing changed.
    pub async fn update(&mut self, ctx: &Ctx, txn: &Txn) -> Result<(), KvError> {
        if !self.is_dirty() {
            return Ok(());
        }
        if self.rec.schedule_id == 0 {
            return Err(KvError::msg("cannot update schedule: missing schedule id"));
        }
        let key = schedule_key(self.rec.schedule_id);
        let mut stored = match txn.get(ctx, key.clone()).await? {
            Some(raw) => ScheduledJobRecord::decode(&raw)?,
            None => {
                return Err(KvError::msg(format!(
                    "expected to update 1 schedule, schedule {} not found",
                    self.rec.schedule_id
                )))
            }
        };
        for col in &self.dirty {
            stored.copy_column(&self.rec, *col);
        }
        txn.put(ctx, key, stored.encode()?).await?;
        self.dirty.clear();
        Ok(())
    }
}

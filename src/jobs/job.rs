//! Jobs started by schedules and their status machine.
//!
//! ```text
//!   Pending -> Running <-> Paused
//!      |         |          |
//!      +---------+----------+--> Succeeded | Failed | Canceled
//! ```
//!
//! Repeating the current state is a no-op.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::utils::{KvError, MutexExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// What a schedule's executor learns about a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobMetadata {
    pub id: i64,
    pub status: JobStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: i64,

    /// Schedule that started the job, if any.
    schedule_id: Option<i64>,

    status: JobStatus,
    error: Option<String>,
    fraction_completed: f32,
}

impl Job {
    pub fn new(id: i64, schedule_id: Option<i64>) -> Self {
        Job {
            id,
            schedule_id,
            status: JobStatus::Pending,
            error: None,
            fraction_completed: 0.0,
        }
    }

    #[inline]
    pub fn id(&self) -> i64 {
        self.id
    }

    #[inline]
    pub fn schedule_id(&self) -> Option<i64> {
        self.schedule_id
    }

    #[inline]
    pub fn status(&self) -> JobStatus {
        self.status
    }

    #[inline]
    pub fn fraction_completed(&self) -> f32 {
        self.fraction_completed
    }

    pub fn metadata(&self) -> JobMetadata {
        JobMetadata {
            id: self.id,
            status: self.status,
            error: self.error.clone(),
        }
    }

    fn transition(&mut self, to: JobStatus, allowed: &[JobStatus], verb: &str) -> Result<(), KvError> {
        if self.status == to {
            return Ok(());
        }
        if !allowed.contains(&self.status) {
            return Err(KvError::msg(format!(
                "job with status {} cannot be {}",
                self.status, verb
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn started(&mut self) -> Result<(), KvError> {
        self.transition(JobStatus::Running, &[JobStatus::Pending], "started")
    }

    pub fn succeeded(&mut self) -> Result<(), KvError> {
        self.transition(
            JobStatus::Succeeded,
            &[JobStatus::Pending, JobStatus::Running],
            "marked as succeeded",
        )?;
        self.fraction_completed = 1.0;
        Ok(())
    }

    pub fn failed(&mut self, err: impl fmt::Display) -> Result<(), KvError> {
        let was = self.status;
        self.transition(
            JobStatus::Failed,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
            "marked as failed",
        )?;
        if was != JobStatus::Failed {
            self.error = Some(err.to_string());
        }
        Ok(())
    }

    pub fn paused(&mut self) -> Result<(), KvError> {
        self.transition(
            JobStatus::Paused,
            &[JobStatus::Pending, JobStatus::Running],
            "paused",
        )
    }

    pub fn resumed(&mut self) -> Result<(), KvError> {
        if self.status == JobStatus::Running {
            return Ok(());
        }
        self.transition(JobStatus::Running, &[JobStatus::Paused], "resumed")
    }

    pub fn canceled(&mut self) -> Result<(), KvError> {
        self.transition(
            JobStatus::Canceled,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
            "canceled",
        )
    }

    pub fn fraction_progressed(&mut self, fraction: f32) -> Result<(), KvError> {
        if self.status != JobStatus::Running {
            return Err(KvError::msg(format!(
                "cannot update progress on {} job",
                self.status
            )));
        }
        if !(0.0..=1.0).contains(&fraction) {
            return Err(KvError::msg(format!(
                "fraction completed {} is outside allowable range [0.0, 1.0]",
                fraction
            )));
        }
        self.fraction_completed = fraction;
        Ok(())
    }
}

/// In-memory table of jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<i64, Job>>,
    next_id: Mutex<i64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending job; returns its id.
    pub fn create_job(&self, schedule_id: Option<i64>) -> i64 {
        let id = {
            let mut next = self.next_id.locked();
            *next += 1;
            *next
        };
        self.jobs.locked().insert(id, Job::new(id, schedule_id));
        id
    }

    pub fn get(&self, id: i64) -> Option<Job> {
        self.jobs.locked().get(&id).cloned()
    }

    /// Applies `f` to job `id`; returns the job afterwards.
    pub fn update<F>(&self, id: i64, f: F) -> Result<Job, KvError>
    where
        F: FnOnce(&mut Job) -> Result<(), KvError>,
    {
        let mut jobs = self.jobs.locked();
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| KvError::msg(format!("job {} not found", id)))?;
        f(job)?;
        Ok(job.clone())
    }

    /// Jobs started by `schedule_id`.
    pub fn jobs_of_schedule(&self, schedule_id: i64) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .locked()
            .values()
            .filter(|j| j.schedule_id == Some(schedule_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

#[cfg(test)]
mod job_tests {
    use super::*;

    #[test]
    fn same_state_transitions_are_noops() -> Result<(), KvError> {
        let mut job = Job::new(1, None);
        job.started()?;
        job.started()?;
        assert_eq!(job.status(), JobStatus::Running);
        job.succeeded()?;
        job.succeeded()?;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.fraction_completed(), 1.0);
        Ok(())
    }

    #[test]
    fn pause_resume_cancel() -> Result<(), KvError> {
        let mut job = Job::new(1, None);
        assert!(job.resumed().is_err());
        job.started()?;
        job.paused()?;
        job.paused()?;
        assert!(job.fraction_progressed(0.5).is_err());
        job.resumed()?;
        job.resumed()?;
        job.fraction_progressed(0.5)?;
        assert!(job.fraction_progressed(1.1).is_err());
        job.canceled()?;
        assert!(job.resumed().is_err());
        assert!(job.started().is_err());

        let mut done = Job::new(2, None);
        done.succeeded()?;
        let err = done.canceled().unwrap_err();
        assert!(err.to_string().contains("job with status succeeded cannot be canceled"));
        assert!(done.paused().is_err());
        Ok(())
    }

    #[test]
    fn failure_keeps_first_error() -> Result<(), KvError> {
        let mut job = Job::new(1, Some(7));
        job.failed("disk full")?;
        job.failed("again")?;
        let md = job.metadata();
        assert_eq!(md.status, JobStatus::Failed);
        assert_eq!(md.error.as_deref(), Some("disk full"));
        Ok(())
    }

    #[test]
    fn registry_updates() -> Result<(), KvError> {
        let registry = JobRegistry::new();
        let a = registry.create_job(Some(3));
        let b = registry.create_job(None);
        assert_ne!(a, b);
        registry.update(a, |j| j.started())?;
        assert_eq!(registry.get(a).unwrap().status(), JobStatus::Running);
        assert!(registry.update(99, |j| j.started()).is_err());
        assert_eq!(registry.jobs_of_schedule(3).len(), 1);
        Ok(())
    }
}

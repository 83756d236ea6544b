use std::sync::Arc;

use thiserror::Error;

use cadence_core::{
    ConfigId, DomainError, EpochMillis, Execution, ExecutionId, ExecutionResult, Job, JobId,
    JobStats, JobStatus, ProducerConfig,
};

/// Store operation error.
///
/// These are **infrastructure errors** raised by the persistence boundary, as
/// opposed to domain errors (validation, invariants).
///
/// ## Error Categories
///
/// - **Conflict**: a compare-and-swap lost (stored value differs from the expected one)
/// - **Duplicate**: a record with the same id already exists
/// - **NotFound**: the addressed record does not exist
/// - **InvalidTransition**: the job status table forbids the requested move
/// - **Invariant**: the request itself is invalid (e.g. watermark regression)
/// - **Unavailable**: transient infrastructure failure, safe to retry later
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("conditional update lost: {0}")]
    Conflict(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures are retried with backoff and count against liveness.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition { from, to } => StoreError::InvalidTransition { from, to },
            other => StoreError::Invariant(other.to_string()),
        }
    }
}

/// Conditional status change of a job.
///
/// Applied only when the stored status equals `from` (the compare-and-swap
/// guard) and the transition table allows `from -> to`. The optional guards
/// narrow the swap further: `expected_attempts` must equal the stored attempt
/// counter and `available_by` must not be earlier than the stored
/// `available_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub expected_attempts: Option<u32>,
    pub available_by: Option<EpochMillis>,
    /// New attempt counter, if it changes.
    pub attempts: Option<u32>,
    /// New earliest-claim time, if it changes.
    pub available_at: Option<EpochMillis>,
    /// Timestamp recorded as `updated_at`.
    pub at: EpochMillis,
}

impl JobTransition {
    pub fn new(from: JobStatus, to: JobStatus, at: EpochMillis) -> Self {
        Self {
            from,
            to,
            expected_attempts: None,
            available_by: None,
            attempts: None,
            available_at: None,
            at,
        }
    }

    /// Only swap while the stored attempt counter is still `attempts`.
    pub fn expecting_attempts(mut self, attempts: u32) -> Self {
        self.expected_attempts = Some(attempts);
        self
    }

    /// Only swap once the job's backoff has elapsed at `now`.
    pub fn available_by(mut self, now: EpochMillis) -> Self {
        self.available_by = Some(now);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_available_at(mut self, available_at: EpochMillis) -> Self {
        self.available_at = Some(available_at);
        self
    }

    /// Check every guard against the stored job. `Conflict` when one fails.
    pub fn check_guards(&self, job: &Job) -> Result<(), StoreError> {
        if job.status != self.from {
            return Err(StoreError::Conflict(format!(
                "job {}: expected status {}, found {}",
                job.job_id, self.from, job.status
            )));
        }
        if let Some(expected) = self.expected_attempts {
            if job.attempts != expected {
                return Err(StoreError::Conflict(format!(
                    "job {}: expected attempt {expected}, found {}",
                    job.job_id, job.attempts
                )));
            }
        }
        if let Some(now) = self.available_by {
            if job.available_at > now {
                return Err(StoreError::Conflict(format!(
                    "job {}: backing off until {}",
                    job.job_id, job.available_at
                )));
            }
        }
        Ok(())
    }

    /// Apply to an in-memory copy of the job (after the guards have been checked).
    pub fn apply(&self, job: &mut Job) {
        job.status = self.to;
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(available_at) = self.available_at {
            job.available_at = available_at;
        }
        job.updated_at = self.at;
    }
}

/// Finishing an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUpdate {
    pub result: ExecutionResult,
    pub finished_at: EpochMillis,
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn success(finished_at: EpochMillis) -> Self {
        Self {
            result: ExecutionResult::Success,
            finished_at,
            error: None,
        }
    }

    pub fn failure(finished_at: EpochMillis, error: impl Into<String>) -> Self {
        Self {
            result: ExecutionResult::Failure,
            finished_at,
            error: Some(error.into()),
        }
    }
}

/// What `update_execution` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The execution moved from Running to the requested result.
    Applied(Execution),
    /// The execution already carried the requested result; nothing changed.
    AlreadyApplied(Execution),
}

impl UpdateOutcome {
    pub fn execution(&self) -> &Execution {
        match self {
            UpdateOutcome::Applied(e) | UpdateOutcome::AlreadyApplied(e) => e,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Durable per-configuration watermark (`producer_config`).
///
/// Records are created by provisioning, never by the scheduler.
pub trait WatermarkStore: Send + Sync {
    /// Read the watermark for `config_id`.
    fn get_watermark(&self, config_id: &ConfigId) -> Result<ProducerConfig, StoreError>;

    /// Compare-and-swap the watermark from `expected_old` to `new_value`.
    ///
    /// Fails with `Conflict` when the stored value differs from `expected_old`
    /// and with `Invariant` when `new_value < expected_old`.
    fn advance_watermark(
        &self,
        config_id: &ConfigId,
        expected_old: EpochMillis,
        new_value: EpochMillis,
    ) -> Result<ProducerConfig, StoreError>;
}

/// Durable job collection (`jobs`).
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Duplicate` on job id collision.
    fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Pending jobs with `available_at <= now`, oldest `scheduled_for` first,
    /// ties broken by job id.
    fn list_pending(&self, now: EpochMillis, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// At-least-once Failed jobs with `attempts < max_attempts`, oldest
    /// `updated_at` first.
    fn list_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Dispatched jobs last touched before `updated_before`, oldest first.
    fn list_stale_dispatched(
        &self,
        updated_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Compare-and-swap on the status field (and the optional guards).
    ///
    /// Returns the updated job. Fails with `Conflict` when a guard does not
    /// hold, `InvalidTransition` when the table forbids the
    /// move, and `NotFound` when the job does not exist.
    fn transition_job(&self, job_id: &JobId, transition: &JobTransition) -> Result<Job, StoreError>;

    /// Job counts per status.
    fn stats(&self) -> Result<JobStats, StoreError>;
}

/// Durable execution collection (`job_executions`).
pub trait ExecutionStore: Send + Sync {
    /// Insert a Running execution.
    ///
    /// Fails with `Duplicate` on execution id collision and with `Conflict`
    /// when the job already has a Running execution.
    fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, StoreError>;

    /// Finish a Running execution.
    ///
    /// Idempotent for the same `(execution_id, result)` pair. Fails with
    /// `Conflict` when the execution already finished with another result.
    fn update_execution(
        &self,
        execution_id: &ExecutionId,
        update: &ExecutionUpdate,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Execution history of a job, ordered by attempt.
    fn list_executions(&self, job_id: &JobId) -> Result<Vec<Execution>, StoreError>;

    /// Running executions with `started_at < started_before`, oldest first.
    fn list_stale_running(
        &self,
        started_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError>;
}

impl<S> WatermarkStore for Arc<S>
where
    S: WatermarkStore + ?Sized,
{
    fn get_watermark(&self, config_id: &ConfigId) -> Result<ProducerConfig, StoreError> {
        (**self).get_watermark(config_id)
    }

    fn advance_watermark(
        &self,
        config_id: &ConfigId,
        expected_old: EpochMillis,
        new_value: EpochMillis,
    ) -> Result<ProducerConfig, StoreError> {
        (**self).advance_watermark(config_id, expected_old, new_value)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        (**self).insert_job(job)
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_job(job_id)
    }

    fn list_pending(&self, now: EpochMillis, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_pending(now, limit)
    }

    fn list_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_retryable(max_attempts, limit)
    }

    fn list_stale_dispatched(
        &self,
        updated_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).list_stale_dispatched(updated_before, limit)
    }

    fn transition_job(&self, job_id: &JobId, transition: &JobTransition) -> Result<Job, StoreError> {
        (**self).transition_job(job_id, transition)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

impl<S> ExecutionStore for Arc<S>
where
    S: ExecutionStore + ?Sized,
{
    fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        (**self).insert_execution(execution)
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        (**self).get_execution(execution_id)
    }

    fn update_execution(
        &self,
        execution_id: &ExecutionId,
        update: &ExecutionUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        (**self).update_execution(execution_id, update)
    }

    fn list_executions(&self, job_id: &JobId) -> Result<Vec<Execution>, StoreError> {
        (**self).list_executions(job_id)
    }

    fn list_stale_running(
        &self,
        started_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        (**self).list_stale_running(started_before, limit)
    }
}

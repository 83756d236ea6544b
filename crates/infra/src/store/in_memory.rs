use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cadence_core::{
    ConfigId, EpochMillis, Execution, ExecutionId, Job, JobId, JobStats, JobStatus, ProducerConfig,
};

use super::r#trait::{
    ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError, UpdateOutcome,
    WatermarkStore,
};

/// In-memory implementation of all three stores.
///
/// Intended for tests/dev. Every conditional operation holds the relevant
/// write lock for its whole check-then-write, so the CAS semantics match the
/// durable store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    watermarks: RwLock<HashMap<ConfigId, ProducerConfig>>,
    jobs: RwLock<HashMap<JobId, Job>>,
    executions: RwLock<HashMap<ExecutionId, Execution>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a watermark record (what the provisioning step does for the
    /// durable store).
    pub fn provision(&self, config: ProducerConfig) -> Result<(), StoreError> {
        let mut watermarks = write(&self.watermarks)?;
        watermarks.insert(config.config_id.clone(), config);
        Ok(())
    }

    /// Convenience: a store provisioned with one watermark.
    pub fn with_watermark(config_id: ConfigId, last_produced_timestamp: EpochMillis) -> Arc<Self> {
        let store = Self::new();
        store
            .watermarks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                config_id.clone(),
                ProducerConfig::new(config_id, last_produced_timestamp),
            );
        Arc::new(store)
    }

    /// Snapshot of every job (tests/inspection).
    pub fn all_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        Ok(all)
    }

    /// Snapshot of every execution (tests/inspection).
    pub fn all_executions(&self) -> Result<Vec<Execution>, StoreError> {
        let executions = read(&self.executions)?;
        let mut all: Vec<Execution> = executions.values().cloned().collect();
        all.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        Ok(all)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
}

impl WatermarkStore for InMemoryStore {
    fn get_watermark(&self, config_id: &ConfigId) -> Result<ProducerConfig, StoreError> {
        read(&self.watermarks)?
            .get(config_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("producer config {config_id}")))
    }

    fn advance_watermark(
        &self,
        config_id: &ConfigId,
        expected_old: EpochMillis,
        new_value: EpochMillis,
    ) -> Result<ProducerConfig, StoreError> {
        ProducerConfig::check_advance(expected_old, new_value)?;

        let mut watermarks = write(&self.watermarks)?;
        let current = watermarks
            .get_mut(config_id)
            .ok_or_else(|| StoreError::NotFound(format!("producer config {config_id}")))?;

        if current.last_produced_timestamp != expected_old {
            return Err(StoreError::Conflict(format!(
                "watermark for {config_id}: expected {expected_old}, found {}",
                current.last_produced_timestamp
            )));
        }

        current.last_produced_timestamp = new_value;
        Ok(current.clone())
    }
}

impl JobStore for InMemoryStore {
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = write(&self.jobs)?;
        if jobs.contains_key(&job.job_id) {
            return Err(StoreError::Duplicate(format!("job {}", job.job_id)));
        }
        jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(read(&self.jobs)?.get(job_id).cloned())
    }

    fn list_pending(&self, now: EpochMillis, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut pending: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.available_at <= now)
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    fn list_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut failed: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed && j.may_retry(max_attempts))
            .cloned()
            .collect();

        failed.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        failed.truncate(limit);
        Ok(failed)
    }

    fn list_stale_dispatched(
        &self,
        updated_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Dispatched && j.updated_at < updated_before)
            .cloned()
            .collect();

        stale.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        stale.truncate(limit);
        Ok(stale)
    }

    fn transition_job(&self, job_id: &JobId, transition: &JobTransition) -> Result<Job, StoreError> {
        transition.from.check_transition(transition.to)?;

        let mut jobs = write(&self.jobs)?;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

        transition.check_guards(job)?;
        transition.apply(job);
        Ok(job.clone())
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = read(&self.jobs)?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

impl ExecutionStore for InMemoryStore {
    fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = write(&self.executions)?;

        if executions.contains_key(&execution.execution_id) {
            return Err(StoreError::Duplicate(format!(
                "execution {}",
                execution.execution_id
            )));
        }

        if execution.is_running() {
            if let Some(running) = executions
                .values()
                .find(|e| e.job_id == execution.job_id && e.is_running())
            {
                return Err(StoreError::Conflict(format!(
                    "job {} already has running execution {}",
                    execution.job_id, running.execution_id
                )));
            }
        }

        executions.insert(execution.execution_id.clone(), execution.clone());
        Ok(())
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        Ok(read(&self.executions)?.get(execution_id).cloned())
    }

    fn update_execution(
        &self,
        execution_id: &ExecutionId,
        update: &ExecutionUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        if !update.result.is_finished() {
            return Err(StoreError::Invariant(format!(
                "execution {execution_id} can only be finished, not set to {}",
                update.result
            )));
        }

        let mut executions = write(&self.executions)?;
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;

        if execution.result == update.result {
            return Ok(UpdateOutcome::AlreadyApplied(execution.clone()));
        }
        if execution.result.is_finished() {
            return Err(StoreError::Conflict(format!(
                "execution {execution_id} already finished as {}",
                execution.result
            )));
        }

        execution.result = update.result;
        execution.finished_at = Some(update.finished_at);
        execution.error = update.error.clone();
        Ok(UpdateOutcome::Applied(execution.clone()))
    }

    fn list_executions(&self, job_id: &JobId) -> Result<Vec<Execution>, StoreError> {
        let executions = read(&self.executions)?;
        let mut history: Vec<Execution> = executions
            .values()
            .filter(|e| &e.job_id == job_id)
            .cloned()
            .collect();
        history.sort_by_key(|e| e.attempt);
        Ok(history)
    }

    fn list_stale_running(
        &self,
        started_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let executions = read(&self.executions)?;
        let mut stale: Vec<Execution> = executions
            .values()
            .filter(|e| e.is_running() && e.started_at < started_before)
            .cloned()
            .collect();

        stale.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        stale.truncate(limit);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{DeliveryGuarantee, ExecutionResult, WorkerId};

    fn config() -> ConfigId {
        ConfigId::from_raw("1")
    }

    fn job(key: &str, scheduled_for: EpochMillis) -> Job {
        Job::new(config(), key, Vec::new(), scheduled_for, scheduled_for)
    }

    fn running(job: &Job, attempt: u32, started_at: EpochMillis) -> Execution {
        Execution::start(job.job_id.clone(), attempt, WorkerId::from_raw("w-0"), started_at).unwrap()
    }

    #[test]
    fn watermark_cas_detects_stale_expectation() {
        let store = InMemoryStore::with_watermark(config(), 1_000);

        let advanced = store.advance_watermark(&config(), 1_000, 2_000).unwrap();
        assert_eq!(advanced.last_produced_timestamp, 2_000);

        assert!(matches!(
            store.advance_watermark(&config(), 1_000, 3_000),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.get_watermark(&config()).unwrap().last_produced_timestamp, 2_000);
    }

    #[test]
    fn watermark_never_regresses() {
        let store = InMemoryStore::with_watermark(config(), 2_000);
        assert!(matches!(
            store.advance_watermark(&config(), 2_000, 1_000),
            Err(StoreError::Invariant(_))
        ));
    }

    #[test]
    fn missing_watermark_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.get_watermark(&config()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_job_insert_is_rejected() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        store.insert_job(&j).unwrap();
        assert!(matches!(store.insert_job(&j), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn pending_jobs_ordered_by_schedule_then_id() {
        let store = InMemoryStore::new();
        let late = job("late", 300);
        let early_a = job("a", 100);
        let early_b = job("b", 100);
        for j in [&late, &early_b, &early_a] {
            store.insert_job(j).unwrap();
        }

        let pending = store.list_pending(1_000, 10).unwrap();
        let mut expected_early = vec![early_a.job_id.clone(), early_b.job_id.clone()];
        expected_early.sort();

        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].job_id, expected_early[0]);
        assert_eq!(pending[1].job_id, expected_early[1]);
        assert_eq!(pending[2].job_id, late.job_id);
    }

    #[test]
    fn pending_respects_available_at() {
        let store = InMemoryStore::new();
        store.insert_job(&job("future", 5_000)).unwrap();
        assert!(store.list_pending(4_999, 10).unwrap().is_empty());
        assert_eq!(store.list_pending(5_000, 10).unwrap().len(), 1);
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        store.insert_job(&j).unwrap();

        let claim = JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 200).with_attempts(1);
        let claimed = store.transition_job(&j.job_id, &claim).unwrap();
        assert_eq!(claimed.status, JobStatus::Dispatched);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.updated_at, 200);

        assert!(matches!(
            store.transition_job(&j.job_id, &claim),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn stale_attempt_guard_loses_the_swap() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        store.insert_job(&j).unwrap();

        let claim = JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 200)
            .expecting_attempts(1)
            .with_attempts(2);
        assert!(matches!(
            store.transition_job(&j.job_id, &claim),
            Err(StoreError::Conflict(_))
        ));
        let unchanged = store.get_job(&j.job_id).unwrap().unwrap();
        assert_eq!(unchanged.status, JobStatus::Pending);
        assert_eq!(unchanged.attempts, 0);
    }

    #[test]
    fn backoff_guard_refuses_early_claims() {
        let store = InMemoryStore::new();
        let j = job("a", 500);
        store.insert_job(&j).unwrap();

        let early = JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 400).available_by(400);
        assert!(matches!(
            store.transition_job(&j.job_id, &early),
            Err(StoreError::Conflict(_))
        ));

        let on_time = JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 500).available_by(500);
        assert_eq!(
            store.transition_job(&j.job_id, &on_time).unwrap().status,
            JobStatus::Dispatched
        );
    }

    #[test]
    fn stale_dispatched_listing_uses_last_update() {
        let store = InMemoryStore::new();
        let old = job("old", 100);
        let fresh = job("fresh", 100);
        let idle = job("idle", 100);
        for j in [&old, &fresh, &idle] {
            store.insert_job(j).unwrap();
        }
        for (j, at) in [(&old, 150), (&fresh, 900)] {
            store
                .transition_job(
                    &j.job_id,
                    &JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, at),
                )
                .unwrap();
        }

        let stale = store.list_stale_dispatched(500, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id, old.job_id);
    }

    #[test]
    fn forbidden_transition_is_rejected_before_lookup() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        store.insert_job(&j).unwrap();

        let skip = JobTransition::new(JobStatus::Pending, JobStatus::Completed, 200);
        assert!(matches!(
            store.transition_job(&j.job_id, &skip),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn retryable_excludes_exhausted_jobs() {
        let store = InMemoryStore::new();
        let a = job("a", 100);
        let b = job("b", 100);
        store.insert_job(&a).unwrap();
        store.insert_job(&b).unwrap();

        for (j, attempts) in [(&a, 1), (&b, 3)] {
            store
                .transition_job(
                    &j.job_id,
                    &JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 150)
                        .with_attempts(attempts),
                )
                .unwrap();
            store
                .transition_job(
                    &j.job_id,
                    &JobTransition::new(JobStatus::Dispatched, JobStatus::Failed, 160),
                )
                .unwrap();
        }

        let retryable = store.list_retryable(3, 10).unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].job_id, a.job_id);
    }

    #[test]
    fn retryable_excludes_at_most_once_jobs() {
        let store = InMemoryStore::new();
        let mut once = job("once", 100).with_guarantee(DeliveryGuarantee::AtMostOnce);
        once.status = JobStatus::Failed;
        once.attempts = 1;
        store.insert_job(&once).unwrap();

        assert!(store.list_retryable(3, 10).unwrap().is_empty());
    }

    #[test]
    fn only_one_running_execution_per_job() {
        let store = InMemoryStore::new();
        let j = job("a", 100);

        store.insert_execution(&running(&j, 1, 100)).unwrap();
        assert!(matches!(
            store.insert_execution(&running(&j, 2, 110)),
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.insert_execution(&running(&j, 1, 120)),
            Err(StoreError::Duplicate(_))
        ));
    }

    #[test]
    fn replaying_same_result_is_idempotent() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        let exec = running(&j, 1, 100);
        store.insert_execution(&exec).unwrap();

        let first = store
            .update_execution(&exec.execution_id, &ExecutionUpdate::success(200))
            .unwrap();
        let second = store
            .update_execution(&exec.execution_id, &ExecutionUpdate::success(300))
            .unwrap();

        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(first.execution(), second.execution());

        let stored = store.get_execution(&exec.execution_id).unwrap().unwrap();
        assert_eq!(stored.result, ExecutionResult::Success);
        assert_eq!(stored.finished_at, Some(200));
    }

    #[test]
    fn finishing_with_other_result_conflicts() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        let exec = running(&j, 1, 100);
        store.insert_execution(&exec).unwrap();

        store
            .update_execution(&exec.execution_id, &ExecutionUpdate::failure(200, "stale"))
            .unwrap();
        assert!(matches!(
            store.update_execution(&exec.execution_id, &ExecutionUpdate::success(210)),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn finished_execution_frees_the_running_slot() {
        let store = InMemoryStore::new();
        let j = job("a", 100);
        let first = running(&j, 1, 100);
        store.insert_execution(&first).unwrap();
        store
            .update_execution(&first.execution_id, &ExecutionUpdate::failure(150, "boom"))
            .unwrap();

        store.insert_execution(&running(&j, 2, 200)).unwrap();
        let history = store.list_executions(&j.job_id).unwrap();
        assert_eq!(history.iter().map(|e| e.attempt).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn stale_running_listing() {
        let store = InMemoryStore::new();
        let a = job("a", 100);
        let b = job("b", 100);
        store.insert_execution(&running(&a, 1, 100)).unwrap();
        store.insert_execution(&running(&b, 1, 900)).unwrap();

        let stale = store.list_stale_running(500, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job_id, a.job_id);
    }

    #[test]
    fn stats_count_by_status() {
        let store = InMemoryStore::new();
        for i in 0..3 {
            store.insert_job(&job(&format!("k{i}"), 100)).unwrap();
        }
        let j = job("k0", 100);
        store
            .transition_job(
                &j.job_id,
                &JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 110),
            )
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.total(), 3);
    }
}

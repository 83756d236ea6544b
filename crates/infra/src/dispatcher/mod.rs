//! Job dispatcher.
//!
//! Claims runnable jobs by compare-and-swap and hands them to reserved
//! workers. Many dispatchers may poll the same store: the claim swaps on the
//! status, the attempt counter seen at poll time and the backoff deadline,
//! so a stale snapshot can never win. The execution store refuses a second
//! Running execution for a job.

use std::sync::Arc;

use tracing::{debug, info, warn};

use cadence_core::time::duration_millis;
use cadence_core::{Clock, EpochMillis, Execution, Job, JobStatus};

use crate::error::CycleError;
use crate::retry::RetryPolicy;
use crate::runner::PeriodicTask;
use crate::store::{ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError};
use crate::workers::{Assignment, Reservation, SlotAllocator};

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Jobs fetched per poll (and Failed jobs considered per retry sweep).
    pub batch_size: usize,
    /// Re-enqueue policy. `max_attempts` is the total execution budget per job.
    pub retry: RetryPolicy,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Failed jobs put back to Pending.
    pub retried: usize,
    /// Jobs handed to a worker.
    pub dispatched: usize,
    /// Claims lost to another dispatcher.
    pub lost_races: usize,
    /// Claims undone because the execution could not be started.
    pub released: usize,
    /// The cycle stopped early because no worker was free.
    pub saturated: bool,
}

enum Claim {
    Dispatched,
    LostRace,
    Released,
}

/// Polls runnable jobs and assigns them to workers.
pub struct Dispatcher<S> {
    store: S,
    slots: SlotAllocator,
    clock: Arc<dyn Clock>,
    settings: DispatcherSettings,
}

impl<S> Dispatcher<S>
where
    S: JobStore + ExecutionStore,
{
    pub fn new(
        store: S,
        slots: SlotAllocator,
        clock: Arc<dyn Clock>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            slots,
            clock,
            settings,
        }
    }

    /// Run one dispatch cycle: retry sweep, then poll and claim.
    pub fn run_cycle(&self) -> Result<DispatchReport, CycleError> {
        let now = self.clock.now_millis();
        let mut report = DispatchReport {
            retried: self.requeue_failed(now)?,
            ..DispatchReport::default()
        };

        let pending = self.store.list_pending(now, self.settings.batch_size)?;
        for job in pending {
            let Some(reservation) = self.slots.try_reserve() else {
                debug!(active = self.slots.active(), "all workers busy, backing off");
                report.saturated = true;
                break;
            };

            match self.dispatch(job, reservation, now)? {
                Claim::Dispatched => report.dispatched += 1,
                Claim::LostRace => report.lost_races += 1,
                Claim::Released => report.released += 1,
            }
        }

        if report.dispatched > 0 || report.retried > 0 {
            info!(
                dispatched = report.dispatched,
                retried = report.retried,
                lost_races = report.lost_races,
                saturated = report.saturated,
                "dispatch cycle"
            );
        }
        Ok(report)
    }

    /// Move Failed jobs with attempts left back to Pending, delayed by backoff.
    fn requeue_failed(&self, now: EpochMillis) -> Result<usize, CycleError> {
        let policy = &self.settings.retry;
        let candidates = self
            .store
            .list_retryable(policy.max_attempts, self.settings.batch_size)?;

        let mut retried = 0;
        for job in candidates {
            if !job.may_retry(policy.max_attempts) {
                continue;
            }
            let delay = policy.delay_after(job.attempts, job.job_id.as_str());
            let available_at = now.saturating_add(duration_millis(delay));
            let transition = JobTransition::new(JobStatus::Failed, JobStatus::Pending, now)
                .expecting_attempts(job.attempts)
                .with_available_at(available_at);

            match self.store.transition_job(&job.job_id, &transition) {
                Ok(_) => {
                    debug!(
                        job_id = %job.job_id,
                        attempts = job.attempts,
                        available_at,
                        "job re-enqueued"
                    );
                    retried += 1;
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(job_id = %job.job_id, "retry already taken by another dispatcher");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(retried)
    }

    fn dispatch(&self, job: Job, reservation: Reservation, now: EpochMillis) -> Result<Claim, CycleError> {
        let attempt = job.attempts + 1;
        let claim = JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, now)
            .expecting_attempts(job.attempts)
            .available_by(now)
            .with_attempts(attempt);

        let claimed = match self.store.transition_job(&job.job_id, &claim) {
            Ok(claimed) => claimed,
            Err(StoreError::Conflict(_)) => {
                debug!(job_id = %job.job_id, "claim lost to another dispatcher");
                return Ok(Claim::LostRace);
            }
            Err(e) => return Err(e.into()),
        };

        let execution = Execution::start(
            claimed.job_id.clone(),
            attempt,
            reservation.worker_id().clone(),
            now,
        )
        .map_err(StoreError::from)?;

        if let Err(e) = self.store.insert_execution(&execution) {
            return match e {
                StoreError::Duplicate(_) => {
                    // the attempt is already recorded; the reaper settles the
                    // job from that execution's result
                    warn!(job_id = %claimed.job_id, attempt, "attempt already recorded, leaving job dispatched");
                    Ok(Claim::Released)
                }
                StoreError::Conflict(_) => {
                    warn!(job_id = %claimed.job_id, attempt, error = %e, "job still has a running execution, releasing claim");
                    self.release(&claimed, now);
                    Ok(Claim::Released)
                }
                other => {
                    warn!(job_id = %claimed.job_id, attempt, error = %other, "could not start execution, releasing claim");
                    self.release(&claimed, now);
                    Err(other.into())
                }
            };
        }

        debug!(
            job_id = %claimed.job_id,
            execution_id = %execution.execution_id,
            worker_id = %execution.worker_id,
            "job dispatched"
        );

        if let Err(Assignment { job, execution }) = reservation.assign(Assignment {
            job: claimed,
            execution,
        }) {
            warn!(job_id = %job.job_id, "worker pool closed, failing execution");
            self.fail_unassigned(&job, &execution, now);
            return Ok(Claim::Released);
        }

        Ok(Claim::Dispatched)
    }

    /// Undo a claim whose execution never started. Best effort: if this
    /// fails the reaper returns the job once it has been Dispatched for
    /// longer than the stale threshold.
    fn release(&self, claimed: &Job, now: EpochMillis) {
        let release = JobTransition::new(JobStatus::Dispatched, JobStatus::Pending, now)
            .expecting_attempts(claimed.attempts)
            .with_attempts(claimed.attempts.saturating_sub(1));
        if let Err(e) = self.store.transition_job(&claimed.job_id, &release) {
            warn!(job_id = %claimed.job_id, error = %e, "failed to release claim");
        }
    }

    /// The execution exists but no worker will run it: record the failure so
    /// the retry sweep picks the job up again.
    fn fail_unassigned(&self, job: &Job, execution: &Execution, now: EpochMillis) {
        let update = ExecutionUpdate::failure(now, "worker pool closed before hand-off");
        if let Err(e) = self.store.update_execution(&execution.execution_id, &update) {
            warn!(execution_id = %execution.execution_id, error = %e, "failed to fail unassigned execution");
            return;
        }
        let transition = JobTransition::new(JobStatus::Dispatched, JobStatus::Failed, now)
            .expecting_attempts(execution.attempt);
        if let Err(e) = self.store.transition_job(&job.job_id, &transition) {
            warn!(job_id = %job.job_id, error = %e, "failed to fail unassigned job");
        }
    }
}

impl<S> PeriodicTask for Dispatcher<S>
where
    S: JobStore + ExecutionStore + 'static,
{
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    fn tick(&self) -> Result<(), CycleError> {
        self.run_cycle().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use cadence_core::{ConfigId, DeliveryGuarantee, ExecutionResult, ManualClock};

    use super::*;
    use crate::error::CollaboratorError;
    use crate::store::InMemoryStore;
    use crate::workers::{JobExecutor, WorkerPool};

    fn succeeding() -> Arc<dyn JobExecutor> {
        Arc::new(|_: &[u8]| -> Result<(), CollaboratorError> { Ok(()) })
    }

    fn job(key: &str, due: EpochMillis) -> Job {
        Job::new(ConfigId::from_raw("1"), key, Vec::new(), due, due)
    }

    fn settings(max_attempts: u32) -> DispatcherSettings {
        DispatcherSettings {
            batch_size: 10,
            retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(100)),
        }
    }

    #[test]
    fn saturated_pool_leaves_remaining_jobs_pending() {
        let store = InMemoryStore::arc();
        for (i, due) in [10, 20, 30].into_iter().enumerate() {
            store.insert_job(&job(&format!("job-{i}"), due)).unwrap();
        }
        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();
        // hold the only worker so nothing can be handed off
        let held = slots.try_reserve().unwrap();

        let dispatcher = Dispatcher::new(store.clone(), slots, ManualClock::arc(100), settings(3));
        let report = dispatcher.run_cycle().unwrap();

        assert!(report.saturated);
        assert_eq!(report.dispatched, 0);
        assert_eq!(store.stats().unwrap().pending, 3);

        drop(held);
        pool.shutdown();
    }

    #[test]
    fn claims_oldest_first_and_records_execution() {
        let store = InMemoryStore::arc();
        store.insert_job(&job("late", 50)).unwrap();
        store.insert_job(&job("early", 10)).unwrap();
        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();

        let dispatcher = Dispatcher::new(store.clone(), slots.clone(), ManualClock::arc(100), settings(3));
        let report = dispatcher.run_cycle().unwrap();
        pool.shutdown();

        // one worker: the first claim reserves it until the worker finishes,
        // so at most the oldest job is guaranteed to be dispatched
        assert!(report.dispatched >= 1);
        let early = store.get_job(&job("early", 10).job_id).unwrap().unwrap();
        assert_eq!(early.attempts, 1);
        let history = store.list_executions(&early.job_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].attempt, 1);
        assert_eq!(history[0].started_at, 100);
    }

    #[test]
    fn jobs_not_yet_available_are_left_alone() {
        let store = InMemoryStore::arc();
        store.insert_job(&job("future", 500)).unwrap();
        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();

        let dispatcher = Dispatcher::new(store.clone(), pool.slots(), ManualClock::arc(100), settings(3));
        assert_eq!(dispatcher.run_cycle().unwrap(), DispatchReport::default());
        pool.shutdown();
    }

    #[test]
    fn failed_jobs_are_requeued_with_backoff_until_budget_is_spent() {
        let store = InMemoryStore::arc();
        let mut retryable = job("retry-me", 10);
        retryable.status = JobStatus::Failed;
        retryable.attempts = 1;
        let mut exhausted = job("spent", 10);
        exhausted.status = JobStatus::Failed;
        exhausted.attempts = 3;
        store.insert_job(&retryable).unwrap();
        store.insert_job(&exhausted).unwrap();

        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let dispatcher = Dispatcher::new(store.clone(), pool.slots(), ManualClock::arc(1_000), settings(3));
        let report = dispatcher.run_cycle().unwrap();
        pool.shutdown();

        assert_eq!(report.retried, 1);
        // backoff keeps it out of this cycle's poll
        assert_eq!(report.dispatched, 0);

        let requeued = store.get_job(&retryable.job_id).unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.available_at, 1_100);
        assert_eq!(requeued.attempts, 1);

        let spent = store.get_job(&exhausted.job_id).unwrap().unwrap();
        assert_eq!(spent.status, JobStatus::Failed);
    }

    #[test]
    fn closed_pool_fails_the_execution_instead_of_dropping_the_job() {
        let store = InMemoryStore::arc();
        let pending = job("orphan", 10);
        store.insert_job(&pending).unwrap();

        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();
        let reservation = slots.try_reserve().unwrap();
        let dispatcher = Dispatcher::new(store.clone(), slots, ManualClock::arc(100), settings(3));
        pool.shutdown();

        assert!(matches!(
            dispatcher.dispatch(pending.clone(), reservation, 100).unwrap(),
            Claim::Released
        ));

        let failed = store.get_job(&pending.job_id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 1);
        let history = store.list_executions(&pending.job_id).unwrap();
        assert_eq!(history[0].result, ExecutionResult::Failure);
    }

    #[test]
    fn second_dispatcher_loses_the_claim() {
        let store = InMemoryStore::arc();
        let pending = job("contended", 10);
        store.insert_job(&pending).unwrap();

        let pool = WorkerPool::start(2, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();
        let first = Dispatcher::new(store.clone(), slots.clone(), ManualClock::arc(100), settings(3));
        let second = Dispatcher::new(store.clone(), slots.clone(), ManualClock::arc(100), settings(3));

        // both saw the job as Pending; only one claim may win
        let r1 = slots.try_reserve().unwrap();
        let r2 = slots.try_reserve().unwrap();
        let a = first.dispatch(pending.clone(), r1, 100).unwrap();
        let b = second.dispatch(pending.clone(), r2, 100).unwrap();
        pool.shutdown();

        assert!(matches!(a, Claim::Dispatched));
        assert!(matches!(b, Claim::LostRace));
        assert_eq!(store.list_executions(&pending.job_id).unwrap().len(), 1);
    }

    #[test]
    fn stale_snapshot_cannot_claim_a_job_that_moved_on() {
        let store = InMemoryStore::arc();
        let pending = job("flaky", 10);
        store.insert_job(&pending).unwrap();

        // dispatcher A polls and holds this snapshot (attempts = 0)
        let snapshot = store.list_pending(100, 10).unwrap().remove(0);

        // meanwhile dispatcher B runs attempt 1, which fails, and requeues it
        let clock_b = ManualClock::arc(100);
        let failing: Arc<dyn JobExecutor> =
            Arc::new(|_: &[u8]| -> Result<(), CollaboratorError> { Err(CollaboratorError::new("HTTP 502")) });
        let pool_b = WorkerPool::start(1, store.clone(), failing, clock_b.clone()).unwrap();
        let b = Dispatcher::new(store.clone(), pool_b.slots(), clock_b.clone(), settings(3));
        assert_eq!(b.run_cycle().unwrap().dispatched, 1);
        let deadline = Instant::now() + Duration::from_secs(10);
        while store.get_job(&pending.job_id).unwrap().unwrap().status != JobStatus::Failed {
            assert!(Instant::now() < deadline, "attempt 1 never finished");
            thread::sleep(Duration::from_millis(1));
        }
        clock_b.set(200);
        assert_eq!(b.run_cycle().unwrap().retried, 1);
        pool_b.shutdown();

        let pool_a = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(300)).unwrap();
        let slots = pool_a.slots();
        let clock_a = ManualClock::arc(250);
        let a = Dispatcher::new(store.clone(), slots.clone(), clock_a.clone(), settings(3));
        let reservation = slots.try_reserve().unwrap();
        assert!(matches!(
            a.dispatch(snapshot, reservation, 250).unwrap(),
            Claim::LostRace
        ));

        let untouched = store.get_job(&pending.job_id).unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
        assert_eq!(untouched.attempts, 1);
        assert_eq!(untouched.available_at, 300);

        // once the backoff has elapsed the job runs as attempt 2
        clock_a.set(300);
        assert_eq!(a.run_cycle().unwrap().dispatched, 1);
        pool_a.shutdown();

        let done = store.get_job(&pending.job_id).unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempts, 2);
        let attempts: Vec<_> = store
            .list_executions(&pending.job_id)
            .unwrap()
            .iter()
            .map(|e| e.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[test]
    fn claim_is_refused_while_backing_off() {
        let store = InMemoryStore::arc();
        let pending = job("later", 500);
        store.insert_job(&pending).unwrap();

        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();
        let dispatcher = Dispatcher::new(store.clone(), slots.clone(), ManualClock::arc(100), settings(3));
        let reservation = slots.try_reserve().unwrap();

        assert!(matches!(
            dispatcher.dispatch(pending.clone(), reservation, 100).unwrap(),
            Claim::LostRace
        ));
        pool.shutdown();
        assert_eq!(store.get_job(&pending.job_id).unwrap().unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn recorded_attempt_leaves_the_job_dispatched_for_the_reaper() {
        let store = InMemoryStore::arc();
        let pending = job("out-of-step", 10);
        store.insert_job(&pending).unwrap();
        // attempt 1 already ran but the job record still says 0 attempts
        let recorded =
            Execution::start(pending.job_id.clone(), 1, cadence_core::WorkerId::from_raw("x-0"), 50)
                .unwrap();
        store.insert_execution(&recorded).unwrap();
        store
            .update_execution(&recorded.execution_id, &ExecutionUpdate::success(60))
            .unwrap();

        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let slots = pool.slots();
        let dispatcher = Dispatcher::new(store.clone(), slots.clone(), ManualClock::arc(100), settings(3));
        let reservation = slots.try_reserve().unwrap();

        assert!(matches!(
            dispatcher.dispatch(pending.clone(), reservation, 100).unwrap(),
            Claim::Released
        ));
        pool.shutdown();

        let job = store.get_job(&pending.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Dispatched);
        assert_eq!(job.attempts, 1);
        assert_eq!(store.list_executions(&pending.job_id).unwrap().len(), 1);
    }

    #[test]
    fn at_most_once_failures_are_never_requeued() {
        let store = InMemoryStore::arc();
        let mut once = job("once", 10).with_guarantee(DeliveryGuarantee::AtMostOnce);
        once.status = JobStatus::Failed;
        once.attempts = 1;
        store.insert_job(&once).unwrap();

        let pool = WorkerPool::start(1, store.clone(), succeeding(), ManualClock::arc(0)).unwrap();
        let dispatcher = Dispatcher::new(store.clone(), pool.slots(), ManualClock::arc(1_000), settings(3));
        let report = dispatcher.run_cycle().unwrap();
        pool.shutdown();

        assert_eq!(report.retried, 0);
        let job = store.get_job(&once.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.is_terminal(3));
    }
}

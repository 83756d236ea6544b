//! Running one assignment and recording its result.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, info, info_span, warn};

use cadence_core::{Clock, Execution, Job, JobStatus};

use crate::error::CollaboratorError;
use crate::store::{ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError};

use super::executor::JobExecutor;

/// A claimed job together with its Running execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job: Job,
    pub execution: Execution,
}

/// What a worker needs besides the assignment itself.
pub(crate) struct WorkerContext<S> {
    pub store: S,
    pub executor: Arc<dyn JobExecutor>,
    pub clock: Arc<dyn Clock>,
}

/// Outcome of running one assignment, for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// Execution and job both carry the result.
    Finished(JobStatus),
    /// The execution was finished by someone else (reaper) first.
    Superseded,
    /// The store could not be written. The reaper settles the job later,
    /// from the Running execution or from the finished one.
    Unrecorded,
}

pub(crate) fn run_assignment<S>(ctx: &WorkerContext<S>, assignment: Assignment) -> Recorded
where
    S: ExecutionStore + JobStore,
{
    let Assignment { job, execution } = assignment;
    let span = info_span!(
        "execution",
        job_id = %job.job_id,
        execution_id = %execution.execution_id,
        worker_id = %execution.worker_id,
        attempt = execution.attempt
    );
    let _enter = span.enter();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| ctx.executor.execute(&job.payload)))
        .unwrap_or_else(|_| Err(CollaboratorError::new("executor panicked")));
    let finished_at = ctx.clock.now_millis();

    let (update, target) = match &outcome {
        Ok(()) => (ExecutionUpdate::success(finished_at), JobStatus::Completed),
        Err(e) => {
            warn!(error = %e, "execution failed");
            (ExecutionUpdate::failure(finished_at, e.to_string()), JobStatus::Failed)
        }
    };

    match ctx.store.update_execution(&execution.execution_id, &update) {
        Ok(outcome) if outcome.was_applied() => {}
        Ok(_) => {
            warn!("execution already carried this result, leaving job to its owner");
            return Recorded::Superseded;
        }
        Err(StoreError::Conflict(reason)) => {
            warn!(reason = %reason, "execution already finished elsewhere, dropping result");
            return Recorded::Superseded;
        }
        Err(e) => {
            error!(error = %e, "failed to record execution result");
            return Recorded::Unrecorded;
        }
    }

    let transition = JobTransition::new(JobStatus::Dispatched, target, finished_at)
        .expecting_attempts(execution.attempt);
    match ctx.store.transition_job(&job.job_id, &transition) {
        Ok(_) => {
            info!(status = %target, "job finished");
            Recorded::Finished(target)
        }
        Err(StoreError::Conflict(reason)) => {
            warn!(reason = %reason, "job was reclaimed before its result arrived");
            Recorded::Superseded
        }
        Err(e) => {
            error!(error = %e, "failed to record job status");
            Recorded::Unrecorded
        }
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::{ConfigId, ExecutionResult, ManualClock, WorkerId};

    use super::*;
    use crate::store::InMemoryStore;

    fn claimed(store: &InMemoryStore) -> Assignment {
        let job = Job::new(ConfigId::from_raw("1"), "report", b"payload".to_vec(), 100, 100);
        store.insert_job(&job).unwrap();
        let job = store
            .transition_job(
                &job.job_id,
                &JobTransition::new(JobStatus::Pending, JobStatus::Dispatched, 200).with_attempts(1),
            )
            .unwrap();
        let execution =
            Execution::start(job.job_id.clone(), 1, WorkerId::from_raw("w-0"), 200).unwrap();
        store.insert_execution(&execution).unwrap();
        Assignment { job, execution }
    }

    fn context(
        store: Arc<InMemoryStore>,
        executor: impl JobExecutor + 'static,
    ) -> WorkerContext<Arc<InMemoryStore>> {
        WorkerContext {
            store,
            executor: Arc::new(executor),
            clock: ManualClock::arc(300),
        }
    }

    #[test]
    fn success_completes_job_and_execution() {
        let store = InMemoryStore::arc();
        let assignment = claimed(&store);
        let ctx = context(store.clone(), |payload: &[u8]| -> Result<(), CollaboratorError> {
            assert_eq!(payload, b"payload");
            Ok(())
        });

        assert_eq!(
            run_assignment(&ctx, assignment.clone()),
            Recorded::Finished(JobStatus::Completed)
        );

        let exec = store.get_execution(&assignment.execution.execution_id).unwrap().unwrap();
        assert_eq!(exec.result, ExecutionResult::Success);
        assert_eq!(exec.finished_at, Some(300));
        let job = store.get_job(&assignment.job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn failure_records_reason() {
        let store = InMemoryStore::arc();
        let assignment = claimed(&store);
        let ctx = context(store.clone(), |_: &[u8]| -> Result<(), CollaboratorError> {
            Err(CollaboratorError::new("HTTP 503"))
        });

        assert_eq!(
            run_assignment(&ctx, assignment.clone()),
            Recorded::Finished(JobStatus::Failed)
        );

        let exec = store.get_execution(&assignment.execution.execution_id).unwrap().unwrap();
        assert_eq!(exec.result, ExecutionResult::Failure);
        assert!(exec.error.unwrap().contains("HTTP 503"));
    }

    #[test]
    fn panicking_executor_is_a_failure() {
        let store = InMemoryStore::arc();
        let assignment = claimed(&store);
        let ctx = context(store.clone(), |_: &[u8]| -> Result<(), CollaboratorError> {
            panic!("boom")
        });

        assert_eq!(
            run_assignment(&ctx, assignment.clone()),
            Recorded::Finished(JobStatus::Failed)
        );
    }

    #[test]
    fn late_result_after_reclaim_is_dropped() {
        let store = InMemoryStore::arc();
        let assignment = claimed(&store);
        store
            .update_execution(
                &assignment.execution.execution_id,
                &ExecutionUpdate::failure(250, "stale"),
            )
            .unwrap();
        store
            .transition_job(
                &assignment.job.job_id,
                &JobTransition::new(JobStatus::Dispatched, JobStatus::Pending, 250),
            )
            .unwrap();

        let ctx = context(store.clone(), |_: &[u8]| -> Result<(), CollaboratorError> { Ok(()) });
        assert_eq!(run_assignment(&ctx, assignment.clone()), Recorded::Superseded);

        let job = store.get_job(&assignment.job.job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}

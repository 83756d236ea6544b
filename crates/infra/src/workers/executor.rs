use crate::error::CollaboratorError;

/// Runs the payload of a job.
///
/// Called from worker threads; one call per execution attempt. An `Err`
/// marks the execution as failed and hands the job to the retry policy.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, payload: &[u8]) -> Result<(), CollaboratorError>;
}

impl<F> JobExecutor for F
where
    F: Fn(&[u8]) -> Result<(), CollaboratorError> + Send + Sync,
{
    fn execute(&self, payload: &[u8]) -> Result<(), CollaboratorError> {
        self(payload)
    }
}

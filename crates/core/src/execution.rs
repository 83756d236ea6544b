//! Execution attempt record.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ExecutionId, JobId, WorkerId};
use crate::time::EpochMillis;

/// Outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
    Running,
    Success,
    Failure,
}

impl ExecutionResult {
    pub fn is_finished(self) -> bool {
        !matches!(self, ExecutionResult::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionResult::Running => "running",
            ExecutionResult::Success => "success",
            ExecutionResult::Failure => "failure",
        }
    }
}

impl core::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionResult {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionResult::Running),
            "success" => Ok(ExecutionResult::Success),
            "failure" => Ok(ExecutionResult::Failure),
            other => Err(DomainError::validation(format!(
                "unknown execution result '{other}'"
            ))),
        }
    }
}

/// One attempt to run a job (one `job_executions` document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub started_at: EpochMillis,
    pub finished_at: Option<EpochMillis>,
    pub result: ExecutionResult,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Failure reason reported by the executor or the reaper.
    pub error: Option<String>,
}

impl Execution {
    /// A freshly started execution for `attempt` of `job_id`.
    pub fn start(
        job_id: JobId,
        attempt: u32,
        worker_id: WorkerId,
        started_at: EpochMillis,
    ) -> Result<Self, DomainError> {
        if attempt == 0 {
            return Err(DomainError::validation("execution attempt must be >= 1"));
        }
        Ok(Self {
            execution_id: ExecutionId::for_attempt(&job_id, attempt),
            job_id,
            worker_id,
            started_at,
            finished_at: None,
            result: ExecutionResult::Running,
            attempt,
            error: None,
        })
    }

    pub fn is_running(&self) -> bool {
        self.result == ExecutionResult::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn started_execution_is_running() {
        let exec = Execution::start(
            JobId::from_raw("job"),
            1,
            WorkerId::from_raw("w-0"),
            10,
        )
        .unwrap();

        assert!(exec.is_running());
        assert_eq!(exec.execution_id.as_str(), "job:1");
        assert_eq!(exec.finished_at, None);
    }

    #[test]
    fn attempt_zero_is_rejected() {
        assert!(Execution::start(JobId::from_raw("job"), 0, WorkerId::from_raw("w"), 0).is_err());
    }

    #[test]
    fn result_parsing() {
        assert_eq!("failure".parse::<ExecutionResult>().unwrap(), ExecutionResult::Failure);
        assert!("done".parse::<ExecutionResult>().is_err());
        assert!(!ExecutionResult::Running.is_finished());
        assert!(ExecutionResult::Success.is_finished());
    }
}

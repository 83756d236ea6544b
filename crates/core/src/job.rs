//! Job record and status state machine.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{ConfigId, JobId};
use crate::time::EpochMillis;

/// Job lifecycle status.
///
/// ```text
/// Pending ──claim──▶ Dispatched ──success──▶ Completed
///    ▲                  │  │
///    │◀──── release ────┘  └──failure──▶ Failed
///    │                                     │
///    └───────────── retry (bounded) ◀──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a dispatcher.
    Pending,
    /// Claimed; an execution is (or is about to be) running.
    Dispatched,
    /// Finished successfully.
    Completed,
    /// Last execution failed. Retried while attempts remain.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Dispatched,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Allowed transitions. Anything not listed here is rejected by the stores.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                | (Dispatched, Pending)
                | (Failed, Pending)
        )
    }

    pub fn check_transition(self, to: JobStatus) -> DomainResult<()> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition { from: self, to })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// How often a job may run.
///
/// At-least-once jobs are retried and reclaimed until their attempt budget is
/// spent. At-most-once jobs never start a second execution: the first failed
/// or abandoned attempt leaves them terminally Failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryGuarantee {
    #[default]
    AtLeastOnce,
    AtMostOnce,
}

impl DeliveryGuarantee {
    pub const ALL: [DeliveryGuarantee; 2] =
        [DeliveryGuarantee::AtLeastOnce, DeliveryGuarantee::AtMostOnce];

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryGuarantee::AtLeastOnce => "at_least_once",
            DeliveryGuarantee::AtMostOnce => "at_most_once",
        }
    }
}

impl core::fmt::Display for DeliveryGuarantee {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryGuarantee {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryGuarantee::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown delivery guarantee '{s}'")))
    }
}

/// A unit of scheduled work (one `jobs` document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: JobId,
    pub config_id: ConfigId,
    /// Natural key of the work item this job was produced from.
    pub work_key: String,
    /// Opaque payload handed to the executor.
    pub payload: Vec<u8>,
    /// Due time of the work item.
    pub scheduled_for: EpochMillis,
    pub status: JobStatus,
    #[serde(default)]
    pub guarantee: DeliveryGuarantee,
    /// Number of executions started so far.
    pub attempts: u32,
    /// Earliest time a dispatcher may claim the job.
    pub available_at: EpochMillis,
    pub created_at: EpochMillis,
    pub updated_at: EpochMillis,
}

impl Job {
    /// Build a new pending job for a work item.
    pub fn new(
        config_id: ConfigId,
        work_key: impl Into<String>,
        payload: Vec<u8>,
        scheduled_for: EpochMillis,
        created_at: EpochMillis,
    ) -> Self {
        let work_key = work_key.into();
        Self {
            job_id: JobId::derive(&config_id, &work_key, scheduled_for),
            config_id,
            work_key,
            payload,
            scheduled_for,
            status: JobStatus::Pending,
            guarantee: DeliveryGuarantee::AtLeastOnce,
            attempts: 0,
            available_at: scheduled_for,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn with_guarantee(mut self, guarantee: DeliveryGuarantee) -> Self {
        self.guarantee = guarantee;
        self
    }

    /// Whether the job has used up its execution budget.
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Whether a failed or abandoned attempt may be followed by another one.
    pub fn may_retry(&self, max_attempts: u32) -> bool {
        self.guarantee == DeliveryGuarantee::AtLeastOnce && !self.attempts_exhausted(max_attempts)
    }

    /// Terminal from the scheduler's point of view: nothing will touch it again.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => !self.may_retry(max_attempts),
            JobStatus::Pending | JobStatus::Dispatched => false,
        }
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Dispatched => self.dispatched += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.dispatched + self.completed + self.failed
    }
}

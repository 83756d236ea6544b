//! Strongly-typed identifiers used across the scheduler.
//!
//! Identifiers are strings on the wire (they are stored verbatim in the
//! `producer_config`, `jobs` and `job_executions` collections), but each kind
//! gets its own newtype so a job id can never be passed where an execution id
//! is expected.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::time::EpochMillis;

/// Identifier of a producer configuration (owner of one watermark).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigId(String);

/// Identifier of a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Identifier of one execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

/// Identifier of a worker slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Wrap a raw identifier without validation.
            ///
            /// Use `FromStr` when the value comes from untrusted input.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(format!("{}: empty", $name)));
                }
                Ok(Self(trimmed.to_string()))
            }
        }
    };
}

impl_string_newtype!(ConfigId, "ConfigId");
impl_string_newtype!(JobId, "JobId");
impl_string_newtype!(ExecutionId, "ExecutionId");
impl_string_newtype!(WorkerId, "WorkerId");

/// Namespace for deterministic job ids (UUIDv5).
const JOB_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4e07_8d55_2f0c_7a19_e3b1);

impl JobId {
    /// Derive the job id of a work item produced for `config_id`.
    ///
    /// The same `(config_id, work_key, scheduled_for)` triple always yields the
    /// same id, which is what lets concurrent or restarted producers collide on
    /// insert instead of creating a second job for the same window.
    pub fn derive(config_id: &ConfigId, work_key: &str, scheduled_for: EpochMillis) -> Self {
        let name = format!("{}\u{1f}{}\u{1f}{}", config_id.as_str(), work_key, scheduled_for);
        Self(Uuid::new_v5(&JOB_ID_NAMESPACE, name.as_bytes()).to_string())
    }
}

impl ExecutionId {
    /// Execution id of the `attempt`-th execution of `job_id` (1-indexed).
    ///
    /// Two dispatchers that both believe they own the same attempt produce the
    /// same id, so the second insert fails as a duplicate.
    pub fn for_attempt(job_id: &JobId, attempt: u32) -> Self {
        Self(format!("{}:{}", job_id.as_str(), attempt))
    }
}

impl WorkerId {
    /// Id of slot `index` in the worker pool instance `pool`.
    pub fn for_slot(pool: &str, index: usize) -> Self {
        Self(format!("{pool}-{index}"))
    }

    /// A fresh pool instance prefix (UUIDv7, time-ordered).
    pub fn new_pool_prefix() -> String {
        Uuid::now_v7().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_job_id_is_deterministic() {
        let config = ConfigId::from_raw("1");
        let a = JobId::derive(&config, "report", 1500);
        let b = JobId::derive(&config, "report", 1500);
        assert_eq!(a, b);
    }

    #[test]
    fn derived_job_id_depends_on_every_component() {
        let config = ConfigId::from_raw("1");
        let base = JobId::derive(&config, "report", 1500);

        assert_ne!(base, JobId::derive(&ConfigId::from_raw("2"), "report", 1500));
        assert_ne!(base, JobId::derive(&config, "cleanup", 1500));
        assert_ne!(base, JobId::derive(&config, "report", 1501));
    }

    #[test]
    fn key_separator_prevents_ambiguous_concatenation() {
        let a = JobId::derive(&ConfigId::from_raw("1"), "12", 3);
        let b = JobId::derive(&ConfigId::from_raw("11"), "2", 3);
        assert_ne!(a, b);
    }

    #[test]
    fn execution_id_encodes_attempt() {
        let job = JobId::from_raw("job-a");
        assert_eq!(ExecutionId::for_attempt(&job, 2).as_str(), "job-a:2");
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(matches!(
            "  ".parse::<ConfigId>(),
            Err(DomainError::InvalidId(_))
        ));
        assert_eq!("  1 ".parse::<ConfigId>().unwrap().as_str(), "1");
    }
}

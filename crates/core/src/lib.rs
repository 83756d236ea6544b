//! `cadence-core`: scheduling domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job / execution / watermark records persisted by the
//! stores, the job status transition table, and the clock abstraction.

pub mod error;
pub mod execution;
pub mod id;
pub mod job;
pub mod time;
pub mod watermark;

pub use error::{DomainError, DomainResult};
pub use execution::{Execution, ExecutionResult};
pub use id::{ConfigId, ExecutionId, JobId, WorkerId};
pub use job::{DeliveryGuarantee, Job, JobStats, JobStatus};
pub use time::{Clock, EpochMillis, ManualClock, SystemClock};
pub use watermark::ProducerConfig;

//! Persistence boundary for the scheduler.
//!
//! Three logical collections back the whole system:
//!
//! - `producer_config`: one watermark per producer configuration
//! - `jobs`: job records and their status
//! - `job_executions`: one record per execution attempt
//!
//! Every cross-instance guarantee (no double production, no double dispatch,
//! exactly-once reclaim) rests on the conditional writes defined here, never
//! on in-process locks.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use r#trait::{
    ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError, UpdateOutcome,
    WatermarkStore,
};

//! Infrastructure layer: stores, scheduling services and their wiring.
//!
//! - [`store`]: watermark / job / execution stores (in-memory and Postgres)
//! - [`producer`]: turns due work into jobs and advances the watermark
//! - [`dispatcher`]: claims runnable jobs and hands them to workers
//! - [`workers`]: fixed-size pool running jobs through an executor
//! - [`reaper`]: reclaims executions abandoned by dead workers
//! - [`scheduler`]: runs all of the above on independent timers

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod producer;
pub mod reaper;
pub mod retry;
pub mod runner;
pub mod scheduler;
pub mod store;
pub mod workers;


pub use config::SchedulerConfig;
pub use error::{CollaboratorError, CycleError};
pub use scheduler::{Scheduler, SchedulerHandle};

//! Worker pool and job executors.

mod executor;
mod http;
mod pool;
mod worker;

pub use executor::JobExecutor;
pub use http::{ApiCall, HttpExecutor};
pub use pool::{Reservation, SlotAllocator, WorkerPool};
pub use worker::Assignment;

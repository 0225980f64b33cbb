//! Event dispatch workers: per-key lanes and the thread pool draining them.

mod pool;
mod scheduler;

pub use pool::{PoolStats, ShutdownOutcome, ShutdownReport, WorkerPool};
pub use scheduler::{Dispatch, Scheduler};

//! Generation worker pool and its monitor.
//!
//! ## Structure
//!
//! - [`manager`] - [`WorkerPool`]: submission, counters, two-phase shutdown.
//! - [`worker`] - the per-worker task loop.
//! - [`job`] - [`PoolJob`], a subject plus its completion sink.
//! - [`monitor`] - [`PoolMonitor`], periodic diagnostic sampling.

pub mod job;
pub mod manager;
pub mod monitor;
pub mod worker;

pub use job::PoolJob;
pub use manager::{PoolStats, ShutdownOutcome, WorkerPool};
pub use monitor::PoolMonitor;

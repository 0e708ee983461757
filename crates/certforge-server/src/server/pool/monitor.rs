use super::{PoolStats, WorkerPool};
use core::{fmt, time::Duration};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A diagnostic condition raised by [`assess`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolAlert {
    /// Active jobs reached the high-water fraction of the worker count.
    HighUtilization { percent: u32 },
    /// More jobs are queued than there are workers.
    DeepQueue { pending: usize, workers: usize },
}

impl fmt::Display for PoolAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighUtilization { percent } => {
                write!(f, "High worker pool utilization: {percent}%")
            }
            Self::DeepQueue { pending, workers } => {
                write!(f, "Job queue depth {pending} exceeds worker count {workers}")
            }
        }
    }
}

/// Evaluates a stats snapshot against the alert thresholds.
pub fn assess(stats: &PoolStats, high_water: f64) -> Vec<PoolAlert> {
    let mut alerts = Vec::new();
    if stats.workers > 0 {
        let utilization = stats.active as f64 / stats.workers as f64;
        if utilization >= high_water {
            alerts.push(PoolAlert::HighUtilization {
                percent: (utilization * 100.0).round() as u32,
            });
        }
    }
    if stats.pending > stats.workers {
        alerts.push(PoolAlert::DeepQueue {
            pending: stats.pending,
            workers: stats.workers,
        });
    }
    alerts
}

/// Periodic sampler of [`WorkerPool`] counters.
///
/// Purely diagnostic: it logs and never influences admission. The task is
/// owned by the monitor and ends on [`stop`](Self::stop).
pub struct PoolMonitor {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PoolMonitor {
    /// Starts sampling `pool` every `interval` on the current runtime.
    pub fn spawn(pool: Arc<WorkerPool>, interval: Duration, high_water: f64) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sample_loop(pool, interval, high_water, cancel.clone()));
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the sampling task and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::error!("Pool monitor task failed: {err}");
            }
            tracing::debug!("Pool monitor stopped");
        }
    }
}

impl Drop for PoolMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn sample_loop(
    pool: Arc<WorkerPool>,
    interval: Duration,
    high_water: f64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = pool.stats();
                tracing::info!(
                    "Pool status: {}/{} active, {} pending, {} completed, {} failed",
                    stats.active,
                    stats.workers,
                    stats.pending,
                    stats.completed,
                    stats.failed
                );
                for alert in assess(&stats, high_water) {
                    tracing::warn!("{alert}");
                }
            }
        }
    }
}

//! Worker pool for CPU-bound issuance jobs.
//!
//! [`WorkerPool`] owns a fixed set of tokio worker tasks fed from a single
//! unbounded MPSC queue. Submission never blocks the caller, which is the
//! Reactor thread. An optional admission limit turns a queue that is too deep
//! into an immediate [`Error::Busy`] instead of unbounded growth.
//!
//! Shutdown is two-phase: the queue is closed so workers drain what is
//! already queued, and if that does not finish within the grace period the
//! shared [`CancellationToken`] is cancelled, which drops every remaining
//! job and reports [`Error::Cancelled`] to its waiters.

use super::{
    PoolJob,
    worker::{SharedQueue, worker_loop},
};
use crate::server::issuer::SigningService;
use certforge_core::Error;
use core::time::Duration;
use futures::future::join_all;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;

/// Live counters shared between the pool and its workers.
#[derive(Default)]
pub struct PoolCounters {
    pub active: AtomicUsize,
    pub pending: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
}

/// Point-in-time snapshot of the pool's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker slots.
    pub workers: usize,
    /// Jobs currently executing.
    pub active: usize,
    /// Jobs queued but not yet picked up by a worker.
    pub pending: usize,
    /// Jobs finished since start, successful or not.
    pub completed: usize,
    /// Subset of `completed` that reported an error.
    pub failed: usize,
}

/// How [`WorkerPool::shutdown`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every queued and running job finished within the grace period.
    Drained { completed: usize },
    /// The grace period elapsed; `cancelled` jobs were dropped.
    Forced { cancelled: usize },
    /// The pool had already been shut down.
    AlreadyStopped,
}

pub struct WorkerPool {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<PoolJob>>>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    counters: Arc<PoolCounters>,
    workers: usize,
    max_pending: Option<usize>,
}

impl WorkerPool {
    /// Spawns `num_workers` worker tasks on the current tokio runtime.
    ///
    /// `max_pending` bounds the number of queued jobs; `None` leaves the
    /// queue unbounded.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(
        num_workers: usize,
        authority: Arc<dyn SigningService>,
        max_pending: Option<usize>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(PoolCounters::default());
        let cancel = CancellationToken::new();

        let handles = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&queue),
                    Arc::clone(&authority),
                    Arc::clone(&counters),
                    cancel.clone(),
                ))
            })
            .collect();

        tracing::debug!("Spawned {num_workers} workers");

        Self {
            sender: parking_lot::Mutex::new(Some(tx)),
            handles: tokio::sync::Mutex::new(handles),
            cancel,
            counters,
            workers: num_workers,
            max_pending,
        }
    }

    /// Queues `job` for execution.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once [`shutdown`](Self::shutdown) has
    ///   started.
    /// - [`Error::Busy`] when the admission limit is reached.
    ///
    /// A refused job reports the same error to its sink before this returns.
    pub fn submit(&self, job: PoolJob) -> Result<(), Error> {
        if let Some(max) = self.max_pending {
            let pending = self.pending();
            if pending >= max {
                let err = Error::Busy { pending };
                tracing::warn!("Refusing job for {:?}: {err}", job.subject());
                job.finish(Err(err.clone()));
                return Err(err);
            }
        }

        let refused = {
            let sender = self.sender.lock();
            match sender.as_ref() {
                Some(tx) => {
                    self.counters.pending.fetch_add(1, Ordering::AcqRel);
                    match tx.send(job) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::SendError(job)) => {
                            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
                            job
                        }
                    }
                }
                None => job,
            }
        };

        // Sinks run outside the sender lock.
        refused.finish(Err(Error::ServiceShutdown));
        Err(Error::ServiceShutdown)
    }

    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            active: self.counters.active.load(Ordering::Acquire),
            pending: self.pending(),
            completed: self.counters.completed.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
        }
    }

    /// Stops accepting jobs and waits up to `grace` for queued and running
    /// jobs to finish, then cancels whatever is left.
    ///
    /// Idempotent: concurrent or repeated calls wait for the first one and
    /// return [`ShutdownOutcome::AlreadyStopped`].
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let mut handles = self.handles.lock().await;
        if handles.is_empty() {
            return ShutdownOutcome::AlreadyStopped;
        }

        // Phase 1: close the queue; workers exit once it is drained.
        drop(self.sender.lock().take());
        let completed_before = self.counters.completed.load(Ordering::Acquire);
        tracing::info!(
            "Draining worker pool ({} active, {} pending, grace {grace:?})",
            self.counters.active.load(Ordering::Acquire),
            self.pending()
        );

        let outcome = match timeout(grace, join_all(handles.iter_mut())).await {
            Ok(_) => {
                let completed = self.counters.completed.load(Ordering::Acquire) - completed_before;
                tracing::info!("Worker pool drained ({completed} jobs finished)");
                ShutdownOutcome::Drained { completed }
            }
            Err(_) => {
                // Phase 2: cancel everything still running or queued.
                let cancelled = self.counters.active.load(Ordering::Acquire) + self.pending();
                tracing::warn!("Shutdown grace period elapsed, cancelling {cancelled} jobs");
                self.cancel.cancel();
                for handle in handles.iter_mut() {
                    // Handles completed during the drain were already polled
                    // to completion and must not be polled again.
                    if !handle.is_finished() {
                        if let Err(err) = handle.await {
                            tracing::error!("Worker task failed during shutdown: {err}");
                        }
                    }
                }
                ShutdownOutcome::Forced { cancelled }
            }
        };

        handles.clear();
        self.counters.pending.store(0, Ordering::Release);
        outcome
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::cache::IssuanceResult;
    use crate::server::issuer::{IssuerResult, fake::CountingIssuer};
    use certforge_core::IssuedPair;
    use tokio::sync::oneshot;

    fn job(subject: &str) -> (PoolJob, oneshot::Receiver<IssuanceResult>) {
        let (tx, rx) = oneshot::channel();
        let job = PoolJob::new(subject, move |result| {
            let _ = tx.send(result);
        });
        (job, rx)
    }

    /// Blocks every issuance until the paired sender sends or is dropped.
    struct GatedIssuer {
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl GatedIssuer {
        fn new() -> (Self, std::sync::mpsc::Sender<()>) {
            let (tx, rx) = std::sync::mpsc::channel();
            (
                Self {
                    gate: std::sync::Mutex::new(rx),
                },
                tx,
            )
        }
    }

    impl SigningService for GatedIssuer {
        fn issue(&self, subject: &str) -> IssuerResult<IssuedPair> {
            let _ = self.gate.lock().unwrap().recv();
            Ok(IssuedPair::new(subject.to_owned(), subject.to_owned()))
        }
    }

    /// Records the highest number of concurrent issuances.
    #[derive(Default)]
    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SigningService for ConcurrencyProbe {
        fn issue(&self, subject: &str) -> IssuerResult<IssuedPair> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(IssuedPair::new(subject.to_owned(), subject.to_owned()))
        }
    }

    async fn wait_for(pool: &WorkerPool, check: impl Fn(PoolStats) -> bool) {
        timeout(Duration::from_secs(5), async {
            while !check(pool.stats()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pool never reached the expected state");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn executes_and_counts_jobs() {
        let issuer = Arc::new(CountingIssuer::default());
        let pool = WorkerPool::new(2, issuer.clone(), None);

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (job, rx) = job(&format!("subject-{i}"));
            pool.submit(job).unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }

        let stats = pool.stats();
        assert_eq!(stats.workers, 2);
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(issuer.calls(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failures_are_reported_and_counted() {
        let pool = WorkerPool::new(1, Arc::new(CountingIssuer::failing_for("mallory")), None);
        let (job, rx) = job("mallory");
        pool.submit(job).unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Generation { .. })));
        wait_for(&pool, |s| s.failed == 1 && s.completed == 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_worker_count() {
        let probe = Arc::new(ConcurrencyProbe::default());
        let pool = WorkerPool::new(3, probe.clone(), None);

        let mut receivers = Vec::new();
        for i in 0..12 {
            let (job, rx) = job(&format!("n{i}"));
            pool.submit(job).unwrap();
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert!(probe.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn admission_limit_refuses_with_busy() {
        let (issuer, release) = GatedIssuer::new();
        let pool = WorkerPool::new(1, Arc::new(issuer), Some(1));

        let (running, running_rx) = job("running");
        pool.submit(running).unwrap();
        wait_for(&pool, |s| s.active == 1 && s.pending == 0).await;

        let (queued, queued_rx) = job("queued");
        pool.submit(queued).unwrap();

        let (refused, refused_rx) = job("refused");
        assert_eq!(pool.submit(refused), Err(Error::Busy { pending: 1 }));
        assert_eq!(refused_rx.await.unwrap(), Err(Error::Busy { pending: 1 }));

        drop(release);
        assert!(running_rx.await.unwrap().is_ok());
        assert!(queued_rx.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_shutdown_drains_queue() {
        let issuer = Arc::new(CountingIssuer::with_delay(Duration::from_millis(10)));
        let pool = WorkerPool::new(2, issuer.clone(), None);

        let mut receivers = Vec::new();
        for i in 0..4 {
            let (job, rx) = job(&format!("d{i}"));
            pool.submit(job).unwrap();
            receivers.push(rx);
        }

        let outcome = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(outcome, ShutdownOutcome::Drained { completed: 4 });
        for rx in receivers {
            assert!(rx.await.unwrap().is_ok());
        }

        let (late, late_rx) = job("late");
        assert_eq!(pool.submit(late), Err(Error::ServiceShutdown));
        assert_eq!(late_rx.await.unwrap(), Err(Error::ServiceShutdown));

        assert_eq!(
            pool.shutdown(Duration::from_secs(5)).await,
            ShutdownOutcome::AlreadyStopped
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn forced_shutdown_cancels_running_and_queued_jobs() {
        let (issuer, release) = GatedIssuer::new();
        let pool = WorkerPool::new(1, Arc::new(issuer), None);

        let (running, running_rx) = job("running");
        pool.submit(running).unwrap();
        wait_for(&pool, |s| s.active == 1).await;
        let (queued, queued_rx) = job("queued");
        pool.submit(queued).unwrap();

        let outcome = pool.shutdown(Duration::from_millis(50)).await;
        assert_eq!(outcome, ShutdownOutcome::Forced { cancelled: 2 });
        assert_eq!(running_rx.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(queued_rx.await.unwrap(), Err(Error::Cancelled));
        assert_eq!(pool.stats().active, 0);

        // Let the orphaned blocking call return so the runtime can stop.
        drop(release);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_shutdown_calls_agree() {
        let pool = Arc::new(WorkerPool::new(2, Arc::new(CountingIssuer::default()), None));
        let (a, b) = tokio::join!(
            pool.shutdown(Duration::from_secs(1)),
            pool.shutdown(Duration::from_secs(1))
        );
        let outcomes = [a, b];
        assert!(outcomes.contains(&ShutdownOutcome::AlreadyStopped));
        assert!(outcomes.contains(&ShutdownOutcome::Drained { completed: 0 }));
    }
}

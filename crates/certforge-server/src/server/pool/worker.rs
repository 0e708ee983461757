use super::{PoolJob, manager::PoolCounters};
use crate::server::{issuer::SigningService, telemetry};
use certforge_core::Error;
use std::sync::{Arc, atomic::Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Receiving end of the job queue, shared by every worker.
pub type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<PoolJob>>>;

/// Worker task that executes [`PoolJob`]s until the queue closes or the pool
/// is cancelled.
///
/// Workers compete for jobs on one shared receiver, so an idle worker always
/// picks up the next queued job. The signing itself runs on tokio's blocking
/// pool; the worker task only awaits it, so cancelling the worker drops the
/// job (reporting [`Error::Cancelled`]) without waiting for the key
/// generation to return.
pub async fn worker_loop(
    worker_id: usize,
    queue: SharedQueue,
    authority: Arc<dyn SigningService>,
    counters: Arc<PoolCounters>,
    cancel: CancellationToken,
) {
    tracing::trace!("Worker {worker_id} started");

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = async { queue.lock().await.recv().await } => job,
        };
        let Some(job) = next else {
            tracing::debug!("Worker {worker_id} found the queue closed");
            break;
        };
        counters.pending.fetch_sub(1, Ordering::AcqRel);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Worker {worker_id} cancelled mid-job");
                break;
            }
            () = run_job(worker_id, job, &authority, &counters) => {}
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

/// Decrements the active counter when a job finishes or is dropped.
struct ActiveGuard<'a>(&'a PoolCounters);

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a PoolCounters) -> Self {
        counters.active.fetch_add(1, Ordering::AcqRel);
        Self(counters)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_job(
    worker_id: usize,
    job: PoolJob,
    authority: &Arc<dyn SigningService>,
    counters: &PoolCounters,
) {
    let _active = ActiveGuard::enter(counters);
    let subject = job.subject().to_owned();
    let signer = Arc::clone(authority);
    let started = Instant::now();

    tracing::debug!("Worker {worker_id} generating credentials for {subject:?}");
    telemetry::increment_generations();

    let result = match tokio::task::spawn_blocking(move || signer.issue(&subject)).await {
        Ok(Ok(pair)) => Ok(pair),
        Ok(Err(err)) => Err(Error::from(err)),
        Err(join_err) => Err(Error::Generation {
            reason: format!("signing task failed: {join_err}"),
        }),
    };

    let elapsed = started.elapsed();
    telemetry::record_generation_duration(elapsed.as_secs_f64() * 1_000.0);
    counters.completed.fetch_add(1, Ordering::AcqRel);

    match &result {
        Ok(_) => tracing::debug!(
            "Worker {worker_id} issued {:?} in {elapsed:?}",
            job.subject()
        ),
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::AcqRel);
            telemetry::increment_generation_errors();
            tracing::warn!("Worker {worker_id} failed to issue {:?}: {err}", job.subject());
        }
    }

    job.finish(result);
}

use crate::server::{
    cache::{DedupCache, Lookup, PendingIssuance},
    pool::{PoolJob, WorkerPool},
    telemetry,
};
use std::sync::Arc;

/// Joins the dedup cache to the worker pool.
///
/// Every request first sweeps expired entries, then either joins the live
/// issuance for the name or creates one and submits exactly one job for it.
/// A failed issuance removes its own cache entry before notifying waiters,
/// so the next request for the name starts a fresh job.
#[derive(Clone)]
pub struct IssuanceService {
    cache: Arc<DedupCache>,
    pool: Arc<WorkerPool>,
}

impl IssuanceService {
    pub const fn new(cache: Arc<DedupCache>, pool: Arc<WorkerPool>) -> Self {
        Self { cache, pool }
    }

    /// Returns the shared issuance handle for `name`.
    pub fn request(&self, name: &str) -> Arc<PendingIssuance> {
        let swept = self.cache.sweep_expired();
        if swept > 0 {
            tracing::trace!("Swept {swept} expired cache entries");
        }

        let Lookup { handle, created } = self.cache.lookup_or_create(name);
        if !created {
            telemetry::increment_cache_hits();
            tracing::trace!(
                "{name:?} joins {} issuance",
                if handle.is_ready() { "a completed" } else { "an in-flight" }
            );
            return handle;
        }

        let cache = Arc::clone(&self.cache);
        let entry = Arc::clone(&handle);
        let subject = name.to_owned();
        let job = PoolJob::new(name, move |result| {
            if result.is_err() {
                cache.remove_if_same(&subject, &entry);
            }
            entry.complete(result);
        });

        // A refused job has already failed the handle through its sink.
        if let Err(err) = self.pool.submit(job) {
            tracing::debug!("Job for {name:?} refused: {err}");
        }
        handle
    }
}

use crate::server::cache::IssuanceResult;
use certforge_core::Error;

type Sink = Box<dyn FnOnce(IssuanceResult) + Send>;

/// A single issuance for one subject name plus the sink that receives its
/// outcome.
///
/// The sink is called exactly once. A job dropped without reporting (for
/// example when the pool is force-cancelled, or still queued when the
/// workers exit) reports [`Error::Cancelled`] so no waiter is left hanging.
pub struct PoolJob {
    subject: String,
    sink: Option<Sink>,
}

impl PoolJob {
    pub fn new<F>(subject: impl Into<String>, sink: F) -> Self
    where
        F: FnOnce(IssuanceResult) + Send + 'static,
    {
        Self {
            subject: subject.into(),
            sink: Some(Box::new(sink)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Reports `result` to the sink, consuming the job.
    pub fn finish(mut self, result: IssuanceResult) {
        if let Some(sink) = self.sink.take() {
            sink(result);
        }
    }
}

impl Drop for PoolJob {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            tracing::debug!("Job for {:?} dropped before completion", self.subject);
            sink(Err(Error::Cancelled));
        }
    }
}

impl core::fmt::Debug for PoolJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PoolJob")
            .field("subject", &self.subject)
            .field("reported", &self.sink.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certforge_core::IssuedPair;
    use std::sync::{Arc, Mutex};

    fn recording_job(subject: &str) -> (PoolJob, Arc<Mutex<Vec<IssuanceResult>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let job = PoolJob::new(subject, move |result| sink.lock().unwrap().push(result));
        (job, seen)
    }

    #[test]
    fn finish_reports_once() {
        let (job, seen) = recording_job("alice");
        assert_eq!(job.subject(), "alice");
        job.finish(Ok(IssuedPair::new("k", "c")));
        assert_eq!(*seen.lock().unwrap(), vec![Ok(IssuedPair::new("k", "c"))]);
    }

    #[test]
    fn dropped_job_reports_cancelled() {
        let (job, seen) = recording_job("bob");
        drop(job);
        assert_eq!(*seen.lock().unwrap(), vec![Err(Error::Cancelled)]);
    }
}

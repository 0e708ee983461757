use certforge_core::{IssuedPair, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of one issuance, shared by every requester of the subject.
pub type IssuanceResult = Result<IssuedPair>;

type Callback = Box<dyn FnOnce(Arc<IssuanceResult>) + Send>;

enum State {
    Waiting(Vec<Callback>),
    Ready(Arc<IssuanceResult>),
}

/// Handle to an issuance that may still be in flight.
///
/// The handle starts out pending. Connections attach completion callbacks
/// with [`on_complete`](Self::on_complete); the worker that finishes the job
/// calls [`complete`](Self::complete) exactly once, which fires every
/// callback with the same shared result. Once complete, the result is
/// immutable and late subscribers are called back immediately.
pub struct PendingIssuance {
    state: Mutex<State>,
}

impl PendingIssuance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Waiting(Vec::new())),
        })
    }

    /// Registers `callback` to run with the result.
    ///
    /// If the issuance already completed, the callback runs on the calling
    /// thread before this method returns. Otherwise it runs on whichever
    /// thread completes the issuance.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(Arc<IssuanceResult>) + Send + 'static,
    {
        let ready = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Waiting(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Ready(result) => Arc::clone(result),
            }
        };
        callback(ready);
    }

    /// Stores the result and notifies all waiters.
    ///
    /// Returns `false` if the issuance was already completed, in which case
    /// `result` is discarded. Callbacks run outside the internal lock.
    pub fn complete(&self, result: IssuanceResult) -> bool {
        let result = Arc::new(result);
        let callbacks = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Ready(Arc::clone(&result))) {
                State::Waiting(callbacks) => callbacks,
                State::Ready(previous) => {
                    *state = State::Ready(previous);
                    return false;
                }
            }
        };
        for callback in callbacks {
            callback(Arc::clone(&result));
        }
        true
    }

    /// The shared result, if the issuance has completed.
    pub fn result(&self) -> Option<Arc<IssuanceResult>> {
        match &*self.state.lock() {
            State::Ready(result) => Some(Arc::clone(result)),
            State::Waiting(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.result().is_some()
    }
}

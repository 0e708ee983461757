use crate::server::cache::IssuanceResult;
use mio::{Token, Waker};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A finished issuance addressed to one connection.
#[derive(Debug)]
pub struct Delivery {
    pub token: Token,
    pub result: Arc<IssuanceResult>,
}

/// Producer side of the worker-to-Reactor queue.
///
/// Completion callbacks run on worker threads; they never touch connection
/// state. Instead they enqueue a [`Delivery`] and wake the Reactor out of its
/// readiness wait.
#[derive(Clone)]
pub struct Handoff {
    tx: mpsc::UnboundedSender<Delivery>,
    waker: Arc<Waker>,
}

impl Handoff {
    pub fn new(waker: Arc<Waker>) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, waker }, rx)
    }

    /// Queues `result` for the connection behind `token` and wakes the
    /// Reactor. A closed queue means the Reactor has stopped; the result is
    /// dropped.
    pub fn deliver(&self, token: Token, result: Arc<IssuanceResult>) {
        if self.tx.send(Delivery { token, result }).is_err() {
            tracing::trace!("Reactor stopped, dropping delivery for {token:?}");
            return;
        }
        if let Err(err) = self.waker.wake() {
            tracing::warn!("Failed to wake reactor: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use certforge_core::{Error, IssuedPair};
    use mio::{Events, Poll};
    use std::time::Duration;

    #[test]
    fn delivery_wakes_the_poll() {
        let mut poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).unwrap());
        let (handoff, mut rx) = Handoff::new(waker);

        let producer = handoff.clone();
        std::thread::spawn(move || {
            producer.deliver(Token(7), Arc::new(Ok(IssuedPair::new("k", "c"))));
        })
        .join()
        .unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|e| e.token() == Token(1)));

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.token, Token(7));
        assert!(delivery.result.is_ok());
    }

    #[test]
    fn delivery_after_receiver_drop_is_ignored() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).unwrap());
        let (handoff, rx) = Handoff::new(waker);
        drop(rx);
        handoff.deliver(Token(2), Arc::new(Err(Error::Cancelled)));
    }
}

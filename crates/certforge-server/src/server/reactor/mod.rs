//! Single-threaded readiness loop.
//!
//! The [`Reactor`] owns the listening socket, every [`Connection`], and the
//! `mio` [`Poll`]. It is the only code that touches connection state. Worker
//! completions reach it through the [`Handoff`] queue, whose [`Waker`]
//! interrupts the readiness wait; the wait is also bounded by a timeout so
//! the queue is revisited even when no socket is ready.
//!
//! Connection tokens are allocated from a counter and never reused, so a
//! delivery for a connection that has since closed cannot reach a newer
//! connection and is simply discarded.

pub mod connection;
pub mod handoff;

pub use connection::{ConnState, Connection, ReadProgress};
pub use handoff::{Delivery, Handoff};

use crate::server::{service::IssuanceService, telemetry};
use certforge_core::protocol::Response;
use core::time::Duration;
use mio::{
    Events, Interest, Poll, Token, Waker,
    event::Event,
    net::TcpListener,
};
use std::collections::HashMap;
use std::io;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const EVENT_CAPACITY: usize = 1024;

pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    handoff: Handoff,
    service: IssuanceService,
    running: Arc<AtomicBool>,
    poll_timeout: Duration,
}

impl Reactor {
    /// Registers `listener` with a fresh poll instance.
    ///
    /// Returns the reactor together with the waker that interrupts its
    /// readiness wait; flip `running` to `false` and wake it to stop the loop.
    pub fn new(
        mut listener: TcpListener,
        service: IssuanceService,
        running: Arc<AtomicBool>,
        poll_timeout: Duration,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (handoff, deliveries) = Handoff::new(Arc::clone(&waker));

        let reactor = Self {
            poll,
            listener,
            connections: HashMap::new(),
            next_token: FIRST_CONNECTION,
            deliveries,
            handoff,
            service,
            running,
            poll_timeout,
        };
        Ok((reactor, waker))
    }

    /// Runs until the running flag is cleared.
    ///
    /// Per-connection failures are handled locally; only a failing readiness
    /// wait ends the loop with an error. The listener, the poll instance and
    /// any connections still open are closed when this returns.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        tracing::debug!("Reactor started");

        while self.running.load(Ordering::Acquire) {
            self.drain_deliveries();

            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("Readiness wait failed, reactor exiting: {e}");
                return Err(e);
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.on_event(token, event),
                }
            }

            self.drain_deliveries();
        }

        let open: Vec<Token> = self.connections.keys().copied().collect();
        tracing::info!("Reactor stopping, closing {} connections", open.len());
        for token in open {
            self.close(token);
        }
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    let mut conn = Connection::new(stream, peer);
                    if let Err(e) = conn.register(self.poll.registry(), token) {
                        tracing::warn!("Failed to register connection from {peer}: {e}");
                        continue;
                    }
                    tracing::trace!("Accepted {peer} as {token:?}");
                    telemetry::increment_connections_open();
                    self.connections.insert(token, conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn on_event(&mut self, token: Token, event: &Event) {
        let Some(state) = self.connections.get(&token).map(Connection::state) else {
            return;
        };
        match state {
            ConnState::Reading if event.is_readable() || event.is_read_closed() => {
                self.on_readable(token);
            }
            ConnState::Writing if event.is_writable() || event.is_error() => {
                self.on_writable(token);
            }
            _ => {}
        }
    }

    fn on_readable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let peer = conn.peer();

        match conn.read_request() {
            Ok(ReadProgress::Incomplete) => {}
            Ok(ReadProgress::Eof) => {
                tracing::trace!("{peer} closed before sending a request");
                self.close(token);
            }
            Ok(ReadProgress::Request(Ok(name))) => {
                telemetry::increment_requests();
                tracing::debug!("{peer} requested {name:?}");
                if let Err(e) = conn.await_generation(self.poll.registry(), name.clone()) {
                    tracing::debug!("Failed to park {peer}: {e}");
                    self.close(token);
                    return;
                }

                let handle = self.service.request(&name);
                let handoff = self.handoff.clone();
                // Runs on the completing worker, or right here if the result
                // is already cached.
                handle.on_complete(move |result| handoff.deliver(token, result));
            }
            Ok(ReadProgress::Request(Err(err))) => {
                telemetry::increment_protocol_errors();
                tracing::debug!("Rejecting request from {peer}: {err}");
                let frame = Response::from_error(&err).encode();
                if let Err(e) = conn.respond(self.poll.registry(), token, frame) {
                    tracing::debug!("Failed to respond to {peer}: {e}");
                    self.close(token);
                }
            }
            Err(e) => {
                tracing::debug!("Read from {peer} failed: {e}");
                self.close(token);
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        match conn.flush() {
            Ok(true) => {
                tracing::trace!("Response for {:?} sent to {}", conn.subject(), conn.peer());
                self.close(token);
            }
            Ok(false) => {}
            Err(e) => {
                tracing::debug!("Write to {} failed: {e}", conn.peer());
                self.close(token);
            }
        }
    }

    fn drain_deliveries(&mut self) {
        while let Ok(Delivery { token, result }) = self.deliveries.try_recv() {
            let Some(conn) = self.connections.get_mut(&token) else {
                tracing::trace!("Dropping delivery for closed connection {token:?}");
                continue;
            };
            let frame = Response::from(&*result).encode();
            if let Err(e) = conn.respond(self.poll.registry(), token, frame) {
                tracing::debug!("Failed to respond to {}: {e}", conn.peer());
                self.close(token);
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.close(self.poll.registry());
            telemetry::decrement_connections_open();
        }
    }
}

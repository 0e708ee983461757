//! Issuance server internals.
//!
//! ## Structure
//!
//! - [`reactor`] - the `mio` event loop that owns every socket.
//! - [`service`] - request glue between the cache and the pool.
//! - [`cache`] - the TTL- and capacity-bounded dedup cache.
//! - [`pool`] - worker pool and its monitor.
//! - [`issuer`] - key generation and certificate signing.
//! - [`config`], [`telemetry`], [`clock`] - ambient plumbing.

pub mod cache;
pub mod clock;
pub mod config;
pub mod issuer;
pub mod pool;
pub mod reactor;
pub mod service;
pub mod telemetry;

#[cfg(test)]
mod tests;

use anyhow::Context;
use cache::DedupCache;
use config::ServerConfig;
use core::time::Duration;
use issuer::SigningService;
use mio::Waker;
use pool::{PoolMonitor, PoolStats, ShutdownOutcome, WorkerPool};
use reactor::Reactor;
use service::IssuanceService;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running issuance server.
///
/// Created with [`start`](Self::start) from inside a tokio runtime; the
/// Reactor runs on its own OS thread while the worker pool and monitor run on
/// the runtime.
pub struct Server {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
    reactor: parking_lot::Mutex<Option<JoinHandle<io::Result<()>>>>,
    reactor_exited: CancellationToken,
    cache: Arc<DedupCache>,
    pool: Arc<WorkerPool>,
    monitor: PoolMonitor,
    shutdown_grace: Duration,
    shutdown: tokio::sync::Mutex<bool>,
}

impl Server {
    /// Binds the listener and starts the Reactor, the worker pool and the
    /// pool monitor.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the Reactor cannot be set up.
    pub fn start(config: &ServerConfig, authority: Arc<dyn SigningService>) -> anyhow::Result<Self> {
        let listener = mio::net::TcpListener::bind(config.bind_addr)
            .with_context(|| format!("failed to bind {}", config.bind_addr))?;
        let local_addr = listener.local_addr()?;

        let cache = Arc::new(DedupCache::new(config.cache_ttl, config.cache_capacity));
        let pool = Arc::new(WorkerPool::new(
            config.num_workers,
            authority,
            config.max_pending_jobs,
        ));
        let service = IssuanceService::new(Arc::clone(&cache), Arc::clone(&pool));

        let running = Arc::new(AtomicBool::new(true));
        let (reactor, waker) = Reactor::new(
            listener,
            service,
            Arc::clone(&running),
            config.poll_timeout,
        )
        .context("failed to set up the reactor")?;
        let reactor_exited = CancellationToken::new();
        let exited = reactor_exited.clone();
        let reactor = std::thread::Builder::new()
            .name("certforge-reactor".to_owned())
            .spawn(move || {
                let result = reactor.run();
                exited.cancel();
                result
            })
            .context("failed to spawn the reactor thread")?;

        let monitor = PoolMonitor::spawn(
            Arc::clone(&pool),
            config.monitor_interval,
            config.high_water,
        );

        Ok(Self {
            local_addr,
            running,
            waker,
            reactor: parking_lot::Mutex::new(Some(reactor)),
            reactor_exited,
            cache,
            pool,
            monitor,
            shutdown_grace: config.shutdown_grace,
            shutdown: tokio::sync::Mutex::new(false),
        })
    }

    /// The address the listener is bound to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Resolves once the Reactor thread has returned, whether because of
    /// [`shutdown`](Self::shutdown) or because its readiness wait failed.
    /// After that the server accepts and answers nothing.
    pub async fn reactor_stopped(&self) {
        self.reactor_exited.cancelled().await;
    }

    /// Number of names currently held by the dedup cache.
    pub fn cached_names(&self) -> usize {
        self.cache.len()
    }

    /// Stops the server:
    ///
    /// 1. clears the running flag and wakes the Reactor,
    /// 2. joins the Reactor thread, which closes the listener and the poll
    ///    instance,
    /// 3. stops the pool monitor,
    /// 4. drains the worker pool, cancelling what is left after the grace
    ///    period.
    ///
    /// Idempotent; concurrent callers wait for the first shutdown and then
    /// return [`ShutdownOutcome::AlreadyStopped`].
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let mut stopped = self.shutdown.lock().await;
        if *stopped {
            return ShutdownOutcome::AlreadyStopped;
        }

        // Step 1
        tracing::info!("Refusing new connections");
        self.stop_reactor();

        // Step 2
        let reactor = self.reactor.lock().take();
        if let Some(handle) = reactor {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(Ok(()))) => tracing::debug!("Reactor stopped, listener closed"),
                Ok(Ok(Err(e))) => tracing::error!("Reactor exited with error: {e}"),
                Ok(Err(_)) => tracing::error!("Reactor thread panicked"),
                Err(e) => tracing::error!("Failed to join the reactor thread: {e}"),
            }
        }

        // Step 3
        self.monitor.stop().await;

        // Step 4
        let outcome = self.pool.shutdown(self.shutdown_grace).await;
        *stopped = true;
        tracing::info!("Server stopped: {outcome:?}");
        outcome
    }

    fn stop_reactor(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.waker.wake() {
                // The poll timeout still bounds how long the loop takes to
                // notice the flag.
                tracing::warn!("Failed to wake the reactor: {e}");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_reactor();
    }
}

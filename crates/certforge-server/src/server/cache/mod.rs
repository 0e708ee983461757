//! Request-deduplication cache.
//!
//! Maps a subject name to an in-flight or completed issuance so that
//! concurrent requests for the same name share one generation job. Entries
//! expire lazily: the TTL is checked on lookup and expired entries are swept
//! opportunistically from the front of the insertion queue on every new
//! request. There is no background sweeper.
//!
//! The cache enforces its capacity bound by evicting the oldest completed
//! entries first. Pending entries are never evicted: a second request for a
//! name whose job is still running must join that job. The number of pending
//! entries is bounded by the worker pool's queue, so the map may only exceed
//! its capacity while more names than that are in flight.

mod pending;

pub use pending::{IssuanceResult, PendingIssuance};

use crate::server::clock::{MonotonicClock, TimeSource};
use core::time::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A cache slot: the shared handle plus its creation time.
struct CacheEntry {
    id: u64,
    handle: Arc<PendingIssuance>,
    created_at: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    // Insertion order; creation timestamps are monotonic so the front is
    // always the oldest. Items whose id no longer matches the live entry are
    // stale and skipped.
    order: VecDeque<(u64, String)>,
    next_id: u64,
}

impl Inner {
    fn compact_order(&mut self) {
        if self.order.len() > self.entries.len() * 2 + 16 {
            let entries = &self.entries;
            self.order
                .retain(|(id, name)| entries.get(name).is_some_and(|e| e.id == *id));
        }
    }
}

/// Result of [`DedupCache::lookup_or_create`].
pub struct Lookup {
    pub handle: Arc<PendingIssuance>,
    /// `true` if this call created the entry and the caller must submit the
    /// generation job.
    pub created: bool,
}

/// Thread-safe, TTL- and capacity-bounded map from subject name to issuance.
///
/// At most one live entry exists per name. A single lock guards the map so
/// the check-then-insert in [`lookup_or_create`](Self::lookup_or_create) is
/// atomic with respect to the Reactor and every worker thread.
pub struct DedupCache<C = MonotonicClock> {
    inner: Mutex<Inner>,
    ttl_ms: u64,
    capacity: usize,
    clock: C,
}

impl DedupCache<MonotonicClock> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self::with_clock(ttl, capacity, MonotonicClock::default())
    }
}

impl<C: TimeSource> DedupCache<C> {
    /// Creates a cache driven by `clock`. A `capacity` of zero is treated as
    /// one.
    pub fn with_clock(ttl: Duration, capacity: usize, clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            ttl_ms: ttl.as_millis() as u64,
            capacity: capacity.max(1),
            clock,
        }
    }

    fn is_expired(&self, created_at: u64, now: u64) -> bool {
        now.saturating_sub(created_at) > self.ttl_ms
    }

    /// Returns the live entry for `name`, or atomically creates a new pending
    /// one (replacing an expired entry).
    pub fn lookup_or_create(&self, name: &str) -> Lookup {
        let now = self.clock.current_millis();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(name) {
            if !self.is_expired(entry.created_at, now) {
                return Lookup {
                    handle: Arc::clone(&entry.handle),
                    created: false,
                };
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let handle = PendingIssuance::new();
        inner.entries.insert(
            name.to_owned(),
            CacheEntry {
                id,
                handle: Arc::clone(&handle),
                created_at: now,
            },
        );
        inner.order.push_back((id, name.to_owned()));

        let evicted = self.evict_overflow(&mut inner);
        if evicted > 0 {
            tracing::debug!("Evicted {evicted} cache entries over capacity {}", self.capacity);
        }
        inner.compact_order();

        Lookup {
            handle,
            created: true,
        }
    }

    fn evict_overflow(&self, inner: &mut Inner) -> usize {
        let mut evicted = 0;
        let mut in_flight = Vec::new();
        while inner.entries.len() > self.capacity {
            let Some((id, name)) = inner.order.pop_front() else {
                break;
            };
            match inner.entries.get(&name) {
                Some(entry) if entry.id == id && entry.handle.is_ready() => {
                    inner.entries.remove(&name);
                    evicted += 1;
                }
                Some(entry) if entry.id == id => in_flight.push((id, name)),
                _ => {}
            }
        }
        // Skipped pending entries keep their place at the front.
        for item in in_flight.into_iter().rev() {
            inner.order.push_front(item);
        }
        evicted
    }

    /// Removes expired entries from the front of the insertion queue.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.current_millis();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut removed = 0;

        while let Some((id, name)) = inner.order.front() {
            // `None` marks a stale queue item for a replaced or removed entry.
            let expired = match inner.entries.get(name) {
                Some(entry) if entry.id == *id => Some(self.is_expired(entry.created_at, now)),
                _ => None,
            };
            match expired {
                Some(false) => break,
                Some(true) => {
                    if let Some((_, name)) = inner.order.pop_front() {
                        inner.entries.remove(&name);
                        removed += 1;
                    }
                }
                None => {
                    inner.order.pop_front();
                }
            }
        }
        removed
    }

    /// Removes the entry for `name` only if it still holds `handle`.
    ///
    /// Used to drop failed issuances so the next request retries instead of
    /// replaying the failure for the rest of the TTL.
    pub fn remove_if_same(&self, name: &str, handle: &Arc<PendingIssuance>) -> bool {
        let mut inner = self.inner.lock();
        let same = inner
            .entries
            .get(name)
            .is_some_and(|e| Arc::ptr_eq(&e.handle, handle));
        if same {
            inner.entries.remove(name);
            inner.compact_order();
        }
        same
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

//! In-flight tracking for coalescing concurrent calls that share a cache key.

use crate::key::CacheKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, Shared, WeakShared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A computation every concurrent caller for the same key can await
pub(crate) type SharedComputation<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Marker for a running computation. It only holds a weak handle: once every caller awaiting
/// the computation is gone the future is dropped, and its [`MarkerGuard`] removes the marker.
pub(crate) struct InFlightCall<T, E> {
    pub id: u64,
    pub computation: WeakShared<BoxFuture<'static, Result<T, E>>>,
}

type InFlightMap<T, E> = DashMap<CacheKey, InFlightCall<T, E>>;

/// Result of trying to acquire a slot for a key.
pub(crate) enum Slot<T, E> {
    /// No computation was running; this caller registered a new one.
    Leader(SharedComputation<T, E>),
    /// Another caller is already computing the value and is still awaiting it.
    Follower(SharedComputation<T, E>),
}

impl<T, E> Slot<T, E> {
    pub fn into_computation(self) -> SharedComputation<T, E> {
        match self {
            Slot::Leader(computation) | Slot::Follower(computation) => computation,
        }
    }
}

/// Map of in-flight computations keyed by cache key.
///
/// Markers are tagged with a unique id so that a finishing computation only ever
/// removes its own marker, never one registered after an invalidation.
pub(crate) struct Singleflight<T, E> {
    calls: Arc<InFlightMap<T, E>>,
    next_id: AtomicU64,
}

impl<T, E> Singleflight<T, E>
where
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Atomically join the computation running for `key`, or register the one built by `start`.
    ///
    /// A marker whose computation was abandoned by all of its callers is replaced. `start`
    /// receives the id of the new marker and runs while the shard lock is held, so it must
    /// only assemble the future, not poll it.
    pub fn acquire<S>(&self, key: CacheKey, start: S) -> Slot<T, E>
    where
        S: FnOnce(u64) -> SharedComputation<T, E>,
    {
        match self.calls.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Some(computation) = entry.get().computation.upgrade() {
                    return Slot::Follower(computation);
                }
                let (call, computation) = self.register(start);
                if let Some(call) = call {
                    entry.insert(call);
                } else {
                    entry.remove();
                }
                Slot::Leader(computation)
            }
            Entry::Vacant(entry) => {
                let (call, computation) = self.register(start);
                if let Some(call) = call {
                    entry.insert(call);
                }
                Slot::Leader(computation)
            }
        }
    }

    fn register<S>(&self, start: S) -> (Option<InFlightCall<T, E>>, SharedComputation<T, E>)
    where
        S: FnOnce(u64) -> SharedComputation<T, E>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let computation = start(id);
        // A computation that already finished has nothing left to join
        let call = computation
            .downgrade()
            .map(|computation| InFlightCall { id, computation });
        (call, computation)
    }

    /// Handle used by a running computation to retire its own marker
    pub fn downgrade(&self) -> Weak<InFlightMap<T, E>> {
        Arc::downgrade(&self.calls)
    }

    /// Drop the marker for `key`; the computation keeps running for whoever awaits it
    pub fn forget(&self, key: &CacheKey) -> bool {
        self.calls.remove(key).is_some()
    }

    pub fn forget_all(&self) {
        self.calls.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

/// Remove the marker `id` for `key` if it is still registered, running `on_retired` while the
/// marker's shard lock is held. Returns false when the marker was already invalidated.
fn retire<T, E, F>(
    calls: &InFlightMap<T, E>,
    key: &CacheKey,
    id: u64,
    on_retired: F,
) -> bool
where
    F: FnOnce(),
{
    match calls.entry(key.clone()) {
        Entry::Occupied(entry) if entry.get().id == id => {
            on_retired();
            entry.remove();
            true
        }
        _ => false,
    }
}

/// Owned by a running computation. Retires the computation's marker when it finishes, or
/// removes it when the computation is dropped before finishing (every caller went away, or
/// the wrapped function panicked).
pub(crate) struct MarkerGuard<T, E> {
    calls: Weak<InFlightMap<T, E>>,
    key: CacheKey,
    id: u64,
    completed: bool,
}

impl<T, E> MarkerGuard<T, E> {
    pub fn new(calls: Weak<InFlightMap<T, E>>, key: CacheKey, id: u64) -> Self {
        Self {
            calls,
            key,
            id,
            completed: false,
        }
    }

    /// Retire the marker, running `on_retired` under its shard lock. Returns false when the
    /// marker was invalidated while the computation ran.
    pub fn complete<F>(mut self, on_retired: F) -> bool
    where
        F: FnOnce(),
    {
        self.completed = true;
        match self.calls.upgrade() {
            Some(calls) => retire(&calls, &self.key, self.id, on_retired),
            None => false,
        }
    }
}

impl<T, E> Drop for MarkerGuard<T, E> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(calls) = self.calls.upgrade() {
            calls.remove_if(&self.key, |_, call| call.id == self.id);
        }
    }
}

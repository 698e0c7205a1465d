//! Memoizing wrapper around a (possibly asynchronous) function.
//!
//! A [`Memoized`] handle owns one cache. Results are keyed by the canonical serialization of
//! the call arguments (see [`CacheKey::derive`]) and are reused until they are older than the
//! configured ttl. Expiry is checked lazily on lookup; [`Memoized::purge_expired`] and
//! [`Memoized::spawn_sweeper`] reclaim stale entries without changing what lookups observe.
//!
//! Failures are never cached: an error from the wrapped function reaches the caller unchanged
//! and the next call with the same arguments runs the function again.

use crate::domain::CacheEntry;
use crate::key::CacheKey;
use crate::singleflight::{MarkerGuard, SharedComputation, Singleflight, Slot};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use shared::TtlMinutes;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

type ComputeFn<A, T, E> = dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync;

/// How calls for the same key that overlap in time are handled
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConcurrentCalls {
    /// Later callers await the computation already in flight
    #[default]
    Coalesce,
    /// Every caller runs the function and writes its own entry; the last write wins
    Independent,
}

#[derive(Clone, Debug, Default)]
pub struct MemoizeConfig {
    pub ttl: Option<TtlMinutes>,
    pub concurrent_calls: ConcurrentCalls,
}

impl MemoizeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: TtlMinutes) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the ttl, rejecting non-finite or non-positive values
    pub fn with_ttl_minutes(self, minutes: f64) -> shared::Result<Self> {
        Ok(self.with_ttl(TtlMinutes::new(minutes)?))
    }

    pub fn with_concurrent_calls(mut self, concurrent_calls: ConcurrentCalls) -> Self {
        self.concurrent_calls = concurrent_calls;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError<E> {
    /// The wrapped function failed; the error is passed through untouched
    #[error(transparent)]
    Computation(E),
    #[error(transparent)]
    Key(#[from] shared::Error),
}

impl<E> InvokeError<E> {
    pub fn into_computation(self) -> Option<E> {
        match self {
            InvokeError::Computation(e) => Some(e),
            InvokeError::Key(_) => None,
        }
    }
}

struct Inner<A, T, E> {
    compute: Arc<ComputeFn<A, T, E>>,
    ttl: Option<TtlMinutes>,
    concurrent_calls: ConcurrentCalls,
    entries: Arc<DashMap<CacheKey, CacheEntry<T>>>,
    in_flight: Singleflight<T, E>,
    _args: PhantomData<fn(A)>,
}

/// A function wrapped with a time-bounded result cache
pub struct Memoized<A, T, E> {
    inner: Arc<Inner<A, T, E>>,
}

impl<A, T, E> Clone for Memoized<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A, T, E> Debug for Memoized<A, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoized")
            .field("ttl", &self.inner.ttl)
            .field("concurrent_calls", &self.inner.concurrent_calls)
            .field("entries", &self.inner.entries.len())
            .finish()
    }
}

/// Wrap `f` with a cache whose entries live for `ttl_minutes`, or forever when `None`
pub fn memoize<A, T, E, F, Fut>(f: F, ttl_minutes: Option<f64>) -> shared::Result<Memoized<A, T, E>>
where
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let config = match ttl_minutes {
        Some(minutes) => MemoizeConfig::new().with_ttl_minutes(minutes)?,
        None => MemoizeConfig::new(),
    };
    Ok(Memoized::new(f, config))
}

impl<A, T, E> Memoized<A, T, E>
where
    A: Serialize + Send + 'static,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(f: F, config: MemoizeConfig) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let compute: Arc<ComputeFn<A, T, E>> = Arc::new(move |args| f(args).boxed());

        Self {
            inner: Arc::new(Inner {
                compute,
                ttl: config.ttl,
                concurrent_calls: config.concurrent_calls,
                entries: Arc::new(DashMap::new()),
                in_flight: Singleflight::new(),
                _args: PhantomData,
            }),
        }
    }

    /// Wrap a synchronous function. It runs when the call is awaited, never under a cache lock.
    pub fn from_sync<F>(f: F, config: MemoizeConfig) -> Self
    where
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(
            move |args: A| {
                let f = Arc::clone(&f);
                async move { f(args) }
            },
            config,
        )
    }

    /// Return the cached value for `args` or compute, store and return it
    pub async fn invoke(&self, args: A) -> Result<T, InvokeError<E>> {
        let key = CacheKey::derive(&args)?;

        if let Some(value) = self.fresh_value(&key) {
            tracing::debug!("Cache hit for key {}", key);
            return Ok(value);
        }

        match self.inner.concurrent_calls {
            ConcurrentCalls::Independent => {
                tracing::debug!("Cache miss for key {}, computing", key);
                let value = (self.inner.compute)(args)
                    .await
                    .map_err(InvokeError::Computation)?;
                self.inner
                    .entries
                    .insert(key, CacheEntry::new(value.clone()));
                Ok(value)
            }
            ConcurrentCalls::Coalesce => {
                let slot = self
                    .inner
                    .in_flight
                    .acquire(key.clone(), |id| self.start(key.clone(), id, args));

                match &slot {
                    Slot::Leader(_) => tracing::debug!("Cache miss for key {}, computing", key),
                    Slot::Follower(_) => {
                        tracing::debug!("Joining in-flight computation for key {}", key)
                    }
                }

                slot.into_computation()
                    .await
                    .map_err(InvokeError::Computation)
            }
        }
    }

    /// Build the shared computation for `key`. On success the entry is written while the
    /// in-flight marker is retired, unless the key was invalidated in the meantime. If every
    /// caller stops awaiting before it finishes, the computation is dropped with its marker
    /// and the next call for `key` starts over.
    fn start(&self, key: CacheKey, id: u64, args: A) -> SharedComputation<T, E> {
        let compute = Arc::clone(&self.inner.compute);
        let entries = Arc::clone(&self.inner.entries);
        let marker = MarkerGuard::new(self.inner.in_flight.downgrade(), key.clone(), id);

        async move {
            let outcome = compute(args).await;

            let retired = marker.complete(|| {
                if let Ok(value) = &outcome {
                    entries.insert(key.clone(), CacheEntry::new(value.clone()));
                }
            });
            if !retired {
                tracing::debug!("Key {} was invalidated while computing, not caching", key);
            }

            outcome
        }
        .boxed()
        .shared()
    }

    fn fresh_value(&self, key: &CacheKey) -> Option<T> {
        let now = Instant::now();
        let entry = self.inner.entries.get(key)?;

        if entry.is_expired(self.ttl_duration(), now) {
            tracing::debug!(
                "Entry for key {} expired after {:?}",
                key,
                entry.age(now)
            );
            return None;
        }

        Some(entry.value.clone())
    }

    /// Remove the entry for `args`. Returns whether an entry or in-flight computation existed.
    pub fn delete_entry(&self, args: &A) -> shared::Result<bool> {
        let key = CacheKey::derive(args)?;
        let removed = self.inner.entries.remove(&key).is_some();
        let forgotten = self.inner.in_flight.forget(&key);

        if removed || forgotten {
            tracing::debug!("Deleted entry for key {}", key);
        }
        Ok(removed || forgotten)
    }

    /// Remove every entry and forget every in-flight computation
    pub fn clear(&self) {
        self.inner.entries.clear();
        self.inner.in_flight.forget_all();
        tracing::debug!("Cleared memoized entries");
    }

    /// Whether a fresh entry exists for `args`, without computing anything
    pub fn contains(&self, args: &A) -> shared::Result<bool> {
        let key = CacheKey::derive(args)?;
        Ok(self.fresh_value(&key).is_some())
    }

    /// Number of stored entries, stale ones included
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn ttl(&self) -> Option<TtlMinutes> {
        self.inner.ttl
    }

    pub fn concurrent_calls(&self) -> ConcurrentCalls {
        self.inner.concurrent_calls
    }

    fn ttl_duration(&self) -> Option<Duration> {
        self.inner.ttl.map(|ttl| ttl.as_duration())
    }

    /// Drop every stale entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        purge(&self.inner.entries, self.ttl_duration())
    }

    /// Spawn a task purging stale entries every `period`.
    ///
    /// The task only holds a weak reference to the cache and stops once every handle to this
    /// wrapper has been dropped. Without a ttl there is nothing to purge and the task exits
    /// immediately.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let entries: Weak<DashMap<CacheKey, CacheEntry<T>>> = Arc::downgrade(&self.inner.entries);
        let ttl = self.ttl_duration();

        tokio::spawn(async move {
            let Some(ttl) = ttl else {
                tracing::debug!("No ttl configured, sweeper not started");
                return;
            };

            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(entries) = entries.upgrade() else {
                    tracing::debug!("Memoized cache dropped, stopping sweeper");
                    break;
                };

                let removed = purge(&entries, Some(ttl));
                if removed > 0 {
                    tracing::debug!("Sweeper purged {} stale entries", removed);
                }
            }
        })
    }
}

fn purge<T>(entries: &DashMap<CacheKey, CacheEntry<T>>, ttl: Option<Duration>) -> usize {
    if ttl.is_none() {
        return 0;
    }

    let now = Instant::now();
    let mut removed = 0;
    entries.retain(|_, entry| {
        let keep = !entry.is_expired(ttl, now);
        if !keep {
            removed += 1;
        }
        keep
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{advance, sleep};

    fn counting_square(
        calls: Arc<AtomicUsize>,
        config: MemoizeConfig,
    ) -> Memoized<u64, u64, String> {
        Memoized::new(
            move |n: u64| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(n * n)
                }
            },
            config,
        )
    }

    fn slow_square(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        config: MemoizeConfig,
    ) -> Memoized<u64, u64, String> {
        Memoized::new(
            move |n: u64| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    sleep(delay).await;
                    Ok(n * n)
                }
            },
            config,
        )
    }

    fn one_minute() -> MemoizeConfig {
        MemoizeConfig::new().with_ttl_minutes(1.0).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_does_not_recompute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), one_minute());

        assert_eq!(memo.invoke(7).await.unwrap(), 49);
        advance(Duration::from_secs(30)).await;
        assert_eq!(memo.invoke(7).await.unwrap(), 49);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_triggers_recomputation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), one_minute());

        memo.invoke(3).await.unwrap();
        advance(Duration::from_secs(61)).await;
        memo.invoke(3).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Recomputation replaces the stale entry rather than adding one
        assert_eq!(memo.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_at_exact_ttl_is_still_fresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), one_minute());

        memo.invoke(3).await.unwrap();
        advance(Duration::from_secs(60)).await;
        memo.invoke(3).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ttl_never_expires() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), MemoizeConfig::new());

        memo.invoke(5).await.unwrap();
        advance(Duration::from_millis(1_000_000_000)).await;
        memo.invoke(5).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.purge_expired(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        for mode in [ConcurrentCalls::Coalesce, ConcurrentCalls::Independent] {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = calls.clone();
            let memo: Memoized<u64, u64, String> = Memoized::new(
                move |n: u64| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(format!("attempt {attempt} failed"))
                        } else {
                            Ok(n + 1)
                        }
                    }
                },
                MemoizeConfig::new().with_concurrent_calls(mode),
            );

            let first = memo.invoke(1).await;
            assert!(
                matches!(first, Err(InvokeError::Computation(ref e)) if e == "attempt 0 failed")
            );
            assert!(memo.is_empty());

            assert_eq!(memo.invoke(1).await.unwrap(), 2);
            assert_eq!(calls.load(Ordering::SeqCst), 2, "mode {mode:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recompute_leaves_stale_entry_in_place() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<u64, u64, String> = Memoized::new(
            move |n: u64| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Ok(n)
                    } else {
                        Err("down".to_string())
                    }
                }
            },
            one_minute(),
        );

        memo.invoke(9).await.unwrap();
        advance(Duration::from_secs(61)).await;

        assert!(memo.invoke(9).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The stale entry is neither refreshed nor removed by the failed call
        assert_eq!(memo.len(), 1);
        assert!(!memo.contains(&9).unwrap());
    }

    #[tokio::test]
    async fn test_delete_entry_is_scoped_to_its_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), MemoizeConfig::new());

        memo.invoke(1).await.unwrap();
        memo.invoke(2).await.unwrap();

        assert!(memo.delete_entry(&1).unwrap());
        assert!(!memo.contains(&1).unwrap());
        assert!(memo.contains(&2).unwrap());

        memo.invoke(2).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        memo.invoke(1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_entry_is_noop() {
        let memo = counting_square(Arc::new(AtomicUsize::new(0)), MemoizeConfig::new());
        assert!(!memo.delete_entry(&42).unwrap());
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = counting_square(calls.clone(), MemoizeConfig::new());

        for n in 0..5 {
            memo.invoke(n).await.unwrap();
        }
        assert_eq!(memo.len(), 5);

        memo.clear();
        assert!(memo.is_empty());

        memo.invoke(0).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_zero_argument_calls_share_one_slot() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<(), &'static str, String> = Memoized::new(
            move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok("config") }
            },
            MemoizeConfig::new(),
        );

        assert_eq!(memo.invoke(()).await.unwrap(), "config");
        assert_eq!(memo.invoke(()).await.unwrap(), "config");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(memo.delete_entry(&()).unwrap());
        memo.invoke(()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_structurally_equal_args_hit_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<HashMap<String, u32>, u32, String> = Memoized::from_sync(
            move |args: HashMap<String, u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args.values().sum())
            },
            MemoizeConfig::new(),
        );

        let mut first = HashMap::new();
        first.insert("a".to_string(), 1);
        first.insert("b".to_string(), 2);
        let mut second = HashMap::new();
        second.insert("b".to_string(), 2);
        second.insert("a".to_string(), 1);

        assert_eq!(memo.invoke(first).await.unwrap(), 3);
        assert_eq!(memo.invoke(second).await.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unserializable_args_fail_fast() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<HashMap<Vec<u8>, u8>, usize, String> = Memoized::from_sync(
            move |args: HashMap<Vec<u8>, u8>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(args.len())
            },
            MemoizeConfig::new(),
        );

        let mut args = HashMap::new();
        args.insert(vec![1], 1);

        let result = memo.invoke(args).await;
        assert!(matches!(result, Err(InvokeError::Key(shared::Error::KeyDerivation(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_finite_float_args_are_never_keyed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<f64, String, String> = Memoized::from_sync(
            move |x: f64| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(format!("{x}"))
            },
            MemoizeConfig::new(),
        );

        for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = memo.invoke(x).await;
            assert!(
                matches!(result, Err(InvokeError::Key(shared::Error::KeyDerivation(_)))),
                "{x} was keyed"
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(memo.is_empty());

        assert_eq!(memo.invoke(2.5).await.unwrap(), "2.5");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_and_some_unit_do_not_share_an_entry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<Option<()>, u32, String> = Memoized::from_sync(
            move |arg: Option<()>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(u32::from(arg.is_some()))
            },
            MemoizeConfig::new(),
        );

        assert_eq!(memo.invoke(None).await.unwrap(), 0);
        let result = memo.invoke(Some(())).await;
        assert!(matches!(result, Err(InvokeError::Key(shared::Error::KeyDerivation(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(memo.contains(&None).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_are_coalesced() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = slow_square(calls.clone(), Duration::from_millis(100), MemoizeConfig::new());

        let (a, b, c) = tokio::join!(memo.invoke(4), memo.invoke(4), memo.invoke(4));

        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (16, 16, 16));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.len(), 1);
        assert_eq!(memo.inner.in_flight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_calls_each_compute() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = slow_square(
            calls.clone(),
            Duration::from_millis(100),
            MemoizeConfig::new().with_concurrent_calls(ConcurrentCalls::Independent),
        );

        let (a, b) = tokio::join!(memo.invoke(4), memo.invoke(4));

        assert_eq!((a.unwrap(), b.unwrap()), (16, 16));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(memo.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesced_failure_reaches_every_waiter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<u64, u64, String> = Memoized::new(
            move |_n: u64| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    sleep(Duration::from_millis(50)).await;
                    Err("unavailable".to_string())
                }
            },
            MemoizeConfig::new(),
        );

        let (a, b) = tokio::join!(memo.invoke(1), memo.invoke(1));

        assert_eq!(a.unwrap_err().into_computation().unwrap(), "unavailable");
        assert_eq!(b.unwrap_err().into_computation().unwrap(), "unavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(memo.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_computation_discards_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = slow_square(calls.clone(), Duration::from_millis(100), MemoizeConfig::new());

        let invalidate = async {
            sleep(Duration::from_millis(10)).await;
            assert!(memo.delete_entry(&2).unwrap());
        };
        let (value, ()) = tokio::join!(memo.invoke(2), invalidate);

        assert_eq!(value.unwrap(), 4);
        assert!(!memo.contains(&2).unwrap());
        assert_eq!(memo.inner.in_flight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_caller_does_not_leave_computation_behind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = slow_square(calls.clone(), Duration::from_millis(100), one_minute());

        let cancelled = tokio::time::timeout(Duration::from_millis(10), memo.invoke(5)).await;
        assert!(cancelled.is_err());
        assert_eq!(memo.inner.in_flight.len(), 0);
        assert!(memo.is_empty());

        // Long past the ttl a new call computes afresh instead of resuming the abandoned one
        sleep(Duration::from_secs(600)).await;
        assert_eq!(memo.invoke(5).await.unwrap(), 25);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(memo.contains(&5).unwrap());
        assert_eq!(memo.inner.in_flight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_caller_keeps_computation_alive_after_leader_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let memo = slow_square(calls.clone(), Duration::from_millis(100), one_minute());

        let leader = tokio::time::timeout(Duration::from_millis(10), memo.invoke(6));
        let (leader, follower) = tokio::join!(leader, memo.invoke(6));

        assert!(leader.is_err());
        assert_eq!(follower.unwrap(), 36);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(memo.contains(&6).unwrap());
        assert_eq!(memo.inner.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn test_panicking_computation_releases_its_key() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let memo: Memoized<u64, u64, String> = Memoized::new(
            move |n: u64| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        panic!("upstream exploded");
                    }
                    Ok(n * 10)
                }
            },
            MemoizeConfig::new(),
        );

        let first = tokio::spawn({
            let memo = memo.clone();
            async move { memo.invoke(1).await }
        })
        .await;
        assert!(first.unwrap_err().is_panic());
        assert_eq!(memo.inner.in_flight.len(), 0);

        assert_eq!(memo.invoke(1).await.unwrap(), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_removes_only_stale_entries() {
        let memo = counting_square(Arc::new(AtomicUsize::new(0)), one_minute());

        memo.invoke(1).await.unwrap();
        advance(Duration::from_secs(45)).await;
        memo.invoke(2).await.unwrap();
        advance(Duration::from_secs(30)).await;

        assert_eq!(memo.purge_expired(), 1);
        assert!(!memo.contains(&1).unwrap());
        assert!(memo.contains(&2).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_and_stops_when_dropped() {
        let memo = counting_square(Arc::new(AtomicUsize::new(0)), one_minute());
        memo.invoke(1).await.unwrap();

        let sweeper = memo.spawn_sweeper(Duration::from_secs(60));

        sleep(Duration::from_secs(121)).await;
        assert!(memo.is_empty());

        drop(memo);
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_without_ttl_exits() {
        let memo = counting_square(Arc::new(AtomicUsize::new(0)), MemoizeConfig::new());
        memo.spawn_sweeper(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_memoize_validates_ttl() {
        let result = memoize(|n: u32| async move { Ok::<_, String>(n) }, Some(-5.0));
        assert!(matches!(result, Err(shared::Error::InvalidTtl(_))));

        let memo = memoize(|n: u32| async move { Ok::<_, String>(n) }, Some(2.0)).unwrap();
        assert_eq!(memo.ttl().unwrap().minutes(), 2.0);
        assert_eq!(memo.concurrent_calls(), ConcurrentCalls::Coalesce);
        assert_eq!(memo.invoke(8).await.unwrap(), 8);
    }
}

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// A memoized result together with the instant it was computed
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    pub value: T,
    pub timestamp: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            timestamp: Instant::now(),
        }
    }

    /// An entry is stale once its age strictly exceeds the ttl. Without a ttl it never is.
    pub fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        ttl.is_some_and(|ttl| now.saturating_duration_since(self.timestamp) > ttl)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }
}

/// Outcome of a batch: settled values and failure reasons, each in window order
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchResult<T, E> {
    pub resolved: Vec<T>,
    pub rejected: Vec<E>,
}

impl<T, E> BatchResult<T, E> {
    pub fn new() -> Self {
        Self {
            resolved: Vec::new(),
            rejected: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, outcome: std::result::Result<T, E>) {
        match outcome {
            Ok(value) => self.resolved.push(value),
            Err(reason) => self.rejected.push(reason),
        }
    }

    /// Total number of settled operations
    pub fn len(&self) -> usize {
        self.resolved.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.rejected.is_empty()
    }

    pub fn all_resolved(&self) -> bool {
        self.rejected.is_empty()
    }

    pub fn into_parts(self) -> (Vec<T>, Vec<E>) {
        (self.resolved, self.rejected)
    }
}

impl<T, E> Default for BatchResult<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

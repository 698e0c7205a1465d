//! Async building blocks: a time-bounded memoizing cache and a chunked batch executor.
//!
//! ```rust,ignore
//! use stash::{memoize, run_deferred};
//!
//! let lookup = memoize(|id: u32| async move { fetch_user(id).await }, Some(5.0))?;
//! let user = lookup.invoke(7).await?;
//!
//! let factories = ids.into_iter().map(|id| {
//!     let lookup = lookup.clone();
//!     move || async move { lookup.invoke(id).await }
//! });
//! let result = run_deferred(factories, 4).await;
//! ```

pub mod batch;
pub mod domain;
pub mod key;
pub mod memoize;
mod singleflight;

pub use batch::{run_batched, run_deferred};
pub use domain::{BatchResult, CacheEntry};
pub use key::CacheKey;
pub use memoize::{ConcurrentCalls, InvokeError, MemoizeConfig, Memoized, memoize};
pub use shared::{ChunkSize, Error, Result, TtlMinutes};

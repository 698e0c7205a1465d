// shared/src/lib.rs

use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("invalid ttl: {0}")]
    InvalidTtl(String),
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(i64),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-to-live of a memoized entry, expressed in (possibly fractional) minutes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TtlMinutes(f64);

impl TtlMinutes {
    /// Validates that `minutes` is finite, positive and representable as a `Duration`
    pub fn new(minutes: f64) -> Result<Self> {
        if !minutes.is_finite() || minutes <= 0.0 {
            return Err(Error::InvalidTtl(format!(
                "expected a positive number of minutes, got {minutes}"
            )));
        }
        Duration::try_from_secs_f64(minutes * 60.0)
            .map_err(|e| Error::InvalidTtl(format!("{minutes} minutes: {e}")))?;
        Ok(Self(minutes))
    }

    pub fn minutes(&self) -> f64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        // Range was checked in `new`
        Duration::from_secs_f64(self.0 * 60.0)
    }
}

impl TryFrom<f64> for TtlMinutes {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

/// Number of operations awaited together by the batch executor. Zero means a single window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkSize(usize);

impl ChunkSize {
    pub const UNBOUNDED: ChunkSize = ChunkSize(0);

    pub fn new(size: usize) -> Self {
        Self(size)
    }

    pub fn get(&self) -> usize {
        self.0
    }

    /// Effective window length for an input of `len` operations
    pub fn window_len(&self, len: usize) -> usize {
        if self.0 == 0 || self.0 >= len {
            len
        } else {
            self.0
        }
    }
}

impl From<usize> for ChunkSize {
    fn from(size: usize) -> Self {
        Self(size)
    }
}

impl TryFrom<i64> for ChunkSize {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        usize::try_from(value)
            .map(Self)
            .map_err(|_| Error::InvalidChunkSize(value))
    }
}

pub mod config;

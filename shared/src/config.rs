use crate::{ChunkSize, Error, Result, TtlMinutes};
use std::time::Duration;
use tracing::warn;

pub struct Config {
    pub ttl: Option<TtlMinutes>,
    pub chunk_size: ChunkSize,
    pub sweep_interval: Option<Duration>,
    pub coalesce: bool,
}

impl Config {
    const DEFAULT_CHUNK_SIZE: usize = 2;

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ttl = match lookup("STASH_TTL_MINUTES") {
            Some(raw) => {
                let minutes = raw.trim().parse::<f64>().map_err(|_| {
                    Error::Config(format!("STASH_TTL_MINUTES is not a number: '{raw}'"))
                })?;
                Some(TtlMinutes::new(minutes)?)
            }
            None => {
                warn!("STASH_TTL_MINUTES not set, memoized entries never expire");
                None
            }
        };

        let chunk_size = match lookup("STASH_CHUNK_SIZE") {
            Some(raw) => {
                let size = raw.trim().parse::<i64>().map_err(|_| {
                    Error::Config(format!("STASH_CHUNK_SIZE is not an integer: '{raw}'"))
                })?;
                ChunkSize::try_from(size)?
            }
            None => ChunkSize::new(Self::DEFAULT_CHUNK_SIZE),
        };

        let sweep_interval = match lookup("STASH_SWEEP_INTERVAL_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                _ => {
                    return Err(Error::Config(format!(
                        "STASH_SWEEP_INTERVAL_SECS must be a positive integer, got '{raw}'"
                    )));
                }
            },
            None => None,
        };

        let coalesce = match lookup("STASH_COALESCE") {
            Some(raw) => raw.trim().parse::<bool>().map_err(|_| {
                Error::Config(format!("STASH_COALESCE must be true or false, got '{raw}'"))
            })?,
            None => true,
        };

        Ok(Self {
            ttl,
            chunk_size,
            sweep_interval,
            coalesce,
        })
    }
}

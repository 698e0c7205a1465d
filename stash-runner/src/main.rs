use serde::Serialize;
use shared::config::Config;
use stash::{ChunkSize, ConcurrentCalls, MemoizeConfig, Memoized, run_deferred};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Simulated upstream request: (id, latency in ms, whether it fails)
const REQUESTS: [(u32, u64, bool); 4] = [
    (1, 1000, false),
    (2, 2000, true),
    (3, 1500, false),
    (4, 3000, true),
];

#[derive(Clone, Debug, PartialEq, Serialize)]
struct Quote {
    id: u32,
    latency_ms: u64,
}

#[derive(Debug, Serialize)]
struct PassReport {
    pass: usize,
    chunk_size: usize,
    elapsed_ms: u64,
    cached_entries: usize,
    resolved: Vec<Quote>,
    rejected: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting stash runner");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = Config::from_env()?;

    let mut memo_config = MemoizeConfig::new().with_concurrent_calls(if config.coalesce {
        ConcurrentCalls::Coalesce
    } else {
        ConcurrentCalls::Independent
    });
    if let Some(ttl) = config.ttl {
        memo_config = memo_config.with_ttl(ttl);
    }

    let quotes = quote_service(memo_config);
    info!("Memoized quote service ready: {:?}", quotes);

    let sweeper = match config.sweep_interval {
        Some(period) if quotes.ttl().is_some() => {
            info!("Sweeping stale entries every {:?}", period);
            Some(quotes.spawn_sweeper(period))
        }
        Some(_) => {
            warn!("STASH_SWEEP_INTERVAL_SECS ignored because no ttl is configured");
            None
        }
        None => None,
    };

    // Second pass shows which results were served from the cache
    for pass in 1..=2 {
        let report = run_pass(&quotes, config.chunk_size, pass).await;
        info!(
            "Pass {} finished in {} ms: {} resolved, {} rejected",
            report.pass,
            report.elapsed_ms,
            report.resolved.len(),
            report.rejected.len()
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if let Some(handle) = sweeper {
        handle.abort();
    }

    info!("stash runner finished");
    Ok(())
}

fn quote_service(config: MemoizeConfig) -> Memoized<u32, Quote, String> {
    Memoized::new(
        |id: u32| async move {
            let Some(&(_, latency_ms, fails)) = REQUESTS.iter().find(|(rid, _, _)| *rid == id)
            else {
                return Err(format!("unknown quote {id}"));
            };

            sleep(Duration::from_millis(latency_ms)).await;

            if fails {
                Err(format!("quote {id} rejected after {latency_ms}ms"))
            } else {
                Ok(Quote { id, latency_ms })
            }
        },
        config,
    )
}

async fn run_pass(
    quotes: &Memoized<u32, Quote, String>,
    chunk_size: ChunkSize,
    pass: usize,
) -> PassReport {
    let factories = REQUESTS.iter().map(|&(id, _, _)| {
        let quotes = quotes.clone();
        move || async move {
            quotes.invoke(id).await.map_err(|e| match e {
                stash::InvokeError::Computation(reason) => reason,
                stash::InvokeError::Key(err) => err.to_string(),
            })
        }
    });

    let started = Instant::now();
    let result = run_deferred(factories, chunk_size).await;
    let (resolved, rejected) = result.into_parts();

    PassReport {
        pass,
        chunk_size: chunk_size.get(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        cached_entries: quotes.len(),
        resolved,
        rejected,
    }
}

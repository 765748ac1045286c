use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;

use crate::logging;
use crate::quote::{normalize_ticker, InvalidTicker, Quote};

use super::cache::CacheEntry;
use super::context::QuoteContext;
use super::metrics::MetricsEvent;

/// A quote as served to request/response callers. `stale` is set when the
/// most recent refresh attempt failed and this is the last good value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub quote: Quote,
    pub stale: bool,
}

impl From<CacheEntry> for Snapshot {
    fn from(entry: CacheEntry) -> Self {
        Self {
            quote: entry.quote,
            stale: entry.stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SnapshotError {
    #[error("no quote available for {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidTicker(#[from] InvalidTicker),
}

/// Point lookups that never create a subscription.
pub struct SnapshotReader {
    ctx: Arc<QuoteContext>,
}

impl SnapshotReader {
    pub fn new(ctx: Arc<QuoteContext>) -> Self {
        Self { ctx }
    }

    pub async fn read(&self, ticker: &str) -> Result<Snapshot, SnapshotError> {
        let ticker = normalize_ticker(ticker)?;
        self.read_normalized(ticker).await
    }

    /// Resolves several tickers concurrently. Each ticker maps to its
    /// snapshot or `None`; one failure never aborts the others.
    pub async fn read_many<I, S>(&self, tickers: I) -> BTreeMap<String, Option<Snapshot>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut valid = BTreeSet::new();
        let mut results = BTreeMap::new();
        for raw in tickers {
            match normalize_ticker(raw.as_ref()) {
                Ok(ticker) => {
                    valid.insert(ticker);
                }
                Err(_) => {
                    results.insert(raw.as_ref().trim().to_string(), None);
                }
            }
        }

        let reads = valid.into_iter().map(|ticker| async move {
            let snapshot = self.read_normalized(ticker.clone()).await.ok();
            (ticker, snapshot)
        });
        results.extend(join_all(reads).await);
        results
    }

    async fn read_normalized(&self, ticker: String) -> Result<Snapshot, SnapshotError> {
        let max_age = self.ctx.config.snapshot_max_age;
        if let Some(entry) = self.ctx.cache.get(&ticker) {
            if entry.age() < max_age {
                self.ctx.metrics.report(MetricsEvent::Snapshot { cache_hit: true });
                return Ok(entry.into());
            }
        }
        self.ctx.metrics.report(MetricsEvent::Snapshot { cache_hit: false });

        match self.ctx.fetcher.fetch(&ticker).await {
            Ok(quote) => {
                self.ctx.cache.put(&ticker, quote.clone(), Instant::now());
                Ok(Snapshot {
                    quote,
                    stale: false,
                })
            }
            Err(err) => {
                logging::warn(
                    "snapshot.fetch_failed",
                    "Snapshot refresh failed",
                    json!({ "ticker": ticker, "error": err.to_string() }),
                );
                self.ctx.cache.mark_stale(&ticker);
                self.ctx
                    .cache
                    .get(&ticker)
                    .map(Snapshot::from)
                    .ok_or(SnapshotError::NotFound(ticker))
            }
        }
    }
}

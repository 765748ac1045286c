use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::quote::Quote;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub quote: Quote,
    pub updated_at: Instant,
    /// Set when the latest refresh attempt failed. The quote is kept.
    pub stale: bool,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.updated_at.elapsed()
    }
}

/// Latest quote per ticker. Sharded, so readers and writers of unrelated
/// tickers do not contend; writes to one ticker are serialized by its shard.
#[derive(Debug, Default)]
pub struct QuoteCache {
    entries: DashMap<String, CacheEntry>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ticker: &str) -> Option<CacheEntry> {
        self.entries.get(ticker).map(|entry| entry.value().clone())
    }

    /// Overwrites the entry and clears its stale flag. Returns `false`, leaving
    /// the entry untouched, when `now` is older than the stored timestamp.
    pub fn put(&self, ticker: &str, quote: Quote, now: Instant) -> bool {
        let fresh = CacheEntry {
            quote,
            updated_at: now,
            stale: false,
        };
        match self.entries.entry(ticker.to_string()) {
            Entry::Occupied(mut occupied) => {
                if now < occupied.get().updated_at {
                    return false;
                }
                occupied.insert(fresh);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        }
    }

    /// Flags the entry as possibly outdated. Returns `false` if the ticker
    /// was never cached.
    pub fn mark_stale(&self, ticker: &str) -> bool {
        match self.entries.get_mut(ticker) {
            Some(mut entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        tickers.sort();
        tickers
    }
}

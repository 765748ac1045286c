use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::quote::Quote;

pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Closed,
}

/// One observer's interest in one ticker. The sink is a bounded broadcast
/// channel with a single receiver: when it is full the oldest pending quote
/// is overwritten instead of blocking the sender.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    id: HandleId,
    ticker: String,
    sink: broadcast::Sender<Arc<Quote>>,
}

/// Effective sink depth for a requested capacity. The broadcast channel only
/// supports power-of-two buffers, so the request is rounded up.
pub fn queue_depth(capacity: usize) -> usize {
    capacity.max(1).next_power_of_two()
}

impl SubscriberHandle {
    pub fn new(
        id: HandleId,
        ticker: impl Into<String>,
        capacity: usize,
    ) -> (Self, broadcast::Receiver<Arc<Quote>>) {
        let (sink, receiver) = broadcast::channel(queue_depth(capacity));
        (
            Self {
                id,
                ticker: ticker.into(),
                sink,
            },
            receiver,
        )
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn deliver(&self, quote: Arc<Quote>) -> Delivery {
        match self.sink.send(quote) {
            Ok(_) => Delivery::Delivered,
            Err(_) => Delivery::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sink.receiver_count() == 0
    }
}

impl PartialEq for SubscriberHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SubscriberHandle {}

/// Ticker to live subscriber handles. A ticker key exists exactly while at
/// least one handle references it.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: DashMap<String, HashMap<HandleId, SubscriberHandle>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_handle_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers `handle` under its ticker. Re-subscribing the same handle is
    /// a no-op.
    pub fn subscribe(&self, handle: SubscriberHandle) {
        self.subscribers
            .entry(handle.ticker.clone())
            .or_default()
            .entry(handle.id)
            .or_insert(handle);
    }

    /// Removes the handle and drops the ticker entry once it is empty.
    /// Returns whether a handle was actually removed.
    pub fn unsubscribe(&self, ticker: &str, id: HandleId) -> bool {
        match self.subscribers.entry(ticker.to_string()) {
            Entry::Occupied(mut occupied) => {
                let removed = occupied.get_mut().remove(&id).is_some();
                if occupied.get().is_empty() {
                    occupied.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn active_tickers(&self) -> BTreeSet<String> {
        self.subscribers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn subscribers_of(&self, ticker: &str) -> Vec<SubscriberHandle> {
        self.subscribers
            .get(ticker)
            .map(|handles| handles.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self, ticker: &str) -> bool {
        self.subscribers.contains_key(ticker)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().map(|entry| entry.value().len()).sum()
    }
}

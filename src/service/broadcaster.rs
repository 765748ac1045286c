use std::sync::Arc;

use serde_json::json;

use crate::logging;
use crate::quote::Quote;

use super::metrics::{MetricsEvent, MetricsTx};
use super::registry::{Delivery, SubscriptionRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub delivered: usize,
    pub closed: usize,
}

/// Fans a quote out to every handle registered for its ticker. Never waits
/// on a subscriber: sinks are bounded and overwrite their oldest entry.
pub struct Broadcaster {
    registry: Arc<SubscriptionRegistry>,
    metrics: MetricsTx,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriptionRegistry>, metrics: MetricsTx) -> Self {
        Self { registry, metrics }
    }

    pub fn publish(&self, ticker: &str, quote: Quote) -> PublishStats {
        let handles = self.registry.subscribers_of(ticker);
        if handles.is_empty() {
            return PublishStats::default();
        }

        let quote = Arc::new(quote);
        let mut stats = PublishStats::default();
        for handle in handles {
            match handle.deliver(Arc::clone(&quote)) {
                Delivery::Delivered => stats.delivered += 1,
                Delivery::Closed => {
                    // receiver gone without unsubscribing: treat as a disconnect
                    if self.registry.unsubscribe(ticker, handle.id()) {
                        stats.closed += 1;
                        logging::info(
                            "broadcast.sink_closed",
                            "Removed subscriber with closed sink",
                            json!({ "ticker": ticker, "handle": handle.id() }),
                        );
                    }
                }
            }
        }

        self.metrics.report(MetricsEvent::Broadcast {
            delivered: stats.delivered,
            closed: stats.closed,
        });
        stats
    }
}

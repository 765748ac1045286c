use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::broadcaster::Broadcaster;
use super::cache::QuoteCache;
use super::metrics::MetricsTx;
use super::registry::SubscriptionRegistry;
use super::source::{FetchPolicy, Fetcher, QuoteSource};
use super::{ServiceConfig, ShutdownSignal};

/// Everything the components share, built once at start-up and handed out
/// as `Arc<QuoteContext>`.
pub struct QuoteContext {
    pub config: ServiceConfig,
    pub cache: QuoteCache,
    pub registry: Arc<SubscriptionRegistry>,
    pub fetcher: Fetcher,
    pub broadcaster: Broadcaster,
    pub metrics: MetricsTx,
    poller_running: AtomicBool,
    shutdown: watch::Sender<ShutdownSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub is_running: bool,
    pub active_subscriptions: usize,
    pub active_tickers: Vec<String>,
    pub cached_tickers: Vec<String>,
    pub poll_interval_seconds: f64,
}

impl QuoteContext {
    pub fn new(config: ServiceConfig, source: Arc<dyn QuoteSource>, metrics: MetricsTx) -> Self {
        let (shutdown, _) = watch::channel(ShutdownSignal::None);
        Self::with_shutdown(config, source, metrics, shutdown)
    }

    /// Builds a context around an existing shutdown channel, so tasks created
    /// before the context can observe the same signal.
    pub fn with_shutdown(
        config: ServiceConfig,
        source: Arc<dyn QuoteSource>,
        metrics: MetricsTx,
        shutdown: watch::Sender<ShutdownSignal>,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let fetcher = Fetcher::new(
            source,
            FetchPolicy {
                max_concurrent: config.max_concurrent_fetches,
                timeout: config.fetch_timeout,
                jitter: config.fetch_jitter,
                rate_limit_backoff: config.rate_limit_backoff,
            },
        );
        let broadcaster = Broadcaster::new(Arc::clone(&registry), metrics.clone());

        Self {
            config,
            cache: QuoteCache::new(),
            registry,
            fetcher,
            broadcaster,
            metrics,
            poller_running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller_running.load(Ordering::SeqCst)
    }

    /// Marks the poller as running. Returns `false` if it already was.
    pub(crate) fn claim_poller(&self) -> bool {
        !self.poller_running.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_poller(&self) {
        self.poller_running.store(false, Ordering::SeqCst);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<ShutdownSignal> {
        self.shutdown.subscribe()
    }

    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        self.shutdown.send_replace(signal);
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            is_running: self.is_running(),
            active_subscriptions: self.registry.subscription_count(),
            active_tickers: self.registry.active_tickers().into_iter().collect(),
            cached_tickers: self.cache.tickers(),
            poll_interval_seconds: self.config.poll_interval.as_secs_f64(),
        }
    }
}

pub mod api;
pub mod broadcaster;
pub mod cache;
pub mod context;
pub mod gateway;
pub mod metrics;
pub mod poller;
pub mod registry;
pub mod snapshot;
pub mod source;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::constants::{
    BIND_ADDR, FETCH_JITTER_MAX_MS, FETCH_JITTER_MIN_MS, FETCH_TIMEOUT_MS,
    HEARTBEAT_INTERVAL_SECS, MAX_CONCURRENT_FETCHES, METRICS_INTERVAL_SECS, POLL_INTERVAL_MS,
    RATE_LIMIT_BACKOFF_MS, SIM_FAILURE_RATE, SIM_LATENCY_MAX_MS, SIM_LATENCY_MIN_MS, SIM_SEED,
    SUBSCRIBER_QUEUE_CAPACITY,
};
use crate::logging;

use context::QuoteContext;
use poller::Poller;
use source::{QuoteSource, SimulatedSource};

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub poll_interval: Duration,
    pub max_concurrent_fetches: usize,
    pub fetch_timeout: Duration,
    pub fetch_jitter: (Duration, Duration),
    pub rate_limit_backoff: Duration,
    /// Snapshot reads younger than this are served from cache.
    pub snapshot_max_age: Duration,
    pub subscriber_queue: usize,
    pub heartbeat_interval: Duration,
    pub metrics_interval: Duration,
    pub sim_seed: u64,
    pub sim_latency: (Duration, Duration),
    pub sim_failure_rate: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: BIND_ADDR.parse().unwrap_or_else(|_| {
                SocketAddr::from(([127, 0, 0, 1], 8000))
            }),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            max_concurrent_fetches: MAX_CONCURRENT_FETCHES,
            fetch_timeout: Duration::from_millis(FETCH_TIMEOUT_MS),
            fetch_jitter: (
                Duration::from_millis(FETCH_JITTER_MIN_MS),
                Duration::from_millis(FETCH_JITTER_MAX_MS),
            ),
            rate_limit_backoff: Duration::from_millis(RATE_LIMIT_BACKOFF_MS),
            snapshot_max_age: Duration::from_millis(POLL_INTERVAL_MS),
            subscriber_queue: SUBSCRIBER_QUEUE_CAPACITY,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            metrics_interval: Duration::from_secs(METRICS_INTERVAL_SECS),
            sim_seed: SIM_SEED,
            sim_latency: (
                Duration::from_millis(SIM_LATENCY_MIN_MS),
                Duration::from_millis(SIM_LATENCY_MAX_MS),
            ),
            sim_failure_rate: SIM_FAILURE_RATE,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.max_concurrent_fetches == 0 {
            bail!("max concurrent fetches must be at least 1");
        }
        if self.fetch_timeout.is_zero() {
            bail!("fetch timeout must be greater than zero");
        }
        if self.fetch_jitter.0 > self.fetch_jitter.1 {
            bail!("fetch jitter lower bound exceeds upper bound");
        }
        if self.sim_latency.0 > self.sim_latency.1 {
            bail!("simulated latency lower bound exceeds upper bound");
        }
        if self.subscriber_queue == 0 {
            bail!("subscriber queue capacity must be at least 1");
        }
        if self.heartbeat_interval.is_zero() || self.metrics_interval.is_zero() {
            bail!("heartbeat and metrics intervals must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.sim_failure_rate) {
            bail!("simulated failure rate must be within 0.0..=1.0");
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownSignal {
    None,
    Graceful,
    Immediate,
}

/// Runs the service against the built-in simulated upstream.
pub async fn run_with_config(config: ServiceConfig) -> Result<()> {
    let source = Arc::new(SimulatedSource::new(
        config.sim_seed,
        config.sim_latency,
        config.sim_failure_rate,
    ));
    run_with_source(config, source).await
}

pub async fn run_with_source(config: ServiceConfig, source: Arc<dyn QuoteSource>) -> Result<()> {
    config.validate()?;
    let addr = config.bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind quote service at {addr}"))?;

    let (ctx, service) = start(config, source, listener)?;
    let signals_task = tokio::spawn(handle_signals(Arc::clone(&ctx)));

    let run_result = service.await;

    signals_task.abort();
    let _ = signals_task.await;

    run_result
}

/// Wires the context to an already bound listener. The returned future runs
/// the poller, the HTTP surface and the metrics reporter until shutdown.
pub fn start(
    config: ServiceConfig,
    source: Arc<dyn QuoteSource>,
    listener: TcpListener,
) -> Result<(Arc<QuoteContext>, impl Future<Output = Result<()>>)> {
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    let (shutdown_tx, _) = watch::channel(ShutdownSignal::None);
    let (metrics, reporter) = metrics::reporter(config.metrics_interval, shutdown_tx.subscribe());
    let ctx = Arc::new(QuoteContext::with_shutdown(
        config,
        source,
        metrics,
        shutdown_tx,
    ));

    logging::info(
        "service.bind",
        "Quote service listening",
        json!({ "addr": local_addr.to_string() }),
    );

    let poller = Poller::new(Arc::clone(&ctx)).run(ctx.shutdown_signal());
    let server = serve(listener, Arc::clone(&ctx));
    let service = async move {
        tokio::try_join!(poller, server, reporter)?;
        logging::info_simple("service.stop", "Quote service stopped");
        Ok::<(), anyhow::Error>(())
    };

    Ok((ctx, service))
}

pub async fn serve(listener: TcpListener, ctx: Arc<QuoteContext>) -> Result<()> {
    let mut shutdown = ctx.shutdown_signal();
    let app = api::router(ctx);

    let shutdown_signal = async move {
        while shutdown.changed().await.is_ok() {
            if !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                break;
            }
        }
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("quote service terminated with error")?;

    logging::info_simple("service.server.stop", "HTTP server stopped");
    Ok(())
}

async fn handle_signals(ctx: Arc<QuoteContext>) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            logging::info(
                "signal.received",
                "SIGTERM received, initiating graceful shutdown",
                json!({ "signal": "SIGTERM" })
            );
            ctx.request_shutdown(ShutdownSignal::Graceful);
        }
        _ = sigint.recv() => {
            logging::warn(
                "signal.received",
                "SIGINT received, forcing immediate shutdown",
                json!({ "signal": "SIGINT" })
            );
            ctx.request_shutdown(ShutdownSignal::Immediate);
        }
    }

    Ok(())
}

/// Helpers shared by unit and integration tests.
pub mod testkit {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use dashmap::DashMap;
    use tokio::task::JoinHandle;

    use crate::quote::Quote;
    use super::source::FetchError;

    pub fn test_config() -> ServiceConfig {
        ServiceConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            poll_interval: Duration::from_millis(30),
            max_concurrent_fetches: 5,
            fetch_timeout: Duration::from_millis(500),
            fetch_jitter: (Duration::ZERO, Duration::ZERO),
            rate_limit_backoff: Duration::ZERO,
            snapshot_max_age: Duration::from_millis(30),
            subscriber_queue: 16,
            heartbeat_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            sim_seed: 7,
            sim_latency: (Duration::ZERO, Duration::ZERO),
            sim_failure_rate: 0.0,
        }
    }

    /// Deterministic upstream: prices rise by one on every quote, failures
    /// are toggled per ticker and every call is counted.
    pub struct ScriptedSource {
        delay: Duration,
        failing: Mutex<HashSet<String>>,
        calls: DashMap<String, usize>,
        sequence: DashMap<String, u64>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                failing: Mutex::new(HashSet::new()),
                calls: DashMap::new(),
                sequence: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn fail(&self, ticker: &str) {
            if let Ok(mut failing) = self.failing.lock() {
                failing.insert(ticker.to_string());
            }
        }

        pub fn recover(&self, ticker: &str) {
            if let Ok(mut failing) = self.failing.lock() {
                failing.remove(ticker);
            }
        }

        pub fn calls(&self, ticker: &str) -> usize {
            self.calls.get(ticker).map(|count| *count).unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls.iter().map(|entry| *entry.value()).sum()
        }

        pub fn peak_in_flight(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }

        /// Next quote in this ticker's sequence, without counting a call.
        pub fn quote_for(&self, ticker: &str) -> Quote {
            let step = {
                let mut sequence = self.sequence.entry(ticker.to_string()).or_insert(0);
                *sequence += 1;
                *sequence
            };
            let price = 100.0 + step as f64;
            Quote {
                ticker: ticker.to_string(),
                price,
                previous_close: 100.0,
                open: 100.0,
                day_high: price,
                day_low: 100.0,
                volume: step * 1_000,
                change: price - 100.0,
                change_percent: price - 100.0,
                market_cap: None,
                currency: "USD".into(),
                last_updated: Utc::now(),
            }
        }

        fn is_failing(&self, ticker: &str) -> bool {
            self.failing
                .lock()
                .map(|failing| failing.contains(ticker))
                .unwrap_or(false)
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedSource {
        async fn fetch(&self, ticker: &str) -> Result<Quote, FetchError> {
            *self.calls.entry(ticker.to_string()).or_insert(0) += 1;
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.is_failing(ticker) {
                return Err(FetchError::Upstream(format!("scripted failure for {ticker}")));
            }
            Ok(self.quote_for(ticker))
        }
    }

    pub struct RunningService {
        pub addr: SocketAddr,
        pub ctx: Arc<QuoteContext>,
        pub handle: JoinHandle<Result<()>>,
    }

    impl RunningService {
        pub fn http_url(&self, path: &str) -> String {
            format!("http://{}{}", self.addr, path)
        }

        pub fn ws_url(&self, path: &str) -> String {
            format!("ws://{}{}", self.addr, path)
        }

        pub async fn shutdown(self, signal: ShutdownSignal) -> Result<()> {
            self.ctx.request_shutdown(signal);
            self.handle.await.context("service task panicked")?
        }
    }

    /// Starts the full service on an ephemeral port.
    pub async fn spawn(config: ServiceConfig, source: Arc<dyn QuoteSource>) -> Result<RunningService> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .context("failed to bind test listener")?;
        let addr = listener.local_addr()?;
        let (ctx, service) = start(config, source, listener)?;
        let handle = tokio::spawn(service);
        Ok(RunningService { addr, ctx, handle })
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::logging;

use super::context::QuoteContext;
use super::metrics::MetricsEvent;
use super::source::FetchError;
use super::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchOutcome {
    Updated,
    Failed,
    TimedOut,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub tickers: usize,
    pub updated: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    fn record(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Updated => self.updated += 1,
            FetchOutcome::Failed => self.failed += 1,
            FetchOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Holds the context's running flag; dropping it, including when the `run`
/// future is cancelled, clears the flag.
struct PollerClaim<'a> {
    ctx: &'a QuoteContext,
}

impl<'a> PollerClaim<'a> {
    fn acquire(ctx: &'a QuoteContext) -> Option<Self> {
        ctx.claim_poller().then(|| Self { ctx })
    }
}

impl Drop for PollerClaim<'_> {
    fn drop(&mut self) {
        self.ctx.release_poller();
    }
}

/// Background refresher: polls exactly the tickers that currently have
/// subscribers, one cycle per interval.
pub struct Poller {
    ctx: Arc<QuoteContext>,
}

impl Poller {
    pub fn new(ctx: Arc<QuoteContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<ShutdownSignal>) -> Result<()> {
        let Some(_claim) = PollerClaim::acquire(&self.ctx) else {
            logging::warn_simple("poller.already_running", "Poller is already running");
            return Ok(());
        };

        let poll_interval = self.ctx.config.poll_interval;
        logging::info(
            "poller.start",
            "Quote poller started",
            json!({
                "poll_interval_ms": poll_interval.as_millis(),
                "max_concurrent_fetches": self.ctx.config.max_concurrent_fetches,
            }),
        );

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let cycle_start = Instant::now();
            let tickers = self.ctx.registry.active_tickers();
            if !tickers.is_empty() {
                let settled = tokio::select! {
                    report = self.run_cycle(tickers) => Some(report),
                    _ = wait_for_immediate(&mut shutdown) => None,
                };
                match settled {
                    Some(report) => self.report_cycle(report),
                    None => {
                        logging::warn_simple(
                            "poller.cycle_abandoned",
                            "Poll cycle abandoned on immediate shutdown",
                        );
                        break;
                    }
                }
                if shutdown_requested(&shutdown) {
                    break;
                }
            }

            tokio::select! {
                _ = time::sleep_until(cycle_start + poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || shutdown_requested(&shutdown) {
                        break;
                    }
                }
            }
        }

        logging::info_simple("poller.stop", "Quote poller stopped");
        Ok(())
    }

    /// Dispatches one fetch per ticker through the shared gate and waits for
    /// all of them to settle. A slot is acquired before each task is spawned,
    /// so at most `max_concurrent_fetches` tasks exist at once.
    pub async fn run_cycle(&self, tickers: BTreeSet<String>) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport {
            tickers: tickers.len(),
            ..CycleReport::default()
        };
        let mut tasks = JoinSet::new();

        for ticker in tickers {
            let permit = match self.ctx.fetcher.acquire().await {
                Ok(permit) => permit,
                Err(err) => {
                    logging::error(
                        "poller.gate_closed",
                        "Fetch gate unavailable",
                        json!({ "error": err.to_string() }),
                    );
                    report.record(FetchOutcome::Failed);
                    continue;
                }
            };
            let ctx = Arc::clone(&self.ctx);
            tasks.spawn(async move { refresh_ticker(&ctx, permit, ticker).await });
        }

        while let Some(joined) = tasks.join_next().await {
            report.record(joined.unwrap_or(FetchOutcome::Failed));
        }

        report.elapsed = started.elapsed();
        report
    }

    fn report_cycle(&self, report: CycleReport) {
        logging::debug(
            "poller.cycle",
            "Poll cycle settled",
            json!({
                "tickers": report.tickers,
                "updated": report.updated,
                "failed": report.failed,
                "timed_out": report.timed_out,
                "elapsed_ms": report.elapsed.as_millis(),
            }),
        );
        self.ctx.metrics.report(MetricsEvent::PollCycle {
            tickers: report.tickers,
            updated: report.updated,
            failed: report.failed,
            timed_out: report.timed_out,
            elapsed: report.elapsed,
        });
    }
}

async fn refresh_ticker(
    ctx: &QuoteContext,
    permit: OwnedSemaphorePermit,
    ticker: String,
) -> FetchOutcome {
    match ctx.fetcher.fetch_with_permit(permit, &ticker).await {
        Ok(quote) => {
            // publish only what the cache accepted so deliveries follow write order
            if ctx.cache.put(&ticker, quote.clone(), Instant::now()) {
                ctx.broadcaster.publish(&ticker, quote);
            }
            FetchOutcome::Updated
        }
        Err(err) => {
            ctx.cache.mark_stale(&ticker);
            logging::warn(
                "poller.fetch_failed",
                "Quote refresh failed, cache entry marked stale",
                json!({ "ticker": ticker, "error": err.to_string() }),
            );
            match err {
                FetchError::Timeout(_) => FetchOutcome::TimedOut,
                _ => FetchOutcome::Failed,
            }
        }
    }
}

fn shutdown_requested(shutdown: &watch::Receiver<ShutdownSignal>) -> bool {
    !matches!(*shutdown.borrow(), ShutdownSignal::None)
}

async fn wait_for_immediate(shutdown: &mut watch::Receiver<ShutdownSignal>) {
    loop {
        if matches!(*shutdown.borrow_and_update(), ShutdownSignal::Immediate) {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::registry::SubscriberHandle;
    use crate::service::testkit::{test_config, ScriptedSource};
    use crate::service::{metrics::MetricsTx, ServiceConfig};

    fn context(config: ServiceConfig, source: Arc<ScriptedSource>) -> Arc<QuoteContext> {
        Arc::new(QuoteContext::new(config, source, MetricsTx::noop()))
    }

    #[tokio::test]
    async fn cycle_updates_cache_and_isolates_failures() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(5)));
        source.fail("BAD");
        let ctx = context(test_config(), Arc::clone(&source));
        let poller = Poller::new(Arc::clone(&ctx));

        let tickers: BTreeSet<String> = ["AAPL", "BAD", "MSFT"]
            .iter()
            .map(|ticker| ticker.to_string())
            .collect();
        let report = poller.run_cycle(tickers).await;

        assert_eq!(report.tickers, 3);
        assert_eq!(report.updated, 2);
        assert_eq!(report.failed, 1);
        assert!(ctx.cache.get("AAPL").is_some());
        assert!(ctx.cache.get("MSFT").is_some());
        assert!(ctx.cache.get("BAD").is_none());
    }

    #[tokio::test]
    async fn timeouts_are_counted_separately() {
        let source = Arc::new(ScriptedSource::new(Duration::from_millis(200)));
        let config = ServiceConfig {
            fetch_timeout: Duration::from_millis(20),
            ..test_config()
        };
        let ctx = context(config, Arc::clone(&source));
        ctx.cache.put("AAPL", source.quote_for("AAPL"), Instant::now());

        let report = Poller::new(Arc::clone(&ctx))
            .run_cycle(BTreeSet::from(["AAPL".to_string()]))
            .await;

        assert_eq!(report.timed_out, 1);
        let entry = ctx.cache.get("AAPL").expect("previous value kept");
        assert!(entry.stale);
    }

    #[tokio::test]
    async fn successful_refresh_is_broadcast() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let ctx = context(test_config(), Arc::clone(&source));
        let (handle, mut receiver) = SubscriberHandle::new(ctx.registry.next_handle_id(), "AAPL", 4);
        ctx.registry.subscribe(handle);

        Poller::new(Arc::clone(&ctx))
            .run_cycle(ctx.registry.active_tickers())
            .await;

        let delivered = receiver.try_recv().expect("broadcast quote");
        assert_eq!(delivered.ticker, "AAPL");
        assert_eq!(
            ctx.cache.get("AAPL").map(|entry| entry.quote),
            Some((*delivered).clone())
        );
    }

    #[tokio::test]
    async fn second_run_is_ignored_while_running() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let ctx = context(test_config(), source);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let first = tokio::spawn(Poller::new(Arc::clone(&ctx)).run(shutdown_rx.clone()));
        time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_running());

        Poller::new(Arc::clone(&ctx))
            .run(shutdown_rx)
            .await
            .expect("second run returns");
        assert!(ctx.is_running(), "first poller unaffected");

        shutdown_tx.send(ShutdownSignal::Graceful).expect("send");
        first.await.expect("join").expect("poller result");
        assert!(!ctx.is_running());
    }

    #[tokio::test]
    async fn aborted_poller_clears_running_flag() {
        let source = Arc::new(ScriptedSource::new(Duration::ZERO));
        let ctx = context(test_config(), source);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let task = tokio::spawn(Poller::new(Arc::clone(&ctx)).run(shutdown_rx.clone()));
        time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_running());

        task.abort();
        let _ = task.await;
        assert!(!ctx.is_running(), "cancelled poller must not stay marked running");

        let restarted = tokio::spawn(Poller::new(Arc::clone(&ctx)).run(shutdown_rx));
        time::sleep(Duration::from_millis(20)).await;
        assert!(ctx.is_running(), "a new poller can claim the context");

        shutdown_tx.send(ShutdownSignal::Graceful).expect("send");
        restarted.await.expect("join").expect("poller result");
        assert!(!ctx.is_running());
    }

    #[tokio::test]
    async fn immediate_shutdown_abandons_in_flight_cycle() {
        let source = Arc::new(ScriptedSource::new(Duration::from_secs(30)));
        let config = ServiceConfig {
            fetch_timeout: Duration::from_secs(60),
            ..test_config()
        };
        let ctx = context(config, Arc::clone(&source));
        let (handle, _receiver) = SubscriberHandle::new(ctx.registry.next_handle_id(), "AAPL", 4);
        ctx.registry.subscribe(handle);
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);

        let task = tokio::spawn(Poller::new(Arc::clone(&ctx)).run(shutdown_rx));
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls("AAPL"), 1);

        shutdown_tx.send(ShutdownSignal::Immediate).expect("send");
        time::timeout(Duration::from_secs(1), task)
            .await
            .expect("poller stops promptly")
            .expect("join")
            .expect("poller result");
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.fetcher.in_flight(), 0, "aborted task released its slot");
    }
}

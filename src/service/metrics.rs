use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio::{
    sync::{mpsc, watch},
    time::{interval, MissedTickBehavior},
};

use crate::logging;

use super::ShutdownSignal;

#[derive(Debug)]
pub enum MetricsEvent {
    PollCycle {
        tickers: usize,
        updated: usize,
        failed: usize,
        timed_out: usize,
        elapsed: Duration,
    },
    Broadcast {
        delivered: usize,
        closed: usize,
    },
    SlowConsumer {
        skipped: u64,
    },
    Snapshot {
        cache_hit: bool,
    },
}

#[derive(Clone, Default)]
pub struct MetricsTx(Option<mpsc::UnboundedSender<MetricsEvent>>);

impl MetricsTx {
    pub fn report(&self, event: MetricsEvent) {
        if let Some(sender) = &self.0 {
            let _ = sender.send(event);
        }
    }

    pub fn noop() -> Self {
        Self(None)
    }
}

pub fn reporter(
    period: Duration,
    shutdown: watch::Receiver<ShutdownSignal>,
) -> (MetricsTx, impl std::future::Future<Output = Result<()>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MetricsTx(Some(tx)), process_events(period, rx, shutdown))
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Window {
    cycles: usize,
    fetches: usize,
    updated: usize,
    failed: usize,
    timed_out: usize,
    slowest_cycle_ms: u128,
    delivered: usize,
    closed_sinks: usize,
    lagged_events: usize,
    skipped_quotes: u64,
    snapshot_hits: usize,
    snapshot_misses: usize,
}

impl Window {
    fn record(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::PollCycle {
                tickers,
                updated,
                failed,
                timed_out,
                elapsed,
            } => {
                self.cycles = self.cycles.saturating_add(1);
                self.fetches = self.fetches.saturating_add(tickers);
                self.updated = self.updated.saturating_add(updated);
                self.failed = self.failed.saturating_add(failed);
                self.timed_out = self.timed_out.saturating_add(timed_out);
                self.slowest_cycle_ms = self.slowest_cycle_ms.max(elapsed.as_millis());
            }
            MetricsEvent::Broadcast { delivered, closed } => {
                self.delivered = self.delivered.saturating_add(delivered);
                self.closed_sinks = self.closed_sinks.saturating_add(closed);
            }
            MetricsEvent::SlowConsumer { skipped } => {
                self.lagged_events = self.lagged_events.saturating_add(1);
                self.skipped_quotes = self.skipped_quotes.saturating_add(skipped);
            }
            MetricsEvent::Snapshot { cache_hit } => {
                if cache_hit {
                    self.snapshot_hits = self.snapshot_hits.saturating_add(1);
                } else {
                    self.snapshot_misses = self.snapshot_misses.saturating_add(1);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        *self == Window::default()
    }
}

async fn process_events(
    period: Duration,
    mut rx: mpsc::UnboundedReceiver<MetricsEvent>,
    mut shutdown: watch::Receiver<ShutdownSignal>,
) -> Result<()> {
    let mut window = Window::default();
    let mut reporter = interval(period);
    reporter.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => window.record(event),
                    None => break,
                }
            }
            _ = reporter.tick() => {
                if !window.is_empty() {
                    logging::info(
                        "metrics.summary",
                        "quote service activity summary",
                        json!({
                            "period_ms": period.as_millis(),
                            "poll_cycles": window.cycles,
                            "fetches": window.fetches,
                            "updated": window.updated,
                            "failed": window.failed,
                            "timed_out": window.timed_out,
                            "slowest_cycle_ms": window.slowest_cycle_ms,
                            "delivered": window.delivered,
                            "closed_sinks": window.closed_sinks,
                            "slow_consumer_events": window.lagged_events,
                            "skipped_quotes": window.skipped_quotes,
                            "snapshot_hits": window.snapshot_hits,
                            "snapshot_misses": window.snapshot_misses,
                        })
                    );
                }
                window = Window::default();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                    break;
                }
            }
        }
    }

    logging::info_simple("metrics.stop", "Metrics reporter stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_accumulates_events() {
        let mut window = Window::default();
        assert!(window.is_empty());

        window.record(MetricsEvent::PollCycle {
            tickers: 3,
            updated: 2,
            failed: 1,
            timed_out: 0,
            elapsed: Duration::from_millis(40),
        });
        window.record(MetricsEvent::PollCycle {
            tickers: 1,
            updated: 0,
            failed: 0,
            timed_out: 1,
            elapsed: Duration::from_millis(90),
        });
        window.record(MetricsEvent::SlowConsumer { skipped: 5 });
        window.record(MetricsEvent::Snapshot { cache_hit: false });

        assert_eq!(window.cycles, 2);
        assert_eq!(window.fetches, 4);
        assert_eq!(window.timed_out, 1);
        assert_eq!(window.slowest_cycle_ms, 90);
        assert_eq!(window.skipped_quotes, 5);
        assert_eq!(window.snapshot_misses, 1);
        assert!(!window.is_empty());
    }

    #[tokio::test]
    async fn reporter_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownSignal::None);
        let (metrics, reporter) = reporter(Duration::from_millis(10), shutdown_rx);
        let task = tokio::spawn(reporter);

        metrics.report(MetricsEvent::Broadcast {
            delivered: 1,
            closed: 0,
        });
        shutdown_tx.send(ShutdownSignal::Graceful).expect("send");

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reporter should stop")
            .expect("join")
            .expect("reporter result");
    }
}

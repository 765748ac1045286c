use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

use crate::constants::SIM_MAX_TICKERS;
use crate::quote::{Quote, RawQuote};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("upstream fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream rate limit reached")]
    RateLimited,
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

/// The upstream quote provider. Implementations only need to answer one
/// ticker at a time; throttling, jitter and deadlines are applied by
/// [`Fetcher`].
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch(&self, ticker: &str) -> Result<Quote, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    pub max_concurrent: usize,
    pub timeout: Duration,
    pub jitter: (Duration, Duration),
    pub rate_limit_backoff: Duration,
}

/// Shared fetch primitive used by both the poller and snapshot reads. The
/// semaphore is the only global throttle on the upstream and lives as long
/// as the fetcher.
pub struct Fetcher {
    source: Arc<dyn QuoteSource>,
    gate: Arc<Semaphore>,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(source: Arc<dyn QuoteSource>, policy: FetchPolicy) -> Self {
        Self {
            source,
            gate: Arc::new(Semaphore::new(policy.max_concurrent.max(1))),
            policy,
        }
    }

    /// Number of fetches currently holding a gate slot.
    pub fn in_flight(&self) -> usize {
        self.policy.max_concurrent.max(1) - self.gate.available_permits()
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, FetchError> {
        Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Upstream("fetch gate closed".into()))
    }

    pub async fn fetch(&self, ticker: &str) -> Result<Quote, FetchError> {
        let permit = self.acquire().await?;
        self.fetch_with_permit(permit, ticker).await
    }

    /// Runs one upstream call while holding `permit`. The slot is kept
    /// through the jitter delay and, after a rate-limit answer, through the
    /// back-off so the whole pool slows down.
    pub async fn fetch_with_permit(
        &self,
        permit: OwnedSemaphorePermit,
        ticker: &str,
    ) -> Result<Quote, FetchError> {
        let delay = self.jitter_delay();
        if !delay.is_zero() {
            time::sleep(delay).await;
        }

        let result = match time::timeout(self.policy.timeout, self.source.fetch(ticker)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.policy.timeout)),
        };

        if matches!(result, Err(FetchError::RateLimited)) && !self.policy.rate_limit_backoff.is_zero()
        {
            time::sleep(self.policy.rate_limit_backoff).await;
        }

        drop(permit);
        result
    }

    fn jitter_delay(&self) -> Duration {
        let (low, high) = self.policy.jitter;
        if high > low {
            rand::thread_rng().gen_range(low..high)
        } else {
            low
        }
    }
}

struct SimulatedTicker {
    rng: StdRng,
    price: f64,
    previous_close: f64,
    open: f64,
    day_high: f64,
    day_low: f64,
    volume: u64,
    shares_outstanding: f64,
}

impl SimulatedTicker {
    fn seeded(ticker: &str, seed: u64) -> Self {
        let mut hasher = DefaultHasher::new();
        ticker.hash(&mut hasher);
        seed.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());

        let previous_close: f64 = rng.gen_range(20.0..500.0);
        let open = previous_close * (1.0 + rng.gen_range(-0.01..0.01));
        Self {
            shares_outstanding: rng.gen_range(5.0e7..5.0e9),
            rng,
            price: open,
            previous_close,
            open,
            day_high: open,
            day_low: open,
            volume: 0,
        }
    }

    fn step(&mut self) -> RawQuote {
        let shock: f64 = self.rng.sample(StandardNormal);
        self.price = (self.price * (1.0 + shock * 0.002)).max(0.01);
        self.day_high = self.day_high.max(self.price);
        self.day_low = self.day_low.min(self.price);
        self.volume = self.volume.saturating_add(self.rng.gen_range(100..10_000));

        RawQuote {
            price: Some(self.price),
            previous_close: Some(self.previous_close),
            open: Some(self.open),
            day_high: Some(self.day_high),
            day_low: Some(self.day_low),
            volume: Some(self.volume),
            market_cap: Some(self.price * self.shares_outstanding),
            currency: Some("USD".into()),
            ..RawQuote::default()
        }
    }
}

/// Random-walk stand-in for a real market data provider. Symbols containing
/// digits are treated as unknown so the not-found path stays reachable. At
/// most `max_tickers` symbols are tracked; requests for new symbols beyond
/// that are answered as unknown.
pub struct SimulatedSource {
    tickers: DashMap<String, SimulatedTicker>,
    max_tickers: usize,
    seed: u64,
    latency: (Duration, Duration),
    failure_rate: f64,
}

impl SimulatedSource {
    pub fn new(seed: u64, latency: (Duration, Duration), failure_rate: f64) -> Self {
        Self {
            tickers: DashMap::new(),
            max_tickers: SIM_MAX_TICKERS,
            seed,
            latency,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn with_max_tickers(mut self, max_tickers: usize) -> Self {
        self.max_tickers = max_tickers;
        self
    }

    pub fn tracked_tickers(&self) -> usize {
        self.tickers.len()
    }
}

#[async_trait]
impl QuoteSource for SimulatedSource {
    async fn fetch(&self, ticker: &str) -> Result<Quote, FetchError> {
        if ticker.chars().any(|c| c.is_ascii_digit()) {
            return Err(FetchError::Upstream(format!("unknown symbol {ticker}")));
        }
        // checked before taking the entry lock; len() reads every shard
        if !self.tickers.contains_key(ticker) && self.tickers.len() >= self.max_tickers {
            return Err(FetchError::Upstream(format!(
                "unknown symbol {ticker}: simulated universe is full"
            )));
        }

        let (latency, raw) = {
            let mut state = self
                .tickers
                .entry(ticker.to_string())
                .or_insert_with(|| SimulatedTicker::seeded(ticker, self.seed));
            let (low, high) = self.latency;
            let latency = if high > low {
                state.rng.gen_range(low..high)
            } else {
                low
            };
            let raw = if state.rng.gen_bool(self.failure_rate) {
                None
            } else {
                Some(state.step())
            };
            (latency, raw)
        };

        time::sleep(latency).await;
        match raw {
            Some(raw) => raw.into_quote(ticker, Utc::now()),
            None => Err(FetchError::Upstream(format!(
                "simulated upstream failure for {ticker}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
        answer: Result<(), FetchError>,
        delay: Duration,
    }

    #[async_trait]
    impl QuoteSource for Flaky {
        async fn fetch(&self, ticker: &str) -> Result<Quote, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            time::sleep(self.delay).await;
            self.answer.clone()?;
            RawQuote {
                price: Some(1.0),
                ..RawQuote::default()
            }
            .into_quote(ticker, Utc::now())
        }
    }

    fn policy(timeout_ms: u64, backoff_ms: u64) -> FetchPolicy {
        FetchPolicy {
            max_concurrent: 2,
            timeout: Duration::from_millis(timeout_ms),
            jitter: (Duration::ZERO, Duration::ZERO),
            rate_limit_backoff: Duration::from_millis(backoff_ms),
        }
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            answer: Ok(()),
            delay: Duration::from_millis(200),
        });
        let fetcher = Fetcher::new(source.clone(), policy(20, 0));

        let err = fetcher.fetch("AAPL").await.unwrap_err();
        assert_eq!(err, FetchError::Timeout(Duration::from_millis(20)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fetcher.in_flight(), 0, "permit must be released");
    }

    #[tokio::test]
    async fn rate_limit_holds_the_slot_during_backoff() {
        let source = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            answer: Err(FetchError::RateLimited),
            delay: Duration::ZERO,
        });
        let fetcher = Arc::new(Fetcher::new(source, policy(1_000, 150)));

        let background = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move { fetcher.fetch("AAPL").await })
        };
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.in_flight(), 1, "slot held while backing off");

        let result = background.await.expect("join");
        assert_eq!(result.unwrap_err(), FetchError::RateLimited);
        assert_eq!(fetcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn simulated_source_walks_prices() {
        let source = SimulatedSource::new(7, (Duration::ZERO, Duration::ZERO), 0.0);
        let first = source.fetch("AAPL").await.expect("quote");
        let second = source.fetch("AAPL").await.expect("quote");
        assert_eq!(first.previous_close, second.previous_close);
        assert!(second.volume > first.volume);
        assert!(second.day_high >= second.price && second.day_low <= second.price);
        assert!(second.market_cap.is_some());
    }

    #[tokio::test]
    async fn simulated_source_rejects_unknown_symbols() {
        let source = SimulatedSource::new(7, (Duration::ZERO, Duration::ZERO), 0.0);
        assert!(matches!(
            source.fetch("ZZ9").await,
            Err(FetchError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn simulated_source_caps_tracked_symbols() {
        let source =
            SimulatedSource::new(7, (Duration::ZERO, Duration::ZERO), 0.0).with_max_tickers(2);
        source.fetch("AAPL").await.expect("first symbol");
        source.fetch("MSFT").await.expect("second symbol");

        assert!(matches!(
            source.fetch("GOOG").await,
            Err(FetchError::Upstream(_))
        ));
        assert_eq!(source.tracked_tickers(), 2);
        source.fetch("AAPL").await.expect("known symbols keep walking");
    }
}

pub const BIND_ADDR: &str = "127.0.0.1:8000";
pub const POLL_INTERVAL_MS: u64 = 2_000;
pub const MAX_CONCURRENT_FETCHES: usize = 5;
pub const FETCH_TIMEOUT_MS: u64 = 5_000;
pub const FETCH_JITTER_MIN_MS: u64 = 100;
pub const FETCH_JITTER_MAX_MS: u64 = 500;
pub const RATE_LIMIT_BACKOFF_MS: u64 = 5_000;
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 16;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const METRICS_INTERVAL_SECS: u64 = 10;
pub const MAX_TICKER_LEN: usize = 12;
pub const DEFAULT_CURRENCY: &str = "USD";
pub const SIM_LATENCY_MIN_MS: u64 = 50;
pub const SIM_LATENCY_MAX_MS: u64 = 250;
pub const SIM_FAILURE_RATE: f64 = 0.02;
pub const SIM_SEED: u64 = 0x5EED_F00D;
pub const SIM_MAX_TICKERS: usize = 4_096;

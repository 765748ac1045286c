use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::constants::{
    BIND_ADDR, FETCH_JITTER_MAX_MS, FETCH_JITTER_MIN_MS, FETCH_TIMEOUT_MS,
    HEARTBEAT_INTERVAL_SECS, MAX_CONCURRENT_FETCHES, METRICS_INTERVAL_SECS, POLL_INTERVAL_MS,
    RATE_LIMIT_BACKOFF_MS, SIM_FAILURE_RATE, SIM_SEED, SUBSCRIBER_QUEUE_CAPACITY,
};
use crate::logging::Level;
use crate::service::ServiceConfig;
use crate::tail::TailArgs;

#[derive(Debug, Parser)]
#[command(author, version, about = "Subscription-aware stock quote streaming service")]
pub struct Cli {
    /// Minimum log level written to stdout/stderr
    #[arg(long, value_enum, global = true, default_value = "info")]
    pub log_level: Level,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    pub fn command(self) -> Command {
        self.command
            .unwrap_or_else(|| Command::Serve(ServeArgs::default()))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the poller and serve the websocket and REST endpoints
    Serve(ServeArgs),
    /// Connect to a running service and print streamed quotes
    Tail(TailArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = BIND_ADDR)]
    pub bind: SocketAddr,

    /// Milliseconds between poll cycles
    #[arg(long, default_value_t = POLL_INTERVAL_MS)]
    pub poll_interval_ms: u64,

    /// Upper bound on concurrent upstream requests
    #[arg(long, default_value_t = MAX_CONCURRENT_FETCHES)]
    pub max_concurrent_fetches: usize,

    /// Per-fetch timeout in milliseconds
    #[arg(long, default_value_t = FETCH_TIMEOUT_MS)]
    pub fetch_timeout_ms: u64,

    #[arg(long, default_value_t = FETCH_JITTER_MIN_MS)]
    pub jitter_min_ms: u64,

    #[arg(long, default_value_t = FETCH_JITTER_MAX_MS)]
    pub jitter_max_ms: u64,

    /// Pause after a rate-limit response, holding the fetch slot
    #[arg(long, default_value_t = RATE_LIMIT_BACKOFF_MS)]
    pub rate_limit_backoff_ms: u64,

    /// Maximum cache age served to snapshot reads; defaults to the poll interval
    #[arg(long)]
    pub snapshot_max_age_ms: Option<u64>,

    /// Per-subscriber queue depth before the oldest quote is overwritten,
    /// rounded up to the next power of two
    #[arg(long, default_value_t = SUBSCRIBER_QUEUE_CAPACITY)]
    pub subscriber_queue: usize,

    #[arg(long, default_value_t = HEARTBEAT_INTERVAL_SECS)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = METRICS_INTERVAL_SECS)]
    pub metrics_secs: u64,

    /// Seed for the simulated upstream
    #[arg(long, default_value_t = SIM_SEED)]
    pub seed: u64,

    /// Probability that a simulated fetch fails
    #[arg(long, default_value_t = SIM_FAILURE_RATE)]
    pub failure_rate: f64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        let config = ServiceConfig::default();
        Self {
            bind: config.bind_addr,
            poll_interval_ms: POLL_INTERVAL_MS,
            max_concurrent_fetches: MAX_CONCURRENT_FETCHES,
            fetch_timeout_ms: FETCH_TIMEOUT_MS,
            jitter_min_ms: FETCH_JITTER_MIN_MS,
            jitter_max_ms: FETCH_JITTER_MAX_MS,
            rate_limit_backoff_ms: RATE_LIMIT_BACKOFF_MS,
            snapshot_max_age_ms: None,
            subscriber_queue: SUBSCRIBER_QUEUE_CAPACITY,
            heartbeat_secs: HEARTBEAT_INTERVAL_SECS,
            metrics_secs: METRICS_INTERVAL_SECS,
            seed: SIM_SEED,
            failure_rate: SIM_FAILURE_RATE,
        }
    }
}

impl ServeArgs {
    pub fn into_config(self) -> ServiceConfig {
        let poll_interval = Duration::from_millis(self.poll_interval_ms);
        ServiceConfig {
            bind_addr: self.bind,
            poll_interval,
            max_concurrent_fetches: self.max_concurrent_fetches,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            fetch_jitter: (
                Duration::from_millis(self.jitter_min_ms),
                Duration::from_millis(self.jitter_max_ms),
            ),
            rate_limit_backoff: Duration::from_millis(self.rate_limit_backoff_ms),
            snapshot_max_age: self
                .snapshot_max_age_ms
                .map(Duration::from_millis)
                .unwrap_or(poll_interval),
            subscriber_queue: self.subscriber_queue,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            metrics_interval: Duration::from_secs(self.metrics_secs),
            sim_seed: self.seed,
            sim_failure_rate: self.failure_rate,
            ..ServiceConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_serves_with_defaults() {
        let cli = Cli::parse_from(["quote-stream"]);
        assert_eq!(cli.log_level, Level::Info);
        match cli.command() {
            Command::Serve(args) => {
                let config = args.into_config();
                assert_eq!(config.poll_interval, Duration::from_millis(POLL_INTERVAL_MS));
                assert_eq!(config.snapshot_max_age, config.poll_interval);
                assert!(config.validate().is_ok());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_flags_map_onto_config() {
        let cli = Cli::parse_from([
            "quote-stream",
            "--log-level",
            "debug",
            "serve",
            "--poll-interval-ms",
            "500",
            "--max-concurrent-fetches",
            "2",
            "--snapshot-max-age-ms",
            "100",
        ]);
        assert_eq!(cli.log_level, Level::Debug);
        let Command::Serve(args) = cli.command() else {
            panic!("expected serve");
        };
        let config = args.into_config();
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_concurrent_fetches, 2);
        assert_eq!(config.snapshot_max_age, Duration::from_millis(100));
    }
}

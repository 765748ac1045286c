use anyhow::{bail, Context, Result};
use clap::Args;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::constants::BIND_ADDR;
use crate::quote::{normalize_ticker, StreamMessage};

#[derive(Debug, Args, Clone)]
pub struct TailArgs {
    /// Ticker to subscribe to (e.g. AAPL)
    pub ticker: String,

    /// Base websocket URL of a running service
    #[arg(long, default_value_t = format!("ws://{BIND_ADDR}"))]
    pub url: String,

    /// Stop after printing this many quotes
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Also print heartbeat pings
    #[arg(long)]
    pub show_pings: bool,
}

pub async fn run(args: TailArgs) -> Result<()> {
    let ticker = normalize_ticker(&args.ticker)?;
    let endpoint = format!("{}/ws/quote/{ticker}", args.url.trim_end_matches('/'));
    let (mut ws, _) = tokio_tungstenite::connect_async(endpoint.as_str())
        .await
        .with_context(|| {
            format!("failed to connect to {endpoint}; run `cargo run -- serve` first")
        })?;

    println!("Connected to {endpoint}; streaming quotes...");
    let mut printed = 0usize;

    while let Some(message) = ws.next().await {
        let payload = match message.context("websocket receive failed")? {
            Message::Text(payload) => payload,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<StreamMessage>(&payload)? {
            StreamMessage::Quote { data, timestamp, .. } => {
                println!(
                    "{:>25} | {:>8} | {:>10.2} | {:>+8.2} | {:>+7.2}% | {:>12}",
                    timestamp.to_rfc3339(),
                    data.ticker,
                    data.price,
                    data.change,
                    data.change_percent,
                    data.volume
                );
                printed += 1;
            }
            StreamMessage::Ping { timestamp } => {
                if args.show_pings {
                    println!("{:>25} | ping", timestamp.to_rfc3339());
                }
            }
        }

        if let Some(limit) = args.limit {
            if printed >= limit {
                return Ok(());
            }
        }
    }

    if args.limit.is_some() {
        bail!("stream closed after {printed} quotes");
    }
    Ok(())
}

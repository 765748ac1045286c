use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};

use crate::logging;
use crate::quote::{normalize_ticker, Quote, StreamMessage};

use super::context::QuoteContext;
use super::metrics::MetricsEvent;
use super::registry::{HandleId, SubscriberHandle};
use super::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Subscribed,
    Closed,
}

/// A live registration in the subscription registry. Dropping it, on any
/// path, removes the handle exactly once.
pub struct Subscription {
    ctx: Arc<QuoteContext>,
    ticker: String,
    handle_id: HandleId,
    receiver: broadcast::Receiver<Arc<Quote>>,
    released: bool,
}

impl Subscription {
    pub fn open(ctx: Arc<QuoteContext>, ticker: String) -> Self {
        let handle_id = ctx.registry.next_handle_id();
        let (handle, receiver) =
            SubscriberHandle::new(handle_id, ticker.clone(), ctx.config.subscriber_queue);
        ctx.registry.subscribe(handle);
        logging::debug(
            "gateway.subscribe",
            "Subscriber handle registered",
            json!({ "ticker": ticker, "handle": handle_id }),
        );

        Self {
            ctx,
            ticker,
            handle_id,
            receiver,
            released: false,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle_id
    }

    /// Cached quote to send right after subscribing, if any.
    pub fn initial_snapshot(&self) -> Option<Quote> {
        self.ctx.cache.get(&self.ticker).map(|entry| entry.quote)
    }

    /// Next broadcast quote in delivery order. Quotes overwritten while this
    /// subscriber lagged are skipped. `None` once the sink is gone.
    pub async fn next_quote(&mut self) -> Option<Arc<Quote>> {
        loop {
            match self.receiver.recv().await {
                Ok(quote) => return Some(quote),
                Err(RecvError::Lagged(skipped)) => {
                    self.ctx
                        .metrics
                        .report(MetricsEvent::SlowConsumer { skipped });
                    logging::warn(
                        "gateway.client.lagged",
                        "Slow subscriber skipped superseded quotes",
                        json!({ "ticker": self.ticker, "skipped": skipped }),
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let removed = self.ctx.registry.unsubscribe(&self.ticker, self.handle_id);
        logging::debug(
            "gateway.unsubscribe",
            "Subscriber handle released",
            json!({ "ticker": self.ticker, "handle": self.handle_id, "removed": removed }),
        );
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe { ticker: String },
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_message(sender: &mut WsSender, message: &StreamMessage) -> Result<()> {
    let payload = serde_json::to_string(message).context("serialize stream message")?;
    sender
        .send(Message::Text(payload))
        .await
        .context("websocket send failed")
}

async fn send_initial(sender: &mut WsSender, subscription: &Subscription) -> Result<()> {
    if let Some(quote) = subscription.initial_snapshot() {
        send_message(sender, &StreamMessage::quote(&quote)).await?;
    }
    Ok(())
}

/// Drives one streaming connection from subscription to teardown.
pub async fn stream_quotes(socket: WebSocket, ctx: Arc<QuoteContext>, ticker: String) -> Result<()> {
    let mut state = ConnectionState::Connecting;
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let mut shutdown = ctx.shutdown_signal();

    let mut subscription = Subscription::open(Arc::clone(&ctx), ticker);
    state = transition(state, ConnectionState::Subscribed, subscription.ticker());

    let mut heartbeat = interval(ctx.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    heartbeat.reset();

    let mut result = send_initial(&mut ws_sender, &subscription).await;

    while result.is_ok() {
        tokio::select! {
            update = subscription.next_quote() => {
                match update {
                    Some(quote) => {
                        result = send_message(&mut ws_sender, &StreamMessage::quote(&quote)).await;
                    }
                    None => break,
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientCommand>(&text) {
                            Ok(ClientCommand::Subscribe { ticker }) => match normalize_ticker(&ticker) {
                                Ok(next) if next == subscription.ticker() => {}
                                Ok(next) => {
                                    subscription.close();
                                    subscription = Subscription::open(Arc::clone(&ctx), next);
                                    logging::info(
                                        "gateway.client.resubscribed",
                                        "Client switched ticker",
                                        json!({ "ticker": subscription.ticker() }),
                                    );
                                    result = send_initial(&mut ws_sender, &subscription).await;
                                }
                                Err(err) => logging::warn(
                                    "gateway.client.bad_ticker",
                                    "Ignoring subscribe with invalid ticker",
                                    json!({ "error": err.to_string() }),
                                ),
                            },
                            Err(err) => logging::debug(
                                "gateway.client.ignored",
                                "Ignoring unrecognised client message",
                                json!({ "error": err.to_string() }),
                            ),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        logging::info(
                            "gateway.client.transport_error",
                            "Websocket transport error, closing",
                            json!({ "error": err.to_string() }),
                        );
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                result = send_message(&mut ws_sender, &StreamMessage::ping()).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || !matches!(*shutdown.borrow(), ShutdownSignal::None) {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    let ticker = subscription.ticker().to_string();
    subscription.close();
    transition(state, ConnectionState::Closed, &ticker);

    // a failed send means the peer went away; that is a normal disconnect
    if let Err(err) = result {
        logging::debug(
            "gateway.client.send_failed",
            "Stopped streaming after failed send",
            json!({ "ticker": ticker, "error": format!("{err:#}") }),
        );
    }
    Ok(())
}

fn transition(from: ConnectionState, to: ConnectionState, ticker: &str) -> ConnectionState {
    let event = match to {
        ConnectionState::Connecting => "gateway.client.connecting",
        ConnectionState::Subscribed => "gateway.client.connected",
        ConnectionState::Closed => "gateway.client.disconnected",
    };
    logging::info(
        event,
        "Streaming client state changed",
        json!({ "ticker": ticker, "from": format!("{from:?}"), "to": format!("{to:?}") }),
    );
    to
}

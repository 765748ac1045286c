use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::logging;
use crate::quote::{normalize_ticker, InvalidTicker};

use super::context::{QuoteContext, StatusReport};
use super::gateway;
use super::snapshot::{Snapshot, SnapshotError, SnapshotReader};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<InvalidTicker> for ApiError {
    fn from(err: InvalidTicker) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<SnapshotError> for ApiError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::NotFound(_) => ApiError::NotFound(err.to_string()),
            SnapshotError::InvalidTicker(invalid) => invalid.into(),
        }
    }
}

pub fn router(ctx: Arc<QuoteContext>) -> Router {
    Router::new()
        .route("/ws/quote/:ticker", get(quote_stream))
        .route("/quote/realtime", get(multi_quote))
        .route("/quote/realtime/status", get(status))
        .route("/quote/realtime/:ticker", get(single_quote))
        .route("/health", get(health))
        .with_state(ctx)
}

async fn quote_stream(
    ws: WebSocketUpgrade,
    Path(ticker): Path<String>,
    State(ctx): State<Arc<QuoteContext>>,
) -> Result<Response, ApiError> {
    let ticker = normalize_ticker(&ticker)?;
    Ok(ws.on_upgrade(move |socket| async move {
        if let Err(err) = gateway::stream_quotes(socket, ctx, ticker).await {
            logging::warn(
                "gateway.client_error",
                "Streaming client ended with error",
                json!({ "error": format!("{err:?}") }),
            );
        }
    }))
}

async fn single_quote(
    Path(ticker): Path<String>,
    State(ctx): State<Arc<QuoteContext>>,
) -> Result<Json<Snapshot>, ApiError> {
    let snapshot = SnapshotReader::new(ctx).read(&ticker).await?;
    Ok(Json(snapshot))
}

/// Accepts `?tickers=AAPL,MSFT` as well as repeated `tickers=` parameters.
async fn multi_quote(
    Query(params): Query<Vec<(String, String)>>,
    State(ctx): State<Arc<QuoteContext>>,
) -> Result<Json<BTreeMap<String, Option<Snapshot>>>, ApiError> {
    let tickers: Vec<String> = params
        .iter()
        .filter(|(key, _)| key == "tickers")
        .flat_map(|(_, value)| value.split(','))
        .map(str::trim)
        .filter(|ticker| !ticker.is_empty())
        .map(str::to_string)
        .collect();
    if tickers.is_empty() {
        return Err(ApiError::BadRequest(
            "query parameter `tickers` must list at least one ticker".into(),
        ));
    }

    Ok(Json(SnapshotReader::new(ctx).read_many(tickers).await))
}

async fn status(State(ctx): State<Arc<QuoteContext>>) -> Json<StatusReport> {
    Json(ctx.status())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

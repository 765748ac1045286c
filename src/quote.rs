use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_CURRENCY, MAX_TICKER_LEN};
use crate::service::source::FetchError;

/// Latest known market state for one ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub ticker: String,
    pub price: f64,
    pub previous_close: f64,
    pub open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub volume: u64,
    pub change: f64,
    pub change_percent: f64,
    pub market_cap: Option<f64>,
    pub currency: String,
    pub last_updated: DateTime<Utc>,
}

/// Upstream payload before validation. Every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawQuote {
    pub price: Option<f64>,
    pub previous_close: Option<f64>,
    pub open: Option<f64>,
    pub day_high: Option<f64>,
    pub day_low: Option<f64>,
    pub volume: Option<u64>,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
    pub market_cap: Option<f64>,
    pub currency: Option<String>,
}

impl RawQuote {
    /// Validates the payload and fills derived fields. A payload without a
    /// usable price is rejected as malformed.
    pub fn into_quote(self, ticker: &str, captured_at: DateTime<Utc>) -> Result<Quote, FetchError> {
        let price = finite(self.price)
            .ok_or_else(|| FetchError::Malformed(format!("{ticker}: missing or invalid price")))?;
        let previous_close = finite(self.previous_close).unwrap_or(0.0);

        let change = finite(self.change).unwrap_or(if previous_close != 0.0 {
            price - previous_close
        } else {
            0.0
        });
        let change_percent = finite(self.change_percent).unwrap_or(if previous_close != 0.0 {
            change / previous_close * 100.0
        } else {
            0.0
        });

        Ok(Quote {
            ticker: ticker.to_string(),
            price,
            previous_close,
            open: finite(self.open).unwrap_or(0.0),
            day_high: finite(self.day_high).unwrap_or(0.0),
            day_low: finite(self.day_low).unwrap_or(0.0),
            volume: self.volume.unwrap_or(0),
            change,
            change_percent,
            market_cap: finite(self.market_cap),
            currency: self
                .currency
                .filter(|currency| !currency.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            last_updated: captured_at,
        })
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Server-to-client frame on the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Quote {
        ticker: String,
        data: Quote,
        timestamp: DateTime<Utc>,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
}

impl StreamMessage {
    pub fn quote(quote: &Quote) -> Self {
        StreamMessage::Quote {
            ticker: quote.ticker.clone(),
            data: quote.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn ping() -> Self {
        StreamMessage::Ping {
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTicker {
    #[error("ticker must not be empty")]
    Empty,
    #[error("ticker {0:?} is longer than {max} characters", max = MAX_TICKER_LEN)]
    TooLong(String),
    #[error("ticker {0:?} contains unsupported character {1:?}")]
    UnsupportedChar(String, char),
}

/// Trims and upper-cases a ticker symbol. Accepts ASCII alphanumerics plus
/// the `.`, `-`, `^` and `=` used by index, class-share and FX symbols.
pub fn normalize_ticker(raw: &str) -> Result<String, InvalidTicker> {
    let ticker = raw.trim().to_ascii_uppercase();
    if ticker.is_empty() {
        return Err(InvalidTicker::Empty);
    }
    if ticker.chars().count() > MAX_TICKER_LEN {
        return Err(InvalidTicker::TooLong(ticker));
    }
    if let Some(bad) = ticker
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '=')))
    {
        return Err(InvalidTicker::UnsupportedChar(ticker, bad));
    }
    Ok(ticker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(price: Option<f64>, previous_close: Option<f64>) -> RawQuote {
        RawQuote {
            price,
            previous_close,
            ..RawQuote::default()
        }
    }

    #[test]
    fn derives_change_from_previous_close() {
        let quote = raw(Some(110.0), Some(100.0))
            .into_quote("AAPL", Utc::now())
            .expect("valid quote");
        assert_eq!(quote.change, 10.0);
        assert!((quote.change_percent - 10.0).abs() < 1e-9);
        assert_eq!(quote.currency, "USD");
        assert_eq!(quote.market_cap, None);
    }

    #[test]
    fn keeps_upstream_change_when_present() {
        let mut payload = raw(Some(110.0), Some(100.0));
        payload.change = Some(3.0);
        payload.change_percent = Some(1.5);
        let quote = payload.into_quote("AAPL", Utc::now()).expect("valid quote");
        assert_eq!(quote.change, 3.0);
        assert_eq!(quote.change_percent, 1.5);
    }

    #[test]
    fn missing_or_nan_price_is_malformed() {
        assert!(matches!(
            raw(None, Some(1.0)).into_quote("AAPL", Utc::now()),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            raw(Some(f64::NAN), None).into_quote("AAPL", Utc::now()),
            Err(FetchError::Malformed(_))
        ));
    }

    #[test]
    fn zero_previous_close_does_not_divide() {
        let quote = raw(Some(5.0), Some(0.0))
            .into_quote("PENNY", Utc::now())
            .expect("valid quote");
        assert_eq!(quote.change, 0.0);
        assert_eq!(quote.change_percent, 0.0);
    }

    #[test]
    fn normalizes_and_validates_tickers() {
        assert_eq!(normalize_ticker(" aapl ").as_deref(), Ok("AAPL"));
        assert_eq!(normalize_ticker("brk.b").as_deref(), Ok("BRK.B"));
        assert_eq!(normalize_ticker("^gspc").as_deref(), Ok("^GSPC"));
        assert_eq!(normalize_ticker("   "), Err(InvalidTicker::Empty));
        assert!(matches!(
            normalize_ticker("AAPL;DROP"),
            Err(InvalidTicker::UnsupportedChar(_, ';'))
        ));
        assert!(matches!(
            normalize_ticker("ABCDEFGHIJKLMN"),
            Err(InvalidTicker::TooLong(_))
        ));
    }

    #[test]
    fn stream_message_is_tagged() {
        let quote = raw(Some(1.0), None)
            .into_quote("AAPL", Utc::now())
            .expect("valid quote");
        let value = serde_json::to_value(StreamMessage::quote(&quote)).expect("serialize");
        assert_eq!(value["type"], "quote");
        assert_eq!(value["ticker"], "AAPL");
        assert_eq!(value["data"]["price"], 1.0);
        assert!(value["data"]["market_cap"].is_null());
        assert!(value["timestamp"].is_string());
    }
}

//! GDAX (Coinbase Exchange) public candles adapter.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use braintrust_application::{Clock, MarketDataSource, RateLimitTracker};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::{
    Bar, Exchange, QuotaDefinition, RateLimitCategory, RateLimitInterval, Symbol,
};

use crate::exchange_http::{admit, get_json};

const DEFAULT_BASE_URL: &str = "https://api.pro.coinbase.com";
const GRANULARITY_SECONDS: i64 = 60;
const MAX_CANDLES: i64 = 300;
const REQUESTS_PER_SECOND: u64 = 3;

/// GDAX client guarded by a static request quota. Bars only.
#[derive(Debug, Clone)]
pub struct GdaxClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limits: Arc<RateLimitTracker>,
}

impl GdaxClient {
    /// Creates a client against the public API.
    pub fn new(http_client: reqwest::Client, clock: Arc<dyn Clock>) -> AppResult<Self> {
        Self::with_base_url(http_client, DEFAULT_BASE_URL, clock)
    }

    /// Creates a client against `base_url`.
    pub fn with_base_url(
        http_client: reqwest::Client,
        base_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let quota = QuotaDefinition::per(
            RateLimitCategory::Requests,
            RateLimitInterval::Second,
            REQUESTS_PER_SECOND,
        )?;

        Ok(Self {
            http_client,
            base_url: base_url.into(),
            rate_limits: Arc::new(RateLimitTracker::new([quota], clock)),
        })
    }

    /// Returns the tracker guarding this client.
    #[must_use]
    pub fn rate_limits(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limits
    }
}

#[async_trait]
impl MarketDataSource for GdaxClient {
    fn exchange(&self) -> Exchange {
        Exchange::Gdax
    }

    fn bars_page_span(&self) -> i64 {
        (MAX_CANDLES - 1) * GRANULARITY_SECONDS
    }

    fn bar_close_delay(&self) -> i64 {
        GRANULARITY_SECONDS
    }

    async fn fetch_bars(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        admit(
            &self.rate_limits,
            Exchange::Gdax,
            RateLimitCategory::Requests,
            1,
            "candles",
        )?;

        let url = format!("{}/products/{}/candles", self.base_url, symbol.as_str());
        let rows: Vec<CandlePayload> = get_json(
            &self.http_client,
            Exchange::Gdax,
            url.as_str(),
            &[
                ("start", iso_timestamp(start)?),
                ("end", iso_timestamp(end)?),
                ("granularity", GRANULARITY_SECONDS.to_string()),
            ],
        )
        .await?;

        Ok(bars_from_candles(symbol, rows))
    }
}

/// `[time, low, high, open, close, volume]`.
#[derive(Debug, Deserialize)]
struct CandlePayload(i64, f64, f64, f64, f64, f64);

fn iso_timestamp(ts: i64) -> AppResult<String> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or_else(|| AppError::Validation(format!("timestamp {ts} is out of range")))
}

/// Candles arrive newest first and are stamped with their start time.
fn bars_from_candles(symbol: &Symbol, rows: Vec<CandlePayload>) -> Vec<Bar> {
    let mut bars: Vec<Bar> = rows
        .into_iter()
        .map(|CandlePayload(ts, low, high, open, close, volume)| Bar {
            exchange: Exchange::Gdax,
            symbol: symbol.clone(),
            ts,
            open,
            high,
            low,
            close,
            volume,
        })
        .collect();
    bars.sort_by_key(|bar| bar.ts);
    bars
}

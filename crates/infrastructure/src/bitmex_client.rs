//! BitMEX public REST adapter for one-minute trade buckets and funding.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

use braintrust_application::{Clock, MarketDataSource, RateLimitTracker};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::{
    Bar, Exchange, FundingRate, QuotaDefinition, RateLimitCategory, RateLimitInterval, Symbol,
};

use crate::exchange_http::{admit, get_json};

const DEFAULT_BASE_URL: &str = "https://www.bitmex.com/api/v1";
const BUCKET_COUNT: u32 = 300;
const FUNDING_COUNT: u32 = 500;
const FUNDING_INTERVAL_SECONDS: i64 = 8 * 60 * 60;
const REQUESTS_PER_MINUTE: u64 = 30;

/// BitMEX client guarded by a static request quota.
#[derive(Debug, Clone)]
pub struct BitmexClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limits: Arc<RateLimitTracker>,
}

impl BitmexClient {
    /// Creates a client against the public API with the documented
    /// unauthenticated quota.
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
            RateLimitInterval::Minute,
            REQUESTS_PER_MINUTE,
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

    async fn trade_buckets(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        admit(
            &self.rate_limits,
            Exchange::Bitmex,
            RateLimitCategory::Requests,
            1,
            "trade buckets",
        )?;

        let url = format!("{}/trade/bucketed", self.base_url);
        let rows: Vec<TradeBucketPayload> = get_json(
            &self.http_client,
            Exchange::Bitmex,
            url.as_str(),
            &[
                ("binSize", "1m".to_owned()),
                ("symbol", symbol.as_str().to_owned()),
                ("count", BUCKET_COUNT.to_string()),
                ("reverse", "false".to_owned()),
                ("startTime", iso_timestamp(start)?),
                ("endTime", iso_timestamp(end)?),
            ],
        )
        .await?;

        bars_from_buckets(symbol, rows)
    }

    async fn funding(
        &self,
        symbol: &Symbol,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        admit(
            &self.rate_limits,
            Exchange::Bitmex,
            RateLimitCategory::Requests,
            1,
            "funding",
        )?;

        let url = format!("{}/funding", self.base_url);
        let rows: Vec<FundingPayload> = get_json(
            &self.http_client,
            Exchange::Bitmex,
            url.as_str(),
            &[
                ("symbol", symbol.as_str().to_owned()),
                ("count", FUNDING_COUNT.to_string()),
                ("reverse", "false".to_owned()),
                ("startTime", iso_timestamp(start)?),
                ("endTime", iso_timestamp(end)?),
            ],
        )
        .await?;

        funding_from_payload(symbol, rows)
    }
}

#[async_trait]
impl MarketDataSource for BitmexClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bitmex
    }

    fn bars_page_span(&self) -> i64 {
        i64::from(BUCKET_COUNT - 1) * 60
    }

    async fn fetch_bars(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        self.trade_buckets(symbol, start, end).await
    }

    fn funding_page_span(&self) -> Option<i64> {
        Some(i64::from(FUNDING_COUNT) * FUNDING_INTERVAL_SECONDS)
    }

    async fn fetch_funding_rates(
        &self,
        symbol: &Symbol,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        self.funding(symbol, start, end).await
    }
}

#[derive(Debug, Deserialize)]
struct TradeBucketPayload {
    timestamp: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingPayload {
    timestamp: String,
    funding_rate: f64,
}

fn iso_timestamp(ts: i64) -> AppResult<String> {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|value| value.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| AppError::Validation(format!("timestamp {ts} is out of range")))
}

fn parse_timestamp(value: &str) -> AppResult<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.timestamp())
        .map_err(|error| {
            AppError::Internal(format!("invalid bitmex timestamp '{value}': {error}"))
        })
}

/// Buckets without trades carry null prices and are skipped.
fn bars_from_buckets(symbol: &Symbol, rows: Vec<TradeBucketPayload>) -> AppResult<Vec<Bar>> {
    let mut bars = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(open), Some(high), Some(low), Some(close)) =
            (row.open, row.high, row.low, row.close)
        else {
            continue;
        };

        bars.push(Bar {
            exchange: Exchange::Bitmex,
            symbol: symbol.clone(),
            ts: parse_timestamp(row.timestamp.as_str())?,
            open,
            high,
            low,
            close,
            volume: row.volume.unwrap_or_default(),
        });
    }

    Ok(bars)
}

fn funding_from_payload(
    symbol: &Symbol,
    rows: Vec<FundingPayload>,
) -> AppResult<Vec<FundingRate>> {
    rows.into_iter()
        .map(|row| {
            Ok(FundingRate {
                exchange: Exchange::Bitmex,
                symbol: symbol.clone(),
                ts: parse_timestamp(row.timestamp.as_str())?,
                rate: row.funding_rate,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use braintrust_application::MarketDataSource;
    use braintrust_core::AppError;
    use braintrust_domain::{Exchange, RateLimitCategory, Symbol};

    use crate::test_support::FixedClock;

    use super::{
        BitmexClient, FundingPayload, TradeBucketPayload, bars_from_buckets, funding_from_payload,
        iso_timestamp,
    };

    fn symbol() -> Symbol {
        match Symbol::new("XBTUSD") {
            Ok(symbol) => symbol,
            Err(error) => panic!("invalid test symbol: {error}"),
        }
    }

    #[test]
    fn start_time_is_iso_with_millis() {
        assert!(matches!(
            iso_timestamp(1_546_300_800).as_deref(),
            Ok("2019-01-01T00:00:00.000Z")
        ));
    }

    #[test]
    fn buckets_without_trades_are_skipped() {
        let rows = serde_json::from_str::<Vec<TradeBucketPayload>>(
            r#"[
                {"timestamp": "2019-01-01T00:01:00.000Z", "symbol": "XBTUSD",
                 "open": 3801.5, "high": 3803, "low": 3801, "close": 3802.5,
                 "trades": 40, "volume": 125000, "vwap": 3802.1},
                {"timestamp": "2019-01-01T00:02:00.000Z", "symbol": "XBTUSD",
                 "open": null, "high": null, "low": null, "close": null,
                 "trades": 0, "volume": 0, "vwap": null}
            ]"#,
        );
        assert!(rows.is_ok());

        let bars = bars_from_buckets(&symbol(), rows.unwrap_or_else(|_| unreachable!()));
        assert!(bars.is_ok());
        let bars = bars.unwrap_or_else(|_| unreachable!());

        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].ts, 1_546_300_860);
        assert_eq!(bars[0].high, 3803.0);
        assert_eq!(bars[0].volume, 125_000.0);
        assert_eq!(bars[0].exchange, Exchange::Bitmex);
    }

    #[test]
    fn funding_rows_are_parsed() {
        let rows = serde_json::from_str::<Vec<FundingPayload>>(
            r#"[
                {"timestamp": "2019-01-01T04:00:00.000Z", "symbol": "XBTUSD",
                 "fundingInterval": "2000-01-01T08:00:00.000Z",
                 "fundingRate": -0.000134, "fundingRateDaily": -0.000402}
            ]"#,
        );
        assert!(rows.is_ok());

        let rates = funding_from_payload(&symbol(), rows.unwrap_or_else(|_| unreachable!()));
        assert!(rates.is_ok());
        let rates = rates.unwrap_or_else(|_| unreachable!());

        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].ts, 1_546_315_200);
        assert_eq!(rates[0].rate, -0.000134);
    }

    #[tokio::test]
    async fn requests_beyond_static_quota_are_refused_locally() {
        let client = BitmexClient::with_base_url(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Arc::new(FixedClock(1_546_318_800)),
        );
        assert!(client.is_ok());
        let client = client.unwrap_or_else(|_| unreachable!());

        for _ in 0..30 {
            assert!(matches!(
                client.rate_limits().try_consume(RateLimitCategory::Requests, 1),
                Ok(true)
            ));
        }

        let result = client.fetch_bars(&symbol(), 1_546_300_800, 1_546_318_740).await;
        assert!(matches!(result, Err(AppError::RateLimited(_))));
    }
}

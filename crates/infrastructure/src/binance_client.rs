//! Binance spot and USD-M futures REST adapter.

mod book_ticker;
mod payload;


use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use braintrust_application::{Clock, MarketDataSource, RateLimitTracker};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Bar, Exchange, FundingRate, RateLimitCategory, Symbol};

use crate::exchange_http::{admit, get_json};

pub use book_ticker::BookTickerPoller;

use payload::{
    BookTickerResponse, ExchangeInfoPayload, FundingRatePayload, KlinePayload,
    MarketSummaryPayload, OrderBookPayload, bars_from_klines, book_quotes_from_payload,
    funding_rates_from_payload, market_summaries_from_payload, order_book_from_payload,
    quota_definitions, symbol_infos,
};

const SPOT_KLINE_LIMIT: u32 = 500;
const FUTURES_KLINE_LIMIT: u32 = 1500;
const FUNDING_LIMIT: u32 = 1000;
const FUNDING_INTERVAL_SECONDS: i64 = 8 * 60 * 60;
const MAX_SERVER_TIME_OFFSET_MS: i64 = 4_000;
const ORDER_BOOK_LIMITS: [u32; 7] = [5, 10, 20, 50, 100, 500, 1000];

/// Base URLs of the Binance REST APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinanceEndpoints {
    /// Spot API root, e.g. `https://api.binance.com`.
    pub spot_base_url: String,
    /// USD-M futures API root, e.g. `https://fapi.binance.com`.
    pub futures_base_url: String,
}

impl Default for BinanceEndpoints {
    fn default() -> Self {
        Self {
            spot_base_url: "https://api.binance.com".to_owned(),
            futures_base_url: "https://fapi.binance.com".to_owned(),
        }
    }
}

/// Trading rules of one spot symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    /// Exchange symbol, e.g. `ETHBTC`.
    pub symbol: String,
    /// Base asset, e.g. `ETH`.
    pub base_asset: String,
    /// Quote asset, e.g. `BTC`.
    pub quote_asset: String,
    /// Decimal precision of quote amounts.
    pub quote_precision: u32,
    /// Minimum order quantity from the `LOT_SIZE` filter.
    pub min_qty: Option<f64>,
    /// Minimum order value from the `MIN_NOTIONAL` or `NOTIONAL` filter.
    pub min_notional: Option<f64>,
}

/// Order book snapshot as `(price, quantity)` levels.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBook {
    /// Book sequence number.
    pub last_update_id: u64,
    /// Bid levels, best (highest) first.
    pub bids: Vec<(f64, f64)>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<(f64, f64)>,
}

/// Best bid and ask of one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookQuote {
    /// Best bid price.
    pub bid_price: f64,
    /// Quantity at the best bid.
    pub bid_qty: f64,
    /// Best ask price.
    pub ask_price: f64,
    /// Quantity at the best ask.
    pub ask_qty: f64,
    /// Local receive time in epoch seconds.
    pub received_at: i64,
}

/// Rolling 24 hour statistics of one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSummary {
    /// Exchange symbol.
    pub symbol: String,
    /// Last traded price.
    pub last_price: f64,
    /// Price change over the window in percent.
    pub price_change_percent: f64,
    /// Highest price in the window.
    pub high_price: f64,
    /// Lowest price in the window.
    pub low_price: f64,
    /// Base asset volume.
    pub volume: f64,
    /// Quote asset volume.
    pub quote_volume: f64,
    /// Window start in epoch seconds.
    pub open_time: i64,
    /// Window end in epoch seconds.
    pub close_time: i64,
    /// Number of trades.
    pub trade_count: u64,
}

/// Binance REST client sharing one request-weight tracker across spot and
/// futures calls.
pub struct BinanceClient {
    http_client: reqwest::Client,
    endpoints: BinanceEndpoints,
    rate_limits: Arc<RateLimitTracker>,
    clock: Arc<dyn Clock>,
    symbols: HashMap<String, SymbolInfo>,
}

impl BinanceClient {
    /// Loads exchange info and builds the client from the published rate
    /// limits and symbol rules.
    ///
    /// Fails when the local clock is more than four seconds away from the
    /// server clock.
    pub async fn connect(
        http_client: reqwest::Client,
        endpoints: BinanceEndpoints,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let url = format!("{}/api/v3/exchangeInfo", endpoints.spot_base_url);
        let exchange_info: ExchangeInfoPayload =
            get_json(&http_client, Exchange::Binance, url.as_str(), &[]).await?;

        let offset_ms = exchange_info.server_time - clock.now().timestamp_millis();
        if offset_ms.abs() > MAX_SERVER_TIME_OFFSET_MS {
            return Err(AppError::Internal(format!(
                "local clock is {offset_ms} ms away from binance server time"
            )));
        }

        let definitions = quota_definitions(&exchange_info.rate_limits)?;
        let symbols = symbol_infos(&exchange_info.symbols);
        info!(
            quotas = definitions.len(),
            symbols = symbols.len(),
            server_time_offset_ms = offset_ms,
            "loaded binance exchange info"
        );

        Ok(Self::from_parts(
            http_client,
            endpoints,
            Arc::new(RateLimitTracker::new(definitions, clock.clone())),
            clock,
            symbols,
        ))
    }

    /// Builds a client from an existing tracker and symbol table.
    #[must_use]
    pub fn from_parts(
        http_client: reqwest::Client,
        endpoints: BinanceEndpoints,
        rate_limits: Arc<RateLimitTracker>,
        clock: Arc<dyn Clock>,
        symbols: Vec<SymbolInfo>,
    ) -> Self {
        Self {
            http_client,
            endpoints,
            rate_limits,
            clock,
            symbols: symbols
                .into_iter()
                .map(|info| (info.symbol.clone(), info))
                .collect(),
        }
    }

    /// Returns the tracker guarding this client.
    #[must_use]
    pub fn rate_limits(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limits
    }

    /// Returns the trading rules of `symbol`.
    pub fn symbol_info(&self, symbol: &Symbol) -> AppResult<&SymbolInfo> {
        self.symbols.get(symbol.as_str()).ok_or_else(|| {
            AppError::NotFound(format!("binance symbol '{symbol}' is not listed"))
        })
    }

    /// Fetches an order book snapshot.
    ///
    /// `limit` must be one of 5, 10, 20, 50, 100, 500 or 1000.
    pub async fn order_book(&self, symbol: &Symbol, limit: u32) -> AppResult<OrderBook> {
        let weight = order_book_weight(limit)?;
        admit(
            &self.rate_limits,
            Exchange::Binance,
            RateLimitCategory::Requests,
            weight,
            "order book",
        )?;

        let url = format!("{}/api/v3/depth", self.endpoints.spot_base_url);
        let payload: OrderBookPayload = get_json(
            &self.http_client,
            Exchange::Binance,
            url.as_str(),
            &[
                ("symbol", symbol.as_str().to_owned()),
                ("limit", limit.to_string()),
            ],
        )
        .await?;

        order_book_from_payload(payload)
    }

    /// Fetches best bid and ask quotes for `symbol`, or for every symbol
    /// when `symbol` is `None`. Weighs 1 either way.
    pub async fn book_ticker(
        &self,
        symbol: Option<&Symbol>,
    ) -> AppResult<HashMap<String, BookQuote>> {
        admit(
            &self.rate_limits,
            Exchange::Binance,
            RateLimitCategory::Requests,
            1,
            "book ticker",
        )?;

        let url = format!("{}/api/v3/ticker/bookTicker", self.endpoints.spot_base_url);
        let query: Vec<(&str, String)> = symbol
            .map(|symbol| ("symbol", symbol.as_str().to_owned()))
            .into_iter()
            .collect();
        let payload: BookTickerResponse =
            get_json(&self.http_client, Exchange::Binance, url.as_str(), &query).await?;

        book_quotes_from_payload(payload, self.clock.now().timestamp())
    }

    /// Fetches 24 hour statistics of every listed symbol.
    ///
    /// The weight depends on the number of symbols returned, so it is
    /// recorded once the response has arrived. A response that overdraws
    /// the quota is still returned; later calls are refused until the
    /// window drains.
    pub async fn market_summaries(&self) -> AppResult<Vec<MarketSummary>> {
        let url = format!("{}/api/v3/ticker/24hr", self.endpoints.spot_base_url);
        let rows: Vec<MarketSummaryPayload> =
            get_json(&self.http_client, Exchange::Binance, url.as_str(), &[]).await?;

        let weight = market_summaries_weight(rows.len());
        if !self
            .rate_limits
            .try_consume(RateLimitCategory::Requests, weight)?
        {
            warn!(weight, "binance market summaries overdrew the request quota");
        }

        market_summaries_from_payload(rows)
    }

    /// Fetches spot one-minute bars opening between `start` and `end`.
    pub async fn klines(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        admit(
            &self.rate_limits,
            Exchange::Binance,
            RateLimitCategory::Requests,
            1,
            "klines",
        )?;

        let url = format!("{}/api/v3/klines", self.endpoints.spot_base_url);
        let rows: Vec<KlinePayload> = get_json(
            &self.http_client,
            Exchange::Binance,
            url.as_str(),
            &[
                ("symbol", symbol.as_str().to_owned()),
                ("interval", "1m".to_owned()),
                ("startTime", start.saturating_mul(1_000).to_string()),
                ("endTime", end.saturating_mul(1_000).to_string()),
                ("limit", SPOT_KLINE_LIMIT.to_string()),
            ],
        )
        .await?;

        bars_from_klines(Exchange::Binance, symbol, rows)
    }

    /// Fetches up to 1500 futures one-minute bars opening at or after
    /// `start`.
    pub async fn futures_klines(&self, symbol: &Symbol, start: i64) -> AppResult<Vec<Bar>> {
        admit(
            &self.rate_limits,
            Exchange::BinanceFutures,
            RateLimitCategory::Requests,
            1,
            "futures klines",
        )?;

        let url = format!("{}/fapi/v1/klines", self.endpoints.futures_base_url);
        let rows: Vec<KlinePayload> = get_json(
            &self.http_client,
            Exchange::BinanceFutures,
            url.as_str(),
            &[
                ("symbol", symbol.as_str().to_owned()),
                ("interval", "1m".to_owned()),
                ("startTime", start.saturating_mul(1_000).to_string()),
                ("limit", FUTURES_KLINE_LIMIT.to_string()),
            ],
        )
        .await?;

        bars_from_klines(Exchange::BinanceFutures, symbol, rows)
    }

    /// Fetches perpetual funding rates between `start` and `end`.
    pub async fn funding_rate_history(
        &self,
        symbol: &Symbol,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        admit(
            &self.rate_limits,
            Exchange::BinanceFutures,
            RateLimitCategory::Requests,
            1,
            "funding rate history",
        )?;

        let url = format!("{}/fapi/v1/fundingRate", self.endpoints.futures_base_url);
        let rows: Vec<FundingRatePayload> = get_json(
            &self.http_client,
            Exchange::BinanceFutures,
            url.as_str(),
            &[
                ("symbol", symbol.as_str().to_owned()),
                ("startTime", start.saturating_mul(1_000).to_string()),
                ("endTime", end.saturating_mul(1_000).to_string()),
                ("limit", FUNDING_LIMIT.to_string()),
            ],
        )
        .await?;

        funding_rates_from_payload(symbol, rows)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BinanceClient")
            .field("endpoints", &self.endpoints)
            .field("rate_limits", &self.rate_limits)
            .field("symbols", &self.symbols.len())
            .finish_non_exhaustive()
    }
}

fn market_summaries_weight(rows: usize) -> u64 {
    u64::try_from(rows / 2).unwrap_or(u64::MAX).max(1)
}

fn order_book_weight(limit: u32) -> AppResult<u64> {
    if !ORDER_BOOK_LIMITS.contains(&limit) {
        warn!(limit, "rejected order book limit");
        return Err(AppError::Validation(format!(
            "order book limit must be one of {ORDER_BOOK_LIMITS:?}, got {limit}"
        )));
    }

    Ok(match limit {
        1000 => 10,
        500 => 5,
        _ => 1,
    })
}

/// Spot bar source backed by [`BinanceClient::klines`].
#[derive(Debug, Clone)]
pub struct BinanceSpotSource {
    client: Arc<BinanceClient>,
}

impl BinanceSpotSource {
    /// Creates a spot source.
    #[must_use]
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for BinanceSpotSource {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn bars_page_span(&self) -> i64 {
        i64::from(SPOT_KLINE_LIMIT - 1) * 60
    }

    async fn fetch_bars(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        self.client.klines(symbol, start, end).await
    }
}

/// Futures bar and funding source backed by the futures endpoints.
#[derive(Debug, Clone)]
pub struct BinanceFuturesSource {
    client: Arc<BinanceClient>,
}

impl BinanceFuturesSource {
    /// Creates a futures source.
    #[must_use]
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MarketDataSource for BinanceFuturesSource {
    fn exchange(&self) -> Exchange {
        Exchange::BinanceFutures
    }

    fn bars_page_span(&self) -> i64 {
        i64::from(FUTURES_KLINE_LIMIT - 1) * 60
    }

    async fn fetch_bars(&self, symbol: &Symbol, start: i64, _end: i64) -> AppResult<Vec<Bar>> {
        self.client.futures_klines(symbol, start).await
    }

    fn funding_page_span(&self) -> Option<i64> {
        Some(i64::from(FUNDING_LIMIT) * FUNDING_INTERVAL_SECONDS)
    }

    async fn fetch_funding_rates(
        &self,
        symbol: &Symbol,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        self.client.funding_rate_history(symbol, start, end).await
    }
}

use std::collections::HashMap;

use serde::Deserialize;
use serde::de::IgnoredAny;
use tracing::info;

use braintrust_core::AppResult;
use braintrust_domain::{
    Bar, Exchange, FundingRate, QuotaDefinition, RateLimitCategory, RateLimitInterval, Symbol,
};

use crate::exchange_http::{millis_to_seconds, parse_decimal};

use super::{BookQuote, MarketSummary, OrderBook, SymbolInfo};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ExchangeInfoPayload {
    pub(super) server_time: i64,
    #[serde(default)]
    pub(super) rate_limits: Vec<RateLimitPayload>,
    #[serde(default)]
    pub(super) symbols: Vec<SymbolPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RateLimitPayload {
    rate_limit_type: String,
    interval: String,
    #[serde(default = "default_interval_num")]
    interval_num: u32,
    limit: u64,
}

fn default_interval_num() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SymbolPayload {
    symbol: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    quote_precision: u32,
    #[serde(default)]
    filters: Vec<SymbolFilterPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolFilterPayload {
    filter_type: String,
    min_qty: Option<String>,
    min_notional: Option<String>,
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`.
#[derive(Debug, Deserialize)]
pub(super) struct KlinePayload(
    IgnoredAny,
    String,
    String,
    String,
    String,
    String,
    i64,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FundingRatePayload {
    funding_time: i64,
    funding_rate: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OrderBookPayload {
    last_update_id: u64,
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BookTickerPayload {
    symbol: String,
    bid_price: String,
    bid_qty: String,
    ask_price: String,
    ask_qty: String,
}

/// A single object when a symbol is requested, a list otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum BookTickerResponse {
    One(BookTickerPayload),
    Many(Vec<BookTickerPayload>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MarketSummaryPayload {
    symbol: String,
    last_price: String,
    price_change_percent: String,
    high_price: String,
    low_price: String,
    volume: String,
    quote_volume: String,
    open_time: i64,
    close_time: i64,
    #[serde(default)]
    count: u64,
}

/// Maps published rate limits to quota definitions, skipping types the
/// tracker has no category for.
pub(super) fn quota_definitions(
    rate_limits: &[RateLimitPayload],
) -> AppResult<Vec<QuotaDefinition>> {
    let mut definitions = Vec::with_capacity(rate_limits.len());
    for rate_limit in rate_limits {
        let Some(category) = RateLimitCategory::from_wire(rate_limit.rate_limit_type.as_str())
        else {
            info!(
                rate_limit_type = rate_limit.rate_limit_type.as_str(),
                "skipping untracked binance rate limit"
            );
            continue;
        };

        let interval = rate_limit.interval.parse::<RateLimitInterval>()?;
        definitions.push(QuotaDefinition::new(
            category,
            interval,
            rate_limit.interval_num,
            rate_limit.limit,
        )?);
    }

    Ok(definitions)
}

pub(super) fn symbol_infos(symbols: &[SymbolPayload]) -> Vec<SymbolInfo> {
    symbols
        .iter()
        .map(|payload| SymbolInfo {
            symbol: payload.symbol.clone(),
            base_asset: payload.base_asset.clone(),
            quote_asset: payload.quote_asset.clone(),
            quote_precision: payload.quote_precision,
            min_qty: payload
                .filters
                .iter()
                .filter(|filter| filter.filter_type == "LOT_SIZE")
                .find_map(|filter| filter.min_qty.as_deref())
                .and_then(parse_filter_value),
            min_notional: payload
                .filters
                .iter()
                .filter(|filter| {
                    matches!(filter.filter_type.as_str(), "MIN_NOTIONAL" | "NOTIONAL")
                })
                .find_map(|filter| filter.min_notional.as_deref())
                .and_then(parse_filter_value),
        })
        .collect()
}

fn parse_filter_value(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok()
}

/// Bars are stamped with the close time rounded to the nearest second.
pub(super) fn bars_from_klines(
    exchange: Exchange,
    symbol: &Symbol,
    rows: Vec<KlinePayload>,
) -> AppResult<Vec<Bar>> {
    rows.into_iter()
        .map(|row| {
            Ok(Bar {
                exchange,
                symbol: symbol.clone(),
                ts: millis_to_seconds(row.6),
                open: parse_decimal(row.1.as_str(), "open", exchange)?,
                high: parse_decimal(row.2.as_str(), "high", exchange)?,
                low: parse_decimal(row.3.as_str(), "low", exchange)?,
                close: parse_decimal(row.4.as_str(), "close", exchange)?,
                volume: parse_decimal(row.5.as_str(), "volume", exchange)?,
            })
        })
        .collect()
}

pub(super) fn funding_rates_from_payload(
    symbol: &Symbol,
    rows: Vec<FundingRatePayload>,
) -> AppResult<Vec<FundingRate>> {
    rows.into_iter()
        .map(|row| {
            Ok(FundingRate {
                exchange: Exchange::BinanceFutures,
                symbol: symbol.clone(),
                ts: millis_to_seconds(row.funding_time),
                rate: parse_decimal(
                    row.funding_rate.as_str(),
                    "fundingRate",
                    Exchange::BinanceFutures,
                )?,
            })
        })
        .collect()
}

pub(super) fn order_book_from_payload(payload: OrderBookPayload) -> AppResult<OrderBook> {
    let levels = |rows: Vec<(String, String)>| -> AppResult<Vec<(f64, f64)>> {
        rows.into_iter()
            .map(|(price, quantity)| {
                Ok((
                    parse_decimal(price.as_str(), "price", Exchange::Binance)?,
                    parse_decimal(quantity.as_str(), "quantity", Exchange::Binance)?,
                ))
            })
            .collect()
    };

    let mut bids = levels(payload.bids)?;
    let mut asks = levels(payload.asks)?;
    bids.sort_by(|left, right| right.0.total_cmp(&left.0));
    asks.sort_by(|left, right| left.0.total_cmp(&right.0));

    Ok(OrderBook {
        last_update_id: payload.last_update_id,
        bids,
        asks,
    })
}

pub(super) fn book_quotes_from_payload(
    payload: BookTickerResponse,
    received_at: i64,
) -> AppResult<HashMap<String, BookQuote>> {
    let rows = match payload {
        BookTickerResponse::One(row) => vec![row],
        BookTickerResponse::Many(rows) => rows,
    };

    rows.into_iter()
        .map(|row| {
            let quote = BookQuote {
                bid_price: parse_decimal(row.bid_price.as_str(), "bidPrice", Exchange::Binance)?,
                bid_qty: parse_decimal(row.bid_qty.as_str(), "bidQty", Exchange::Binance)?,
                ask_price: parse_decimal(row.ask_price.as_str(), "askPrice", Exchange::Binance)?,
                ask_qty: parse_decimal(row.ask_qty.as_str(), "askQty", Exchange::Binance)?,
                received_at,
            };
            Ok((row.symbol, quote))
        })
        .collect()
}

pub(super) fn market_summaries_from_payload(
    rows: Vec<MarketSummaryPayload>,
) -> AppResult<Vec<MarketSummary>> {
    let exchange = Exchange::Binance;
    rows.into_iter()
        .map(|row| {
            Ok(MarketSummary {
                last_price: parse_decimal(row.last_price.as_str(), "lastPrice", exchange)?,
                price_change_percent: parse_decimal(
                    row.price_change_percent.as_str(),
                    "priceChangePercent",
                    exchange,
                )?,
                high_price: parse_decimal(row.high_price.as_str(), "highPrice", exchange)?,
                low_price: parse_decimal(row.low_price.as_str(), "lowPrice", exchange)?,
                volume: parse_decimal(row.volume.as_str(), "volume", exchange)?,
                quote_volume: parse_decimal(row.quote_volume.as_str(), "quoteVolume", exchange)?,
                open_time: millis_to_seconds(row.open_time),
                close_time: millis_to_seconds(row.close_time),
                trade_count: row.count,
                symbol: row.symbol,
            })
        })
        .collect()
}

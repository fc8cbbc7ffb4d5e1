//! Market data rows persisted by the fetcher.

use std::str::FromStr;

use braintrust_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Exchange venue a row was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    /// Binance spot market.
    Binance,
    /// Binance USD-M perpetual futures.
    BinanceFutures,
    /// BitMEX derivatives.
    Bitmex,
    /// GDAX, now Coinbase Exchange.
    Gdax,
}

impl Exchange {
    /// Returns the stored exchange tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::BinanceFutures => "binfut",
            Self::Bitmex => "bitmex",
            Self::Gdax => "gdax",
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "binance" => Ok(Self::Binance),
            "binfut" => Ok(Self::BinanceFutures),
            "bitmex" => Ok(Self::Bitmex),
            "gdax" => Ok(Self::Gdax),
            _ => Err(AppError::Validation(format!(
                "unknown exchange '{value}'"
            ))),
        }
    }
}

/// Exchange instrument symbol such as `ETHBTC`, `XBTUSD` or `ETH-USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Longest symbol accepted by the storage schema.
    pub const MAX_LENGTH: usize = 16;

    /// Creates a validated symbol.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(AppError::Validation("symbol must not be empty".to_owned()));
        }

        if trimmed.len() > Self::MAX_LENGTH || trimmed.chars().any(char::is_whitespace) {
            return Err(AppError::Validation(format!(
                "invalid symbol '{value}': expected at most {} non-whitespace characters",
                Self::MAX_LENGTH
            )));
        }

        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the symbol as sent to the exchange.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// One OHLCV price bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Venue the bar came from.
    pub exchange: Exchange,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Bar timestamp in UTC epoch seconds.
    pub ts: i64,
    /// Opening price.
    pub open: f64,
    /// Highest traded price.
    pub high: f64,
    /// Lowest traded price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded base volume.
    pub volume: f64,
}

/// One perpetual funding rate observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    /// Venue the rate came from.
    pub exchange: Exchange,
    /// Instrument symbol.
    pub symbol: Symbol,
    /// Funding timestamp in UTC epoch seconds.
    pub ts: i64,
    /// Funding rate as a fraction, e.g. `0.0001`.
    pub rate: f64,
}

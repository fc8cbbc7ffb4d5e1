use std::env;
use std::time::Duration;

use braintrust_application::{BackfillConfig, DEFAULT_BACKFILL_START};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::Symbol;
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct FetcherConfig {
    pub(crate) database_url: String,
    pub(crate) binance_api_url: String,
    pub(crate) binance_futures_api_url: String,
    pub(crate) bitmex_api_url: String,
    pub(crate) gdax_api_url: String,
    pub(crate) binance_symbols: Vec<Symbol>,
    pub(crate) binance_futures_symbols: Vec<Symbol>,
    pub(crate) binance_funding_symbols: Vec<Symbol>,
    pub(crate) bitmex_symbols: Vec<Symbol>,
    pub(crate) bitmex_funding_symbols: Vec<Symbol>,
    pub(crate) gdax_symbols: Vec<Symbol>,
    pub(crate) page_delay_ms: u64,
    pub(crate) throttle_backoff_ms: u64,
    pub(crate) max_throttle_retries: u32,
    pub(crate) poll_interval_secs: u64,
    pub(crate) binance_book_ticker_rpm: u32,
}

impl FetcherConfig {
    pub(crate) fn load() -> AppResult<Self> {
        let database_url = required_env("DATABASE_URL")?;
        let binance_api_url = env_base_url("FETCH_BINANCE_API_URL", "https://api.binance.com")?;
        let binance_futures_api_url =
            env_base_url("FETCH_BINANCE_FUTURES_API_URL", "https://fapi.binance.com")?;
        let bitmex_api_url =
            env_base_url("FETCH_BITMEX_API_URL", "https://www.bitmex.com/api/v1")?;
        let gdax_api_url = env_base_url("FETCH_GDAX_API_URL", "https://api.pro.coinbase.com")?;
        let poll_interval_secs = parse_env_u64("FETCH_POLL_INTERVAL_SECS", 300)?;

        if poll_interval_secs == 0 {
            return Err(AppError::Validation(
                "FETCH_POLL_INTERVAL_SECS must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            binance_api_url,
            binance_futures_api_url,
            bitmex_api_url,
            gdax_api_url,
            binance_symbols: env_symbols(
                "FETCH_BINANCE_SYMBOLS",
                "ETHBTC,XRPBTC,LTCBTC,ADABTC",
            )?,
            binance_futures_symbols: env_symbols("FETCH_BINANCE_FUTURES_SYMBOLS", "BTCUSDT")?,
            binance_funding_symbols: env_symbols("FETCH_BINANCE_FUNDING_SYMBOLS", "BTCUSDT")?,
            bitmex_symbols: env_symbols("FETCH_BITMEX_SYMBOLS", "XBTUSD")?,
            bitmex_funding_symbols: env_symbols("FETCH_BITMEX_FUNDING_SYMBOLS", "XBTUSD")?,
            gdax_symbols: env_symbols("FETCH_GDAX_SYMBOLS", "ETH-USD")?,
            page_delay_ms: parse_env_u64("FETCH_PAGE_DELAY_MS", 2_000)?,
            throttle_backoff_ms: parse_env_u64("FETCH_THROTTLE_BACKOFF_MS", 5_000)?,
            max_throttle_retries: parse_env_u32("FETCH_MAX_THROTTLE_RETRIES", 5)?,
            poll_interval_secs,
            binance_book_ticker_rpm: parse_env_u32("FETCH_BINANCE_BOOK_TICKER_RPM", 0)?,
        })
    }

    pub(crate) fn backfill_config(&self) -> BackfillConfig {
        BackfillConfig::new(
            DEFAULT_BACKFILL_START,
            Duration::from_millis(self.page_delay_ms),
            Duration::from_millis(self.throttle_backoff_ms),
            self.max_throttle_retries,
        )
    }

    pub(crate) fn uses_binance(&self) -> bool {
        !(self.binance_symbols.is_empty()
            && self.binance_futures_symbols.is_empty()
            && self.binance_funding_symbols.is_empty())
    }
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn env_symbols(name: &str, default: &str) -> AppResult<Vec<Symbol>> {
    let value = env::var(name).unwrap_or_else(|_| default.to_owned());
    parse_symbol_list(name, value.as_str())
}

fn env_base_url(name: &str, default: &str) -> AppResult<String> {
    let value = env::var(name).unwrap_or_else(|_| default.to_owned());
    parse_base_url(name, value.as_str())
}

/// Comma separated, blanks ignored; an empty list disables the job.
fn parse_symbol_list(name: &str, value: &str) -> AppResult<Vec<Symbol>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|symbol| !symbol.is_empty())
        .map(|symbol| {
            Symbol::new(symbol)
                .map_err(|error| AppError::Validation(format!("invalid {name} entry: {error}")))
        })
        .collect()
}

fn parse_base_url(name: &str, value: &str) -> AppResult<String> {
    let parsed = Url::parse(value.trim())
        .map_err(|error| AppError::Validation(format!("invalid {name}: {error}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "{name} must use http or https, got '{}'",
            parsed.scheme()
        )));
    }

    Ok(value.trim().trim_end_matches('/').to_owned())
}

fn parse_env_u32(name: &str, default: u32) -> AppResult<u32> {
    match env::var(name) {
        Ok(value) => value.parse::<u32>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

use async_trait::async_trait;

use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Bar, Exchange, FundingRate, Symbol};

/// Exchange port used by backfill jobs.
///
/// Implementations consult their rate-limit tracker before each network
/// call and return `AppError::RateLimited` instead of calling when it
/// refuses.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Returns the venue rows are tagged with.
    fn exchange(&self) -> Exchange;

    /// Returns the widest time span, in seconds, one bar request covers.
    fn bars_page_span(&self) -> i64;

    /// Returns the seconds between a bar's timestamp and the end of its
    /// minute: 0 for venues stamping bars with their close, 60 for venues
    /// stamping them with their open.
    fn bar_close_delay(&self) -> i64 {
        0
    }

    /// Fetches one-minute bars starting at `start`, bounded by `end`
    /// when the venue honours an end bound. Both are UTC epoch seconds.
    async fn fetch_bars(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>>;

    /// Returns the widest time span one funding request covers, or `None`
    /// when the venue has no funding history.
    fn funding_page_span(&self) -> Option<i64> {
        None
    }

    /// Fetches funding rates between `start` and `end`.
    async fn fetch_funding_rates(
        &self,
        symbol: &Symbol,
        _start: i64,
        _end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        Err(AppError::Validation(format!(
            "{} does not publish funding rates for {symbol}",
            self.exchange()
        )))
    }
}

/// Earliest and latest stored timestamps for one exchange and symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRange {
    /// Earliest stored timestamp.
    pub earliest: i64,
    /// Latest stored timestamp.
    pub latest: i64,
}

/// Read query over stored rows. Both bounds are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketDataQuery {
    /// Venue filter.
    pub exchange: Exchange,
    /// Symbol filter.
    pub symbol: Symbol,
    /// Lower exclusive timestamp bound.
    pub from: i64,
    /// Upper exclusive timestamp bound.
    pub to: i64,
}

/// Repository port for persisted bars and funding rates.
#[async_trait]
pub trait MarketDataRepository: Send + Sync {
    /// Returns the stored bar range, or `None` when no bar is stored.
    async fn bar_range(&self, exchange: Exchange, symbol: &Symbol)
    -> AppResult<Option<StoredRange>>;

    /// Returns the stored funding range, or `None` when no rate is stored.
    async fn funding_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>>;

    /// Inserts bars, ignoring rows already stored for the same timestamp.
    /// Returns the number of new rows.
    async fn insert_bars(&self, bars: &[Bar]) -> AppResult<u64>;

    /// Inserts funding rates, ignoring rows already stored for the same
    /// timestamp. Returns the number of new rows.
    async fn insert_funding_rates(&self, rates: &[FundingRate]) -> AppResult<u64>;

    /// Lists bars matching the query ordered by timestamp.
    async fn list_bars(&self, query: &MarketDataQuery) -> AppResult<Vec<Bar>>;

    /// Lists funding rates matching the query ordered by timestamp.
    async fn list_funding_rates(&self, query: &MarketDataQuery) -> AppResult<Vec<FundingRate>>;
}

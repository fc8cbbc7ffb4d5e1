//! Incremental download of bars and funding rates into the repository.
//!
//! Each job resumes from the latest stored timestamp, walks forward in pages
//! sized by the source and stops one second before "now". Bars whose minute
//! has not closed by then are left for the next run.

mod config;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Exchange, Symbol};

use crate::clock::Clock;
use crate::market_data_ports::{MarketDataRepository, MarketDataSource};

pub use config::{BackfillConfig, DEFAULT_BACKFILL_START};

/// Outcome of one backfill job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    /// Venue the job ran against.
    pub exchange: Exchange,
    /// Symbol the job downloaded.
    pub symbol: Symbol,
    /// Pages requested successfully.
    pub pages: u32,
    /// Rows returned by the source.
    pub rows_fetched: u64,
    /// Rows that were new to the repository.
    pub rows_inserted: u64,
    /// Pages retried after the source was throttled.
    pub throttled_retries: u32,
    /// Timestamp the next job resumes from.
    pub cursor: i64,
}

impl BackfillReport {
    fn new(exchange: Exchange, symbol: &Symbol, cursor: i64) -> Self {
        Self {
            exchange,
            symbol: symbol.clone(),
            pages: 0,
            rows_fetched: 0,
            rows_inserted: 0,
            throttled_retries: 0,
            cursor,
        }
    }
}

/// Application service running backfill jobs.
#[derive(Clone)]
pub struct BackfillService {
    repository: Arc<dyn MarketDataRepository>,
    clock: Arc<dyn Clock>,
    config: BackfillConfig,
}

impl BackfillService {
    /// Creates a new backfill service.
    #[must_use]
    pub fn new(
        repository: Arc<dyn MarketDataRepository>,
        clock: Arc<dyn Clock>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            config,
        }
    }

    /// Downloads one-minute bars for `symbol` up to now.
    pub async fn backfill_bars(
        &self,
        source: &dyn MarketDataSource,
        symbol: &Symbol,
    ) -> AppResult<BackfillReport> {
        let exchange = source.exchange();
        let span = positive_span(source.bars_page_span(), exchange)?;
        let close_delay = source.bar_close_delay();
        let stored = self.repository.bar_range(exchange, symbol).await?;
        let start = stored.map_or(self.config.default_start, |range| range.latest);
        let stop = self.clock.now().timestamp() - 1;

        info!(
            exchange = %exchange,
            symbol = %symbol,
            start,
            estimated_bars = (stop - start).max(0) / 60,
            "starting bar backfill"
        );

        let mut report = BackfillReport::new(exchange, symbol, start);
        while report.cursor < stop {
            let page_start = report.cursor;
            let page_end = page_start.saturating_add(span).min(stop);
            let mut bars = self
                .fetch_page(&mut report, move || {
                    source.fetch_bars(symbol, page_start, page_end)
                })
                .await?;
            let fetched = bars.len();
            bars.retain(|bar| bar.ts.saturating_add(close_delay) <= stop);
            let inserted = self.repository.insert_bars(&bars).await?;
            let latest = bars.iter().map(|bar| bar.ts).max();

            report.pages = report.pages.saturating_add(1);
            report.rows_fetched = report.rows_fetched.saturating_add(fetched as u64);
            report.rows_inserted = report.rows_inserted.saturating_add(inserted);
            report.cursor = next_cursor(page_start, page_end, latest);
            if bars.len() < fetched {
                // The page reached the live edge.
                report.cursor = report.cursor.max(page_end);
            }

            info!(
                exchange = %exchange,
                symbol = %symbol,
                fetched,
                unclosed = fetched - bars.len(),
                inserted,
                cursor = report.cursor,
                "bar page stored"
            );

            if report.cursor < stop {
                self.pause(self.config.page_delay).await;
            }
        }

        Ok(report)
    }

    /// Downloads funding rates for `symbol` up to now.
    pub async fn backfill_funding(
        &self,
        source: &dyn MarketDataSource,
        symbol: &Symbol,
    ) -> AppResult<BackfillReport> {
        let exchange = source.exchange();
        let span = source.funding_page_span().ok_or_else(|| {
            AppError::Validation(format!("{exchange} does not publish funding rates"))
        })?;
        let span = positive_span(span, exchange)?;
        let stored = self.repository.funding_range(exchange, symbol).await?;
        let start = stored.map_or(self.config.default_start, |range| range.latest);
        let stop = self.clock.now().timestamp() - 1;

        info!(
            exchange = %exchange,
            symbol = %symbol,
            start,
            estimated_rates = (stop - start).max(0) / (8 * 60 * 60),
            "starting funding backfill"
        );

        let mut report = BackfillReport::new(exchange, symbol, start);
        while report.cursor < stop {
            let page_start = report.cursor;
            let page_end = page_start.saturating_add(span).min(stop);
            let rates = self
                .fetch_page(&mut report, move || {
                    source.fetch_funding_rates(symbol, page_start, page_end)
                })
                .await?;
            let inserted = self.repository.insert_funding_rates(&rates).await?;
            let latest = rates.iter().map(|rate| rate.ts).max();

            report.pages = report.pages.saturating_add(1);
            report.rows_fetched = report.rows_fetched.saturating_add(rates.len() as u64);
            report.rows_inserted = report.rows_inserted.saturating_add(inserted);
            report.cursor = next_cursor(page_start, page_end, latest);

            info!(
                exchange = %exchange,
                symbol = %symbol,
                fetched = rates.len(),
                inserted,
                cursor = report.cursor,
                "funding page stored"
            );

            if report.cursor < stop {
                self.pause(self.config.page_delay).await;
            }
        }

        Ok(report)
    }

    async fn fetch_page<T, F, Fut>(
        &self,
        report: &mut BackfillReport,
        mut fetch: F,
    ) -> AppResult<Vec<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<Vec<T>>>,
    {
        let mut retries = 0_u32;
        loop {
            match fetch().await {
                Err(error)
                    if error.is_rate_limited() && retries < self.config.max_throttle_retries =>
                {
                    retries = retries.saturating_add(1);
                    report.throttled_retries = report.throttled_retries.saturating_add(1);
                    warn!(
                        exchange = %report.exchange,
                        symbol = %report.symbol,
                        cursor = report.cursor,
                        retry = retries,
                        error = %error,
                        "page throttled, backing off"
                    );
                    self.pause(self.config.throttle_backoff).await;
                }
                result => return result,
            }
        }
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn positive_span(span: i64, exchange: Exchange) -> AppResult<i64> {
    if span <= 0 {
        return Err(AppError::Validation(format!(
            "{exchange} page span must be greater than zero"
        )));
    }

    Ok(span)
}

/// Resumes from the newest returned row, or skips the page when it brought
/// nothing newer than its start.
fn next_cursor(page_start: i64, page_end: i64, latest: Option<i64>) -> i64 {
    latest
        .filter(|latest| *latest > page_start)
        .unwrap_or(page_end)
}

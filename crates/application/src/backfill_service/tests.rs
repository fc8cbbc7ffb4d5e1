use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;

use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Bar, Exchange, FundingRate, Symbol};

use crate::clock::Clock;
use crate::market_data_ports::{
    MarketDataQuery, MarketDataRepository, MarketDataSource, StoredRange,
};

use super::{BackfillConfig, BackfillService, DEFAULT_BACKFILL_START};

const EIGHT_HOURS: i64 = 8 * 60 * 60;

struct FixedClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl FixedClock {
    fn at(seconds: i64) -> Arc<Self> {
        Arc::new(Self {
            now: std::sync::Mutex::new(timestamp(seconds)),
        })
    }

    fn set(&self, seconds: i64) {
        *self.now.lock().unwrap_or_else(|error| error.into_inner()) = timestamp(seconds);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|error| error.into_inner())
    }
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn symbol(value: &str) -> Symbol {
    match Symbol::new(value) {
        Ok(symbol) => symbol,
        Err(error) => panic!("invalid test symbol: {error}"),
    }
}

#[derive(Default)]
struct FakeMarketDataRepository {
    bars: Mutex<Vec<Bar>>,
    rates: Mutex<Vec<FundingRate>>,
}

fn range_of(timestamps: impl Iterator<Item = i64>) -> Option<StoredRange> {
    timestamps.fold(None, |range, ts| match range {
        None => Some(StoredRange {
            earliest: ts,
            latest: ts,
        }),
        Some(range) => Some(StoredRange {
            earliest: range.earliest.min(ts),
            latest: range.latest.max(ts),
        }),
    })
}

#[async_trait]
impl MarketDataRepository for FakeMarketDataRepository {
    async fn bar_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        let bars = self.bars.lock().await;
        Ok(range_of(
            bars.iter()
                .filter(|bar| bar.exchange == exchange && &bar.symbol == symbol)
                .map(|bar| bar.ts),
        ))
    }

    async fn funding_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        let rates = self.rates.lock().await;
        Ok(range_of(
            rates
                .iter()
                .filter(|rate| rate.exchange == exchange && &rate.symbol == symbol)
                .map(|rate| rate.ts),
        ))
    }

    async fn insert_bars(&self, bars: &[Bar]) -> AppResult<u64> {
        let mut stored = self.bars.lock().await;
        let mut inserted = 0;
        for bar in bars {
            let exists = stored.iter().any(|existing| {
                existing.exchange == bar.exchange
                    && existing.symbol == bar.symbol
                    && existing.ts == bar.ts
            });
            if !exists {
                stored.push(bar.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn insert_funding_rates(&self, rates: &[FundingRate]) -> AppResult<u64> {
        let mut stored = self.rates.lock().await;
        let mut inserted = 0;
        for rate in rates {
            let exists = stored.iter().any(|existing| {
                existing.exchange == rate.exchange
                    && existing.symbol == rate.symbol
                    && existing.ts == rate.ts
            });
            if !exists {
                stored.push(rate.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_bars(&self, _query: &MarketDataQuery) -> AppResult<Vec<Bar>> {
        Ok(self.bars.lock().await.clone())
    }

    async fn list_funding_rates(&self, _query: &MarketDataQuery) -> AppResult<Vec<FundingRate>> {
        Ok(self.rates.lock().await.clone())
    }
}

/// Serves one bar per minute and one funding rate every eight hours from
/// `listed_from` onwards.
struct FakeSource {
    bars_span: i64,
    funding_span: Option<i64>,
    listed_from: i64,
    ahead_of_end: i64,
    close_delay: i64,
    throttled_calls: Mutex<u32>,
    calls: Mutex<Vec<(i64, i64)>>,
}

impl FakeSource {
    fn new(bars_span: i64) -> Self {
        Self {
            bars_span,
            funding_span: Some(3 * EIGHT_HOURS),
            listed_from: 0,
            ahead_of_end: 0,
            close_delay: 0,
            throttled_calls: Mutex::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn throttle_check(&self) -> AppResult<()> {
        let mut throttled_calls = self.throttled_calls.lock().await;
        if *throttled_calls > 0 {
            *throttled_calls -= 1;
            return Err(AppError::RateLimited("fake quota exhausted".to_owned()));
        }
        Ok(())
    }

    fn aligned_after(start: i64, step: i64) -> i64 {
        start - start.rem_euclid(step) + step
    }
}

#[async_trait]
impl MarketDataSource for FakeSource {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn bars_page_span(&self) -> i64 {
        self.bars_span
    }

    fn bar_close_delay(&self) -> i64 {
        self.close_delay
    }

    async fn fetch_bars(&self, symbol: &Symbol, start: i64, end: i64) -> AppResult<Vec<Bar>> {
        self.throttle_check().await?;
        self.calls.lock().await.push((start, end));

        let first = Self::aligned_after(start.max(self.listed_from - 1), 60);
        Ok((first..=end + self.ahead_of_end)
            .step_by(60)
            .map(|ts| Bar {
                exchange: Exchange::Binance,
                symbol: symbol.clone(),
                ts,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            })
            .collect())
    }

    fn funding_page_span(&self) -> Option<i64> {
        self.funding_span
    }

    async fn fetch_funding_rates(
        &self,
        symbol: &Symbol,
        start: i64,
        end: i64,
    ) -> AppResult<Vec<FundingRate>> {
        self.throttle_check().await?;
        self.calls.lock().await.push((start, end));

        let first = Self::aligned_after(start, EIGHT_HOURS);
        Ok((first..=end)
            .step_by(EIGHT_HOURS as usize)
            .map(|ts| FundingRate {
                exchange: Exchange::Binance,
                symbol: symbol.clone(),
                ts,
                rate: 0.0001,
            })
            .collect())
    }
}

fn quick_config(max_throttle_retries: u32) -> BackfillConfig {
    BackfillConfig::new(
        DEFAULT_BACKFILL_START,
        Duration::ZERO,
        Duration::ZERO,
        max_throttle_retries,
    )
}

fn service(
    repository: Arc<FakeMarketDataRepository>,
    clock: Arc<FixedClock>,
    max_throttle_retries: u32,
) -> BackfillService {
    BackfillService::new(repository, clock, quick_config(max_throttle_retries))
}

#[tokio::test]
async fn empty_history_starts_at_default_start_and_pages_to_now() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 3_601);
    let service = service(repository.clone(), clock, 0);
    let source = FakeSource::new(600);

    let report = service.backfill_bars(&source, &symbol("ETHBTC")).await;
    let report = match report {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };

    assert_eq!(report.pages, 6);
    assert_eq!(report.rows_fetched, 60);
    assert_eq!(report.rows_inserted, 60);
    assert_eq!(report.cursor, DEFAULT_BACKFILL_START + 3_600);

    let calls = source.calls.lock().await;
    assert_eq!(calls[0], (DEFAULT_BACKFILL_START, DEFAULT_BACKFILL_START + 600));
    assert_eq!(repository.bars.lock().await.len(), 60);
}

#[tokio::test]
async fn rerun_resumes_from_latest_stored_bar() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 1_201);
    let service = service(repository.clone(), clock.clone(), 0);
    let source = FakeSource::new(600);
    let symbol = symbol("ETHBTC");

    assert!(service.backfill_bars(&source, &symbol).await.is_ok());

    let idle = service.backfill_bars(&source, &symbol).await;
    assert_eq!(idle.as_ref().map(|report| report.pages).ok(), Some(0));

    clock.set(DEFAULT_BACKFILL_START + 1_801);
    let resumed = match service.backfill_bars(&source, &symbol).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };

    assert_eq!(resumed.pages, 1);
    assert_eq!(resumed.rows_inserted, 10);
    assert_eq!(repository.bars.lock().await.len(), 30);
    assert_eq!(
        source.calls.lock().await.last().copied(),
        Some((DEFAULT_BACKFILL_START + 1_200, DEFAULT_BACKFILL_START + 1_800))
    );
}

#[tokio::test]
async fn throttled_page_is_retried() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository.clone(), clock, 5);
    let source = FakeSource::new(600);
    *source.throttled_calls.lock().await = 2;

    let report = match service.backfill_bars(&source, &symbol("XRPBTC")).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };

    assert_eq!(report.throttled_retries, 2);
    assert_eq!(report.pages, 1);
    assert_eq!(report.rows_inserted, 10);
}

#[tokio::test]
async fn exhausted_throttle_retries_surface_rate_limited() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository.clone(), clock, 2);
    let source = FakeSource::new(600);
    *source.throttled_calls.lock().await = 10;

    let result = service.backfill_bars(&source, &symbol("XRPBTC")).await;

    assert!(matches!(result, Err(AppError::RateLimited(_))));
    assert!(repository.bars.lock().await.is_empty());
    assert_eq!(*source.throttled_calls.lock().await, 7);
}

#[tokio::test]
async fn empty_pages_advance_to_page_end() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 3_601);
    let service = service(repository.clone(), clock, 0);
    let mut source = FakeSource::new(600);
    source.listed_from = DEFAULT_BACKFILL_START + 1_860;

    let report = match service.backfill_bars(&source, &symbol("ADABTC")).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };

    assert_eq!(report.pages, 6);
    assert_eq!(report.rows_inserted, 30);
    assert_eq!(report.cursor, DEFAULT_BACKFILL_START + 3_600);
}

#[tokio::test]
async fn funding_backfill_pages_by_funding_span() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 9 * EIGHT_HOURS + 1);
    let service = service(repository.clone(), clock, 0);
    let source = FakeSource::new(600);

    let report = match service.backfill_funding(&source, &symbol("BTCUSDT")).await {
        Ok(report) => report,
        Err(error) => panic!("funding backfill failed: {error}"),
    };

    assert_eq!(report.pages, 3);
    assert_eq!(report.rows_inserted, 9);
    assert_eq!(repository.rates.lock().await.len(), 9);
}

#[tokio::test]
async fn funding_backfill_requires_funding_support() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository, clock, 0);
    let mut source = FakeSource::new(600);
    source.funding_span = None;

    let result = service.backfill_funding(&source, &symbol("ETH-USD")).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn zero_page_span_is_rejected() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository, clock, 0);
    let source = FakeSource::new(0);

    let result = service.backfill_bars(&source, &symbol("ETHBTC")).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test]
async fn unclosed_minute_is_left_for_next_run() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository.clone(), clock.clone(), 0);
    let mut source = FakeSource::new(600);
    source.ahead_of_end = 60;
    let symbol = symbol("ETHBTC");

    let first = match service.backfill_bars(&source, &symbol).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };
    assert_eq!(first.rows_fetched, 11);
    assert_eq!(first.rows_inserted, 10);
    assert_eq!(first.cursor, DEFAULT_BACKFILL_START + 600);

    clock.set(DEFAULT_BACKFILL_START + 721);
    let second = match service.backfill_bars(&source, &symbol).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };
    assert_eq!(second.rows_inserted, 2);
    assert_eq!(
        repository.bars.lock().await.iter().map(|bar| bar.ts).max(),
        Some(DEFAULT_BACKFILL_START + 720)
    );
}

#[tokio::test]
async fn open_stamped_bars_wait_for_their_close() {
    let repository = Arc::new(FakeMarketDataRepository::default());
    let clock = FixedClock::at(DEFAULT_BACKFILL_START + 601);
    let service = service(repository.clone(), clock, 0);
    let mut source = FakeSource::new(600);
    source.close_delay = 60;

    let report = match service.backfill_bars(&source, &symbol("ETH-USD")).await {
        Ok(report) => report,
        Err(error) => panic!("backfill failed: {error}"),
    };

    assert_eq!(report.pages, 1);
    assert_eq!(report.rows_fetched, 10);
    assert_eq!(report.rows_inserted, 9);
    assert_eq!(report.cursor, DEFAULT_BACKFILL_START + 600);
    assert_eq!(
        repository.bars.lock().await.iter().map(|bar| bar.ts).max(),
        Some(DEFAULT_BACKFILL_START + 540)
    );
}

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use braintrust_application::{MarketDataQuery, MarketDataRepository, StoredRange};
use braintrust_core::AppResult;
use braintrust_domain::{Bar, Exchange, FundingRate, Symbol};

type SeriesKey = (Exchange, Symbol);

/// In-memory market data repository implementation.
#[derive(Debug, Default)]
pub struct InMemoryMarketDataRepository {
    bars: RwLock<HashMap<SeriesKey, BTreeMap<i64, Bar>>>,
    funding_rates: RwLock<HashMap<SeriesKey, BTreeMap<i64, FundingRate>>>,
}

impl InMemoryMarketDataRepository {
    /// Creates an empty in-memory repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn stored_range<T>(series: Option<&BTreeMap<i64, T>>) -> Option<StoredRange> {
    let series = series?;
    let earliest = *series.keys().next()?;
    let latest = *series.keys().next_back()?;
    Some(StoredRange { earliest, latest })
}

fn within<T: Clone>(series: Option<&BTreeMap<i64, T>>, query: &MarketDataQuery) -> Vec<T> {
    if query.from >= query.to {
        return Vec::new();
    }

    series
        .map(|series| {
            series
                .range(query.from.saturating_add(1)..query.to)
                .map(|(_, row)| row.clone())
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl MarketDataRepository for InMemoryMarketDataRepository {
    async fn bar_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        let bars = self.bars.read().await;
        Ok(stored_range(bars.get(&(exchange, symbol.clone()))))
    }

    async fn funding_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        let funding_rates = self.funding_rates.read().await;
        Ok(stored_range(funding_rates.get(&(exchange, symbol.clone()))))
    }

    async fn insert_bars(&self, bars: &[Bar]) -> AppResult<u64> {
        let mut stored = self.bars.write().await;
        let mut inserted = 0_u64;
        for bar in bars {
            let series = stored
                .entry((bar.exchange, bar.symbol.clone()))
                .or_default();
            if !series.contains_key(&bar.ts) {
                series.insert(bar.ts, bar.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn insert_funding_rates(&self, rates: &[FundingRate]) -> AppResult<u64> {
        let mut stored = self.funding_rates.write().await;
        let mut inserted = 0_u64;
        for rate in rates {
            let series = stored
                .entry((rate.exchange, rate.symbol.clone()))
                .or_default();
            if !series.contains_key(&rate.ts) {
                series.insert(rate.ts, rate.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn list_bars(&self, query: &MarketDataQuery) -> AppResult<Vec<Bar>> {
        let bars = self.bars.read().await;
        Ok(within(
            bars.get(&(query.exchange, query.symbol.clone())),
            query,
        ))
    }

    async fn list_funding_rates(&self, query: &MarketDataQuery) -> AppResult<Vec<FundingRate>> {
        let funding_rates = self.funding_rates.read().await;
        Ok(within(
            funding_rates.get(&(query.exchange, query.symbol.clone())),
            query,
        ))
    }
}

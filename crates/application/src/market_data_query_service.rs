use std::sync::Arc;

use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Bar, Exchange, FundingRate, Symbol};

use crate::clock::Clock;
use crate::market_data_ports::{MarketDataQuery, MarketDataRepository, StoredRange};

/// Read-back helpers used by analysis tooling.
#[derive(Clone)]
pub struct MarketDataQueryService {
    repository: Arc<dyn MarketDataRepository>,
    clock: Arc<dyn Clock>,
}

impl MarketDataQueryService {
    /// Creates a new query service.
    #[must_use]
    pub fn new(repository: Arc<dyn MarketDataRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repository, clock }
    }

    /// Returns stored bars strictly between `from` and `to`, one per
    /// timestamp, in timestamp order. Missing bounds mean "since epoch" and
    /// "until now".
    pub async fn bars(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
        from: Option<i64>,
        to: Option<i64>,
    ) -> AppResult<Vec<Bar>> {
        let query = self.query(exchange, symbol, from, to)?;
        let mut bars = self.repository.list_bars(&query).await?;
        bars.sort_by_key(|bar| bar.ts);
        bars.dedup_by_key(|bar| bar.ts);
        Ok(bars)
    }

    /// Returns stored funding rates strictly between `from` and `to`.
    pub async fn funding_rates(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
        from: Option<i64>,
        to: Option<i64>,
    ) -> AppResult<Vec<FundingRate>> {
        let query = self.query(exchange, symbol, from, to)?;
        let mut rates = self.repository.list_funding_rates(&query).await?;
        rates.sort_by_key(|rate| rate.ts);
        rates.dedup_by_key(|rate| rate.ts);
        Ok(rates)
    }

    /// Returns the earliest and latest stored bar timestamps.
    pub async fn date_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        self.repository.bar_range(exchange, symbol).await
    }

    fn query(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
        from: Option<i64>,
        to: Option<i64>,
    ) -> AppResult<MarketDataQuery> {
        let from = from.unwrap_or(0);
        let to = to.unwrap_or_else(|| self.clock.now().timestamp());
        if from >= to {
            return Err(AppError::Validation(format!(
                "empty time range: from {from} is not before to {to}"
            )));
        }

        Ok(MarketDataQuery {
            exchange,
            symbol: symbol.clone(),
            from,
            to,
        })
    }
}

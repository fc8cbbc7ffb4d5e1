use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;

use braintrust_application::{MarketDataQuery, MarketDataRepository, StoredRange};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Bar, Exchange, FundingRate, Symbol};


/// Rows per INSERT statement, well below the bind parameter limit.
const INSERT_CHUNK_ROWS: usize = 1_000;

/// PostgreSQL-backed market data repository.
#[derive(Clone)]
pub struct PostgresMarketDataRepository {
    pool: PgPool,
}

impl PostgresMarketDataRepository {
    /// Creates a repository with the provided connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn stored_range(
        &self,
        table: &str,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "SELECT MIN(ts) AS earliest, MAX(ts) AS latest FROM ",
        );
        builder.push(table);
        builder.push(" WHERE exchange = ");
        builder.push_bind(exchange.as_str());
        builder.push(" AND symbol = ");
        builder.push_bind(symbol.as_str());

        let row = builder
            .build_query_as::<RangeRow>()
            .fetch_one(&self.pool)
            .await
            .map_err(|error| {
                AppError::Internal(format!(
                    "failed to read {table} range for {exchange} '{symbol}': {error}"
                ))
            })?;

        Ok(match (row.earliest, row.latest) {
            (Some(earliest), Some(latest)) => Some(StoredRange { earliest, latest }),
            _ => None,
        })
    }
}

#[derive(Debug, FromRow)]
struct RangeRow {
    earliest: Option<i64>,
    latest: Option<i64>,
}

#[derive(Debug, FromRow)]
struct BarRow {
    exchange: String,
    symbol: String,
    ts: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, FromRow)]
struct FundingRow {
    exchange: String,
    symbol: String,
    ts: i64,
    value: f64,
}

impl TryFrom<BarRow> for Bar {
    type Error = AppError;

    fn try_from(row: BarRow) -> Result<Self, Self::Error> {
        Ok(Self {
            exchange: row.exchange.parse()?,
            symbol: Symbol::new(row.symbol)?,
            ts: row.ts,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        })
    }
}

impl TryFrom<FundingRow> for FundingRate {
    type Error = AppError;

    fn try_from(row: FundingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            exchange: row.exchange.parse()?,
            symbol: Symbol::new(row.symbol)?,
            ts: row.ts,
            rate: row.value,
        })
    }
}

#[async_trait]
impl MarketDataRepository for PostgresMarketDataRepository {
    async fn bar_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        self.stored_range("bars_1_min", exchange, symbol).await
    }

    async fn funding_range(
        &self,
        exchange: Exchange,
        symbol: &Symbol,
    ) -> AppResult<Option<StoredRange>> {
        self.stored_range("perpfunding", exchange, symbol).await
    }

    async fn insert_bars(&self, bars: &[Bar]) -> AppResult<u64> {
        let mut inserted = 0_u64;
        for chunk in bars.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "INSERT INTO bars_1_min (ts, exchange, symbol, open, high, low, close, volume) ",
            );
            builder.push_values(chunk, |mut row, bar| {
                row.push_bind(bar.ts)
                    .push_bind(bar.exchange.as_str())
                    .push_bind(bar.symbol.as_str())
                    .push_bind(bar.open)
                    .push_bind(bar.high)
                    .push_bind(bar.low)
                    .push_bind(bar.close)
                    .push_bind(bar.volume);
            });
            builder.push(" ON CONFLICT (exchange, symbol, ts) DO NOTHING");

            let result = builder.build().execute(&self.pool).await.map_err(|error| {
                AppError::Internal(format!("failed to insert bars: {error}"))
            })?;
            inserted = inserted.saturating_add(result.rows_affected());
        }

        debug!(rows = bars.len(), inserted, "stored bars");
        Ok(inserted)
    }

    async fn insert_funding_rates(&self, rates: &[FundingRate]) -> AppResult<u64> {
        let mut inserted = 0_u64;
        for chunk in rates.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("INSERT INTO perpfunding (exchange, symbol, ts, value) ");
            builder.push_values(chunk, |mut row, rate| {
                row.push_bind(rate.exchange.as_str())
                    .push_bind(rate.symbol.as_str())
                    .push_bind(rate.ts)
                    .push_bind(rate.rate);
            });
            builder.push(" ON CONFLICT (exchange, symbol, ts) DO NOTHING");

            let result = builder.build().execute(&self.pool).await.map_err(|error| {
                AppError::Internal(format!("failed to insert funding rates: {error}"))
            })?;
            inserted = inserted.saturating_add(result.rows_affected());
        }

        debug!(rows = rates.len(), inserted, "stored funding rates");
        Ok(inserted)
    }

    async fn list_bars(&self, query: &MarketDataQuery) -> AppResult<Vec<Bar>> {
        let rows = sqlx::query_as::<_, BarRow>(
            r#"
            SELECT exchange, symbol, ts, open, high, low, close, volume
            FROM bars_1_min
            WHERE exchange = $1 AND symbol = $2 AND ts > $3 AND ts < $4
            ORDER BY ts
            "#,
        )
        .bind(query.exchange.as_str())
        .bind(query.symbol.as_str())
        .bind(query.from)
        .bind(query.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to list bars for {} '{}': {error}",
                query.exchange, query.symbol
            ))
        })?;

        rows.into_iter().map(Bar::try_from).collect()
    }

    async fn list_funding_rates(&self, query: &MarketDataQuery) -> AppResult<Vec<FundingRate>> {
        let rows = sqlx::query_as::<_, FundingRow>(
            r#"
            SELECT exchange, symbol, ts, value
            FROM perpfunding
            WHERE exchange = $1 AND symbol = $2 AND ts > $3 AND ts < $4
            ORDER BY ts
            "#,
        )
        .bind(query.exchange.as_str())
        .bind(query.symbol.as_str())
        .bind(query.from)
        .bind(query.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| {
            AppError::Internal(format!(
                "failed to list funding rates for {} '{}': {error}",
                query.exchange, query.symbol
            ))
        })?;

        rows.into_iter().map(FundingRate::try_from).collect()
    }
}

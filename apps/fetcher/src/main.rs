//! Braintrust market data fetcher runtime.

#![forbid(unsafe_code)]

mod config;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use braintrust_application::{
    BackfillService, Clock, MarketDataQueryService, MarketDataRepository, MarketDataSource,
    SystemClock,
};
use braintrust_core::{AppError, AppResult};
use braintrust_domain::Symbol;
use braintrust_infrastructure::{
    BinanceClient, BinanceEndpoints, BinanceFuturesSource, BinanceSpotSource, BitmexClient,
    BookTickerPoller, GdaxClient, PostgresMarketDataRepository,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::FetcherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Migrate,
    Status,
    Once,
    Loop,
}

impl RunMode {
    fn from_arg(arg: Option<&str>) -> AppResult<Self> {
        match arg {
            None => Ok(Self::Loop),
            Some("migrate") => Ok(Self::Migrate),
            Some("status") => Ok(Self::Status),
            Some("once") => Ok(Self::Once),
            Some(other) => Err(AppError::Validation(format!(
                "unknown command '{other}', expected migrate, status or once"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Bars,
    Funding,
}

impl JobKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Bars => "bars",
            Self::Funding => "funding",
        }
    }
}

struct FetchJob {
    source: Arc<dyn MarketDataSource>,
    symbol: Symbol,
    kind: JobKind,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let mode = RunMode::from_arg(env::args().nth(1).as_deref())?;
    let config = FetcherConfig::load()?;
    let pool = connect_pool(config.database_url.as_str()).await?;

    sqlx::migrate!("../../crates/infrastructure/migrations")
        .run(&pool)
        .await
        .map_err(|error| AppError::Internal(format!("failed to run migrations: {error}")))?;

    if mode == RunMode::Migrate {
        info!("database migrations applied successfully");
        return Ok(());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let repository: Arc<dyn MarketDataRepository> =
        Arc::new(PostgresMarketDataRepository::new(pool));
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .user_agent(concat!("braintrust-fetcher/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|error| AppError::Internal(format!("failed to build HTTP client: {error}")))?;

    let (jobs, binance) = build_jobs(&config, http_client, clock.clone()).await?;

    if mode == RunMode::Status {
        let query_service = MarketDataQueryService::new(repository, clock);
        report_status(&query_service, &jobs).await;
        return Ok(());
    }

    let backfill_service = BackfillService::new(repository, clock, config.backfill_config());

    info!(
        jobs = jobs.len(),
        page_delay_ms = config.page_delay_ms,
        throttle_backoff_ms = config.throttle_backoff_ms,
        max_throttle_retries = config.max_throttle_retries,
        poll_interval_secs = config.poll_interval_secs,
        "braintrust-fetcher started"
    );

    if mode == RunMode::Loop {
        spawn_book_ticker_poller(&config, binance)?;
    }

    loop {
        run_pass(&backfill_service, &jobs).await;

        if mode == RunMode::Once {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_secs(config.poll_interval_secs)).await;
    }
}

async fn connect_pool(database_url: &str) -> AppResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|error| AppError::Internal(format!("failed to connect to database: {error}")))
}

/// Builds the fetch jobs, plus the Binance client when any Binance job is
/// configured.
async fn build_jobs(
    config: &FetcherConfig,
    http_client: reqwest::Client,
    clock: Arc<dyn Clock>,
) -> AppResult<(Vec<FetchJob>, Option<Arc<BinanceClient>>)> {
    let mut jobs = Vec::new();
    let mut binance = None;

    if config.uses_binance() {
        let endpoints = BinanceEndpoints {
            spot_base_url: config.binance_api_url.clone(),
            futures_base_url: config.binance_futures_api_url.clone(),
        };
        let client =
            Arc::new(BinanceClient::connect(http_client.clone(), endpoints, clock.clone()).await?);
        let spot: Arc<dyn MarketDataSource> = Arc::new(BinanceSpotSource::new(client.clone()));
        let futures: Arc<dyn MarketDataSource> =
            Arc::new(BinanceFuturesSource::new(client.clone()));
        binance = Some(client);

        push_jobs(&mut jobs, &spot, &config.binance_symbols, JobKind::Bars);
        push_jobs(&mut jobs, &futures, &config.binance_futures_symbols, JobKind::Bars);
        push_jobs(&mut jobs, &futures, &config.binance_funding_symbols, JobKind::Funding);
    }

    if !(config.bitmex_symbols.is_empty() && config.bitmex_funding_symbols.is_empty()) {
        let bitmex: Arc<dyn MarketDataSource> = Arc::new(BitmexClient::with_base_url(
            http_client.clone(),
            config.bitmex_api_url.as_str(),
            clock.clone(),
        )?);

        push_jobs(&mut jobs, &bitmex, &config.bitmex_symbols, JobKind::Bars);
        push_jobs(&mut jobs, &bitmex, &config.bitmex_funding_symbols, JobKind::Funding);
    }

    if !config.gdax_symbols.is_empty() {
        let gdax: Arc<dyn MarketDataSource> = Arc::new(GdaxClient::with_base_url(
            http_client,
            config.gdax_api_url.as_str(),
            clock,
        )?);

        push_jobs(&mut jobs, &gdax, &config.gdax_symbols, JobKind::Bars);
    }

    Ok((jobs, binance))
}

/// Starts the all-symbol book ticker poller on the Binance client's quota.
/// Disabled when the request rate is zero.
fn spawn_book_ticker_poller(
    config: &FetcherConfig,
    binance: Option<Arc<BinanceClient>>,
) -> AppResult<()> {
    if config.binance_book_ticker_rpm == 0 {
        return Ok(());
    }

    let Some(client) = binance else {
        warn!("book ticker poller needs at least one binance symbol, not started");
        return Ok(());
    };

    let poller = BookTickerPoller::new(client, None, config.binance_book_ticker_rpm)?;
    Arc::new(poller).spawn();
    Ok(())
}

fn push_jobs(
    jobs: &mut Vec<FetchJob>,
    source: &Arc<dyn MarketDataSource>,
    symbols: &[Symbol],
    kind: JobKind,
) {
    jobs.extend(symbols.iter().map(|symbol| FetchJob {
        source: Arc::clone(source),
        symbol: symbol.clone(),
        kind,
    }));
}

/// Runs every job once. A failing job is logged and the pass moves on.
async fn run_pass(backfill_service: &BackfillService, jobs: &[FetchJob]) {
    let mut succeeded = 0_usize;
    let mut failed = 0_usize;
    let mut rows_inserted = 0_u64;

    for job in jobs {
        let result = match job.kind {
            JobKind::Bars => {
                backfill_service
                    .backfill_bars(job.source.as_ref(), &job.symbol)
                    .await
            }
            JobKind::Funding => {
                backfill_service
                    .backfill_funding(job.source.as_ref(), &job.symbol)
                    .await
            }
        };

        match result {
            Ok(report) => {
                succeeded += 1;
                rows_inserted = rows_inserted.saturating_add(report.rows_inserted);
                info!(
                    exchange = %report.exchange,
                    symbol = %report.symbol,
                    kind = job.kind.as_str(),
                    pages = report.pages,
                    rows_fetched = report.rows_fetched,
                    rows_inserted = report.rows_inserted,
                    throttled_retries = report.throttled_retries,
                    cursor = report.cursor,
                    "fetch job finished"
                );
            }
            Err(error) => {
                failed += 1;
                warn!(
                    exchange = %job.source.exchange(),
                    symbol = %job.symbol,
                    kind = job.kind.as_str(),
                    error = %error,
                    "fetch job failed"
                );
            }
        }
    }

    info!(succeeded, failed, rows_inserted, "fetch pass finished");
}

async fn report_status(query_service: &MarketDataQueryService, jobs: &[FetchJob]) {
    for job in jobs.iter().filter(|job| job.kind == JobKind::Bars) {
        let exchange = job.source.exchange();
        match query_service.date_range(exchange, &job.symbol).await {
            Ok(Some(range)) => info!(
                exchange = %exchange,
                symbol = %job.symbol,
                earliest = range.earliest,
                latest = range.latest,
                "stored bar range"
            ),
            Ok(None) => info!(exchange = %exchange, symbol = %job.symbol, "no stored bars"),
            Err(error) => warn!(
                exchange = %exchange,
                symbol = %job.symbol,
                error = %error,
                "failed to read stored bar range"
            ),
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

//! Background best bid/ask poller sharing the client's request quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use braintrust_core::{AppError, AppResult};
use braintrust_domain::Symbol;

use super::{BinanceClient, BookQuote};

/// Polls `/api/v3/ticker/bookTicker` at a fixed request rate and keeps the
/// latest quote per symbol.
///
/// Every poll goes through the same tracker as the client's other calls,
/// so a running poller and a backfill never overdraw the quota together.
#[derive(Debug)]
pub struct BookTickerPoller {
    client: Arc<BinanceClient>,
    symbol: Option<Symbol>,
    interval: Duration,
    quotes: RwLock<HashMap<String, BookQuote>>,
}

impl BookTickerPoller {
    /// Creates a poller for `symbol`, or for every symbol when `None`,
    /// issuing at most `requests_per_minute` requests.
    pub fn new(
        client: Arc<BinanceClient>,
        symbol: Option<Symbol>,
        requests_per_minute: u32,
    ) -> AppResult<Self> {
        if requests_per_minute == 0 {
            return Err(AppError::Validation(
                "book ticker requests per minute must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            client,
            symbol,
            interval: Duration::from_secs(60) / requests_per_minute,
            quotes: RwLock::new(HashMap::new()),
        })
    }

    /// Delay between two polls.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the latest quote of `symbol`.
    pub async fn quote(&self, symbol: &str) -> Option<BookQuote> {
        self.quotes.read().await.get(symbol).copied()
    }

    /// Returns a copy of every stored quote.
    pub async fn quotes(&self) -> HashMap<String, BookQuote> {
        self.quotes.read().await.clone()
    }

    /// Runs one poll and merges the result. Returns the number of quotes
    /// received.
    pub async fn poll_once(&self) -> AppResult<usize> {
        let received = self.client.book_ticker(self.symbol.as_ref()).await?;
        let count = received.len();
        self.quotes.write().await.extend(received);
        Ok(count)
    }

    /// Spawns the polling loop on the current runtime.
    ///
    /// Failed polls are logged and the loop carries on after the usual
    /// delay. Abort the returned handle to stop it.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                symbol = self.symbol.as_ref().map(Symbol::as_str),
                interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                "binance book ticker poller started"
            );

            loop {
                match self.poll_once().await {
                    Ok(count) => debug!(quotes = count, "book ticker poll finished"),
                    Err(AppError::RateLimited(message)) => {
                        debug!(reason = %message, "book ticker poll throttled");
                    }
                    Err(error) => warn!(error = %error, "book ticker poll failed"),
                }

                tokio::time::sleep(self.interval).await;
            }
        })
    }
}

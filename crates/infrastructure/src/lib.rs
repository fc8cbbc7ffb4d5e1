//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod binance_client;
mod bitmex_client;
mod exchange_http;
mod gdax_client;
mod in_memory_market_data_repository;
mod postgres_market_data_repository;
#[cfg(test)]
mod test_support;

pub use binance_client::{
    BinanceClient, BinanceEndpoints, BinanceFuturesSource, BinanceSpotSource, BookQuote,
    BookTickerPoller, MarketSummary, OrderBook, SymbolInfo,
};
pub use bitmex_client::BitmexClient;
pub use gdax_client::GdaxClient;
pub use in_memory_market_data_repository::InMemoryMarketDataRepository;
pub use postgres_market_data_repository::PostgresMarketDataRepository;

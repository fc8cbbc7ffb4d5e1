//! Application services and ports.

#![forbid(unsafe_code)]

mod backfill_service;
mod clock;
mod market_data_ports;
mod market_data_query_service;
mod rate_limit_tracker;

pub use backfill_service::{
    BackfillConfig, BackfillReport, BackfillService, DEFAULT_BACKFILL_START,
};
pub use clock::{Clock, SystemClock};
pub use market_data_ports::{
    MarketDataQuery, MarketDataRepository, MarketDataSource, StoredRange,
};
pub use market_data_query_service::MarketDataQueryService;
pub use rate_limit_tracker::{QuotaUsage, RateLimitTracker};

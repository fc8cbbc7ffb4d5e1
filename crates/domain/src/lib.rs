//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod market_data;
mod rate_limit;

pub use market_data::{Bar, Exchange, FundingRate, Symbol};
pub use rate_limit::{QuotaDefinition, RateLimitCategory, RateLimitInterval};

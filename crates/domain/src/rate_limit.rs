//! Exchange rate-limit quota definitions.
//!
//! Exchanges publish their throttling rules as a list of quotas, each bound
//! to a consumption category and a trailing time window. These types are the
//! validated form of that list; the bookkeeping lives in the application
//! crate.

use std::str::FromStr;

use braintrust_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Semantic group of quotas that are consumed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitCategory {
    /// Weighted request budget shared by all public and private calls.
    Requests,
    /// Order placement and order query budget.
    Orders,
}

impl RateLimitCategory {
    /// Returns the stable category name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "REQUESTS",
            Self::Orders => "ORDERS",
        }
    }

    /// Maps an exchange `rateLimitType` value onto a tracked category.
    ///
    /// Returns `None` for types that are not tracked, such as Binance's
    /// `RAW_REQUESTS`.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "REQUESTS" | "REQUEST_WEIGHT" => Some(Self::Requests),
            "ORDERS" => Some(Self::Orders),
            _ => None,
        }
    }
}

impl std::fmt::Display for RateLimitCategory {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Unit of a quota window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitInterval {
    /// One second.
    Second,
    /// Sixty seconds.
    Minute,
    /// One UTC day.
    Day,
}

impl RateLimitInterval {
    /// Returns the unit length in seconds.
    #[must_use]
    pub fn seconds(&self) -> u64 {
        match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Day => 60 * 60 * 24,
        }
    }

    /// Returns the stable interval name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "SECOND",
            Self::Minute => "MINUTE",
            Self::Day => "DAY",
        }
    }
}

impl FromStr for RateLimitInterval {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "SECOND" => Ok(Self::Second),
            "MINUTE" => Ok(Self::Minute),
            "DAY" => Ok(Self::Day),
            _ => Err(AppError::Validation(format!(
                "unknown rate limit interval '{value}'"
            ))),
        }
    }
}

/// One validated quota published by an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "QuotaDefinitionFields")]
pub struct QuotaDefinition {
    category: RateLimitCategory,
    interval: RateLimitInterval,
    interval_num: u32,
    limit: u64,
}

#[derive(Deserialize)]
struct QuotaDefinitionFields {
    category: RateLimitCategory,
    interval: RateLimitInterval,
    interval_num: u32,
    limit: u64,
}

impl TryFrom<QuotaDefinitionFields> for QuotaDefinition {
    type Error = AppError;

    fn try_from(fields: QuotaDefinitionFields) -> Result<Self, Self::Error> {
        Self::new(
            fields.category,
            fields.interval,
            fields.interval_num,
            fields.limit,
        )
    }
}

impl QuotaDefinition {
    /// Creates a quota definition.
    ///
    /// `interval_num` multiplies the interval unit, so `(Second, 10)` is a
    /// ten second window.
    pub fn new(
        category: RateLimitCategory,
        interval: RateLimitInterval,
        interval_num: u32,
        limit: u64,
    ) -> AppResult<Self> {
        if interval_num == 0 {
            return Err(AppError::Validation(
                "rate limit interval multiplier must be greater than zero".to_owned(),
            ));
        }

        if limit == 0 {
            return Err(AppError::Validation(format!(
                "rate limit for {category} must be greater than zero"
            )));
        }

        Ok(Self {
            category,
            interval,
            interval_num,
            limit,
        })
    }

    /// Creates a single-unit quota definition.
    pub fn per(
        category: RateLimitCategory,
        interval: RateLimitInterval,
        limit: u64,
    ) -> AppResult<Self> {
        Self::new(category, interval, 1, limit)
    }

    /// Returns the quota category.
    #[must_use]
    pub fn category(&self) -> RateLimitCategory {
        self.category
    }

    /// Returns the interval unit.
    #[must_use]
    pub fn interval(&self) -> RateLimitInterval {
        self.interval
    }

    /// Returns the interval multiplier.
    #[must_use]
    pub fn interval_num(&self) -> u32 {
        self.interval_num
    }

    /// Returns the maximum outstanding weight inside one window.
    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Returns the trailing window length in seconds.
    #[must_use]
    pub fn window_seconds(&self) -> u64 {
        self.interval
            .seconds()
            .saturating_mul(u64::from(self.interval_num))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn interval_units_convert_to_seconds() {
        assert_eq!(RateLimitInterval::Second.seconds(), 1);
        assert_eq!(RateLimitInterval::Minute.seconds(), 60);
        assert_eq!(RateLimitInterval::Day.seconds(), 86_400);
    }

    #[test]
    fn unknown_interval_is_rejected() {
        let result = "HOURLY".parse::<RateLimitInterval>();
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn request_weight_maps_to_requests_category() {
        assert_eq!(
            RateLimitCategory::from_wire("REQUEST_WEIGHT"),
            Some(RateLimitCategory::Requests)
        );
        assert_eq!(RateLimitCategory::from_wire("RAW_REQUESTS"), None);
    }

    #[test]
    fn definition_rejects_zero_limit_and_zero_multiplier() {
        assert!(
            QuotaDefinition::new(RateLimitCategory::Orders, RateLimitInterval::Day, 1, 0).is_err()
        );
        assert!(
            QuotaDefinition::new(RateLimitCategory::Orders, RateLimitInterval::Day, 0, 10)
                .is_err()
        );
    }

    #[test]
    fn deserialized_definitions_are_validated() {
        let valid = serde_json::from_str::<QuotaDefinition>(
            r#"{"category": "ORDERS", "interval": "SECOND", "interval_num": 10, "limit": 100}"#,
        );
        assert!(matches!(valid, Ok(definition) if definition.window_seconds() == 10));

        let zero_limit = serde_json::from_str::<QuotaDefinition>(
            r#"{"category": "REQUESTS", "interval": "MINUTE", "interval_num": 1, "limit": 0}"#,
        );
        assert!(zero_limit.is_err());

        let zero_multiplier = serde_json::from_str::<QuotaDefinition>(
            r#"{"category": "REQUESTS", "interval": "MINUTE", "interval_num": 0, "limit": 5}"#,
        );
        assert!(zero_multiplier.is_err());
    }

    #[test]
    fn definition_window_applies_multiplier() {
        let definition =
            QuotaDefinition::new(RateLimitCategory::Orders, RateLimitInterval::Second, 10, 50);
        assert!(definition.is_ok());
        assert_eq!(definition.map(|value| value.window_seconds()).ok(), Some(10));
    }

    proptest! {
        #[test]
        fn interval_names_parse_back(
            interval in prop_oneof![
                Just(RateLimitInterval::Second),
                Just(RateLimitInterval::Minute),
                Just(RateLimitInterval::Day),
            ]
        ) {
            prop_assert_eq!(interval.as_str().parse::<RateLimitInterval>().ok(), Some(interval));
        }

        #[test]
        fn window_is_unit_times_multiplier(interval_num in 1_u32..10_000, limit in 1_u64..1_000_000) {
            let definition = QuotaDefinition::new(
                RateLimitCategory::Requests,
                RateLimitInterval::Minute,
                interval_num,
                limit,
            );
            prop_assert!(definition.is_ok());
            let window = definition.map(|value| value.window_seconds()).unwrap_or_default();
            prop_assert_eq!(window, 60 * u64::from(interval_num));
        }
    }
}

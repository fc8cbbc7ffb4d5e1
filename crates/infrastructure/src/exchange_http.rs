//! Request plumbing shared by the exchange REST adapters.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use braintrust_application::RateLimitTracker;
use braintrust_core::{AppError, AppResult};
use braintrust_domain::{Exchange, RateLimitCategory};

/// Records `weight` against the local quota and refuses the call when the
/// tracker does.
pub(crate) fn admit(
    rate_limits: &RateLimitTracker,
    exchange: Exchange,
    category: RateLimitCategory,
    weight: u64,
    operation: &str,
) -> AppResult<()> {
    if rate_limits.try_consume(category, weight)? {
        return Ok(());
    }

    debug!(
        exchange = %exchange,
        category = %category,
        weight,
        operation,
        "call refused by local rate limit"
    );
    Err(AppError::RateLimited(format!(
        "{exchange} {operation} refused by local {category} quota"
    )))
}

/// Sends a GET request and decodes the JSON body.
///
/// 429 and 418 responses surface as `AppError::RateLimited`, any other
/// non-success status as `AppError::Internal`.
pub(crate) async fn get_json<T>(
    http_client: &reqwest::Client,
    exchange: Exchange,
    url: &str,
    query: &[(&str, String)],
) -> AppResult<T>
where
    T: DeserializeOwned,
{
    debug!(exchange = %exchange, url, "sending exchange request");

    let response = http_client
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|error| {
            AppError::Internal(format!("failed to call {exchange} endpoint '{url}': {error}"))
        })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::IM_A_TEAPOT {
        return Err(AppError::RateLimited(format!(
            "{exchange} endpoint '{url}' returned status {}",
            status.as_u16()
        )));
    }

    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_owned());
        return Err(AppError::Internal(format!(
            "{exchange} endpoint '{url}' returned status {}: {body}",
            status.as_u16()
        )));
    }

    response.json::<T>().await.map_err(|error| {
        AppError::Internal(format!(
            "failed to parse {exchange} endpoint '{url}' response body: {error}"
        ))
    })
}

/// Parses a decimal string field of an exchange payload.
pub(crate) fn parse_decimal(value: &str, field: &str, exchange: Exchange) -> AppResult<f64> {
    value.trim().parse::<f64>().map_err(|error| {
        AppError::Internal(format!(
            "invalid {field} value '{value}' in {exchange} payload: {error}"
        ))
    })
}

/// Converts exchange milliseconds to the nearest epoch second.
pub(crate) fn millis_to_seconds(millis: i64) -> i64 {
    millis.saturating_add(500).div_euclid(1_000)
}

//! Provider adapters. Each turns a slice of cities into one raw value per
//! city, aligned with the input order.

use std::time::Duration;

use async_trait::async_trait;

use crate::attributes::JobKind;
use crate::errors::{AppError, AppResult};
use crate::store::City;

pub mod ookla;
pub mod openaq;
pub mod openweather;
pub mod overpass;

pub use ookla::OoklaTilesClient;
pub use openaq::OpenAqClient;
pub use openweather::OpenWeatherClient;
pub use overpass::OverpassClient;

const USER_AGENT: &str = concat!("cityrank-pipeline/", env!("CARGO_PKG_VERSION"));
const ERROR_BODY_LIMIT: usize = 256;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn job(&self) -> JobKind;

    /// Fetches raw values for `cities`. `Ok` always carries exactly one
    /// entry per input city; `None` means the provider had no data.
    async fn fetch(&self, cities: &[City]) -> AppResult<Vec<Option<f64>>>;
}

pub fn http_client() -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(15))
        .build()
        .map_err(AppError::from)
}

/// Turns a non-2xx reply into [`AppError::Provider`] with a trimmed body.
pub(crate) async fn ensure_success(
    provider: &'static str,
    response: reqwest::Response,
) -> AppResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    Err(AppError::Provider {
        provider,
        status: status.as_u16(),
        message,
    })
}

pub(crate) fn expect_aligned(
    provider: &'static str,
    cities: &[City],
    values: Vec<Option<f64>>,
) -> AppResult<Vec<Option<f64>>> {
    if values.len() != cities.len() {
        return Err(AppError::Parse(format!(
            "{provider} produced {} values for {} cities",
            values.len(),
            cities.len()
        )));
    }
    Ok(values)
}

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::attributes::JobKind;
use crate::config::AdapterSettings;
use crate::errors::AppResult;
use crate::sources::{ensure_success, SourceAdapter};
use crate::store::City;

const PROVIDER: &str = "openaq";

/// Latest PM2.5 reading of the nearest OpenAQ station.
pub struct OpenAqClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
    radius_m: u32,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(default)]
    results: Vec<LatestReading>,
}

#[derive(Debug, Deserialize)]
struct LatestReading {
    value: Option<f64>,
}

impl OpenAqClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: SecretString,
        settings: &AdapterSettings,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            timeout: settings.timeout,
            radius_m: settings.search_radius_m.round().max(1.0) as u32,
        }
    }

    async fn fetch_city(&self, city: &City) -> AppResult<Option<f64>> {
        let response = self
            .http
            .get(&self.base_url)
            .header("X-API-Key", self.api_key.expose_secret())
            .query(&[
                (
                    "coordinates",
                    format!("{},{}", city.latitude, city.longitude),
                ),
                ("radius", self.radius_m.to_string()),
                ("limit", "1".to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let parsed: LatestResponse = ensure_success(PROVIDER, response).await?.json().await?;
        let value = first_reading(parsed);
        debug!(
            city = %city.name,
            geoname_id = %city.geoname_id,
            value = ?value,
            "latest station reading fetched"
        );
        Ok(value)
    }
}

fn first_reading(response: LatestResponse) -> Option<f64> {
    response
        .results
        .into_iter()
        .next()
        .and_then(|reading| reading.value)
        .filter(|value| value.is_finite())
}

#[async_trait]
impl SourceAdapter for OpenAqClient {
    fn job(&self) -> JobKind {
        JobKind::AirQualityLatest
    }

    async fn fetch(&self, cities: &[City]) -> AppResult<Vec<Option<f64>>> {
        let mut values = Vec::with_capacity(cities.len());
        for city in cities {
            values.push(self.fetch_city(city).await?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_the_first_station_only() {
        let parsed: LatestResponse =
            serde_json::from_str(r#"{"meta":{"found":2},"results":[{"value":7.5},{"value":99.0}]}"#)
                .unwrap();
        assert_eq!(first_reading(parsed), Some(7.5));
    }

    #[test]
    fn no_station_is_no_data() {
        let parsed: LatestResponse = serde_json::from_str(r#"{"results":[]}"#).unwrap();
        assert_eq!(first_reading(parsed), None);
    }
}

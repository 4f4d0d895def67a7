use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::attributes::JobKind;
use crate::config::AdapterSettings;
use crate::errors::AppResult;
use crate::sources::{ensure_success, SourceAdapter};
use crate::store::City;

const PROVIDER: &str = "openweather";
const HISTORY_WINDOW_DAYS: i64 = 365;

/// Annual mean PM2.5 from the OpenWeather air pollution history endpoint.
pub struct OpenWeatherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    list: Vec<HistorySample>,
}

#[derive(Debug, Deserialize)]
struct HistorySample {
    components: Option<Components>,
}

#[derive(Debug, Deserialize)]
struct Components {
    pm2_5: Option<f64>,
}

impl OpenWeatherClient {
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
        }
    }

    async fn fetch_city(&self, city: &City) -> AppResult<Option<f64>> {
        let end = Utc::now();
        let start = end - chrono::Duration::days(HISTORY_WINDOW_DAYS);
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("lat", city.latitude.to_string()),
                ("lon", city.longitude.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("appid", self.api_key.expose_secret().to_string()),
            ])
            .timeout(self.timeout)
            .send()
            .await?;
        let parsed: HistoryResponse = ensure_success(PROVIDER, response).await?.json().await?;
        let value = mean_pm25(&parsed);
        debug!(
            city = %city.name,
            geoname_id = %city.geoname_id,
            samples = parsed.list.len(),
            value = ?value,
            "air pollution history fetched"
        );
        Ok(value)
    }
}

fn mean_pm25(response: &HistoryResponse) -> Option<f64> {
    let samples: Vec<f64> = response
        .list
        .iter()
        .filter_map(|sample| sample.components.as_ref()?.pm2_5)
        .filter(|value| value.is_finite())
        .collect();
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

#[async_trait]
impl SourceAdapter for OpenWeatherClient {
    fn job(&self) -> JobKind {
        JobKind::AirQualityHistory
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

    fn parse(body: &str) -> HistoryResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn averages_every_sample_with_pm25() {
        let response = parse(
            r#"{"list":[
                {"components":{"pm2_5":10.0,"pm10":40.0}},
                {"components":{"pm2_5":20.0}},
                {"components":{"no2":3.0}},
                {"components":{"pm2_5":30.0}}
            ]}"#,
        );
        assert_eq!(mean_pm25(&response), Some(20.0));
    }

    #[test]
    fn empty_history_is_no_data() {
        assert_eq!(mean_pm25(&parse(r#"{"list":[]}"#)), None);
        assert_eq!(mean_pm25(&parse(r#"{"coord":{"lat":1,"lon":2}}"#)), None);
        assert_eq!(mean_pm25(&parse(r#"{"list":[{"dt":1}]}"#)), None);
    }
}

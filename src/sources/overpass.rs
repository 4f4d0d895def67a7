use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::attributes::JobKind;
use crate::config::AdapterSettings;
use crate::errors::{AppError, AppResult};
use crate::sources::{ensure_success, SourceAdapter};
use crate::store::City;

const PROVIDER: &str = "overpass";

/// Park counts per city from the Overpass API, many cities per query.
pub struct OverpassClient {
    http: reqwest::Client,
    mirrors: Vec<String>,
    timeout: Duration,
    radius_m: u32,
    rng: Arc<Mutex<StdRng>>,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
    /// Set when the server gave up mid-query; `elements` is then partial.
    remark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(default)]
    tags: HashMap<String, Value>,
}

impl OverpassClient {
    pub fn new(
        http: reqwest::Client,
        mirrors: Vec<String>,
        settings: &AdapterSettings,
        rng: Arc<Mutex<StdRng>>,
    ) -> AppResult<Self> {
        if mirrors.is_empty() {
            return Err(AppError::Config(
                "at least one Overpass endpoint is required".into(),
            ));
        }
        Ok(Self {
            http,
            mirrors,
            timeout: settings.timeout,
            radius_m: settings.search_radius_m.round().max(1.0) as u32,
            rng,
        })
    }

    /// Batches go to the primary endpoint; single-city queries spread over
    /// the mirrors.
    fn endpoint_for(&self, batch_len: usize) -> &str {
        if batch_len > 1 || self.mirrors.len() == 1 {
            return &self.mirrors[0];
        }
        let idx = self.rng.lock().gen_range(0..self.mirrors.len());
        &self.mirrors[idx]
    }
}

/// One Overpass QL program counting parks around every city in `cities`.
/// Each city's count comes back as a `count` element tagged with its
/// `geoname_id`.
pub fn build_query(cities: &[City], radius_m: u32, timeout_secs: u64) -> String {
    let mut query = format!("[out:json][timeout:{timeout_secs}];\n");
    for city in cities {
        let set = set_name(&city.geoname_id);
        let around = format!(
            "(around:{radius_m},{},{})",
            city.latitude, city.longitude
        );
        let _ = writeln!(
            query,
            "(node[leisure=park]{around};way[leisure=park]{around};)->.{set};"
        );
        let _ = writeln!(
            query,
            "make count geoname_id=\"{id}\",total={set}.count(nodes)+{set}.count(ways);",
            id = city.geoname_id
        );
        query.push_str("out;\n");
    }
    query
}

fn set_name(geoname_id: &str) -> String {
    let cleaned: String = geoname_id
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    format!("c{cleaned}")
}

/// Counts keyed by `geoname_id`. Tag values may be strings or numbers.
/// A runtime-error remark fails the whole response, even under status 200.
pub fn parse_counts(body: &str) -> AppResult<HashMap<String, f64>> {
    let parsed: OverpassResponse = serde_json::from_str(body)?;
    if let Some(remark) = parsed.remark.as_deref().map(str::trim) {
        if remark.starts_with("runtime error") {
            return Err(AppError::Provider {
                provider: PROVIDER,
                status: 200,
                message: remark.chars().take(256).collect(),
            });
        }
        debug!(remark, "overpass response carried a remark");
    }
    let mut counts = HashMap::new();
    for element in parsed.elements {
        let Some(id) = element.tags.get("geoname_id").and_then(tag_text) else {
            continue;
        };
        let total = element
            .tags
            .get("total")
            .and_then(tag_text)
            .and_then(|text| text.trim().parse::<f64>().ok())
            .ok_or_else(|| {
                AppError::Parse(format!("count element for {id} has no numeric total"))
            })?;
        counts.insert(id, total);
    }
    Ok(counts)
}

fn tag_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceAdapter for OverpassClient {
    fn job(&self) -> JobKind {
        JobKind::UrbanGreenery
    }

    async fn fetch(&self, cities: &[City]) -> AppResult<Vec<Option<f64>>> {
        if cities.is_empty() {
            return Ok(Vec::new());
        }
        let query = build_query(cities, self.radius_m, self.timeout.as_secs());
        let endpoint = self.endpoint_for(cities.len()).to_string();
        debug!(endpoint = %endpoint, cities = cities.len(), "posting overpass query");

        let response = self
            .http
            .post(&endpoint)
            .form(&[("data", query.as_str())])
            .timeout(self.timeout)
            .send()
            .await?;
        let body = ensure_success(PROVIDER, response).await?.text().await?;
        let counts = parse_counts(&body)?;

        let missing = cities
            .iter()
            .filter(|city| !counts.contains_key(&city.geoname_id))
            .count();
        if missing > 0 {
            warn!(
                missing,
                batch = cities.len(),
                "overpass response lacks some cities; counting zero parks"
            );
        }

        Ok(cities
            .iter()
            .map(|city| Some(counts.get(&city.geoname_id).copied().unwrap_or(0.0)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::seeded_rng;

    fn city(geoname_id: &str, latitude: f64, longitude: f64) -> City {
        City {
            id: 1,
            geoname_id: geoname_id.into(),
            name: format!("City {geoname_id}"),
            name_normalized: format!("city {geoname_id}"),
            country_code: "XX".into(),
            country_name: None,
            latitude,
            longitude,
            population: 50_000,
        }
    }

    #[test]
    fn query_counts_each_city_under_its_own_tag() {
        let query = build_query(
            &[city("2643743", 51.5, -0.12), city("2988507", 48.85, 2.35)],
            10_000,
            180,
        );
        assert!(query.starts_with("[out:json][timeout:180];"));
        assert!(query.contains("node[leisure=park](around:10000,51.5,-0.12)"));
        assert!(query.contains("->.c2643743;"));
        assert!(query.contains("geoname_id=\"2988507\""));
        assert!(query.contains("c2988507.count(ways)"));
        assert_eq!(query.matches("out;").count(), 2);
    }

    #[test]
    fn parses_string_and_numeric_totals() {
        let counts = parse_counts(
            r#"{"elements":[
                {"type":"count","id":0,"tags":{"geoname_id":"1","total":"12"}},
                {"type":"count","id":0,"tags":{"geoname_id":2,"total":7}},
                {"type":"node","id":5}
            ]}"#,
        )
        .unwrap();
        assert_eq!(counts.get("1"), Some(&12.0));
        assert_eq!(counts.get("2"), Some(&7.0));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn rejects_count_without_total() {
        let err = parse_counts(r#"{"elements":[{"tags":{"geoname_id":"1"}}]}"#).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn runtime_error_remark_fails_the_batch() {
        let err = parse_counts(
            r#"{"remark":"runtime error: Query timed out in \"query\" at line 3 after 180 seconds.",
                "elements":[{"tags":{"geoname_id":"1","total":"9"}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AppError::Provider { provider: "overpass", status: 200, .. }
        ));

        let counts = parse_counts(
            r#"{"remark":"note: results may be incomplete","elements":[{"tags":{"geoname_id":"1","total":"9"}}]}"#,
        )
        .unwrap();
        assert_eq!(counts.get("1"), Some(&9.0));
    }

    #[test]
    fn single_city_queries_rotate_mirrors() {
        let client = OverpassClient::new(
            reqwest::Client::new(),
            vec!["http://a".into(), "http://b".into()],
            &AdapterSettings::immediate(JobKind::UrbanGreenery),
            seeded_rng(Some(11)),
        )
        .unwrap();
        assert_eq!(client.endpoint_for(5), "http://a");
        let picked: std::collections::HashSet<String> =
            (0..50).map(|_| client.endpoint_for(1).to_string()).collect();
        assert_eq!(picked.len(), 2);
    }
}

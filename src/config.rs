use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

use crate::attributes::JobKind;
use crate::errors::{AppError, AppResult};

const DEFAULT_OPENWEATHER_HISTORY_URL: &str =
    "http://api.openweathermap.org/data/2.5/air_pollution/history";
const DEFAULT_OPENAQ_LATEST_URL: &str = "https://api.openaq.org/v3/parameters/2/latest";
const DEFAULT_OVERPASS_URLS: &str = "https://overpass.kumi.systems/api/interpreter,\
https://overpass-api.de/api/interpreter,\
https://maps.mail.ru/osm/tools/overpass/api/interpreter";
const DEFAULT_OOKLA_TILES_URL: &str = "https://ookla-open-data.s3.us-west-2.amazonaws.com/shapefiles/performance/type=fixed/year=2025/quarter=2/2025-04-01_performance_fixed_tiles.zip";
const DEFAULT_GEONAMES_URL: &str = "http://download.geonames.org/export/dump/allCountries.zip";
const DEFAULT_SEED_MIN_POPULATION: u64 = 25_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    File,
    Table,
}

/// Request shaping and pacing for one source adapter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdapterSettings {
    pub batch_size: usize,
    pub request_delay: Duration,
    pub delay_jitter: Duration,
    pub timeout: Duration,
    pub retry_count: u32,
    pub max_fallback_radius_m: f64,
    pub search_radius_m: f64,
    pub split_failed_batches: bool,
}

impl AdapterSettings {
    pub fn defaults_for(job: JobKind) -> Self {
        match job {
            JobKind::AirQualityHistory => Self {
                batch_size: 1,
                request_delay: Duration::from_millis(1_100),
                delay_jitter: Duration::ZERO,
                timeout: Duration::from_secs(30),
                retry_count: 2,
                max_fallback_radius_m: 0.0,
                search_radius_m: 0.0,
                split_failed_batches: false,
            },
            JobKind::AirQualityLatest => Self {
                batch_size: 1,
                request_delay: Duration::from_millis(1_000),
                delay_jitter: Duration::ZERO,
                timeout: Duration::from_secs(30),
                retry_count: 2,
                max_fallback_radius_m: 0.0,
                search_radius_m: 25_000.0,
                split_failed_batches: false,
            },
            JobKind::InternetSpeed => Self {
                batch_size: usize::MAX,
                request_delay: Duration::ZERO,
                delay_jitter: Duration::ZERO,
                timeout: Duration::from_secs(300),
                retry_count: 2,
                max_fallback_radius_m: 50_000.0,
                search_radius_m: 0.0,
                split_failed_batches: false,
            },
            JobKind::UrbanGreenery => Self {
                batch_size: 250,
                request_delay: Duration::from_secs(5),
                delay_jitter: Duration::from_millis(1_000),
                timeout: Duration::from_secs(180),
                retry_count: 1,
                max_fallback_radius_m: 0.0,
                search_radius_m: 10_000.0,
                split_failed_batches: true,
            },
        }
    }

    /// Zero delays and no retries; used by tests against local mock servers.
    pub fn immediate(job: JobKind) -> Self {
        Self {
            request_delay: Duration::ZERO,
            delay_jitter: Duration::ZERO,
            retry_count: 0,
            ..Self::defaults_for(job)
        }
    }

    fn from_source(job: JobKind, source: &dyn Fn(&str) -> Option<String>) -> AppResult<Self> {
        let prefix = job.env_prefix();
        let key = |suffix: &str| format!("{prefix}_{suffix}");
        let defaults = Self::defaults_for(job);
        Ok(Self {
            batch_size: parse_or(source, &key("BATCH_SIZE"), defaults.batch_size)?.max(1),
            request_delay: parse_millis(source, &key("DELAY_MS"), defaults.request_delay)?,
            delay_jitter: parse_millis(source, &key("JITTER_MS"), defaults.delay_jitter)?,
            timeout: parse_or(source, &key("TIMEOUT_SECS"), defaults.timeout.as_secs())
                .map(Duration::from_secs)?,
            retry_count: parse_or(source, &key("RETRIES"), defaults.retry_count)?,
            max_fallback_radius_m: parse_or(
                source,
                &key("FALLBACK_RADIUS_M"),
                defaults.max_fallback_radius_m,
            )?,
            search_radius_m: parse_or(source, &key("SEARCH_RADIUS_M"), defaults.search_radius_m)?,
            split_failed_batches: parse_bool(
                source,
                &key("SPLIT_FAILED_BATCHES"),
                defaults.split_failed_batches,
            ),
        })
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub ledger_backend: LedgerBackend,
    pub openweather_api_key: Option<SecretString>,
    pub openaq_api_key: Option<SecretString>,
    pub openweather_history_url: String,
    pub openaq_latest_url: String,
    pub overpass_urls: Vec<String>,
    pub ookla_tiles_url: String,
    pub geonames_url: String,
    pub seed_min_population: u64,
    pub air_quality_history: AdapterSettings,
    pub air_quality_latest: AdapterSettings,
    pub internet_speed: AdapterSettings,
    pub urban_greenery: AdapterSettings,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub data_dir: String,
    pub ledger_dir: String,
    pub ledger_backend: LedgerBackend,
    pub has_openweather_key: bool,
    pub has_openaq_key: bool,
    pub overpass_mirrors: usize,
    pub seed_min_population: u64,
}

impl AppConfig {
    /// Reads the process environment. `database`, when given, takes the place
    /// of `DATABASE_URL`, which may then be left unset.
    pub fn from_env_with_database(database: Option<&Path>) -> AppResult<Self> {
        load_dotenv_if_applicable();
        Self::from_source_with_database(&|key: &str| env::var(key).ok(), database)
    }

    /// Defaults for everything except the database location.
    pub fn for_database<P: AsRef<Path>>(database_path: P) -> AppResult<Self> {
        Self::from_source_with_database(&|_: &str| None, Some(database_path.as_ref()))
    }

    pub fn from_source_with_database(
        source: &dyn Fn(&str) -> Option<String>,
        database: Option<&Path>,
    ) -> AppResult<Self> {
        let database = database.map(|path| path.to_string_lossy().to_string());
        Self::from_source(&|key: &str| match &database {
            Some(path) if key == "DATABASE_URL" => Some(path.clone()),
            _ => source(key),
        })
    }

    pub fn from_source(source: &dyn Fn(&str) -> Option<String>) -> AppResult<Self> {
        let read = |key: &str| source(key).filter(|v| !v.trim().is_empty());
        let database_url = read("DATABASE_URL")
            .ok_or_else(|| AppError::Config("DATABASE_URL environment variable not set".into()))?;
        let database_path = parse_database_path(&database_url)?;
        let data_dir = read("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));
        let ledger_dir = read("LEDGER_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("progress"));
        let ledger_backend = match read("LEDGER_BACKEND").as_deref().map(str::trim) {
            None | Some("file") => LedgerBackend::File,
            Some("table") => LedgerBackend::Table,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "LEDGER_BACKEND must be 'file' or 'table', got '{other}'"
                )))
            }
        };
        let overpass_urls = read("OVERPASS_URLS")
            .unwrap_or_else(|| DEFAULT_OVERPASS_URLS.to_string())
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect::<Vec<_>>();
        if overpass_urls.is_empty() {
            return Err(AppError::Config(
                "OVERPASS_URLS must list at least one endpoint".into(),
            ));
        }

        Ok(Self {
            database_path,
            data_dir,
            ledger_dir,
            ledger_backend,
            openweather_api_key: read("OPENWEATHER_API_KEY")
                .map(|v| SecretString::new(v.into())),
            openaq_api_key: read("OPENAQ_API_KEY").map(|v| SecretString::new(v.into())),
            openweather_history_url: read("OPENWEATHER_HISTORY_URL")
                .unwrap_or_else(|| DEFAULT_OPENWEATHER_HISTORY_URL.to_string()),
            openaq_latest_url: read("OPENAQ_LATEST_URL")
                .unwrap_or_else(|| DEFAULT_OPENAQ_LATEST_URL.to_string()),
            overpass_urls,
            ookla_tiles_url: read("OOKLA_TILES_URL")
                .unwrap_or_else(|| DEFAULT_OOKLA_TILES_URL.to_string()),
            geonames_url: read("GEONAMES_URL")
                .unwrap_or_else(|| DEFAULT_GEONAMES_URL.to_string()),
            seed_min_population: parse_or(
                source,
                "SEED_MIN_POPULATION",
                DEFAULT_SEED_MIN_POPULATION,
            )?,
            air_quality_history: AdapterSettings::from_source(JobKind::AirQualityHistory, source)?,
            air_quality_latest: AdapterSettings::from_source(JobKind::AirQualityLatest, source)?,
            internet_speed: AdapterSettings::from_source(JobKind::InternetSpeed, source)?,
            urban_greenery: AdapterSettings::from_source(JobKind::UrbanGreenery, source)?,
        })
    }

    pub fn adapter_settings(&self, job: JobKind) -> &AdapterSettings {
        match job {
            JobKind::AirQualityHistory => &self.air_quality_history,
            JobKind::AirQualityLatest => &self.air_quality_latest,
            JobKind::InternetSpeed => &self.internet_speed,
            JobKind::UrbanGreenery => &self.urban_greenery,
        }
    }

    pub fn adapter_settings_mut(&mut self, job: JobKind) -> &mut AdapterSettings {
        match job {
            JobKind::AirQualityHistory => &mut self.air_quality_history,
            JobKind::AirQualityLatest => &mut self.air_quality_latest,
            JobKind::InternetSpeed => &mut self.internet_speed,
            JobKind::UrbanGreenery => &mut self.urban_greenery,
        }
    }

    /// Fails when a credential the job needs is missing.
    pub fn validate_for(&self, job: JobKind) -> AppResult<()> {
        match job {
            JobKind::AirQualityHistory if self.openweather_api_key.is_none() => Err(
                AppError::Config("OPENWEATHER_API_KEY is required for the air-quality job".into()),
            ),
            JobKind::AirQualityLatest if self.openaq_api_key.is_none() => Err(AppError::Config(
                "OPENAQ_API_KEY is required for the air-quality-latest job".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn ledger_path(&self, job: JobKind) -> PathBuf {
        self.ledger_dir.join(job.ledger_file_name())
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.to_string_lossy().to_string(),
            data_dir: self.data_dir.to_string_lossy().to_string(),
            ledger_dir: self.ledger_dir.to_string_lossy().to_string(),
            ledger_backend: self.ledger_backend,
            has_openweather_key: self.openweather_api_key.is_some(),
            has_openaq_key: self.openaq_api_key.is_some(),
            overpass_mirrors: self.overpass_urls.len(),
            seed_min_population: self.seed_min_population,
        }
    }
}

fn parse_database_path(url: &str) -> AppResult<PathBuf> {
    let trimmed = url.trim();
    let path = trimmed
        .strip_prefix("sqlite://")
        .or_else(|| trimmed.strip_prefix("sqlite:"))
        .unwrap_or(trimmed);
    if path.contains("://") {
        return Err(AppError::Config(format!(
            "DATABASE_URL must point at a SQLite file, got '{trimmed}'"
        )));
    }
    Ok(PathBuf::from(path))
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool(&|key: &str| env::var(key).ok(), "ALLOW_DOTENV", false)
}

fn parse_bool(source: &dyn Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    source(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_or<T: std::str::FromStr>(
    source: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> AppResult<T> {
    match source(key) {
        Some(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("invalid value for {key}: '{value}'"))),
        _ => Ok(default),
    }
}

fn parse_millis(
    source: &dyn Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> AppResult<Duration> {
    parse_or(source, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> AppResult<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_source(&|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn builds_public_profile_without_secrets() {
        let config = config_from(&[
            ("DATABASE_URL", "sqlite://cities.db"),
            ("OPENWEATHER_API_KEY", "secret"),
            ("DATA_DIR", "/tmp/cityrank"),
            ("LEDGER_BACKEND", "table"),
        ])
        .unwrap();
        let public = config.public_profile();

        assert_eq!(public.database_path, "cities.db");
        assert_eq!(public.ledger_dir, "/tmp/cityrank/progress");
        assert_eq!(public.ledger_backend, LedgerBackend::Table);
        assert!(public.has_openweather_key);
        assert!(!public.has_openaq_key);
        assert_eq!(public.overpass_mirrors, 3);
        assert_eq!(public.seed_min_population, DEFAULT_SEED_MIN_POPULATION);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let err = config_from(&[("OPENWEATHER_API_KEY", "secret")]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let err = config_from(&[("DATABASE_URL", "postgresql://db/cities")]).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn database_override_stands_in_for_the_env_var() {
        let vars: HashMap<String, String> =
            [("OPENAQ_API_KEY".to_string(), "aq".to_string())].into_iter().collect();
        let source = |key: &str| vars.get(key).cloned();

        let config =
            AppConfig::from_source_with_database(&source, Some(Path::new("override.db"))).unwrap();
        assert_eq!(config.database_path, PathBuf::from("override.db"));
        assert!(config.openaq_api_key.is_some());

        let vars_with_url: HashMap<String, String> =
            [("DATABASE_URL".to_string(), "sqlite://env.db".to_string())]
                .into_iter()
                .collect();
        let config = AppConfig::from_source_with_database(
            &|key: &str| vars_with_url.get(key).cloned(),
            Some(Path::new("flag.db")),
        )
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("flag.db"));

        assert!(AppConfig::from_source_with_database(&source, None).is_err());
    }

    #[test]
    fn job_credentials_are_checked_per_job() {
        let config = config_from(&[("DATABASE_URL", "cities.db")]).unwrap();
        assert!(config.validate_for(JobKind::AirQualityHistory).is_err());
        assert!(config.validate_for(JobKind::AirQualityLatest).is_err());
        assert!(config.validate_for(JobKind::UrbanGreenery).is_ok());
        assert!(config.validate_for(JobKind::InternetSpeed).is_ok());
    }

    #[test]
    fn adapter_overrides_are_read_per_job() {
        let config = config_from(&[
            ("DATABASE_URL", "cities.db"),
            ("URBAN_GREENERY_BATCH_SIZE", "50"),
            ("URBAN_GREENERY_DELAY_MS", "0"),
            ("URBAN_GREENERY_SPLIT_FAILED_BATCHES", "false"),
            ("INTERNET_SPEED_FALLBACK_RADIUS_M", "1000"),
        ])
        .unwrap();

        let greenery = config.adapter_settings(JobKind::UrbanGreenery);
        assert_eq!(greenery.batch_size, 50);
        assert_eq!(greenery.request_delay, Duration::ZERO);
        assert!(!greenery.split_failed_batches);
        assert_eq!(greenery.search_radius_m, 10_000.0);
        assert_eq!(
            config.adapter_settings(JobKind::InternetSpeed).max_fallback_radius_m,
            1000.0
        );
        assert_eq!(
            config.adapter_settings(JobKind::AirQualityHistory).request_delay,
            Duration::from_millis(1_100)
        );
    }

    #[test]
    fn rejects_unparseable_overrides() {
        let err = config_from(&[
            ("DATABASE_URL", "cities.db"),
            ("AIR_QUALITY_RETRIES", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("AIR_QUALITY_RETRIES"));
    }
}

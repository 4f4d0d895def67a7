//! Fetch-then-normalize orchestration for one job at a time.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::attributes::{CityAttributeName, JobKind};
use crate::config::{AdapterSettings, AppConfig, LedgerBackend};
use crate::db::bootstrap;
use crate::errors::{AppError, AppResult};
use crate::ledger::{FileLedger, ProgressLedger, TableLedger};
use crate::normalize::{normalize_attribute, NormalizationOutcome};
use crate::sources::{
    expect_aligned, http_client, OoklaTilesClient, OpenAqClient, OpenWeatherClient,
    OverpassClient, SourceAdapter,
};
use crate::store::{AttributeStore, City, RawValueUpdate};
use crate::throttle::{seeded_rng, Backoff, Pacer};

/// Everything a job needs, built once and passed by reference.
pub struct JobContext {
    pub config: AppConfig,
    pub store: AttributeStore,
    pub http: reqwest::Client,
    rng: Arc<Mutex<StdRng>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    pub job: String,
    pub attribute: CityAttributeName,
    pub considered: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub normalization: NormalizationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job: String,
    pub attribute: CityAttributeName,
    pub cities: usize,
    pub completed: Option<usize>,
    pub attribute_rows: usize,
    pub rows_with_value: usize,
}

#[derive(Default)]
struct FetchTally {
    succeeded: usize,
    failed: usize,
}

impl JobContext {
    pub fn new(config: AppConfig, store: AttributeStore) -> AppResult<Self> {
        Ok(Self {
            config,
            store,
            http: http_client()?,
            rng: seeded_rng(None),
        })
    }

    /// Opens the configured database, applying migrations.
    pub fn open(config: AppConfig) -> AppResult<Self> {
        let db = bootstrap(&config.database_path)?;
        Self::new(config, AttributeStore::new(db.connection))
    }

    /// Fixes the jitter and mirror-selection randomness.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = seeded_rng(Some(seed));
        self
    }

    pub fn ledger_for(&self, job: JobKind) -> Box<dyn ProgressLedger> {
        match self.config.ledger_backend {
            LedgerBackend::File => Box::new(FileLedger::new(self.config.ledger_path(job))),
            LedgerBackend::Table => {
                Box::new(TableLedger::new(self.store.connection(), job.as_str()))
            }
        }
    }

    pub fn adapter_for(&self, job: JobKind) -> AppResult<Box<dyn SourceAdapter>> {
        self.config.validate_for(job)?;
        let settings = self.config.adapter_settings(job);
        let missing_key = || AppError::Config(format!("missing API key for the {job} job"));
        let adapter: Box<dyn SourceAdapter> = match job {
            JobKind::AirQualityHistory => Box::new(OpenWeatherClient::new(
                self.http.clone(),
                self.config.openweather_history_url.clone(),
                self.config.openweather_api_key.clone().ok_or_else(missing_key)?,
                settings,
            )),
            JobKind::AirQualityLatest => Box::new(OpenAqClient::new(
                self.http.clone(),
                self.config.openaq_latest_url.clone(),
                self.config.openaq_api_key.clone().ok_or_else(missing_key)?,
                settings,
            )),
            JobKind::InternetSpeed => Box::new(OoklaTilesClient::new(
                self.http.clone(),
                self.config.ookla_tiles_url.clone(),
                self.config.data_dir.join("ookla"),
                settings,
            )),
            JobKind::UrbanGreenery => Box::new(OverpassClient::new(
                self.http.clone(),
                self.config.overpass_urls.clone(),
                settings,
                Arc::clone(&self.rng),
            )?),
        };
        Ok(adapter)
    }
}

/// Runs the fetch pass for `job` to completion, then renormalizes its
/// attribute over the whole table.
pub async fn run_job(ctx: &JobContext, job: JobKind) -> AppResult<JobReport> {
    let adapter = ctx.adapter_for(job)?;
    run_with_adapter(ctx, adapter.as_ref()).await
}

pub async fn run_with_adapter(
    ctx: &JobContext,
    adapter: &dyn SourceAdapter,
) -> AppResult<JobReport> {
    let job = adapter.job();
    let attribute = job.attribute();
    let settings = ctx.config.adapter_settings(job).clone();
    info!(job = job.as_str(), attribute = attribute.as_str(), "starting fetch pass");

    let ledger = job.uses_ledger().then(|| ctx.ledger_for(job));
    let done = match &ledger {
        Some(ledger) => ledger.loaded_keys()?,
        None => HashSet::new(),
    };
    let considered = ctx.store.count_cities()?;
    let pending = ctx.store.pending_cities(&done)?;
    let skipped = considered - pending.len();
    info!(
        job = job.as_str(),
        considered,
        skipped,
        pending = pending.len(),
        "resuming from ledger"
    );

    let tally = fetch_pass(ctx, adapter, ledger.as_deref(), &settings, &pending).await?;
    info!(
        job = job.as_str(),
        succeeded = tally.succeeded,
        failed = tally.failed,
        "fetch pass finished"
    );

    let normalization = normalize_attribute(&ctx.store, attribute)?;
    Ok(JobReport {
        job: job.as_str().to_string(),
        attribute,
        considered,
        skipped,
        succeeded: tally.succeeded,
        failed: tally.failed,
        normalization,
    })
}

async fn fetch_pass(
    ctx: &JobContext,
    adapter: &dyn SourceAdapter,
    ledger: Option<&dyn ProgressLedger>,
    settings: &AdapterSettings,
    pending: &[City],
) -> AppResult<FetchTally> {
    let pacer = Pacer::from_settings(settings, Arc::clone(&ctx.rng));
    let backoff = Backoff::from_settings(settings, Arc::clone(&ctx.rng));
    let total_batches = pending.len().div_ceil(settings.batch_size.max(1));
    let mut tally = FetchTally::default();

    for (batch_no, chunk) in pending.chunks(settings.batch_size.max(1)).enumerate() {
        pacer.wait().await;
        debug!(
            batch = batch_no + 1,
            of = total_batches,
            cities = chunk.len(),
            "fetching batch"
        );
        match fetch_with_retry(adapter, &backoff, chunk).await {
            Ok(values) => {
                commit(ctx, adapter.job(), ledger, chunk, values)?;
                tally.succeeded += chunk.len();
            }
            Err(err) if settings.split_failed_batches && chunk.len() > 1 => {
                warn!(
                    error = %err,
                    batch = batch_no + 1,
                    cities = chunk.len(),
                    "batch failed; retrying its cities one at a time"
                );
                for city in chunk {
                    pacer.wait().await;
                    let single = std::slice::from_ref(city);
                    match fetch_with_retry(adapter, &backoff, single).await {
                        Ok(values) => {
                            commit(ctx, adapter.job(), ledger, single, values)?;
                            tally.succeeded += 1;
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                city = %city.name,
                                geoname_id = %city.geoname_id,
                                "fetch failed; skipping city"
                            );
                            tally.failed += 1;
                        }
                    }
                }
            }
            Err(err) => {
                match chunk {
                    [city] => warn!(
                        error = %err,
                        city = %city.name,
                        geoname_id = %city.geoname_id,
                        "fetch failed; skipping city"
                    ),
                    _ => warn!(
                        error = %err,
                        batch = batch_no + 1,
                        cities = chunk.len(),
                        "batch fetch failed; skipping batch"
                    ),
                }
                tally.failed += chunk.len();
            }
        }
    }
    Ok(tally)
}

async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    backoff: &Backoff,
    cities: &[City],
) -> AppResult<Vec<Option<f64>>> {
    let label = adapter.job().as_str();
    let values = backoff.retry(label, |_| adapter.fetch(cities)).await?;
    expect_aligned(label, cities, values)
}

/// Commits the batch's raw values, then appends its keys to the ledger.
fn commit(
    ctx: &JobContext,
    job: JobKind,
    ledger: Option<&dyn ProgressLedger>,
    cities: &[City],
    values: Vec<Option<f64>>,
) -> AppResult<()> {
    let no_data = job.no_data();
    let updates: Vec<RawValueUpdate> = cities
        .iter()
        .zip(values)
        .map(|(city, value)| RawValueUpdate {
            city_id: city.id,
            raw_value: value.or_else(|| no_data.value()),
        })
        .collect();
    ctx.store.upsert_raw_values(job.attribute(), &updates)?;

    if let [city] = cities {
        info!(
            city = %city.name,
            geoname_id = %city.geoname_id,
            raw_value = ?updates[0].raw_value,
            "raw value saved"
        );
    } else {
        info!(cities = cities.len(), "batch raw values saved");
    }

    if let Some(ledger) = ledger {
        let keys: Vec<&str> = cities.iter().map(|city| city.geoname_id.as_str()).collect();
        ledger.mark_all_done(&keys)?;
    }
    Ok(())
}

/// Re-runs only the normalize pass.
pub fn run_normalize(
    ctx: &JobContext,
    attribute: CityAttributeName,
) -> AppResult<NormalizationOutcome> {
    normalize_attribute(&ctx.store, attribute)
}

pub fn job_status(ctx: &JobContext) -> AppResult<Vec<JobStatus>> {
    let cities = ctx.store.list_cities()?;
    let known: HashSet<&str> = cities.iter().map(|c| c.geoname_id.as_str()).collect();
    let mut statuses = Vec::with_capacity(JobKind::ALL.len());
    for job in JobKind::ALL {
        let completed = if job.uses_ledger() {
            let keys = ctx.ledger_for(job).loaded_keys()?;
            Some(keys.iter().filter(|key| known.contains(key.as_str())).count())
        } else {
            None
        };
        let rows = ctx.store.attribute_rows(job.attribute())?;
        statuses.push(JobStatus {
            job: job.as_str().to_string(),
            attribute: job.attribute(),
            cities: cities.len(),
            completed,
            attribute_rows: rows.len(),
            rows_with_value: rows.iter().filter(|row| row.raw_value.is_some()).count(),
        });
    }
    Ok(statuses)
}

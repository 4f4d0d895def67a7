//! Loads significant populated places from a GeoNames dump into `cities`.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::ensure_dataset;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::store::{AttributeStore, NewCity};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(1_800);
const UPSERT_CHUNK: usize = 5_000;

const COL_ID: usize = 0;
const COL_NAME: usize = 1;
const COL_LATITUDE: usize = 4;
const COL_LONGITUDE: usize = 5;
const COL_FEATURE_CODE: usize = 7;
const COL_COUNTRY_CODE: usize = 8;
const COL_POPULATION: usize = 14;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub rows_read: usize,
    pub malformed: usize,
    pub kept: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Capitals (`PPLC`), first-order admin seats (`PPLA`), and plain populated
/// places (`PPL`) above `min_population`.
pub fn is_significant(feature_code: &str, population: u64, min_population: u64) -> bool {
    match feature_code {
        "PPLC" | "PPLA" => true,
        "PPL" => population > min_population,
        _ => false,
    }
}

/// English short name for an ISO 3166-1 alpha-2 code, if it is one.
pub fn country_name(country_code: &str) -> Option<String> {
    rust_iso3166::from_alpha2(&country_code.trim().to_ascii_uppercase())
        .map(|country| country.name.to_string())
}

pub fn parse_geonames<R: Read>(
    reader: R,
    min_population: u64,
) -> AppResult<(Vec<NewCity>, SeedReport)> {
    let mut rows = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(reader);

    let mut report = SeedReport::default();
    let mut cities = Vec::new();
    for record in rows.records() {
        let record = record?;
        report.rows_read += 1;
        if record.len() <= COL_POPULATION {
            report.malformed += 1;
            continue;
        }
        let population = match record[COL_POPULATION].trim() {
            "" => 0,
            text => match text.parse::<u64>() {
                Ok(value) => value,
                Err(_) => {
                    report.malformed += 1;
                    continue;
                }
            },
        };
        if !is_significant(record[COL_FEATURE_CODE].trim(), population, min_population) {
            continue;
        }
        let (Ok(latitude), Ok(longitude)) = (
            record[COL_LATITUDE].trim().parse::<f64>(),
            record[COL_LONGITUDE].trim().parse::<f64>(),
        ) else {
            report.malformed += 1;
            continue;
        };
        let country_code = record[COL_COUNTRY_CODE].trim().to_string();
        cities.push(NewCity {
            geoname_id: record[COL_ID].trim().to_string(),
            name: record[COL_NAME].trim().to_string(),
            country_name: country_name(&country_code),
            country_code,
            latitude,
            longitude,
            population: i64::try_from(population).unwrap_or(i64::MAX),
        });
    }
    report.kept = cities.len();
    Ok((cities, report))
}

/// Seeds from `source` when given, otherwise from the configured GeoNames
/// archive, downloaded once into the data directory.
pub async fn seed_cities(
    store: &AttributeStore,
    config: &AppConfig,
    http: &reqwest::Client,
    source: Option<PathBuf>,
) -> AppResult<SeedReport> {
    let path = match source {
        Some(path) => path,
        None => {
            ensure_dataset(
                http,
                &config.geonames_url,
                &config.data_dir.join("geonames"),
                "txt",
                DOWNLOAD_TIMEOUT,
            )
            .await?
        }
    };
    info!(path = %path.display(), min_population = config.seed_min_population, "reading city dump");

    let min_population = config.seed_min_population;
    let (cities, mut report) =
        tokio::task::spawn_blocking(move || read_dump(&path, min_population))
            .await
            .map_err(|err| AppError::Io(std::io::Error::other(err.to_string())))??;

    for chunk in cities.chunks(UPSERT_CHUNK) {
        let summary = store.upsert_cities(chunk)?;
        report.inserted += summary.inserted;
        report.updated += summary.updated;
        debug!(
            inserted = report.inserted,
            updated = report.updated,
            "city chunk committed"
        );
    }
    info!(
        rows = report.rows_read,
        kept = report.kept,
        inserted = report.inserted,
        updated = report.updated,
        malformed = report.malformed,
        "city seeding finished"
    );
    Ok(report)
}

fn read_dump(path: &Path, min_population: u64) -> AppResult<(Vec<NewCity>, SeedReport)> {
    let file = File::open(path)?;
    parse_geonames(file, min_population)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use tempfile::tempdir;

    const DUMP: &str = "\
2643743\tLondon\tLondon\tLondres\t51.50853\t-0.12574\tP\tPPLC\tGB\t\tENG\tGLA\t\t\t8961989\t\t25\tEurope/London\t2023-01-01
2988507\tParis\tParis\t\t48.85341\t2.3488\tP\tPPLC\tFR\t\t11\t75\t\t\t2138551\t\t42\tEurope/Paris\t2023-01-01
3448439\tSão Paulo\tSao Paulo\t\t-23.5475\t-46.63611\tP\tPPLA\tBR\t\t27\t\t\t\t10021295\t\t769\tAmerica/Sao_Paulo\t2023-01-01
1000001\tSmallville\tSmallville\t\t10.0\t10.0\tP\tPPL\tXX\t\t\t\t\t\t24000\t\t\tUTC\t2023-01-01
1000002\tBigtown\tBigtown\t\t11.0\t11.0\tP\tPPL\tXX\t\t\t\t\t\t25001\t\t\tUTC\t2023-01-01
1000003\tSeat\tSeat\t\t12.0\t12.0\tP\tPPLA\tXX\t\t\t\t\t\t\t\t\tUTC\t2023-01-01
1000004\tRiver\tRiver\t\t13.0\t13.0\tH\tSTM\tXX\t\t\t\t\t\t900000\t\t\tUTC\t2023-01-01
broken\trow
";

    #[test]
    fn keeps_capitals_and_large_places() {
        let (cities, report) = parse_geonames(DUMP.as_bytes(), 25_000).unwrap();
        let ids: Vec<&str> = cities.iter().map(|c| c.geoname_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["2643743", "2988507", "3448439", "1000002", "1000003"]
        );
        assert_eq!(report.rows_read, 8);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.kept, 5);

        let seat = cities.iter().find(|c| c.name == "Seat").unwrap();
        assert_eq!(seat.population, 0);
        assert_eq!(cities[0].country_code, "GB");
        assert!((cities[1].longitude - 2.3488).abs() < 1e-9);
        assert_eq!(cities[1].country_name.as_deref(), Some("France"));
        assert_eq!(cities[2].country_name.as_deref(), Some("Brazil"));
        assert_eq!(seat.country_name, None);
    }

    #[test]
    fn significance_threshold_is_strict() {
        assert!(!is_significant("PPL", 25_000, 25_000));
        assert!(is_significant("PPL", 25_001, 25_000));
        assert!(is_significant("PPLC", 0, 25_000));
        assert!(!is_significant("PPLX", 1_000_000, 25_000));
    }

    #[tokio::test]
    async fn seeding_from_a_local_dump_is_repeatable() {
        let dir = tempdir().unwrap();
        let dump = dir.path().join("allCountries.txt");
        std::fs::write(&dump, DUMP).unwrap();

        let store = AttributeStore::new(open_in_memory().unwrap());
        let config = AppConfig::for_database(dir.path().join("unused.db")).unwrap();
        let http = reqwest::Client::new();

        let first = seed_cities(&store, &config, &http, Some(dump.clone()))
            .await
            .unwrap();
        assert_eq!(first.inserted, 5);
        let second = seed_cities(&store, &config, &http, Some(dump)).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 5);
        assert_eq!(store.count_cities().unwrap(), 5);
        assert_eq!(
            store.find_city("2643743").unwrap().unwrap().name_normalized,
            "london"
        );
        let sao_paulo = store.find_city("3448439").unwrap().unwrap();
        assert_eq!(sao_paulo.name_normalized, "sao paulo");
        assert_eq!(sao_paulo.country_name.as_deref(), Some("Brazil"));
    }
}

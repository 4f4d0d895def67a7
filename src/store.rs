use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::trace;

use crate::attributes::CityAttributeName;
use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct City {
    pub id: i64,
    pub geoname_id: String,
    pub name: String,
    pub name_normalized: String,
    pub country_code: String,
    pub country_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub population: i64,
}

/// A city row as produced by the seeding step, before it has an internal id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCity {
    pub geoname_id: String,
    pub name: String,
    pub country_code: String,
    pub country_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub population: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeRow {
    pub id: i64,
    pub city_id: i64,
    pub raw_value: Option<f64>,
    pub normalized_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawValueUpdate {
    pub city_id: i64,
    pub raw_value: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Lowercased ASCII transliteration used for name lookups: "São Paulo"
/// becomes "sao paulo".
pub fn normalize_name(name: &str) -> String {
    deunicode::deunicode(&name.trim().to_lowercase())
}

/// Shared handle to the city and attribute tables.
#[derive(Clone)]
pub struct AttributeStore {
    db: Arc<Mutex<Connection>>,
}

impl AttributeStore {
    pub fn new(connection: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn list_cities(&self) -> AppResult<Vec<City>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, geoname_id, name, name_normalized, country_code, country_name,
                    latitude, longitude, population
             FROM cities
             ORDER BY id ASC",
        )?;
        let cities = stmt
            .query_map([], parse_city)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cities)
    }

    /// Cities whose external key is not in `done`, in id order.
    pub fn pending_cities(&self, done: &HashSet<String>) -> AppResult<Vec<City>> {
        Ok(self
            .list_cities()?
            .into_iter()
            .filter(|city| !done.contains(&city.geoname_id))
            .collect())
    }

    pub fn count_cities(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cities", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn find_city(&self, geoname_id: &str) -> AppResult<Option<City>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, geoname_id, name, name_normalized, country_code, country_name,
                    latitude, longitude, population
             FROM cities
             WHERE geoname_id = ?1",
            [geoname_id],
            parse_city,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Inserts new cities and refreshes existing ones, keyed by `geoname_id`.
    pub fn upsert_cities(&self, cities: &[NewCity]) -> AppResult<SeedSummary> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut summary = SeedSummary::default();
        {
            let mut exists = tx.prepare("SELECT 1 FROM cities WHERE geoname_id = ?1")?;
            let mut upsert = tx.prepare(
                "INSERT INTO cities (geoname_id, name, name_normalized, country_code, country_name,
                                     latitude, longitude, population)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(geoname_id) DO UPDATE SET
                    name = excluded.name,
                    name_normalized = excluded.name_normalized,
                    country_code = excluded.country_code,
                    country_name = COALESCE(excluded.country_name, cities.country_name),
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    population = excluded.population",
            )?;
            for city in cities {
                let existed = exists
                    .query_row([&city.geoname_id], |_| Ok(()))
                    .optional()?
                    .is_some();
                upsert.execute(params![
                    city.geoname_id,
                    city.name,
                    normalize_name(&city.name),
                    city.country_code,
                    city.country_name,
                    city.latitude,
                    city.longitude,
                    city.population,
                ])?;
                if existed {
                    summary.updated += 1;
                } else {
                    summary.inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(summary)
    }

    /// Writes a raw measurement. New rows start with a normalized score of 0;
    /// existing rows keep theirs until the next normalize pass.
    pub fn upsert_raw_value(
        &self,
        city_id: i64,
        attribute: CityAttributeName,
        raw_value: Option<f64>,
    ) -> AppResult<()> {
        self.upsert_raw_values(
            attribute,
            &[RawValueUpdate {
                city_id,
                raw_value,
            }],
        )
    }

    /// Batch form of [`upsert_raw_value`](Self::upsert_raw_value), committed
    /// as one transaction.
    pub fn upsert_raw_values(
        &self,
        attribute: CityAttributeName,
        updates: &[RawValueUpdate],
    ) -> AppResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO city_attributes (city_id, attribute_name, raw_value, normalized_score, updated_at)
                 VALUES (?1, ?2, ?3, 0, DATETIME('now'))
                 ON CONFLICT(city_id, attribute_name) DO UPDATE SET
                    raw_value = excluded.raw_value,
                    updated_at = excluded.updated_at",
            )?;
            for update in updates {
                stmt.execute(params![update.city_id, attribute.as_str(), update.raw_value])?;
            }
        }
        tx.commit()?;
        trace!(
            attribute = attribute.as_str(),
            rows = updates.len(),
            "raw values committed"
        );
        Ok(())
    }

    pub fn attribute_rows(&self, attribute: CityAttributeName) -> AppResult<Vec<AttributeRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, city_id, raw_value, normalized_score
             FROM city_attributes
             WHERE attribute_name = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([attribute.as_str()], parse_attribute_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn attribute_for_city(
        &self,
        city_id: i64,
        attribute: CityAttributeName,
    ) -> AppResult<Option<AttributeRow>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT id, city_id, raw_value, normalized_score
             FROM city_attributes
             WHERE city_id = ?1 AND attribute_name = ?2",
            params![city_id, attribute.as_str()],
            parse_attribute_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Rewrites normalized scores by row id in a single transaction.
    pub fn write_normalized_scores(&self, scores: &[(i64, f64)]) -> AppResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE city_attributes SET normalized_score = ?2 WHERE id = ?1")?;
            for (row_id, score) in scores {
                updated += stmt.execute(params![row_id, score])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }
}

fn parse_city(row: &Row<'_>) -> rusqlite::Result<City> {
    Ok(City {
        id: row.get(0)?,
        geoname_id: row.get(1)?,
        name: row.get(2)?,
        name_normalized: row.get(3)?,
        country_code: row.get(4)?,
        country_name: row.get(5)?,
        latitude: row.get(6)?,
        longitude: row.get(7)?,
        population: row.get(8)?,
    })
}

fn parse_attribute_row(row: &Row<'_>) -> rusqlite::Result<AttributeRow> {
    Ok(AttributeRow {
        id: row.get(0)?,
        city_id: row.get(1)?,
        raw_value: row.get(2)?,
        normalized_score: row.get(3)?,
    })
}

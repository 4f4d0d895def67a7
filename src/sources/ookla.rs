use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use geo::{LineString, Polygon};
use shapefile::dbase::FieldValue;
use shapefile::{PolygonRing, Shape};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::archive::ensure_dataset;
use crate::attributes::JobKind;
use crate::config::AdapterSettings;
use crate::errors::{AppError, AppResult};
use crate::geo_index::{Tile, TileIndex};
use crate::sources::SourceAdapter;
use crate::store::City;

const SPEED_FIELD: &str = "avg_d_kbps";

/// Fixed-broadband download speed from the Ookla open data tiles.
pub struct OoklaTilesClient {
    http: reqwest::Client,
    url: String,
    data_dir: PathBuf,
    timeout: Duration,
    max_fallback_radius_m: f64,
    index: OnceCell<TileIndex>,
}

impl OoklaTilesClient {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        settings: &AdapterSettings,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            data_dir: data_dir.into(),
            timeout: settings.timeout,
            max_fallback_radius_m: settings.max_fallback_radius_m,
            index: OnceCell::new(),
        }
    }

    /// Uses tiles already in memory instead of the downloaded dataset.
    pub fn with_tiles(tiles: Vec<Tile>, settings: &AdapterSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: String::new(),
            data_dir: PathBuf::new(),
            timeout: settings.timeout,
            max_fallback_radius_m: settings.max_fallback_radius_m,
            index: OnceCell::new_with(Some(TileIndex::new(tiles))),
        }
    }

    async fn index(&self) -> AppResult<&TileIndex> {
        self.index
            .get_or_try_init(|| async {
                let shp = ensure_dataset(
                    &self.http,
                    &self.url,
                    &self.data_dir,
                    "shp",
                    self.timeout,
                )
                .await?;
                info!(path = %shp.display(), "loading speed tiles");
                let tiles = tokio::task::spawn_blocking(move || load_tiles(&shp))
                    .await
                    .map_err(|err| AppError::Io(std::io::Error::other(err.to_string())))??;
                info!(tiles = tiles.len(), "speed tiles loaded");
                Ok::<_, AppError>(TileIndex::new(tiles))
            })
            .await
    }
}

/// Reads every polygon with a usable `avg_d_kbps`, projected to metres.
pub fn load_tiles(path: &Path) -> AppResult<Vec<Tile>> {
    let mut reader = shapefile::Reader::from_path(path)?;
    let mut tiles = Vec::new();
    let mut skipped = 0_usize;
    for entry in reader.iter_shapes_and_records() {
        let (shape, record) = entry?;
        let Some(kbps) = record.get(SPEED_FIELD).and_then(field_number) else {
            skipped += 1;
            continue;
        };
        match shape {
            Shape::Polygon(polygon) => {
                for lon_lat in polygons_from_rings(polygon.rings()) {
                    tiles.push(Tile::from_lon_lat(&lon_lat, kbps));
                }
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "ignored tile records without a polygon or speed");
    }
    Ok(tiles)
}

fn field_number(value: &FieldValue) -> Option<f64> {
    let number = match value {
        FieldValue::Numeric(value) => *value,
        FieldValue::Float(value) => value.map(f64::from),
        FieldValue::Integer(value) => Some(f64::from(*value)),
        FieldValue::Double(value) | FieldValue::Currency(value) => Some(*value),
        FieldValue::Character(Some(text)) => text.trim().parse().ok(),
        _ => None,
    };
    number.filter(|value| value.is_finite())
}

/// Groups rings into polygons: each outer ring starts a polygon and the inner
/// rings after it become its holes.
fn polygons_from_rings(rings: &[PolygonRing<shapefile::Point>]) -> Vec<Polygon<f64>> {
    let to_line = |points: &[shapefile::Point]| -> LineString<f64> {
        points.iter().map(|p| (p.x, p.y)).collect::<Vec<_>>().into()
    };
    let mut polygons: Vec<(LineString<f64>, Vec<LineString<f64>>)> = Vec::new();
    for ring in rings {
        match ring {
            PolygonRing::Outer(points) => polygons.push((to_line(points), Vec::new())),
            PolygonRing::Inner(points) => match polygons.last_mut() {
                Some((_, holes)) => holes.push(to_line(points)),
                None => polygons.push((to_line(points), Vec::new())),
            },
        }
    }
    polygons
        .into_iter()
        .map(|(exterior, holes)| Polygon::new(exterior, holes))
        .collect()
}

#[async_trait]
impl SourceAdapter for OoklaTilesClient {
    fn job(&self) -> JobKind {
        JobKind::InternetSpeed
    }

    async fn fetch(&self, cities: &[City]) -> AppResult<Vec<Option<f64>>> {
        let index = self.index().await?;
        let (values, summary) = index.join(cities, self.max_fallback_radius_m);
        info!(
            tiles = index.len(),
            contained = summary.contained,
            nearest = summary.nearest,
            unmatched = summary.unmatched,
            radius_m = self.max_fallback_radius_m,
            "cities joined to speed tiles"
        );
        Ok(values.into_iter().map(Some).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_index::test_support::square;

    fn city(geoname_id: &str, lon: f64, lat: f64) -> City {
        City {
            id: geoname_id.parse().unwrap(),
            geoname_id: geoname_id.into(),
            name: format!("City {geoname_id}"),
            name_normalized: format!("city {geoname_id}"),
            country_code: "XX".into(),
            country_name: None,
            latitude: lat,
            longitude: lon,
            population: 40_000,
        }
    }

    #[test]
    fn outer_rings_own_the_following_holes() {
        let ring = |x: f64| {
            vec![
                shapefile::Point::new(x, 0.0),
                shapefile::Point::new(x, 1.0),
                shapefile::Point::new(x + 1.0, 1.0),
                shapefile::Point::new(x, 0.0),
            ]
        };
        let polygons = polygons_from_rings(&[
            PolygonRing::Outer(ring(0.0)),
            PolygonRing::Inner(ring(0.2)),
            PolygonRing::Outer(ring(5.0)),
        ]);
        assert_eq!(polygons.len(), 2);
        assert_eq!(polygons[0].interiors().len(), 1);
        assert!(polygons[1].interiors().is_empty());
    }

    #[test]
    fn numeric_fields_of_every_kind_are_read() {
        assert_eq!(field_number(&FieldValue::Numeric(Some(5000.0))), Some(5000.0));
        assert_eq!(field_number(&FieldValue::Integer(42)), Some(42.0));
        assert_eq!(field_number(&FieldValue::Numeric(None)), None);
        assert_eq!(
            field_number(&FieldValue::Character(Some(" 12.5 ".into()))),
            Some(12.5)
        );
    }

    #[tokio::test]
    async fn joins_cities_against_in_memory_tiles() {
        let settings = AdapterSettings::immediate(JobKind::InternetSpeed);
        let client = OoklaTilesClient::with_tiles(
            vec![Tile::from_lon_lat(&square(2.0, 48.0, 0.01), 5000.0)],
            &settings,
        );
        let values = client
            .fetch(&[city("1", 2.005, 48.005), city("2", 120.0, -30.0)])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(5.0), Some(0.0)]);
    }
}

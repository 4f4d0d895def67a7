//! Point-in-tile join over a spatial index, in World Mercator metres.

use geo::{BoundingRect, Contains, Coord, EuclideanDistance, MapCoords, Point, Polygon};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{Envelope, RTree, RTreeObject, SelectionFunction, AABB};
use serde::Serialize;

use crate::store::City;

/// WGS84 semi-major axis in metres.
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 first eccentricity.
const WGS84_E: f64 = 0.081_819_190_842_621_5;
const MAX_LATITUDE: f64 = 89.5;

/// Projects WGS84 lon/lat degrees onto World Mercator (EPSG:3395).
pub fn mercator(lon: f64, lat: f64) -> Coord<f64> {
    let lambda = lon.to_radians();
    let phi = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
    let e_sin = WGS84_E * phi.sin();
    let conformal = (std::f64::consts::FRAC_PI_4 + phi / 2.0).tan()
        * ((1.0 - e_sin) / (1.0 + e_sin)).powf(WGS84_E / 2.0);
    Coord {
        x: WGS84_A * lambda,
        y: WGS84_A * conformal.ln(),
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    /// Footprint in projected metres.
    pub polygon: Polygon<f64>,
    pub avg_d_kbps: f64,
}

impl Tile {
    pub fn from_lon_lat(polygon: &Polygon<f64>, avg_d_kbps: f64) -> Self {
        Self {
            polygon: polygon.map_coords(|c| mercator(c.x, c.y)),
            avg_d_kbps,
        }
    }

    pub fn mbps(&self) -> f64 {
        self.avg_d_kbps / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TileMatch {
    Contained { tile: usize },
    Nearest { tile: usize, distance_m: f64 },
    Unmatched,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JoinSummary {
    pub contained: usize,
    pub nearest: usize,
    pub unmatched: usize,
}

type IndexedBox = GeomWithData<Rectangle<[f64; 2]>, usize>;

pub struct TileIndex {
    tiles: Vec<Tile>,
    tree: RTree<IndexedBox>,
}

impl TileIndex {
    pub fn new(tiles: Vec<Tile>) -> Self {
        let boxes = tiles
            .iter()
            .enumerate()
            .filter_map(|(idx, tile)| {
                let rect = tile.polygon.bounding_rect()?;
                Some(GeomWithData::new(
                    Rectangle::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                    idx,
                ))
            })
            .collect();
        Self {
            tiles,
            tree: RTree::bulk_load(boxes),
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    fn candidates(&self, window: AABB<[f64; 2]>) -> impl Iterator<Item = usize> + '_ {
        self.tree
            .locate_with_selection_function(IntersectsWindow(window))
            .map(|entry| entry.data)
    }

    /// Tile strictly containing the projected point; the lowest file index
    /// wins when tiles overlap.
    pub fn containing(&self, point: Coord<f64>) -> Option<usize> {
        let target = Point::from(point);
        self.candidates(AABB::from_point([point.x, point.y]))
            .filter(|idx| self.tiles[*idx].polygon.contains(&target))
            .min()
    }

    /// Closest tile within `max_distance_m`, ties broken by file index.
    pub fn nearest_within(&self, point: Coord<f64>, max_distance_m: f64) -> Option<(usize, f64)> {
        if max_distance_m.is_nan() || max_distance_m < 0.0 {
            return None;
        }
        let target = Point::from(point);
        let window = AABB::from_corners(
            [point.x - max_distance_m, point.y - max_distance_m],
            [point.x + max_distance_m, point.y + max_distance_m],
        );
        self.candidates(window)
            .map(|idx| (idx, self.tiles[idx].polygon.euclidean_distance(&target)))
            .filter(|(_, distance)| *distance <= max_distance_m)
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    pub fn locate(&self, lon: f64, lat: f64, max_distance_m: f64) -> TileMatch {
        let point = mercator(lon, lat);
        if let Some(tile) = self.containing(point) {
            return TileMatch::Contained { tile };
        }
        match self.nearest_within(point, max_distance_m) {
            Some((tile, distance_m)) => TileMatch::Nearest { tile, distance_m },
            None => TileMatch::Unmatched,
        }
    }

    /// Download speed in Mbps per city, in input order. Unmatched cities
    /// get `0.0`.
    pub fn join(&self, cities: &[City], max_distance_m: f64) -> (Vec<f64>, JoinSummary) {
        let mut summary = JoinSummary::default();
        let values = cities
            .iter()
            .map(|city| match self.locate(city.longitude, city.latitude, max_distance_m) {
                TileMatch::Contained { tile } => {
                    summary.contained += 1;
                    self.tiles[tile].mbps()
                }
                TileMatch::Nearest { tile, .. } => {
                    summary.nearest += 1;
                    self.tiles[tile].mbps()
                }
                TileMatch::Unmatched => {
                    summary.unmatched += 1;
                    0.0
                }
            })
            .collect();
        (values, summary)
    }
}

struct IntersectsWindow(AABB<[f64; 2]>);

impl SelectionFunction<IndexedBox> for IntersectsWindow {
    fn should_unpack_parent(&self, envelope: &AABB<[f64; 2]>) -> bool {
        envelope.intersects(&self.0)
    }

    fn should_unpack_leaf(&self, leaf: &IndexedBox) -> bool {
        leaf.envelope().intersects(&self.0)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use geo::{LineString, Polygon};

    /// Axis-aligned lon/lat square.
    pub fn square(min_lon: f64, min_lat: f64, size: f64) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                (min_lon, min_lat),
                (min_lon + size, min_lat),
                (min_lon + size, min_lat + size),
                (min_lon, min_lat + size),
                (min_lon, min_lat),
            ]),
            vec![],
        )
    }
}

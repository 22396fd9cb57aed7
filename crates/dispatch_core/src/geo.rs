//! Geographic primitives: points, haversine distance and polygon shape tests.
//!
//! Territories are small (neighborhood scale), so containment is evaluated in
//! the lat/lng plane while areas are spherical. Shapes that straddle the
//! antimeridian are not supported.

use geo::{
    Area, BoundingRect, ChamberlainDuquetteArea, Coord, EuclideanDistance, Intersects, LineString,
    Point, Rect,
};
use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// H3 resolution used for driver and territory-center indexing (~174m edge).
pub const INDEX_RESOLUTION: Resolution = Resolution::Nine;

/// Distance (degrees) under which a point counts as lying on a polygon edge.
const EDGE_TOLERANCE_DEG: f64 = 1e-9;

/// Polygons whose planar lat/lng area is below this (about a thousandth of a
/// square meter) are treated as degenerate.
const MIN_POLYGON_AREA_DEG2: f64 = 1e-13;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("invalid coordinate ({lat}, {lng})")]
pub struct GeoError {
    pub lat: f64,
    pub lng: f64,
}

/// A WGS84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    pub fn validate(self) -> Result<Self, GeoError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(GeoError {
                lat: self.lat,
                lng: self.lng,
            })
        }
    }

    pub fn to_lat_lng(self) -> Result<LatLng, GeoError> {
        let point = self.validate()?;
        LatLng::new(point.lat, point.lng).map_err(|_| GeoError {
            lat: point.lat,
            lng: point.lng,
        })
    }

    /// H3 cell at [`INDEX_RESOLUTION`] containing this point.
    pub fn to_cell(self) -> Result<CellIndex, GeoError> {
        Ok(self.to_lat_lng()?.to_cell(INDEX_RESOLUTION))
    }

    /// Great-circle distance in meters.
    pub fn distance_m(self, other: GeoPoint) -> f64 {
        haversine_m(self, other)
    }
}

impl From<LatLng> for GeoPoint {
    fn from(value: LatLng) -> Self {
        Self::new(value.lat(), value.lng())
    }
}

fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lng.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lng.to_radians());
    let sin_dlat = ((lat2 - lat1) * 0.5).sin();
    let sin_dlon = ((lon2 - lon1) * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Axis-aligned lat/lng bounds, used to prefilter containment candidates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    /// Inclusive, with the same tolerance as polygon edges.
    pub fn contains(&self, point: GeoPoint) -> bool {
        point.lat >= self.min_lat - EDGE_TOLERANCE_DEG
            && point.lat <= self.max_lat + EDGE_TOLERANCE_DEG
            && point.lng >= self.min_lng - EDGE_TOLERANCE_DEG
            && point.lng <= self.max_lng + EDGE_TOLERANCE_DEG
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self {
            min_lat: rect.min().y,
            max_lat: rect.max().y,
            min_lng: rect.min().x,
            max_lng: rect.max().x,
        }
    }
}

/// Why a polygon definition cannot be used for containment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolygonDefect {
    #[error("polygon has {0} distinct vertices, need at least 3")]
    TooFewVertices(usize),
    #[error("vertex {0} is not a valid coordinate")]
    InvalidVertex(usize),
    #[error("polygon encloses no area")]
    Degenerate,
}

/// Wire form of a polygon: the exterior ring as lat/lng points.
#[derive(Serialize, Deserialize)]
struct PolygonRing {
    ring: Vec<GeoPoint>,
}

/// A simple polygon given by its exterior ring (implicitly closed).
///
/// Serialized as its ring; the `geo` shape (x = lng, y = lat) is rebuilt on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PolygonRing", into = "PolygonRing")]
pub struct Polygon {
    ring: Vec<GeoPoint>,
    shape: geo::Polygon<f64>,
}

impl From<PolygonRing> for Polygon {
    fn from(raw: PolygonRing) -> Self {
        Polygon::new(raw.ring)
    }
}

impl From<Polygon> for PolygonRing {
    fn from(polygon: Polygon) -> Self {
        PolygonRing { ring: polygon.ring }
    }
}

impl Polygon {
    /// Build from an exterior ring; a repeated closing vertex is dropped.
    pub fn new(mut ring: Vec<GeoPoint>) -> Self {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        let exterior: LineString<f64> = ring.iter().map(|p| Coord { x: p.lng, y: p.lat }).collect();
        Self {
            shape: geo::Polygon::new(exterior, Vec::new()),
            ring,
        }
    }

    pub fn ring(&self) -> &[GeoPoint] {
        &self.ring
    }

    pub fn validate(&self) -> Result<(), PolygonDefect> {
        if let Some(index) = self.ring.iter().position(|p| !p.is_valid()) {
            return Err(PolygonDefect::InvalidVertex(index));
        }
        let mut distinct: Vec<GeoPoint> = Vec::with_capacity(self.ring.len());
        for vertex in &self.ring {
            if !distinct.contains(vertex) {
                distinct.push(*vertex);
            }
        }
        if distinct.len() < 3 {
            return Err(PolygonDefect::TooFewVertices(distinct.len()));
        }
        if self.shape.unsigned_area() < MIN_POLYGON_AREA_DEG2 {
            return Err(PolygonDefect::Degenerate);
        }
        Ok(())
    }

    /// Bounds of a usable polygon, or `None` when it has defects.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.validate().ok()?;
        self.shape.bounding_rect().map(BoundingBox::from)
    }

    /// Spherical area in square meters.
    pub fn area_m2(&self) -> f64 {
        if self.ring.len() < 3 {
            return 0.0;
        }
        self.shape.chamberlain_duquette_unsigned_area()
    }

    /// Boundary-inclusive containment test. Points within
    /// [`EDGE_TOLERANCE_DEG`] of an edge count as on it.
    pub fn contains(&self, point: GeoPoint) -> bool {
        if self.ring.len() < 3 || !point.is_valid() {
            return false;
        }
        let point = Point::new(point.lng, point.lat);
        self.shape.intersects(&point) || point.euclidean_distance(self.shape.exterior()) <= EDGE_TOLERANCE_DEG
    }
}

/// Fixed-radius circle synthesized around a territory's published center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackCircle {
    pub center: GeoPoint,
}

impl FallbackCircle {
    /// Radius of every fallback circle.
    pub const RADIUS_M: f64 = 800.0;

    pub fn new(center: GeoPoint) -> Self {
        Self { center }
    }

    pub fn radius_m(&self) -> f64 {
        Self::RADIUS_M
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        self.center.is_valid() && point.is_valid() && self.center.distance_m(point) <= Self::RADIUS_M
    }

    pub fn area_m2(&self) -> f64 {
        std::f64::consts::PI * Self::RADIUS_M * Self::RADIUS_M
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(min_lat: f64, min_lng: f64, size: f64) -> Polygon {
        Polygon::new(vec![
            GeoPoint::new(min_lat, min_lng),
            GeoPoint::new(min_lat, min_lng + size),
            GeoPoint::new(min_lat + size, min_lng + size),
            GeoPoint::new(min_lat + size, min_lng),
        ])
    }

    #[test]
    fn haversine_matches_known_city_distance() {
        let bogota = GeoPoint::new(4.711, -74.0721);
        let medellin = GeoPoint::new(6.2442, -75.5812);
        let km = bogota.distance_m(medellin) / 1000.0;
        assert!(km > 230.0 && km < 250.0, "got {km}km");
    }

    #[test]
    fn polygon_contains_interior_and_boundary() {
        let poly = square(4.60, -74.08, 0.01);
        assert!(poly.contains(GeoPoint::new(4.605, -74.075)));
        // Edge and vertex are inside.
        assert!(poly.contains(GeoPoint::new(4.60, -74.075)));
        assert!(poly.contains(GeoPoint::new(4.61, -74.07)));
        assert!(!poly.contains(GeoPoint::new(4.62, -74.075)));
    }

    #[test]
    fn concave_notch_is_outside() {
        // U shape opening north; the notch between the arms is not covered.
        let poly = Polygon::new(vec![
            GeoPoint::new(4.60, -74.08),
            GeoPoint::new(4.60, -74.05),
            GeoPoint::new(4.63, -74.05),
            GeoPoint::new(4.63, -74.06),
            GeoPoint::new(4.61, -74.06),
            GeoPoint::new(4.61, -74.07),
            GeoPoint::new(4.63, -74.07),
            GeoPoint::new(4.63, -74.08),
        ]);
        assert!(poly.contains(GeoPoint::new(4.605, -74.065)));
        assert!(poly.contains(GeoPoint::new(4.62, -74.075)));
        assert!(!poly.contains(GeoPoint::new(4.62, -74.065)));
        // The notch floor is a boundary edge.
        assert!(poly.contains(GeoPoint::new(4.61, -74.065)));
    }

    #[test]
    fn bounding_box_covers_ring_and_skips_corrupt_polygons() {
        let bounds = square(4.60, -74.08, 0.01).bounding_box().expect("bounds");
        assert!((bounds.min_lat - 4.60).abs() < 1e-12);
        assert!((bounds.max_lng + 74.07).abs() < 1e-12);
        assert!(bounds.contains(GeoPoint::new(4.61, -74.07)));

        let line = Polygon::new(vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)]);
        assert_eq!(line.bounding_box(), None);
    }

    #[test]
    fn serializes_as_ring() {
        let poly = square(4.60, -74.08, 0.01);
        let json = serde_json::to_value(&poly).expect("serialize");
        assert_eq!(json["ring"].as_array().map(Vec::len), Some(4));
        let back: Polygon = serde_json::from_value(json).expect("deserialize");
        assert!(back.contains(GeoPoint::new(4.605, -74.075)));
    }

    #[test]
    fn closing_vertex_is_dropped() {
        let ring = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.0, 1.0),
            GeoPoint::new(1.0, 1.0),
            GeoPoint::new(0.0, 0.0),
        ];
        assert_eq!(Polygon::new(ring).ring().len(), 3);
    }

    #[test]
    fn square_area_is_about_a_square_kilometer() {
        // ~0.009 degrees is ~1km near the equator.
        let poly = square(4.60, -74.08, 0.009);
        let km2 = poly.area_m2() / 1_000_000.0;
        assert!((km2 - 0.99).abs() < 0.05, "got {km2}km2");
    }

    #[test]
    fn defects_are_reported() {
        let line = Polygon::new(vec![GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 1.0)]);
        assert_eq!(line.validate(), Err(PolygonDefect::TooFewVertices(2)));

        let collinear = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.5, 0.5),
            GeoPoint::new(1.0, 1.0),
        ]);
        assert_eq!(collinear.validate(), Err(PolygonDefect::Degenerate));

        let nan = Polygon::new(vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(f64::NAN, 0.5),
            GeoPoint::new(1.0, 1.0),
        ]);
        assert_eq!(nan.validate(), Err(PolygonDefect::InvalidVertex(1)));
    }

    #[test]
    fn fallback_circle_uses_fixed_radius() {
        let circle = FallbackCircle::new(GeoPoint::new(4.5, -74.1));
        // 0.005 degrees of latitude is ~556m.
        assert!(circle.contains(GeoPoint::new(4.505, -74.1)));
        // 0.01 degrees is ~1.1km.
        assert!(!circle.contains(GeoPoint::new(4.51, -74.1)));
    }

    #[test]
    fn invalid_points_do_not_index() {
        assert!(GeoPoint::new(91.0, 0.0).to_cell().is_err());
        assert!(GeoPoint::new(4.6, -74.08).to_cell().is_ok());
    }
}

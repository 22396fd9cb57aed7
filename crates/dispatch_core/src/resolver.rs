//! Territory resolution: a point to zero or one territory.
//!
//! Policy, first match wins:
//!
//! 1. Official polygons covering the point (boundary inclusive). When several
//!    overlap the smallest area wins, ties broken by lowest territory id.
//! 2. Fallback circles whose center lies within [`FALLBACK_RADIUS_M`], nearest
//!    center first, ties broken by lowest territory id.
//! 3. Unresolved.
//!
//! Resolution is a pure query. Corrupt polygons never match.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::geo::GeoPoint;
use crate::model::TerritoryId;
use crate::territory::{Territory, TerritoryShape, TerritoryStore, FALLBACK_RADIUS_M};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Arc<Territory>),
    /// Not an error: the point lies in no known territory.
    Unresolved,
}

impl Resolution {
    pub fn territory(&self) -> Option<&Territory> {
        match self {
            Resolution::Resolved(territory) => Some(territory),
            Resolution::Unresolved => None,
        }
    }

    pub fn id(&self) -> Option<TerritoryId> {
        self.territory().map(|t| t.id)
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }
}

pub struct TerritoryResolver {
    store: Arc<dyn TerritoryStore>,
}

impl TerritoryResolver {
    pub fn new(store: Arc<dyn TerritoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TerritoryStore> {
        &self.store
    }

    pub fn resolve(&self, point: GeoPoint) -> Resolution {
        if !point.is_valid() {
            debug!(lat = point.lat, lng = point.lng, "unresolvable coordinate");
            return Resolution::Unresolved;
        }
        if let Some(territory) = self.smallest_covering_polygon(point) {
            return Resolution::Resolved(territory);
        }
        if let Some(territory) = self.nearest_fallback(point) {
            return Resolution::Resolved(territory);
        }
        Resolution::Unresolved
    }

    fn smallest_covering_polygon(&self, point: GeoPoint) -> Option<Arc<Territory>> {
        self.store
            .polygon_candidates(point)
            .into_iter()
            .filter_map(|territory| {
                let TerritoryShape::Polygon(polygon) = &territory.shape else {
                    return None;
                };
                if let Err(defect) = polygon.validate() {
                    warn!(territory_id = %territory.id, %defect, "skipping corrupt territory polygon");
                    return None;
                }
                let area = polygon.area_m2();
                polygon.contains(point).then_some((area, territory))
            })
            .min_by(|(area_a, a), (area_b, b)| cmp_area(*area_a, *area_b).then_with(|| a.id.cmp(&b.id)))
            .map(|(_, territory)| territory)
    }

    fn nearest_fallback(&self, point: GeoPoint) -> Option<Arc<Territory>> {
        self.store
            .fallback_candidates(point, FALLBACK_RADIUS_M)
            .into_iter()
            .filter_map(|territory| {
                let TerritoryShape::FallbackCircle(circle) = &territory.shape else {
                    return None;
                };
                let distance = circle.center.distance_m(point);
                circle.contains(point).then_some((distance, territory))
            })
            .min_by(|(da, a), (db, b)| {
                da.partial_cmp(db)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(_, territory)| territory)
    }
}

/// Areas within a millionth of each other count as equal so the id tie-break
/// is not decided by floating point noise.
fn cmp_area(a: f64, b: f64) -> Ordering {
    const RELATIVE_TOLERANCE: f64 = 1e-6;
    if (a - b).abs() <= RELATIVE_TOLERANCE * a.abs().max(b.abs()) {
        Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

//! Territories, their adjacency reference data and the territory store contract.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::geo::{BoundingBox, FallbackCircle, GeoPoint, Polygon};
use crate::model::TerritoryId;
use crate::spatial::{grid_disk_cached, grid_radius_for_meters, CellIndexMap};

/// Radius of the circle synthesized for territories without an official polygon.
pub const FALLBACK_RADIUS_M: f64 = FallbackCircle::RADIUS_M;

/// Exactly one representation is authoritative for a territory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerritoryShape {
    Polygon(Polygon),
    FallbackCircle(FallbackCircle),
}

impl TerritoryShape {
    pub fn contains(&self, point: GeoPoint) -> bool {
        match self {
            TerritoryShape::Polygon(polygon) => polygon.validate().is_ok() && polygon.contains(point),
            TerritoryShape::FallbackCircle(circle) => circle.contains(point),
        }
    }

    pub fn area_m2(&self) -> f64 {
        match self {
            TerritoryShape::Polygon(polygon) => polygon.area_m2(),
            TerritoryShape::FallbackCircle(circle) => circle.area_m2(),
        }
    }

    pub fn is_official(&self) -> bool {
        matches!(self, TerritoryShape::Polygon(_))
    }
}

/// A named neighborhood or community used for driver homing and fee tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Territory {
    pub id: TerritoryId,
    pub name: String,
    pub shape: TerritoryShape,
}

impl Territory {
    pub fn polygon(id: TerritoryId, name: impl Into<String>, ring: Vec<GeoPoint>) -> Self {
        Self {
            id,
            name: name.into(),
            shape: TerritoryShape::Polygon(Polygon::new(ring)),
        }
    }

    pub fn fallback(id: TerritoryId, name: impl Into<String>, center: GeoPoint) -> Self {
        Self {
            id,
            name: name.into(),
            shape: TerritoryShape::FallbackCircle(FallbackCircle::new(center)),
        }
    }
}

/// Static, symmetric adjacency between territories.
///
/// Supplied as reference data; never derived from geometry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjacencyMap {
    edges: BTreeMap<TerritoryId, BTreeSet<TerritoryId>>,
}

impl AdjacencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, a: TerritoryId, b: TerritoryId) {
        if a == b {
            return;
        }
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    pub fn are_adjacent(&self, a: TerritoryId, b: TerritoryId) -> bool {
        self.edges.get(&a).is_some_and(|n| n.contains(&b))
    }

    pub fn neighbors(&self, id: TerritoryId) -> impl Iterator<Item = TerritoryId> + '_ {
        self.edges.get(&id).into_iter().flat_map(|n| n.iter().copied())
    }
}

/// Read-only territory data consumed by the resolver and fee classifier.
///
/// Candidate queries may over-include; callers apply the exact containment test.
pub trait TerritoryStore: Send + Sync {
    fn territory(&self, id: TerritoryId) -> Option<Arc<Territory>>;

    /// Official-polygon territories that may cover `point`.
    fn polygon_candidates(&self, point: GeoPoint) -> Vec<Arc<Territory>>;

    /// Fallback-circle territories whose center may lie within `radius_m` of `point`.
    fn fallback_candidates(&self, point: GeoPoint, radius_m: f64) -> Vec<Arc<Territory>>;

    fn are_adjacent(&self, a: TerritoryId, b: TerritoryId) -> bool;
}

#[derive(Debug, Error)]
pub enum TerritoryError {
    #[error("territory {0} already published")]
    Duplicate(TerritoryId),
    #[error("adjacency references unknown territory {0}")]
    UnknownAdjacency(TerritoryId),
    #[error("failed to read territory catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse territory catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Serialized form of a territory data set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerritoryCatalog {
    pub territories: Vec<Territory>,
    #[serde(default)]
    pub adjacency: Vec<(TerritoryId, TerritoryId)>,
}

impl TerritoryCatalog {
    pub fn from_json_str(json: &str) -> Result<Self, TerritoryError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TerritoryError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| TerritoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}

/// In-process territory store: polygons prefiltered by bounding box, fallback
/// centers indexed by H3 cell.
#[derive(Debug, Default)]
pub struct InMemoryTerritoryStore {
    territories: BTreeMap<TerritoryId, Arc<Territory>>,
    polygon_bounds: Vec<(BoundingBox, TerritoryId)>,
    centers: CellIndexMap<TerritoryId>,
    adjacency: AdjacencyMap,
}

impl InMemoryTerritoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: TerritoryCatalog) -> Result<Self, TerritoryError> {
        let mut store = Self::new();
        for territory in catalog.territories {
            store.insert(territory)?;
        }
        for (a, b) in catalog.adjacency {
            store.add_adjacency(a, b)?;
        }
        Ok(store)
    }

    /// Publish a territory. Corrupt polygons are kept; they simply never match.
    pub fn insert(&mut self, territory: Territory) -> Result<(), TerritoryError> {
        if self.territories.contains_key(&territory.id) {
            return Err(TerritoryError::Duplicate(territory.id));
        }
        match &territory.shape {
            TerritoryShape::Polygon(polygon) => {
                if let Err(defect) = polygon.validate() {
                    warn!(territory_id = %territory.id, %defect, "published territory polygon is unusable");
                }
                if let Some(bounds) = polygon.bounding_box() {
                    self.polygon_bounds.push((bounds, territory.id));
                }
            }
            TerritoryShape::FallbackCircle(circle) => match circle.center.to_cell() {
                Ok(cell) => self.centers.insert(territory.id, cell),
                Err(err) => {
                    warn!(territory_id = %territory.id, %err, "fallback center is not a valid coordinate")
                }
            },
        }
        self.territories.insert(territory.id, Arc::new(territory));
        Ok(())
    }

    pub fn add_adjacency(&mut self, a: TerritoryId, b: TerritoryId) -> Result<(), TerritoryError> {
        for id in [a, b] {
            if !self.territories.contains_key(&id) {
                return Err(TerritoryError::UnknownAdjacency(id));
            }
        }
        self.adjacency.insert(a, b);
        Ok(())
    }

    pub fn with_territory(mut self, territory: Territory) -> Result<Self, TerritoryError> {
        self.insert(territory)?;
        Ok(self)
    }

    pub fn with_adjacency(mut self, a: TerritoryId, b: TerritoryId) -> Result<Self, TerritoryError> {
        self.add_adjacency(a, b)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.territories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.territories.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Territory>> {
        self.territories.values()
    }

    pub fn adjacency(&self) -> &AdjacencyMap {
        &self.adjacency
    }
}

impl TerritoryStore for InMemoryTerritoryStore {
    fn territory(&self, id: TerritoryId) -> Option<Arc<Territory>> {
        self.territories.get(&id).cloned()
    }

    fn polygon_candidates(&self, point: GeoPoint) -> Vec<Arc<Territory>> {
        self.polygon_bounds
            .iter()
            .filter(|(bounds, _)| bounds.contains(point))
            .filter_map(|(_, id)| self.territories.get(id).cloned())
            .collect()
    }

    fn fallback_candidates(&self, point: GeoPoint, radius_m: f64) -> Vec<Arc<Territory>> {
        let Ok(origin) = point.to_cell() else {
            return Vec::new();
        };
        let disk = grid_disk_cached(origin, grid_radius_for_meters(radius_m));
        let mut ids = self.centers.get_in_cells(&disk);
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| self.territories.get(&id).cloned())
            .collect()
    }

    fn are_adjacent(&self, a: TerritoryId, b: TerritoryId) -> bool {
        self.adjacency.are_adjacent(a, b)
    }
}

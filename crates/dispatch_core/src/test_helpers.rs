//! Seeded geography shared by unit tests, integration tests, benches and the CLI demo.
//!
//! A handful of Bogotá-like territories:
//!
//! | id | name | shape |
//! |----|------|-------|
//! | 1 | Centro | polygon 4.600..4.610 lat, -74.080..-74.070 lng |
//! | 2 | Centro Histórico | polygon nested inside Centro |
//! | 3 | Las Aguas | polygon east of Centro, sharing its edge |
//! | 4 | Chapinero | polygon ~4km north |
//! | 5 | Usme | fallback circle only |
//! | 6 | Corrupt | two-vertex polygon that never matches |
//!
//! Adjacency: Centro-Las Aguas, Las Aguas-Chapinero.

use std::sync::Arc;

use crate::geo::GeoPoint;
use crate::model::TerritoryId;
use crate::territory::{InMemoryTerritoryStore, Territory, TerritoryStore};

pub const CENTRO: TerritoryId = TerritoryId(1);
pub const CENTRO_HISTORICO: TerritoryId = TerritoryId(2);
pub const LAS_AGUAS: TerritoryId = TerritoryId(3);
pub const CHAPINERO: TerritoryId = TerritoryId(4);
pub const USME: TerritoryId = TerritoryId(5);
pub const CORRUPT: TerritoryId = TerritoryId(6);

/// Inside Centro, outside Centro Histórico.
pub const CENTRO_POINT: GeoPoint = GeoPoint::new(4.602, -74.078);
/// Another Centro point a few hundred meters away.
pub const CENTRO_POINT_B: GeoPoint = GeoPoint::new(4.608, -74.072);
pub const HISTORICO_POINT: GeoPoint = GeoPoint::new(4.605, -74.075);
pub const LAS_AGUAS_POINT: GeoPoint = GeoPoint::new(4.605, -74.065);
pub const CHAPINERO_POINT: GeoPoint = GeoPoint::new(4.645, -74.065);
/// ~330m from the Usme fallback center.
pub const USME_POINT: GeoPoint = GeoPoint::new(4.503, -74.100);
pub const NOWHERE_POINT: GeoPoint = GeoPoint::new(4.300, -74.300);

fn rect(min_lat: f64, min_lng: f64, max_lat: f64, max_lng: f64) -> Vec<GeoPoint> {
    vec![
        GeoPoint::new(min_lat, min_lng),
        GeoPoint::new(min_lat, max_lng),
        GeoPoint::new(max_lat, max_lng),
        GeoPoint::new(max_lat, min_lng),
    ]
}

pub fn seeded_territories() -> Vec<Territory> {
    vec![
        Territory::polygon(CENTRO, "Centro", rect(4.600, -74.080, 4.610, -74.070)),
        Territory::polygon(CENTRO_HISTORICO, "Centro Histórico", rect(4.603, -74.077, 4.607, -74.073)),
        Territory::polygon(LAS_AGUAS, "Las Aguas", rect(4.600, -74.070, 4.610, -74.060)),
        Territory::polygon(CHAPINERO, "Chapinero", rect(4.640, -74.070, 4.650, -74.060)),
        Territory::fallback(USME, "Usme", GeoPoint::new(4.500, -74.100)),
        Territory::polygon(
            CORRUPT,
            "Corrupt",
            vec![GeoPoint::new(4.700, -74.050), GeoPoint::new(4.710, -74.040)],
        ),
    ]
}

/// # Panics
///
/// Panics if the seeded data is inconsistent (should never happen).
pub fn seeded_territory_store() -> InMemoryTerritoryStore {
    let mut store = InMemoryTerritoryStore::new();
    for territory in seeded_territories() {
        store.insert(territory).expect("seeded territories are unique");
    }
    store
        .add_adjacency(CENTRO, LAS_AGUAS)
        .expect("seeded adjacency");
    store
        .add_adjacency(LAS_AGUAS, CHAPINERO)
        .expect("seeded adjacency");
    store
}

pub fn seeded_territory_arc() -> Arc<dyn TerritoryStore> {
    Arc::new(seeded_territory_store())
}

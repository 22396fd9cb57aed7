//! Spatial operations: H3-based indexing and cached distance lookups.
//!
//! This module provides:
//!
//! - **Grid disk queries**: cells within K grid distance, LRU cached
//! - **Distance calculations**: haversine distance between H3 cells, LRU cached
//! - **CellIndexMap**: H3 cell -> key mappings used to index driver positions
//!   and fallback territory centers
//!
//! Resolution is [`INDEX_RESOLUTION`] (9, ~174m edge), suitable for city-scale dispatch.

use std::collections::HashMap;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock};

use h3o::CellIndex;
use lru::LruCache;

use crate::geo::{GeoPoint, INDEX_RESOLUTION};

/// Uncached distance calculation (internal use).
fn distance_km_between_cells_uncached(a: CellIndex, b: CellIndex) -> f64 {
    let a: GeoPoint = h3o::LatLng::from(a).into();
    let b: GeoPoint = h3o::LatLng::from(b).into();
    a.distance_m(b) / 1000.0
}

/// Global distance cache (50,000 entries, ~800KB memory).
fn get_distance_cache() -> &'static Mutex<LruCache<(CellIndex, CellIndex), f64>> {
    static CACHE: OnceLock<Mutex<LruCache<(CellIndex, CellIndex), f64>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(LruCache::new(NonZeroUsize::new(50_000).unwrap_or(NonZeroUsize::MIN))))
}

/// Grid disk cache for candidate searches around pickups.
struct GridDiskCache {
    cache: Mutex<LruCache<(CellIndex, u32), Vec<CellIndex>>>,
}

impl GridDiskCache {
    fn new() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(NonZeroUsize::new(1_000).unwrap_or(NonZeroUsize::MIN))),
        }
    }

    fn get_or_compute(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(_) => return origin.grid_disk::<Vec<_>>(k), // Fallback: compute without cache if mutex poisoned
        };
        cache
            .get_or_insert((origin, k), || origin.grid_disk::<Vec<_>>(k))
            .clone()
    }
}

static GRID_DISK_CACHE: OnceLock<GridDiskCache> = OnceLock::new();

fn get_grid_disk_cache() -> &'static GridDiskCache {
    GRID_DISK_CACHE.get_or_init(GridDiskCache::new)
}

/// Calculate distance between two H3 cells with LRU caching.
///
/// Uses a global LRU cache to avoid repeated H3 cell -> LatLng conversions
/// and haversine calculations for frequently ranked driver/pickup pairs.
pub fn distance_km_between_cells(a: CellIndex, b: CellIndex) -> f64 {
    // Use symmetric key (smaller cell first) to maximize cache hits
    let key = if a < b { (a, b) } else { (b, a) };

    let mut cache = match get_distance_cache().lock() {
        Ok(guard) => guard,
        Err(_) => return distance_km_between_cells_uncached(key.0, key.1), // Fallback: compute without cache if mutex poisoned
    };

    *cache.get_or_insert(key, || distance_km_between_cells_uncached(key.0, key.1))
}

/// Get grid disk with caching.
pub fn grid_disk_cached(origin: CellIndex, k: u32) -> Vec<CellIndex> {
    debug_assert_eq!(
        origin.resolution(),
        INDEX_RESOLUTION,
        "origin resolution must match the index resolution"
    );
    get_grid_disk_cache().get_or_compute(origin, k)
}

/// Smallest grid distance whose disk is guaranteed to cover `radius_m` around a cell.
///
/// Resolution 9 cells are at least ~130m edge anywhere on the globe, so adjacent
/// centers are at least ~225m apart; one extra ring absorbs the origin cell's own extent.
pub fn grid_radius_for_meters(radius_m: f64) -> u32 {
    const MIN_CENTER_SPACING_M: f64 = 225.0;
    (radius_m.max(0.0) / MIN_CENTER_SPACING_M).ceil() as u32 + 1
}

/// Spatial index for efficient lookups by H3 cell.
///
/// Maintains mappings from H3 cells to keys (driver ids, territory ids) for O(1) spatial
/// queries instead of scanning every record. Updated incrementally as keys move.
#[derive(Debug, Clone)]
pub struct CellIndexMap<K> {
    /// Map from H3 cell to keys in that cell
    by_cell: HashMap<CellIndex, Vec<K>>,
    /// Reverse mapping: key -> current cell (for efficient updates)
    key_to_cell: HashMap<K, CellIndex>,
}

impl<K> Default for CellIndexMap<K> {
    fn default() -> Self {
        Self {
            by_cell: HashMap::new(),
            key_to_cell: HashMap::new(),
        }
    }
}

impl<K: Copy + Eq + Hash> CellIndexMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `key` in `cell`, moving it if it was indexed elsewhere.
    pub fn insert(&mut self, key: K, cell: CellIndex) {
        if let Some(old_cell) = self.key_to_cell.get(&key).copied() {
            if old_cell == cell {
                return;
            }
            self.detach(key, old_cell);
        }
        self.by_cell.entry(cell).or_default().push(key);
        self.key_to_cell.insert(key, cell);
    }

    pub fn remove(&mut self, key: K) {
        if let Some(cell) = self.key_to_cell.remove(&key) {
            self.detach(key, cell);
        }
    }

    fn detach(&mut self, key: K, cell: CellIndex) {
        if let Some(keys) = self.by_cell.get_mut(&cell) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_cell.remove(&cell);
            }
        }
    }

    /// All keys in the given cells.
    pub fn get_in_cells(&self, cells: &[CellIndex]) -> Vec<K> {
        let mut result = Vec::new();
        for cell in cells {
            if let Some(keys) = self.by_cell.get(cell) {
                result.extend(keys.iter().copied());
            }
        }
        result
    }

    pub fn cell_of(&self, key: K) -> Option<CellIndex> {
        self.key_to_cell.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.key_to_cell.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_cell.is_empty()
    }
}

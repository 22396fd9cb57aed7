//! Candidate ranking for dispatch.
//!
//! The dispatcher gathers available drivers around the pickup; a
//! [`CandidatePolicy`] orders them. Each candidate gets one offer at a time, so
//! only the head of the ranking matters per dispatch round.

use std::cmp::Ordering;

use crate::model::{DriverId, TerritoryId};
use crate::territory::TerritoryStore;

/// How a driver's home relates to the pickup territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HomeTier {
    /// Pickup resolves to the driver's home territory.
    Home,
    /// Pickup resolves to a territory adjacent to home.
    Adjacent,
    Other,
}

impl HomeTier {
    pub fn classify(territories: &dyn TerritoryStore, home: Option<TerritoryId>, pickup: Option<TerritoryId>) -> Self {
        match (home, pickup) {
            (Some(home), Some(pickup)) if home == pickup => HomeTier::Home,
            (Some(home), Some(pickup)) if territories.are_adjacent(home, pickup) => HomeTier::Adjacent,
            _ => HomeTier::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub driver_id: DriverId,
    pub tier: HomeTier,
    pub pickup_distance_km: f64,
}

/// Ranks candidate drivers for one ride.
pub trait CandidatePolicy: Send + Sync {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering;

    fn name(&self) -> &'static str;

    /// Best candidate, or None when the list is empty.
    fn select(&self, candidates: &[Candidate]) -> Option<DriverId> {
        candidates
            .iter()
            .min_by(|a, b| self.compare(a, b))
            .map(|c| c.driver_id)
    }

    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| self.compare(a, b));
    }
}

fn by_distance(a: &Candidate, b: &Candidate) -> Ordering {
    a.pickup_distance_km
        .total_cmp(&b.pickup_distance_km)
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}

/// Home drivers first, then adjacent, then everyone else; nearest within a tier.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerritoryFirst;

impl CandidatePolicy for TerritoryFirst {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.tier.cmp(&b.tier).then_with(|| by_distance(a, b))
    }

    fn name(&self) -> &'static str {
        "territory_first"
    }
}

/// Pure proximity; ignores home territories.
#[derive(Debug, Default, Clone, Copy)]
pub struct NearestFirst;

impl CandidatePolicy for NearestFirst {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        by_distance(a, b)
    }

    fn name(&self) -> &'static str {
        "nearest_first"
    }
}

//! Fares and commission tiers.
//!
//! The platform fee depends on where a trip happens relative to the driver's
//! home territory. Rules, first match wins:
//!
//! 1. No (resolvable) home territory: [`MatchType::OutsideFence`].
//! 2. Pickup and dropoff both in the home territory: [`MatchType::SameNeighborhood`].
//! 3. Pickup or dropoff in a territory adjacent to home: [`MatchType::AdjacentNeighborhood`].
//! 4. Otherwise [`MatchType::OutsideFence`].
//!
//! Unresolved pickups and dropoffs are never errors; they fall through to rule 4.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::geo::GeoPoint;
use crate::model::TerritoryId;
use crate::resolver::TerritoryResolver;

/// Base fare in currency units.
pub const BASE_FARE: f64 = 2.50;

/// Per-kilometer rate in currency units.
pub const PER_KM_RATE: f64 = 1.50;

/// Round a currency amount to cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    SameNeighborhood,
    AdjacentNeighborhood,
    OutsideFence,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::SameNeighborhood => "SAME_NEIGHBORHOOD",
            MatchType::AdjacentNeighborhood => "ADJACENT_NEIGHBORHOOD",
            MatchType::OutsideFence => "OUTSIDE_FENCE",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commission percentage per match tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    pub same_neighborhood_pct: f64,
    pub adjacent_neighborhood_pct: f64,
    pub outside_fence_pct: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            same_neighborhood_pct: 7.0,
            adjacent_neighborhood_pct: 12.0,
            outside_fence_pct: 20.0,
        }
    }
}

impl FeeSchedule {
    pub fn percentage_for(&self, match_type: MatchType) -> f64 {
        match match_type {
            MatchType::SameNeighborhood => self.same_neighborhood_pct,
            MatchType::AdjacentNeighborhood => self.adjacent_neighborhood_pct,
            MatchType::OutsideFence => self.outside_fence_pct,
        }
    }

    /// Tiers must be percentages and strictly increase from same to outside.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tiers = [
            self.same_neighborhood_pct,
            self.adjacent_neighborhood_pct,
            self.outside_fence_pct,
        ];
        if tiers.iter().any(|pct| !pct.is_finite() || !(0.0..=100.0).contains(pct)) {
            return Err(ConfigError::Invalid(format!(
                "fee percentages must lie in 0..=100, got {tiers:?}"
            )));
        }
        if !(tiers[0] < tiers[1] && tiers[1] < tiers[2]) {
            return Err(ConfigError::Invalid(format!(
                "fee tiers must satisfy same < adjacent < outside, got {tiers:?}"
            )));
        }
        Ok(())
    }
}

/// Distance-based fare estimate.
///
/// Formula: `fare = base_fare + (distance_km * per_km_rate)`, rounded to cents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FareModel {
    pub base_fare: f64,
    pub per_km_rate: f64,
}

impl Default for FareModel {
    fn default() -> Self {
        Self {
            base_fare: BASE_FARE,
            per_km_rate: PER_KM_RATE,
        }
    }
}

impl FareModel {
    pub fn fare_for(&self, pickup: GeoPoint, dropoff: GeoPoint) -> f64 {
        let distance_km = pickup.distance_m(dropoff) / 1000.0;
        round_cents(self.base_fare + distance_km * self.per_km_rate)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_fare.is_finite() && self.base_fare >= 0.0)
            || !(self.per_km_rate.is_finite() && self.per_km_rate >= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "fare model must be non-negative, got base {} per km {}",
                self.base_fare, self.per_km_rate
            )));
        }
        Ok(())
    }
}

/// Which rule produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationReason {
    NoHomeTerritory,
    WithinHomeTerritory,
    PickupAdjacentToHome,
    DropoffAdjacentToHome,
    OutsideHomeFence,
}

impl fmt::Display for ClassificationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClassificationReason::NoHomeTerritory => "driver has no resolvable home territory",
            ClassificationReason::WithinHomeTerritory => "pickup and dropoff are inside the driver's home territory",
            ClassificationReason::PickupAdjacentToHome => "pickup is in a territory adjacent to the driver's home",
            ClassificationReason::DropoffAdjacentToHome => "dropoff is in a territory adjacent to the driver's home",
            ClassificationReason::OutsideHomeFence => "trip is outside the driver's home fence",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub match_type: MatchType,
    pub fee_percentage: f64,
    pub reason: ClassificationReason,
}

/// Commission breakdown for one fare.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeeAssessment {
    pub match_type: MatchType,
    pub fee_percentage: f64,
    pub fare_amount: f64,
    pub fee_amount: f64,
    pub driver_earnings: f64,
    pub reason: ClassificationReason,
}

impl Classification {
    /// `driver_earnings = fare * (1 - fee_percentage / 100)`, in cents.
    pub fn assess(&self, fare_amount: f64) -> FeeAssessment {
        let driver_earnings = round_cents(fare_amount * (1.0 - self.fee_percentage / 100.0));
        FeeAssessment {
            match_type: self.match_type,
            fee_percentage: self.fee_percentage,
            fare_amount,
            fee_amount: round_cents(fare_amount - driver_earnings),
            driver_earnings,
            reason: self.reason,
        }
    }
}

/// Pure fee classification over resolved territories.
pub struct FeeClassifier {
    schedule: FeeSchedule,
    resolver: Arc<TerritoryResolver>,
}

impl FeeClassifier {
    pub fn new(schedule: FeeSchedule, resolver: Arc<TerritoryResolver>) -> Self {
        Self { schedule, resolver }
    }

    pub fn schedule(&self) -> &FeeSchedule {
        &self.schedule
    }

    pub fn classify(
        &self,
        home: Option<TerritoryId>,
        pickup: Option<TerritoryId>,
        dropoff: Option<TerritoryId>,
    ) -> Classification {
        let territories = self.resolver.store();
        let home = home.filter(|id| territories.territory(*id).is_some());
        let (match_type, reason) = match home {
            None => (MatchType::OutsideFence, ClassificationReason::NoHomeTerritory),
            Some(home) if pickup == Some(home) && dropoff == Some(home) => {
                (MatchType::SameNeighborhood, ClassificationReason::WithinHomeTerritory)
            }
            Some(home) => {
                let adjacent = |t: Option<TerritoryId>| t.is_some_and(|t| territories.are_adjacent(home, t));
                if adjacent(pickup) {
                    (MatchType::AdjacentNeighborhood, ClassificationReason::PickupAdjacentToHome)
                } else if adjacent(dropoff) {
                    (MatchType::AdjacentNeighborhood, ClassificationReason::DropoffAdjacentToHome)
                } else {
                    (MatchType::OutsideFence, ClassificationReason::OutsideHomeFence)
                }
            }
        };
        Classification {
            match_type,
            fee_percentage: self.schedule.percentage_for(match_type),
            reason,
        }
    }

    /// Resolve pickup and dropoff, classify, and price `fare_amount`.
    pub fn assess_trip(
        &self,
        home: Option<TerritoryId>,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        fare_amount: f64,
    ) -> FeeAssessment {
        let pickup = self.resolver.resolve(pickup).id();
        let dropoff = self.resolver.resolve(dropoff).id();
        self.classify(home, pickup, dropoff).assess(fare_amount)
    }
}

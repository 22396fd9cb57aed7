use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::pricing::{FeeAssessment, MatchType};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(RideId);
uuid_id!(OfferId);
uuid_id!(
    /// Supplied by the identity layer; trusted as given.
    PassengerId
);
uuid_id!(
    /// Supplied by the identity layer; trusted as given.
    DriverId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerritoryId(pub u32);

impl fmt::Display for TerritoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Offered,
    Accepted,
    Arrived,
    InProgress,
    Completed,
    CanceledByPassenger,
    CanceledByDriver,
    Expired,
}

impl RideStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Offered => "offered",
            RideStatus::Accepted => "accepted",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::CanceledByPassenger => "canceled_by_passenger",
            RideStatus::CanceledByDriver => "canceled_by_driver",
            RideStatus::Expired => "expired",
        }
    }

    /// New offers may be created only in these states.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, RideStatus::Requested | RideStatus::Offered)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideStatus::Completed
                | RideStatus::CanceledByPassenger
                | RideStatus::CanceledByDriver
                | RideStatus::Expired
        )
    }

    /// A driver is bound and the ride holds their availability.
    pub fn holds_driver(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted | RideStatus::Arrived | RideStatus::InProgress
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A passenger's trip request and everything bound to it over its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub passenger_id: PassengerId,
    pub driver_id: Option<DriverId>,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub status: RideStatus,
    pub idempotency_key: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Estimated fare, priced at creation and on reroute.
    pub fare_amount: f64,
    /// Commission assessment; set when a driver is bound.
    pub assessment: Option<FeeAssessment>,
    /// Bumped by the store on every committed write.
    pub version: u64,
}

impl Ride {
    pub fn new(
        passenger_id: PassengerId,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        idempotency_key: Option<String>,
        fare_amount: f64,
        now_ms: u64,
    ) -> Self {
        Self {
            id: RideId::new(),
            passenger_id,
            driver_id: None,
            pickup,
            dropoff,
            status: RideStatus::Requested,
            idempotency_key,
            created_at: now_ms,
            updated_at: now_ms,
            fare_amount,
            assessment: None,
            version: 0,
        }
    }

    pub fn match_type(&self) -> Option<MatchType> {
        self.assessment.as_ref().map(|a| a.match_type)
    }

    pub fn fee_percentage(&self) -> Option<f64> {
        self.assessment.as_ref().map(|a| a.fee_percentage)
    }

    pub fn driver_earnings(&self) -> Option<f64> {
        self.assessment.as_ref().map(|a| a.driver_earnings)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
    Canceled,
}

impl OfferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
            OfferStatus::Expired => "expired",
            OfferStatus::Canceled => "canceled",
        }
    }

    pub fn is_resolved(self) -> bool {
        self != OfferStatus::Pending
    }

    /// Ended by the driver's own answer or silence. Such offers disqualify the
    /// driver for the ride and count against its offer budget; offers the
    /// system canceled (reroute, withdrawal, ride cancel) do neither.
    pub fn is_declined(self) -> bool {
        matches!(self, OfferStatus::Rejected | OfferStatus::Expired)
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-boxed proposal of one ride to one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub status: OfferStatus,
    pub created_at: u64,
    pub expires_at: u64,
    pub responded_at: Option<u64>,
    pub version: u64,
}

impl Offer {
    pub fn new(ride_id: RideId, driver_id: DriverId, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            id: OfferId::new(),
            ride_id,
            driver_id,
            status: OfferStatus::Pending,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            responded_at: None,
            version: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OfferStatus::Pending
    }

    /// Expired once `now` is strictly past the deadline.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Gps,
    Document,
    Admin,
}

/// A driver's verified home territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeBinding {
    pub territory_id: TerritoryId,
    pub verified_at: u64,
    pub verification_method: VerificationMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriverAvailability {
    Offline,
    Available,
    /// Claimed by an accepted, arrived or in-progress ride.
    Busy { ride_id: RideId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    /// At most one home; rebinding overwrites.
    pub home: Option<HomeBinding>,
    pub availability: DriverAvailability,
    pub position: Option<GeoPoint>,
    pub version: u64,
}

impl Driver {
    pub fn new(id: DriverId) -> Self {
        Self {
            id,
            home: None,
            availability: DriverAvailability::Offline,
            position: None,
            version: 0,
        }
    }

    pub fn home_territory(&self) -> Option<TerritoryId> {
        self.home.map(|h| h.territory_id)
    }

    pub fn is_available(&self) -> bool {
        self.availability == DriverAvailability::Available
    }

    pub fn busy_with(&self) -> Option<RideId> {
        match self.availability {
            DriverAvailability::Busy { ride_id } => Some(ride_id),
            _ => None,
        }
    }
}

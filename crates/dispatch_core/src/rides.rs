//! Ride lifecycle.
//!
//! ```text
//! requested --offer--> offered --accept--> accepted --arrive--> arrived --start--> in_progress --complete--> completed
//! requested|offered|accepted|arrived --passenger cancel--> canceled_by_passenger
//! accepted|arrived --driver cancel--> canceled_by_driver
//! requested|offered --expire--> expired
//! ```
//!
//! [`RideStatus::next_status`] is the only transition table. Every other
//! module derives a new ride through [`transition`], so status is written from
//! one place even when the commit is assembled elsewhere.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::error::{DispatchError, EntityKind};
use crate::events::{EngineEvent, EventSink};
use crate::geo::GeoPoint;
use crate::model::{Driver, DriverAvailability, DriverId, Offer, PassengerId, Ride, RideId, RideStatus};
use crate::offers::cancel_pending;
use crate::pricing::{FareModel, FeeClassifier};
use crate::store::{with_cas_retry, DispatchStore, WriteBatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RideAction {
    Offer,
    Accept,
    Arrive,
    Start,
    Complete,
    PassengerCancel,
    DriverCancel,
    Expire,
    Reroute,
}

impl RideAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RideAction::Offer => "offer",
            RideAction::Accept => "accept",
            RideAction::Arrive => "arrive",
            RideAction::Start => "start",
            RideAction::Complete => "complete",
            RideAction::PassengerCancel => "passenger-cancel",
            RideAction::DriverCancel => "driver-cancel",
            RideAction::Expire => "expire",
            RideAction::Reroute => "reroute",
        }
    }
}

impl RideStatus {
    /// Target status of `action` from this status, or None when illegal.
    pub fn next_status(self, action: RideAction) -> Option<RideStatus> {
        use RideStatus::*;
        match (self, action) {
            (Requested | Offered, RideAction::Offer) => Some(Offered),
            (Requested | Offered, RideAction::Accept) => Some(Accepted),
            (Accepted, RideAction::Arrive) => Some(Arrived),
            (Arrived, RideAction::Start) => Some(InProgress),
            (InProgress, RideAction::Complete) => Some(Completed),
            (Requested | Offered | Accepted | Arrived, RideAction::PassengerCancel) => Some(CanceledByPassenger),
            (Accepted | Arrived, RideAction::DriverCancel) => Some(CanceledByDriver),
            (Requested | Offered, RideAction::Expire) => Some(Expired),
            (Requested | Offered | Accepted | Arrived, RideAction::Reroute) => Some(self),
            _ => None,
        }
    }

    pub fn can_transition(self, action: RideAction) -> bool {
        self.next_status(action).is_some()
    }
}

/// Copy of `ride` after `action`, or `InvalidTransition`.
pub(crate) fn transition(ride: &Ride, action: RideAction, now_ms: u64) -> Result<Ride, DispatchError> {
    let status = ride
        .status
        .next_status(action)
        .ok_or_else(|| DispatchError::invalid_transition(EntityKind::Ride, ride.status, action.as_str()))?;
    let mut next = ride.clone();
    next.status = status;
    next.updated_at = now_ms;
    Ok(next)
}

pub(crate) fn publish_transition(events: &dyn EventSink, before: &Ride, after: &Ride) {
    if before.status == after.status {
        return;
    }
    info!(ride_id = %after.id, from = %before.status, to = %after.status, "ride transition");
    events.publish(EngineEvent::RideStatusChanged {
        ride_id: after.id,
        from: before.status,
        to: after.status,
        at: after.updated_at,
    });
}

/// Who is asking for a ride change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Passenger(PassengerId),
    Driver(DriverId),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Passenger(id) => write!(f, "passenger {id}"),
            Actor::Driver(id) => write!(f, "driver {id}"),
        }
    }
}

/// Outcome of a dropoff change.
#[derive(Debug, Clone, PartialEq)]
pub struct Reroute {
    pub ride: Ride,
    /// Pending offers withdrawn because the trip changed before acceptance.
    pub canceled_offers: Vec<Offer>,
}

pub struct RideStateMachine {
    store: Arc<dyn DispatchStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    classifier: Arc<FeeClassifier>,
    fares: FareModel,
    max_retries: usize,
}

impl RideStateMachine {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        classifier: Arc<FeeClassifier>,
        fares: FareModel,
        max_retries: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            classifier,
            fares,
            max_retries,
        }
    }

    fn load(&self, ride_id: RideId) -> Result<Ride, DispatchError> {
        self.store
            .ride(ride_id)?
            .ok_or_else(|| DispatchError::not_found(EntityKind::Ride, ride_id))
    }

    /// Driver record to write back when `ride` lets go of its driver.
    fn released_driver(&self, ride: &Ride) -> Result<Option<Driver>, DispatchError> {
        let Some(driver_id) = ride.driver_id else {
            return Ok(None);
        };
        let Some(mut driver) = self.store.driver(driver_id)? else {
            return Ok(None);
        };
        if driver.busy_with() != Some(ride.id) {
            return Ok(None);
        }
        driver.availability = DriverAvailability::Available;
        Ok(Some(driver))
    }

    fn driver_step(&self, ride_id: RideId, driver_id: DriverId, action: RideAction) -> Result<RideStatus, DispatchError> {
        with_cas_retry(self.max_retries, action.as_str(), || {
            let ride = self.load(ride_id)?;
            if ride.driver_id != Some(driver_id) {
                return Err(DispatchError::forbidden(EntityKind::Ride, ride_id, Actor::Driver(driver_id)));
            }
            let next = transition(&ride, action, self.clock.now_ms())?;
            let mut batch = WriteBatch::new();
            batch.update_ride(next.clone());
            if next.status.is_terminal() {
                if let Some(driver) = self.released_driver(&ride)? {
                    batch.update_driver(driver);
                }
            }
            self.store.commit(batch)?;
            publish_transition(self.events.as_ref(), &ride, &next);
            Ok(next.status)
        })
    }

    pub fn mark_arrived(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.driver_step(ride_id, driver_id, RideAction::Arrive)
    }

    pub fn start(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.driver_step(ride_id, driver_id, RideAction::Start)
    }

    /// Completes the trip and frees the driver.
    pub fn complete(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.driver_step(ride_id, driver_id, RideAction::Complete)
    }

    /// Cancel on behalf of the passenger or the bound driver. Pending offers
    /// are withdrawn and the driver released in the same commit.
    pub fn cancel(&self, ride_id: RideId, actor: Actor) -> Result<RideStatus, DispatchError> {
        with_cas_retry(self.max_retries, "cancel_ride", || {
            let ride = self.load(ride_id)?;
            let action = match actor {
                Actor::Passenger(passenger_id) if ride.passenger_id == passenger_id => RideAction::PassengerCancel,
                Actor::Driver(driver_id) if ride.driver_id == Some(driver_id) => RideAction::DriverCancel,
                _ => return Err(DispatchError::forbidden(EntityKind::Ride, ride_id, actor)),
            };
            let now = self.clock.now_ms();
            let next = transition(&ride, action, now)?;
            let mut batch = WriteBatch::new();
            batch.update_ride(next.clone());
            cancel_pending(self.store.as_ref(), ride_id, None, now, &mut batch)?;
            if let Some(driver) = self.released_driver(&ride)? {
                batch.update_driver(driver);
            }
            self.store.commit(batch)?;
            publish_transition(self.events.as_ref(), &ride, &next);
            Ok(next.status)
        })
    }

    /// Give up on a ride nobody took.
    pub fn expire(&self, ride_id: RideId) -> Result<RideStatus, DispatchError> {
        with_cas_retry(self.max_retries, "expire_ride", || {
            let ride = self.load(ride_id)?;
            let now = self.clock.now_ms();
            let next = transition(&ride, RideAction::Expire, now)?;
            let mut batch = WriteBatch::new();
            batch.update_ride(next.clone());
            cancel_pending(self.store.as_ref(), ride_id, None, now, &mut batch)?;
            self.store.commit(batch)?;
            publish_transition(self.events.as_ref(), &ride, &next);
            Ok(next.status)
        })
    }

    /// Move the dropoff before the trip starts.
    ///
    /// Before acceptance the pending offer is withdrawn so the caller can
    /// redispatch with the new route. After acceptance the fare and the fee
    /// assessment are recomputed for the bound driver.
    pub fn reroute(&self, ride_id: RideId, passenger_id: PassengerId, dropoff: GeoPoint) -> Result<Reroute, DispatchError> {
        let dropoff = dropoff.validate()?;
        with_cas_retry(self.max_retries, "reroute", || {
            let ride = self.load(ride_id)?;
            if ride.passenger_id != passenger_id {
                return Err(DispatchError::forbidden(EntityKind::Ride, ride_id, Actor::Passenger(passenger_id)));
            }
            let now = self.clock.now_ms();
            let mut next = transition(&ride, RideAction::Reroute, now)?;
            next.dropoff = dropoff;
            next.fare_amount = self.fares.fare_for(next.pickup, dropoff);

            let mut batch = WriteBatch::new();
            let canceled_offers = if ride.status.holds_driver() {
                let home = match next.driver_id {
                    Some(driver_id) => self.store.driver(driver_id)?.and_then(|d| d.home_territory()),
                    None => None,
                };
                next.assessment = Some(self.classifier.assess_trip(home, next.pickup, next.dropoff, next.fare_amount));
                Vec::new()
            } else {
                cancel_pending(self.store.as_ref(), ride_id, None, now, &mut batch)?
            };
            batch.update_ride(next.clone());
            self.store.commit(batch)?;
            info!(
                %ride_id,
                fare = next.fare_amount,
                withdrawn = canceled_offers.len(),
                "dropoff changed"
            );
            Ok(Reroute {
                ride: next,
                canceled_offers,
            })
        })
    }
}

//! Offer lifecycle: create, accept, reject, expire.
//!
//! An offer is resolved exactly once. Accept is the contended path: the offer,
//! the ride, every sibling offer and the driver are written in one batch keyed
//! on the versions read while the ride was still dispatchable, so of any number
//! of concurrent accepts at most one commits.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::dispatcher::{DispatchQueue, OfferOutcome, OfferResolved};
use crate::error::{DispatchError, EntityKind};
use crate::events::{EngineEvent, EventSink};
use crate::model::{DriverAvailability, DriverId, Offer, OfferId, OfferStatus, Ride, RideId};
use crate::pricing::FeeClassifier;
use crate::rides::{publish_transition, transition, Actor, RideAction};
use crate::store::{with_cas_retry, DispatchStore, WriteBatch};

/// Stage `canceled` for every pending offer of `ride_id` except `keep`.
pub(crate) fn cancel_pending(
    store: &dyn DispatchStore,
    ride_id: RideId,
    keep: Option<OfferId>,
    now_ms: u64,
    batch: &mut WriteBatch,
) -> Result<Vec<Offer>, DispatchError> {
    let mut canceled = Vec::new();
    for mut offer in store.offers_for_ride(ride_id)? {
        if !offer.is_pending() || Some(offer.id) == keep {
            continue;
        }
        offer.status = OfferStatus::Canceled;
        offer.responded_at = Some(now_ms);
        batch.update_offer(offer.clone());
        canceled.push(offer);
    }
    Ok(canceled)
}

/// Result of a winning accept.
#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub offer: Offer,
    pub ride: Ride,
}

pub struct OfferManager {
    store: Arc<dyn DispatchStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    classifier: Arc<FeeClassifier>,
    queue: Arc<DispatchQueue>,
    max_retries: usize,
}

impl OfferManager {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
        classifier: Arc<FeeClassifier>,
        queue: Arc<DispatchQueue>,
        max_retries: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            classifier,
            queue,
            max_retries,
        }
    }

    fn load_offer(&self, offer_id: OfferId) -> Result<Offer, DispatchError> {
        self.store
            .offer(offer_id)?
            .ok_or_else(|| DispatchError::not_found(EntityKind::Offer, offer_id))
    }

    fn load_ride(&self, ride_id: RideId) -> Result<Ride, DispatchError> {
        self.store
            .ride(ride_id)?
            .ok_or_else(|| DispatchError::not_found(EntityKind::Ride, ride_id))
    }

    /// Offer `ride_id` to `driver_id` for `ttl_ms`.
    ///
    /// The ride moves to `offered` in the same commit. The driver record is
    /// written too, so two rides can never race a pending offer onto one driver.
    pub fn create_offer(&self, ride_id: RideId, driver_id: DriverId, ttl_ms: u64) -> Result<Offer, DispatchError> {
        with_cas_retry(self.max_retries, "create_offer", || {
            let ride = self.load_ride(ride_id)?;
            if !ride.status.is_dispatchable() {
                return Err(DispatchError::invalid_transition(
                    EntityKind::Ride,
                    ride.status,
                    RideAction::Offer.as_str(),
                ));
            }
            if self.store.offers_for_ride(ride_id)?.iter().any(Offer::is_pending) {
                return Err(DispatchError::Conflict(format!("ride {ride_id} already has a pending offer")));
            }
            let driver = self
                .store
                .driver(driver_id)?
                .ok_or_else(|| DispatchError::not_found(EntityKind::Driver, driver_id))?;
            if !driver.is_available() || !self.store.pending_offers_for_driver(driver_id)?.is_empty() {
                return Err(DispatchError::Conflict(format!("driver {driver_id} is not available")));
            }

            let now = self.clock.now_ms();
            let offer = Offer::new(ride_id, driver_id, now, ttl_ms);
            let next = transition(&ride, RideAction::Offer, now)?;
            let mut batch = WriteBatch::new();
            batch.insert_offer(offer.clone()).update_ride(next.clone()).update_driver(driver);
            self.store.commit(batch)?;

            info!(offer_id = %offer.id, %ride_id, %driver_id, expires_at = offer.expires_at, "offer created");
            self.events.publish(EngineEvent::OfferCreated {
                offer_id: offer.id,
                ride_id,
                driver_id,
                expires_at: offer.expires_at,
            });
            publish_transition(self.events.as_ref(), &ride, &next);
            Ok(offer)
        })
    }

    /// Bind `driver_id` to the offer's ride.
    ///
    /// Losers of a race on the same ride get `Conflict`; responding past the
    /// deadline expires the offer and returns `OfferExpired`.
    pub fn accept(&self, offer_id: OfferId, driver_id: DriverId) -> Result<Acceptance, DispatchError> {
        with_cas_retry(self.max_retries, "accept_offer", || {
            let offer = self.responsive_offer(offer_id, driver_id)?;
            let now = self.clock.now_ms();
            let ride = self.load_ride(offer.ride_id)?;
            let mut next = transition(&ride, RideAction::Accept, now)
                .map_err(|_| DispatchError::Conflict(format!("ride {} no longer available", ride.id)))?;
            let mut driver = self
                .store
                .driver(driver_id)?
                .ok_or_else(|| DispatchError::not_found(EntityKind::Driver, driver_id))?;
            if !driver.is_available() {
                return Err(DispatchError::Conflict(format!("driver {driver_id} is not available")));
            }

            next.driver_id = Some(driver_id);
            next.assessment = Some(self.classifier.assess_trip(
                driver.home_territory(),
                ride.pickup,
                ride.dropoff,
                ride.fare_amount,
            ));
            let mut accepted = offer.clone();
            accepted.status = OfferStatus::Accepted;
            accepted.responded_at = Some(now);
            driver.availability = DriverAvailability::Busy { ride_id: ride.id };

            let mut batch = WriteBatch::new();
            batch.update_offer(accepted.clone()).update_ride(next.clone());
            cancel_pending(self.store.as_ref(), ride.id, Some(offer_id), now, &mut batch)?;
            batch.update_driver(driver);
            self.store.commit(batch)?;

            info!(
                %offer_id,
                ride_id = %ride.id,
                %driver_id,
                match_type = ?next.match_type(),
                "offer accepted"
            );
            publish_transition(self.events.as_ref(), &ride, &next);
            Ok(Acceptance {
                offer: accepted,
                ride: next,
            })
        })
    }

    /// Decline an offer; the ride goes back to the dispatcher.
    pub fn reject(&self, offer_id: OfferId, driver_id: DriverId) -> Result<Offer, DispatchError> {
        with_cas_retry(self.max_retries, "reject_offer", || {
            let offer = self.responsive_offer(offer_id, driver_id)?;
            let mut rejected = offer;
            rejected.status = OfferStatus::Rejected;
            rejected.responded_at = Some(self.clock.now_ms());
            let mut batch = WriteBatch::new();
            batch.update_offer(rejected.clone());
            self.store.commit(batch)?;

            info!(%offer_id, ride_id = %rejected.ride_id, %driver_id, "offer rejected");
            self.events.publish(EngineEvent::OfferRejected {
                offer_id,
                ride_id: rejected.ride_id,
                driver_id,
            });
            self.queue.push(OfferResolved {
                ride_id: rejected.ride_id,
                offer_id,
                driver_id,
                outcome: OfferOutcome::Rejected,
            });
            Ok(rejected)
        })
    }

    /// Pending offer owned by `driver_id` that can still be answered.
    fn responsive_offer(&self, offer_id: OfferId, driver_id: DriverId) -> Result<Offer, DispatchError> {
        let offer = self.load_offer(offer_id)?;
        if offer.driver_id != driver_id {
            return Err(DispatchError::forbidden(EntityKind::Offer, offer_id, Actor::Driver(driver_id)));
        }
        if !offer.is_pending() {
            return Err(DispatchError::OfferNotPending {
                offer_id,
                status: offer.status,
            });
        }
        if offer.is_expired_at(self.clock.now_ms()) {
            self.expire(offer_id)?;
            return Err(DispatchError::OfferExpired(offer_id));
        }
        Ok(offer)
    }

    /// Expire `offer_id` if it is still pending and past its deadline.
    pub fn expire(&self, offer_id: OfferId) -> Result<Option<Offer>, DispatchError> {
        with_cas_retry(self.max_retries, "expire_offer", || {
            let offer = self.load_offer(offer_id)?;
            let now = self.clock.now_ms();
            if !offer.is_pending() || !offer.is_expired_at(now) {
                return Ok(None);
            }
            let mut expired = offer;
            expired.status = OfferStatus::Expired;
            expired.responded_at = Some(now);
            let mut batch = WriteBatch::new();
            batch.update_offer(expired.clone());
            self.store.commit(batch)?;

            info!(%offer_id, ride_id = %expired.ride_id, driver_id = %expired.driver_id, "offer expired");
            self.events.publish(EngineEvent::OfferExpired {
                offer_id,
                ride_id: expired.ride_id,
                driver_id: expired.driver_id,
            });
            self.queue.push(OfferResolved {
                ride_id: expired.ride_id,
                offer_id,
                driver_id: expired.driver_id,
                outcome: OfferOutcome::Expired,
            });
            Ok(Some(expired))
        })
    }

    /// Expire every pending offer whose deadline has passed.
    pub fn sweep_expired(&self) -> Result<Vec<Offer>, DispatchError> {
        let due = self.store.due_offers(self.clock.now_ms())?;
        let mut expired = Vec::with_capacity(due.len());
        for offer in due {
            match self.expire(offer.id) {
                Ok(Some(offer)) => expired.push(offer),
                Ok(None) => debug!(offer_id = %offer.id, "offer resolved before sweep"),
                Err(err) if err.is_conflict() => {
                    warn!(offer_id = %offer.id, error = %err, "sweep lost race, leaving for next sweep")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }

    /// Withdraw every pending offer held by `driver_id`, for example when the
    /// driver goes offline. Returns the withdrawn offers.
    pub fn withdraw_driver_offers(&self, driver_id: DriverId) -> Result<Vec<Offer>, DispatchError> {
        with_cas_retry(self.max_retries, "withdraw_offers", || {
            let now = self.clock.now_ms();
            let mut batch = WriteBatch::new();
            let mut withdrawn = Vec::new();
            for mut offer in self.store.pending_offers_for_driver(driver_id)? {
                offer.status = OfferStatus::Canceled;
                offer.responded_at = Some(now);
                batch.update_offer(offer.clone());
                withdrawn.push(offer);
            }
            self.store.commit(batch)?;
            for offer in &withdrawn {
                info!(offer_id = %offer.id, ride_id = %offer.ride_id, %driver_id, "offer withdrawn");
            }
            Ok(withdrawn)
        })
    }
}

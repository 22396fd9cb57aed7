//! Engine facade: the operations request handlers and the sweeper call.
//!
//! `DispatchEngine` is `Send + Sync` and meant to be shared through an `Arc`.
//! It holds no lock over domain state; every operation is a
//! read-evaluate-commit loop against the [`DispatchStore`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, EngineConfig};
use crate::dispatcher::{DispatchOutcome, DispatchQueue, Dispatcher};
use crate::error::{DispatchError, EntityKind};
use crate::events::{EventSink, NullSink};
use crate::geo::GeoPoint;
use crate::matching::{CandidatePolicy, TerritoryFirst};
use crate::model::{
    Driver, DriverAvailability, DriverId, HomeBinding, Offer, OfferId, OfferStatus, PassengerId, Ride, RideId,
    RideStatus, TerritoryId, VerificationMethod,
};
use crate::offers::OfferManager;
use crate::pricing::{FeeAssessment, FeeClassifier};
use crate::resolver::{Resolution, TerritoryResolver};
use crate::rides::{Actor, RideStateMachine};
use crate::store::{with_cas_retry, DispatchStore, InMemoryStore, WriteBatch};
use crate::territory::TerritoryStore;

/// Fee breakdown returned by [`DispatchEngine::estimate_fee`].
pub type FeeEstimate = FeeAssessment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RideReceipt {
    pub ride_id: RideId,
    pub status: RideStatus,
    /// False when the idempotency key matched an earlier request.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired: Vec<OfferId>,
    pub redispatched: Vec<(RideId, DispatchOutcome)>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    territories: Arc<dyn TerritoryStore>,
    store: Option<Arc<dyn DispatchStore>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    policy: Option<Arc<dyn CandidatePolicy>>,
}

impl EngineBuilder {
    pub fn new(territories: Arc<dyn TerritoryStore>) -> Self {
        Self {
            config: EngineConfig::default(),
            territories,
            store: None,
            clock: None,
            events: None,
            policy: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DispatchStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn CandidatePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Defaults: in-memory store, system clock, no events, territory-first ranking.
    pub fn build(self) -> Result<DispatchEngine, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_else(|| Arc::new(NullSink));
        let policy = self.policy.unwrap_or_else(|| Arc::new(TerritoryFirst));

        let resolver = Arc::new(TerritoryResolver::new(self.territories));
        let classifier = Arc::new(FeeClassifier::new(config.fees, Arc::clone(&resolver)));
        let queue = Arc::new(DispatchQueue::new());
        let offers = Arc::new(OfferManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&events),
            Arc::clone(&classifier),
            Arc::clone(&queue),
            config.max_cas_retries,
        ));
        let rides = Arc::new(RideStateMachine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&events),
            Arc::clone(&classifier),
            config.fares,
            config.max_cas_retries,
        ));
        let dispatcher = Dispatcher::new(
            config,
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&offers),
            Arc::clone(&rides),
            policy,
            Arc::clone(&queue),
        );

        info!(
            policy = dispatcher.policy_name(),
            offer_ttl_secs = config.offer_ttl_secs,
            search_radius_cells = config.search_radius_cells,
            "dispatch engine ready"
        );
        Ok(DispatchEngine {
            config,
            store,
            clock,
            resolver,
            classifier,
            queue,
            offers,
            rides,
            dispatcher,
        })
    }
}

pub struct DispatchEngine {
    config: EngineConfig,
    store: Arc<dyn DispatchStore>,
    clock: Arc<dyn Clock>,
    resolver: Arc<TerritoryResolver>,
    classifier: Arc<FeeClassifier>,
    queue: Arc<DispatchQueue>,
    offers: Arc<OfferManager>,
    rides: Arc<RideStateMachine>,
    dispatcher: Dispatcher,
}

impl DispatchEngine {
    pub fn builder(territories: Arc<dyn TerritoryStore>) -> EngineBuilder {
        EngineBuilder::new(territories)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DispatchStore> {
        &self.store
    }

    pub fn offers(&self) -> &OfferManager {
        &self.offers
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    // ---------------------------------------------------------------
    // Rides
    // ---------------------------------------------------------------

    /// Create a ride once per `(passenger_id, idempotency_key)` and dispatch it.
    /// A replayed key returns the existing ride without dispatching again.
    pub fn create_ride(
        &self,
        passenger_id: PassengerId,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        idempotency_key: Option<String>,
    ) -> Result<RideReceipt, DispatchError> {
        let pickup = pickup.validate()?;
        let dropoff = dropoff.validate()?;
        let fare = self.config.fares.fare_for(pickup, dropoff);
        let ride = Ride::new(passenger_id, pickup, dropoff, idempotency_key, fare, self.clock.now_ms());

        let (ride, created) = self.store.insert_ride(ride)?;
        if !created {
            info!(ride_id = %ride.id, %passenger_id, "duplicate ride request");
            return Ok(RideReceipt {
                ride_id: ride.id,
                status: ride.status,
                created,
            });
        }

        info!(ride_id = %ride.id, %passenger_id, fare, "ride requested");
        let outcome = self.dispatcher.dispatch(ride.id)?;
        let status = match outcome {
            DispatchOutcome::NotDispatchable(status) => status,
            _ => self.ride(ride.id)?.status,
        };
        Ok(RideReceipt {
            ride_id: ride.id,
            status,
            created,
        })
    }

    pub fn cancel_ride(&self, ride_id: RideId, actor: Actor) -> Result<RideStatus, DispatchError> {
        self.rides.cancel(ride_id, actor)
    }

    pub fn mark_arrived(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.rides.mark_arrived(ride_id, driver_id)
    }

    pub fn start_trip(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.rides.start(ride_id, driver_id)
    }

    pub fn complete_trip(&self, ride_id: RideId, driver_id: DriverId) -> Result<RideStatus, DispatchError> {
        self.rides.complete(ride_id, driver_id)
    }

    pub fn expire_ride(&self, ride_id: RideId) -> Result<RideStatus, DispatchError> {
        self.rides.expire(ride_id)
    }

    /// Change the dropoff before the trip starts. An unaccepted ride is
    /// redispatched against the new route.
    pub fn update_dropoff(
        &self,
        ride_id: RideId,
        passenger_id: PassengerId,
        dropoff: GeoPoint,
    ) -> Result<Ride, DispatchError> {
        let reroute = self.rides.reroute(ride_id, passenger_id, dropoff)?;
        if reroute.ride.status.is_dispatchable() {
            self.dispatcher.dispatch(ride_id)?;
        }
        self.ride(ride_id)
    }

    pub fn dispatch(&self, ride_id: RideId) -> Result<DispatchOutcome, DispatchError> {
        self.dispatcher.dispatch(ride_id)
    }

    pub fn ride(&self, ride_id: RideId) -> Result<Ride, DispatchError> {
        self.store
            .ride(ride_id)?
            .ok_or_else(|| DispatchError::not_found(EntityKind::Ride, ride_id))
    }

    pub fn offers_for_ride(&self, ride_id: RideId) -> Result<Vec<Offer>, DispatchError> {
        self.ride(ride_id)?;
        Ok(self.store.offers_for_ride(ride_id)?)
    }

    /// The offer currently waiting on a driver, if any.
    pub fn pending_offer(&self, ride_id: RideId) -> Result<Option<Offer>, DispatchError> {
        Ok(self.offers_for_ride(ride_id)?.into_iter().find(Offer::is_pending))
    }

    // ---------------------------------------------------------------
    // Offers
    // ---------------------------------------------------------------

    /// Accept or reject an offer. Rejections (and lazily expired offers) are
    /// redispatched before this returns.
    pub fn respond_to_offer(
        &self,
        offer_id: OfferId,
        driver_id: DriverId,
        decision: Decision,
    ) -> Result<OfferStatus, DispatchError> {
        let result = match decision {
            Decision::Accept => self.offers.accept(offer_id, driver_id).map(|a| a.offer.status),
            Decision::Reject => self.offers.reject(offer_id, driver_id).map(|o| o.status),
        };
        self.pump();
        result
    }

    /// Expire due offers and redispatch their rides. Meant to run periodically.
    pub fn sweep_expired(&self) -> Result<SweepReport, DispatchError> {
        let expired = self.offers.sweep_expired()?;
        let redispatched = self.dispatcher.process_queue()?;
        if !expired.is_empty() {
            info!(expired = expired.len(), redispatched = redispatched.len(), "sweep finished");
        }
        Ok(SweepReport {
            expired: expired.into_iter().map(|o| o.id).collect(),
            redispatched,
        })
    }

    /// Redispatch whatever the offer manager queued.
    fn pump(&self) {
        if let Err(err) = self.dispatcher.process_queue() {
            warn!(error = %err, pending = self.queue.len(), "redispatch failed");
        }
    }

    // ---------------------------------------------------------------
    // Drivers
    // ---------------------------------------------------------------

    pub fn register_driver(&self, driver_id: DriverId) -> Result<Driver, DispatchError> {
        let driver = self.store.insert_driver(Driver::new(driver_id))?;
        info!(%driver_id, "driver registered");
        Ok(driver)
    }

    pub fn driver(&self, driver_id: DriverId) -> Result<Driver, DispatchError> {
        self.store
            .driver(driver_id)?
            .ok_or_else(|| DispatchError::not_found(EntityKind::Driver, driver_id))
    }

    fn update_driver(
        &self,
        driver_id: DriverId,
        operation: &'static str,
        mut change: impl FnMut(&mut Driver) -> Result<(), DispatchError>,
    ) -> Result<Driver, DispatchError> {
        with_cas_retry(self.config.max_cas_retries, operation, || {
            let mut driver = self.driver(driver_id)?;
            change(&mut driver)?;
            let mut batch = WriteBatch::new();
            batch.update_driver(driver.clone());
            self.store.commit(batch)?;
            Ok(driver)
        })
    }

    /// Record a verified home territory, replacing any earlier one.
    pub fn bind_home_territory(
        &self,
        driver_id: DriverId,
        territory_id: TerritoryId,
        verification_method: VerificationMethod,
    ) -> Result<Driver, DispatchError> {
        if self.resolver.store().territory(territory_id).is_none() {
            return Err(DispatchError::not_found(EntityKind::Territory, territory_id));
        }
        let verified_at = self.clock.now_ms();
        let driver = self.update_driver(driver_id, "bind_home", |driver| {
            driver.home = Some(HomeBinding {
                territory_id,
                verified_at,
                verification_method,
            });
            Ok(())
        })?;
        info!(%driver_id, %territory_id, ?verification_method, "home territory bound");
        Ok(driver)
    }

    pub fn set_driver_online(&self, driver_id: DriverId, position: GeoPoint) -> Result<Driver, DispatchError> {
        let position = position.validate()?;
        let driver = self.update_driver(driver_id, "driver_online", |driver| {
            if driver.busy_with().is_some() {
                return Err(DispatchError::invalid_transition(EntityKind::Driver, "busy", "go online"));
            }
            driver.availability = DriverAvailability::Available;
            driver.position = Some(position);
            Ok(())
        })?;
        info!(%driver_id, lat = position.lat, lng = position.lng, "driver online");
        Ok(driver)
    }

    /// Take a driver off the market. Offers they were holding are withdrawn
    /// and their rides redispatched.
    pub fn set_driver_offline(&self, driver_id: DriverId) -> Result<Driver, DispatchError> {
        let driver = self.update_driver(driver_id, "driver_offline", |driver| {
            if driver.busy_with().is_some() {
                return Err(DispatchError::invalid_transition(EntityKind::Driver, "busy", "go offline"));
            }
            driver.availability = DriverAvailability::Offline;
            Ok(())
        })?;
        info!(%driver_id, "driver offline");
        for offer in self.offers.withdraw_driver_offers(driver_id)? {
            if let Err(err) = self.dispatcher.dispatch(offer.ride_id) {
                warn!(ride_id = %offer.ride_id, error = %err, "redispatch after withdrawal failed");
            }
        }
        Ok(driver)
    }

    pub fn update_driver_position(&self, driver_id: DriverId, position: GeoPoint) -> Result<Driver, DispatchError> {
        let position = position.validate()?;
        self.update_driver(driver_id, "driver_position", |driver| {
            driver.position = Some(position);
            Ok(())
        })
    }

    // ---------------------------------------------------------------
    // Territories and fees
    // ---------------------------------------------------------------

    pub fn resolve_territory(&self, point: GeoPoint) -> Resolution {
        self.resolver.resolve(point)
    }

    /// Price a hypothetical trip for `driver_id` without touching any ride.
    pub fn estimate_fee(
        &self,
        driver_id: DriverId,
        pickup: GeoPoint,
        dropoff: GeoPoint,
        fare_amount: f64,
    ) -> Result<FeeEstimate, DispatchError> {
        if !fare_amount.is_finite() || fare_amount < 0.0 {
            return Err(DispatchError::InvalidFare(fare_amount));
        }
        let driver = self.driver(driver_id)?;
        Ok(self
            .classifier
            .assess_trip(driver.home_territory(), pickup, dropoff, fare_amount))
    }
}

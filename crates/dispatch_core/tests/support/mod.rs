#![allow(dead_code)]

use std::sync::Arc;

use dispatch_core::clock::ManualClock;
use dispatch_core::events::{EngineEvent, RecordingSink};
use dispatch_core::geo::GeoPoint;
use dispatch_core::model::{DriverId, Offer, OfferStatus, PassengerId, RideId, RideStatus, TerritoryId, VerificationMethod};
use dispatch_core::store::InMemoryStore;
use dispatch_core::test_helpers::{seeded_territory_arc, CENTRO_POINT, CENTRO_POINT_B};
use dispatch_core::{DispatchEngine, EngineConfig, RideReceipt};

/// Engine over the seeded geography with a manual clock starting at zero.
pub struct Harness {
    pub engine: DispatchEngine,
    pub clock: Arc<ManualClock>,
    pub events: Arc<RecordingSink>,
    pub store: Arc<InMemoryStore>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let events = Arc::new(RecordingSink::new());
        let store = Arc::new(InMemoryStore::new());
        let engine = DispatchEngine::builder(seeded_territory_arc())
            .with_config(config)
            .with_clock(clock.clone())
            .with_events(events.clone())
            .with_store(store.clone())
            .build()
            .expect("valid config");
        Self {
            engine,
            clock,
            events,
            store,
        }
    }

    pub fn driver(&self) -> DriverBuilder<'_> {
        DriverBuilder::new(self)
    }

    /// Centro to Centro request from a fresh passenger.
    pub fn request(&self) -> (PassengerId, RideReceipt) {
        self.request_between(CENTRO_POINT, CENTRO_POINT_B)
    }

    pub fn request_between(&self, pickup: GeoPoint, dropoff: GeoPoint) -> (PassengerId, RideReceipt) {
        let passenger = PassengerId::new();
        let receipt = self
            .engine
            .create_ride(passenger, pickup, dropoff, None)
            .expect("create ride");
        (passenger, receipt)
    }

    pub fn pending_offer(&self, ride_id: RideId) -> Offer {
        self.engine
            .pending_offer(ride_id)
            .expect("offers")
            .expect("pending offer")
    }

    pub fn offer_statuses(&self, ride_id: RideId) -> Vec<OfferStatus> {
        self.engine
            .offers_for_ride(ride_id)
            .expect("offers")
            .into_iter()
            .map(|o| o.status)
            .collect()
    }

    pub fn status(&self, ride_id: RideId) -> RideStatus {
        self.engine.ride(ride_id).expect("ride").status
    }

    pub fn status_changes(&self, ride_id: RideId) -> Vec<RideStatus> {
        self.events
            .events_for(ride_id)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::RideStatusChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

/// Registers a driver, optionally binds a home and brings them online.
pub struct DriverBuilder<'a> {
    harness: &'a Harness,
    position: GeoPoint,
    home: Option<TerritoryId>,
    online: bool,
}

impl<'a> DriverBuilder<'a> {
    fn new(harness: &'a Harness) -> Self {
        Self {
            harness,
            position: CENTRO_POINT,
            home: None,
            online: true,
        }
    }

    pub fn at(mut self, position: GeoPoint) -> Self {
        self.position = position;
        self
    }

    pub fn home(mut self, territory: TerritoryId) -> Self {
        self.home = Some(territory);
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn spawn(self) -> DriverId {
        let engine = &self.harness.engine;
        let id = DriverId::new();
        engine.register_driver(id).expect("register driver");
        if let Some(home) = self.home {
            engine
                .bind_home_territory(id, home, VerificationMethod::Gps)
                .expect("bind home");
        }
        if self.online {
            engine
                .set_driver_online(id, self.position)
                .expect("driver online");
        }
        id
    }
}

//! Domain events emitted after successful commits.
//!
//! Events are notifications, not state: sinks observe them after the store has
//! committed, and a sink that drops events never affects engine correctness.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::{DriverId, OfferId, RideId, RideStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    OfferCreated {
        offer_id: OfferId,
        ride_id: RideId,
        driver_id: DriverId,
        expires_at: u64,
    },
    OfferRejected {
        offer_id: OfferId,
        ride_id: RideId,
        driver_id: DriverId,
    },
    OfferExpired {
        offer_id: OfferId,
        ride_id: RideId,
        driver_id: DriverId,
    },
    RideStatusChanged {
        ride_id: RideId,
        from: RideStatus,
        to: RideStatus,
        at: u64,
    },
}

impl EngineEvent {
    pub fn ride_id(&self) -> RideId {
        match self {
            EngineEvent::OfferCreated { ride_id, .. }
            | EngineEvent::OfferRejected { ride_id, .. }
            | EngineEvent::OfferExpired { ride_id, .. }
            | EngineEvent::RideStatusChanged { ride_id, .. } => *ride_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: EngineEvent) {}
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: EngineEvent) {
        match event {
            EngineEvent::OfferCreated {
                offer_id,
                ride_id,
                driver_id,
                expires_at,
            } => info!(%offer_id, %ride_id, %driver_id, expires_at, "offer created"),
            EngineEvent::OfferRejected {
                offer_id,
                ride_id,
                driver_id,
            } => info!(%offer_id, %ride_id, %driver_id, "offer rejected"),
            EngineEvent::OfferExpired {
                offer_id,
                ride_id,
                driver_id,
            } => info!(%offer_id, %ride_id, %driver_id, "offer expired"),
            EngineEvent::RideStatusChanged { ride_id, from, to, at } => {
                info!(%ride_id, %from, %to, at, "ride status changed")
            }
        }
    }
}

/// Keeps every event in memory, for tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn events_for(&self, ride_id: RideId) -> Vec<EngineEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.ride_id() == ride_id)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

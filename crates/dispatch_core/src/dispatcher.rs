//! Candidate selection and redispatch.
//!
//! `dispatch` is idempotent: a ride with a pending offer is left alone, so the
//! same ride can be dispatched from request handlers, the redispatch queue and
//! the sweeper without producing a second concurrent offer.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{DispatchError, EntityKind};
use crate::matching::{Candidate, CandidatePolicy, HomeTier};
use crate::model::{DriverId, Offer, OfferId, Ride, RideId, RideStatus};
use crate::offers::OfferManager;
use crate::resolver::TerritoryResolver;
use crate::rides::RideStateMachine;
use crate::spatial::{distance_km_between_cells, grid_disk_cached};
use crate::store::DispatchStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Rejected,
    Expired,
}

/// An offer ended without a driver; its ride needs another candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferResolved {
    pub ride_id: RideId,
    pub offer_id: OfferId,
    pub driver_id: DriverId,
    pub outcome: OfferOutcome,
}

/// FIFO of redispatch messages.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    pending: Mutex<VecDeque<OfferResolved>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned queue still holds whole messages; keep using it.
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<OfferResolved>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: OfferResolved) {
        self.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<OfferResolved> {
        self.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<OfferResolved> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Offered(Offer),
    AlreadyPending(OfferId),
    NotDispatchable(RideStatus),
    /// Nobody to offer to right now; the ride keeps waiting.
    NoCandidates,
    /// Every reachable driver declined or the offer budget is spent; the
    /// ride was expired.
    Exhausted,
}

impl DispatchOutcome {
    pub fn offer(&self) -> Option<&Offer> {
        match self {
            DispatchOutcome::Offered(offer) => Some(offer),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct CandidatePool {
    candidates: Vec<Candidate>,
    held: usize,
}

pub struct Dispatcher {
    config: EngineConfig,
    store: Arc<dyn DispatchStore>,
    resolver: Arc<TerritoryResolver>,
    offers: Arc<OfferManager>,
    rides: Arc<RideStateMachine>,
    policy: Arc<dyn CandidatePolicy>,
    queue: Arc<DispatchQueue>,
}

impl Dispatcher {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DispatchStore>,
        resolver: Arc<TerritoryResolver>,
        offers: Arc<OfferManager>,
        rides: Arc<RideStateMachine>,
        policy: Arc<dyn CandidatePolicy>,
        queue: Arc<DispatchQueue>,
    ) -> Self {
        Self {
            config,
            store,
            resolver,
            offers,
            rides,
            policy,
            queue,
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn dispatch(&self, ride_id: RideId) -> Result<DispatchOutcome, DispatchError> {
        // Drivers lost to a concurrent dispatch during this call.
        let mut taken: HashSet<DriverId> = HashSet::new();
        loop {
            let ride = self
                .store
                .ride(ride_id)?
                .ok_or_else(|| DispatchError::not_found(EntityKind::Ride, ride_id))?;
            if !ride.status.is_dispatchable() {
                return Ok(DispatchOutcome::NotDispatchable(ride.status));
            }
            let history = self.store.offers_for_ride(ride_id)?;
            if let Some(pending) = history.iter().find(|o| o.is_pending()) {
                return Ok(DispatchOutcome::AlreadyPending(pending.id));
            }
            let declined: HashSet<DriverId> = history
                .iter()
                .filter(|o| o.status.is_declined())
                .map(|o| o.driver_id)
                .collect();
            let spent = history.iter().filter(|o| o.status.is_declined()).count();
            if spent >= self.config.max_offers_per_ride {
                debug!(%ride_id, declined = spent, "offer budget spent");
                return self.exhaust(&ride);
            }

            let pool = self.gather(&ride, &declined, &taken)?;
            let Some(driver_id) = self.policy.select(&pool.candidates) else {
                if pool.held > 0 {
                    // Drivers busy answering other offers may free up; keep waiting.
                    debug!(%ride_id, held = pool.held, "candidates held by other offers");
                    return Ok(DispatchOutcome::NoCandidates);
                }
                return self.exhaust(&ride);
            };

            match self
                .offers
                .create_offer(ride_id, driver_id, self.config.offer_ttl_ms())
            {
                Ok(offer) => return Ok(DispatchOutcome::Offered(offer)),
                // The ride moved on; the next pass reports its new status.
                Err(DispatchError::InvalidTransition { .. }) => continue,
                Err(err) if err.is_conflict() => {
                    debug!(%ride_id, %driver_id, error = %err, "candidate lost, re-evaluating");
                    taken.insert(driver_id);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Available drivers within `search_radius_cells` of the pickup, narrowed to
    /// home and adjacent-home drivers when any exist. Also counts in-range
    /// drivers who are only unavailable because they hold (or just won) a
    /// pending offer for another ride.
    fn gather(
        &self,
        ride: &Ride,
        declined: &HashSet<DriverId>,
        taken: &HashSet<DriverId>,
    ) -> Result<CandidatePool, DispatchError> {
        let pickup_cell = ride.pickup.to_cell()?;
        let pickup_territory = self.resolver.resolve(ride.pickup).id();
        let territories = self.resolver.store();
        let cells = grid_disk_cached(pickup_cell, self.config.search_radius_cells);

        let mut pool = CandidatePool::default();
        for driver in self.store.drivers_in_cells(&cells)? {
            if !driver.is_available() || declined.contains(&driver.id) {
                continue;
            }
            let Some(Ok(cell)) = driver.position.map(|p| p.to_cell()) else {
                continue;
            };
            if taken.contains(&driver.id) || !self.store.pending_offers_for_driver(driver.id)?.is_empty() {
                pool.held += 1;
                continue;
            }
            pool.candidates.push(Candidate {
                driver_id: driver.id,
                tier: HomeTier::classify(territories.as_ref(), driver.home_territory(), pickup_territory),
                pickup_distance_km: distance_km_between_cells(pickup_cell, cell),
            });
        }

        if pool.candidates.iter().any(|c| c.tier != HomeTier::Other) {
            pool.candidates.retain(|c| c.tier != HomeTier::Other);
        }
        debug!(
            ride_id = %ride.id,
            pickup_territory = ?pickup_territory,
            count = pool.candidates.len(),
            held = pool.held,
            "gathered candidates"
        );
        Ok(pool)
    }

    fn exhaust(&self, ride: &Ride) -> Result<DispatchOutcome, DispatchError> {
        if ride.status != RideStatus::Offered || !self.config.expire_on_exhaustion {
            info!(ride_id = %ride.id, status = %ride.status, "no candidates");
            return Ok(DispatchOutcome::NoCandidates);
        }
        match self.rides.expire(ride.id) {
            Ok(_) => {
                info!(ride_id = %ride.id, "candidates exhausted, ride expired");
                Ok(DispatchOutcome::Exhausted)
            }
            // Someone else moved the ride first.
            Err(DispatchError::InvalidTransition { .. }) => {
                let status = self
                    .store
                    .ride(ride.id)?
                    .map_or(ride.status, |current| current.status);
                Ok(DispatchOutcome::NotDispatchable(status))
            }
            Err(err) => Err(err),
        }
    }

    pub fn handle(&self, message: OfferResolved) -> Result<DispatchOutcome, DispatchError> {
        debug!(
            ride_id = %message.ride_id,
            offer_id = %message.offer_id,
            driver_id = %message.driver_id,
            outcome = ?message.outcome,
            "redispatching"
        );
        self.dispatch(message.ride_id)
    }

    /// Drain the redispatch queue. Conflicts are logged and skipped; the ride
    /// they concern has already been handled by whoever won.
    pub fn process_queue(&self) -> Result<Vec<(RideId, DispatchOutcome)>, DispatchError> {
        let mut outcomes = Vec::new();
        while let Some(message) = self.queue.pop() {
            match self.handle(message) {
                Ok(outcome) => outcomes.push((message.ride_id, outcome)),
                Err(err) if err.is_conflict() => {
                    debug!(ride_id = %message.ride_id, error = %err, "redispatch superseded")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcomes)
    }
}

//! Persistence contract and the in-memory implementation.
//!
//! The only write primitive is [`DispatchStore::commit`]: an all-or-nothing
//! batch of version-checked updates plus guarded inserts. Every record carries
//! a `version`; a batch entry commits only if the stored version still equals
//! the version the caller read, after which the store bumps it. Engine
//! operations are read-evaluate-commit loops driven by [`with_cas_retry`].

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use h3o::CellIndex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::DeadlineQueue;
use crate::error::DispatchError;
use crate::model::{Driver, DriverId, Offer, OfferId, OfferStatus, PassengerId, Ride, RideId};
use crate::spatial::CellIndexMap;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("version conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },
    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },
    #[error("{entity} {id} does not exist")]
    Missing { entity: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn conflict(entity: &'static str, id: impl ToString) -> Self {
        StoreError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    fn missing(entity: &'static str, id: impl ToString) -> Self {
        StoreError::Missing {
            entity,
            id: id.to_string(),
        }
    }

    fn duplicate(entity: &'static str, id: impl ToString) -> Self {
        StoreError::Duplicate {
            entity,
            id: id.to_string(),
        }
    }
}

/// Conditional writes committed atomically.
///
/// Updated records carry the version they were read at; inserted offers must be new.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    rides: Vec<Ride>,
    offers: Vec<Offer>,
    new_offers: Vec<Offer>,
    drivers: Vec<Driver>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_ride(&mut self, ride: Ride) -> &mut Self {
        self.rides.push(ride);
        self
    }

    pub fn update_offer(&mut self, offer: Offer) -> &mut Self {
        self.offers.push(offer);
        self
    }

    pub fn insert_offer(&mut self, offer: Offer) -> &mut Self {
        self.new_offers.push(offer);
        self
    }

    pub fn update_driver(&mut self, driver: Driver) -> &mut Self {
        self.drivers.push(driver);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty() && self.offers.is_empty() && self.new_offers.is_empty() && self.drivers.is_empty()
    }
}

/// Persistence collaborator. Implementations must make `commit` atomic across
/// processes (a database transaction with version predicates, for instance).
pub trait DispatchStore: Send + Sync {
    /// Insert a ride, or return the existing one for the same
    /// `(passenger_id, idempotency_key)`. The flag is true when inserted.
    fn insert_ride(&self, ride: Ride) -> Result<(Ride, bool), StoreError>;

    fn insert_driver(&self, driver: Driver) -> Result<Driver, StoreError>;

    fn ride(&self, id: RideId) -> Result<Option<Ride>, StoreError>;

    fn offer(&self, id: OfferId) -> Result<Option<Offer>, StoreError>;

    /// Offers for a ride in creation order.
    fn offers_for_ride(&self, ride_id: RideId) -> Result<Vec<Offer>, StoreError>;

    fn pending_offers_for_driver(&self, driver_id: DriverId) -> Result<Vec<Offer>, StoreError>;

    /// Pending offers whose deadline is strictly before `now_ms`.
    fn due_offers(&self, now_ms: u64) -> Result<Vec<Offer>, StoreError>;

    fn driver(&self, id: DriverId) -> Result<Option<Driver>, StoreError>;

    /// Drivers whose last known position lies in one of `cells`.
    fn drivers_in_cells(&self, cells: &[CellIndex]) -> Result<Vec<Driver>, StoreError>;

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Re-run `attempt` while it loses version races, up to `max_retries` re-reads.
pub(crate) fn with_cas_retry<T>(
    max_retries: usize,
    operation: &'static str,
    mut attempt: impl FnMut() -> Result<T, DispatchError>,
) -> Result<T, DispatchError> {
    let mut retries = 0;
    loop {
        match attempt() {
            Err(DispatchError::Store(StoreError::Conflict { entity, id })) => {
                if retries >= max_retries {
                    warn!(operation, entity, %id, retries, "giving up after repeated version conflicts");
                    return Err(DispatchError::Conflict(format!(
                        "{operation} kept losing races on {entity} {id}"
                    )));
                }
                retries += 1;
                debug!(operation, entity, %id, retries, "version conflict, re-reading");
            }
            other => return other,
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    rides: HashMap<RideId, Ride>,
    idempotency: HashMap<(PassengerId, String), RideId>,
    offers: HashMap<OfferId, Offer>,
    offers_by_ride: HashMap<RideId, Vec<OfferId>>,
    offers_by_driver: HashMap<DriverId, Vec<OfferId>>,
    drivers: HashMap<DriverId, Driver>,
    driver_cells: CellIndexMap<DriverId>,
    deadlines: DeadlineQueue,
}

impl Tables {
    fn index_driver(&mut self, driver: &Driver) {
        match driver.position.map(|p| p.to_cell()) {
            Some(Ok(cell)) => self.driver_cells.insert(driver.id, cell),
            _ => self.driver_cells.remove(driver.id),
        }
    }

    fn check_versions(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for ride in &batch.rides {
            let current = self.rides.get(&ride.id).ok_or_else(|| StoreError::missing("ride", ride.id))?;
            if current.version != ride.version {
                return Err(StoreError::conflict("ride", ride.id));
            }
        }
        for offer in &batch.offers {
            let current = self.offers.get(&offer.id).ok_or_else(|| StoreError::missing("offer", offer.id))?;
            if current.version != offer.version {
                return Err(StoreError::conflict("offer", offer.id));
            }
        }
        for driver in &batch.drivers {
            let current = self
                .drivers
                .get(&driver.id)
                .ok_or_else(|| StoreError::missing("driver", driver.id))?;
            if current.version != driver.version {
                return Err(StoreError::conflict("driver", driver.id));
            }
        }
        for offer in &batch.new_offers {
            if self.offers.contains_key(&offer.id) {
                return Err(StoreError::duplicate("offer", offer.id));
            }
            if !self.rides.contains_key(&offer.ride_id) {
                return Err(StoreError::missing("ride", offer.ride_id));
            }
        }
        Ok(())
    }

    /// A ride may never hold more than one pending offer.
    fn check_single_pending(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let updated: HashMap<OfferId, OfferStatus> = batch.offers.iter().map(|o| (o.id, o.status)).collect();
        let rides: HashSet<RideId> = batch
            .new_offers
            .iter()
            .chain(batch.offers.iter())
            .filter(|o| o.is_pending())
            .map(|o| o.ride_id)
            .collect();

        for ride_id in rides {
            let stored = self
                .offers_by_ride
                .get(&ride_id)
                .into_iter()
                .flatten()
                .filter_map(|id| self.offers.get(id))
                .filter(|o| updated.get(&o.id).copied().unwrap_or(o.status) == OfferStatus::Pending)
                .count();
            let inserted = batch
                .new_offers
                .iter()
                .filter(|o| o.ride_id == ride_id && o.is_pending())
                .count();
            if stored + inserted > 1 {
                return Err(StoreError::conflict("ride", ride_id));
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: WriteBatch) {
        for mut ride in batch.rides {
            ride.version += 1;
            self.rides.insert(ride.id, ride);
        }
        for mut offer in batch.offers {
            offer.version += 1;
            self.offers.insert(offer.id, offer);
        }
        for offer in batch.new_offers {
            self.offers_by_ride.entry(offer.ride_id).or_default().push(offer.id);
            self.offers_by_driver.entry(offer.driver_id).or_default().push(offer.id);
            if offer.is_pending() {
                self.deadlines.schedule(offer.id, offer.expires_at);
            }
            self.offers.insert(offer.id, offer);
        }
        for mut driver in batch.drivers {
            driver.version += 1;
            self.index_driver(&driver);
            self.drivers.insert(driver.id, driver);
        }
    }
}

/// Single-process store: one mutex over all tables stands in for a database
/// transaction. Reads return clones.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    pub fn ride_count(&self) -> Result<usize, StoreError> {
        Ok(self.tables()?.rides.len())
    }
}

impl DispatchStore for InMemoryStore {
    fn insert_ride(&self, ride: Ride) -> Result<(Ride, bool), StoreError> {
        let mut tables = self.tables()?;
        if let Some(key) = &ride.idempotency_key {
            let existing = tables
                .idempotency
                .get(&(ride.passenger_id, key.clone()))
                .and_then(|id| tables.rides.get(id));
            if let Some(existing) = existing {
                return Ok((existing.clone(), false));
            }
        }
        if tables.rides.contains_key(&ride.id) {
            return Err(StoreError::duplicate("ride", ride.id));
        }
        if let Some(key) = &ride.idempotency_key {
            tables.idempotency.insert((ride.passenger_id, key.clone()), ride.id);
        }
        tables.rides.insert(ride.id, ride.clone());
        Ok((ride, true))
    }

    fn insert_driver(&self, driver: Driver) -> Result<Driver, StoreError> {
        let mut tables = self.tables()?;
        if tables.drivers.contains_key(&driver.id) {
            return Err(StoreError::duplicate("driver", driver.id));
        }
        tables.index_driver(&driver);
        tables.drivers.insert(driver.id, driver.clone());
        Ok(driver)
    }

    fn ride(&self, id: RideId) -> Result<Option<Ride>, StoreError> {
        Ok(self.tables()?.rides.get(&id).cloned())
    }

    fn offer(&self, id: OfferId) -> Result<Option<Offer>, StoreError> {
        Ok(self.tables()?.offers.get(&id).cloned())
    }

    fn offers_for_ride(&self, ride_id: RideId) -> Result<Vec<Offer>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .offers_by_ride
            .get(&ride_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.offers.get(id).cloned())
            .collect())
    }

    fn pending_offers_for_driver(&self, driver_id: DriverId) -> Result<Vec<Offer>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .offers_by_driver
            .get(&driver_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.offers.get(id))
            .filter(|o| o.is_pending())
            .cloned()
            .collect())
    }

    fn due_offers(&self, now_ms: u64) -> Result<Vec<Offer>, StoreError> {
        let mut tables = self.tables()?;
        let due = tables.deadlines.pop_due(now_ms);
        let mut offers = Vec::with_capacity(due.len());
        for deadline in due {
            let Some(offer) = tables.offers.get(&deadline.offer_id) else {
                continue;
            };
            if offer.is_pending() {
                offers.push(offer.clone());
            }
        }
        // Still pending until someone expires them; keep their deadlines queued.
        for offer in &offers {
            tables.deadlines.schedule(offer.id, offer.expires_at);
        }
        Ok(offers)
    }

    fn driver(&self, id: DriverId) -> Result<Option<Driver>, StoreError> {
        Ok(self.tables()?.drivers.get(&id).cloned())
    }

    fn drivers_in_cells(&self, cells: &[CellIndex]) -> Result<Vec<Driver>, StoreError> {
        let tables = self.tables()?;
        Ok(tables
            .driver_cells
            .get_in_cells(cells)
            .into_iter()
            .filter_map(|id| tables.drivers.get(&id).cloned())
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables()?;
        tables.check_versions(&batch)?;
        tables.check_single_pending(&batch)?;
        tables.apply(batch);
        Ok(())
    }
}

//! Synthetic dispatch run: random drivers and passengers over the catalog's
//! territories, driven by a manual clock so a day of traffic runs in seconds.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use dispatch_core::clock::{Clock, ManualClock, ONE_SEC_MS};
use dispatch_core::events::{EngineEvent, EventSink, RecordingSink, TracingSink};
use dispatch_core::geo::GeoPoint;
use dispatch_core::model::{DriverId, OfferId, PassengerId, RideId, RideStatus, VerificationMethod};
use dispatch_core::rides::Actor;
use dispatch_core::territory::{InMemoryTerritoryStore, Territory, TerritoryShape};
use dispatch_core::{Decision, DispatchEngine, EngineConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 50)]
    pub drivers: usize,
    #[arg(long, default_value_t = 200)]
    pub rides: usize,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Probability a driver accepts an offer
    #[arg(long, default_value_t = 0.7)]
    pub accept_probability: f64,
    /// Probability a driver never answers and lets the offer expire
    #[arg(long, default_value_t = 0.1)]
    pub ignore_probability: f64,
    /// Seconds between consecutive ride requests
    #[arg(long, default_value_t = 5)]
    pub request_interval_secs: u64,
    /// Minutes from acceptance to trip completion
    #[arg(long, default_value_t = 10)]
    pub trip_minutes: u64,
    /// Minutes a passenger waits without a driver before canceling
    #[arg(long, default_value_t = 5)]
    pub patience_minutes: u64,
    /// Also log every engine event
    #[arg(long)]
    pub log_events: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct SimulationSummary {
    pub rides: usize,
    pub statuses: BTreeMap<String, usize>,
    pub match_types: BTreeMap<String, usize>,
    pub offers_created: usize,
    pub offers_rejected: usize,
    pub offers_expired: usize,
    pub total_fares: f64,
    pub total_fees: f64,
    pub total_driver_earnings: f64,
}

/// Records events for the summary and optionally logs them.
struct SimulationSink {
    recording: RecordingSink,
    log: Option<TracingSink>,
}

impl EventSink for SimulationSink {
    fn publish(&self, event: EngineEvent) {
        if let Some(log) = &self.log {
            log.publish(event.clone());
        }
        self.recording.publish(event);
    }
}

struct Trip {
    ride_id: RideId,
    driver_id: DriverId,
    complete_at: u64,
}

/// Random point inside a usable territory, or None for corrupt polygons.
fn sample_point(territory: &Territory, rng: &mut StdRng) -> Option<GeoPoint> {
    match &territory.shape {
        TerritoryShape::Polygon(polygon) => {
            polygon.validate().ok()?;
            let bounds = polygon.bounding_box()?;
            (0..32).find_map(|_| {
                let point = GeoPoint::new(
                    rng.gen_range(bounds.min_lat..=bounds.max_lat),
                    rng.gen_range(bounds.min_lng..=bounds.max_lng),
                );
                polygon.contains(point).then_some(point)
            })
        }
        TerritoryShape::FallbackCircle(circle) => {
            // ~0.005 degrees stays well inside the 800m radius.
            Some(GeoPoint::new(
                circle.center.lat + rng.gen_range(-0.005..=0.005),
                circle.center.lng + rng.gen_range(-0.005..=0.005),
            ))
        }
    }
}

pub fn run(
    territories: Arc<InMemoryTerritoryStore>,
    config: EngineConfig,
    args: &SimulateArgs,
) -> Result<SimulationSummary> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let clock = Arc::new(ManualClock::new(0));
    let events = Arc::new(SimulationSink {
        recording: RecordingSink::new(),
        log: args.log_events.then_some(TracingSink),
    });
    let engine = DispatchEngine::builder(territories.clone())
        .with_config(config)
        .with_clock(clock.clone())
        .with_events(events.clone())
        .build()?;

    let usable: Vec<&Arc<Territory>> = territories
        .iter()
        .filter(|t| match &t.shape {
            TerritoryShape::Polygon(polygon) => polygon.validate().is_ok(),
            TerritoryShape::FallbackCircle(_) => true,
        })
        .collect();
    anyhow::ensure!(!usable.is_empty(), "territory catalog has no usable territories");

    let mut placed = 0;
    while placed < args.drivers {
        let home = usable[rng.gen_range(0..usable.len())];
        let Some(position) = sample_point(home, &mut rng) else {
            continue;
        };
        let driver = DriverId::new();
        engine.register_driver(driver)?;
        if rng.gen_bool(0.8) {
            engine.bind_home_territory(driver, home.id, VerificationMethod::Gps)?;
        }
        engine.set_driver_online(driver, position)?;
        placed += 1;
    }
    info!(drivers = args.drivers, territories = usable.len(), "simulation seeded");

    let patience_ms = args.patience_minutes * 60 * ONE_SEC_MS;
    let mut rides: Vec<(RideId, PassengerId)> = Vec::with_capacity(args.rides);
    let mut answered: HashSet<OfferId> = HashSet::new();
    let mut trips: Vec<Trip> = Vec::new();

    let mut requested = 0;
    while requested < args.rides || !trips.is_empty() {
        if requested < args.rides {
            let pickup_home = usable[rng.gen_range(0..usable.len())];
            let dropoff_home = usable[rng.gen_range(0..usable.len())];
            if let (Some(pickup), Some(dropoff)) = (
                sample_point(pickup_home, &mut rng),
                sample_point(dropoff_home, &mut rng),
            ) {
                let passenger = PassengerId::new();
                let receipt = engine.create_ride(passenger, pickup, dropoff, Some(format!("sim-{requested}")))?;
                rides.push((receipt.ride_id, passenger));
                requested += 1;
            }
        }

        step(&engine, clock.now_ms(), &mut rng, args, &rides, &mut answered, &mut trips, patience_ms)?;
        clock.advance_secs(args.request_interval_secs.max(1));
        engine.sweep_expired()?;
    }

    // Let every remaining offer expire so nothing is left pending.
    clock.advance_ms(engine.config().offer_ttl_ms() + ONE_SEC_MS);
    engine.sweep_expired()?;

    let mut summary = SimulationSummary {
        rides: rides.len(),
        ..SimulationSummary::default()
    };
    for (ride_id, _) in &rides {
        let ride = engine.ride(*ride_id)?;
        *summary.statuses.entry(ride.status.to_string()).or_default() += 1;
        if ride.status == RideStatus::Completed {
            if let Some(assessment) = ride.assessment {
                *summary.match_types.entry(assessment.match_type.to_string()).or_default() += 1;
                summary.total_fares += assessment.fare_amount;
                summary.total_fees += assessment.fee_amount;
                summary.total_driver_earnings += assessment.driver_earnings;
            }
        }
    }
    for event in events.recording.events() {
        match event {
            EngineEvent::OfferCreated { .. } => summary.offers_created += 1,
            EngineEvent::OfferRejected { .. } => summary.offers_rejected += 1,
            EngineEvent::OfferExpired { .. } => summary.offers_expired += 1,
            EngineEvent::RideStatusChanged { .. } => {}
        }
    }
    info!(
        rides = summary.rides,
        offers = summary.offers_created,
        fees = summary.total_fees,
        "simulation finished"
    );
    Ok(summary)
}

/// One tick: answer fresh offers, finish due trips, retry or abandon waiting rides.
#[allow(clippy::too_many_arguments)]
fn step(
    engine: &DispatchEngine,
    now: u64,
    rng: &mut StdRng,
    args: &SimulateArgs,
    rides: &[(RideId, PassengerId)],
    answered: &mut HashSet<OfferId>,
    trips: &mut Vec<Trip>,
    patience_ms: u64,
) -> Result<()> {
    for (ride_id, passenger) in rides {
        let ride = engine.ride(*ride_id)?;
        if !ride.status.is_dispatchable() {
            continue;
        }
        if now.saturating_sub(ride.created_at) > patience_ms {
            engine.cancel_ride(*ride_id, Actor::Passenger(*passenger))?;
            debug!(%ride_id, "passenger gave up");
            continue;
        }
        let Some(offer) = engine.pending_offer(*ride_id)? else {
            engine.dispatch(*ride_id)?;
            continue;
        };
        if !answered.insert(offer.id) {
            continue;
        }
        let roll: f64 = rng.gen();
        if roll < args.ignore_probability {
            continue;
        }
        let decision = if roll < args.ignore_probability + args.accept_probability {
            Decision::Accept
        } else {
            Decision::Reject
        };
        match engine.respond_to_offer(offer.id, offer.driver_id, decision) {
            Ok(_) if decision == Decision::Accept => trips.push(Trip {
                ride_id: *ride_id,
                driver_id: offer.driver_id,
                complete_at: now + args.trip_minutes * 60 * ONE_SEC_MS,
            }),
            Ok(_) => {}
            Err(err) if err.is_conflict() => debug!(%ride_id, error = %err, "response lost"),
            Err(err) => return Err(err.into()),
        }
    }

    let (due, waiting): (Vec<Trip>, Vec<Trip>) = trips.drain(..).partition(|t| t.complete_at <= now);
    *trips = waiting;
    for trip in due {
        engine.mark_arrived(trip.ride_id, trip.driver_id)?;
        engine.start_trip(trip.ride_id, trip.driver_id)?;
        engine.complete_trip(trip.ride_id, trip.driver_id)?;
    }
    Ok(())
}

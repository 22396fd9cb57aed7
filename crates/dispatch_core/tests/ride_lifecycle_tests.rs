mod support;

use dispatch_core::geo::GeoPoint;
use dispatch_core::model::{DriverAvailability, DriverId, OfferStatus, PassengerId, RideStatus};
use dispatch_core::pricing::MatchType;
use dispatch_core::rides::Actor;
use dispatch_core::test_helpers::*;
use dispatch_core::{Decision, DispatchError, EngineConfig};

use support::Harness;

/// Ride accepted by a Centro-home driver.
fn accepted_ride(harness: &Harness) -> (PassengerId, dispatch_core::model::RideId, DriverId) {
    let driver = harness.driver().at(CENTRO_POINT_B).home(CENTRO).spawn();
    let (passenger, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);
    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Accept)
        .expect("accept");
    (passenger, receipt.ride_id, driver)
}

#[test]
fn full_trip_releases_driver() {
    let harness = Harness::new();
    let (_, ride_id, driver) = accepted_ride(&harness);
    assert_eq!(
        harness.engine.driver(driver).expect("driver").availability,
        DriverAvailability::Busy { ride_id }
    );

    assert_eq!(harness.engine.mark_arrived(ride_id, driver).expect("arrive"), RideStatus::Arrived);
    assert_eq!(harness.engine.start_trip(ride_id, driver).expect("start"), RideStatus::InProgress);
    assert_eq!(harness.engine.complete_trip(ride_id, driver).expect("complete"), RideStatus::Completed);

    assert!(harness.engine.driver(driver).expect("driver").is_available());
    assert_eq!(
        harness.status_changes(ride_id),
        vec![
            RideStatus::Offered,
            RideStatus::Accepted,
            RideStatus::Arrived,
            RideStatus::InProgress,
            RideStatus::Completed
        ]
    );
}

#[test]
fn steps_out_of_order_are_invalid() {
    let harness = Harness::new();
    let (_, ride_id, driver) = accepted_ride(&harness);

    let err = harness.engine.start_trip(ride_id, driver).expect_err("not arrived");
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    let err = harness.engine.complete_trip(ride_id, driver).expect_err("not started");
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    assert_eq!(harness.status(ride_id), RideStatus::Accepted);
}

#[test]
fn other_driver_cannot_drive_the_ride() {
    let harness = Harness::new();
    let (_, ride_id, _) = accepted_ride(&harness);
    let other = harness.driver().spawn();

    let err = harness.engine.mark_arrived(ride_id, other).expect_err("not bound");
    assert!(matches!(err, DispatchError::Forbidden { .. }));
}

#[test]
fn passenger_cancel_withdraws_pending_offer() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (passenger, receipt) = harness.request();

    let status = harness
        .engine
        .cancel_ride(receipt.ride_id, Actor::Passenger(passenger))
        .expect("cancel");
    assert_eq!(status, RideStatus::CanceledByPassenger);
    assert_eq!(harness.offer_statuses(receipt.ride_id), vec![OfferStatus::Canceled]);
    assert!(harness.engine.driver(driver).expect("driver").is_available());
}

#[test]
fn passenger_cancel_after_accept_releases_driver() {
    let harness = Harness::new();
    let (passenger, ride_id, driver) = accepted_ride(&harness);

    harness
        .engine
        .cancel_ride(ride_id, Actor::Passenger(passenger))
        .expect("cancel");
    assert!(harness.engine.driver(driver).expect("driver").is_available());
}

#[test]
fn driver_cancel_after_accept() {
    let harness = Harness::new();
    let (_, ride_id, driver) = accepted_ride(&harness);

    let status = harness
        .engine
        .cancel_ride(ride_id, Actor::Driver(driver))
        .expect("driver cancel");
    assert_eq!(status, RideStatus::CanceledByDriver);
    assert!(harness.engine.driver(driver).expect("driver").is_available());
}

#[test]
fn cancel_during_trip_is_invalid_and_changes_nothing() {
    let harness = Harness::new();
    let (passenger, ride_id, driver) = accepted_ride(&harness);
    harness.engine.mark_arrived(ride_id, driver).expect("arrive");
    harness.engine.start_trip(ride_id, driver).expect("start");
    let before = harness.engine.ride(ride_id).expect("ride");

    let err = harness
        .engine
        .cancel_ride(ride_id, Actor::Passenger(passenger))
        .expect_err("in progress");
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
    assert_eq!(harness.engine.ride(ride_id).expect("ride"), before);
    assert_eq!(
        harness.engine.driver(driver).expect("driver").busy_with(),
        Some(ride_id)
    );
}

#[test]
fn strangers_cannot_cancel() {
    let harness = Harness::new();
    harness.driver().spawn();
    let (_, receipt) = harness.request();

    let err = harness
        .engine
        .cancel_ride(receipt.ride_id, Actor::Passenger(PassengerId::new()))
        .expect_err("not their ride");
    assert!(matches!(err, DispatchError::Forbidden { .. }));
    // No driver is bound yet, so no driver may cancel either.
    let err = harness
        .engine
        .cancel_ride(receipt.ride_id, Actor::Driver(DriverId::new()))
        .expect_err("no bound driver");
    assert!(matches!(err, DispatchError::Forbidden { .. }));
    assert_eq!(harness.status(receipt.ride_id), RideStatus::Offered);
}

#[test]
fn idempotency_key_creates_one_ride() {
    let harness = Harness::new();
    harness.driver().spawn();
    let passenger = PassengerId::new();
    let key = Some("req-1".to_string());

    let first = harness
        .engine
        .create_ride(passenger, CENTRO_POINT, CENTRO_POINT_B, key.clone())
        .expect("create");
    let replay = harness
        .engine
        .create_ride(passenger, CENTRO_POINT, CENTRO_POINT_B, key)
        .expect("replay");

    assert!(first.created);
    assert!(!replay.created);
    assert_eq!(first.ride_id, replay.ride_id);
    assert_eq!(replay.status, RideStatus::Offered);
    assert_eq!(harness.store.ride_count().expect("count"), 1);
    assert_eq!(harness.offer_statuses(first.ride_id).len(), 1);
}

#[test]
fn invalid_coordinates_are_rejected() {
    let harness = Harness::new();
    let err = harness
        .engine
        .create_ride(PassengerId::new(), GeoPoint::new(95.0, 0.0), CENTRO_POINT, None)
        .expect_err("bad pickup");
    assert!(matches!(err, DispatchError::InvalidLocation(_)));
    assert_eq!(harness.store.ride_count().expect("count"), 0);
}

#[test]
fn expire_ride_only_before_acceptance() {
    let harness = Harness::new();
    let (_, waiting) = harness.request();
    assert_eq!(harness.engine.expire_ride(waiting.ride_id).expect("expire"), RideStatus::Expired);

    let (_, ride_id, _) = accepted_ride(&harness);
    let err = harness.engine.expire_ride(ride_id).expect_err("accepted");
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
}

#[test]
fn reroute_before_acceptance_reoffers() {
    let harness = Harness::new();
    harness.driver().spawn();
    let (passenger, receipt) = harness.request();
    let first = harness.pending_offer(receipt.ride_id);
    let fare_before = harness.engine.ride(receipt.ride_id).expect("ride").fare_amount;

    let ride = harness
        .engine
        .update_dropoff(receipt.ride_id, passenger, CHAPINERO_POINT)
        .expect("reroute");
    assert_eq!(ride.dropoff, CHAPINERO_POINT);
    assert!(ride.fare_amount > fare_before);
    assert_eq!(ride.status, RideStatus::Offered);

    let second = harness.pending_offer(receipt.ride_id);
    assert_ne!(second.id, first.id);
    // A canceled offer does not disqualify its driver.
    assert_eq!(second.driver_id, first.driver_id);
    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Canceled, OfferStatus::Pending]
    );
}

#[test]
fn reroutes_do_not_spend_the_offer_budget() {
    let harness = Harness::with_config(EngineConfig::default().with_max_offers_per_ride(1));
    let driver = harness.driver().spawn();
    let (passenger, receipt) = harness.request();

    for dropoff in [CHAPINERO_POINT, CENTRO_POINT_B, CHAPINERO_POINT] {
        harness
            .engine
            .update_dropoff(receipt.ride_id, passenger, dropoff)
            .expect("reroute");
        assert_eq!(harness.status(receipt.ride_id), RideStatus::Offered);
        assert_eq!(harness.pending_offer(receipt.ride_id).driver_id, driver);
    }
    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![
            OfferStatus::Canceled,
            OfferStatus::Canceled,
            OfferStatus::Canceled,
            OfferStatus::Pending
        ]
    );

    // The one real refusal spends it.
    let offer = harness.pending_offer(receipt.ride_id);
    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Reject)
        .expect("reject");
    assert_eq!(harness.status(receipt.ride_id), RideStatus::Expired);
}

#[test]
fn reroute_after_acceptance_reassesses_fee() {
    let harness = Harness::new();
    let (passenger, ride_id, _) = accepted_ride(&harness);
    assert_eq!(
        harness.engine.ride(ride_id).expect("ride").match_type(),
        Some(MatchType::SameNeighborhood)
    );

    let ride = harness
        .engine
        .update_dropoff(ride_id, passenger, CHAPINERO_POINT)
        .expect("reroute");
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(ride.match_type(), Some(MatchType::OutsideFence));
    assert_eq!(ride.fee_percentage(), Some(20.0));
    let assessment = ride.assessment.expect("assessment");
    assert_eq!(assessment.fare_amount, ride.fare_amount);
}

#[test]
fn reroute_by_stranger_or_after_start_fails() {
    let harness = Harness::new();
    let (passenger, ride_id, driver) = accepted_ride(&harness);

    let err = harness
        .engine
        .update_dropoff(ride_id, PassengerId::new(), CHAPINERO_POINT)
        .expect_err("stranger");
    assert!(matches!(err, DispatchError::Forbidden { .. }));

    harness.engine.mark_arrived(ride_id, driver).expect("arrive");
    harness.engine.start_trip(ride_id, driver).expect("start");
    let err = harness
        .engine
        .update_dropoff(ride_id, passenger, CHAPINERO_POINT)
        .expect_err("trip started");
    assert!(matches!(err, DispatchError::InvalidTransition { .. }));
}

#[test]
fn unknown_ride_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .engine
        .cancel_ride(dispatch_core::model::RideId::new(), Actor::Passenger(PassengerId::new()))
        .expect_err("missing");
    assert!(matches!(err, DispatchError::NotFound { .. }));
}

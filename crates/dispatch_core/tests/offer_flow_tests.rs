mod support;

use dispatch_core::clock::ONE_SEC_MS;
use dispatch_core::dispatcher::DispatchOutcome;
use dispatch_core::events::EngineEvent;
use dispatch_core::model::{OfferStatus, RideStatus};
use dispatch_core::test_helpers::*;
use dispatch_core::{Decision, DispatchError, EngineConfig};

use support::Harness;

#[test]
fn new_ride_is_offered_immediately() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, receipt) = harness.request();

    assert!(receipt.created);
    assert_eq!(receipt.status, RideStatus::Offered);
    let offer = harness.pending_offer(receipt.ride_id);
    assert_eq!(offer.driver_id, driver);
    assert_eq!(offer.expires_at, 30 * ONE_SEC_MS);

    let created: Vec<_> = harness
        .events
        .events_for(receipt.ride_id)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::OfferCreated { .. }))
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(harness.status_changes(receipt.ride_id), vec![RideStatus::Offered]);
}

#[test]
fn rejection_moves_the_ride_to_another_driver() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT_B).home(CENTRO).spawn();
    harness.driver().at(HISTORICO_POINT).home(CENTRO).spawn();
    let (_, receipt) = harness.request();

    let first = harness.pending_offer(receipt.ride_id);
    let status = harness
        .engine
        .respond_to_offer(first.id, first.driver_id, Decision::Reject)
        .expect("reject");
    assert_eq!(status, OfferStatus::Rejected);

    let second = harness.pending_offer(receipt.ride_id);
    assert_ne!(second.driver_id, first.driver_id);
    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Rejected, OfferStatus::Pending]
    );
    assert_eq!(harness.status(receipt.ride_id), RideStatus::Offered);

    // The rejected offer stays rejected.
    let err = harness
        .engine
        .respond_to_offer(first.id, first.driver_id, Decision::Accept)
        .expect_err("rejected offer");
    assert!(matches!(
        err,
        DispatchError::OfferNotPending {
            status: OfferStatus::Rejected,
            ..
        }
    ));
    assert!(err.is_conflict());
}

#[test]
fn sweep_expires_offer_after_ttl_and_redispatches() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT_B).spawn();
    harness.driver().at(HISTORICO_POINT).spawn();
    let (_, receipt) = harness.request();
    let first = harness.pending_offer(receipt.ride_id);

    harness.clock.set_ms(29 * ONE_SEC_MS);
    let report = harness.engine.sweep_expired().expect("sweep");
    assert!(report.expired.is_empty());

    harness.clock.set_ms(31 * ONE_SEC_MS);
    let report = harness.engine.sweep_expired().expect("sweep");
    assert_eq!(report.expired, vec![first.id]);
    assert_eq!(report.redispatched.len(), 1);
    let (ride_id, outcome) = &report.redispatched[0];
    assert_eq!(*ride_id, receipt.ride_id);
    let next = outcome.offer().expect("redispatched offer");
    assert_ne!(next.driver_id, first.driver_id);
    assert_eq!(next.expires_at, 61 * ONE_SEC_MS);

    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Expired, OfferStatus::Pending]
    );
    assert!(harness
        .events
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::OfferExpired { offer_id, .. } if *offer_id == first.id)));
}

#[test]
fn late_response_expires_the_offer() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT_B).spawn();
    harness.driver().at(HISTORICO_POINT).spawn();
    let (_, receipt) = harness.request();
    let first = harness.pending_offer(receipt.ride_id);

    harness.clock.set_ms(31 * ONE_SEC_MS);
    let err = harness
        .engine
        .respond_to_offer(first.id, first.driver_id, Decision::Accept)
        .expect_err("late accept");
    assert!(matches!(err, DispatchError::OfferExpired(id) if id == first.id));
    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Expired, OfferStatus::Pending]
    );
}

#[test]
fn response_at_exact_deadline_is_still_valid() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);

    harness.clock.set_ms(offer.expires_at);
    let status = harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Accept)
        .expect("accept at deadline");
    assert_eq!(status, OfferStatus::Accepted);
}

#[test]
fn answering_twice_is_not_pending() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);

    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Accept)
        .expect("accept");
    for decision in [Decision::Accept, Decision::Reject] {
        let err = harness
            .engine
            .respond_to_offer(offer.id, driver, decision)
            .expect_err("already accepted");
        assert!(matches!(
            err,
            DispatchError::OfferNotPending {
                status: OfferStatus::Accepted,
                ..
            }
        ));
    }
}

#[test]
fn only_the_offered_driver_may_respond() {
    let harness = Harness::new();
    harness.driver().spawn();
    let stranger = harness.driver().at(CHAPINERO_POINT).spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);
    assert_ne!(offer.driver_id, stranger);

    let err = harness
        .engine
        .respond_to_offer(offer.id, stranger, Decision::Accept)
        .expect_err("not their offer");
    assert!(matches!(err, DispatchError::Forbidden { .. }));
    assert_eq!(harness.pending_offer(receipt.ride_id).id, offer.id);
}

#[test]
fn last_rejection_expires_the_ride() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);

    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Reject)
        .expect("reject");

    assert_eq!(harness.status(receipt.ride_id), RideStatus::Expired);
    assert_eq!(harness.offer_statuses(receipt.ride_id), vec![OfferStatus::Rejected]);
    assert_eq!(
        harness.status_changes(receipt.ride_id),
        vec![RideStatus::Offered, RideStatus::Expired]
    );
}

#[test]
fn driver_held_by_another_offer_keeps_the_ride_waiting() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT_B).spawn();
    harness.driver().at(HISTORICO_POINT).spawn();
    let (_, first) = harness.request();
    let (_, second) = harness.request();
    let first_offer = harness.pending_offer(first.ride_id);
    let second_offer = harness.pending_offer(second.ride_id);
    assert_ne!(first_offer.driver_id, second_offer.driver_id);

    harness
        .engine
        .respond_to_offer(first_offer.id, first_offer.driver_id, Decision::Reject)
        .expect("reject");

    // The other driver is only tied up answering the second ride.
    assert_eq!(harness.status(first.ride_id), RideStatus::Offered);
    assert_eq!(harness.engine.pending_offer(first.ride_id).expect("offer"), None);
    assert_eq!(
        harness.engine.dispatch(first.ride_id).expect("dispatch"),
        DispatchOutcome::NoCandidates
    );

    harness
        .engine
        .respond_to_offer(second_offer.id, second_offer.driver_id, Decision::Reject)
        .expect("reject");
    assert_eq!(harness.pending_offer(second.ride_id).driver_id, first_offer.driver_id);
    assert_eq!(
        harness.offer_statuses(second.ride_id),
        vec![OfferStatus::Rejected, OfferStatus::Pending]
    );

    let outcome = harness.engine.dispatch(first.ride_id).expect("dispatch");
    assert_eq!(outcome.offer().map(|o| o.driver_id), Some(second_offer.driver_id));
    assert_eq!(harness.status(first.ride_id), RideStatus::Offered);
}

#[test]
fn exhaustion_can_leave_ride_waiting() {
    let harness = Harness::with_config(EngineConfig::default().with_expire_on_exhaustion(false));
    let driver = harness.driver().spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);
    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Reject)
        .expect("reject");

    assert_eq!(harness.status(receipt.ride_id), RideStatus::Offered);
    assert_eq!(
        harness.engine.dispatch(receipt.ride_id).expect("dispatch"),
        DispatchOutcome::NoCandidates
    );

    let newcomer = harness.driver().at(HISTORICO_POINT).spawn();
    let outcome = harness.engine.dispatch(receipt.ride_id).expect("dispatch");
    assert_eq!(outcome.offer().map(|o| o.driver_id), Some(newcomer));
}

#[test]
fn offer_budget_bounds_redispatch() {
    let harness = Harness::with_config(EngineConfig::default().with_max_offers_per_ride(2));
    for point in [CENTRO_POINT, CENTRO_POINT_B, HISTORICO_POINT] {
        harness.driver().at(point).spawn();
    }
    let (_, receipt) = harness.request();

    for _ in 0..2 {
        let offer = harness.pending_offer(receipt.ride_id);
        harness
            .engine
            .respond_to_offer(offer.id, offer.driver_id, Decision::Reject)
            .expect("reject");
    }

    assert_eq!(harness.status(receipt.ride_id), RideStatus::Expired);
    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Rejected, OfferStatus::Rejected]
    );
}

#[test]
fn ride_without_drivers_stays_requested() {
    let harness = Harness::new();
    let (_, receipt) = harness.request();
    assert_eq!(receipt.status, RideStatus::Requested);
    assert_eq!(
        harness.engine.dispatch(receipt.ride_id).expect("dispatch"),
        DispatchOutcome::NoCandidates
    );
    assert_eq!(harness.status(receipt.ride_id), RideStatus::Requested);

    harness.driver().spawn();
    let outcome = harness.engine.dispatch(receipt.ride_id).expect("dispatch");
    assert!(matches!(outcome, DispatchOutcome::Offered(_)));
}

#[test]
fn drivers_outside_search_radius_are_ignored() {
    let harness = Harness::new();
    harness.driver().at(USME_POINT).spawn();
    let (_, receipt) = harness.request();
    assert_eq!(receipt.status, RideStatus::Requested);
}

#[test]
fn home_drivers_beat_nearer_strangers() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT).spawn();
    let home = harness.driver().at(CENTRO_POINT_B).home(CENTRO).spawn();
    let (_, receipt) = harness.request();
    assert_eq!(harness.pending_offer(receipt.ride_id).driver_id, home);
}

#[test]
fn adjacent_home_drivers_beat_nearer_strangers() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT).spawn();
    let neighbor = harness.driver().at(CENTRO_POINT_B).home(LAS_AGUAS).spawn();
    let (_, receipt) = harness.request();
    assert_eq!(harness.pending_offer(receipt.ride_id).driver_id, neighbor);
}

#[test]
fn dispatch_is_idempotent_while_offer_pending() {
    let harness = Harness::new();
    harness.driver().spawn();
    let (_, receipt) = harness.request();
    let offer = harness.pending_offer(receipt.ride_id);

    for _ in 0..3 {
        assert_eq!(
            harness.engine.dispatch(receipt.ride_id).expect("dispatch"),
            DispatchOutcome::AlreadyPending(offer.id)
        );
    }
    assert_eq!(harness.offer_statuses(receipt.ride_id).len(), 1);
}

#[test]
fn driver_holds_one_pending_offer_at_a_time() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, first) = harness.request();
    let (_, second) = harness.request();

    assert_eq!(first.status, RideStatus::Offered);
    assert_eq!(second.status, RideStatus::Requested);

    let offer = harness.pending_offer(first.ride_id);
    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Reject)
        .expect("reject");
    let outcome = harness.engine.dispatch(second.ride_id).expect("dispatch");
    assert_eq!(outcome.offer().map(|o| o.driver_id), Some(driver));
}

#[test]
fn busy_driver_is_not_offered_until_released() {
    let harness = Harness::new();
    let driver = harness.driver().spawn();
    let (_, first) = harness.request();
    let offer = harness.pending_offer(first.ride_id);
    harness
        .engine
        .respond_to_offer(offer.id, driver, Decision::Accept)
        .expect("accept");

    let (_, second) = harness.request();
    assert_eq!(second.status, RideStatus::Requested);

    harness.engine.mark_arrived(first.ride_id, driver).expect("arrive");
    harness.engine.start_trip(first.ride_id, driver).expect("start");
    harness.engine.complete_trip(first.ride_id, driver).expect("complete");

    let outcome = harness.engine.dispatch(second.ride_id).expect("dispatch");
    assert_eq!(outcome.offer().map(|o| o.driver_id), Some(driver));
}

#[test]
fn going_offline_withdraws_offer_and_redispatches() {
    let harness = Harness::new();
    harness.driver().at(CENTRO_POINT_B).spawn();
    harness.driver().at(HISTORICO_POINT).spawn();
    let (_, receipt) = harness.request();
    let first = harness.pending_offer(receipt.ride_id);

    harness
        .engine
        .set_driver_offline(first.driver_id)
        .expect("offline");

    assert_eq!(
        harness.offer_statuses(receipt.ride_id),
        vec![OfferStatus::Canceled, OfferStatus::Pending]
    );
    assert_ne!(harness.pending_offer(receipt.ride_id).driver_id, first.driver_id);
}

#[test]
fn driver_out_of_range_is_found_after_moving() {
    let harness = Harness::new();
    let driver = harness.driver().at(USME_POINT).spawn();
    let (_, receipt) = harness.request();
    assert_eq!(receipt.status, RideStatus::Requested);

    harness
        .engine
        .update_driver_position(driver, CENTRO_POINT_B)
        .expect("move");
    let outcome = harness.engine.dispatch(receipt.ride_id).expect("dispatch");
    assert_eq!(outcome.offer().map(|o| o.driver_id), Some(driver));
    assert_eq!(harness.status(receipt.ride_id), RideStatus::Offered);
}

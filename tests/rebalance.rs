//! Tablet moves between groups

mod common;

use common::{config, harness, token, wait_until, zero_over, FaultyGateway};
use minizero::common::METRICS;
use minizero::coordinator::rebalance::rebalance_once;
use minizero::coordinator::Tablet;
use minizero::Error;
use std::sync::Arc;

#[tokio::test]
async fn moves_a_tablet_from_largest_to_smallest_group() {
    let h = harness(3).await;
    for (pred, gid, space) in [("name", 1, 100), ("age", 1, 40), ("friend", 2, 10)] {
        h.zero
            .should_serve(Tablet::new(pred, gid).with_space(space), &token())
            .await
            .unwrap();
    }

    let planned = rebalance_once(&h.zero, &token()).await.unwrap().unwrap();
    assert_eq!(planned.tablet.predicate, "age");
    assert_eq!((planned.from, planned.to), (1, 2));

    let owner = h.zero.serving_tablet("age").unwrap();
    assert_eq!(owner.group_id, 2);
    assert!(!owner.force);
    let state = h.zero.membership_state();
    assert!(!state.groups[&1].tablets.contains_key("age"));
    assert_eq!(state.groups[&2].size(), 50);

    // 100 vs 50: half the gap is 25, nothing fits.
    assert!(rebalance_once(&h.zero, &token()).await.unwrap().is_none());
}

#[tokio::test]
async fn followers_do_not_rebalance() {
    let h = harness(3).await;
    for (pred, gid, space) in [("name", 1, 100), ("age", 1, 30), ("friend", 2, 1)] {
        h.zero
            .should_serve(Tablet::new(pred, gid).with_space(space), &token())
            .await
            .unwrap();
    }
    h.raft.step_down(3, Some(2));

    assert!(rebalance_once(&h.zero, &token()).await.unwrap().is_none());
    assert_eq!(h.zero.serving_tablet("age").unwrap().group_id, 1);
}

#[tokio::test]
async fn shutdown_interrupts_a_pending_move() {
    let h = harness(3).await;
    for (pred, gid, space) in [("name", 1, 100), ("age", 1, 40), ("friend", 2, 10)] {
        h.zero
            .should_serve(Tablet::new(pred, gid).with_space(space), &token())
            .await
            .unwrap();
    }
    let gateway = Arc::new(FaultyGateway::held(h.raft.clone()));
    let zero = zero_over(&h, gateway.clone(), &config(3));
    let failed = METRICS.proposals_failed.get();

    let shutdown = zero.shutdown_token();
    let round = {
        let zero = zero.clone();
        tokio::spawn(async move { rebalance_once(&zero, &shutdown).await })
    };
    wait_until(|| gateway.submitted() == 1).await;
    zero.shutdown();

    assert!(matches!(round.await.unwrap(), Err(Error::Cancelled)));
    assert!(METRICS.proposals_failed.get() > failed);
    assert_eq!(h.zero.serving_tablet("age").unwrap().group_id, 1);
}

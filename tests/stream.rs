//! StreamMembership and leader-change notification

mod common;

use common::{harness, join, settle_leadership, token, zero_over, FaultyGateway};
use minizero::coordinator::{ConnectionRegistry, MembershipState};
use minizero::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn cancelled_stream_sends_exactly_one_snapshot() {
    let h = harness(3).await;
    join(&h, "alpha1:7080", 0).await;

    let (tx, mut rx) = mpsc::channel::<MembershipState>(1);
    let cancel = token();
    cancel.cancel();
    let err = h.zero.stream_membership(tx, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    let first = rx.recv().await.unwrap();
    assert_eq!(first.groups.len(), 1);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn stream_follows_changes() {
    let h = harness(3).await;
    let (tx, mut rx) = mpsc::channel(1);
    let cancel = token();
    let zero = h.zero.clone();
    let stream_cancel = cancel.clone();
    let task = tokio::spawn(async move { zero.stream_membership(tx, &stream_cancel).await });

    let first = rx.recv().await.unwrap();
    assert!(first.groups.is_empty());

    join(&h, "alpha1:7080", 0).await;
    let seen = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = rx.recv().await.unwrap();
            if !state.groups.is_empty() {
                return state;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(seen.groups[&1].members[&1].addr, "alpha1:7080");

    cancel.cancel();
    drop(rx);
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled | Error::StreamClosed));
}

#[tokio::test]
async fn stream_ends_when_subscriber_leaves() {
    let h = harness(3).await;
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let err = h.zero.stream_membership(tx, &token()).await.unwrap_err();
    assert!(matches!(err, Error::StreamClosed));
}

#[tokio::test]
async fn shutdown_ends_streams() {
    let h = harness(3).await;
    let (tx, mut rx) = mpsc::channel(1);
    let zero = h.zero.clone();
    let task = tokio::spawn(async move { zero.stream_membership(tx, &token()).await });

    rx.recv().await.unwrap();
    h.zero.shutdown();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ShutDown));
}

#[tokio::test]
async fn leader_change_bumps_generation() {
    let h = harness(3).await;
    settle_leadership(&h).await;
    let mut changes = h.zero.leader_changes();
    let start = *changes.borrow_and_update();

    h.zero.trigger_leader_change();
    changes.changed().await.unwrap();
    assert_eq!(*changes.borrow_and_update(), start + 1);

    // Consensus leadership changes are forwarded by the watcher.
    h.raft.step_down(2, Some(7));
    tokio::time::timeout(Duration::from_secs(5), changes.changed())
        .await
        .unwrap()
        .unwrap();
    assert!(*changes.borrow() > start + 1);
}

#[tokio::test]
async fn zero_leader_flag_tracks_consensus() {
    let h = harness(3).await;
    settle_leadership(&h).await;

    let handle = h.zero.leader(0);
    assert!(handle.is_none(), "zero address was never connected");
    h.cluster.registry().connect("zero1:5080");
    assert_eq!(h.zero.leader(0).unwrap().addr(), "zero1:5080");
}

#[tokio::test]
async fn read_barrier_failure_before_first_snapshot() {
    let h = harness(3).await;
    let gateway = Arc::new(FaultyGateway::new(h.raft.clone()));
    gateway.fail_reads();
    let zero = zero_over(&h, gateway, &common::config(3));

    let (tx, mut rx) = mpsc::channel::<MembershipState>(1);
    let err = zero.stream_membership(tx, &token()).await.unwrap_err();
    assert!(matches!(err, Error::Raft(_)));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn read_barrier_failure_ends_a_running_stream() {
    let h = harness(3).await;
    let gateway = Arc::new(FaultyGateway::new(h.raft.clone()));
    let zero = zero_over(&h, gateway.clone(), &common::config(3));

    let (tx, mut rx) = mpsc::channel(1);
    let task = {
        let zero = zero.clone();
        tokio::spawn(async move { zero.stream_membership(tx, &token()).await })
    };
    assert!(rx.recv().await.is_some());

    gateway.fail_reads();
    let res = tokio::time::timeout(Duration::from_secs(5), async {
        // Drain until the producer gives up.
        while rx.recv().await.is_some() {}
        task.await.unwrap()
    })
    .await
    .unwrap();
    assert!(matches!(res, Err(Error::Raft(_))));
}

//! Connect: node registration, id and group assignment

mod common;

use common::{config, harness, join, token, wait_until, zero_over, FaultyGateway};
use minizero::coordinator::Member;
use minizero::Error;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn first_node_gets_id_one_in_group_one() {
    let h = harness(3).await;
    let conn = h
        .zero
        .connect(Member::new(0, 0, "alpha1:7080"), &token())
        .await
        .unwrap();

    let member = conn.member.unwrap();
    assert_eq!(member.id, 1);
    assert_eq!(member.group_id, 1);
    assert_eq!(conn.state.max_raft_id, 1);
    assert_eq!(conn.state.groups[&1].members[&1].addr, "alpha1:7080");
    assert_eq!(conn.max_pending, 0);
    assert!(h.registry.connected().contains(&"alpha1:7080".to_string()));
}

#[tokio::test]
async fn reconnect_with_same_descriptor_is_idempotent() {
    let h = harness(3).await;
    let member = join(&h, "alpha1:7080", 0).await;
    let index = h.raft.last_index();

    let again = h.zero.connect(member.clone(), &token()).await.unwrap();
    assert_eq!(again.member.unwrap(), member);
    assert_eq!(h.raft.last_index(), index);
}

#[tokio::test]
async fn groups_fill_before_new_ones_open() {
    let h = harness(2).await;
    let a = join(&h, "a:7080", 0).await;
    let b = join(&h, "b:7080", 0).await;
    let c = join(&h, "c:7080", 0).await;

    assert_eq!((a.group_id, b.group_id, c.group_id), (1, 1, 2));
    assert_eq!((a.id, b.id, c.id), (1, 2, 3));
}

#[tokio::test]
async fn concurrent_connects_never_share_a_new_group() {
    let h = harness(1).await;
    let mut tasks = Vec::new();
    for i in 0..8 {
        let zero = h.zero.clone();
        tasks.push(tokio::spawn(async move {
            zero.connect(Member::new(0, 0, format!("alpha{}:7080", i)), &token())
                .await
                .unwrap()
                .member
                .unwrap()
        }));
    }

    let mut groups = HashSet::new();
    let mut ids = HashSet::new();
    for task in tasks {
        let member = task.await.unwrap();
        assert!(groups.insert(member.group_id), "group reused: {:?}", member);
        assert!(ids.insert(member.id));
    }
    assert_eq!(groups, (1..=8).collect());
    let state = h.zero.membership_state();
    assert!(state.groups.values().all(|g| g.members.len() == 1));
}

#[tokio::test]
async fn info_only_returns_state_without_registering() {
    let h = harness(3).await;
    join(&h, "alpha1:7080", 0).await;
    let index = h.raft.last_index();

    let mut info_request = Member::new(0, 0, "");
    info_request.cluster_info_only = true;
    let conn = h.zero.connect(info_request, &token()).await.unwrap();

    assert!(conn.member.is_none());
    assert_eq!(conn.max_pending, 42);
    assert_eq!(conn.state.groups.len(), 1);
    assert_eq!(h.raft.last_index(), index);
}

#[tokio::test]
async fn empty_address_is_rejected() {
    let h = harness(3).await;
    let err = h
        .zero
        .connect(Member::new(0, 0, ""), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyAddress(0)));
}

#[tokio::test]
async fn removed_id_cannot_rejoin() {
    let h = harness(3).await;
    let member = join(&h, "alpha1:7080", 0).await;
    h.zero
        .remove_node(member.id, member.group_id, &token())
        .await
        .unwrap();

    let err = h.zero.connect(member, &token()).await.unwrap_err();
    assert!(matches!(err, Error::ReusedId(1)));
    assert_eq!(h.zero.membership_state().removed.len(), 1);
}

#[tokio::test]
async fn live_id_at_another_address_is_a_duplicate() {
    let h = harness(3).await;
    let member = join(&h, "alpha1:7080", 0).await;

    let err = h
        .zero
        .connect(Member::new(member.id, 0, "impostor:7080"), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateRaftId { id: 1, .. }));
}

#[tokio::test]
async fn unreachable_member_can_move_address() {
    let h = harness(3).await;
    let member = join(&h, "alpha1:7080", 0).await;
    h.registry.set_reachable("alpha1:7080", false);

    let conn = h
        .zero
        .connect(Member::new(member.id, 0, "alpha1-new:7080"), &token())
        .await
        .unwrap();
    let moved = conn.member.unwrap();
    assert_eq!(moved.id, member.id);
    assert_eq!(moved.group_id, member.group_id);
    assert_eq!(moved.addr, "alpha1-new:7080");
    assert_eq!(conn.state.groups[&1].members.len(), 1);
}

#[tokio::test]
async fn cancelled_connect_does_nothing() {
    let h = harness(3).await;
    let cancel = token();
    cancel.cancel();
    let err = h
        .zero
        .connect(Member::new(0, 0, "alpha1:7080"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(h.zero.membership_state().groups.is_empty());
}

#[tokio::test]
async fn abandoned_connect_keeps_the_gate_until_its_proposal_commits() {
    let h = harness(1).await;
    let gateway = Arc::new(FaultyGateway::held(h.raft.clone()));
    let zero = zero_over(&h, gateway.clone(), &config(1));

    let cancel = token();
    let first = {
        let (zero, cancel) = (zero.clone(), cancel.clone());
        tokio::spawn(async move { zero.connect(Member::new(0, 0, "a:7080"), &cancel).await })
    };
    wait_until(|| gateway.submitted() == 1).await;
    cancel.cancel();
    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));

    let second = {
        let zero = zero.clone();
        tokio::spawn(async move { zero.connect(Member::new(0, 0, "b:7080"), &token()).await })
    };
    // Still blocked behind the first node's uncommitted registration.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.submitted(), 1);
    assert!(!second.is_finished());

    gateway.release();
    let member = second.await.unwrap().unwrap().member.unwrap();
    assert_eq!(member.id, 2);
    assert_eq!(member.group_id, 2);

    let state = zero.membership_state();
    assert_eq!(state.groups[&1].members[&1].addr, "a:7080");
    assert_eq!(state.groups[&2].members[&2].addr, "b:7080");
    assert_eq!(state.max_raft_id, 2);
}

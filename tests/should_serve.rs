//! ShouldServe: tablet ownership claims

mod common;

use common::{harness, token};
use minizero::coordinator::Tablet;
use minizero::Error;

#[tokio::test]
async fn first_claim_wins_the_tablet() {
    let h = harness(3).await;
    let owner = h
        .zero
        .should_serve(Tablet::new("name", 2), &token())
        .await
        .unwrap();
    assert_eq!(owner.group_id, 2);
    assert_eq!(h.zero.known_groups(), vec![2]);

    // A later claim by another group learns the existing owner.
    let owner = h
        .zero
        .should_serve(Tablet::new("name", 1), &token())
        .await
        .unwrap();
    assert_eq!(owner.group_id, 2);
}

#[tokio::test]
async fn racing_claims_converge_on_one_owner() {
    let h = harness(3).await;
    let mut tasks = Vec::new();
    for gid in 1..=6u32 {
        let zero = h.zero.clone();
        tasks.push(tokio::spawn(async move {
            zero.should_serve(Tablet::new("friend", gid), &token())
                .await
                .unwrap()
        }));
    }

    let mut owners = Vec::new();
    for task in tasks {
        owners.push(task.await.unwrap().group_id);
    }
    assert!(owners.windows(2).all(|w| w[0] == w[1]), "owners: {:?}", owners);

    let state = h.zero.membership_state();
    let holders: Vec<_> = state
        .groups
        .values()
        .filter(|g| g.tablets.contains_key("friend"))
        .collect();
    assert_eq!(holders.len(), 1);
}

#[tokio::test]
async fn claim_flags_are_cleared() {
    let h = harness(3).await;
    let mut tablet = Tablet::new("age", 1);
    tablet.force = true;
    tablet.remove = true;

    let owner = h.zero.should_serve(tablet, &token()).await.unwrap();
    assert_eq!(owner.group_id, 1);
    assert!(!owner.force);
    assert!(!owner.remove);
}

#[tokio::test]
async fn invalid_claims_are_rejected() {
    let h = harness(3).await;
    let err = h
        .zero
        .should_serve(Tablet::new("", 1), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyPredicate(1)));

    let err = h
        .zero
        .should_serve(Tablet::new("name", 0), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ZeroGroup(_)));
    assert!(h.zero.membership_state().groups.is_empty());
}

#[tokio::test]
async fn claims_fail_when_not_leader() {
    let h = harness(3).await;
    h.raft.step_down(5, Some(2));

    let err = h
        .zero
        .should_serve(Tablet::new("name", 1), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotLeader(_)));
    assert!(err.is_retryable());
}

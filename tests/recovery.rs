//! Restart recovery from the consensus log and snapshots

mod common;

use common::{harness_with_store, join, token};
use minizero::common::storage::{LogStore, MemStore};
use minizero::coordinator::{Member, Tablet};
use minizero::Error;
use std::sync::Arc;

#[tokio::test]
async fn membership_survives_restart() {
    let store: Arc<dyn LogStore> = Arc::new(MemStore::new());

    let before = {
        let h = harness_with_store(1, store.clone()).await;
        join(&h, "alpha1:7080", 0).await;
        let gone = join(&h, "alpha2:7080", 0).await;
        h.zero
            .should_serve(Tablet::new("name", 1).with_space(10), &token())
            .await
            .unwrap();
        h.zero
            .remove_node(gone.id, gone.group_id, &token())
            .await
            .unwrap();
        h.zero.membership_state()
    };

    let h = harness_with_store(1, store).await;
    let after = h.zero.membership_state();
    assert_eq!(after.groups, before.groups);
    assert_eq!(after.max_raft_id, before.max_raft_id);
    assert_eq!(after.removed, before.removed);
    assert_eq!(after.counter, before.counter);

    // Removed ids stay retired across restarts.
    let err = h
        .zero
        .connect(Member::new(2, 0, "alpha2:7080"), &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ReusedId(2)));

    // New nodes continue from the recovered id counter.
    let next = join(&h, "alpha3:7080", 0).await;
    assert_eq!(next.id, before.max_raft_id + 1);
    // Group 2 lost its only member and takes the newcomer.
    assert_eq!(next.group_id, 2);
}

#[cfg(feature = "sled-backend")]
#[tokio::test]
async fn sled_store_recovers_membership() {
    use minizero::common::storage::SledStore;

    let dir = tempfile::tempdir().unwrap();
    let before = {
        let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
        let h = harness_with_store(3, store.clone()).await;
        join(&h, "alpha1:7080", 0).await;
        let before = h.zero.membership_state();
        // Stop background tasks so the database handle is released.
        h.zero.shutdown();
        drop(h);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while Arc::strong_count(&store) > 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        before
    };

    let store: Arc<dyn LogStore> = Arc::new(SledStore::open(dir.path()).unwrap());
    let h = harness_with_store(3, store).await;
    assert_eq!(h.zero.membership_state().groups, before.groups);
}

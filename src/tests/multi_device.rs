//! Multi-engine tests: remote-update propagation, conflict staging and
//! resolution, unstaging, and unlink-vs-dirty-write races.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::blockstore::BlockStore;
use crate::data::ops::Op;
use crate::data::{Block, EntryType};
use crate::fixtures::{
    test_tlf, RecordingObserver, RecordingResolver, TestEnv, ALICE, BOB,
};
use crate::folder::FolderOps;
use crate::metastore::MetaStore;
use crate::statecheck::check_merged_state;
use crate::Error;

async fn root(ops: &FolderOps) -> crate::caches::Node {
    let (node, _) = ops.get_root_node().await.expect("root node");
    node
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn update_pump_propagates_remote_revisions() {
    let env = TestEnv::new();
    let alice = env.engine(*ALICE);
    let bob = env.engine(*BOB);

    // bob comes online first and registers for updates at the initial head
    let bob_root = root(&bob).await;
    let observer = Arc::new(RecordingObserver::default());
    bob.register_for_changes(observer.clone());

    let alice_root = root(&alice).await;
    alice.create_file(alice_root, "news", false).await.unwrap();

    wait_until("bob sees the create", || {
        observer
            .batches
            .lock()
            .iter()
            .flatten()
            .any(|change| change.dir_updated.contains(&"news".to_string()))
    })
    .await;

    // the directory effect is visible without an explicit server sync, and
    // revisions arrived in order
    let (node, _) = bob.lookup(bob_root, "news").await.unwrap();
    assert!(node.is_some());
    assert_eq!(
        bob.status().await.unwrap().head_revision,
        alice.status().await.unwrap().head_revision
    );
}

#[tokio::test]
async fn conflicting_writers_stage_and_resolve() {
    let env = TestEnv::new();
    let alice = env.engine(*ALICE);

    let resolver = Arc::new(RecordingResolver::default());
    let mut bob_config = env.config_for(*BOB);
    bob_config.resolver = resolver.clone();
    let bob = env.engine_with_config(bob_config);

    // both devices share the same base revision; bob's updates are paused
    // so alice's next revision stays unseen
    let alice_root = root(&alice).await;
    let bob_root = root(&bob).await;
    let base_rev = bob.status().await.unwrap().head_revision;
    let (_unpause_tx, unpause_rx) = tokio::sync::oneshot::channel::<()>();
    bob.pause_updates(unpause_rx).await;
    // give bob's pump a beat to park on the pause before the race begins
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.create_file(alice_root, "x", false).await.unwrap();
    bob.create_file(bob_root, "y", false).await.unwrap();

    // bob lost the race: staged on a fresh branch, resolver nudged with the
    // conflicting revision on both sides
    let bob_status = bob.status().await.unwrap();
    assert!(bob_status.staged);
    assert!(!bob_status.branch_id.is_null());
    assert_eq!(
        resolver.calls.lock().as_slice(),
        &[(base_rev + 1, base_rev + 1)]
    );
    let branch_head = env
        .meta_store
        .get_unmerged_for_tlf(test_tlf(), Some(bob_status.branch_id))
        .await
        .unwrap()
        .expect("unmerged head");
    assert_eq!(branch_head.revision, base_rev + 1);

    // build the resolution: alice's head plus bob's new entry
    let merged = env
        .meta_store
        .get_for_tlf(test_tlf())
        .await
        .unwrap()
        .expect("merged head");
    let crypto = crate::LocalCrypto::default();
    let mut resolved = merged.make_successor(&crypto).unwrap();

    let (merged_root_buf, _) = env
        .block_store
        .get(test_tlf(), merged.data.dir.ptr())
        .await
        .unwrap();
    let mut root_block = bincode::deserialize::<Block>(&merged_root_buf)
        .unwrap()
        .into_dir(merged.data.dir.ptr())
        .unwrap();
    let (unmerged_root_buf, _) = env
        .block_store
        .get(test_tlf(), branch_head.data.dir.ptr())
        .await
        .unwrap();
    let unmerged_root = bincode::deserialize::<Block>(&unmerged_root_buf)
        .unwrap()
        .into_dir(branch_head.data.dir.ptr())
        .unwrap();
    let y_entry = unmerged_root.children()["y"].clone();
    root_block
        .children_mut()
        .insert("y".to_string(), y_entry.clone());

    let old_root_info = merged.data.dir.info;
    resolved.add_op(Op::new_create("y", old_root_info.ptr, EntryType::File));
    let (new_root_info, plain_size, ready) = bob
        .ready_block(&resolved, &Block::Dir(root_block))
        .unwrap();
    env.block_store
        .put(test_tlf(), new_root_info.ptr, ready)
        .await
        .unwrap();
    resolved.add_ref_block(y_entry.info);
    resolved.add_update(old_root_info, new_root_info);
    resolved.data.dir.info = new_root_info;
    resolved.data.dir.size = plain_size as u64;

    // the notification op is fixed up against bob's local pointers
    let mut notify_op = Op::new_create("y", branch_head.data.dir.ptr(), EntryType::File);
    notify_op.add_update(branch_head.data.dir.ptr(), new_root_info.ptr);

    bob.finalize_resolution(resolved, &[notify_op]).await.unwrap();

    // staged state cleared, branch pruned, head moved past the conflict
    let bob_status_after = bob.status().await.unwrap();
    assert!(!bob_status_after.staged);
    assert_eq!(bob_status_after.head_revision, base_rev + 2);
    assert!(env
        .meta_store
        .get_unmerged_for_tlf(test_tlf(), Some(bob_status.branch_id))
        .await
        .unwrap()
        .is_none());

    // both names are visible to both devices
    assert!(bob.lookup(bob_root, "x").await.unwrap().0.is_some());
    assert!(bob.lookup(bob_root, "y").await.unwrap().0.is_some());
    alice.sync_from_server().await.unwrap();
    assert!(alice.lookup(alice_root, "x").await.unwrap().0.is_some());
    assert!(alice.lookup(alice_root, "y").await.unwrap().0.is_some());
    assert_eq!(
        alice.status().await.unwrap().head_revision,
        base_rev + 2
    );
}

#[tokio::test]
async fn unstage_abandons_the_branch() {
    let env = TestEnv::new();
    let alice = env.engine(*ALICE);
    let bob = env.engine(*BOB);

    let alice_root = root(&alice).await;
    let bob_root = root(&bob).await;
    let (_unpause_tx, unpause_rx) = tokio::sync::oneshot::channel::<()>();
    bob.pause_updates(unpause_rx).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    alice.create_file(alice_root, "kept", false).await.unwrap();
    bob.create_file(bob_root, "doomed", false).await.unwrap();
    let staged_status = bob.status().await.unwrap();
    assert!(staged_status.staged);

    let merged_rev = env
        .meta_store
        .get_for_tlf(test_tlf())
        .await
        .unwrap()
        .expect("merged head")
        .revision;
    bob.unstage().await.unwrap();

    let status = bob.status().await.unwrap();
    assert!(!status.staged);
    // the unstage publishes a gc revision on top of the merged head
    assert_eq!(status.head_revision, merged_rev + 1);
    assert!(bob.lookup(bob_root, "kept").await.unwrap().0.is_some());
    assert!(matches!(
        bob.lookup(bob_root, "doomed").await.unwrap_err(),
        Error::NoSuchName(_)
    ));
    assert!(env
        .meta_store
        .get_unmerged_for_tlf(test_tlf(), Some(staged_status.branch_id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn remote_unlink_with_local_dirty_write() {
    let env = TestEnv::new();
    let alice = env.engine(*ALICE);
    let bob = env.engine(*BOB);

    let alice_root = root(&alice).await;
    alice.create_file(alice_root, "f", false).await.unwrap();

    let bob_root = root(&bob).await;
    bob.sync_from_server().await.unwrap();
    let (bob_file, _) = bob.lookup(bob_root, "f").await.unwrap();
    let bob_file = bob_file.expect("file node");

    // alice removes the file and publishes; bob applies the removal while
    // still clean
    alice.remove_entry(alice_root, "f").await.unwrap();
    bob.sync_from_server().await.unwrap();

    // bob's node is detached: lookups fail but the handle still resolves
    assert!(matches!(
        bob.lookup(bob_root, "f").await.unwrap_err(),
        Error::NoSuchName(_)
    ));
    let last_path = bob.node_cache.path_from_node(bob_file).expect("last path");
    assert_eq!(last_path.tail_name(), "f");

    // writes against the detached node stay readable locally
    let payload = vec![0xabu8; 4096];
    bob.write(bob_file, &payload, 0).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let n = bob.read(bob_file, &mut buf, 0).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf, payload);

    // a sync of the removed file short-circuits without publishing, and
    // drops the dirty state
    let rev_before = bob.status().await.unwrap().head_revision;
    assert!(!bob.sync(bob_file).await.unwrap());
    let status = bob.status().await.unwrap();
    assert_eq!(status.head_revision, rev_before);
    assert_eq!(status.dirty_files, 0);

    bob.sync_from_server().await.unwrap();
    check_merged_state(&bob).await.unwrap();
}

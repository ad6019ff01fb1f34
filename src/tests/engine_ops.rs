//! Single-engine end-to-end tests: the write/sync/read cycle, block
//! splitting, renames, the background flusher, and full state checks.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use crate::caches::Node;
use crate::data::ops::Op;
use crate::data::EntryType;
use crate::fixtures::{RecordingObserver, TestEnv, ALICE};
use crate::folder::FolderOps;
use crate::metastore::MetaStore;
use crate::statecheck::check_merged_state;
use crate::Error;

async fn root(ops: &FolderOps) -> Node {
    let (node, _) = ops.get_root_node().await.expect("root node");
    node
}

async fn read_to_vec(ops: &FolderOps, file: Node, len: usize, off: u64) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let n = ops.read(file, &mut buf, off).await.expect("read");
    buf.truncate(n as usize);
    buf
}

#[tokio::test]
async fn create_write_sync_read() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);

    let root = root(&ops).await;
    let usage_before = ops.status().await.unwrap().disk_usage;

    let (file, info) = ops.create_file(root, "f", false).await.unwrap();
    assert_eq!(info.ty, EntryType::File);
    assert_eq!(info.size, 0);

    ops.write(file, b"hello", 0).await.unwrap();
    // the unsynced write is already visible locally
    assert_eq!(read_to_vec(&ops, file, 5, 0).await, b"hello");
    let stat = ops.stat(file).await.unwrap();
    assert_eq!(stat.size, 5);

    let still_dirty = ops.sync(file).await.unwrap();
    assert!(!still_dirty);

    assert_eq!(read_to_vec(&ops, file, 5, 0).await, b"hello");
    // reading past the end clamps
    assert_eq!(read_to_vec(&ops, file, 64, 0).await, b"hello");
    assert_eq!(read_to_vec(&ops, file, 5, 5).await, b"");

    let status = ops.status().await.unwrap();
    assert!(status.disk_usage > usage_before);
    assert_eq!(status.dirty_files, 0);

    ops.sync_from_server().await.unwrap();
    let report = check_merged_state(&ops).await.unwrap();
    assert_eq!(report.live_bytes, status.disk_usage);
}

#[tokio::test]
async fn sync_then_read_from_fresh_engine() {
    let env = TestEnv::new();
    let ops1 = env.engine(*ALICE);

    let root1 = root(&ops1).await;
    let (file1, _) = ops1.create_file(root1, "f", false).await.unwrap();
    ops1.write(file1, b"across engines", 0).await.unwrap();
    ops1.sync(file1).await.unwrap();

    let ops2 = env.engine(*ALICE);
    let root2 = root(&ops2).await;
    let (file2, info) = ops2.lookup(root2, "f").await.unwrap();
    let file2 = file2.expect("file node");
    assert_eq!(info.size, 14);
    assert_eq!(read_to_vec(&ops2, file2, 14, 0).await, b"across engines");
}

#[tokio::test]
async fn interleaved_writes_and_truncates_reproduce_contents() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (file, _) = ops.create_file(root, "f", false).await.unwrap();

    // model contents on the side
    let mut model = Vec::new();
    let apply_write = |model: &mut Vec<u8>, data: &[u8], off: usize| {
        if model.len() < off + data.len() {
            model.resize(off + data.len(), 0);
        }
        model[off..off + data.len()].copy_from_slice(data);
    };

    ops.write(file, b"aaaaaaaaaa", 0).await.unwrap();
    apply_write(&mut model, b"aaaaaaaaaa", 0);
    ops.write(file, b"bbb", 4).await.unwrap();
    apply_write(&mut model, b"bbb", 4);
    ops.truncate(file, 6).await.unwrap();
    model.truncate(6);
    ops.write(file, b"cc", 8).await.unwrap();
    model.resize(8, 0);
    apply_write(&mut model, b"cc", 8);

    ops.sync(file).await.unwrap();
    assert_eq!(read_to_vec(&ops, file, 64, 0).await, model);
    assert_eq!(ops.stat(file).await.unwrap().size, model.len() as u64);
}

#[tokio::test]
async fn large_files_go_indirect_and_round_trip() {
    let env = TestEnv::new().with_block_size(8);
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (file, _) = ops.create_file(root, "big", false).await.unwrap();

    let data: Vec<u8> = (0u8..40).collect();
    ops.write(file, &data, 0).await.unwrap();
    assert!(!ops.sync(file).await.unwrap());
    assert_eq!(read_to_vec(&ops, file, 64, 0).await, data);
    // unaligned reads cross block boundaries
    assert_eq!(read_to_vec(&ops, file, 10, 5).await, &data[5..15]);

    // a shrinking truncate drops whole trailing blocks
    ops.truncate(file, 13).await.unwrap();
    assert!(!ops.sync(file).await.unwrap());
    assert_eq!(read_to_vec(&ops, file, 64, 0).await, &data[..13]);

    // overwrite spanning multiple blocks
    ops.write(file, &[0xfe; 6], 6).await.unwrap();
    assert!(!ops.sync(file).await.unwrap());
    let mut expected = data[..13].to_vec();
    expected[6..12].copy_from_slice(&[0xfe; 6]);
    assert_eq!(read_to_vec(&ops, file, 64, 0).await, expected);

    ops.sync_from_server().await.unwrap();
    check_merged_state(&ops).await.unwrap();
}

#[tokio::test]
async fn concurrent_disjoint_writes_both_land() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (file, _) = ops.create_file(root, "f", false).await.unwrap();
    ops.truncate(file, 64).await.unwrap();

    let a = {
        let ops = ops.clone();
        tokio::spawn(async move { ops.write(file, &[b'x'; 16], 0).await })
    };
    let b = {
        let ops = ops.clone();
        tokio::spawn(async move { ops.write(file, &[b'y'; 16], 32).await })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    ops.sync(file).await.unwrap();
    let contents = read_to_vec(&ops, file, 64, 0).await;
    assert_eq!(&contents[..16], &[b'x'; 16]);
    assert_eq!(&contents[16..32], &[0u8; 16]);
    assert_eq!(&contents[32..48], &[b'y'; 16]);
}

#[tokio::test]
async fn deferred_write_during_sync_replays_on_the_new_path() {
    let gated = Arc::new(crate::fixtures::GatedBlockStore::new());
    let env = TestEnv::new().with_block_store(gated.clone());
    let ops = env.engine(*ALICE);
    let observer = Arc::new(RecordingObserver::default());
    ops.register_for_changes(observer.clone());

    let root = root(&ops).await;
    let (file, _) = ops.create_file(root, "f", false).await.unwrap();
    ops.write(file, &[b'a'; 64], 0).await.unwrap();

    gated.hold_puts();
    let sync_task = {
        let ops = ops.clone();
        tokio::spawn(async move { ops.sync(file).await })
    };
    while gated.waiting() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // the sync is parked on its block puts; this write targets blocks that
    // are mid-sync and must be deferred
    ops.write(file, &[b'b'; 16], 0).await.unwrap();
    // the dirty data is readable throughout the sync
    let during = read_to_vec(&ops, file, 32, 0).await;
    assert_eq!(&during[..16], &[b'b'; 16]);
    assert_eq!(&during[16..], &[b'a'; 16]);

    gated.release(64);
    let still_dirty = sync_task.await.unwrap().unwrap();
    assert!(still_dirty);

    let after = read_to_vec(&ops, file, 32, 0).await;
    assert_eq!(&after[..16], &[b'b'; 16]);
    assert_eq!(&after[16..], &[b'a'; 16]);

    // a follow-up sync flushes the replayed write for good
    assert!(!ops.sync(file).await.unwrap());
    assert_eq!(ops.status().await.unwrap().dirty_files, 0);

    // one local change per write call
    assert_eq!(observer.local.lock().len(), 2);
}

#[tokio::test]
async fn rename_across_parents_in_one_revision() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let observer = Arc::new(RecordingObserver::default());
    ops.register_for_changes(observer.clone());

    let root = root(&ops).await;
    let (dir_a, _) = ops.create_dir(root, "a").await.unwrap();
    let (dir_b, _) = ops.create_dir(root, "b").await.unwrap();
    let (file, _) = ops.create_file(dir_a, "x", false).await.unwrap();
    ops.write(file, b"payload", 0).await.unwrap();
    ops.sync(file).await.unwrap();
    let (_, _) = ops.create_file(dir_b, "keep", false).await.unwrap();

    let a_ptr_before = ops
        .node_cache
        .path_from_node(dir_a)
        .unwrap()
        .tail_pointer();
    let b_ptr_before = ops
        .node_cache
        .path_from_node(dir_b)
        .unwrap()
        .tail_pointer();
    let revision_before = ops.status().await.unwrap().head_revision;
    observer.batches.lock().clear();

    ops.rename(dir_a, "x", dir_b, "x").await.unwrap();

    // exactly one revision, carrying a rename op naming both parents
    let status = ops.status().await.unwrap();
    assert_eq!(status.head_revision, revision_before + 1);
    let head = env
        .meta_store
        .get_for_tlf(crate::fixtures::test_tlf())
        .await
        .unwrap()
        .unwrap();
    match &head.data.changes.ops[0] {
        Op::Rename {
            old_name,
            new_name,
            old_dir,
            new_dir,
            ..
        } => {
            assert_eq!(old_name, "x");
            assert_eq!(new_name, "x");
            assert_eq!(old_dir.old, a_ptr_before);
            assert_eq!(new_dir.expect("cross-directory").old, b_ptr_before);
        }
        other => panic!("expected a rename op, got {}", other),
    }

    // the old name is gone, the new one resolves to the same node
    match ops.lookup(dir_a, "x").await {
        Err(Error::NoSuchName(name)) => assert_eq!(name, "x"),
        other => panic!("expected NoSuchName, got {:?}", other.map(|_| ())),
    }
    let (moved, _) = ops.lookup(dir_b, "x").await.unwrap();
    assert_eq!(moved, Some(file));
    let path = ops.node_cache.path_from_node(file).unwrap();
    assert_eq!(path.to_string(), format!("{}/b/x", crate::fixtures::test_tlf()));
    assert_eq!(read_to_vec(&ops, file, 7, 0).await, b"payload");

    // the batch change names both directories
    let batches = observer.batches.lock();
    let rename_batch = batches
        .iter()
        .find(|batch| batch.len() >= 2)
        .expect("a batch naming both parents");
    assert!(rename_batch
        .iter()
        .any(|change| change.node == Some(dir_a) && change.dir_updated == ["x"]));
    assert!(rename_batch
        .iter()
        .any(|change| change.node == Some(dir_b) && change.dir_updated == ["x"]));
}

#[tokio::test]
async fn rename_onto_directory_is_rejected() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (_, _) = ops.create_file(root, "f", false).await.unwrap();
    let (_, _) = ops.create_dir(root, "d").await.unwrap();

    let err = ops.rename(root, "f", root, "d").await.unwrap_err();
    assert!(matches!(err, Error::NotFile(_)));
}

#[tokio::test]
async fn rename_onto_file_unrefs_the_target() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (winner, _) = ops.create_file(root, "src", false).await.unwrap();
    ops.write(winner, b"winner", 0).await.unwrap();
    ops.sync(winner).await.unwrap();
    let (loser, _) = ops.create_file(root, "dst", false).await.unwrap();
    ops.write(loser, b"loser", 0).await.unwrap();
    ops.sync(loser).await.unwrap();

    ops.rename(root, "src", root, "dst").await.unwrap();
    let (node, info) = ops.lookup(root, "dst").await.unwrap();
    assert_eq!(node, Some(winner));
    assert_eq!(info.size, 6);
    assert!(ops.lookup(root, "src").await.is_err());

    ops.sync_from_server().await.unwrap();
    check_merged_state(&ops).await.unwrap();
}

#[tokio::test]
async fn empty_dir_rules_and_name_checks() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;

    let (dir, _) = ops.create_dir(root, "d").await.unwrap();
    ops.create_file(dir, "child", false).await.unwrap();
    assert!(matches!(
        ops.remove_dir(root, "d").await.unwrap_err(),
        Error::DirNotEmpty(_)
    ));
    ops.remove_entry(dir, "child").await.unwrap();
    ops.remove_dir(root, "d").await.unwrap();
    assert!(ops.lookup(root, "d").await.is_err());

    assert!(matches!(
        ops.create_file(root, ".coffer.status", false)
            .await
            .unwrap_err(),
        Error::DisallowedPrefix(..)
    ));
    let long = "n".repeat(300);
    assert!(matches!(
        ops.create_dir(root, &long).await.unwrap_err(),
        Error::NameTooLong(..)
    ));

    ops.create_dir(root, "e").await.unwrap();
    assert!(matches!(
        ops.create_file(root, "e", false).await.unwrap_err(),
        Error::NameExists(_)
    ));
}

#[tokio::test]
async fn symlinks_and_attributes() {
    let env = TestEnv::new();
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;

    let info = ops.create_link(root, "ln", "target/elsewhere").await.unwrap();
    assert_eq!(info.ty, EntryType::Sym);
    let (node, looked_up) = ops.lookup(root, "ln").await.unwrap();
    assert!(node.is_none());
    assert_eq!(looked_up.sym_path.as_deref(), Some("target/elsewhere"));

    let (file, _) = ops.create_file(root, "f", false).await.unwrap();
    ops.set_ex(file, true).await.unwrap();
    assert_eq!(ops.stat(file).await.unwrap().ty, EntryType::Exec);
    ops.set_ex(file, false).await.unwrap();
    assert_eq!(ops.stat(file).await.unwrap().ty, EntryType::File);

    ops.set_mtime(file, Some(1_234_567)).await.unwrap();
    assert_eq!(ops.stat(file).await.unwrap().mtime, 1_234_567);
    // a bare atime update is ignored
    ops.set_mtime(file, None).await.unwrap();
    assert_eq!(ops.stat(file).await.unwrap().mtime, 1_234_567);
}

#[tokio::test]
async fn background_flusher_syncs_dirty_files() {
    let mut env = TestEnv::new();
    env.flush_interval = Some(Duration::from_millis(20));
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;
    let (file, _) = ops.create_file(root, "f", false).await.unwrap();
    ops.write(file, b"flush me", 0).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if ops.status().await.unwrap().dirty_files == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "flusher never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let fresh = env.engine(*ALICE);
    let fresh_root = self::root(&fresh).await;
    let (fresh_file, _) = fresh.lookup(fresh_root, "f").await.unwrap();
    assert_eq!(
        read_to_vec(&fresh, fresh_file.unwrap(), 8, 0).await,
        b"flush me"
    );
    ops.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_check_after_a_mixed_sequence() {
    let env = TestEnv::new().with_block_size(16);
    let ops = env.engine(*ALICE);
    let root = root(&ops).await;

    let (docs, _) = ops.create_dir(root, "docs").await.unwrap();
    let (tmp, _) = ops.create_dir(root, "tmp").await.unwrap();
    let (a, _) = ops.create_file(docs, "a", false).await.unwrap();
    ops.write(a, &[7u8; 50], 0).await.unwrap();
    ops.sync(a).await.unwrap();
    let (b, _) = ops.create_file(tmp, "b", true).await.unwrap();
    ops.write(b, b"short", 0).await.unwrap();
    ops.sync(b).await.unwrap();

    ops.truncate(a, 20).await.unwrap();
    ops.sync(a).await.unwrap();
    ops.rename(tmp, "b", docs, "b").await.unwrap();
    ops.remove_dir(root, "tmp").await.unwrap();

    ops.sync_from_server().await.unwrap();
    let report = check_merged_state(&ops).await.unwrap();
    assert_eq!(report.live_bytes, ops.status().await.unwrap().disk_usage);
    assert!(report.live_blocks >= 4);
}

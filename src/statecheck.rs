//! A correctness diagnostic that cross-checks a folder's full merged history
//! against the blocks actually reachable and the block store's reference
//! table. Not scalable (it replays everything in memory); used by end-to-end
//! tests and optionally at shutdown.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::blockstore::{MemoryBlockStore, RefStatus};
use crate::data::md::REVISION_INITIAL;
use crate::data::{BlockPointer, EntryType, Op, Path};
use crate::folder::FolderOps;
use crate::ids::{BlockId, RefNonce};
use crate::locking::LockState;
use crate::metastore::get_merged_updates;
use crate::Error;

/// Totals reported by a successful check.
#[derive(Clone, Debug)]
pub struct StateCheckReport {
    pub live_blocks: usize,
    pub live_bytes: u64,
}

/// Replays every merged revision's ops to build the expected live and
/// archived block sets, walks the tree under the current head to find the
/// blocks actually reachable, and compares both against each other, the
/// recorded disk usage, and the block store's reference table.
pub async fn check_merged_state(ops: &FolderOps) -> Result<StateCheckReport, Error> {
    let store = ops
        .config
        .block_store
        .as_any()
        .downcast_ref::<MemoryBlockStore>()
        .ok_or_else(|| {
            Error::InconsistentState(
                "state checking only works against the in-memory block store".to_string(),
            )
        })?;

    let ls = LockState::new();
    let mut rmds =
        get_merged_updates(&*ops.config.meta_store, ops.id(), REVISION_INITIAL).await?;
    if rmds.is_empty() {
        debug!("no state to check");
        return Ok(StateCheckReport {
            live_blocks: 0,
            live_bytes: 0,
        });
    }
    ops.reembed_block_changes(&ls, &mut rmds).await?;

    // The newest gc op bounds which unreferenced pointers should already be
    // gone from the store entirely.
    let mut gc_revision = 0u64;
    for rmd in &rmds {
        if rmd.flags.writer_metadata_copied {
            continue;
        }
        for op in &rmd.data.changes.ops {
            if let Op::Gc { latest_rev, .. } = op {
                gc_revision = *latest_rev;
            }
        }
    }

    let mut expected_live: HashSet<BlockPointer> = HashSet::new();
    let mut archived: HashSet<BlockPointer> = HashSet::new();
    let mut actual_live: HashMap<BlockPointer, u32> = HashMap::new();
    let mut expected_ref_bytes = 0u64;

    for rmd in &rmds {
        if rmd.flags.writer_metadata_copied {
            continue;
        }
        // An unembedded change list occupies a block of its own.
        let info = rmd.data.cached_changes.info;
        if info.ptr.is_valid() {
            actual_live.insert(info.ptr, info.encoded_size);
        }

        for op in &rmd.data.changes.ops {
            let is_gc = matches!(op, Op::Gc { .. });
            let mut op_refs: HashSet<BlockPointer> = HashSet::new();
            for ptr in op.refs() {
                if ptr.is_valid() {
                    expected_live.insert(*ptr);
                    op_refs.insert(*ptr);
                }
            }
            if !is_gc {
                for ptr in op.unrefs() {
                    expected_live.remove(ptr);
                    if ptr.is_valid() {
                        // A ref and unref within one op is a failed, retried
                        // sync; such blocks are cleaned up immediately, as
                        // is everything at or before the gc horizon.
                        if rmd.revision <= gc_revision || op_refs.contains(ptr) {
                            archived.remove(ptr);
                        } else {
                            archived.insert(*ptr);
                        }
                    }
                }
            }
            for update in op.all_updates() {
                expected_live.remove(&update.old);
                if update.old.is_valid() && update.old != update.new {
                    if rmd.revision <= gc_revision {
                        archived.remove(&update.old);
                    } else {
                        archived.insert(update.old);
                    }
                }
                if update.new.is_valid() {
                    expected_live.insert(update.new);
                }
            }
        }
        expected_ref_bytes += rmd.ref_bytes;
        expected_ref_bytes -= rmd.unref_bytes;
    }
    debug!(
        live = expected_live.len(),
        bytes = expected_ref_bytes,
        "expected liveness from history"
    );

    let curr_md = rmds.last().expect("nonempty history");
    if curr_md.disk_usage != expected_ref_bytes {
        return Err(Error::InconsistentState(format!(
            "expected {} live bytes but the latest revision records {}",
            expected_ref_bytes, curr_md.disk_usage
        )));
    }

    // Walk everything reachable from the current root.
    let (root_node, _) = ops.get_root_node().await?;
    let root_path = ops
        .node_cache
        .path_from_node(root_node)
        .ok_or(Error::InvalidPath)?;
    if root_path.tail_pointer() != curr_md.data.dir.ptr() {
        return Err(Error::InconsistentState(format!(
            "root node pointer {:?} doesn't match the latest revision's root {:?}",
            root_path.tail_pointer(),
            curr_md.data.dir.ptr()
        )));
    }
    actual_live.insert(root_path.tail_pointer(), curr_md.data.dir.info.encoded_size);
    find_all_blocks(ops, &ls, root_path, &mut actual_live).await?;
    debug!(live = actual_live.len(), "actual reachable blocks");

    let mut actual_bytes = 0u64;
    for (ptr, size) in &actual_live {
        actual_bytes += u64::from(*size);
        if !expected_live.contains(ptr) {
            warn!(?ptr, "reachable block missing from expected live set");
            return Err(Error::InconsistentState(format!(
                "block {:?} is reachable but not expected to be live",
                ptr
            )));
        }
    }
    for ptr in &expected_live {
        if !actual_live.contains_key(ptr) {
            warn!(?ptr, "expected live block not reachable");
            return Err(Error::InconsistentState(format!(
                "block {:?} is expected live but not reachable",
                ptr
            )));
        }
    }
    if actual_bytes != expected_ref_bytes {
        return Err(Error::InconsistentState(format!(
            "reachable blocks total {} bytes, expected {}",
            actual_bytes, expected_ref_bytes
        )));
    }

    // Finally, the store's reference table must match expected live plus
    // archived, exactly.
    let mut expected_refs: HashMap<BlockId, HashMap<RefNonce, RefStatus>> = HashMap::new();
    for ptr in &expected_live {
        expected_refs
            .entry(ptr.id)
            .or_default()
            .insert(ptr.ref_nonce, RefStatus::Live);
    }
    for ptr in &archived {
        expected_refs
            .entry(ptr.id)
            .or_default()
            .insert(ptr.ref_nonce, RefStatus::Archived);
    }
    let actual_refs = store.all_refs(ops.id());
    if actual_refs != expected_refs {
        for (id, expected) in &expected_refs {
            match actual_refs.get(id) {
                Some(actual) if actual == expected => {}
                other => warn!(%id, ?expected, ?other, "reference mismatch"),
            }
        }
        for id in actual_refs.keys() {
            if !expected_refs.contains_key(id) {
                warn!(%id, "store holds references to an unexpected block");
            }
        }
        return Err(Error::InconsistentState(
            "the block store's reference table doesn't match the expected state".to_string(),
        ));
    }

    Ok(StateCheckReport {
        live_blocks: actual_live.len(),
        live_bytes: actual_bytes,
    })
}

/// Collects the pointer and encoded size of every block reachable from
/// `root`, one directory at a time.
async fn find_all_blocks(
    ops: &FolderOps,
    ls: &LockState,
    root: Path,
    sizes: &mut HashMap<BlockPointer, u32>,
) -> Result<(), Error> {
    let branch = root.folder_branch.branch;
    let mut worklist = vec![root];
    while let Some(dir) = worklist.pop() {
        let block = ops
            .get_block_for_reading(ls, dir.tail_pointer(), branch)
            .await?;
        let dblock = block.into_dir(dir.tail_pointer())?;
        for (name, de) in dblock.children() {
            if de.ty == EntryType::Sym {
                continue;
            }
            sizes.insert(de.ptr(), de.info.encoded_size);
            let child = dir.child_path(name, de.ptr());
            if de.ty == EntryType::Dir {
                worklist.push(child);
            } else {
                let block = ops
                    .get_block_for_reading(ls, de.ptr(), branch)
                    .await?;
                let fblock = block.into_file(de.ptr())?;
                if fblock.is_indirect() {
                    for iptr in fblock.iptrs() {
                        sizes.insert(iptr.info.ptr, iptr.info.encoded_size);
                    }
                }
            }
        }
    }
    Ok(())
}

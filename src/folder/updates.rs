//! The update pump and everything that applies remote revisions locally:
//! op notifications, node-cache maintenance, branch unwinding, and the
//! conflict-resolution hooks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, warn};

use super::{BlockPutState, FolderOps, FolderState, NodeChange, WriterState};
use crate::caches::Node;
use crate::data::md::{BlockChanges, REVISION_INITIAL, REVISION_UNINITIALIZED};
use crate::data::ops::{Attr, Op};
use crate::data::{BlockPointer, RootMetadata};
use crate::ids::{BranchId, UserId};
use crate::locking::LockState;
use crate::metastore::{get_merged_updates, get_unmerged_updates};
use crate::Error;

/// A per-revision digest of the folder's history, for diagnostics.
#[derive(Clone, Debug)]
pub struct UpdateSummary {
    pub revision: u64,
    pub writer: UserId,
    pub live_bytes: u64,
    pub ops: Vec<String>,
}

impl FolderOps {
    /// Long-lived loop applying remote revisions as the metadata store
    /// announces them. Started when the first head is installed on the
    /// master branch.
    pub(crate) async fn update_loop(
        self: Arc<FolderOps>,
        mut pause_rx: mpsc::Receiver<oneshot::Receiver<()>>,
    ) {
        let mut shutdown = self.shutdown_rx();
        loop {
            let ls = LockState::new();
            let curr_rev = self.current_md_revision(&ls).await;
            debug!(curr_rev, "registering for updates");
            let update_rx = match self
                .config
                .meta_store
                .register_for_update(self.id(), curr_rev)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("couldn't register for updates: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            tokio::select! {
                _ = update_rx => {
                    let ls = LockState::new();
                    if let Err(e) = self.get_and_apply_updates(&ls).await {
                        debug!("error applying updates: {}", e);
                        if matches!(e, Error::NotPermittedWhileDirty) {
                            // Outstanding dirty files; back off instead of
                            // spinning on the same revisions.
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                Some(unpause) = pause_rx.recv() => {
                    debug!("updates paused");
                    let _ = unpause.await;
                    debug!("updates unpaused");
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    pub(crate) async fn get_and_apply_updates(&self, ls: &LockState) -> Result<(), Error> {
        let start = self.current_md_revision(ls).await + 1;
        let rmds = get_merged_updates(&*self.config.meta_store, self.id(), start).await?;
        if rmds.is_empty() {
            return Ok(());
        }
        let mut writer = self.md_writer_lock.lock(ls).await;
        self.apply_md_updates_locked(ls, &mut writer, rmds).await
    }

    /// Applies a batch of remote revisions in order, atomically under
    /// `headLock`. Refused while staged (the resolver is nudged instead) or
    /// while local dirty state exists.
    pub(crate) async fn apply_md_updates_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        mut rmds: Vec<RootMetadata>,
    ) -> Result<(), Error> {
        let mut head = self.head_lock.write(ls).await;

        if writer.staged {
            if let Some(last) = rmds.last() {
                let unmerged_rev = head
                    .as_ref()
                    .map(|md| md.revision)
                    .unwrap_or(REVISION_UNINITIALIZED);
                self.config.resolver.resolve(unmerged_rev, last.revision);
            }
            return Err(Error::NotPermittedWhileStaged);
        }
        if self.get_state() != FolderState::Clean {
            // The next sync will land on an unmerged branch anyway and go
            // through conflict resolution.
            return Err(Error::NotPermittedWhileDirty);
        }

        self.reembed_block_changes(ls, &mut rmds).await?;

        for rmd in rmds {
            let current = head
                .as_ref()
                .map(|md| md.revision)
                .unwrap_or(REVISION_UNINITIALIZED);
            if rmd.revision <= current {
                // Already caught up.
                continue;
            }
            if rmd.revision != current + 1 {
                return Err(Error::MdUpdateApply {
                    applied: rmd.revision,
                    current,
                });
            }
            self.set_head_locked(&mut head, writer, rmd.clone())?;
            if rmd.flags.writer_metadata_copied {
                continue;
            }
            for op in rmd.data.changes.ops.clone() {
                self.notify_one_op(ls, &op, &rmd).await;
            }
        }
        Ok(())
    }

    /// Unwinds revisions from newest to oldest, firing inverted
    /// notifications so the node cache retraces its steps.
    pub(crate) async fn undo_md_updates_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        rmds: &mut Vec<RootMetadata>,
    ) -> Result<(), Error> {
        let mut head = self.head_lock.write(ls).await;

        if self.get_state() != FolderState::Clean {
            return Err(Error::NotPermittedWhileDirty);
        }
        self.reembed_block_changes(ls, rmds).await?;

        for rmd in rmds.iter().rev() {
            let current = head
                .as_ref()
                .map(|md| md.revision)
                .unwrap_or(REVISION_UNINITIALIZED);
            // Re-applying the current revision is fine on undo; its ops are
            // what get inverted.
            if rmd.revision != current && rmd.revision != current.saturating_sub(1) {
                return Err(Error::MdUpdateInvert {
                    inverted: rmd.revision,
                    current,
                });
            }
            self.set_head_locked(&mut head, writer, rmd.clone())?;
            for op in rmd.data.changes.ops.iter().rev() {
                let inverted = op.invert_for_local_notifications();
                self.notify_one_op(ls, &inverted, rmd).await;
            }
        }
        Ok(())
    }

    /// Restores the op lists of revisions whose changes were stored in a
    /// block of their own.
    pub(crate) async fn reembed_block_changes(
        &self,
        ls: &LockState,
        rmds: &mut [RootMetadata],
    ) -> Result<(), Error> {
        for rmd in rmds.iter_mut() {
            let info = rmd.data.changes.info;
            if !info.ptr.is_valid() || !rmd.data.changes.ops.is_empty() {
                continue;
            }
            let block = self
                .get_block_for_reading(ls, info.ptr, self.branch())
                .await?;
            let fblock = block.into_file(info.ptr)?;
            let mut changes: BlockChanges = bincode::deserialize(fblock.contents())?;
            // The changes block itself is an implicit ref of the revision.
            if let Some(op) = changes.ops.first_mut() {
                op.add_ref_block(info.ptr);
            }
            rmd.data.changes = changes;
            rmd.data.cached_changes.info = info;
        }
        Ok(())
    }

    /// Rewrites node-cache pointers and pending-entry keys for every update
    /// an op carried.
    fn update_pointers(&self, op: &Op) {
        let mut tracking = self.write_tracking.lock();
        for update in op.all_updates() {
            self.node_cache.update_pointer(update.old, update.new);
            let old_key = update.old.stripped();
            if let Some(entries) = tracking.de_cache.remove(&old_key) {
                tracking.de_cache.insert(update.new.stripped(), entries);
            }
        }

        // A cross-directory rename also moves any outstanding entry update
        // for the renamed file to its new parent.
        if let Op::Rename {
            old_dir,
            new_dir: Some(new_dir),
            renamed,
            ..
        } = op
        {
            let old_parent = old_dir.new.stripped();
            let moved = renamed.stripped();
            let entry = tracking
                .de_cache
                .get_mut(&old_parent)
                .and_then(|entries| entries.remove(&moved));
            if let Some(de) = entry {
                if tracking
                    .de_cache
                    .get(&old_parent)
                    .map(|entries| entries.is_empty())
                    .unwrap_or(false)
                {
                    tracking.de_cache.remove(&old_parent);
                }
                tracking
                    .de_cache
                    .entry(new_dir.new.stripped())
                    .or_default()
                    .insert(moved, de);
            }
        }
    }

    /// Unlinks any live node for `name` under the op's unreferenced
    /// pointers. The entry could be under any of them, and unlinking a
    /// pointer with no node is harmless, so all are tried.
    fn unlink_from_cache(&self, op: &Op, old_dir: BlockPointer, node: Node, name: &str) {
        let path = match self.path_from_node_for_read(node) {
            Ok(path) => path,
            Err(_) => return,
        };
        let mut child_path = path.child_path_no_ptr(name);
        let depth = child_path.nodes.len();
        child_path.nodes[depth - 2].ptr = old_dir;
        for ptr in op.unrefs() {
            child_path.nodes[depth - 1].ptr = *ptr;
            self.node_cache.unlink(*ptr, child_path.clone());
        }
    }

    /// Applies one op's effects to the node cache and fires a batch change.
    /// `headLock` is held by the caller, so local readers never observe the
    /// cache and the head out of step.
    pub(crate) async fn notify_one_op(&self, ls: &LockState, op: &Op, md: &RootMetadata) {
        self.update_pointers(op);

        let mut changes: Vec<NodeChange> = Vec::new();
        match op {
            Op::Create { dir, new_name, .. } => {
                let node = match self.node_cache.get(dir.new) {
                    Some(node) => node,
                    None => return,
                };
                debug!(name = %new_name, "notify: create");
                changes.push(NodeChange {
                    node: Some(node),
                    dir_updated: vec![new_name.clone()],
                    ..Default::default()
                });
            }
            Op::Rm { dir, old_name, .. } => {
                let node = match self.node_cache.get(dir.new) {
                    Some(node) => node,
                    None => return,
                };
                debug!(name = %old_name, "notify: remove");
                changes.push(NodeChange {
                    node: Some(node),
                    dir_updated: vec![old_name.clone()],
                    ..Default::default()
                });
                // The removed child may have a live node; detach it so
                // readers drain against the last-known path.
                self.unlink_from_cache(op, dir.old, node, old_name);
            }
            Op::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                ..
            } => {
                let old_node = self.node_cache.get(old_dir.new);
                if let Some(old_node) = old_node {
                    changes.push(NodeChange {
                        node: Some(old_node),
                        dir_updated: vec![old_name.clone()],
                        ..Default::default()
                    });
                }
                let mut new_node = match new_dir {
                    Some(nd) => {
                        let n = self.node_cache.get(nd.new);
                        if let Some(n) = n {
                            changes.push(NodeChange {
                                node: Some(n),
                                dir_updated: vec![new_name.clone()],
                                ..Default::default()
                            });
                        }
                        n
                    }
                    None => {
                        if let Some(change) = changes.last_mut() {
                            change.dir_updated.push(new_name.clone());
                        }
                        old_node
                    }
                };

                if let Some(old_node) = old_node {
                    debug!(from = %old_name, to = %new_name, "notify: rename");
                    if new_node.is_none() && self.node_cache.get(*renamed).is_some() {
                        // The renamed node is live but its new parent isn't;
                        // reconstruct the parent chain from the op's
                        // updates.
                        let target = new_dir.map(|nd| nd.new).unwrap_or(old_dir.new);
                        match self.search_for_node(ls, target, op, md).await {
                            Ok(found) => new_node = Some(found),
                            Err(e) => {
                                warn!("couldn't find the rename target dir: {}", e);
                                return;
                            }
                        }
                    }
                    if let Some(new_node) = new_node {
                        let unref_ptr = if new_node != old_node {
                            new_dir.map(|nd| nd.old).unwrap_or(old_dir.old)
                        } else {
                            old_dir.old
                        };
                        self.unlink_from_cache(op, unref_ptr, new_node, new_name);
                        self.node_cache.move_node(*renamed, new_node, new_name);
                    }
                }
            }
            Op::Sync { file, writes, .. } => {
                let node = match self.node_cache.get(file.new) {
                    Some(node) => node,
                    None => return,
                };
                debug!(count = writes.len(), "notify: sync");
                changes.push(NodeChange {
                    node: Some(node),
                    file_updated: writes.clone(),
                    ..Default::default()
                });
            }
            Op::SetAttr {
                dir, name, attr, ..
            } => {
                let node = match self.node_cache.get(dir.new) {
                    Some(node) => node,
                    None => return,
                };
                debug!(name = %name, ?attr, "notify: setAttr");
                let path = match self.path_from_node_for_read(node) {
                    Ok(path) => path,
                    Err(_) => return,
                };
                let child_path = path.child_path_no_ptr(name);
                let guard = self.block_lock.read(ls).await;
                let (guard, entry) = self.get_entry(ls, guard, &child_path).await;
                let de = match entry {
                    Ok((_, de)) => de,
                    Err(_) => return,
                };
                let child_node = match self.node_cache.get(de.ptr()) {
                    Some(child_node) => child_node,
                    None => return,
                };

                // Mirror the on-disk attribute into any pending entry update
                // so subsequent lookups agree with the remote change.
                let (_guard, real_block) = self.get_dir(ls, guard, &path).await;
                if let Ok(real_block) = real_block {
                    if let Some(real_entry) = real_block.children().get(name) {
                        let mut tracking = self.write_tracking.lock();
                        if let Some(cached) = tracking
                            .de_cache
                            .get_mut(&path.tail_pointer().stripped())
                            .and_then(|entries| entries.get_mut(&de.ptr().stripped()))
                        {
                            match attr {
                                Attr::Exec => cached.ty = real_entry.ty,
                                Attr::Mtime => cached.mtime = real_entry.mtime,
                            }
                        }
                    }
                }

                changes.push(NodeChange {
                    node: Some(child_node),
                    ..Default::default()
                });
            }
            Op::Gc { .. } => return,
        }

        self.send_batch_changes(&changes);
    }

    /// Resolves pointers to nodes using only the directories rewritten by a
    /// particular op, creating intermediate nodes along the way.
    async fn search_for_nodes(
        &self,
        ls: &LockState,
        ptrs: &[BlockPointer],
        new_ptrs: &HashSet<BlockPointer>,
        md: &RootMetadata,
    ) -> Result<HashMap<BlockPointer, Option<Node>>, Error> {
        let mut node_map: HashMap<BlockPointer, Option<Node>> = HashMap::new();
        for ptr in ptrs {
            node_map.insert(*ptr, None);
        }
        if ptrs.is_empty() {
            return Ok(node_map);
        }

        let root_ptr = md.data.dir.ptr();
        let root_node = self
            .node_cache
            .get(root_ptr)
            .ok_or(Error::NodeNotFound(root_ptr))?;
        if node_map.contains_key(&root_ptr) {
            node_map.insert(root_ptr, Some(root_node));
        }
        let root_path = self
            .path_from_node_for_read(root_node)
            .map_err(|_| Error::InvalidPath)?;

        let mut resolved = node_map.values().filter(|n| n.is_some()).count();
        let mut worklist = vec![root_path];
        while let Some(dir) = worklist.pop() {
            if resolved >= node_map.len() {
                break;
            }
            let guard = self.block_lock.read(ls).await;
            let (_guard, dblock) = self.get_dir(ls, guard, &dir).await;
            let dblock = dblock?;

            for (name, de) in dblock.children() {
                if let Some(slot) = node_map.get_mut(&de.ptr()) {
                    if slot.is_none() {
                        let child_path = dir.child_path(name, de.ptr());
                        let mut node: Option<Node> = None;
                        for pn in &child_path.nodes {
                            node = Some(self.node_cache.get_or_create(pn.ptr, &pn.name, node));
                        }
                        *slot = node;
                        resolved += 1;
                    }
                }
                if de.ty == crate::data::EntryType::Dir && new_ptrs.contains(&de.ptr()) {
                    worklist.push(dir.child_path(name, de.ptr()));
                }
            }
        }
        Ok(node_map)
    }

    async fn search_for_node(
        &self,
        ls: &LockState,
        ptr: BlockPointer,
        op: &Op,
        md: &RootMetadata,
    ) -> Result<Node, Error> {
        let new_ptrs: HashSet<BlockPointer> =
            op.all_updates().iter().map(|u| u.new).collect();
        let node_map = self.search_for_nodes(ls, &[ptr], &new_ptrs, md).await?;
        node_map
            .get(&ptr)
            .copied()
            .flatten()
            .ok_or(Error::NodeNotFound(ptr))
    }
}

// Public operations built on the update machinery.

impl FolderOps {
    /// Catches the folder up with the metadata store: refuses while dirty,
    /// waits out any in-flight conflict resolution, applies all newer merged
    /// revisions, and drains pending archivals.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn sync_from_server(&self) -> Result<(), Error> {
        let ls = LockState::new();
        let staged = {
            let writer = self.md_writer_lock.lock(&ls).await;
            writer.staged
        };
        if staged {
            self.config.resolver.wait().await?;
            let still_staged = {
                let writer = self.md_writer_lock.lock(&ls).await;
                writer.staged
            };
            if still_staged {
                return Err(Error::InconsistentState(
                    "conflict resolution did not clear staging".to_string(),
                ));
            }
        }
        if self.get_state() != FolderState::Clean {
            return Err(Error::NotPermittedWhileDirty);
        }

        self.get_and_apply_updates(&ls).await?;
        self.wait_for_archives().await;
        Ok(())
    }

    /// Abandons all unmerged revisions: unwinds them locally with inverted
    /// notifications, prunes the branch, fast-forwards to the merged head,
    /// and publishes a gc op unreferencing every block the staged era
    /// created.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn unstage(&self) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        if !writer.staged {
            return Ok(());
        }
        if self.get_state() != FolderState::Clean {
            return Err(Error::NotPermittedWhileDirty);
        }
        let bid = writer.bid;
        let store = &self.config.meta_store;

        let (branch_point, mut unmerged) =
            get_unmerged_updates(&**store, self.id(), bid).await?;
        self.undo_md_updates_locked(&ls, &mut writer, &mut unmerged)
            .await?;

        // Everything the branch created is garbage once the branch dies.
        let mut unmerged_ptrs: Vec<BlockPointer> = Vec::new();
        for rmd in &unmerged {
            for op in &rmd.data.changes.ops {
                unmerged_ptrs.extend(op.refs().iter().filter(|ptr| ptr.is_valid()));
                unmerged_ptrs.extend(
                    op.all_updates()
                        .iter()
                        .map(|u| u.new)
                        .filter(|ptr| ptr.is_valid()),
                );
            }
        }

        writer.staged = false;
        writer.bid = BranchId::NULL;

        // Rewind the head to the branch point, then roll forward along the
        // merged history.
        let base = store
            .get_range(self.id(), None, branch_point, branch_point)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                Error::InconsistentState(format!("couldn't find branch point {}", branch_point))
            })?;
        {
            let mut head = self.head_lock.write(&ls).await;
            self.set_head_locked(&mut head, &mut writer, base)?;
        }
        store.prune_branch(self.id(), bid).await?;

        let start = self.current_md_revision(&ls).await + 1;
        let rmds = get_merged_updates(&**store, self.id(), start).await?;
        if !rmds.is_empty() {
            self.apply_md_updates_locked(&ls, &mut writer, rmds).await?;
        }

        let mut md = self.get_md_for_write_locked(&ls, &mut writer).await?;
        let mut gc_op = Op::new_gc(md.revision.saturating_sub(1));
        for ptr in unmerged_ptrs {
            gc_op.add_unref_block(ptr);
        }
        md.add_op(gc_op);
        self.finalize_md_write(&ls, &mut writer, &mut md, &BlockPutState::default())
            .await
    }

    /// Rekeys the folder. Writers run the key manager; readers may only set
    /// the rekey bit for a writer to act on.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn rekey(&self) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        if writer.staged {
            return Err(Error::NotPermittedWhileStaged);
        }

        let mut md = self.get_md_for_rekey_write_locked(&ls, &mut writer).await?;
        let rekey_was_set = md.flags.rekey;
        let uid = self.config.current_user;

        if md.is_writer(uid) {
            let rekey_done = self.config.key_manager.rekey(&mut md).await?;
            if !rekey_done {
                debug!("no rekey necessary");
                return Ok(());
            }
            md.flags.rekey = false;
        } else {
            if rekey_was_set {
                debug!("rekey bit already set");
                return Ok(());
            }
            md.flags.rekey = true;
        }

        // An empty gc op, so the revision carries an op like every other.
        md.add_op(Op::new_gc(md.revision.saturating_sub(1)));
        self.finalize_md_write(&ls, &mut writer, &mut md, &BlockPutState::default())
            .await
    }

    /// Replays the folder's merged history into per-revision summaries.
    #[instrument(skip(self), err(level = "debug"))]
    pub async fn update_history(&self) -> Result<Vec<UpdateSummary>, Error> {
        let ls = LockState::new();
        let mut rmds =
            get_merged_updates(&*self.config.meta_store, self.id(), REVISION_INITIAL).await?;
        self.reembed_block_changes(&ls, &mut rmds).await?;

        Ok(rmds
            .iter()
            .map(|rmd| UpdateSummary {
                revision: rmd.revision,
                writer: rmd.data.last_writer,
                live_bytes: rmd.disk_usage,
                ops: rmd
                    .data
                    .changes
                    .ops
                    .iter()
                    .map(|op| op.to_string())
                    .collect(),
            })
            .collect())
    }

    /// Completes a conflict resolution: publishes the resolved revision on
    /// the merged branch (failing on a new conflict so the resolver can
    /// restart), prunes the staged branch, installs the head, and fires the
    /// fixed-up ops' notifications. The resolver must already have put the
    /// resolution's blocks.
    #[instrument(skip(self, md, new_ops), fields(revision = md.revision), err(level = "debug"))]
    pub async fn finalize_resolution(
        &self,
        mut md: RootMetadata,
        new_ops: &[Op],
    ) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;

        md.branch_id = BranchId::NULL;
        self.config.meta_store.put(&md).await?;
        self.config
            .meta_store
            .prune_branch(self.id(), writer.bid)
            .await?;

        let mut head = self.head_lock.write(&ls).await;
        self.set_head_locked(&mut head, &mut writer, md.clone())?;
        writer.staged = false;
        writer.bid = BranchId::NULL;
        self.archive_locked(&md);

        for op in new_ops {
            self.notify_one_op(&ls, op, &md).await;
        }
        Ok(())
    }
}

//! The sync pipeline: readying dirty blocks, propagating new pointers up the
//! tree, pushing blocks to the store, and publishing the metadata revision.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};
use tracing::{debug, instrument};

use super::{
    BlockPutState, DeferredWrite, FolderOps, FolderState, SyncBlockState, WriterState,
    MAX_PARALLEL_BLOCK_PUTS,
};
use crate::blockstore::ReadyBlockData;
use crate::caches::{CacheKind, Node};
use crate::data::md::{BlockChanges, REVISION_UNINITIALIZED};
use crate::data::{
    Block, BlockInfo, BlockPointer, DirEntry, EntryType, FileBlock, Path, PathNode, RootMetadata,
};
use crate::ids::{BlockId, BranchId};
use crate::locking::LockState;
use crate::Error;

/// Directory blocks modified across multiple `sync_block` passes within one
/// flow; a pass that stops early parks its work here for the next pass.
pub(crate) type LocalBcache = HashMap<BlockPointer, crate::data::DirBlock>;

impl FolderOps {
    /// Turns a block into its on-store form: canonical encoding, sealing,
    /// and a content-hash pointer. A direct file block identical to one
    /// already known in this folder is instead referenced under a fresh
    /// nonce.
    pub(crate) fn ready_block(
        &self,
        md: &RootMetadata,
        block: &Block,
    ) -> Result<(BlockInfo, usize, ReadyBlockData), Error> {
        let mut known = None;
        if let Block::File(fblock) = block {
            if !fblock.is_indirect() {
                known = self
                    .config
                    .block_cache
                    .check_for_known_ptr(self.id(), fblock);
            }
        }

        let encoded = bincode::serialize(block)?;
        let plain_size = encoded.len();
        let crypto = &*self.config.crypto;
        let half = crypto.make_key_half();
        let sealed = crypto.seal(&encoded, md.key_gen, &half);

        let ptr = match known {
            Some(mut ptr) => {
                ptr.ref_nonce = crypto.make_ref_nonce();
                ptr.creator = self.config.current_user;
                ptr
            }
            None => BlockPointer {
                id: BlockId::from_hash(crypto.hash(&sealed)),
                ref_nonce: Default::default(),
                key_gen: md.key_gen,
                data_ver: self.config.data_version,
                creator: self.config.current_user,
            },
        };

        let ready = ReadyBlockData {
            buf: sealed,
            server_half: half,
        };
        let info = BlockInfo {
            ptr,
            encoded_size: ready.encoded_size(),
        };
        Ok((info, plain_size, ready))
    }

    fn ready_block_multiple(
        &self,
        md: &RootMetadata,
        block: &Block,
        bps: &mut BlockPutState,
    ) -> Result<(BlockInfo, usize), Error> {
        let (info, plain_size, ready) = self.ready_block(md, block)?;
        bps.add(info.ptr, block.clone(), ready);
        Ok((info, plain_size))
    }

    /// Moves an oversized change list out of the metadata and into a block
    /// of its own, leaving the plaintext ops parked on the side for local
    /// readers.
    pub(crate) fn unembed_block_changes(
        &self,
        bps: &mut BlockPutState,
        md: &mut RootMetadata,
    ) -> Result<(), Error> {
        let changes = std::mem::take(&mut md.data.changes);
        let buf = bincode::serialize(&changes)?;

        let mut block = FileBlock::new_direct();
        block.seed = self.config.crypto.make_block_seed();
        block.set_contents(buf.into());
        let (info, _) = self.ready_block_multiple(md, &Block::File(block), bps)?;

        md.data.cached_changes = changes;
        let mut unembedded = BlockChanges::default();
        unembedded.info = info;
        md.data.changes = unembedded;
        md.ref_bytes += u64::from(info.encoded_size);
        md.disk_usage += u64::from(info.encoded_size);
        Ok(())
    }

    /// Walks from a modified block toward the folder root, readying each
    /// level and rewriting the parent's entry for it, stopping early at
    /// `stop_at` if given (the stopped-at block is parked in `lbc` for a
    /// later pass). Updates `md`'s root entry when the walk reaches the top.
    ///
    /// Returns the path of new pointers and the entry created or updated for
    /// `name`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn sync_block(
        &self,
        ls: &LockState,
        md: &mut RootMetadata,
        new_block: Block,
        dir: &Path,
        name: &str,
        entry_type: EntryType,
        mtime: bool,
        ctime: bool,
        stop_at: Option<BlockPointer>,
        lbc: &mut LocalBcache,
        bps: &mut BlockPutState,
    ) -> Result<(Path, DirEntry), Error> {
        let mut curr_block = new_block;
        let mut curr_name = name.to_string();
        let mut new_path = Path {
            folder_branch: dir.folder_branch,
            nodes: Vec::with_capacity(dir.nodes.len() + 1),
        };
        let mut new_de: Option<DirEntry> = None;
        let mut do_set_time = true;
        let now = self.now_unix_nanos();

        while new_path.nodes.len() < dir.nodes.len() + 1 {
            let (info, plain_size) = self.ready_block_multiple(md, &curr_block, bps)?;
            new_path.nodes.insert(
                0,
                PathNode {
                    ptr: info.ptr,
                    name: curr_name.clone(),
                },
            );

            // The parent to rewrite next; negative means we've reached the
            // folder root, which lives in the metadata itself.
            let prev_idx = dir.nodes.len() as i64 - new_path.nodes.len() as i64;
            let mut de;
            let mut next_name = String::new();
            let mut next_do_set_time = false;
            let mut existed = true;
            let mut parent: Option<(Path, crate::data::DirBlock)> = None;

            if prev_idx < 0 {
                de = md.data.dir.clone();
            } else {
                let prev_dir = Path {
                    folder_branch: dir.folder_branch,
                    nodes: dir.nodes[..=prev_idx as usize].to_vec(),
                };
                // Blocks modified by an earlier pass (or by the caller) are
                // picked up from the overlay rather than refetched.
                let dblock = match lbc.remove(&prev_dir.tail_pointer()) {
                    Some(dblock) => dblock,
                    None => {
                        // Directory blocks are only modified under
                        // mdWriterLock, so a short read guard per fetch is
                        // safe.
                        let guard = self.block_lock.read(ls).await;
                        let (_guard, dblock) = self.get_dir(ls, guard, &prev_dir).await;
                        dblock?
                    }
                };

                match dblock.children().get(&curr_name) {
                    Some(entry) => de = entry.clone(),
                    None => {
                        // Only the entry being created may be missing.
                        if new_path.nodes.len() > 1 {
                            return Err(Error::NoSuchName(curr_name));
                        }
                        de = DirEntry {
                            ty: entry_type,
                            ..DirEntry::default()
                        };
                        existed = false;
                        // A new entry also touches the parent's times.
                        next_do_set_time = true;
                    }
                }
                next_name = prev_dir.tail_name().to_string();
                parent = Some((prev_dir, dblock));
            }

            if de.ty == EntryType::Dir {
                de.size = plain_size as u64;
            }

            let old_info = de.info;
            if prev_idx < 0 {
                md.add_update(md.data.dir.info, info);
            } else if existed {
                md.add_update(old_info, info);
            } else {
                md.add_ref_block(info);
            }

            de.info = info;
            if do_set_time {
                if mtime {
                    de.mtime = now;
                }
                if ctime {
                    de.ctime = now;
                }
            }
            if new_de.is_none() {
                new_de = Some(de.clone());
            }

            match parent {
                None => {
                    md.data.dir = de;
                }
                Some((prev_dir, mut dblock)) => {
                    dblock.children_mut().insert(curr_name.clone(), de);

                    // Stop before the common ancestor; a later pass readies
                    // it.
                    if Some(prev_dir.tail_pointer()) == stop_at {
                        lbc.insert(prev_dir.tail_pointer(), dblock);
                        break;
                    }
                    curr_block = Block::Dir(dblock);
                }
            }
            curr_name = next_name;
            do_set_time = next_do_set_time;
        }

        Ok((new_path, new_de.unwrap_or_default()))
    }

    /// [FolderOps::sync_block] plus the embedded-changes size check.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn sync_block_and_check_embed(
        &self,
        ls: &LockState,
        md: &mut RootMetadata,
        new_block: Block,
        dir: &Path,
        name: &str,
        entry_type: EntryType,
        mtime: bool,
        ctime: bool,
        stop_at: Option<BlockPointer>,
        lbc: &mut LocalBcache,
    ) -> Result<(Path, DirEntry, BlockPutState), Error> {
        let mut bps = BlockPutState::default();
        let (new_path, new_de) = self
            .sync_block(
                ls, md, new_block, dir, name, entry_type, mtime, ctime, stop_at, lbc, &mut bps,
            )
            .await?;
        if !self
            .config
            .splitter
            .should_embed_block_changes(&md.data.changes)
        {
            self.unembed_block_changes(&mut bps, md)?;
        }
        Ok((new_path, new_de, bps))
    }

    /// Readies a single mutated block up to the root and publishes the
    /// revision; the one-call path used by directory operations.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn sync_block_and_finalize(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        mut md: RootMetadata,
        new_block: Block,
        dir: &Path,
        name: &str,
        entry_type: EntryType,
        mtime: bool,
        ctime: bool,
    ) -> Result<DirEntry, Error> {
        let mut lbc = LocalBcache::new();
        let (_, de, bps) = self
            .sync_block_and_check_embed(
                ls, &mut md, new_block, dir, name, entry_type, mtime, ctime, None, &mut lbc,
            )
            .await?;
        self.do_block_puts(&md, &bps).await?;
        self.finalize_md_write(ls, writer, &mut md, &bps).await?;
        Ok(de)
    }

    async fn put_one_block(&self, ptr: BlockPointer, data: ReadyBlockData) -> Result<(), Error> {
        if ptr.is_first_ref() {
            self.config.block_store.put(self.id(), ptr, data).await
        } else {
            self.config.block_store.add_ref(self.id(), ptr).await
        }
    }

    /// Pushes all staged blocks to the store with bounded parallelism. The
    /// first failure cancels the remaining puts.
    pub(crate) async fn do_block_puts(
        &self,
        _md: &RootMetadata,
        bps: &BlockPutState,
    ) -> Result<(), Error> {
        let mut block_futs: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + '_>>,
        > = Vec::with_capacity(bps.blocks.len());
        for (ptr, _, data) in &bps.blocks {
            let ptr = *ptr;
            let data = data.clone();
            block_futs.push(Box::pin(self.put_one_block(ptr, data)));
        }
        let mut puts = stream::iter(block_futs).buffer_unordered(MAX_PARALLEL_BLOCK_PUTS);
        while let Some(result) = puts.next().await {
            result?;
        }
        Ok(())
    }

    /// Promotes freshly created blocks into the clean cache, once the store
    /// and metadata both know about them.
    fn finalize_blocks(&self, bps: &BlockPutState) {
        for (ptr, block, _) in &bps.blocks {
            // Re-referenced blocks are already cached under their first ref.
            if !ptr.is_first_ref() {
                continue;
            }
            self.config
                .block_cache
                .put(*ptr, self.id(), block.clone(), CacheKind::Transient);
        }
    }

    /// Publishes a finished revision: merged put, or unmerged put plus a
    /// resolver nudge on conflict; then head install, archival, and
    /// notification.
    pub(crate) async fn finalize_md_write(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        md: &mut RootMetadata,
        bps: &BlockPutState,
    ) -> Result<(), Error> {
        let store = &self.config.meta_store;
        let was_staged = writer.staged;
        let mut do_unmerged_put = true;
        let mut merged_rev = REVISION_UNINITIALIZED;

        if !was_staged {
            match store.put(md).await {
                Ok(()) => do_unmerged_put = false,
                Err(e) if e.is_revision_conflict() => {
                    debug!(revision = md.revision, "conflict: {}", e);
                    // The merged head is at least what we thought our new
                    // revision would be.
                    merged_rev = md.revision;
                }
                Err(e) => return Err(e),
            }
        }

        if do_unmerged_put {
            let bid = if was_staged {
                writer.bid
            } else {
                self.config.crypto.make_branch_id()
            };
            md.branch_id = bid;
            store.put_unmerged(md, bid).await?;
            writer.staged = true;
            writer.bid = bid;
            self.config.resolver.resolve(md.revision, merged_rev);
        } else {
            if was_staged {
                // A resolution landed on the merged branch; the staged
                // history is no longer needed.
                store.prune_branch(self.id(), writer.bid).await?;
            }
            writer.staged = false;
            writer.bid = BranchId::NULL;
        }

        // Swap any unembedded changes back so local readers of this head see
        // the ops without a fetch.
        if md.data.changes.ops.is_empty() && md.data.changes.info.ptr.is_valid() {
            std::mem::swap(&mut md.data.changes, &mut md.data.cached_changes);
            let info_ptr = md.data.cached_changes.info.ptr;
            if let Some(op) = md.data.changes.ops.first_mut() {
                op.add_ref_block(info_ptr);
            }
        }
        self.transition_state(FolderState::Clean);

        self.finalize_blocks(bps);

        let mut head = self.head_lock.write(ls).await;
        self.set_head_locked(&mut head, writer, md.clone())?;
        self.archive_locked(md);

        if let Some(op) = md.data.changes.ops.last().cloned() {
            self.notify_one_op(ls, &op, md).await;
        }
        Ok(())
    }

    /// Flushes a file's dirty state into one published revision.
    ///
    /// Returns whether the file is still dirty, which happens exactly when
    /// writes arrived during the sync and were replayed.
    pub(crate) async fn sync_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        file: &Path,
    ) -> Result<bool, Error> {
        let branch = file.folder_branch.branch;
        let bcache = &self.config.block_cache;

        {
            let _guard = self.block_lock.read(ls).await;
            if !bcache.is_dirty(file.tail_pointer(), branch) {
                return Ok(false);
            }
        }

        // The dirty check comes first so that readers syncing clean files on
        // close don't trip the write-access check.
        let mut md = self.get_md_for_write_locked(ls, writer).await?;

        // A root pointer mismatch means the path is cached and the file has
        // been unlinked remotely; there is nothing to publish.
        if md.data.dir.ptr() != file.nodes[0].ptr {
            debug!(file = %file, "skipping sync for a removed file");
            let file_ptr = file.tail_pointer().stripped();
            {
                let mut tracking = self.write_tracking.lock();
                let parents: Vec<BlockPointer> = tracking
                    .de_cache
                    .iter()
                    .filter(|(_, entries)| entries.contains_key(&file_ptr))
                    .map(|(parent, _)| *parent)
                    .collect();
                for parent in parents {
                    tracking.clear_cached_entry(parent, file.tail_pointer());
                }
                tracking.unref_cache.remove(&file_ptr);
            }
            bcache.delete_dirty(file.tail_pointer(), branch);
            self.transition_state(FolderState::Clean);
            return Ok(false);
        }

        let result = self.sync_locked_inner(ls, writer, &mut md, file).await;
        if result.is_err() {
            // Keep the byte accounting from this attempt so a retry can
            // reinstate it alongside the already-readied blocks.
            let mut tracking = self.write_tracking.lock();
            if let Some(si) = tracking.unref_cache.get_mut(&file.tail_pointer().stripped()) {
                si.ref_bytes = md.ref_bytes;
                si.unref_bytes = md.unref_bytes;
                si.op.reset_update_state();
            }
        }
        result
    }

    async fn sync_locked_inner(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        md: &mut RootMetadata,
        file: &Path,
    ) -> Result<bool, Error> {
        let branch = file.folder_branch.branch;
        let bcache = &self.config.block_cache;
        let file_ptr = file.tail_pointer().stripped();
        let splitter = &*self.config.splitter;

        // Dirty-cache entries that must outlive the path switch, dropped
        // only after the new path is installed so concurrent readers of the
        // dirty file never see a gap.
        let mut local_dirty_deletes: Vec<BlockPointer> = Vec::new();
        // Pinned clean entries to release once the revision is published.
        let mut permanent_ptrs: Vec<BlockPointer> = Vec::new();

        let mut guard = self.block_lock.write(ls).await;
        let (g, top) = self
            .get_file_block(ls, guard, file.tail_pointer(), file)
            .await;
        guard = g;
        let mut top = top?;

        {
            let mut tracking = self.write_tracking.lock();
            let si = tracking
                .unref_cache
                .get_mut(&file_ptr)
                .ok_or_else(|| Error::NoSyncState(file.clone()))?;
            md.add_op(si.op.clone());
            if !si.bps.blocks.is_empty() {
                // A previous attempt already readied blocks; reinstate its
                // byte accounting and its pinned cache entries.
                md.ref_bytes = si.ref_bytes;
                md.disk_usage += si.ref_bytes;
                md.unref_bytes = si.unref_bytes;
                md.disk_usage -= si.unref_bytes;
                permanent_ptrs.extend(si.bps.blocks.iter().map(|(ptr, _, _)| *ptr));
            }
        }

        if top.is_indirect() {
            // Pass one: rebalance. Let the splitter second-guess each dirty
            // child's boundary, shuffling bytes into or out of the next
            // block.
            let mut i = 0;
            while i < top.iptrs().len() {
                let iptr = top.iptrs()[i].clone();
                let is_dirty = bcache.is_dirty(iptr.info.ptr, branch);
                if iptr.info.encoded_size > 0 && is_dirty {
                    return Err(Error::InconsistentEncodedSize(iptr.info));
                }
                if !is_dirty {
                    i += 1;
                    continue;
                }
                let (g, at) = self
                    .get_file_block_at_offset(ls, guard, file, &top, iptr.off)
                    .await;
                guard = g;
                let mut at = at?;

                let split_at = splitter.check_split(&at.block);
                if split_at > 0 {
                    // Too big: trim and prepend the excess to the next
                    // block, creating one if this was the last.
                    let end_of_block = iptr.off + at.block.contents().len() as u64;
                    let contents = at.block.contents().clone();
                    let extra = contents.slice(split_at as usize..);
                    at.block.set_contents(contents.slice(..split_at as usize));

                    if !at.more {
                        let state = guard.state_mut().expect("write guard");
                        self.new_right_block(
                            state,
                            file.tail_pointer(),
                            branch,
                            &mut top,
                            end_of_block,
                            md,
                        );
                    }
                    let (g, rat) = self
                        .get_file_block_at_offset(ls, guard, file, &top, end_of_block)
                        .await;
                    guard = g;
                    let mut rat = rat?;

                    let mut joined = extra.to_vec();
                    joined.extend_from_slice(rat.block.contents());
                    rat.block.set_contents(joined.into());
                    {
                        let state = guard.state_mut().expect("write guard");
                        self.cache_block_if_not_yet_dirty(
                            state,
                            rat.ptr,
                            branch,
                            Block::File(rat.block.clone()),
                        );
                        self.cache_block_if_not_yet_dirty(
                            state,
                            at.ptr,
                            branch,
                            Block::File(at.block.clone()),
                        );
                    }
                    top.iptrs_mut()[i + 1].off = iptr.off + at.block.contents().len() as u64;
                    md.add_unref_block(top.iptrs()[i + 1].info);
                    top.iptrs_mut()[i + 1].info.encoded_size = 0;
                } else if split_at < 0 {
                    if !at.more {
                        i += 1;
                        continue;
                    }
                    // Too small: pull bytes in from the next block.
                    let end_of_block = iptr.off + at.block.contents().len() as u64;
                    let (g, rat) = self
                        .get_file_block_at_offset(ls, guard, file, &top, end_of_block)
                        .await;
                    guard = g;
                    let mut rat = rat?;

                    let r_contents = rat.block.contents().clone();
                    let at_block_len = at.block.contents().len() as u64;
                    let n_copied = splitter.copy_until_split(
                        &mut at.block,
                        false,
                        &r_contents,
                        at_block_len,
                    );
                    let remaining = r_contents.slice(n_copied as usize..);
                    if !remaining.is_empty() {
                        rat.block.set_contents(remaining);
                        let state = guard.state_mut().expect("write guard");
                        self.cache_block_if_not_yet_dirty(
                            state,
                            rat.ptr,
                            branch,
                            Block::File(rat.block.clone()),
                        );
                        top.iptrs_mut()[i + 1].off =
                            iptr.off + at.block.contents().len() as u64;
                        md.add_unref_block(top.iptrs()[i + 1].info);
                        top.iptrs_mut()[i + 1].info.encoded_size = 0;
                    } else {
                        // The next block was drained dry; drop it.
                        md.add_unref_block(top.iptrs()[i + 1].info);
                        top.iptrs_mut().remove(i + 1);
                    }
                    let state = guard.state_mut().expect("write guard");
                    self.cache_block_if_not_yet_dirty(
                        state,
                        at.ptr,
                        branch,
                        Block::File(at.block.clone()),
                    );
                }
                i += 1;
            }

            // Pass two: ready every dirty child, pin the result in the
            // clean cache under its new id, and install the new pointer.
            for i in 0..top.iptrs().len() {
                let iptr = top.iptrs()[i].clone();
                let is_dirty = bcache.is_dirty(iptr.info.ptr, branch);
                if iptr.info.encoded_size > 0 && is_dirty {
                    return Err(Error::InconsistentEncodedSize(iptr.info));
                }
                if !is_dirty {
                    continue;
                }
                let (g, at) = self
                    .get_file_block_at_offset(ls, guard, file, &top, iptr.off)
                    .await;
                guard = g;
                let at = at?;

                let (new_info, _, ready) = self.ready_block(md, &Block::File(at.block.clone()))?;
                permanent_ptrs.push(new_info.ptr);
                bcache.put(
                    new_info.ptr,
                    self.id(),
                    Block::File(at.block.clone()),
                    CacheKind::Permanent,
                );
                // The old dirty entry stays readable until the new path is
                // in place.
                local_dirty_deletes.push(iptr.info.ptr);

                top.iptrs_mut()[i].info = new_info;
                md.add_ref_block(new_info);
                self.write_tracking
                    .lock()
                    .unref_cache
                    .get_mut(&file_ptr)
                    .ok_or_else(|| Error::NoSyncState(file.clone()))?
                    .bps
                    .add(new_info.ptr, Block::File(at.block), ready);

                let state = guard.state_mut().expect("write guard");
                state
                    .file_block_states
                    .insert(iptr.info.ptr, SyncBlockState::SyncingNotDirty);
            }

            // Publish the rebalanced top so concurrent readers of the dirty
            // file see the new child layout (readied children are pinned in
            // the clean cache).
            bcache.put_dirty(file.tail_pointer(), branch, Block::File(top.clone()));
        }

        {
            let state = guard.state_mut().expect("write guard");
            state
                .file_block_states
                .insert(file.tail_pointer(), SyncBlockState::SyncingNotDirty);
        }
        drop(guard);

        // Fold the accumulated unrefs and the pending directory entry into a
        // copy of the parent block, handed to sync_block via the overlay.
        let parent_path = file.parent_path();
        let mut lbc = LocalBcache::new();
        {
            let guard = self.block_lock.read(ls).await;
            let (_guard, dblock) = self.get_dir(ls, guard, &parent_path).await;
            let mut dblock = dblock?;

            let mut tracking = self.write_tracking.lock();
            if let Some(si) = tracking.unref_cache.get(&file_ptr) {
                for info in si.unrefs.clone() {
                    md.add_unref_block(info);
                }
            }
            let parent_key = parent_path.tail_pointer().stripped();
            let cached = tracking
                .de_cache
                .get(&parent_key)
                .and_then(|entries| entries.get(&file_ptr))
                .cloned();
            if let Some(mut de) = cached {
                if let Some(si) = tracking.unref_cache.get(&file_ptr) {
                    de.info.encoded_size = si.old_info.encoded_size;
                }
                dblock
                    .children_mut()
                    .insert(file.tail_name().to_string(), de);
                lbc.insert(parent_path.tail_pointer(), dblock);
                tracking.clear_cached_entry(parent_path.tail_pointer(), file.tail_pointer());
            }
        }

        {
            let mut tracking = self.write_tracking.lock();
            if let Some(si) = tracking.unref_cache.get_mut(&file_ptr) {
                si.ref_bytes = md.ref_bytes;
                si.unref_bytes = md.unref_bytes;
            }
        }

        let mut bps = BlockPutState::default();
        let (new_path, _) = self
            .sync_block(
                ls,
                md,
                Block::File(top),
                &parent_path,
                file.tail_name(),
                EntryType::File,
                true,
                true,
                None,
                &mut lbc,
                &mut bps,
            )
            .await?;
        if !splitter.should_embed_block_changes(&md.data.changes) {
            self.unembed_block_changes(&mut bps, md)?;
        }
        {
            let tracking = self.write_tracking.lock();
            if let Some(si) = tracking.unref_cache.get(&file_ptr) {
                bps.merge(si.bps.clone());
            }
        }

        self.do_block_puts(md, &bps).await?;
        local_dirty_deletes.push(file.tail_pointer());

        self.finalize_md_write(ls, writer, md, &bps).await?;

        // The new path is live; retire the old dirty entries, the pinned
        // clean copies, and this file's sync state, then replay anything
        // that was deferred while we were at it. Deletes run before replays
        // so the replays see a clean dirty cache.
        let mut guard = self.block_lock.write(ls).await;
        for ptr in &local_dirty_deletes {
            bcache.delete_dirty(*ptr, branch);
        }
        for ptr in &permanent_ptrs {
            bcache.delete_permanent(ptr.id);
        }
        {
            let mut tracking = self.write_tracking.lock();
            tracking.clear_cached_entry(parent_path.tail_pointer(), file.tail_pointer());
            tracking.unref_cache.remove(&file_ptr);
        }

        let (deletes, writes) = {
            let state = guard.state_mut().expect("write guard");
            state.file_block_states.clear();
            (
                std::mem::take(&mut state.deferred_dirty_deletes),
                std::mem::take(&mut state.deferred_writes),
            )
        };
        let still_dirty = !writes.is_empty();
        for ptr in deletes {
            bcache.delete_dirty(ptr, branch);
        }
        for deferred in writes {
            self.write_tracking.lock().clear_cached_entry(
                new_path.parent_path().tail_pointer(),
                file.tail_pointer(),
            );
            let (g, result) = match deferred {
                DeferredWrite::Write { data, off } => {
                    self.write_data_locked(ls, guard, md, &new_path, &data, off, false)
                        .await
                }
                DeferredWrite::Truncate { size } => {
                    self.truncate_locked(ls, guard, md, &new_path, size, false)
                        .await
                }
            };
            guard = g;
            result?;
        }
        if let Some(state) = guard.state_mut() {
            state.do_defer_write = false;
        }

        Ok(still_dirty)
    }
}

// Public sync-side operations.

impl FolderOps {
    /// Flushes a file's outstanding writes into a new metadata revision.
    /// Returns true when concurrent writes arrived mid-sync and the file is
    /// still dirty afterwards.
    #[instrument(skip(self, file), err(level = "debug"))]
    pub async fn sync(&self, file: Node) -> Result<bool, Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let file_path = self.path_from_node_for_md_write(file, &ls)?;
        self.sync_locked(&ls, &mut writer, &file_path).await
    }
}

//! The write side: copy-on-write file mutation, write deferral during
//! in-flight syncs, and the directory-mutating operations.

use bytes::Bytes;
use tracing::{debug, instrument};

use super::{
    try_g, BGuard, BlockState, DeferredWrite, FolderOps, FolderState, MdReqType, SyncBlockState,
    SyncInfo, WriteTracking, WriterState,
};
use crate::caches::Node;
use crate::data::ops::{Attr, Op};
use crate::data::{
    Block, BlockInfo, BlockPointer, BranchName, DirBlock, DirEntry, EntryInfo, EntryType,
    FileBlock, FileBody, IndirectFilePtr, Path, RootMetadata,
};
use crate::locking::LockState;
use crate::Error;

impl WriteTracking {
    /// The per-file sync info, created on the first write to the file.
    pub(crate) fn get_or_create_sync_info(&mut self, de: &DirEntry) -> &mut SyncInfo {
        self.unref_cache
            .entry(de.ptr().stripped())
            .or_insert_with(|| SyncInfo {
                old_info: de.info,
                op: Op::new_sync(de.ptr()),
                unrefs: Vec::new(),
                bps: Default::default(),
                ref_bytes: 0,
                unref_bytes: 0,
            })
    }

    pub(crate) fn set_cached_entry(&mut self, parent: BlockPointer, file: BlockPointer, de: DirEntry) {
        self.de_cache
            .entry(parent.stripped())
            .or_default()
            .insert(file.stripped(), de);
    }

    pub(crate) fn clear_cached_entry(&mut self, parent: BlockPointer, file: BlockPointer) {
        let parent = parent.stripped();
        if let Some(entries) = self.de_cache.get_mut(&parent) {
            entries.remove(&file.stripped());
            if entries.is_empty() {
                self.de_cache.remove(&parent);
            }
        }
    }
}

impl FolderOps {
    /// Publishes a mutated block into the dirty cache, honoring the
    /// copy-on-write protocol for blocks that are mid-sync: a first write to
    /// a syncing block re-dirties it and flags the operation for deferral.
    pub(crate) fn cache_block_if_not_yet_dirty(
        &self,
        state: &mut BlockState,
        ptr: BlockPointer,
        branch: BranchName,
        block: Block,
    ) {
        let bcache = &self.config.block_cache;
        if !bcache.is_dirty(ptr, branch) {
            bcache.put_dirty(ptr, branch, block);
            return;
        }
        bcache.put_dirty(ptr, branch, block);
        match state.file_block_states.get(&ptr) {
            None => {}
            Some(SyncBlockState::SyncingNotDirty) => {
                // The sync flow holds its own copy of the old version; this
                // block can now absorb further writes directly.
                state
                    .file_block_states
                    .insert(ptr, SyncBlockState::SyncingAndDirty);
                state.do_defer_write = true;
            }
            Some(SyncBlockState::SyncingAndDirty) => {
                state.do_defer_write = true;
            }
        }
    }

    /// Appends a fresh empty block to an indirect file at file offset `off`
    /// and re-dirties the top block.
    pub(super) fn new_right_block(
        &self,
        state: &mut BlockState,
        top_ptr: BlockPointer,
        branch: BranchName,
        top: &mut FileBlock,
        off: u64,
        md: &RootMetadata,
    ) -> BlockPointer {
        let crypto = &*self.config.crypto;
        let ptr = BlockPointer {
            id: crypto.make_temporary_block_id(),
            ref_nonce: Default::default(),
            key_gen: md.key_gen,
            data_ver: self.config.data_version,
            creator: self.config.current_user,
        };
        let mut rblock = FileBlock::new_direct();
        rblock.seed = crypto.make_block_seed();

        top.iptrs_mut().push(IndirectFilePtr {
            info: BlockInfo {
                ptr,
                encoded_size: 0,
            },
            off,
        });
        self.config
            .block_cache
            .put_dirty(ptr, branch, Block::File(rblock));
        self.cache_block_if_not_yet_dirty(state, top_ptr, branch, Block::File(top.clone()));
        ptr
    }

    /// Applies a write to the file's blocks under an exclusive block guard.
    /// Returns the pointers of blocks newly id'd by this write, which must
    /// be dropped from the dirty cache if the write ends up deferred.
    pub(crate) async fn write_data_locked<'a>(
        &'a self,
        ls: &'a LockState,
        mut guard: BGuard<'a>,
        md: &RootMetadata,
        file: &Path,
        data: &[u8],
        off: u64,
        do_notify: bool,
    ) -> (BGuard<'a>, Result<Vec<BlockPointer>, Error>) {
        let end = off + data.len() as u64;
        if end > self.config.max_file_bytes {
            return (
                guard,
                Err(Error::FileTooBig(end, self.config.max_file_bytes)),
            );
        }
        let uid = self.config.current_user;
        if !md.is_writer(uid) {
            return (guard, Err(Error::WriteAccess(uid, self.id())));
        }

        let branch = file.folder_branch.branch;
        let (g, top) = self
            .get_file_block(ls, guard, file.tail_pointer(), file)
            .await;
        guard = g;
        let mut top = try_g!(guard, top);

        let (g, entry) = self.get_entry(ls, guard, file).await;
        guard = g;
        let (_, mut de) = try_g!(guard, entry);
        self.write_tracking.lock().get_or_create_sync_info(&de);

        let splitter = &*self.config.splitter;
        let n = data.len() as u64;
        let mut n_copied = 0u64;
        let mut new_ptrs = Vec::new();
        let now = self.now_unix_nanos();

        while n_copied < n {
            let (g, at) = self
                .get_file_block_at_offset(ls, guard, file, &top, off + n_copied)
                .await;
            guard = g;
            let mut at = try_g!(guard, at);

            let old_len = at.block.contents().len() as u64;
            let copied = splitter.copy_until_split(
                &mut at.block,
                !at.more,
                &data[n_copied as usize..],
                off + n_copied - at.start_off,
            );
            n_copied += copied;
            let new_len = at.block.contents().len() as u64;

            // The splitter may only have appended to the final block.
            if at.more && new_len > old_len {
                return (guard, Err(Error::BadSplit));
            }

            // Out of room with data left: grow the tree rightwards.
            if n_copied < n && !at.more {
                if at.ptr == file.tail_pointer() {
                    // Promote the direct file to indirect: the current
                    // contents move under a fresh temporary id, and a new
                    // top block points at them.
                    let crypto = &*self.config.crypto;
                    let child_ptr = BlockPointer {
                        id: crypto.make_temporary_block_id(),
                        ref_nonce: Default::default(),
                        key_gen: md.key_gen,
                        data_ver: self.config.data_version,
                        creator: uid,
                    };
                    let new_top = FileBlock {
                        seed: crypto.make_block_seed(),
                        body: FileBody::Indirect(vec![IndirectFilePtr {
                            info: BlockInfo {
                                ptr: child_ptr,
                                encoded_size: 0,
                            },
                            off: 0,
                        }]),
                    };
                    self.config.block_cache.put_dirty(
                        file.tail_pointer(),
                        branch,
                        Block::File(new_top.clone()),
                    );
                    top = new_top;
                    at.ptr = child_ptr;
                    at.parent_index = Some(0);
                    new_ptrs.push(child_ptr);
                }

                let state = guard.state_mut().expect("write guard");
                let right_off = at.start_off + at.block.contents().len() as u64;
                let new_ptr =
                    self.new_right_block(state, file.tail_pointer(), branch, &mut top, right_off, md);
                new_ptrs.push(new_ptr);
            }

            if old_len != new_len || de.info.ptr.creator != uid {
                de.info.encoded_size = 0;
                de.size = de.size + new_len - old_len;
                de.mtime = now;
                de.set_writer(uid);
                let parent_ptr = file.parent_path().tail_pointer();
                self.write_tracking.lock().set_cached_entry(
                    parent_ptr,
                    file.tail_pointer(),
                    de.clone(),
                );
            }

            if let Some(idx) = at.parent_index {
                // The covering child is about to change; its recorded size
                // no longer holds.
                let old_info = top.iptrs()[idx].info;
                self.write_tracking
                    .lock()
                    .get_or_create_sync_info(&de)
                    .unrefs
                    .push(old_info);
                top.iptrs_mut()[idx].info.encoded_size = 0;
            }

            // Keep the old id while the block is dirty.
            let state = guard.state_mut().expect("write guard");
            self.cache_block_if_not_yet_dirty(state, at.ptr, branch, Block::File(at.block.clone()));
        }

        if top.is_indirect() {
            // Re-dirtying the top block guarantees a later sync picks up the
            // child changes, and that concurrent writes during a sync always
            // find the file in the sync-state table.
            let state = guard.state_mut().expect("write guard");
            self.cache_block_if_not_yet_dirty(
                state,
                file.tail_pointer(),
                branch,
                Block::File(top.clone()),
            );
            new_ptrs.push(file.tail_pointer());
        }

        let op_snapshot = {
            let mut tracking = self.write_tracking.lock();
            let si = tracking.get_or_create_sync_info(&de);
            si.op.add_write(off, data.len() as u64);
            si.op.clone()
        };
        if do_notify {
            self.notify_local(file, &op_snapshot);
        }
        self.transition_state(FolderState::Dirty);
        (guard, Ok(new_ptrs))
    }

    /// Applies a truncate under an exclusive block guard. An extending
    /// truncate is just a zero-filled write.
    pub(crate) async fn truncate_locked<'a>(
        &'a self,
        ls: &'a LockState,
        mut guard: BGuard<'a>,
        md: &RootMetadata,
        file: &Path,
        size: u64,
        do_notify: bool,
    ) -> (BGuard<'a>, Result<Vec<BlockPointer>, Error>) {
        let uid = self.config.current_user;
        if !md.is_writer(uid) {
            return (guard, Err(Error::WriteAccess(uid, self.id())));
        }

        let branch = file.folder_branch.branch;
        let (g, top) = self
            .get_file_block(ls, guard, file.tail_pointer(), file)
            .await;
        guard = g;
        let mut top = try_g!(guard, top);

        let (g, at) = self
            .get_file_block_at_offset(ls, guard, file, &top, size)
            .await;
        guard = g;
        let mut at = try_g!(guard, at);

        let curr_len = at.start_off + at.block.contents().len() as u64;
        if curr_len < size {
            let more_needed = (size - curr_len) as usize;
            return self
                .write_data_locked(
                    ls,
                    guard,
                    md,
                    file,
                    &vec![0u8; more_needed],
                    curr_len,
                    do_notify,
                )
                .await;
        } else if curr_len == size {
            return (guard, Ok(Vec::new()));
        }

        let (g, entry) = self.get_entry(ls, guard, file).await;
        guard = g;
        let (_, mut de) = try_g!(guard, entry);

        let keep = (size - at.start_off) as usize;
        let truncated = at.block.contents().slice(..keep);
        at.block.set_contents(truncated);

        {
            let mut tracking = self.write_tracking.lock();
            let si = tracking.get_or_create_sync_info(&de);
            if at.more {
                if let Some(idx) = at.parent_index {
                    for iptr in &top.iptrs()[idx + 1..] {
                        si.unrefs.push(iptr.info);
                    }
                }
            }
            if let Some(idx) = at.parent_index {
                si.unrefs.push(top.iptrs()[idx].info);
            }
            si.op.add_truncate(size);
        }

        if let Some(idx) = at.parent_index {
            if at.more {
                top.iptrs_mut().truncate(idx + 1);
            }
            top.iptrs_mut()[idx].info.encoded_size = 0;
        }

        if top.is_indirect() {
            let state = guard.state_mut().expect("write guard");
            self.cache_block_if_not_yet_dirty(
                state,
                file.tail_pointer(),
                branch,
                Block::File(top.clone()),
            );
        }

        de.info.encoded_size = 0;
        de.size = size;
        de.mtime = self.now_unix_nanos();
        de.set_writer(uid);
        let parent_ptr = file.parent_path().tail_pointer();
        self.write_tracking
            .lock()
            .set_cached_entry(parent_ptr, file.tail_pointer(), de.clone());

        let state = guard.state_mut().expect("write guard");
        self.cache_block_if_not_yet_dirty(state, at.ptr, branch, Block::File(at.block.clone()));

        let op_snapshot = {
            let mut tracking = self.write_tracking.lock();
            tracking.get_or_create_sync_info(&de).op.clone()
        };
        if do_notify {
            self.notify_local(file, &op_snapshot);
        }
        self.transition_state(FolderState::Dirty);
        (guard, Ok(Vec::new()))
    }

    /// Unreferences all blocks reachable from a removed entry.
    pub(crate) async fn unref_entry(
        &self,
        ls: &LockState,
        md: &mut RootMetadata,
        dir: &Path,
        de: &DirEntry,
        name: &str,
    ) -> Result<(), Error> {
        md.add_unref_block(de.info);
        if de.ty.is_file() {
            let child_path = dir.child_path(name, de.ptr());
            let guard = self.block_lock.read(ls).await;
            let (_guard, block) = self
                .get_file_block(ls, guard, child_path.tail_pointer(), &child_path)
                .await;
            let fblock = block?;
            if fblock.is_indirect() {
                for iptr in fblock.iptrs() {
                    md.add_unref_block(iptr.info);
                }
            }
        }
        Ok(())
    }

    async fn check_new_dir_size(
        &self,
        ls: &LockState,
        md: &RootMetadata,
        dir_path: &Path,
        new_name: &str,
    ) -> Result<(), Error> {
        let curr_size = if dir_path.has_valid_parent() {
            let guard = self.block_lock.read(ls).await;
            let (_guard, entry) = self.get_entry(ls, guard, dir_path).await;
            entry?.1.size
        } else {
            md.data.dir.size
        };
        // An estimate, ignoring the entry's own encoding overhead; with a
        // bounded name length that is at worst off by one entry.
        let new_size = curr_size + new_name.len() as u64;
        if new_size > self.config.max_dir_bytes {
            return Err(Error::DirTooBig(new_size, self.config.max_dir_bytes));
        }
        Ok(())
    }

    async fn create_entry_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        dir: Node,
        name: &str,
        ty: EntryType,
    ) -> Result<(Node, DirEntry), Error> {
        self.check_name(name)?;
        let mut md = self.get_md_for_write_locked(ls, writer).await?;
        let dir_path = self.path_from_node_for_md_write(dir, ls)?;

        let dblock = {
            let guard = self.block_lock.read(ls).await;
            let (_guard, dblock) = self.get_dir(ls, guard, &dir_path).await;
            dblock?
        };
        if dblock.children().contains_key(name) {
            return Err(Error::NameExists(name.to_string()));
        }
        self.check_new_dir_size(ls, &md, &dir_path, name).await?;

        md.add_op(Op::new_create(name, dir_path.tail_pointer(), ty));
        let seed = self.config.crypto.make_block_seed();
        let new_block = match ty {
            EntryType::Dir => {
                let mut b = DirBlock::new_direct();
                b.seed = seed;
                Block::Dir(b)
            }
            _ => {
                let mut b = FileBlock::new_direct();
                b.seed = seed;
                Block::File(b)
            }
        };

        let de = self
            .sync_block_and_finalize(ls, writer, md, new_block, &dir_path, name, ty, true, true)
            .await?;
        let node = self.node_cache.get_or_create(de.ptr(), name, Some(dir));
        Ok((node, de))
    }

    async fn create_link_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        dir: Node,
        from_name: &str,
        to_path: &str,
    ) -> Result<DirEntry, Error> {
        self.check_name(from_name)?;
        let mut md = self.get_md_for_write_locked(ls, writer).await?;
        let dir_path = self.path_from_node_for_md_write(dir, ls)?;

        let mut dblock = {
            let guard = self.block_lock.read(ls).await;
            let (_guard, dblock) = self.get_dir(ls, guard, &dir_path).await;
            dblock?
        };
        if dblock.children().contains_key(from_name) {
            return Err(Error::NameExists(from_name.to_string()));
        }
        self.check_new_dir_size(ls, &md, &dir_path, from_name).await?;

        md.add_op(Op::new_create(from_name, dir_path.tail_pointer(), EntryType::Sym));

        let now = self.now_unix_nanos();
        let de = DirEntry {
            info: BlockInfo::default(),
            ty: EntryType::Sym,
            size: to_path.len() as u64,
            sym_path: Some(to_path.to_string()),
            mtime: now,
            ctime: now,
        };
        dblock.children_mut().insert(from_name.to_string(), de.clone());

        self.sync_block_and_finalize(
            ls,
            writer,
            md,
            Block::Dir(dblock),
            &dir_path.parent_path(),
            dir_path.tail_name(),
            EntryType::Dir,
            true,
            true,
        )
        .await?;
        Ok(de)
    }

    async fn remove_entry_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        mut md: RootMetadata,
        dir_path: &Path,
        name: &str,
    ) -> Result<(), Error> {
        let mut pblock = {
            let guard = self.block_lock.read(ls).await;
            let (_guard, pblock) = self.get_dir(ls, guard, dir_path).await;
            pblock?
        };
        let de = match pblock.children().get(name) {
            Some(de) => de.clone(),
            None => return Err(Error::NoSuchName(name.to_string())),
        };

        md.add_op(Op::new_rm(name, dir_path.tail_pointer()));
        self.unref_entry(ls, &mut md, dir_path, &de, name).await?;
        pblock.children_mut().remove(name);

        self.sync_block_and_finalize(
            ls,
            writer,
            md,
            Block::Dir(pblock),
            &dir_path.parent_path(),
            dir_path.tail_name(),
            EntryType::Dir,
            true,
            true,
        )
        .await?;
        Ok(())
    }

    async fn rename_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        old_parent: &Path,
        old_name: &str,
        new_parent: &Path,
        new_name: &str,
    ) -> Result<(), Error> {
        let mut md = self.get_md_for_write_locked(ls, writer).await?;
        let now = self.now_unix_nanos();

        let mut lbc: std::collections::HashMap<BlockPointer, DirBlock> = Default::default();
        let same_dir = old_parent.tail_pointer().id == new_parent.tail_pointer().id;

        let (mut old_pblock, mut new_pblock) = {
            let mut guard = self.block_lock.read(ls).await;
            let (g, old_pblock) = self.get_dir(ls, guard, old_parent).await;
            guard = g;
            let old_pblock = old_pblock?;

            let new_pblock = if same_dir {
                None
            } else {
                let (g, new_pblock) = self.get_dir(ls, guard, new_parent).await;
                guard = g;
                let new_pblock = new_pblock?;

                // The old parent's own times change; its parent block
                // carries that entry, unless the next sync pass will cover
                // it anyway.
                let old_grandparent = old_parent.parent_path();
                if !old_grandparent.nodes.is_empty() {
                    if old_grandparent.tail_pointer().id != new_parent.tail_pointer().id {
                        let (g, b) = self.get_dir(ls, guard, &old_grandparent).await;
                        guard = g;
                        let mut b = b?;
                        if let Some(de) = b.children_mut().get_mut(old_parent.tail_name()) {
                            de.ctime = now;
                            de.mtime = now;
                            lbc.insert(old_grandparent.tail_pointer(), b);
                        }
                    }
                } else {
                    md.data.dir.ctime = now;
                    md.data.dir.mtime = now;
                }
                Some(new_pblock)
            };
            drop(guard);
            (old_pblock, new_pblock)
        };

        let mut new_de = match old_pblock.children().get(old_name) {
            Some(de) => de.clone(),
            None => return Err(Error::NoSuchName(old_name.to_string())),
        };

        md.add_op(Op::new_rename(
            old_name,
            old_parent.tail_pointer(),
            new_name,
            new_parent.tail_pointer(),
            new_de.ptr(),
            new_de.ty,
        ));

        // Renaming over an existing directory is rejected; over an existing
        // file, the target's blocks are unreferenced and the rename
        // proceeds.
        let target_block = if same_dir {
            &mut old_pblock
        } else {
            new_pblock.as_mut().expect("split parents")
        };
        if let Some(existing) = target_block.children().get(new_name).cloned() {
            if existing.ty == EntryType::Dir {
                return Err(Error::NotFile(new_name.to_string()));
            }
            self.unref_entry(ls, &mut md, new_parent, &existing, new_name)
                .await?;
        }

        // Only the ctime changes on the renamed entry itself.
        new_de.ctime = now;
        let target_block = if same_dir {
            &mut old_pblock
        } else {
            new_pblock.as_mut().expect("split parents")
        };
        target_block.children_mut().remove(old_name);
        target_block
            .children_mut()
            .insert(new_name.to_string(), new_de);
        if !same_dir {
            old_pblock.children_mut().remove(old_name);
        }

        // Find the common ancestor of the two parents; the two sync passes
        // meet there, sharing readied blocks through the overlay cache.
        let mut i = 1;
        let mut found = false;
        while i < old_parent.nodes.len() && i < new_parent.nodes.len() {
            if old_parent.nodes[i].ptr.id != new_parent.nodes[i].ptr.id {
                found = true;
                i -= 1;
                break;
            }
            i += 1;
        }
        if !found {
            i = old_parent.nodes.len().min(new_parent.nodes.len()) - 1;
        }
        let common_ancestor = old_parent.nodes[i].ptr;
        let old_is_common = old_parent.tail_pointer() == common_ancestor;
        let new_is_common = new_parent.tail_pointer() == common_ancestor;

        let mut old_bps = None;
        if old_is_common {
            if !new_is_common {
                // The final sync pass will need the modified old parent.
                lbc.insert(old_parent.tail_pointer(), old_pblock.clone());
            }
        } else {
            if new_is_common {
                lbc.insert(
                    new_parent.tail_pointer(),
                    new_pblock.clone().expect("split parents"),
                );
            }
            let (_, _, bps) = self
                .sync_block_and_check_embed(
                    ls,
                    &mut md,
                    Block::Dir(old_pblock.clone()),
                    &old_parent.parent_path(),
                    old_parent.tail_name(),
                    EntryType::Dir,
                    true,
                    true,
                    Some(common_ancestor),
                    &mut lbc,
                )
                .await?;
            old_bps = Some(bps);
        }

        let final_block = if same_dir {
            Block::Dir(old_pblock)
        } else {
            Block::Dir(new_pblock.expect("split parents"))
        };
        let (_, _, mut bps) = self
            .sync_block_and_check_embed(
                ls,
                &mut md,
                final_block,
                &new_parent.parent_path(),
                new_parent.tail_name(),
                EntryType::Dir,
                true,
                true,
                None,
                &mut lbc,
            )
            .await?;
        if let Some(old_bps) = old_bps {
            bps.merge(old_bps);
        }

        self.do_block_puts(&md, &bps).await?;
        self.finalize_md_write(ls, writer, &mut md, &bps).await
    }

    async fn set_ex_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        file: &Path,
        ex: bool,
    ) -> Result<(), Error> {
        let mut md = self.get_md_for_write_locked(ls, writer).await?;
        let (mut dblock, mut de) = {
            let guard = self.block_lock.read(ls).await;
            let (_guard, entry) = self.get_entry(ls, guard, file).await;
            entry?
        };

        // Symlinks silently ignore mode changes.
        if de.ty == EntryType::Sym {
            return Ok(());
        }
        if ex && de.ty == EntryType::File {
            de.ty = EntryType::Exec;
        } else if !ex && de.ty == EntryType::Exec {
            de.ty = EntryType::File;
        }

        let parent_path = file.parent_path();
        md.add_op(Op::new_set_attr(
            file.tail_name(),
            parent_path.tail_pointer(),
            Attr::Exec,
            file.tail_pointer(),
        ));

        de.ctime = self.now_unix_nanos();
        dblock
            .children_mut()
            .insert(file.tail_name().to_string(), de);
        self.sync_block_and_finalize(
            ls,
            writer,
            md,
            Block::Dir(dblock),
            &parent_path.parent_path(),
            parent_path.tail_name(),
            EntryType::Dir,
            false,
            false,
        )
        .await?;
        Ok(())
    }

    async fn set_mtime_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
        file: &Path,
        mtime: i64,
    ) -> Result<(), Error> {
        let mut md = self.get_md_for_write_locked(ls, writer).await?;
        let (mut dblock, mut de) = {
            let guard = self.block_lock.read(ls).await;
            let (_guard, entry) = self.get_entry(ls, guard, file).await;
            entry?
        };

        let parent_path = file.parent_path();
        md.add_op(Op::new_set_attr(
            file.tail_name(),
            parent_path.tail_pointer(),
            Attr::Mtime,
            file.tail_pointer(),
        ));

        de.mtime = mtime;
        // Changing the mtime is itself a metadata change.
        de.ctime = self.now_unix_nanos();
        dblock
            .children_mut()
            .insert(file.tail_name().to_string(), de);
        self.sync_block_and_finalize(
            ls,
            writer,
            md,
            Block::Dir(dblock),
            &parent_path.parent_path(),
            parent_path.tail_name(),
            EntryType::Dir,
            false,
            false,
        )
        .await?;
        Ok(())
    }
}

// Public write-side operations.

impl FolderOps {
    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn create_dir(&self, dir: Node, name: &str) -> Result<(Node, EntryInfo), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let (node, de) = self
            .create_entry_locked(&ls, &mut writer, dir, name, EntryType::Dir)
            .await?;
        Ok((node, de.entry_info()))
    }

    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn create_file(
        &self,
        dir: Node,
        name: &str,
        is_exec: bool,
    ) -> Result<(Node, EntryInfo), Error> {
        let ls = LockState::new();
        let ty = if is_exec {
            EntryType::Exec
        } else {
            EntryType::File
        };
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let (node, de) = self
            .create_entry_locked(&ls, &mut writer, dir, name, ty)
            .await?;
        Ok((node, de.entry_info()))
    }

    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn create_link(
        &self,
        dir: Node,
        from_name: &str,
        to_path: &str,
    ) -> Result<EntryInfo, Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let de = self
            .create_link_locked(&ls, &mut writer, dir, from_name, to_path)
            .await?;
        Ok(de.entry_info())
    }

    /// Removes a subdirectory, which must be empty.
    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn remove_dir(&self, dir: Node, name: &str) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let md = self.get_md_for_write_locked(&ls, &mut writer).await?;
        let dir_path = self.path_from_node_for_md_write(dir, &ls)?;

        {
            let mut guard = self.block_lock.read(&ls).await;
            let (g, pblock) = self.get_dir(&ls, guard, &dir_path).await;
            guard = g;
            let pblock = pblock?;
            let de = match pblock.children().get(name) {
                Some(de) => de.clone(),
                None => return Err(Error::NoSuchName(name.to_string())),
            };
            let child_path = dir_path.child_path(name, de.ptr());
            let (_guard, child_block) = self.get_dir(&ls, guard, &child_path).await;
            let child_block = child_block?;
            if !child_block.children().is_empty() {
                return Err(Error::DirNotEmpty(name.to_string()));
            }
        }

        self.remove_entry_locked(&ls, &mut writer, md, &dir_path, name)
            .await
    }

    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn remove_entry(&self, dir: Node, name: &str) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let md = self.get_md_for_write_locked(&ls, &mut writer).await?;
        let dir_path = self.path_from_node_for_md_write(dir, &ls)?;
        self.remove_entry_locked(&ls, &mut writer, md, &dir_path, name)
            .await
    }

    /// Moves `old_parent/old_name` to `new_parent/new_name` within one
    /// folder branch, in a single revision.
    #[instrument(skip(self, old_parent, new_parent), err(level = "debug"))]
    pub async fn rename(
        &self,
        old_parent: Node,
        old_name: &str,
        new_parent: Node,
        new_name: &str,
    ) -> Result<(), Error> {
        self.check_name(new_name)?;
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;

        let old_parent_path = self.path_from_node_for_md_write(old_parent, &ls)?;
        let new_parent_path = self.path_from_node_for_md_write(new_parent, &ls)?;
        if old_parent_path.folder_branch != new_parent_path.folder_branch {
            return Err(Error::RenameAcrossFolders);
        }

        self.rename_locked(
            &ls,
            &mut writer,
            &old_parent_path,
            old_name,
            &new_parent_path,
            new_name,
        )
        .await
    }

    #[instrument(skip(self, file, data), fields(len = data.len(), off), err(level = "debug"))]
    pub async fn write(&self, file: Node, data: &[u8], off: u64) -> Result<(), Error> {
        let ls = LockState::new();
        // The head is read, not written: unref accounting rides on the side
        // until the next sync publishes it.
        let md = self
            .get_md_locked(&ls, MdReqType::ReadNeedIdentify, None)
            .await?;

        let guard = self.block_lock.write(&ls).await;
        let file_path = self.path_from_node_for_block_write(file, &guard)?;

        let (mut guard, res) = self
            .write_data_locked(&ls, guard, &md, &file_path, data, off, true)
            .await;
        let state = guard.state_mut().expect("write guard");
        let deferred = std::mem::replace(&mut state.do_defer_write, false);
        let new_ptrs = res?;

        if deferred {
            // A sync is in flight and this write touched its blocks; replay
            // it against the new path when the sync completes.
            debug!(
                file = %file_path,
                off,
                len = data.len(),
                "deferring a write during sync"
            );
            state.deferred_dirty_deletes.extend(new_ptrs);
            state.deferred_writes.push(DeferredWrite::Write {
                data: Bytes::copy_from_slice(data),
                off,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, file), err(level = "debug"))]
    pub async fn truncate(&self, file: Node, size: u64) -> Result<(), Error> {
        let ls = LockState::new();
        let md = self
            .get_md_locked(&ls, MdReqType::ReadNeedIdentify, None)
            .await?;

        let guard = self.block_lock.write(&ls).await;
        let file_path = self.path_from_node_for_block_write(file, &guard)?;

        let (mut guard, res) = self
            .truncate_locked(&ls, guard, &md, &file_path, size, true)
            .await;
        let state = guard.state_mut().expect("write guard");
        let deferred = std::mem::replace(&mut state.do_defer_write, false);
        let new_ptrs = res?;

        if deferred {
            debug!(file = %file_path, size, "deferring a truncate during sync");
            state.deferred_dirty_deletes.extend(new_ptrs);
            state
                .deferred_writes
                .push(DeferredWrite::Truncate { size });
        }
        Ok(())
    }

    #[instrument(skip(self, file), err(level = "debug"))]
    pub async fn set_ex(&self, file: Node, ex: bool) -> Result<(), Error> {
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let file_path = self.path_from_node_for_md_write(file, &ls)?;
        self.set_ex_locked(&ls, &mut writer, &file_path, ex).await
    }

    /// Sets a file's mtime. A `None` mtime is a no-op (some kernels send
    /// attribute updates that only carry atime).
    #[instrument(skip(self, file), err(level = "debug"))]
    pub async fn set_mtime(&self, file: Node, mtime: Option<i64>) -> Result<(), Error> {
        let mtime = match mtime {
            Some(mtime) => mtime,
            None => return Ok(()),
        };
        let ls = LockState::new();
        let mut writer = self.md_writer_lock.lock(&ls).await;
        let file_path = self.path_from_node_for_md_write(file, &ls)?;
        self.set_mtime_locked(&ls, &mut writer, &file_path, mtime)
            .await
    }
}

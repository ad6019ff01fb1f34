//! Metadata acquisition and the read side of the block layer.

use std::collections::HashMap;

use tracing::{debug, instrument};

use super::{try_g, BGuard, FolderOps, MdReqType, WriterState};
use crate::caches::{CacheKind, Node};
use crate::data::md::REVISION_INITIAL;
use crate::data::{
    Block, BlockPointer, BranchName, DirBlock, DirEntry, EntryInfo, EntryType, FileBlock, Path,
    RootMetadata,
};
use crate::data::ops::Op;
use crate::locking::LockState;
use crate::Error;

/// Result of descending an indirect file to the block covering an offset.
pub(crate) struct FileBlockAt {
    pub ptr: BlockPointer,
    /// Index of the covering pointer within the top block, for indirect
    /// files.
    pub parent_index: Option<usize>,
    pub block: FileBlock,
    /// Whether any level had further pointers past the one taken.
    pub more: bool,
    /// File offset at which `block` starts.
    pub start_off: u64,
}

impl FolderOps {
    /// Returns the current metadata head. Without a cached head only a
    /// `Write`-mode request may fetch; reads fail with
    /// [Error::MdWriteNeededInRequest] so the caller can upgrade to the
    /// writer lock and retry.
    ///
    /// `writer` must be the held writer state for `Write` requests.
    pub(crate) async fn get_md_locked(
        &self,
        ls: &LockState,
        rtype: MdReqType,
        writer: Option<&mut WriterState>,
    ) -> Result<RootMetadata, Error> {
        let cached = {
            let head = self.head_lock.read(ls).await;
            head.clone()
        };
        if let Some(md) = cached {
            if rtype != MdReqType::ReadNoIdentify {
                self.identify_once().await?;
            }
            return Ok(md);
        }

        let writer = match (rtype, writer) {
            (MdReqType::Write, Some(writer)) => writer,
            _ => return Err(Error::MdWriteNeededInRequest),
        };

        // Prefer this device's unmerged head, if it left one behind.
        let store = &self.config.meta_store;
        let fetched = match store.get_unmerged_for_tlf(self.id(), None).await? {
            Some(md) => Some(md),
            None => store.get_for_tlf(self.id()).await?,
        };

        let md = match fetched {
            Some(md) if md.is_initialized() => {
                let mut head = self.head_lock.write(ls).await;
                self.set_head_locked(&mut head, writer, md.clone())?;
                md
            }
            _ => self.init_md_locked(ls, writer).await?,
        };

        self.identify_once().await?;
        Ok(md)
    }

    /// Installs a new head. No-op when the head is already this revision.
    /// The caller holds `headLock` for writing and the writer lock.
    pub(crate) fn set_head_locked(
        &self,
        head_slot: &mut Option<RootMetadata>,
        writer: &mut WriterState,
        md: RootMetadata,
    ) -> Result<(), Error> {
        let crypto = &*self.config.crypto;
        if let Some(curr) = head_slot.as_ref() {
            if curr.md_id(crypto)? == md.md_id(crypto)? {
                return Ok(());
            }
        }
        let first_head = head_slot.is_none();
        debug!(revision = md.revision, "setting head revision");

        // A first head that is already unmerged means this device forked in
        // a previous session; pick up where it left off and nudge the
        // resolver.
        if first_head && !md.is_merged() {
            writer.staged = true;
            writer.bid = md.branch_id;
            self.config
                .resolver
                .resolve(md.revision, crate::data::md::REVISION_UNINITIALIZED);
        }

        *head_slot = Some(md);
        if first_head && self.branch() == BranchName::Master {
            self.start_update_pump();
        }
        Ok(())
    }

    /// Creates revision 1 of a brand new folder: an empty root directory
    /// block, keyed, readied, stored, and published.
    async fn init_md_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
    ) -> Result<RootMetadata, Error> {
        let uid = self.config.current_user;
        let mut md = RootMetadata::new(self.id(), self.config.writers.clone());
        if !md.is_writer(uid) {
            return Err(Error::WriteAccess(uid, self.id()));
        }

        self.config.key_manager.rekey(&mut md).await?;
        md.revision = REVISION_INITIAL;
        md.data.last_writer = uid;

        let mut dblock = DirBlock::new_direct();
        dblock.seed = self.config.crypto.make_block_seed();
        let (info, plain_size, ready) = self.ready_block(&md, &Block::Dir(dblock.clone()))?;

        let now = self.now_unix_nanos();
        md.data.dir = DirEntry {
            info,
            ty: EntryType::Dir,
            size: plain_size as u64,
            sym_path: None,
            mtime: now,
            ctime: now,
        };
        md.add_op(Op::new_create("", BlockPointer::NULL, EntryType::Dir));
        md.add_ref_block(info);

        self.config.block_store.put(self.id(), info.ptr, ready).await?;
        self.config
            .block_cache
            .put(info.ptr, self.id(), Block::Dir(dblock), CacheKind::Transient);
        self.config.meta_store.put(&md).await?;

        let mut head = self.head_lock.write(ls).await;
        if head.is_some() {
            return Err(Error::InconsistentState(
                "head appeared during folder initialization".to_string(),
            ));
        }
        self.set_head_locked(&mut head, writer, md.clone())?;
        Ok(md)
    }

    pub(crate) async fn get_md_for_read_no_identify(
        &self,
        ls: &LockState,
    ) -> Result<RootMetadata, Error> {
        self.get_md_for_read_helper(ls, MdReqType::ReadNoIdentify).await
    }

    pub(crate) async fn get_md_for_read_need_identify(
        &self,
        ls: &LockState,
    ) -> Result<RootMetadata, Error> {
        self.get_md_for_read_helper(ls, MdReqType::ReadNeedIdentify).await
    }

    async fn get_md_for_read_helper(
        &self,
        ls: &LockState,
        rtype: MdReqType,
    ) -> Result<RootMetadata, Error> {
        let md = self.get_md_locked(ls, rtype, None).await?;
        let uid = self.config.current_user;
        if !md.is_reader(uid) {
            return Err(Error::ReadAccess(uid, self.id()));
        }
        Ok(md)
    }

    /// Returns a writable successor of the head. The caller owns the writer
    /// lock and must publish the successor through `finalize_md_write` or
    /// its changes are lost.
    pub(crate) async fn get_md_for_write_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
    ) -> Result<RootMetadata, Error> {
        let md = self.get_md_locked(ls, MdReqType::Write, Some(writer)).await?;
        let uid = self.config.current_user;
        if !md.is_writer(uid) {
            return Err(Error::WriteAccess(uid, self.id()));
        }
        let mut successor = md.make_successor(&*self.config.crypto)?;
        successor.data.last_writer = uid;
        Ok(successor)
    }

    /// Like [FolderOps::get_md_for_write_locked] but only requires reader
    /// access, for flows that may only flip the rekey bit.
    pub(crate) async fn get_md_for_rekey_write_locked(
        &self,
        ls: &LockState,
        writer: &mut WriterState,
    ) -> Result<RootMetadata, Error> {
        let md = self.get_md_locked(ls, MdReqType::Write, Some(writer)).await?;
        let uid = self.config.current_user;
        if !md.is_reader(uid) {
            return Err(Error::RekeyPermission(uid, self.id()));
        }
        let mut successor = md.make_successor(&*self.config.crypto)?;
        if !md.is_writer(uid) {
            successor.flags.writer_metadata_copied = true;
        }
        successor.data.last_writer = uid;
        Ok(successor)
    }

    pub(crate) async fn current_md_revision(&self, ls: &LockState) -> u64 {
        let head = self.head_lock.read(ls).await;
        head.as_ref()
            .map(|md| md.revision)
            .unwrap_or(crate::data::md::REVISION_UNINITIALIZED)
    }

    async fn fetch_and_decode(
        &self,
        ptr: BlockPointer,
    ) -> Result<Block, Error> {
        let (sealed, half) = self.config.block_store.get(self.id(), ptr).await?;
        let plain = self
            .config
            .crypto
            .open(&sealed, ptr.key_gen, &half)
            .map_err(|_| Error::BadSeal(ptr))?;
        Ok(bincode::deserialize(&plain)?)
    }

    /// Fetches the block behind `ptr`, from the cache or the store. A read
    /// guard is released for the duration of a store fetch; a write guard is
    /// held throughout, keeping the flow exclusive.
    pub(crate) async fn get_block<'a>(
        &'a self,
        ls: &'a LockState,
        guard: BGuard<'a>,
        ptr: BlockPointer,
        branch: BranchName,
        do_cache: bool,
    ) -> (BGuard<'a>, Result<Block, Error>) {
        if !ptr.is_valid() {
            return (guard, Err(Error::InvalidBlockPointer(ptr)));
        }
        if let Some(block) = self.config.block_cache.get(ptr, branch) {
            return (guard, Ok(block));
        }
        let (guard, fetched) = self
            .block_lock
            .unlocked_if_read(ls, guard, self.fetch_and_decode(ptr))
            .await;
        let block = try_g!(guard, fetched);
        if do_cache {
            self.config
                .block_cache
                .put(ptr, self.id(), block.clone(), CacheKind::Transient);
        }
        (guard, Ok(block))
    }

    /// Fetches a file block belonging to `file`. The returned block is the
    /// caller's private copy; publishing a mutation goes through the dirty
    /// cache.
    pub(crate) async fn get_file_block<'a>(
        &'a self,
        ls: &'a LockState,
        guard: BGuard<'a>,
        ptr: BlockPointer,
        file: &Path,
    ) -> (BGuard<'a>, Result<FileBlock, Error>) {
        if !file.is_valid() {
            return (guard, Err(Error::InvalidPath));
        }
        let (guard, block) = self
            .get_block(ls, guard, ptr, file.folder_branch.branch, true)
            .await;
        let block = try_g!(guard, block);
        (guard, block.into_file(ptr))
    }

    /// Fetches the directory block at the tail of `dir`.
    pub(crate) async fn get_dir<'a>(
        &'a self,
        ls: &'a LockState,
        guard: BGuard<'a>,
        dir: &Path,
    ) -> (BGuard<'a>, Result<DirBlock, Error>) {
        if !dir.is_valid() {
            return (guard, Err(Error::InvalidPath));
        }
        let ptr = dir.tail_pointer();
        let (guard, block) = self
            .get_block(ls, guard, ptr, dir.folder_branch.branch, true)
            .await;
        let block = try_g!(guard, block);
        (guard, block.into_dir(ptr))
    }

    /// Fetch for diagnostics (state checking): no caching, any block type.
    pub(crate) async fn get_block_for_reading(
        &self,
        ls: &LockState,
        ptr: BlockPointer,
        branch: BranchName,
    ) -> Result<Block, Error> {
        let guard = self.block_lock.read(ls).await;
        let (_guard, block) = self.get_block(ls, guard, ptr, branch, false).await;
        block
    }

    /// Overlays pending directory-entry updates onto a fetched directory
    /// block, so readers see the user-visible effect of their own unflushed
    /// writes. Overlaid entries are attributed to the local device.
    pub(crate) fn update_dir_block(&self, dir: &Path, block: DirBlock) -> DirBlock {
        let tracking = self.write_tracking.lock();
        let de_map = match tracking.de_cache.get(&dir.tail_pointer().stripped()) {
            Some(de_map) => de_map,
            None => return block,
        };
        let mut updated = block;
        let uid = self.config.current_user;
        for entry in updated.children_mut().values_mut() {
            if let Some(de) = de_map.get(&entry.ptr().stripped()) {
                let mut de = de.clone();
                de.set_writer(uid);
                *entry = de;
            }
        }
        updated
    }

    /// The parent directory block (with pending updates overlaid) and the
    /// entry for `file`, which must have a valid parent.
    pub(crate) async fn get_entry<'a>(
        &'a self,
        ls: &'a LockState,
        guard: BGuard<'a>,
        file: &Path,
    ) -> (BGuard<'a>, Result<(DirBlock, DirEntry), Error>) {
        if !file.has_valid_parent() {
            return (guard, Err(Error::InvalidPath));
        }
        let parent = file.parent_path();
        let (guard, dblock) = self.get_dir(ls, guard, &parent).await;
        let dblock = try_g!(guard, dblock);
        let dblock = self.update_dir_block(&parent, dblock);

        let name = file.tail_name();
        match dblock.children().get(name) {
            Some(de) => {
                let de = de.clone();
                (guard, Ok((dblock, de)))
            }
            None => (guard, Err(Error::NoSuchName(name.to_string()))),
        }
    }

    /// Descends the indirect tree of `file` to the block covering `off`.
    /// Within an indirect block, the child taken is the last one whose start
    /// offset is at or before the target.
    pub(crate) async fn get_file_block_at_offset<'a>(
        &'a self,
        ls: &'a LockState,
        mut guard: BGuard<'a>,
        file: &Path,
        top: &FileBlock,
        off: u64,
    ) -> (BGuard<'a>, Result<FileBlockAt, Error>) {
        let mut at = FileBlockAt {
            ptr: file.tail_pointer(),
            parent_index: None,
            block: top.clone(),
            more: false,
            start_off: 0,
        };
        while at.block.is_indirect() {
            let iptrs = at.block.iptrs();
            if iptrs.is_empty() {
                return (guard, Err(Error::InvalidBlockPointer(at.ptr)));
            }
            let mut next_index = iptrs.len() - 1;
            for (i, iptr) in iptrs.iter().enumerate() {
                if iptr.off == off {
                    next_index = i;
                    break;
                }
                if iptr.off > off {
                    // i is never 0: the first pointer starts at offset 0.
                    next_index = i - 1;
                    break;
                }
            }
            let next = &iptrs[next_index];
            at.parent_index = Some(next_index);
            at.start_off = next.off;
            at.more = at.more || next_index != iptrs.len() - 1;
            at.ptr = next.info.ptr;

            let (g, block) = self.get_file_block(ls, guard, at.ptr, file).await;
            guard = g;
            at.block = try_g!(guard, block);
        }
        (guard, Ok(at))
    }

    /// Copies file contents at `off` into `dest`, returning the number of
    /// bytes read (clamped at end of file).
    pub(crate) async fn read_locked<'a>(
        &'a self,
        ls: &'a LockState,
        mut guard: BGuard<'a>,
        file: &Path,
        dest: &mut [u8],
        off: u64,
    ) -> (BGuard<'a>, Result<u64, Error>) {
        let (g, top) = self
            .get_file_block(ls, guard, file.tail_pointer(), file)
            .await;
        guard = g;
        let top = try_g!(guard, top);

        let n = dest.len() as u64;
        let mut n_read = 0u64;
        while n_read < n {
            let next_byte = n_read + off;
            let (g, at) = self
                .get_file_block_at_offset(ls, guard, file, &top, next_byte)
                .await;
            guard = g;
            let at = try_g!(guard, at);

            let block_len = at.block.contents().len() as u64;
            let last_byte_in_block = at.start_off + block_len;
            if next_byte >= last_byte_in_block {
                return (guard, Ok(n_read));
            }
            let to_read = (n - n_read).min(last_byte_in_block - next_byte);
            let first = (next_byte - at.start_off) as usize;
            dest[n_read as usize..(n_read + to_read) as usize]
                .copy_from_slice(&at.block.contents()[first..first + to_read as usize]);
            n_read += to_read;
        }
        (guard, Ok(n_read))
    }
}

// Public read-side operations.

impl FolderOps {
    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn lookup(&self, dir: Node, name: &str) -> Result<(Option<Node>, EntryInfo), Error> {
        let ls = LockState::new();
        self.get_md_for_read_need_identify(&ls).await?;
        let dir_path = self.path_from_node_for_read(dir)?;
        let child_path = dir_path.child_path_no_ptr(name);

        let guard = self.block_lock.read(&ls).await;
        let (_guard, res) = self.get_entry(&ls, guard, &child_path).await;
        let (_, de) = res?;

        let node = if de.ty == EntryType::Sym {
            None
        } else {
            Some(self.node_cache.get_or_create(de.ptr(), name, Some(dir)))
        };
        Ok((node, de.entry_info()))
    }

    #[instrument(skip(self, dir), err(level = "debug"))]
    pub async fn get_dir_children(&self, dir: Node) -> Result<HashMap<String, EntryInfo>, Error> {
        let ls = LockState::new();
        self.get_md_for_read_need_identify(&ls).await?;
        let dir_path = self.path_from_node_for_read(dir)?;

        let guard = self.block_lock.read(&ls).await;
        let (_guard, res) = self.get_dir(&ls, guard, &dir_path).await;
        let dblock = self.update_dir_block(&dir_path, res?);

        Ok(dblock
            .children()
            .iter()
            .map(|(name, de)| (name.clone(), de.entry_info()))
            .collect())
    }

    #[instrument(skip(self, node), err(level = "debug"))]
    pub async fn stat(&self, node: Node) -> Result<EntryInfo, Error> {
        Ok(self.stat_entry(node).await?.entry_info())
    }

    /// Like [FolderOps::stat] but returns the full directory entry; used by
    /// tests and diagnostics.
    pub(crate) async fn stat_entry(&self, node: Node) -> Result<DirEntry, Error> {
        let ls = LockState::new();
        let node_path = self.path_from_node_for_read(node)?;
        let md = if node_path.has_valid_parent() {
            self.get_md_for_read_need_identify(&ls).await?
        } else {
            // The folder root needs no identify.
            self.get_md_for_read_no_identify(&ls).await?
        };

        if node_path.has_valid_parent() {
            let guard = self.block_lock.read(&ls).await;
            let (_guard, res) = self.get_entry(&ls, guard, &node_path).await;
            let (_, de) = res?;
            Ok(de)
        } else {
            Ok(md.data.dir)
        }
    }

    /// Reads up to `dest.len()` bytes at `off`, returning the count actually
    /// copied.
    #[instrument(skip(self, file, dest), fields(len = dest.len(), off), err(level = "debug"))]
    pub async fn read(&self, file: Node, dest: &mut [u8], off: u64) -> Result<u64, Error> {
        let ls = LockState::new();
        self.get_md_for_read_need_identify(&ls).await?;
        let file_path = self.path_from_node_for_read(file)?;

        let guard = self.block_lock.read(&ls).await;
        let (_guard, res) = self.read_locked(&ls, guard, &file_path, dest, off).await;
        res
    }
}

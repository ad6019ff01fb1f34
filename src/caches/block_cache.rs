//! The two-tier block cache.
//!
//! Clean blocks live on one side: transient entries (fetched from the store,
//! evictable) and permanent entries (freshly minted during an in-flight sync,
//! not yet re-derivable from the store, pinned). Dirty blocks live in a
//! separate namespace keyed additionally by branch, so fetching a pointer
//! always yields the clean version unless the caller asks for dirty state.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::data::{Block, BlockPointer, BranchName, FileBlock, FileBody};
use crate::ids::{BlockId, TlfId};

/// How a clean entry is held.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CacheKind {
    /// Fetched from the store; evictable.
    Transient,
    /// Minted locally during a flow; pinned until explicitly deleted.
    Permanent,
}

struct CleanEntry {
    block: Block,
    kind: CacheKind,
}

#[derive(Default)]
struct Inner {
    clean: HashMap<BlockPointer, CleanEntry>,
    /// FIFO of transient keys for eviction; may contain stale entries.
    transient_order: VecDeque<BlockPointer>,
    dirty: HashMap<(BlockPointer, BranchName), Block>,
    /// Content hash of direct file blocks to their first clean pointer,
    /// backing the dedup hook.
    known: HashMap<(TlfId, [u8; 32]), BlockPointer>,
}

pub struct BlockCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        BlockCache {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Dirty entry for the branch first, then the clean side.
    pub fn get(&self, ptr: BlockPointer, branch: BranchName) -> Option<Block> {
        let inner = self.inner.lock();
        if let Some(block) = inner.dirty.get(&(ptr, branch)) {
            return Some(block.clone());
        }
        inner.clean.get(&ptr).map(|entry| entry.block.clone())
    }

    pub fn put(&self, ptr: BlockPointer, tlf: TlfId, block: Block, kind: CacheKind) {
        let mut inner = self.inner.lock();
        if let Block::File(fblock) = &block {
            if let Some(digest) = direct_contents_hash(fblock) {
                if !ptr.id.is_temporary() {
                    inner.known.entry((tlf, digest)).or_insert(ptr);
                }
            }
        }
        if kind == CacheKind::Transient {
            while inner.clean.len() >= self.capacity {
                match inner.transient_order.pop_front() {
                    Some(old) => {
                        if let Some(entry) = inner.clean.get(&old) {
                            if entry.kind == CacheKind::Transient {
                                inner.clean.remove(&old);
                            }
                        }
                    }
                    None => break,
                }
            }
            inner.transient_order.push_back(ptr);
        }
        inner.clean.insert(ptr, CleanEntry { block, kind });
    }

    pub fn put_dirty(&self, ptr: BlockPointer, branch: BranchName, block: Block) {
        let mut inner = self.inner.lock();
        inner.dirty.insert((ptr, branch), block);
    }

    pub fn is_dirty(&self, ptr: BlockPointer, branch: BranchName) -> bool {
        self.inner.lock().dirty.contains_key(&(ptr, branch))
    }

    pub fn delete_dirty(&self, ptr: BlockPointer, branch: BranchName) {
        self.inner.lock().dirty.remove(&(ptr, branch));
    }

    /// Drops a pinned clean entry once its block has safely landed at the
    /// store.
    pub fn delete_permanent(&self, id: BlockId) {
        let mut inner = self.inner.lock();
        let keys: Vec<BlockPointer> = inner
            .clean
            .iter()
            .filter(|(ptr, entry)| ptr.id == id && entry.kind == CacheKind::Permanent)
            .map(|(ptr, _)| *ptr)
            .collect();
        for key in keys {
            inner.clean.remove(&key);
        }
    }

    /// The dedup hook: if a just-written direct file block is byte-identical
    /// to one already known in this folder, returns the existing pointer so
    /// the caller can reference it under a fresh nonce instead of storing the
    /// contents twice.
    pub fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Option<BlockPointer> {
        let digest = direct_contents_hash(block)?;
        self.inner.lock().known.get(&(tlf, digest)).copied()
    }
}

fn direct_contents_hash(block: &FileBlock) -> Option<[u8; 32]> {
    match &block.body {
        FileBody::Direct(data) => Some(*blake3::hash(data).as_bytes()),
        FileBody::Indirect(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{test_pointer, test_tlf};
    use bytes::Bytes;

    fn file_block(data: &[u8]) -> Block {
        let mut fblock = FileBlock::new_direct();
        fblock.set_contents(Bytes::copy_from_slice(data));
        Block::File(fblock)
    }

    fn branch() -> BranchName {
        BranchName::Master
    }

    #[test]
    fn dirty_shadows_clean() {
        let cache = BlockCache::new(100);
        let ptr = test_pointer(1);
        cache.put(ptr, test_tlf(), file_block(b"clean"), CacheKind::Transient);
        cache.put_dirty(ptr, branch(), file_block(b"dirty"));

        match cache.get(ptr, branch()).unwrap() {
            Block::File(fblock) => assert_eq!(&fblock.contents()[..], b"dirty"),
            _ => panic!("wrong block type"),
        }

        cache.delete_dirty(ptr, branch());
        match cache.get(ptr, branch()).unwrap() {
            Block::File(fblock) => assert_eq!(&fblock.contents()[..], b"clean"),
            _ => panic!("wrong block type"),
        }
    }

    #[test]
    fn transient_entries_evict_but_permanent_stay() {
        let cache = BlockCache::new(2);
        cache.put(
            test_pointer(1),
            test_tlf(),
            file_block(b"p"),
            CacheKind::Permanent,
        );
        for i in 2..6 {
            cache.put(
                test_pointer(i),
                test_tlf(),
                file_block(&[i]),
                CacheKind::Transient,
            );
        }
        assert!(cache.get(test_pointer(1), branch()).is_some());
    }

    #[test]
    fn known_ptr_dedup() {
        let cache = BlockCache::new(100);
        let ptr = test_pointer(1);
        cache.put(ptr, test_tlf(), file_block(b"same"), CacheKind::Transient);

        let mut candidate = FileBlock::new_direct();
        candidate.set_contents(Bytes::from_static(b"same"));
        assert_eq!(cache.check_for_known_ptr(test_tlf(), &candidate), Some(ptr));

        candidate.set_contents(Bytes::from_static(b"different"));
        assert_eq!(cache.check_for_known_ptr(test_tlf(), &candidate), None);
    }

    #[test]
    fn temporary_ids_never_enter_the_dedup_index() {
        let cache = BlockCache::new(100);
        let mut ptr = test_pointer(1);
        ptr.id = crate::ids::BlockId::temporary([1; 32]);
        cache.put(ptr, test_tlf(), file_block(b"x"), CacheKind::Transient);

        let mut candidate = FileBlock::new_direct();
        candidate.set_contents(Bytes::from_static(b"x"));
        assert_eq!(cache.check_for_known_ptr(test_tlf(), &candidate), None);
    }
}

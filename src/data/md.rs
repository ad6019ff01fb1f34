//! Root metadata: the signed per-revision snapshot of a folder branch.

use serde::{Deserialize, Serialize};

use super::ops::Op;
use super::{BlockInfo, DirEntry};
use crate::crypto::Crypto;
use crate::ids::{BranchId, KeyGen, MdId, TlfId, UserId};
use crate::Error;

/// The first valid metadata revision number; revision 0 means uninitialized.
pub const REVISION_INITIAL: u64 = 1;
pub const REVISION_UNINITIALIZED: u64 = 0;

/// Flags carried by a revision.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct MetadataFlags {
    /// Set when a device needs the folder rekeyed.
    pub rekey: bool,
    /// Set on revisions that only copy writer metadata forward (e.g. a
    /// reader flipping the rekey bit); such revisions carry no new ops.
    pub writer_metadata_copied: bool,
}

/// The set of blocks changed by one revision.
///
/// When the op list is too large to embed, it is serialized into a block of
/// its own and `info` points there, with `ops` left empty on the wire.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BlockChanges {
    pub info: BlockInfo,
    pub ops: Vec<Op>,
    #[serde(skip)]
    size_estimate: u64,
}

impl BlockChanges {
    pub fn add_op(&mut self, op: Op) {
        self.size_estimate += op_size_estimate(&op);
        self.ops.push(op);
    }

    pub fn note_pointer(&mut self) {
        // Rough per-pointer cost: an id, a nonce, and three small ints.
        self.size_estimate += 56;
    }

    pub fn size_estimate(&self) -> u64 {
        self.size_estimate
    }
}

fn op_size_estimate(op: &Op) -> u64 {
    64 + 56 * (op.refs().len() + op.unrefs().len() + op.all_updates().len()) as u64
}

/// The private (sealed) portion of a revision.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct PrivateMetadata {
    /// Directory entry for the folder's root block.
    pub dir: DirEntry,
    pub last_writer: UserId,
    /// The ops and pointer deltas of this revision.
    pub changes: BlockChanges,
    /// When `changes` was moved out to its own block, the plaintext op list
    /// parks here so local readers don't need a fetch. Never serialized.
    #[serde(skip)]
    pub cached_changes: BlockChanges,
}

/// One revision of a folder branch's metadata.
///
/// Successors never mutate prior revisions: every writer flow copies the
/// head with [RootMetadata::make_successor], fills it in, and publishes it.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RootMetadata {
    pub tlf: TlfId,
    /// Null for merged revisions; the branch id while unmerged.
    pub branch_id: BranchId,
    pub revision: u64,
    pub prev_root: MdId,
    pub writers: Vec<UserId>,
    pub key_gen: KeyGen,
    pub flags: MetadataFlags,
    /// Total bytes newly referenced (unreferenced) by this revision.
    pub ref_bytes: u64,
    pub unref_bytes: u64,
    /// Running total of live bytes after this revision.
    pub disk_usage: u64,
    pub data: PrivateMetadata,
}

impl RootMetadata {
    /// A fresh, uninitialized metadata object for a folder. The root dir
    /// entry is filled in by the engine's first write.
    pub fn new(tlf: TlfId, writers: Vec<UserId>) -> RootMetadata {
        RootMetadata {
            tlf,
            branch_id: BranchId::NULL,
            revision: REVISION_UNINITIALIZED,
            prev_root: MdId::NULL,
            writers,
            key_gen: KeyGen(0),
            flags: MetadataFlags::default(),
            ref_bytes: 0,
            unref_bytes: 0,
            disk_usage: 0,
            data: PrivateMetadata {
                dir: DirEntry::default(),
                last_writer: UserId::NULL,
                changes: BlockChanges::default(),
                cached_changes: BlockChanges::default(),
            },
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.revision >= REVISION_INITIAL
    }

    pub fn is_merged(&self) -> bool {
        self.branch_id.is_null()
    }

    pub fn is_writer(&self, user: UserId) -> bool {
        self.writers.contains(&user)
    }

    pub fn is_reader(&self, user: UserId) -> bool {
        self.tlf.is_public() || self.is_writer(user)
    }

    /// The hash of this revision's canonical encoding.
    pub fn md_id(&self, crypto: &dyn Crypto) -> Result<MdId, Error> {
        let buf = bincode::serialize(self)?;
        Ok(MdId(crypto.hash(&buf)))
    }

    /// Copies the head into a successor the caller may mutate: bumped
    /// revision, linked previous root, cleared ops and byte counters.
    pub fn make_successor(&self, crypto: &dyn Crypto) -> Result<RootMetadata, Error> {
        let mut md = self.clone();
        md.prev_root = self.md_id(crypto)?;
        md.revision = self.revision + 1;
        md.flags.writer_metadata_copied = false;
        md.clear_block_changes();
        Ok(md)
    }

    pub fn clear_block_changes(&mut self) {
        self.ref_bytes = 0;
        self.unref_bytes = 0;
        self.data.changes = BlockChanges::default();
        self.data.cached_changes = BlockChanges::default();
    }

    pub fn add_op(&mut self, op: Op) {
        self.data.changes.add_op(op);
    }

    pub fn latest_op_mut(&mut self) -> Option<&mut Op> {
        self.data.changes.ops.last_mut()
    }

    /// Accounts a newly referenced block and records it on the latest op.
    pub fn add_ref_block(&mut self, info: BlockInfo) {
        self.ref_bytes += u64::from(info.encoded_size);
        self.disk_usage += u64::from(info.encoded_size);
        self.data.changes.note_pointer();
        if let Some(op) = self.latest_op_mut() {
            op.add_ref_block(info.ptr);
        }
    }

    /// Accounts a block dropped by this revision. Blocks that were never
    /// readied (zero encoded size) cost nothing and are not recorded.
    pub fn add_unref_block(&mut self, info: BlockInfo) {
        if info.encoded_size > 0 {
            self.unref_bytes += u64::from(info.encoded_size);
            self.disk_usage -= u64::from(info.encoded_size);
            self.data.changes.note_pointer();
            if let Some(op) = self.latest_op_mut() {
                op.add_unref_block(info.ptr);
            }
        }
    }

    /// Accounts an in-place block rewrite: the old block is unreferenced and
    /// the new one referenced, and the rewrite lands on the latest op.
    pub fn add_update(&mut self, old: BlockInfo, new: BlockInfo) {
        if old.encoded_size > 0 {
            self.unref_bytes += u64::from(old.encoded_size);
            self.disk_usage -= u64::from(old.encoded_size);
        }
        self.ref_bytes += u64::from(new.encoded_size);
        self.disk_usage += u64::from(new.encoded_size);
        self.data.changes.note_pointer();
        if let Some(op) = self.latest_op_mut() {
            op.add_update(old.ptr, new.ptr);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalCrypto;
    use crate::data::EntryType;
    use crate::fixtures::{test_info, test_pointer, test_tlf};

    fn fresh_md() -> RootMetadata {
        let mut md = RootMetadata::new(test_tlf(), vec![UserId::from_name("alice")]);
        md.revision = REVISION_INITIAL;
        md
    }

    #[test]
    fn successor_links_and_clears() {
        let crypto = LocalCrypto::default();
        let mut md = fresh_md();
        md.add_op(Op::new_create("f", test_pointer(1), EntryType::File));
        md.add_ref_block(test_info(2, 100));
        assert_eq!(md.ref_bytes, 100);
        assert_eq!(md.disk_usage, 100);

        let succ = md.make_successor(&crypto).unwrap();
        assert_eq!(succ.revision, md.revision + 1);
        assert_eq!(succ.prev_root, md.md_id(&crypto).unwrap());
        assert_eq!(succ.ref_bytes, 0);
        assert_eq!(succ.unref_bytes, 0);
        assert_eq!(succ.disk_usage, 100);
        assert!(succ.data.changes.ops.is_empty());
    }

    #[test]
    fn byte_accounting_matches_ops() {
        let mut md = fresh_md();
        md.add_op(Op::new_sync(test_pointer(1)));
        md.add_ref_block(test_info(2, 40));
        md.add_update(test_info(3, 25), test_info(4, 30));
        md.add_unref_block(test_info(5, 10));

        assert_eq!(md.ref_bytes, 70);
        assert_eq!(md.unref_bytes, 35);
        assert_eq!(md.disk_usage, 35);

        let op = &md.data.changes.ops[0];
        assert_eq!(op.refs().len(), 1);
        assert_eq!(op.unrefs().len(), 1);
    }

    #[test]
    fn unreadied_unrefs_are_free() {
        let mut md = fresh_md();
        md.add_op(Op::new_sync(test_pointer(1)));
        md.add_unref_block(test_info(9, 0));
        assert_eq!(md.unref_bytes, 0);
        assert!(md.data.changes.ops[0].unrefs().is_empty());
    }

    #[test]
    fn cached_changes_do_not_affect_md_id() {
        let crypto = LocalCrypto::default();
        let mut md = fresh_md();
        let id_before = md.md_id(&crypto).unwrap();
        md.data.cached_changes.add_op(Op::new_gc(1));
        assert_eq!(md.md_id(&crypto).unwrap(), id_before);
    }
}

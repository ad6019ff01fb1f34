//! Semantic operations recorded in metadata revisions.
//!
//! Every revision carries the list of ops that produced it, with the block
//! pointers each op referenced, unreferenced or rewrote. Ops are plain data;
//! in particular they hold pointer values only, never handles into the
//! engine, so a revision can outlive any in-memory state.

use serde::{Deserialize, Serialize};

use super::{BlockPointer, EntryType};

/// A pointer rewrite performed by an op: the block at `old` was replaced by
/// the block at `new`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub old: BlockPointer,
    pub new: BlockPointer,
}

impl BlockUpdate {
    /// An update whose rewrite hasn't been observed yet; `new` is patched in
    /// when the tree above the op is readied.
    pub fn pending(old: BlockPointer) -> Self {
        BlockUpdate { old, new: old }
    }

    fn inverted(&self) -> Self {
        BlockUpdate {
            old: self.new,
            new: self.old,
        }
    }
}

/// A contiguous range written to a file. A zero-length range encodes a
/// truncate at `off`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

impl WriteRange {
    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }
}

/// Which attribute a `SetAttr` op changed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Attr {
    Exec,
    Mtime,
}

/// Pointer bookkeeping shared by all op kinds.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct OpCommon {
    pub refs: Vec<BlockPointer>,
    pub unrefs: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
}

/// The op sum type stored in metadata revisions.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Op {
    Create {
        common: OpCommon,
        new_name: String,
        dir: BlockUpdate,
        ty: EntryType,
    },
    Rm {
        common: OpCommon,
        old_name: String,
        dir: BlockUpdate,
    },
    Rename {
        common: OpCommon,
        old_name: String,
        old_dir: BlockUpdate,
        new_name: String,
        /// None for a rename within a single directory.
        new_dir: Option<BlockUpdate>,
        renamed: BlockPointer,
        ty: EntryType,
    },
    Sync {
        common: OpCommon,
        file: BlockUpdate,
        /// Ordered writes and truncates flushed by this revision.
        writes: Vec<WriteRange>,
    },
    SetAttr {
        common: OpCommon,
        name: String,
        dir: BlockUpdate,
        attr: Attr,
        file: BlockPointer,
    },
    Gc {
        common: OpCommon,
        /// The newest revision whose unreferenced blocks this op collected.
        latest_rev: u64,
    },
}

impl Op {
    pub fn new_create(name: &str, dir: BlockPointer, ty: EntryType) -> Op {
        Op::Create {
            common: OpCommon::default(),
            new_name: name.to_string(),
            dir: BlockUpdate::pending(dir),
            ty,
        }
    }

    pub fn new_rm(name: &str, dir: BlockPointer) -> Op {
        Op::Rm {
            common: OpCommon::default(),
            old_name: name.to_string(),
            dir: BlockUpdate::pending(dir),
        }
    }

    pub fn new_rename(
        old_name: &str,
        old_dir: BlockPointer,
        new_name: &str,
        new_dir: BlockPointer,
        renamed: BlockPointer,
        ty: EntryType,
    ) -> Op {
        Op::Rename {
            common: OpCommon::default(),
            old_name: old_name.to_string(),
            old_dir: BlockUpdate::pending(old_dir),
            new_name: new_name.to_string(),
            new_dir: if old_dir == new_dir {
                None
            } else {
                Some(BlockUpdate::pending(new_dir))
            },
            renamed,
            ty,
        }
    }

    pub fn new_sync(file: BlockPointer) -> Op {
        Op::Sync {
            common: OpCommon::default(),
            file: BlockUpdate::pending(file),
            writes: Vec::new(),
        }
    }

    pub fn new_set_attr(name: &str, dir: BlockPointer, attr: Attr, file: BlockPointer) -> Op {
        Op::SetAttr {
            common: OpCommon::default(),
            name: name.to_string(),
            dir: BlockUpdate::pending(dir),
            attr,
            file,
        }
    }

    pub fn new_gc(latest_rev: u64) -> Op {
        Op::Gc {
            common: OpCommon::default(),
            latest_rev,
        }
    }

    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Create { common, .. }
            | Op::Rm { common, .. }
            | Op::Rename { common, .. }
            | Op::Sync { common, .. }
            | Op::SetAttr { common, .. }
            | Op::Gc { common, .. } => common,
        }
    }

    fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Create { common, .. }
            | Op::Rm { common, .. }
            | Op::Rename { common, .. }
            | Op::Sync { common, .. }
            | Op::SetAttr { common, .. }
            | Op::Gc { common, .. } => common,
        }
    }

    pub fn add_ref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().refs.push(ptr);
    }

    pub fn add_unref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().unrefs.push(ptr);
    }

    /// Records that the block at `old` was rewritten to `new`. The op's
    /// primary directory/file updates are patched in place when they match;
    /// everything else lands in the shared update list.
    pub fn add_update(&mut self, old: BlockPointer, new: BlockPointer) {
        let matched = match self {
            Op::Create { dir, .. } | Op::Rm { dir, .. } | Op::SetAttr { dir, .. } => {
                if dir.old == old {
                    dir.new = new;
                    true
                } else {
                    false
                }
            }
            Op::Rename {
                old_dir, new_dir, ..
            } => {
                let mut hit = false;
                if old_dir.old == old {
                    old_dir.new = new;
                    hit = true;
                }
                if let Some(nd) = new_dir {
                    if nd.old == old {
                        nd.new = new;
                        hit = true;
                    }
                }
                hit
            }
            Op::Sync { file, .. } => {
                if file.old == old {
                    file.new = new;
                    true
                } else {
                    false
                }
            }
            Op::Gc { .. } => false,
        };
        if !matched {
            self.common_mut().updates.push(BlockUpdate { old, new });
        }
    }

    pub fn add_write(&mut self, off: u64, len: u64) {
        if let Op::Sync { writes, .. } = self {
            writes.push(WriteRange { off, len });
        }
    }

    pub fn add_truncate(&mut self, size: u64) {
        if let Op::Sync { writes, .. } = self {
            writes.push(WriteRange { off: size, len: 0 });
        }
    }

    pub fn refs(&self) -> &[BlockPointer] {
        &self.common().refs
    }

    pub fn unrefs(&self) -> &[BlockPointer] {
        &self.common().unrefs
    }

    /// All pointer rewrites: the primary ones plus the shared list.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut updates = Vec::new();
        match self {
            Op::Create { dir, .. } | Op::Rm { dir, .. } | Op::SetAttr { dir, .. } => {
                updates.push(*dir)
            }
            Op::Rename {
                old_dir, new_dir, ..
            } => {
                updates.push(*old_dir);
                if let Some(nd) = new_dir {
                    updates.push(*nd);
                }
            }
            Op::Sync { file, .. } => updates.push(*file),
            Op::Gc { .. } => {}
        }
        updates.extend_from_slice(&self.common().updates);
        updates
    }

    /// Drops everything recorded by a failed sync attempt so the op can be
    /// reused by a retry.
    pub fn reset_update_state(&mut self) {
        let common = self.common_mut();
        common.refs.clear();
        common.updates.clear();
        if let Op::Sync { file, .. } = self {
            file.new = file.old;
        }
    }

    /// Produces the op whose local notification effect undoes this op, used
    /// when unwinding an unmerged branch. Applying an op and then its
    /// inverse leaves the node cache unchanged.
    pub fn invert_for_local_notifications(&self) -> Op {
        let inv_common = |common: &OpCommon| OpCommon {
            refs: common.unrefs.clone(),
            unrefs: common.refs.clone(),
            updates: common.updates.iter().map(|u| u.inverted()).collect(),
        };
        match self {
            Op::Create {
                common,
                new_name,
                dir,
                ..
            } => Op::Rm {
                common: inv_common(common),
                old_name: new_name.clone(),
                dir: dir.inverted(),
            },
            Op::Rm {
                common,
                old_name,
                dir,
            } => Op::Create {
                common: inv_common(common),
                // The removed entry's type isn't recorded; File is the
                // conservative guess for a notification-only op.
                new_name: old_name.clone(),
                dir: dir.inverted(),
                ty: EntryType::File,
            },
            Op::Rename {
                common,
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                ty,
            } => Op::Rename {
                common: inv_common(common),
                old_name: new_name.clone(),
                old_dir: new_dir.unwrap_or(*old_dir).inverted(),
                new_name: old_name.clone(),
                new_dir: new_dir.map(|_| old_dir.inverted()),
                renamed: *renamed,
                ty: *ty,
            },
            Op::Sync {
                common,
                file,
                writes,
            } => Op::Sync {
                common: inv_common(common),
                file: file.inverted(),
                writes: writes.clone(),
            },
            Op::SetAttr {
                common,
                name,
                dir,
                attr,
                file,
            } => Op::SetAttr {
                common: inv_common(common),
                name: name.clone(),
                dir: dir.inverted(),
                attr: *attr,
                file: *file,
            },
            Op::Gc { common, latest_rev } => Op::Gc {
                common: inv_common(common),
                latest_rev: *latest_rev,
            },
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Create { new_name, ty, .. } => write!(f, "create {} ({})", new_name, ty),
            Op::Rm { old_name, .. } => write!(f, "rm {}", old_name),
            Op::Rename {
                old_name, new_name, ..
            } => write!(f, "rename {} -> {}", old_name, new_name),
            Op::Sync { writes, .. } => write!(f, "sync ({} writes)", writes.len()),
            Op::SetAttr { name, attr, .. } => write!(f, "setAttr {:?} on {}", attr, name),
            Op::Gc { latest_rev, .. } => write!(f, "gc up to rev {}", latest_rev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_pointer;

    #[test]
    fn add_update_patches_primary_fields_first() {
        let dir = test_pointer(1);
        let new_dir = test_pointer(2);
        let other_old = test_pointer(3);
        let other_new = test_pointer(4);

        let mut op = Op::new_create("f", dir, EntryType::File);
        op.add_update(other_old, other_new);
        op.add_update(dir, new_dir);

        match &op {
            Op::Create { dir: d, common, .. } => {
                assert_eq!(d.new, new_dir);
                assert_eq!(common.updates.len(), 1);
                assert_eq!(common.updates[0].old, other_old);
            }
            _ => unreachable!(),
        }
        assert_eq!(op.all_updates().len(), 2);
    }

    #[test]
    fn sync_op_records_writes_and_truncates_in_order() {
        let mut op = Op::new_sync(test_pointer(1));
        op.add_write(0, 5);
        op.add_truncate(3);
        op.add_write(3, 2);
        match &op {
            Op::Sync { writes, .. } => {
                assert_eq!(writes.len(), 3);
                assert!(writes[1].is_truncate());
                assert_eq!(writes[1].off, 3);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn invert_create_yields_rm() {
        let dir = test_pointer(1);
        let mut op = Op::new_create("f", dir, EntryType::Dir);
        op.add_update(dir, test_pointer(2));
        op.add_ref_block(test_pointer(3));

        let inv = op.invert_for_local_notifications();
        match &inv {
            Op::Rm { old_name, dir: d, .. } => {
                assert_eq!(old_name, "f");
                assert_eq!(d.old, test_pointer(2));
                assert_eq!(d.new, test_pointer(1));
            }
            _ => panic!("expected rm, got {:?}", inv),
        }
        assert_eq!(inv.refs(), &[] as &[crate::BlockPointer]);
        assert_eq!(inv.unrefs(), &[test_pointer(3)]);
    }

    #[test]
    fn invert_rename_swaps_directions() {
        let a = test_pointer(1);
        let b = test_pointer(2);
        let op = Op::new_rename("x", a, "y", b, test_pointer(3), EntryType::File);
        let inv = op.invert_for_local_notifications();
        match inv {
            Op::Rename {
                old_name,
                new_name,
                old_dir,
                new_dir,
                ..
            } => {
                assert_eq!(old_name, "y");
                assert_eq!(new_name, "x");
                assert_eq!(old_dir.old, b);
                assert_eq!(new_dir.map(|u| u.old), Some(a));
            }
            _ => unreachable!(),
        }
    }
}

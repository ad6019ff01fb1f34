//! The node cache: opaque handles backing the filesystem API.
//!
//! Mount adapters hold [Node] handles, never paths; the cache maintains the
//! single live node per pointer and the parent links that let a node be
//! resolved to a full path on demand. Entries live in a slab addressed by
//! `(index, generation)` so a handle that outlives its entry resolves to
//! nothing rather than to an unrelated reused slot.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::data::{BlockPointer, FolderBranch, Path, PathNode};

/// An opaque, copyable handle to a live filesystem object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Node {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    ptr: BlockPointer,
    name: String,
    parent: Option<Node>,
    unlinked: bool,
    /// The path as of the unlink, served to readers of deleted files.
    last_path: Vec<PathNode>,
    occupied: bool,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    /// Lookup by stripped pointer, so a creator change mid-write doesn't
    /// orphan the node.
    by_ptr: HashMap<BlockPointer, Node>,
}

pub struct NodeCache {
    folder_branch: FolderBranch,
    inner: Mutex<Inner>,
}

impl NodeCache {
    pub fn new(folder_branch: FolderBranch) -> Self {
        NodeCache {
            folder_branch,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn folder_branch(&self) -> FolderBranch {
        self.folder_branch
    }

    /// Returns the node for `ptr`, creating it with the given name and
    /// parent link if it doesn't exist yet.
    pub fn get_or_create(&self, ptr: BlockPointer, name: &str, parent: Option<Node>) -> Node {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_ptr.get(&ptr.stripped()) {
            return *node;
        }
        let slot = Slot {
            generation: 0,
            ptr,
            name: name.to_string(),
            parent,
            unlinked: false,
            last_path: Vec::new(),
            occupied: true,
        };
        let node = match inner.free.pop() {
            Some(index) => {
                let generation = inner.slots[index].generation + 1;
                inner.slots[index] = Slot { generation, ..slot };
                Node { index, generation }
            }
            None => {
                inner.slots.push(slot);
                Node {
                    index: inner.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        inner.by_ptr.insert(ptr.stripped(), node);
        node
    }

    /// The live node for `ptr`, if one exists.
    pub fn get(&self, ptr: BlockPointer) -> Option<Node> {
        self.inner.lock().by_ptr.get(&ptr.stripped()).copied()
    }

    /// Resolves a node to its current path by walking parent links to the
    /// root. Unlinked nodes yield their last-known path. Returns `None` for
    /// stale handles.
    pub fn path_from_node(&self, node: Node) -> Option<Path> {
        let inner = self.inner.lock();
        let slot = inner.live_slot(node)?;
        if slot.unlinked {
            return Some(Path {
                folder_branch: self.folder_branch,
                nodes: slot.last_path.clone(),
            });
        }
        let mut nodes = Vec::new();
        let mut curr = Some(node);
        while let Some(n) = curr {
            let slot = inner.live_slot(n)?;
            if slot.unlinked {
                // A parent was unlinked out from under us; the chain up to
                // here is the best answer we have.
                let mut prefix = slot.last_path.clone();
                prefix.reverse();
                nodes.extend(prefix);
                break;
            }
            nodes.push(PathNode {
                ptr: slot.ptr,
                name: slot.name.clone(),
            });
            curr = slot.parent;
        }
        nodes.reverse();
        Some(Path {
            folder_branch: self.folder_branch,
            nodes,
        })
    }

    /// Rewrites the pointer backing a node, as part of applying a sync'd op.
    pub fn update_pointer(&self, old: BlockPointer, new: BlockPointer) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_ptr.remove(&old.stripped()) {
            if let Some(slot) = inner.live_slot_mut(node) {
                slot.ptr = new;
            }
            inner.by_ptr.insert(new.stripped(), node);
        }
    }

    /// Reparents the node for `ptr`. The child must be moved before the old
    /// parent's entry is dropped, or a concurrent path resolution could see
    /// a dangling chain.
    pub fn move_node(&self, ptr: BlockPointer, new_parent: Node, new_name: &str) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_ptr.get(&ptr.stripped()).copied() {
            if let Some(slot) = inner.live_slot_mut(node) {
                slot.parent = Some(new_parent);
                slot.name = new_name.to_string();
            }
        }
    }

    /// Detaches the node for `ptr`. Future lookups won't find it, but
    /// existing handles keep resolving to `last_path` so readers of deleted
    /// files can drain.
    pub fn unlink(&self, ptr: BlockPointer, last_path: Path) {
        let mut inner = self.inner.lock();
        if let Some(node) = inner.by_ptr.remove(&ptr.stripped()) {
            if let Some(slot) = inner.live_slot_mut(node) {
                slot.unlinked = true;
                slot.last_path = last_path.nodes;
            }
        }
    }

    /// Forgets a node the adapter no longer holds, freeing its slot for
    /// reuse under a bumped generation.
    pub fn release(&self, node: Node) {
        let mut inner = self.inner.lock();
        let ptr = match inner.live_slot(node) {
            Some(slot) => slot.ptr,
            None => return,
        };
        if let Some(slot) = inner.live_slot_mut(node) {
            slot.occupied = false;
        }
        if inner.by_ptr.get(&ptr.stripped()) == Some(&node) {
            inner.by_ptr.remove(&ptr.stripped());
        }
        inner.free.push(node.index);
    }
}

impl Inner {
    fn live_slot(&self, node: Node) -> Option<&Slot> {
        self.slots
            .get(node.index)
            .filter(|slot| slot.occupied && slot.generation == node.generation)
    }

    fn live_slot_mut(&mut self, node: Node) -> Option<&mut Slot> {
        self.slots
            .get_mut(node.index)
            .filter(|slot| slot.occupied && slot.generation == node.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BranchName;
    use crate::fixtures::{test_pointer, test_tlf};

    fn cache() -> NodeCache {
        NodeCache::new(FolderBranch {
            tlf: test_tlf(),
            branch: BranchName::Master,
        })
    }

    #[test]
    fn same_pointer_same_node() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let a = cache.get_or_create(test_pointer(2), "a", Some(root));
        let a2 = cache.get_or_create(test_pointer(2), "a", Some(root));
        assert_eq!(a, a2);
        assert_ne!(root, a);
    }

    #[test]
    fn path_walks_to_root() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let dir = cache.get_or_create(test_pointer(2), "d", Some(root));
        let file = cache.get_or_create(test_pointer(3), "f", Some(dir));

        let path = cache.path_from_node(file).unwrap();
        assert_eq!(path.to_string(), "tlf/d/f");
        assert_eq!(path.tail_pointer(), test_pointer(3));
        assert!(path.is_valid());
    }

    #[test]
    fn update_pointer_rewrites_lookup_and_path() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let file = cache.get_or_create(test_pointer(2), "f", Some(root));

        cache.update_pointer(test_pointer(2), test_pointer(9));
        assert_eq!(cache.get(test_pointer(9)), Some(file));
        assert_eq!(cache.get(test_pointer(2)), None);
        let path = cache.path_from_node(file).unwrap();
        assert_eq!(path.tail_pointer(), test_pointer(9));
    }

    #[test]
    fn move_changes_parent_and_name() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let a = cache.get_or_create(test_pointer(2), "a", Some(root));
        let b = cache.get_or_create(test_pointer(3), "b", Some(root));
        let file = cache.get_or_create(test_pointer(4), "x", Some(a));

        cache.move_node(test_pointer(4), b, "y");
        let path = cache.path_from_node(file).unwrap();
        assert_eq!(path.to_string(), "tlf/b/y");
    }

    #[test]
    fn unlinked_node_serves_last_known_path() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let file = cache.get_or_create(test_pointer(2), "f", Some(root));

        let last = cache.path_from_node(file).unwrap();
        cache.unlink(test_pointer(2), last.clone());

        assert_eq!(cache.get(test_pointer(2)), None);
        assert_eq!(cache.path_from_node(file).unwrap(), last);
    }

    #[test]
    fn stale_handles_resolve_to_nothing_after_reuse() {
        let cache = cache();
        let root = cache.get_or_create(test_pointer(1), "tlf", None);
        let file = cache.get_or_create(test_pointer(2), "f", Some(root));

        cache.release(file);
        let newcomer = cache.get_or_create(test_pointer(3), "g", Some(root));
        // the slot was reused under a new generation
        assert_ne!(file, newcomer);
        assert!(cache.path_from_node(file).is_none());
        assert!(cache.path_from_node(newcomer).is_some());
    }
}

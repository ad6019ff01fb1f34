//! The entity model of a folder: block pointers, blocks, directory entries
//! and paths. Everything here is plain data; the engine in [crate::folder]
//! owns all mutation rules.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{BlockId, BranchId, KeyGen, RefNonce, TlfId, UserId};

pub mod md;
pub mod ops;

pub use md::{BlockChanges, MetadataFlags, PrivateMetadata, RootMetadata};
pub use ops::{Attr, BlockUpdate, Op, WriteRange};

/// Data-structure version a pointer refers to. Bumped when the block layout
/// changes incompatibly.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize, Deserialize,
)]
pub struct DataVer(pub u32);

impl DataVer {
    pub const FIRST_VALID: DataVer = DataVer(1);
}

/// The fundamental handle to a block.
///
/// Two pointers are equal iff all fields match; a pointer with a fresh
/// `ref_nonce` references the same stored bytes as the zero-nonce original
/// but counts as a distinct reference at the block store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub creator: UserId,
}

impl BlockPointer {
    pub const NULL: BlockPointer = BlockPointer {
        id: BlockId::NULL,
        ref_nonce: RefNonce::ZERO,
        key_gen: KeyGen(0),
        data_ver: DataVer(0),
        creator: UserId::NULL,
    };

    pub fn is_valid(&self) -> bool {
        !self.id.is_null()
    }

    /// True for the reference that created the block's contents; all later
    /// references carry a fresh nonce.
    pub fn is_first_ref(&self) -> bool {
        self.ref_nonce.is_zero()
    }

    /// Drops the creator, yielding a stable key for caches that must survive
    /// the writer changing mid-operation.
    pub fn stripped(&self) -> BlockPointer {
        BlockPointer {
            creator: UserId::NULL,
            ..*self
        }
    }
}

impl Default for BlockPointer {
    fn default() -> Self {
        Self::NULL
    }
}

/// A pointer plus the size its block occupies on the block store. A zero
/// encoded size marks a block that is dirty and has not been readied yet.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

/// The type of a directory entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryType {
    pub fn is_file(&self) -> bool {
        matches!(self, EntryType::File | EntryType::Exec)
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryType::File => "FILE",
            EntryType::Exec => "EXEC",
            EntryType::Dir => "DIR",
            EntryType::Sym => "SYM",
        };
        write!(f, "{}", s)
    }
}

/// The caller-visible portion of a directory entry.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct EntryInfo {
    pub ty: EntryType,
    pub size: u64,
    pub sym_path: Option<String>,
    pub mtime: i64,
    pub ctime: i64,
}

/// Metadata for one child of a directory.
///
/// A symlink's pointer is unused (it stays [BlockPointer::NULL]); for
/// directories, `size` is a byte estimate rather than an exact content size.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub ty: EntryType,
    pub size: u64,
    pub sym_path: Option<String>,
    pub mtime: i64,
    pub ctime: i64,
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::File
    }
}

impl DirEntry {
    pub fn ptr(&self) -> BlockPointer {
        self.info.ptr
    }

    pub fn is_initialized(&self) -> bool {
        self.info.ptr.is_valid()
    }

    /// Marks the local device as the author of the entry's pending contents.
    pub fn set_writer(&mut self, user: UserId) {
        self.info.ptr.creator = user;
    }

    pub fn entry_info(&self) -> EntryInfo {
        EntryInfo {
            ty: self.ty,
            size: self.size,
            sym_path: self.sym_path.clone(),
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

/// An indirect pointer into a file block, covering the byte range starting at
/// `off` (inclusive).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    pub off: u64,
}

/// An indirect pointer into a directory block, covering the bucket of names
/// starting at `off` (inclusive).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct IndirectDirPtr {
    pub info: BlockInfo,
    pub off: String,
}

/// Payload of a file block.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FileBody {
    Direct(Bytes),
    Indirect(Vec<IndirectFilePtr>),
}

/// Contents of a file, direct or one level of indirection.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct FileBlock {
    /// Diversifies the pre-seal hash of otherwise identical blocks.
    pub seed: u64,
    pub body: FileBody,
}

impl FileBlock {
    pub fn new_direct() -> Self {
        FileBlock {
            seed: 0,
            body: FileBody::Direct(Bytes::new()),
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.body, FileBody::Indirect(_))
    }

    pub fn contents(&self) -> &Bytes {
        match &self.body {
            FileBody::Direct(data) => data,
            FileBody::Indirect(_) => panic!("contents() on an indirect file block"),
        }
    }

    pub fn set_contents(&mut self, data: Bytes) {
        self.body = FileBody::Direct(data);
    }

    pub fn iptrs(&self) -> &[IndirectFilePtr] {
        match &self.body {
            FileBody::Indirect(iptrs) => iptrs,
            FileBody::Direct(_) => &[],
        }
    }

    pub fn iptrs_mut(&mut self) -> &mut Vec<IndirectFilePtr> {
        match &mut self.body {
            FileBody::Indirect(iptrs) => iptrs,
            FileBody::Direct(_) => panic!("iptrs_mut() on a direct file block"),
        }
    }
}

/// Payload of a directory block.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum DirBody {
    Direct(BTreeMap<String, DirEntry>),
    Indirect(Vec<IndirectDirPtr>),
}

/// Contents of a directory. The engine currently only materializes direct
/// directory blocks; the indirect representation exists for the wire format.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct DirBlock {
    pub seed: u64,
    pub body: DirBody,
}

impl DirBlock {
    pub fn new_direct() -> Self {
        DirBlock {
            seed: 0,
            body: DirBody::Direct(BTreeMap::new()),
        }
    }

    pub fn is_indirect(&self) -> bool {
        matches!(self.body, DirBody::Indirect(_))
    }

    pub fn children(&self) -> &BTreeMap<String, DirEntry> {
        match &self.body {
            DirBody::Direct(children) => children,
            DirBody::Indirect(_) => panic!("children() on an indirect dir block"),
        }
    }

    pub fn children_mut(&mut self) -> &mut BTreeMap<String, DirEntry> {
        match &mut self.body {
            DirBody::Direct(children) => children,
            DirBody::Indirect(_) => panic!("children_mut() on an indirect dir block"),
        }
    }
}

/// A block is either file contents or directory contents.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
}

impl Block {
    pub fn into_file(self, ptr: BlockPointer) -> Result<FileBlock, crate::Error> {
        match self {
            Block::File(fblock) => Ok(fblock),
            Block::Dir(_) => Err(crate::Error::NotFileBlock(ptr)),
        }
    }

    pub fn into_dir(self, ptr: BlockPointer) -> Result<DirBlock, crate::Error> {
        match self {
            Block::Dir(dblock) => Ok(dblock),
            Block::File(_) => Err(crate::Error::NotDirBlock(ptr)),
        }
    }
}

/// Name of the branch a folder instance operates on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum BranchName {
    Master,
    Unmerged(BranchId),
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchName::Master => write!(f, "master"),
            BranchName::Unmerged(bid) => write!(f, "{}", bid),
        }
    }
}

/// A folder paired with the branch being operated on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct FolderBranch {
    pub tlf: TlfId,
    pub branch: BranchName,
}

/// One hop along a path: the pointer of the block backing the entry, plus
/// the entry's name within its parent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

/// The full path to an entry, rooted at the folder's top directory. A valid
/// path has at least one node; the head names the folder root.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Path {
    pub folder_branch: FolderBranch,
    pub nodes: Vec<PathNode>,
}

impl Path {
    pub fn is_valid(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn has_valid_parent(&self) -> bool {
        self.nodes.len() >= 2
    }

    pub fn tail_pointer(&self) -> BlockPointer {
        self.nodes.last().map(|n| n.ptr).unwrap_or(BlockPointer::NULL)
    }

    pub fn tail_name(&self) -> &str {
        self.nodes.last().map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn parent_path(&self) -> Path {
        let mut nodes = self.nodes.clone();
        nodes.pop();
        Path {
            folder_branch: self.folder_branch,
            nodes,
        }
    }

    pub fn child_path(&self, name: &str, ptr: BlockPointer) -> Path {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode {
            ptr,
            name: name.to_string(),
        });
        Path {
            folder_branch: self.folder_branch,
            nodes,
        }
    }

    pub fn child_path_no_ptr(&self, name: &str) -> Path {
        self.child_path(name, BlockPointer::NULL)
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.nodes.iter().map(|n| n.name.as_str()).collect();
        write!(f, "{}", names.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::BLOCK_ID_LEN;

    fn ptr(b: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId::from_hash([b; BLOCK_ID_LEN]),
            ref_nonce: RefNonce::ZERO,
            key_gen: KeyGen::FIRST_VALID,
            data_ver: DataVer::FIRST_VALID,
            creator: UserId::from_name("alice"),
        }
    }

    #[test]
    fn stripped_pointer_drops_creator_only() {
        let p = ptr(1);
        let s = p.stripped();
        assert_ne!(p, s);
        assert_eq!(p.id, s.id);
        assert_eq!(p.ref_nonce, s.ref_nonce);
        assert_eq!(s.creator, UserId::NULL);
        // stripping twice is a no-op
        assert_eq!(s, s.stripped());
    }

    #[test]
    fn path_helpers() {
        let fb = FolderBranch {
            tlf: TlfId::new_private([1; 16]),
            branch: BranchName::Master,
        };
        let root = Path {
            folder_branch: fb,
            nodes: vec![PathNode {
                ptr: ptr(1),
                name: "tlf".into(),
            }],
        };
        assert!(root.is_valid());
        assert!(!root.has_valid_parent());

        let child = root.child_path("f", ptr(2));
        assert!(child.has_valid_parent());
        assert_eq!(child.tail_name(), "f");
        assert_eq!(child.tail_pointer(), ptr(2));
        assert_eq!(child.parent_path(), root);
        assert_eq!(child.to_string(), "tlf/f");
    }
}

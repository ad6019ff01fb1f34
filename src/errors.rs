use thiserror::Error;

use crate::data::{BlockInfo, BlockPointer, Path};
use crate::ids::{BranchId, TlfId, UserId};

/// Errors surfaced by the folder engine and its collaborators.
///
/// Each distinguishable failure mode of the protocol gets its own variant so
/// callers can match on it; the metadata-store conflict family is grouped by
/// [Error::is_revision_conflict].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid path")]
    InvalidPath,

    #[error("invalid block pointer {0:?}")]
    InvalidBlockPointer(BlockPointer),

    #[error("{0} doesn't exist")]
    NoSuchName(String),

    #[error("{0} already exists")]
    NameExists(String),

    #[error("name {0} is too long (max {1} bytes)")]
    NameTooLong(String, usize),

    #[error("names with prefix {1} are reserved; cannot create {0}")]
    DisallowedPrefix(String, &'static str),

    #[error("directory {0} is not empty and can't be removed")]
    DirNotEmpty(String),

    #[error("directory too big: {0} bytes (max {1})")]
    DirTooBig(u64, u64),

    #[error("file too big: {0} bytes (max {1})")]
    FileTooBig(u64, u64),

    #[error("{0} is not a file")]
    NotFile(String),

    #[error("block {0:?} is not a file block")]
    NotFileBlock(BlockPointer),

    #[error("block {0:?} is not a directory block")]
    NotDirBlock(BlockPointer),

    #[error("renames across different folders are not supported")]
    RenameAcrossFolders,

    #[error("user {0} does not have read access to folder {1}")]
    ReadAccess(UserId, TlfId),

    #[error("user {0} does not have write access to folder {1}")]
    WriteAccess(UserId, TlfId),

    #[error("user {0} is not allowed to rekey folder {1}")]
    RekeyPermission(UserId, TlfId),

    /// Internal control signal: a read attempt found no cached head and must
    /// be retried holding the metadata writer lock.
    #[error("an MD write is needed to complete this request")]
    MdWriteNeededInRequest,

    #[error("cannot apply revision {applied} on top of revision {current}")]
    MdUpdateApply { applied: u64, current: u64 },

    #[error("cannot invert revision {inverted} on top of revision {current}")]
    MdUpdateInvert { inverted: u64, current: u64 },

    #[error("operation not permitted while there are unsynced local writes")]
    NotPermittedWhileDirty,

    #[error("operation not permitted while unmerged revisions are staged")]
    NotPermittedWhileStaged,

    #[error("metadata revision conflict: expected {expected}, got {actual}")]
    ConflictRevision { expected: u64, actual: u64 },

    #[error("metadata previous-root conflict at revision {0}")]
    ConflictPrevRoot(u64),

    #[error("metadata disk-usage conflict: expected {expected}, got {actual}")]
    ConflictDiskUsage { expected: u64, actual: u64 },

    #[error("no merged metadata found for folder {0}")]
    NoSuchMd(TlfId),

    #[error("no unmerged metadata found for folder {0} branch {1}")]
    NoSuchBranch(TlfId, BranchId),

    #[error("no such block {0:?} in the block store")]
    NoSuchBlock(BlockPointer),

    #[error("a block put must use the zero ref nonce, got {0:?}")]
    NonZeroRefNoncePut(BlockPointer),

    #[error("couldn't encode or decode metadata: {0}")]
    BadCryptoMd(String),

    #[error("unsealing block {0:?} failed")]
    BadSeal(BlockPointer),

    #[error("block {0:?} is marked dirty but has a non-zero encoded size")]
    InconsistentEncodedSize(BlockInfo),

    #[error("the block splitter produced an impossible split")]
    BadSplit,

    #[error("node for pointer {0:?} not found")]
    NodeNotFound(BlockPointer),

    #[error("no sync state found for file {0}")]
    NoSyncState(Path),

    #[error("folder state is inconsistent: {0}")]
    InconsistentState(String),

    #[error("the engine is shutting down")]
    Shutdown,

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// True for the metadata-store error family that signals a concurrent
    /// writer won the race, which switches publication onto an unmerged
    /// branch.
    pub fn is_revision_conflict(&self) -> bool {
        matches!(
            self,
            Error::ConflictRevision { .. }
                | Error::ConflictPrevRoot(_)
                | Error::ConflictDiskUsage { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::BadCryptoMd(e.to_string())
    }
}

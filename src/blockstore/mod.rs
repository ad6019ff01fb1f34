//! The untrusted block store contract.
//!
//! The store holds sealed, content-addressed payloads and a reference table
//! keyed by `(block id, ref nonce)`. It never sees plaintext; readying
//! (encode + seal + hash) happens in the engine before a put.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::crypto::KeyHalf;
use crate::data::BlockPointer;
use crate::ids::{BlockId, TlfId};
use crate::Error;

mod memory;
pub use memory::{MemoryBlockStore, RefStatus};

/// A sealed block payload ready to be put, along with the server half of its
/// key split.
#[derive(Clone, Debug, Default)]
pub struct ReadyBlockData {
    pub buf: Bytes,
    pub server_half: KeyHalf,
}

impl ReadyBlockData {
    pub fn encoded_size(&self) -> u32 {
        self.buf.len() as u32
    }
}

#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    /// Fetches a block's sealed payload and its server key half.
    async fn get(&self, tlf: TlfId, ptr: BlockPointer) -> Result<(Bytes, KeyHalf), Error>;

    /// Stores a new block under its creating reference. Fails on a non-zero
    /// ref nonce; additional references go through [BlockStore::add_ref].
    async fn put(&self, tlf: TlfId, ptr: BlockPointer, data: ReadyBlockData) -> Result<(), Error>;

    /// Adds a reference (with the pointer's nonce) to existing contents.
    async fn add_ref(&self, tlf: TlfId, ptr: BlockPointer) -> Result<(), Error>;

    /// Drops a batch of references, returning how many live references each
    /// touched id has left.
    async fn remove_refs(
        &self,
        tlf: TlfId,
        ptrs: &[BlockPointer],
    ) -> Result<HashMap<BlockId, usize>, Error>;

    /// Marks references as archived: unreachable from the current head but
    /// retained until garbage collection ages them out.
    async fn archive(&self, tlf: TlfId, ptrs: &[BlockPointer]) -> Result<(), Error>;

    /// Downcast hook for diagnostics that need store internals (the state
    /// checker inspects the memory store's reference table).
    fn as_any(&self) -> &dyn std::any::Any;
}

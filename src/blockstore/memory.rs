use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::{BlockStore, ReadyBlockData};
use crate::crypto::KeyHalf;
use crate::data::BlockPointer;
use crate::ids::{BlockId, RefNonce, TlfId};
use crate::Error;

/// Status of one reference at the store.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RefStatus {
    Live,
    Archived,
}

struct BlockEntry {
    buf: Bytes,
    server_half: KeyHalf,
    refs: HashMap<RefNonce, RefStatus>,
}

/// An in-memory block store, used by tests and the state checker.
#[derive(Default)]
pub struct MemoryBlockStore {
    folders: RwLock<HashMap<TlfId, HashMap<BlockId, BlockEntry>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the full reference table for one folder, for the state
    /// checker.
    pub fn all_refs(&self, tlf: TlfId) -> HashMap<BlockId, HashMap<RefNonce, RefStatus>> {
        let folders = self.folders.read();
        folders
            .get(&tlf)
            .map(|blocks| {
                blocks
                    .iter()
                    .map(|(id, entry)| (*id, entry.refs.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    #[instrument(skip(self), fields(block = %ptr.id))]
    async fn get(&self, tlf: TlfId, ptr: BlockPointer) -> Result<(Bytes, KeyHalf), Error> {
        let folders = self.folders.read();
        let entry = folders
            .get(&tlf)
            .and_then(|blocks| blocks.get(&ptr.id))
            .ok_or(Error::NoSuchBlock(ptr))?;
        if !entry.refs.contains_key(&ptr.ref_nonce) {
            return Err(Error::NoSuchBlock(ptr));
        }
        Ok((entry.buf.clone(), entry.server_half))
    }

    #[instrument(skip(self, data), fields(block = %ptr.id, size = data.encoded_size()))]
    async fn put(&self, tlf: TlfId, ptr: BlockPointer, data: ReadyBlockData) -> Result<(), Error> {
        if !ptr.ref_nonce.is_zero() {
            return Err(Error::NonZeroRefNoncePut(ptr));
        }
        let mut folders = self.folders.write();
        let blocks = folders.entry(tlf).or_default();
        let entry = blocks.entry(ptr.id).or_insert_with(|| BlockEntry {
            buf: data.buf.clone(),
            server_half: data.server_half,
            refs: HashMap::new(),
        });
        entry.refs.insert(RefNonce::ZERO, RefStatus::Live);
        Ok(())
    }

    #[instrument(skip(self), fields(block = %ptr.id))]
    async fn add_ref(&self, tlf: TlfId, ptr: BlockPointer) -> Result<(), Error> {
        let mut folders = self.folders.write();
        let entry = folders
            .get_mut(&tlf)
            .and_then(|blocks| blocks.get_mut(&ptr.id))
            .ok_or(Error::NoSuchBlock(ptr))?;
        entry.refs.insert(ptr.ref_nonce, RefStatus::Live);
        Ok(())
    }

    #[instrument(skip(self, ptrs), fields(count = ptrs.len()))]
    async fn remove_refs(
        &self,
        tlf: TlfId,
        ptrs: &[BlockPointer],
    ) -> Result<HashMap<BlockId, usize>, Error> {
        let mut folders = self.folders.write();
        let mut live_counts = HashMap::new();
        let blocks = match folders.get_mut(&tlf) {
            Some(blocks) => blocks,
            None => return Ok(live_counts),
        };
        for ptr in ptrs {
            if let Some(entry) = blocks.get_mut(&ptr.id) {
                entry.refs.remove(&ptr.ref_nonce);
                let left = entry.refs.len();
                live_counts.insert(ptr.id, left);
                if left == 0 {
                    blocks.remove(&ptr.id);
                }
            } else {
                live_counts.insert(ptr.id, 0);
            }
        }
        Ok(live_counts)
    }

    #[instrument(skip(self, ptrs), fields(count = ptrs.len()))]
    async fn archive(&self, tlf: TlfId, ptrs: &[BlockPointer]) -> Result<(), Error> {
        let mut folders = self.folders.write();
        let blocks = match folders.get_mut(&tlf) {
            Some(blocks) => blocks,
            None => return Ok(()),
        };
        for ptr in ptrs {
            if let Some(entry) = blocks.get_mut(&ptr.id) {
                if let Some(status) = entry.refs.get_mut(&ptr.ref_nonce) {
                    *status = RefStatus::Archived;
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::test_pointer;

    fn tlf() -> TlfId {
        TlfId::new_private([1; 16])
    }

    fn ready(data: &[u8]) -> ReadyBlockData {
        ReadyBlockData {
            buf: Bytes::copy_from_slice(data),
            server_half: KeyHalf::default(),
        }
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryBlockStore::new();
        let ptr = test_pointer(1);
        store.put(tlf(), ptr, ready(b"sealed")).await.unwrap();
        let (buf, _) = store.get(tlf(), ptr).await.unwrap();
        assert_eq!(&buf[..], b"sealed");
    }

    #[tokio::test]
    async fn put_rejects_non_zero_nonce() {
        let store = MemoryBlockStore::new();
        let mut ptr = test_pointer(1);
        ptr.ref_nonce = RefNonce([1; 8]);
        let err = store.put(tlf(), ptr, ready(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::NonZeroRefNoncePut(_)));
    }

    #[tokio::test]
    async fn refs_keep_contents_alive() {
        let store = MemoryBlockStore::new();
        let ptr = test_pointer(1);
        store.put(tlf(), ptr, ready(b"x")).await.unwrap();

        let mut second = ptr;
        second.ref_nonce = RefNonce([9; 8]);
        store.add_ref(tlf(), second).await.unwrap();

        let counts = store.remove_refs(tlf(), &[ptr]).await.unwrap();
        assert_eq!(counts[&ptr.id], 1);
        assert!(store.get(tlf(), second).await.is_ok());

        let counts = store.remove_refs(tlf(), &[second]).await.unwrap();
        assert_eq!(counts[&ptr.id], 0);
        assert!(store.get(tlf(), second).await.is_err());
    }

    #[tokio::test]
    async fn archive_flips_status() {
        let store = MemoryBlockStore::new();
        let ptr = test_pointer(1);
        store.put(tlf(), ptr, ready(b"x")).await.unwrap();
        store.archive(tlf(), &[ptr]).await.unwrap();
        let refs = store.all_refs(tlf());
        assert_eq!(refs[&ptr.id][&RefNonce::ZERO], RefStatus::Archived);
        // archived blocks are still fetchable
        assert!(store.get(tlf(), ptr).await.is_ok());
    }
}

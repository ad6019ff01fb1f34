//! Shared fixtures for tests: deterministic ids, a memory-backed engine
//! harness, and recording collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::blockstore::{BlockStore, MemoryBlockStore, ReadyBlockData};
use crate::caches::{BlockCache, Node};
use crate::crypto::{KeyHalf, LocalCrypto};
use crate::data::md::REVISION_INITIAL;
use crate::data::ops::WriteRange;
use crate::data::{BlockInfo, BlockPointer, BranchName, DataVer, FolderBranch, RootMetadata};
use crate::folder::{
    Config, ConflictResolver, FolderOps, NodeChange, Observer, OpenIdentity, SingleKeyManager,
    SystemClock,
};
use crate::ids::{BlockId, KeyGen, RefNonce, TlfId, UserId, BLOCK_ID_LEN};
use crate::metastore::MemoryMetaStore;
use crate::splitter::FixedSizeSplitter;
use crate::Error;

lazy_static! {
    pub static ref ALICE: UserId = UserId::from_name("alice");
    pub static ref BOB: UserId = UserId::from_name("bob");
}

pub fn test_tlf() -> TlfId {
    TlfId::new_private([0x42; 16])
}

pub fn test_pointer(b: u8) -> BlockPointer {
    BlockPointer {
        id: BlockId::from_hash([b; BLOCK_ID_LEN]),
        ref_nonce: RefNonce::ZERO,
        key_gen: KeyGen::FIRST_VALID,
        data_ver: DataVer::FIRST_VALID,
        creator: *ALICE,
    }
}

pub fn test_info(b: u8, encoded_size: u32) -> BlockInfo {
    BlockInfo {
        ptr: test_pointer(b),
        encoded_size,
    }
}

pub fn test_md(revision: u64) -> RootMetadata {
    debug_assert!(revision >= REVISION_INITIAL);
    let mut md = RootMetadata::new(test_tlf(), vec![*ALICE, *BOB]);
    md.revision = revision;
    md
}

/// An observer that records everything it is told.
#[derive(Default)]
pub struct RecordingObserver {
    pub local: Mutex<Vec<(Node, WriteRange)>>,
    pub batches: Mutex<Vec<Vec<NodeChange>>>,
}

impl Observer for RecordingObserver {
    fn local_change(&self, node: Node, write: WriteRange) {
        self.local.lock().push((node, write));
    }

    fn batch_changes(&self, changes: &[NodeChange]) {
        self.batches.lock().push(changes.to_vec());
    }
}

/// A resolver that records every nudge it receives.
#[derive(Default)]
pub struct RecordingResolver {
    pub calls: Mutex<Vec<(u64, u64)>>,
}

#[async_trait]
impl ConflictResolver for RecordingResolver {
    fn resolve(&self, unmerged_rev: u64, merged_rev: u64) {
        self.calls.lock().push((unmerged_rev, merged_rev));
    }
}

/// A block store wrapper whose puts can be paused, for exercising writes
/// that race an in-flight sync.
pub struct GatedBlockStore {
    inner: MemoryBlockStore,
    gate: tokio::sync::Semaphore,
    gated: std::sync::atomic::AtomicBool,
    waiting: std::sync::atomic::AtomicUsize,
}

impl GatedBlockStore {
    pub fn new() -> Self {
        GatedBlockStore {
            inner: MemoryBlockStore::new(),
            gate: tokio::sync::Semaphore::new(0),
            gated: std::sync::atomic::AtomicBool::new(false),
            waiting: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Makes the next puts block until [GatedBlockStore::release] is called.
    pub fn hold_puts(&self) {
        self.gated.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Releases up to `n` held puts and stops gating.
    pub fn release(&self, n: usize) {
        self.gated.store(false, std::sync::atomic::Ordering::SeqCst);
        self.gate.add_permits(n);
    }

    /// How many puts are currently parked on the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for GatedBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for GatedBlockStore {
    async fn get(
        &self,
        tlf: TlfId,
        ptr: BlockPointer,
    ) -> Result<(bytes::Bytes, KeyHalf), Error> {
        self.inner.get(tlf, ptr).await
    }

    async fn put(&self, tlf: TlfId, ptr: BlockPointer, data: ReadyBlockData) -> Result<(), Error> {
        if self.gated.load(std::sync::atomic::Ordering::SeqCst) {
            self.waiting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let acquired = self.gate.acquire().await;
            self.waiting.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            let permit = acquired.map_err(|_| Error::Shutdown)?;
            permit.forget();
        }
        self.inner.put(tlf, ptr, data).await
    }

    async fn add_ref(&self, tlf: TlfId, ptr: BlockPointer) -> Result<(), Error> {
        self.inner.add_ref(tlf, ptr).await
    }

    async fn remove_refs(
        &self,
        tlf: TlfId,
        ptrs: &[BlockPointer],
    ) -> Result<std::collections::HashMap<BlockId, usize>, Error> {
        self.inner.remove_refs(tlf, ptrs).await
    }

    async fn archive(&self, tlf: TlfId, ptrs: &[BlockPointer]) -> Result<(), Error> {
        self.inner.archive(tlf, ptrs).await
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Shared stores plus per-device engine construction.
pub struct TestEnv {
    pub block_store: Arc<dyn BlockStore>,
    pub memory_block_store: Option<Arc<MemoryBlockStore>>,
    pub meta_store: Arc<MemoryMetaStore>,
    pub block_size: usize,
    pub flush_interval: Option<Duration>,
}

impl TestEnv {
    pub fn new() -> Self {
        let store = Arc::new(MemoryBlockStore::new());
        TestEnv {
            block_store: store.clone(),
            memory_block_store: Some(store),
            meta_store: Arc::new(MemoryMetaStore::new()),
            block_size: 512 << 10,
            flush_interval: None,
        }
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_block_store(mut self, store: Arc<dyn BlockStore>) -> Self {
        self.block_store = store;
        self.memory_block_store = None;
        self
    }

    pub fn config_for(&self, user: UserId) -> Config {
        Config {
            block_store: self.block_store.clone(),
            meta_store: self.meta_store.clone(),
            crypto: Arc::new(LocalCrypto),
            key_manager: Arc::new(SingleKeyManager),
            identity: Arc::new(OpenIdentity),
            resolver: Arc::new(crate::folder::NoopResolver),
            splitter: Arc::new(FixedSizeSplitter::new(self.block_size, 8 << 10)),
            block_cache: Arc::new(BlockCache::new(1024)),
            clock: Arc::new(SystemClock),
            current_user: user,
            writers: vec![*ALICE, *BOB],
            data_version: DataVer::FIRST_VALID,
            max_file_bytes: 1 << 30,
            max_name_bytes: 255,
            max_dir_bytes: 1 << 20,
            background_flush_interval: self.flush_interval,
            check_state_on_shutdown: false,
        }
    }

    /// A fresh engine for `user`, sharing this environment's stores.
    pub fn engine(&self, user: UserId) -> Arc<FolderOps> {
        FolderOps::new(
            Arc::new(self.config_for(user)),
            FolderBranch {
                tlf: test_tlf(),
                branch: BranchName::Master,
            },
        )
    }

    /// An engine whose collaborators are customized by the caller.
    pub fn engine_with_config(&self, config: Config) -> Arc<FolderOps> {
        FolderOps::new(
            Arc::new(config),
            FolderBranch {
                tlf: test_tlf(),
                branch: BranchName::Master,
            },
        )
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

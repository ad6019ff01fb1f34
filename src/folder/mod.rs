//! The per-folder-branch operations engine.
//!
//! One [FolderOps] instance mediates every mutation of a single folder
//! branch: it owns the lock hierarchy, the dirty-block bookkeeping, the
//! cached metadata head, and the notification plumbing. Collaborators (block
//! store, metadata store, crypto, key manager, identity, conflict resolver)
//! are injected through [Config].
//!
//! Locking strategy, in brief:
//!
//! 1. `mdWriterLock` serializes every flow that publishes a metadata
//!    revision, for the entirety of the flow.
//! 2. `headLock` (rw) guards the cached head. It is taken for as short a
//!    time as possible; remote-sync flows take it for writing only after all
//!    network traffic is done, and hold it until notifications have fired.
//! 3. `blockLock` (rw) guards this folder's blocks in the cache, the
//!    per-block sync states, and the deferred-write queues. Writes and
//!    truncates hold it exclusively for their whole lifetime; readers take
//!    it shared and release it across block-store fetches.
//!
//! Writes to a file that is mid-sync are both applied to a copy (so the sync
//! publishes a consistent snapshot) and recorded for replay against the new
//! path once the sync lands.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex as PlMutex, RwLock as PlRwLock};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, instrument, warn};

use crate::blockstore::{BlockStore, ReadyBlockData};
use crate::caches::{BlockCache, Node, NodeCache};
use crate::crypto::Crypto;
use crate::data::md::REVISION_UNINITIALIZED;
use crate::data::ops::{Op, WriteRange};
use crate::data::{
    Block, BlockInfo, BlockPointer, BranchName, DataVer, DirEntry, EntryInfo, FolderBranch, Path,
    RootMetadata,
};
use crate::ids::{BranchId, TlfId, UserId};
use crate::locking::{BlockGuard, BlockLock, LeveledMutex, LeveledRwLock, LockState, LEVEL_HEAD,
    LEVEL_MD_WRITER};
use crate::metastore::MetaStore;
use crate::splitter::BlockSplitter;
use crate::Error;

mod read;
mod sync;
mod updates;
mod write;

pub use updates::UpdateSummary;

/// Bound on concurrent block puts during one sync.
const MAX_PARALLEL_BLOCK_PUTS: usize = 10;

/// Names beginning with these prefixes are reserved for the system.
pub const DISALLOWED_PREFIXES: &[&str] = &[".coffer"];

/// Returns the result or early-returns `(guard, Err(..))` from a function
/// whose signature threads a lock guard through.
macro_rules! try_g {
    ($guard:ident, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return ($guard, Err(e)),
        }
    };
}
pub(crate) use try_g;

/// Wall clock, injectable for tests.
pub trait Clock: Send + Sync {
    fn now_unix_nanos(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_nanos(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

/// A change to a node, delivered to observers.
#[derive(Clone, Debug, Default)]
pub struct NodeChange {
    pub node: Option<Node>,
    /// Names updated within this directory node.
    pub dir_updated: Vec<String>,
    /// Ranges updated within this file node.
    pub file_updated: Vec<WriteRange>,
}

/// Receives change notifications for a folder branch. Local changes arrive
/// in the order local operations complete; batch changes arrive in strictly
/// ascending revision order. The two streams are not ordered against each
/// other.
pub trait Observer: Send + Sync {
    fn local_change(&self, node: Node, write: WriteRange);
    fn batch_changes(&self, changes: &[NodeChange]);
}

/// One-shot identity verification, run lazily on the first read that needs
/// it.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn identify(&self, tlf: TlfId) -> Result<(), Error>;
}

/// An identity service that trusts everyone; useful in tests.
pub struct OpenIdentity;

#[async_trait]
impl IdentityService for OpenIdentity {
    async fn identify(&self, _tlf: TlfId) -> Result<(), Error> {
        Ok(())
    }
}

/// Key machinery, injected. `rekey` returns false when no key change was
/// needed.
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn rekey(&self, md: &mut RootMetadata) -> Result<bool, Error>;
}

/// A key manager that mints the first key generation and never rotates.
pub struct SingleKeyManager;

#[async_trait]
impl KeyManager for SingleKeyManager {
    async fn rekey(&self, md: &mut RootMetadata) -> Result<bool, Error> {
        if md.key_gen == crate::ids::KeyGen(0) {
            md.key_gen = crate::ids::KeyGen::FIRST_VALID;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// The hooks the engine exposes to a conflict resolver. `resolve` is a
/// non-blocking nudge carrying the unmerged and last-known merged revisions;
/// the resolver eventually calls back into
/// [FolderOps::finalize_resolution].
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, unmerged_rev: u64, merged_rev: u64);

    /// Waits for any in-flight resolution to settle.
    async fn wait(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A resolver that drops every nudge on the floor.
pub struct NoopResolver;

#[async_trait]
impl ConflictResolver for NoopResolver {
    fn resolve(&self, _unmerged_rev: u64, _merged_rev: u64) {}
}

/// Everything a folder engine needs, injected.
pub struct Config {
    pub block_store: Arc<dyn BlockStore>,
    pub meta_store: Arc<dyn MetaStore>,
    pub crypto: Arc<dyn Crypto>,
    pub key_manager: Arc<dyn KeyManager>,
    pub identity: Arc<dyn IdentityService>,
    pub resolver: Arc<dyn ConflictResolver>,
    pub splitter: Arc<dyn BlockSplitter>,
    pub block_cache: Arc<BlockCache>,
    pub clock: Arc<dyn Clock>,
    pub current_user: UserId,
    /// The folder's writer set. Key bundles proper are out of scope; this is
    /// the access-control view of them.
    pub writers: Vec<UserId>,
    pub data_version: DataVer,
    pub max_file_bytes: u64,
    pub max_name_bytes: usize,
    pub max_dir_bytes: u64,
    /// Dirty files are flushed at this interval; `None` disables the
    /// background flusher.
    pub background_flush_interval: Option<Duration>,
    /// Run the state checker against the stores on shutdown, when the
    /// folder is clean and unstaged.
    pub check_state_on_shutdown: bool,
}

/// Writer-side state, protected by `mdWriterLock`: whether this device has
/// published unmerged revisions, and on which branch.
pub(crate) struct WriterState {
    pub staged: bool,
    pub bid: BranchId,
}

/// Sync status of a block, consulted by writes to decide between plain
/// dirtying, copy-plus-defer, and defer-only.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SyncBlockState {
    /// Being synced; the dirty cache still holds the version the sync took.
    SyncingNotDirty,
    /// Being synced and re-dirtied by a concurrent write.
    SyncingAndDirty,
}

/// A write or truncate recorded while its blocks were mid-sync, replayed
/// against the new path once the sync lands.
pub(crate) enum DeferredWrite {
    Write { data: Bytes, off: u64 },
    Truncate { size: u64 },
}

/// State guarded by `blockLock`.
#[derive(Default)]
pub(crate) struct BlockState {
    pub file_block_states: HashMap<BlockPointer, SyncBlockState>,
    pub deferred_writes: Vec<DeferredWrite>,
    /// Dirty-cache entries to drop before the deferred writes replay.
    pub deferred_dirty_deletes: Vec<BlockPointer>,
    /// Set when the current write/truncate touched a block that is mid-sync.
    pub do_defer_write: bool,
}

pub(crate) type BGuard<'a> = BlockGuard<'a, BlockState>;

/// Per-file sync bookkeeping accumulated by writes and truncates.
pub(crate) struct SyncInfo {
    pub old_info: BlockInfo,
    pub op: Op,
    pub unrefs: Vec<BlockInfo>,
    pub bps: BlockPutState,
    pub ref_bytes: u64,
    pub unref_bytes: u64,
}

/// Pending-put staging: blocks readied but not yet at the store.
#[derive(Default, Clone)]
pub(crate) struct BlockPutState {
    pub blocks: Vec<(BlockPointer, Block, ReadyBlockData)>,
}

impl BlockPutState {
    pub fn add(&mut self, ptr: BlockPointer, block: Block, data: ReadyBlockData) {
        self.blocks.push((ptr, block, data));
    }

    pub fn merge(&mut self, other: BlockPutState) {
        self.blocks.extend(other.blocks);
    }
}

/// Write-tracking caches, guarded by an internal mutex ordered below
/// `blockLock`.
#[derive(Default)]
pub(crate) struct WriteTracking {
    /// Per-file sync info, keyed by stripped file pointer.
    pub unref_cache: HashMap<BlockPointer, SyncInfo>,
    /// Pending directory-entry updates: stripped parent pointer to stripped
    /// file pointer to the updated entry.
    pub de_cache: HashMap<BlockPointer, HashMap<BlockPointer, DirEntry>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum FolderState {
    Clean,
    Dirty,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum MdReqType {
    ReadNoIdentify,
    ReadNeedIdentify,
    Write,
}

/// Status snapshot of a folder branch.
#[derive(Clone, Debug)]
pub struct FolderBranchStatus {
    pub staged: bool,
    pub branch_id: BranchId,
    pub head_revision: u64,
    pub disk_usage: u64,
    pub dirty_files: usize,
}

pub struct FolderOps {
    pub(crate) config: Arc<Config>,
    folder_branch: FolderBranch,
    weak_self: Weak<FolderOps>,

    pub(crate) md_writer_lock: LeveledMutex<WriterState>,
    pub(crate) head_lock: LeveledRwLock<Option<RootMetadata>>,
    pub(crate) block_lock: BlockLock<BlockState>,
    pub(crate) write_tracking: PlMutex<WriteTracking>,

    observers: PlRwLock<Vec<Arc<dyn Observer>>>,
    pub(crate) node_cache: NodeCache,
    state: PlMutex<FolderState>,
    identify_done: tokio::sync::Mutex<bool>,

    shutdown_tx: watch::Sender<bool>,
    update_pause_tx: mpsc::Sender<oneshot::Receiver<()>>,
    update_pause_rx: PlMutex<Option<mpsc::Receiver<oneshot::Receiver<()>>>>,
    archive_tx: mpsc::Sender<RootMetadata>,
    archive_pending: Arc<AtomicUsize>,
    archive_idle: Arc<Notify>,
    pump_started: AtomicBool,
}

impl FolderOps {
    pub fn new(config: Arc<Config>, folder_branch: FolderBranch) -> Arc<FolderOps> {
        let (shutdown_tx, _) = watch::channel(false);
        let (update_pause_tx, update_pause_rx) = mpsc::channel(1);
        let (archive_tx, archive_rx) = mpsc::channel(25);

        let ops = Arc::new_cyclic(|weak| FolderOps {
            config,
            folder_branch,
            weak_self: weak.clone(),
            md_writer_lock: LeveledMutex::new(
                LEVEL_MD_WRITER,
                WriterState {
                    staged: false,
                    bid: BranchId::NULL,
                },
            ),
            head_lock: LeveledRwLock::new(LEVEL_HEAD, None),
            block_lock: BlockLock::new(BlockState::default()),
            write_tracking: PlMutex::new(WriteTracking::default()),
            observers: PlRwLock::new(Vec::new()),
            node_cache: NodeCache::new(folder_branch),
            state: PlMutex::new(FolderState::Clean),
            identify_done: tokio::sync::Mutex::new(false),
            shutdown_tx,
            update_pause_tx,
            update_pause_rx: PlMutex::new(Some(update_pause_rx)),
            archive_tx,
            archive_pending: Arc::new(AtomicUsize::new(0)),
            archive_idle: Arc::new(Notify::new()),
            pump_started: AtomicBool::new(false),
        });

        tokio::spawn(ops.clone().archive_loop(archive_rx));
        if let Some(interval) = ops.config.background_flush_interval {
            tokio::spawn(ops.clone().background_flusher(interval));
        }
        ops
    }

    pub fn id(&self) -> TlfId {
        self.folder_branch.tlf
    }

    pub fn branch(&self) -> BranchName {
        self.folder_branch.branch
    }

    pub fn folder_branch(&self) -> FolderBranch {
        self.folder_branch
    }

    /// Stops the background tasks, optionally verifying server-side state
    /// first. In-memory dirty state is abandoned, not rolled back.
    pub async fn shutdown(&self) -> Result<(), Error> {
        if self.config.check_state_on_shutdown {
            let ls = LockState::new();
            let staged = {
                let writer = self.md_writer_lock.lock(&ls).await;
                writer.staged
            };
            if self.get_state() != FolderState::Clean {
                debug!("skipping the shutdown state check: dirty");
            } else if staged {
                debug!("skipping the shutdown state check: staged");
            } else {
                self.sync_from_server().await?;
                crate::statecheck::check_merged_state(self).await?;
            }
        }
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<FolderOps>> {
        self.weak_self.upgrade()
    }

    pub(crate) fn get_state(&self) -> FolderState {
        *self.state.lock()
    }

    /// Transitions the folder state; the move to clean is refused while
    /// directory-entry updates are still pending.
    pub(crate) fn transition_state(&self, new_state: FolderState) {
        let mut state = self.state.lock();
        if new_state == FolderState::Clean && !self.write_tracking.lock().de_cache.is_empty() {
            return;
        }
        *state = new_state;
    }

    pub(crate) fn now_unix_nanos(&self) -> i64 {
        self.config.clock.now_unix_nanos()
    }

    pub(crate) async fn identify_once(&self) -> Result<(), Error> {
        let mut done = self.identify_done.lock().await;
        if *done {
            return Ok(());
        }
        self.config.identity.identify(self.id()).await?;
        *done = true;
        Ok(())
    }

    pub(crate) fn check_node(&self, node: Node) -> Result<Path, Error> {
        self.node_cache
            .path_from_node(node)
            .filter(Path::is_valid)
            .ok_or(Error::InvalidPath)
    }

    // Node-to-path resolution discipline: reads resolve without any lock;
    // flows holding mdWriterLock must resolve under it for an up-to-date
    // path; block writes resolve under blockLock.

    pub(crate) fn path_from_node_for_read(&self, node: Node) -> Result<Path, Error> {
        self.check_node(node)
    }

    pub(crate) fn path_from_node_for_md_write(&self, node: Node, _ls: &LockState) -> Result<Path, Error> {
        self.check_node(node)
    }

    pub(crate) fn path_from_node_for_block_write(
        &self,
        node: Node,
        _guard: &BGuard<'_>,
    ) -> Result<Path, Error> {
        self.check_node(node)
    }

    pub fn register_for_changes(&self, observer: Arc<dyn Observer>) {
        self.observers.write().push(observer);
    }

    pub fn unregister_from_changes(&self, observer: &Arc<dyn Observer>) {
        let mut observers = self.observers.write();
        observers.retain(|obs| !Arc::ptr_eq(obs, observer));
    }

    /// Notifies observers of the most recent write on a file's in-flight
    /// sync op.
    pub(crate) fn notify_local(&self, file: &Path, op: &Op) {
        let node = match self.node_cache.get(file.tail_pointer()) {
            Some(node) => node,
            None => return,
        };
        let latest = match op {
            Op::Sync { writes, .. } => match writes.last() {
                Some(range) => *range,
                None => return,
            },
            _ => return,
        };
        for obs in self.observers.read().iter() {
            obs.local_change(node, latest);
        }
    }

    pub(crate) fn send_batch_changes(&self, changes: &[NodeChange]) {
        if changes.is_empty() {
            return;
        }
        for obs in self.observers.read().iter() {
            obs.batch_changes(changes);
        }
    }

    /// Queues a finalized revision's unreferenced blocks for background
    /// archival.
    pub(crate) fn archive_locked(&self, md: &RootMetadata) {
        self.archive_pending.fetch_add(1, Ordering::AcqRel);
        if self.archive_tx.try_send(md.clone()).is_err() {
            self.archive_pending.fetch_sub(1, Ordering::AcqRel);
            warn!(revision = md.revision, "archive queue full, skipping");
        }
    }

    async fn archive_loop(self: Arc<FolderOps>, mut rx: mpsc::Receiver<RootMetadata>) {
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                Some(md) = rx.recv() => {
                    // Ordinary unrefs are archived until garbage collection
                    // ages them out; gc-op unrefs are the collection itself.
                    let mut archive_ptrs: Vec<BlockPointer> = Vec::new();
                    let mut collect_ptrs: Vec<BlockPointer> = Vec::new();
                    for op in &md.data.changes.ops {
                        if matches!(op, Op::Gc { .. }) {
                            collect_ptrs.extend(op.unrefs().iter().filter(|p| p.is_valid()));
                            continue;
                        }
                        archive_ptrs.extend(op.unrefs().iter().filter(|p| p.is_valid()));
                        for update in op.all_updates() {
                            if update.old.is_valid() && update.old != update.new {
                                archive_ptrs.push(update.old);
                            }
                        }
                    }
                    debug!(
                        revision = md.revision,
                        archived = archive_ptrs.len(),
                        collected = collect_ptrs.len(),
                        "processing unreferenced blocks"
                    );
                    if let Err(e) = self.config.block_store.archive(self.id(), &archive_ptrs).await {
                        warn!("couldn't archive blocks: {}", e);
                    }
                    if !collect_ptrs.is_empty() {
                        if let Err(e) =
                            self.config.block_store.remove_refs(self.id(), &collect_ptrs).await
                        {
                            warn!("couldn't collect blocks: {}", e);
                        }
                    }
                    self.archive_pending.fetch_sub(1, Ordering::AcqRel);
                    self.archive_idle.notify_waiters();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Waits until every queued archival has hit the block store.
    pub(crate) async fn wait_for_archives(&self) {
        while self.archive_pending.load(Ordering::Acquire) > 0 {
            self.archive_idle.notified().await;
        }
    }

    /// Stripped pointers of every file with a pending directory-entry
    /// update.
    fn dirty_pointers(&self) -> Vec<BlockPointer> {
        let tracking = self.write_tracking.lock();
        tracking
            .de_cache
            .values()
            .flat_map(|entries| entries.keys().copied())
            .collect()
    }

    async fn background_flusher(self: Arc<FolderOps>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for ptr in self.dirty_pointers() {
                        let node = match self.node_cache.get(ptr) {
                            Some(node) => node,
                            None => continue,
                        };
                        if let Err(e) = self.sync(node).await {
                            warn!(ptr = ?ptr, "couldn't sync dirty file: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Suspends remote-update processing until `unpause` fires.
    pub async fn pause_updates(&self, unpause: oneshot::Receiver<()>) {
        let _ = self.update_pause_tx.send(unpause).await;
    }

    pub(crate) fn take_update_pause_rx(&self) -> Option<mpsc::Receiver<oneshot::Receiver<()>>> {
        self.update_pause_rx.lock().take()
    }

    pub(crate) fn start_update_pump(&self) {
        if self.pump_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(ops), Some(pause_rx)) = (self.upgrade(), self.take_update_pause_rx()) {
            tokio::spawn(ops.update_loop(pause_rx));
        }
    }

    /// A snapshot of the branch's current status.
    pub async fn status(&self) -> Result<FolderBranchStatus, Error> {
        self.config.resolver.wait().await?;
        let ls = LockState::new();
        let (staged, bid) = {
            let writer = self.md_writer_lock.lock(&ls).await;
            (writer.staged, writer.bid)
        };
        let (head_revision, disk_usage) = {
            let head = self.head_lock.read(&ls).await;
            head.as_ref()
                .map(|md| (md.revision, md.disk_usage))
                .unwrap_or((REVISION_UNINITIALIZED, 0))
        };
        Ok(FolderBranchStatus {
            staged,
            branch_id: bid,
            head_revision,
            disk_usage,
            dirty_files: self.dirty_pointers().len(),
        })
    }

    pub(crate) fn check_name(&self, name: &str) -> Result<(), Error> {
        for prefix in DISALLOWED_PREFIXES {
            if name.starts_with(prefix) {
                return Err(Error::DisallowedPrefix(name.to_string(), prefix));
            }
        }
        if name.len() > self.config.max_name_bytes {
            return Err(Error::NameTooLong(
                name.to_string(),
                self.config.max_name_bytes,
            ));
        }
        Ok(())
    }
}

// The public filesystem API lives on FolderOps; each entry point makes a
// fresh LockState and delegates to the internals in the submodules.

impl FolderOps {
    /// The root node of the folder, fetching (and initializing, for a brand
    /// new folder) the head metadata if needed.
    #[instrument(skip(self), fields(tlf = %self.id()))]
    pub async fn get_root_node(&self) -> Result<(Node, EntryInfo), Error> {
        let ls = LockState::new();
        let md = match self.get_md_locked(&ls, MdReqType::ReadNoIdentify, None).await {
            Ok(md) => md,
            Err(Error::MdWriteNeededInRequest) => {
                let mut writer = self.md_writer_lock.lock(&ls).await;
                self.get_md_locked(&ls, MdReqType::Write, Some(&mut writer))
                    .await?
            }
            Err(e) => return Err(e),
        };
        let name = md.tlf.to_string();
        let node = self.node_cache.get_or_create(md.data.dir.ptr(), &name, None);
        Ok((node, md.data.dir.entry_info()))
    }
}

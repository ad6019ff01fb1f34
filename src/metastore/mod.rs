//! The signed-metadata service contract.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::data::RootMetadata;
use crate::ids::{BranchId, TlfId};
use crate::Error;

mod memory;
pub use memory::MemoryMetaStore;

/// How many revisions to pull per range request when catching up.
pub const MAX_MDS_AT_A_TIME: u64 = 10;

#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// The current merged head for a folder, if any revision exists.
    async fn get_for_tlf(&self, tlf: TlfId) -> Result<Option<RootMetadata>, Error>;

    /// The head of an unmerged branch. With `None`, returns the head of any
    /// branch this device has published to (devices have at most one).
    async fn get_unmerged_for_tlf(
        &self,
        tlf: TlfId,
        bid: Option<BranchId>,
    ) -> Result<Option<RootMetadata>, Error>;

    /// Revisions `start..=stop` (inclusive), merged or for a branch.
    async fn get_range(
        &self,
        tlf: TlfId,
        bid: Option<BranchId>,
        start: u64,
        stop: u64,
    ) -> Result<Vec<RootMetadata>, Error>;

    /// Publishes a merged revision. Fails with one of the revision-conflict
    /// errors when a concurrent writer got there first.
    async fn put(&self, md: &RootMetadata) -> Result<(), Error>;

    /// Publishes a revision onto an unmerged branch.
    async fn put_unmerged(&self, md: &RootMetadata, bid: BranchId) -> Result<(), Error>;

    /// Deletes an unmerged branch after its resolution has merged.
    async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<(), Error>;

    /// Returns a channel that fires once a merged revision newer than
    /// `curr_rev` exists (immediately, if one already does).
    async fn register_for_update(
        &self,
        tlf: TlfId,
        curr_rev: u64,
    ) -> Result<oneshot::Receiver<()>, Error>;
}

/// Fetches every merged revision after `start` (inclusive), in ascending
/// order, requesting a bounded range at a time.
pub async fn get_merged_updates(
    store: &dyn MetaStore,
    tlf: TlfId,
    start: u64,
) -> Result<Vec<RootMetadata>, Error> {
    let mut updates = Vec::new();
    let mut next = start;
    loop {
        let batch = store
            .get_range(tlf, None, next, next + MAX_MDS_AT_A_TIME - 1)
            .await?;
        let got = batch.len() as u64;
        updates.extend(batch);
        if got < MAX_MDS_AT_A_TIME {
            return Ok(updates);
        }
        next += got;
    }
}

/// Fetches all revisions of an unmerged branch, returning the merged
/// revision the branch forked from plus the branch's revisions in ascending
/// order.
pub async fn get_unmerged_updates(
    store: &dyn MetaStore,
    tlf: TlfId,
    bid: BranchId,
) -> Result<(u64, Vec<RootMetadata>), Error> {
    let rmds = store.get_range(tlf, Some(bid), 0, u64::MAX).await?;
    let branch_point = match rmds.first() {
        Some(first) => first.revision - 1,
        None => return Err(Error::NoSuchBranch(tlf, bid)),
    };
    Ok((branch_point, rmds))
}

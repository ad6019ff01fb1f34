use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::instrument;

use super::MetaStore;
use crate::data::md::REVISION_INITIAL;
use crate::data::RootMetadata;
use crate::ids::{BranchId, MdId, TlfId};
use crate::Error;

/// A revision as stored: its canonical encoding plus the hash the next
/// revision must link to.
struct StoredMd {
    buf: Vec<u8>,
    md_id: MdId,
    revision: u64,
    disk_usage: u64,
}

impl StoredMd {
    fn encode(md: &RootMetadata) -> Result<StoredMd, Error> {
        let buf = bincode::serialize(md)?;
        let md_id = MdId(*blake3::hash(&buf).as_bytes());
        Ok(StoredMd {
            buf,
            md_id,
            revision: md.revision,
            disk_usage: md.disk_usage,
        })
    }

    fn decode(&self) -> Result<RootMetadata, Error> {
        Ok(bincode::deserialize(&self.buf)?)
    }
}

#[derive(Default)]
struct FolderMds {
    /// Merged revisions in order, starting at [REVISION_INITIAL].
    merged: Vec<StoredMd>,
    branches: HashMap<BranchId, Vec<StoredMd>>,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

/// An in-memory metadata store.
#[derive(Default)]
pub struct MemoryMetaStore {
    folders: Mutex<HashMap<TlfId, FolderMds>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    #[instrument(skip(self))]
    async fn get_for_tlf(&self, tlf: TlfId) -> Result<Option<RootMetadata>, Error> {
        let folders = self.folders.lock();
        match folders.get(&tlf).and_then(|f| f.merged.last()) {
            Some(stored) => Ok(Some(stored.decode()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_unmerged_for_tlf(
        &self,
        tlf: TlfId,
        bid: Option<BranchId>,
    ) -> Result<Option<RootMetadata>, Error> {
        let folders = self.folders.lock();
        let folder = match folders.get(&tlf) {
            Some(folder) => folder,
            None => return Ok(None),
        };
        let branch = match bid {
            Some(bid) => folder.branches.get(&bid),
            None => folder.branches.values().next(),
        };
        match branch.and_then(|b| b.last()) {
            Some(stored) => Ok(Some(stored.decode()?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_range(
        &self,
        tlf: TlfId,
        bid: Option<BranchId>,
        start: u64,
        stop: u64,
    ) -> Result<Vec<RootMetadata>, Error> {
        let folders = self.folders.lock();
        let folder = match folders.get(&tlf) {
            Some(folder) => folder,
            None => return Ok(Vec::new()),
        };
        let revisions = match bid {
            Some(bid) => match folder.branches.get(&bid) {
                Some(branch) => branch,
                None => return Ok(Vec::new()),
            },
            None => &folder.merged,
        };
        revisions
            .iter()
            .filter(|stored| stored.revision >= start && stored.revision <= stop)
            .map(StoredMd::decode)
            .collect()
    }

    #[instrument(skip(self, md), fields(tlf = %md.tlf, revision = md.revision))]
    async fn put(&self, md: &RootMetadata) -> Result<(), Error> {
        let mut folders = self.folders.lock();
        let folder = folders.entry(md.tlf).or_default();

        match folder.merged.last() {
            None => {
                if md.revision != REVISION_INITIAL {
                    return Err(Error::ConflictRevision {
                        expected: REVISION_INITIAL,
                        actual: md.revision,
                    });
                }
            }
            Some(head) => {
                if md.revision != head.revision + 1 {
                    return Err(Error::ConflictRevision {
                        expected: head.revision + 1,
                        actual: md.revision,
                    });
                }
                if md.prev_root != head.md_id {
                    return Err(Error::ConflictPrevRoot(md.revision));
                }
                let expected_usage =
                    (head.disk_usage + md.ref_bytes).saturating_sub(md.unref_bytes);
                if md.disk_usage != expected_usage {
                    return Err(Error::ConflictDiskUsage {
                        expected: expected_usage,
                        actual: md.disk_usage,
                    });
                }
            }
        }

        folder.merged.push(StoredMd::encode(md)?);
        let new_rev = md.revision;
        for (rev, tx) in folder.waiters.drain(..).collect::<Vec<_>>() {
            if rev < new_rev {
                let _ = tx.send(());
            } else {
                folder.waiters.push((rev, tx));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, md), fields(tlf = %md.tlf, revision = md.revision, branch = %bid))]
    async fn put_unmerged(&self, md: &RootMetadata, bid: BranchId) -> Result<(), Error> {
        let mut folders = self.folders.lock();
        let folder = folders.entry(md.tlf).or_default();
        let branch = folder.branches.entry(bid).or_default();
        if let Some(head) = branch.last() {
            if md.revision != head.revision + 1 {
                return Err(Error::ConflictRevision {
                    expected: head.revision + 1,
                    actual: md.revision,
                });
            }
        }
        branch.push(StoredMd::encode(md)?);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn prune_branch(&self, tlf: TlfId, bid: BranchId) -> Result<(), Error> {
        let mut folders = self.folders.lock();
        if let Some(folder) = folders.get_mut(&tlf) {
            folder.branches.remove(&bid);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn register_for_update(
        &self,
        tlf: TlfId,
        curr_rev: u64,
    ) -> Result<oneshot::Receiver<()>, Error> {
        let (tx, rx) = oneshot::channel();
        let mut folders = self.folders.lock();
        let folder = folders.entry(tlf).or_default();
        let head_rev = folder.merged.last().map(|s| s.revision).unwrap_or(0);
        if head_rev > curr_rev {
            let _ = tx.send(());
        } else {
            folder.waiters.push((curr_rev, tx));
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::LocalCrypto;
    use crate::fixtures::{test_md, test_tlf};

    #[tokio::test]
    async fn put_and_get_head() {
        let store = MemoryMetaStore::new();
        let md = test_md(REVISION_INITIAL);
        store.put(&md).await.unwrap();
        let head = store.get_for_tlf(test_tlf()).await.unwrap().unwrap();
        assert_eq!(head.revision, REVISION_INITIAL);
    }

    #[tokio::test]
    async fn put_detects_revision_conflict() {
        let store = MemoryMetaStore::new();
        let md = test_md(REVISION_INITIAL);
        store.put(&md).await.unwrap();
        let err = store.put(&md).await.unwrap_err();
        assert!(err.is_revision_conflict());
    }

    #[tokio::test]
    async fn put_detects_prev_root_conflict() {
        let crypto = LocalCrypto::default();
        let store = MemoryMetaStore::new();
        let md = test_md(REVISION_INITIAL);
        store.put(&md).await.unwrap();

        let mut succ = md.make_successor(&crypto).unwrap();
        succ.prev_root = MdId([9; 32]);
        let err = store.put(&succ).await.unwrap_err();
        assert!(matches!(err, Error::ConflictPrevRoot(_)));
    }

    #[tokio::test]
    async fn register_fires_on_newer_revision() {
        let crypto = LocalCrypto::default();
        let store = MemoryMetaStore::new();
        let md = test_md(REVISION_INITIAL);
        store.put(&md).await.unwrap();

        let rx = store
            .register_for_update(test_tlf(), REVISION_INITIAL)
            .await
            .unwrap();
        let succ = md.make_successor(&crypto).unwrap();
        store.put(&succ).await.unwrap();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn register_fires_immediately_when_behind() {
        let store = MemoryMetaStore::new();
        store.put(&test_md(REVISION_INITIAL)).await.unwrap();
        let rx = store.register_for_update(test_tlf(), 0).await.unwrap();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn unmerged_branches_are_separate_and_prunable() {
        let store = MemoryMetaStore::new();
        let bid = BranchId([3; 16]);
        let mut md = test_md(REVISION_INITIAL);
        md.branch_id = bid;
        store.put_unmerged(&md, bid).await.unwrap();

        assert!(store.get_for_tlf(test_tlf()).await.unwrap().is_none());
        let head = store
            .get_unmerged_for_tlf(test_tlf(), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.branch_id, bid);

        store.prune_branch(test_tlf(), bid).await.unwrap();
        assert!(store
            .get_unmerged_for_tlf(test_tlf(), Some(bid))
            .await
            .unwrap()
            .is_none());
    }
}

//! Leveled locks with runtime hierarchy checking.
//!
//! The engine's three locks have fixed levels: `mdWriterLock (1)` <
//! `headLock (2)` < `blockLock (3)`. Every execution flow carries a
//! [LockState]; acquiring a lock of level L while any lock of level >= L is
//! held on the same flow panics immediately, turning ordering bugs into loud
//! failures instead of deadlocks.
//!
//! Guards release their level on drop, so the held set always mirrors the
//! RAII scopes. Guards may be held across await points (the locks are
//! `tokio::sync` underneath).

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub const LEVEL_MD_WRITER: u8 = 1;
pub const LEVEL_HEAD: u8 = 2;
pub const LEVEL_BLOCK: u8 = 3;

fn level_name(level: u8) -> &'static str {
    match level {
        LEVEL_MD_WRITER => "mdWriterLock",
        LEVEL_HEAD => "headLock",
        LEVEL_BLOCK => "blockLock",
        _ => "unknownLock",
    }
}

/// Tracks which lock levels one execution flow currently holds. Every public
/// engine method makes a fresh one near its top and threads it through all
/// helpers that may take any of the leveled locks.
#[derive(Default)]
pub struct LockState {
    held: AtomicU8,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, level: u8) {
        let held = self.held.load(Ordering::Acquire);
        let conflicting = held & !((1u8 << level) - 1);
        if conflicting != 0 {
            let worst = (level..8).find(|l| conflicting & (1 << l) != 0).unwrap_or(level);
            panic!(
                "lock hierarchy violation: acquiring {} (level {}) while holding {} (level {})",
                level_name(level),
                level,
                level_name(worst),
                worst
            );
        }
        self.held.fetch_or(1 << level, Ordering::AcqRel);
    }

    fn release(&self, level: u8) {
        self.held.fetch_and(!(1u8 << level), Ordering::AcqRel);
    }

    pub fn holds(&self, level: u8) -> bool {
        self.held.load(Ordering::Acquire) & (1 << level) != 0
    }
}

/// A mutex with a fixed level in the hierarchy.
pub struct LeveledMutex<T> {
    level: u8,
    inner: Mutex<T>,
}

impl<T> LeveledMutex<T> {
    pub fn new(level: u8, value: T) -> Self {
        LeveledMutex {
            level,
            inner: Mutex::new(value),
        }
    }

    pub async fn lock<'a>(&'a self, ls: &'a LockState) -> LeveledMutexGuard<'a, T> {
        ls.acquire(self.level);
        LeveledMutexGuard {
            guard: self.inner.lock().await,
            ls,
            level: self.level,
        }
    }
}

pub struct LeveledMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    ls: &'a LockState,
    level: u8,
}

impl<T> Drop for LeveledMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.ls.release(self.level);
    }
}

impl<T> Deref for LeveledMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A read-write lock with a fixed level in the hierarchy.
pub struct LeveledRwLock<T> {
    level: u8,
    inner: RwLock<T>,
}

impl<T> LeveledRwLock<T> {
    pub fn new(level: u8, value: T) -> Self {
        LeveledRwLock {
            level,
            inner: RwLock::new(value),
        }
    }

    pub async fn read<'a>(&'a self, ls: &'a LockState) -> LeveledReadGuard<'a, T> {
        ls.acquire(self.level);
        LeveledReadGuard {
            guard: self.inner.read().await,
            ls,
            level: self.level,
        }
    }

    pub async fn write<'a>(&'a self, ls: &'a LockState) -> LeveledWriteGuard<'a, T> {
        ls.acquire(self.level);
        LeveledWriteGuard {
            guard: self.inner.write().await,
            ls,
            level: self.level,
        }
    }
}

pub struct LeveledReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    ls: &'a LockState,
    level: u8,
}

impl<T> Drop for LeveledReadGuard<'_, T> {
    fn drop(&mut self) {
        self.ls.release(self.level);
    }
}

impl<T> Deref for LeveledReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

pub struct LeveledWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    ls: &'a LockState,
    level: u8,
}

impl<T> Drop for LeveledWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.ls.release(self.level);
    }
}

impl<T> Deref for LeveledWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// The block lock: a leveled rwlock whose read guard can be released across
/// a blocking call and reacquired afterwards.
pub struct BlockLock<T> {
    inner: LeveledRwLock<T>,
}

/// A read or write guard on the block lock. Helpers that work under either
/// mode take this, so the same code path serves lookups (read) and mutations
/// (write).
pub enum BlockGuard<'a, T> {
    Read(LeveledReadGuard<'a, T>),
    Write(LeveledWriteGuard<'a, T>),
}

impl<T> BlockGuard<'_, T> {
    pub fn state(&self) -> &T {
        match self {
            BlockGuard::Read(g) => g,
            BlockGuard::Write(g) => g,
        }
    }

    /// The mutable view; only available under a write guard.
    pub fn state_mut(&mut self) -> Option<&mut T> {
        match self {
            BlockGuard::Read(_) => None,
            BlockGuard::Write(g) => Some(&mut *g),
        }
    }
}

impl<T> BlockLock<T> {
    pub fn new(value: T) -> Self {
        BlockLock {
            inner: LeveledRwLock::new(LEVEL_BLOCK, value),
        }
    }

    pub async fn read<'a>(&'a self, ls: &'a LockState) -> BlockGuard<'a, T> {
        BlockGuard::Read(self.inner.read(ls).await)
    }

    pub async fn write<'a>(&'a self, ls: &'a LockState) -> BlockGuard<'a, T> {
        BlockGuard::Write(self.inner.write(ls).await)
    }

    /// Runs `fut` with the lock released if `guard` is a read guard,
    /// reacquiring afterwards; under a write guard the future runs while
    /// still holding the lock. Writers must stay exclusive for their whole
    /// critical section, but a reader blocked on the network shouldn't stall
    /// independent readers.
    pub async fn unlocked_if_read<'a, R>(
        &'a self,
        ls: &'a LockState,
        guard: BlockGuard<'a, T>,
        fut: impl Future<Output = R>,
    ) -> (BlockGuard<'a, T>, R) {
        match guard {
            BlockGuard::Read(g) => {
                drop(g);
                let result = fut.await;
                (self.read(ls).await, result)
            }
            BlockGuard::Write(g) => {
                let result = fut.await;
                (BlockGuard::Write(g), result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ordered_acquisition_succeeds() {
        let ls = LockState::new();
        let writer = LeveledMutex::new(LEVEL_MD_WRITER, ());
        let head = LeveledRwLock::new(LEVEL_HEAD, ());
        let block = BlockLock::new(());

        let _w = writer.lock(&ls).await;
        let _h = head.write(&ls).await;
        let _b = block.read(&ls).await;
        assert!(ls.holds(LEVEL_MD_WRITER));
        assert!(ls.holds(LEVEL_HEAD));
        assert!(ls.holds(LEVEL_BLOCK));
    }

    #[tokio::test]
    async fn guards_release_their_level() {
        let ls = LockState::new();
        let head = LeveledRwLock::new(LEVEL_HEAD, ());
        {
            let _h = head.read(&ls).await;
            assert!(ls.holds(LEVEL_HEAD));
        }
        assert!(!ls.holds(LEVEL_HEAD));
        // reacquiring after release is fine
        let _h = head.read(&ls).await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock hierarchy violation")]
    async fn acquiring_lower_level_while_holding_higher_panics() {
        let ls = LockState::new();
        let writer = LeveledMutex::new(LEVEL_MD_WRITER, ());
        let block = BlockLock::new(());

        let _b = block.read(&ls).await;
        let _w = writer.lock(&ls).await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock hierarchy violation")]
    async fn reacquiring_same_level_panics() {
        let ls = LockState::new();
        let head = LeveledRwLock::new(LEVEL_HEAD, ());
        let _a = head.read(&ls).await;
        let _b = head.read(&ls).await;
    }

    #[tokio::test]
    async fn separate_flows_do_not_interfere() {
        let head = LeveledRwLock::new(LEVEL_HEAD, ());
        let ls1 = LockState::new();
        let ls2 = LockState::new();
        let _a = head.read(&ls1).await;
        let _b = head.read(&ls2).await;
    }

    #[tokio::test]
    async fn unlocked_if_read_releases_and_reacquires() {
        let ls = LockState::new();
        let block = BlockLock::new(());
        let guard = block.read(&ls).await;
        let (guard, value) = block
            .unlocked_if_read(&ls, guard, async {
                // the level is free while the future runs
                42
            })
            .await;
        assert!(matches!(guard, BlockGuard::Read(_)));
        assert_eq!(value, 42);
        assert!(ls.holds(LEVEL_BLOCK));
    }

    #[tokio::test]
    async fn unlocked_if_read_keeps_write_guard() {
        let ls = LockState::new();
        let block = BlockLock::new(5u32);
        let guard = block.write(&ls).await;
        let (mut guard, _) = block.unlocked_if_read(&ls, guard, async { () }).await;
        *guard.state_mut().unwrap() = 6;
        assert_eq!(*guard.state(), 6);
    }
}

//! Named mutexes with a fixed acquisition order.
//!
//! The writer coordinates through a handful of coarse locks. Each one is a
//! [`RankedMutex`] carrying a [`LockRank`]; a thread may only acquire a lock
//! whose rank is strictly greater than every rank it already holds. Debug
//! builds check this on every acquisition and panic on a violation, so an
//! ordering mistake shows up in the first test that exercises the path
//! rather than as a rare deadlock.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Acquisition order of the writer's locks, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// Serializes prepare/commit/close.
    Commit = 10,
    /// Serializes full flushes against snapshot opening and delete-all.
    FullFlush = 20,
    /// The in-memory document buffer.
    Documents = 30,
    /// Catalog, merge bookkeeping and reader pool membership.
    Engine = 40,
    /// The buffered updates stream.
    UpdatesStream = 50,
}

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

fn check_acquire(rank: LockRank) {
    if cfg!(debug_assertions) {
        HELD.with(|held| {
            let held = held.borrow();
            if let Some(top) = held.iter().max() {
                assert!(
                    *top < rank,
                    "lock order violation: acquiring {rank:?} while holding {held:?}"
                );
            }
        });
    }
}

fn push_rank(rank: LockRank) {
    HELD.with(|held| held.borrow_mut().push(rank));
}

fn pop_rank(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

/// Ranks held by the current thread, in acquisition order.
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

/// Whether the current thread holds a lock of the given rank.
pub fn holds(rank: LockRank) -> bool {
    HELD.with(|held| held.borrow().contains(&rank))
}

/// A `parking_lot::Mutex` tagged with its place in the lock order.
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        RankedMutex {
            rank,
            inner: Mutex::new(value),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Acquire the lock, checking the acquisition order first.
    pub fn lock(&self) -> RankedGuard<'_, T> {
        check_acquire(self.rank);
        let guard = self.inner.lock();
        push_rank(self.rank);
        RankedGuard {
            rank: self.rank,
            guard,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex")
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Guard returned by [`RankedMutex::lock`].
pub struct RankedGuard<'a, T> {
    rank: LockRank,
    guard: MutexGuard<'a, T>,
}

impl<T> RankedGuard<'_, T> {
    /// Block on `condvar`, releasing the lock while waiting.
    ///
    /// The rank stays registered for the current thread: it cannot acquire
    /// anything while parked.
    pub fn wait(&mut self, condvar: &Condvar) {
        condvar.wait(&mut self.guard);
    }

    /// Like [`wait`](Self::wait) with an upper bound. Returns true on timeout.
    pub fn wait_for(&mut self, condvar: &Condvar, timeout: Duration) -> bool {
        condvar.wait_for(&mut self.guard, timeout).timed_out()
    }
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

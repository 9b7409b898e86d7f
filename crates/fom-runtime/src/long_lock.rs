//! Long lock: a reader/writer lock FOMs can hold across many transitions
//!
//! Acquisition never blocks the handler thread. A FOM that cannot take the
//! lock is queued and returns `Wait`; when the lock is granted to it, its
//! phase is set to the requested `next_phase` and it is made READY.
//!
//! ```ignore
//! fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
//!     match ctx.phase() {
//!         PH_LOCK => LongLock::tick_outcome(self.lock.write_lock(ctx, &self.link, PH_LOCKED)),
//!         PH_LOCKED => {
//!             // ... exclusive access ...
//!             self.lock.write_unlock(ctx, &self.link);
//!             ctx.set_phase(Phase::FINISH);
//!             TickOutcome::Wait
//!         }
//!         _ => unreachable!(),
//!     }
//! }
//! ```
//!
//! Waiters are granted in arrival order. A run of queued readers is granted
//! together; new readers queue behind a waiting writer.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use fom_core::{FomId, Phase, TickOutcome};
use parking_lot::Mutex;
use tracing::trace;

use crate::domain::DomainHandle;
use crate::fom::FomContext;

/// Read or write ownership
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRole {
    Idle,
    Waiting(LockKind),
    Owner(LockKind),
}

/// Per-FOM membership in one [`LongLock`]
///
/// A link belongs to one FOM and takes part in at most one lock request at
/// a time.
#[derive(Clone)]
pub struct LockLink {
    role: Arc<Mutex<LinkRole>>,
}

impl LockLink {
    pub fn new() -> Self {
        Self {
            role: Arc::new(Mutex::new(LinkRole::Idle)),
        }
    }

    fn role(&self) -> LinkRole {
        *self.role.lock()
    }

    fn set_role(&self, role: LinkRole) {
        *self.role.lock() = role;
    }

    /// Kind of ownership held through this link, if any
    pub fn owns(&self) -> Option<LockKind> {
        match self.role() {
            LinkRole::Owner(kind) => Some(kind),
            _ => None,
        }
    }

    /// True while queued for the lock
    pub fn is_waiting(&self) -> bool {
        matches!(self.role(), LinkRole::Waiting(_))
    }
}

impl Default for LockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockLink").field(&self.role()).finish()
    }
}

/// Owner bookkeeping and FIFO of waiters, independent of how waiters are
/// woken
#[derive(Debug)]
struct Grants<W> {
    readers: usize,
    writer: bool,
    waiters: VecDeque<(LockKind, W)>,
}

impl<W> Grants<W> {
    fn new() -> Self {
        Self {
            readers: 0,
            writer: false,
            waiters: VecDeque::new(),
        }
    }

    /// Take the lock now, or queue `waiter`; true when taken
    fn acquire(&mut self, kind: LockKind, waiter: W) -> bool {
        let free = !self.writer && self.waiters.is_empty();
        let taken = match kind {
            LockKind::Read => free,
            LockKind::Write => free && self.readers == 0,
        };
        if !taken {
            self.waiters.push_back((kind, waiter));
            return false;
        }
        match kind {
            LockKind::Read => self.readers += 1,
            LockKind::Write => self.writer = true,
        }
        true
    }

    /// Drop one ownership of `kind` and return the waiters now granted
    fn release(&mut self, kind: LockKind) -> Vec<(LockKind, W)> {
        match kind {
            LockKind::Read => {
                assert!(self.readers > 0, "read unlock of a lock not read-locked");
                self.readers -= 1;
            }
            LockKind::Write => {
                assert!(self.writer, "write unlock of a lock not write-locked");
                self.writer = false;
            }
        }

        let mut granted = Vec::new();
        while let Some((kind, _)) = self.waiters.front() {
            match kind {
                LockKind::Write if self.readers == 0 && !self.writer => {
                    self.writer = true;
                }
                LockKind::Read if !self.writer => {
                    self.readers += 1;
                }
                _ => break,
            }
            if let Some(grant) = self.waiters.pop_front() {
                granted.push(grant);
            }
            if self.writer {
                break;
            }
        }
        granted
    }
}

struct Waiter {
    fom: FomId,
    link: LockLink,
    next_phase: Phase,
}

/// Non-blocking reader/writer lock for FOMs
pub struct LongLock {
    grants: Mutex<Grants<Waiter>>,
}

impl LongLock {
    pub fn new() -> Self {
        Self {
            grants: Mutex::new(Grants::new()),
        }
    }

    /// Outcome for a tick that just tried to take the lock
    #[inline]
    pub const fn tick_outcome(acquired: bool) -> TickOutcome {
        TickOutcome::from_progress(acquired)
    }

    /// Take the lock for reading
    ///
    /// On success the phase is already `next_phase`. Otherwise the FOM is
    /// queued and must return `Wait`; it is moved to `next_phase` and woken
    /// once the lock is granted.
    ///
    /// # Panics
    ///
    /// If `link` already owns or waits for a lock.
    pub fn read_lock(&self, ctx: &mut FomContext<'_>, link: &LockLink, next_phase: Phase) -> bool {
        self.lock(ctx, link, LockKind::Read, next_phase)
    }

    /// Take the lock for writing; see [`read_lock`](Self::read_lock)
    pub fn write_lock(&self, ctx: &mut FomContext<'_>, link: &LockLink, next_phase: Phase) -> bool {
        self.lock(ctx, link, LockKind::Write, next_phase)
    }

    pub fn read_unlock(&self, ctx: &mut FomContext<'_>, link: &LockLink) {
        self.unlock(&ctx.domain(), link, LockKind::Read);
    }

    pub fn write_unlock(&self, ctx: &mut FomContext<'_>, link: &LockLink) {
        self.unlock(&ctx.domain(), link, LockKind::Write);
    }

    /// True iff `link` holds this lock for reading
    pub fn is_read_locked(&self, link: &LockLink) -> bool {
        link.owns() == Some(LockKind::Read)
    }

    /// True iff `link` holds this lock for writing
    pub fn is_write_locked(&self, link: &LockLink) -> bool {
        link.owns() == Some(LockKind::Write)
    }

    /// FOMs currently queued for the lock
    pub fn waiters(&self) -> usize {
        self.grants.lock().waiters.len()
    }

    /// Number of read owners
    pub fn readers(&self) -> usize {
        self.grants.lock().readers
    }

    fn lock(&self, ctx: &mut FomContext<'_>, link: &LockLink, kind: LockKind, next_phase: Phase) -> bool {
        let fom = ctx.id();
        assert!(
            link.role() == LinkRole::Idle,
            "fom {fom}: long lock link already in use ({:?})",
            link.role()
        );
        let waiter = Waiter {
            fom,
            link: link.clone(),
            next_phase,
        };

        let mut grants = self.grants.lock();
        if grants.acquire(kind, waiter) {
            link.set_role(LinkRole::Owner(kind));
            drop(grants);
            ctx.set_phase(next_phase);
            true
        } else {
            link.set_role(LinkRole::Waiting(kind));
            trace!(fom = %fom, ?kind, "long lock contended");
            false
        }
    }

    fn unlock(&self, domain: &DomainHandle, link: &LockLink, kind: LockKind) {
        assert!(
            link.role() == LinkRole::Owner(kind),
            "long lock {kind:?} unlock through a link in role {:?}",
            link.role()
        );
        link.set_role(LinkRole::Idle);

        let granted = self.grants.lock().release(kind);
        for (kind, waiter) in granted {
            waiter.link.set_role(LinkRole::Owner(kind));
            let next_phase = waiter.next_phase;
            trace!(fom = %waiter.fom, ?kind, "long lock granted");
            domain.post(waiter.fom, move |ctx| {
                ctx.set_phase(next_phase);
                ctx.ready();
            });
        }
    }
}

impl Default for LongLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LongLock {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let grants = self.grants.get_mut();
        debug_assert!(
            grants.readers == 0 && !grants.writer,
            "long lock dropped while held"
        );
    }
}

impl fmt::Debug for LongLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let grants = self.grants.lock();
        f.debug_struct("LongLock")
            .field("readers", &grants.readers)
            .field("writer", &grants.writer)
            .field("waiters", &grants.waiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_readers_share() {
        let mut g = Grants::new();
        assert!(g.acquire(LockKind::Read, 1));
        assert!(g.acquire(LockKind::Read, 2));
        assert_eq!(g.readers, 2);
        assert!(g.release(LockKind::Read).is_empty());
    }

    #[test]
    fn test_writer_excludes() {
        let mut g = Grants::new();
        assert!(g.acquire(LockKind::Write, 1));
        assert!(!g.acquire(LockKind::Read, 2));
        assert!(!g.acquire(LockKind::Write, 3));
        let granted = g.release(LockKind::Write);
        assert_eq!(granted, vec![(LockKind::Read, 2)]);
        assert_eq!(g.release(LockKind::Read), vec![(LockKind::Write, 3)]);
        assert!(g.writer);
    }

    #[test]
    fn test_readers_queue_behind_writer() {
        let mut g = Grants::new();
        assert!(g.acquire(LockKind::Read, 1));
        assert!(!g.acquire(LockKind::Write, 2));
        assert!(!g.acquire(LockKind::Read, 3));
        assert!(!g.acquire(LockKind::Read, 4));

        assert_eq!(g.release(LockKind::Read), vec![(LockKind::Write, 2)]);
        assert_eq!(
            g.release(LockKind::Write),
            vec![(LockKind::Read, 3), (LockKind::Read, 4)]
        );
        assert_eq!(g.readers, 2);
    }

    #[test]
    #[should_panic(expected = "not write-locked")]
    fn test_unbalanced_unlock() {
        let mut g: Grants<()> = Grants::new();
        g.release(LockKind::Write);
    }

    #[test]
    fn test_link_roles() {
        let link = LockLink::new();
        assert_eq!(link.owns(), None);
        link.set_role(LinkRole::Waiting(LockKind::Read));
        assert!(link.is_waiting());
        link.set_role(LinkRole::Owner(LockKind::Write));
        let lock = LongLock::new();
        assert!(lock.is_write_locked(&link));
        assert!(!lock.is_read_locked(&link));
        link.set_role(LinkRole::Idle);
    }

    fn kind() -> impl Strategy<Value = LockKind> {
        prop_oneof![Just(LockKind::Read), Just(LockKind::Write)]
    }

    proptest! {
        /// Every request is eventually granted, in arrival order, and a
        /// writer never overlaps another owner.
        #[test]
        fn grants_are_fifo_and_exclusive(reqs in prop::collection::vec(kind(), 1..40)) {
            let mut g = Grants::new();
            let mut owners: VecDeque<(LockKind, usize)> = VecDeque::new();
            let mut order = Vec::new();

            for (i, kind) in reqs.iter().copied().enumerate() {
                if g.acquire(kind, i) {
                    owners.push_back((kind, i));
                    order.push(i);
                }
            }
            while let Some((kind, _)) = owners.pop_front() {
                for (k, w) in g.release(kind) {
                    owners.push_back((k, w));
                    order.push(w);
                }
                let writers = owners.iter().filter(|(k, _)| *k == LockKind::Write).count();
                prop_assert!(writers <= 1);
                prop_assert!(writers == 0 || owners.len() == 1);
                prop_assert_eq!(g.readers + usize::from(g.writer), owners.len());
            }

            prop_assert_eq!(order, (0..reqs.len()).collect::<Vec<_>>());
            prop_assert!(g.waiters.is_empty());
        }
    }
}

//! Callbacks and signal sources
//!
//! A [`Callback`] is armed on a [`Chan`] (or a timer) on behalf of a waiting
//! FOM. When the source fires, the optional top-half runs right away in the
//! signalling thread and may discard the event. Otherwise the callback is
//! posted to the FOM's home locality as an AST, where the bottom-half runs
//! under the group lock, never concurrently with the FOM's own transitions.
//!
//! # State word
//!
//! State and arming epoch share one `AtomicU64` so that every transition is a
//! single CAS:
//!
//! ```text
//!  63                                        3 2     0
//! ┌───────────────────────────────────────────┬───────┐
//! │                  epoch                    │ state │
//! └───────────────────────────────────────────┴───────┘
//!
//! UNARMED ─arm─► ARMED ─fire─► FIRING ─► PENDING ─deliver─► BOTTOM ─► DONE
//!                  ▲             │          │
//!                  └──filtered───┘          │
//!   ARMED | PENDING ───────cancel───────────┴─────────────────► CANCELLED
//! ```
//!
//! Cancel never needs a group lock: a pending delivery is stopped by the
//! CAS to CANCELLED, and a bottom-half that already started is waited out.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use fom_core::FomId;
use parking_lot::Mutex;

use crate::ast::Ast;
use crate::fom::AstContext;
use crate::locality::Locality;
use crate::tls;

const STATE_BITS: u32 = 3;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

const UNARMED: u64 = 0;
const ARMED: u64 = 1;
const FIRING: u64 = 2;
const PENDING: u64 = 3;
const BOTTOM: u64 = 4;
const DONE: u64 = 5;
const CANCELLED: u64 = 6;

#[inline]
const fn pack(epoch: u64, state: u64) -> u64 {
    (epoch << STATE_BITS) | state
}

#[inline]
const fn unpack(word: u64) -> (u64, u64) {
    (word >> STATE_BITS, word & STATE_MASK)
}

/// Observable state of a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackState {
    Unarmed,
    /// Waiting for its source to fire
    Armed,
    /// Top-half running in the signalling thread
    Firing,
    /// Posted to the home locality, bottom-half not yet run
    Pending,
    /// Bottom-half running
    Bottom,
    Done,
    Cancelled,
}

impl CallbackState {
    fn from_bits(state: u64) -> Self {
        match state {
            ARMED => CallbackState::Armed,
            FIRING => CallbackState::Firing,
            PENDING => CallbackState::Pending,
            BOTTOM => CallbackState::Bottom,
            DONE => CallbackState::Done,
            CANCELLED => CallbackState::Cancelled,
            _ => CallbackState::Unarmed,
        }
    }
}

/// Result of cancelling a callback or timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The bottom-half will never run for this arming
    Prevented,
    /// The bottom-half already ran to completion
    AlreadyDone,
    /// Nothing was armed
    NotArmed,
}

/// Result of firing one armed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FireOutcome {
    Posted,
    Filtered,
    /// The entry belongs to an old arming or was cancelled
    Stale,
}

type TopHalf = Box<dyn Fn() -> bool + Send + Sync>;
type BottomHalf = Box<dyn FnMut(&mut AstContext<'_>) + Send>;

#[derive(Clone)]
struct Target {
    fom: FomId,
    locality: Weak<Locality>,
}

pub(crate) struct CallbackInner {
    word: AtomicU64,
    top: Option<TopHalf>,
    bottom: Mutex<BottomHalf>,
    target: Mutex<Option<Target>>,
    /// Lock key of the target locality, 0 when never armed
    target_key: AtomicUsize,
}

impl CallbackInner {
    #[inline]
    fn load(&self) -> (u64, u64) {
        unpack(self.word.load(Ordering::Acquire))
    }

    #[inline]
    fn transition(&self, epoch: u64, from: u64, to: u64) -> bool {
        self.word
            .compare_exchange(
                pack(epoch, from),
                pack(epoch, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// An entry for `epoch` can still fire; a firing top-half may yet
    /// filter the event and leave the callback armed
    #[inline]
    fn may_fire(&self, epoch: u64) -> bool {
        let (current, state) = self.load();
        current == epoch && matches!(state, ARMED | FIRING)
    }

    /// Arm for `fom`, returning the new epoch
    ///
    /// # Panics
    ///
    /// If the callback is already armed or a delivery is outstanding.
    pub(crate) fn arm(&self, fom: FomId, locality: &Locality) -> u64 {
        let (epoch, state) = self.load();
        assert!(
            matches!(state, UNARMED | BOTTOM | DONE | CANCELLED),
            "callback armed twice (state {:?})",
            CallbackState::from_bits(state)
        );
        *self.target.lock() = Some(Target {
            fom,
            locality: locality.weak(),
        });
        self.target_key.store(locality.key(), Ordering::Release);

        let next = epoch.wrapping_add(1) & (u64::MAX >> STATE_BITS);
        let armed = self.word.compare_exchange(
            pack(epoch, state),
            pack(next, ARMED),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(armed.is_ok(), "callback armed concurrently");
        next
    }

    /// Fire the arming `epoch`: run the top-half, post the bottom-half
    pub(crate) fn fire(self: &Arc<Self>, epoch: u64) -> FireOutcome {
        if !self.transition(epoch, ARMED, FIRING) {
            return FireOutcome::Stale;
        }

        let relevant = self.top.as_ref().map_or(true, |top| top());
        if !relevant {
            self.word.store(pack(epoch, ARMED), Ordering::Release);
            return FireOutcome::Filtered;
        }

        let target = self.target.lock().clone();
        self.word.store(pack(epoch, PENDING), Ordering::Release);

        match target.and_then(|t| t.locality.upgrade().map(|loc| (t.fom, loc))) {
            Some((fom, loc)) => {
                loc.post(Ast::Callback {
                    cb: Arc::clone(self),
                    fom,
                    epoch,
                });
                FireOutcome::Posted
            }
            None => {
                self.transition(epoch, PENDING, CANCELLED);
                FireOutcome::Stale
            }
        }
    }

    /// Claim the delivery of `epoch`; false when it was cancelled meanwhile
    pub(crate) fn begin_bottom(&self, epoch: u64) -> bool {
        self.transition(epoch, PENDING, BOTTOM)
    }

    /// Run the bottom-half claimed by [`begin_bottom`](Self::begin_bottom)
    pub(crate) fn run_bottom(&self, epoch: u64, ctx: &mut AstContext<'_>) {
        {
            let mut bottom = self.bottom.lock();
            (*bottom)(ctx);
        }
        // a bottom-half that re-armed itself already moved to a new epoch
        self.transition(epoch, BOTTOM, DONE);
    }

    /// Drop a delivery whose FOM is gone
    pub(crate) fn abandon(&self, epoch: u64) {
        self.transition(epoch, PENDING, CANCELLED);
    }

    pub(crate) fn cancel(&self) -> CancelOutcome {
        let mut spins = 0u32;
        loop {
            let (epoch, state) = self.load();
            match state {
                UNARMED | CANCELLED => return CancelOutcome::NotArmed,
                DONE => return CancelOutcome::AlreadyDone,
                ARMED | PENDING => {
                    if self.transition(epoch, state, CANCELLED) {
                        return CancelOutcome::Prevented;
                    }
                    continue;
                }
                BOTTOM if tls::holds(self.target_key.load(Ordering::Acquire)) => {
                    // the bottom-half is running on this very thread
                    return CancelOutcome::AlreadyDone;
                }
                _ => {}
            }

            // FIRING or BOTTOM elsewhere: both are short
            spins = spins.wrapping_add(1);
            if spins < 64 {
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn epoch(&self) -> u64 {
        self.load().0
    }
}

/// Two-phase callback armed on behalf of a waiting FOM
///
/// Cloning yields another handle to the same callback.
#[derive(Clone)]
pub struct Callback {
    pub(crate) inner: Arc<CallbackInner>,
}

impl Callback {
    /// Callback with only a bottom-half
    pub fn new<B>(bottom: B) -> Self
    where
        B: FnMut(&mut AstContext<'_>) + Send + 'static,
    {
        Self::build(None, Box::new(bottom))
    }

    /// Callback whose top-half may discard irrelevant events
    ///
    /// The top-half runs in the signalling thread, possibly concurrently
    /// with the FOM's transitions. It must not block and must not touch
    /// FOM or locality state. Returning `false` discards the event and
    /// leaves the callback armed.
    pub fn with_top<T, B>(top: T, bottom: B) -> Self
    where
        T: Fn() -> bool + Send + Sync + 'static,
        B: FnMut(&mut AstContext<'_>) + Send + 'static,
    {
        Self::build(Some(Box::new(top)), Box::new(bottom))
    }

    /// Callback whose bottom-half only makes the FOM ready
    pub fn wakeup() -> Self {
        Self::new(|ctx| ctx.ready())
    }

    fn build(top: Option<TopHalf>, bottom: BottomHalf) -> Self {
        Self {
            inner: Arc::new(CallbackInner {
                word: AtomicU64::new(pack(0, UNARMED)),
                top,
                bottom: Mutex::new(bottom),
                target: Mutex::new(None),
                target_key: AtomicUsize::new(0),
            }),
        }
    }

    /// Cancel the current arming
    ///
    /// Once this returns, the bottom-half cannot start for that arming: it
    /// either already completed ([`CancelOutcome::AlreadyDone`]) or never
    /// will ([`CancelOutcome::Prevented`]). Callable from any thread except
    /// from inside this callback's own top-half.
    pub fn cancel(&self) -> CancelOutcome {
        self.inner.cancel()
    }

    pub fn state(&self) -> CallbackState {
        CallbackState::from_bits(self.inner.load().1)
    }

    /// True while a firing of the current arming is still possible
    pub fn is_armed(&self) -> bool {
        matches!(
            self.state(),
            CallbackState::Armed | CallbackState::Firing | CallbackState::Pending
        )
    }

    /// FOM of the latest arming
    pub fn target(&self) -> Option<FomId> {
        self.inner.target.lock().as_ref().map(|t| t.fom)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("state", &self.state())
            .field("epoch", &self.inner.epoch())
            .field("target", &self.target())
            .finish()
    }
}

struct ChanEntry {
    cb: Arc<CallbackInner>,
    epoch: u64,
}

/// Entries kept before the first prune
const PRUNE_MIN: usize = 16;

#[derive(Default)]
struct Waiters {
    entries: VecDeque<ChanEntry>,
    /// Length at which `add` next drops stale entries
    prune_at: usize,
}

impl Waiters {
    fn push(&mut self, entry: ChanEntry) {
        if self.entries.len() >= self.prune_at {
            self.entries.retain(|e| e.cb.may_fire(e.epoch));
            self.prune_at = PRUNE_MIN.max(2 * self.entries.len());
        }
        self.entries.push_back(entry);
    }
}

/// Signal source callbacks are armed on
///
/// Entries of cancelled or re-armed callbacks are dropped when the source
/// fires, or by `add` once the list has doubled since the last prune, so
/// arming and cancelling without signals keeps the list bounded.
#[derive(Default)]
pub struct Chan {
    waiters: Mutex<Waiters>,
}

impl Chan {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, cb: Arc<CallbackInner>, epoch: u64) {
        self.waiters.lock().push(ChanEntry { cb, epoch });
    }

    /// Fire the oldest armed callback that accepts the event
    ///
    /// Callbacks whose top-half filters the event stay armed in place.
    /// Returns whether a bottom-half was posted.
    pub fn signal(&self) -> bool {
        let mut skipped = Vec::new();
        let mut posted = false;
        loop {
            let Some(entry) = self.waiters.lock().entries.pop_front() else {
                break;
            };
            match entry.cb.fire(entry.epoch) {
                FireOutcome::Posted => {
                    posted = true;
                    break;
                }
                FireOutcome::Filtered => skipped.push(entry),
                FireOutcome::Stale => {}
            }
        }
        if !skipped.is_empty() {
            let mut waiters = self.waiters.lock();
            for entry in skipped.into_iter().rev() {
                waiters.entries.push_front(entry);
            }
        }
        posted
    }

    /// Fire every armed callback; returns how many bottom-halves were posted
    pub fn broadcast(&self) -> usize {
        let entries: Vec<ChanEntry> = self.waiters.lock().entries.drain(..).collect();
        let mut kept = Vec::new();
        let mut posted = 0;
        for entry in entries {
            match entry.cb.fire(entry.epoch) {
                FireOutcome::Posted => posted += 1,
                FireOutcome::Filtered => kept.push(entry),
                FireOutcome::Stale => {}
            }
        }
        if !kept.is_empty() {
            let mut waiters = self.waiters.lock();
            for entry in kept.into_iter().rev() {
                waiters.entries.push_front(entry);
            }
        }
        posted
    }

    /// Number of entries, including ones not yet found stale
    pub fn len(&self) -> usize {
        self.waiters.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Chan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chan").field("entries", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_roundtrip() {
        assert_eq!(unpack(pack(7, PENDING)), (7, PENDING));
        assert_eq!(unpack(pack(0, UNARMED)), (0, UNARMED));
    }

    #[test]
    fn test_cancel_unarmed() {
        let cb = Callback::wakeup();
        assert_eq!(cb.state(), CallbackState::Unarmed);
        assert_eq!(cb.cancel(), CancelOutcome::NotArmed);
        assert!(cb.target().is_none());
    }

    #[test]
    fn test_stale_epoch_does_not_fire() {
        let cb = Callback::wakeup();
        // never armed: epoch 0 is not ARMED
        assert_eq!(cb.inner.fire(0), FireOutcome::Stale);
        assert!(!cb.inner.begin_bottom(0));
    }

    #[test]
    fn test_signal_without_waiters() {
        let chan = Chan::new();
        assert!(!chan.signal());
        assert_eq!(chan.broadcast(), 0);
        assert!(chan.is_empty());
    }

    #[test]
    fn test_chan_drops_stale_entries() {
        let chan = Chan::new();
        let cb = Callback::wakeup();
        chan.add(Arc::clone(&cb.inner), 1);
        assert_eq!(chan.len(), 1);
        assert!(!chan.signal());
        assert!(chan.is_empty());
    }

    #[test]
    fn test_add_prunes_stale_entries() {
        let chan = Chan::new();
        let cb = Callback::wakeup();
        for epoch in 1..=100_000 {
            chan.add(Arc::clone(&cb.inner), epoch);
            assert!(chan.len() <= PRUNE_MIN);
        }
    }
}

//! FOM behaviour and the contexts handed to it
//!
//! A FOM (fop state machine) is a non-blocking state machine driven by the
//! handler threads of its home locality. Each call to [`Fom::tick`] performs
//! one phase transition and reports whether another one is immediately
//! possible.
//!
//! ```text
//!            queue                 tick → Again
//!   INIT ──────────► READY ◄──────────────────────┐
//!                      │ pop                      │
//!                      ▼                          │
//!                   RUNNING ──────────────────────┘
//!                      │ tick → Wait
//!          ┌───────────┴────────────┐
//!          ▼ phase != FINISH        ▼ phase == FINISH
//!       WAITING ──wakeup──► READY   fini
//! ```

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use fom_core::{FomId, LocalityId, Phase, RunState, TickOutcome};

use crate::callback::{Callback, CancelOutcome, Chan};
use crate::domain::DomainHandle;
use crate::locality::{GroupGuard, Locality, LocalityState};
use crate::timer::{Timeout, TimerBackend, TimerEntry};

/// Behaviour of a FOM type
///
/// The scheduler holds FOMs only as `Box<dyn Fom>`; concrete state lives in
/// the implementing type.
pub trait Fom: Send + 'static {
    /// Perform one phase transition
    ///
    /// Must not block the calling thread outside of a
    /// [`FomContext::block_enter`]/[`FomContext::block_leave`] bracket.
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome;

    /// Preferred locality index; reduced modulo `nr_localities`
    ///
    /// Called at most once, when the FOM is queued. Must be deterministic.
    fn home_locality(&self, nr_localities: usize) -> usize;

    /// Finalise after the FOM returned `Wait` in [`Phase::FINISH`]
    ///
    /// Runs under the home locality's group lock, exactly once.
    fn fini(self: Box<Self>, info: FiniInfo) {
        let _ = info;
    }

    /// Phase entered when the domain decides the FOM waited too long
    fn timeout_phase(&self) -> Phase {
        Phase::TIMEOUT
    }

    /// Name used in logs
    fn name(&self) -> &'static str {
        "fom"
    }
}

/// What the scheduler knows about a FOM when it is finalised
#[derive(Debug)]
pub struct FiniInfo {
    pub id: FomId,
    pub transitions: u64,
    /// Transaction attached with [`FomContext::set_transaction`]
    pub transaction: Option<Box<dyn Any + Send>>,
}

/// Point-in-time view of a queued FOM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FomInfo {
    pub id: FomId,
    pub name: &'static str,
    pub phase: Phase,
    pub run_state: RunState,
    pub transitions: u64,
}

/// Per-FOM state kept by the home locality
pub(crate) struct FomSlot {
    /// Taken out while the FOM is RUNNING
    pub(crate) ops: Option<Box<dyn Fom>>,
    pub(crate) name: &'static str,
    pub(crate) phase: Phase,
    pub(crate) state: RunState,
    pub(crate) transitions: u64,
    /// ASTs that arrived while the FOM was RUNNING
    pub(crate) pending: Vec<crate::ast::Ast>,
    /// A wakeup arrived while the FOM was RUNNING
    pub(crate) wakeup_pending: bool,
    pub(crate) deadline: Option<Instant>,
    pub(crate) waiting_since: Option<Instant>,
    pub(crate) transaction: Option<Box<dyn Any + Send>>,
}

impl FomSlot {
    pub(crate) fn new(ops: Box<dyn Fom>) -> Self {
        Self {
            name: ops.name(),
            ops: Some(ops),
            phase: Phase::INIT,
            state: RunState::Ready,
            transitions: 0,
            pending: Vec::new(),
            wakeup_pending: false,
            deadline: None,
            waiting_since: None,
            transaction: None,
        }
    }

    pub(crate) fn info(&self, id: FomId) -> FomInfo {
        FomInfo {
            id,
            name: self.name,
            phase: self.phase,
            run_state: self.state,
            transitions: self.transitions,
        }
    }
}

fn arm_on(loc: &Locality, fom: FomId, chan: &Chan, cb: &Callback) {
    let epoch = cb.inner.arm(fom, loc);
    chan.add(Arc::clone(&cb.inner), epoch);
}

fn arm_timeout(loc: &Locality, fom: FomId, timeout: &Timeout, deadline: Instant) {
    let inner = &timeout.callback().inner;
    let epoch = inner.arm(fom, loc);
    let handle = loc
        .timers()
        .insert(TimerEntry::new(deadline, Arc::clone(inner), epoch));
    timeout.set_armed(handle, loc.weak());
}

/// Context of one [`Fom::tick`] call
///
/// Holds the home locality's group lock for the whole transition, except
/// inside a blocking region.
pub struct FomContext<'a> {
    loc: &'a Locality,
    guard: Option<GroupGuard<'a>>,
    id: FomId,
}

impl<'a> FomContext<'a> {
    pub(crate) fn new(loc: &'a Locality, guard: GroupGuard<'a>, id: FomId) -> Self {
        Self {
            loc,
            guard: Some(guard),
            id,
        }
    }

    /// Give the group lock back to the scheduler; `None` while blocked
    pub(crate) fn into_guard(self) -> Option<GroupGuard<'a>> {
        self.guard
    }

    fn state(&mut self) -> &mut LocalityState {
        let id = self.id;
        match self.guard.as_deref_mut() {
            Some(state) => state,
            None => panic!("fom {id} used the group lock inside a blocking region"),
        }
    }

    fn slot(&mut self) -> &mut FomSlot {
        let id = self.id;
        match self.state().foms.get_mut(&id) {
            Some(slot) => slot,
            None => panic!("running fom {id} has no slot"),
        }
    }

    #[inline]
    pub fn id(&self) -> FomId {
        self.id
    }

    #[inline]
    pub fn locality(&self) -> LocalityId {
        self.loc.id()
    }

    pub fn phase(&mut self) -> Phase {
        self.slot().phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.slot().phase = phase;
    }

    pub fn run_state(&mut self) -> RunState {
        self.slot().state
    }

    /// Number of `tick` calls so far, this one included
    pub fn transitions(&mut self) -> u64 {
        self.slot().transitions
    }

    /// Deadline checked by the domain's time-is-out policy while waiting
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.slot().deadline = deadline;
    }

    /// Handle of the owning domain
    pub fn domain(&self) -> DomainHandle {
        self.loc.domain_handle()
    }

    pub fn set_transaction(&mut self, tx: Box<dyn Any + Send>) {
        self.slot().transaction = Some(tx);
    }

    pub fn transaction(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.slot().transaction.as_deref_mut()
    }

    pub fn take_transaction(&mut self) -> Option<Box<dyn Any + Send>> {
        self.slot().transaction.take()
    }

    /// Queue a new FOM on its home locality
    ///
    /// While the group lock is held the FOM is handed over through an AST
    /// of its home locality.
    pub fn queue(&mut self, fom: Box<dyn Fom>) -> FomId {
        self.domain().queue(fom)
    }

    /// Wake another FOM
    ///
    /// FOMs of this locality are moved directly, others through an AST.
    pub fn wakeup(&mut self, id: FomId) {
        if id.locality() == self.loc.id() && self.guard.is_some() {
            let loc = self.loc;
            if loc.wakeup_locked(self.state(), id) {
                loc.signal();
            }
        } else {
            self.domain().wakeup(id);
        }
    }

    /// Make this FOM ready again as soon as it returns `Wait`
    pub fn ready(&mut self) {
        let id = self.id;
        self.wakeup(id);
    }

    /// Arm `cb` on `chan` for this FOM
    ///
    /// Call before returning `Wait`. Panics if `cb` is still armed.
    pub fn arm(&mut self, chan: &Chan, cb: &Callback) {
        arm_on(self.loc, self.id, chan, cb);
    }

    /// Arm a callback that only wakes this FOM; returned for cancellation
    pub fn wait_on(&mut self, chan: &Chan) -> Callback {
        let cb = Callback::wakeup();
        self.arm(chan, &cb);
        cb
    }

    pub fn cancel(&mut self, cb: &Callback) -> CancelOutcome {
        cb.cancel()
    }

    /// Fire `timeout` once `now >= deadline`
    pub fn timeout_arm(&mut self, timeout: &Timeout, deadline: Instant) {
        arm_timeout(self.loc, self.id, timeout, deadline);
    }

    pub fn timeout_wait_on(&mut self, deadline: Instant) -> Timeout {
        let timeout = Timeout::wakeup();
        self.timeout_arm(&timeout, deadline);
        timeout
    }

    pub fn timeout_cancel(&mut self, timeout: &Timeout) -> CancelOutcome {
        timeout.cancel()
    }

    /// Enter a region that may block the thread
    ///
    /// Makes sure another handler thread can serve the locality, starting
    /// an overflow thread if needed, then releases the group lock. With
    /// every other thread blocked and no overflow thread left to start,
    /// waits until one of them leaves its blocking region. Deliveries for
    /// this FOM are held back until it returns `Wait`.
    ///
    /// # Panics
    ///
    /// When already inside a blocking region.
    pub fn block_enter(&mut self) {
        let id = self.id;
        let Some(mut guard) = self.guard.take() else {
            panic!("fom {id}: nested block_enter");
        };
        self.loc.reserve_spare(&mut guard, id);
        guard.blocked += 1;
        drop(guard);
        self.loc.signal();
    }

    /// Leave the blocking region, re-acquiring the group lock
    ///
    /// # Panics
    ///
    /// Without a matching [`block_enter`](Self::block_enter).
    pub fn block_leave(&mut self) {
        assert!(
            self.guard.is_none(),
            "fom {}: block_leave without block_enter",
            self.id
        );
        let mut guard = self.loc.lock();
        guard.blocked -= 1;
        self.loc.spare_freed();
        self.guard = Some(guard);
    }

    /// Run `f` inside a blocking region
    pub fn block<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.block_enter();
        let result = f();
        self.block_leave();
        result
    }

    /// True between `block_enter` and `block_leave`
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.guard.is_none()
    }
}

/// Context of a bottom-half or posted closure
///
/// Runs under the home locality's group lock while the target FOM is not
/// RUNNING.
pub struct AstContext<'a> {
    loc: &'a Locality,
    state: &'a mut LocalityState,
    fom: FomId,
}

impl<'a> AstContext<'a> {
    pub(crate) fn new(loc: &'a Locality, state: &'a mut LocalityState, fom: FomId) -> Self {
        Self { loc, state, fom }
    }

    fn slot(&mut self) -> Option<&mut FomSlot> {
        self.state.foms.get_mut(&self.fom)
    }

    /// FOM this AST was delivered for
    #[inline]
    pub fn fom(&self) -> FomId {
        self.fom
    }

    #[inline]
    pub fn locality(&self) -> LocalityId {
        self.loc.id()
    }

    pub fn phase(&mut self) -> Option<Phase> {
        self.slot().map(|s| s.phase)
    }

    pub fn set_phase(&mut self, phase: Phase) {
        if let Some(slot) = self.slot() {
            slot.phase = phase;
        }
    }

    pub fn run_state(&mut self) -> Option<RunState> {
        self.slot().map(|s| s.state)
    }

    /// Move the target FOM from WAITING to READY
    pub fn ready(&mut self) {
        let fom = self.fom;
        self.wakeup(fom);
    }

    /// Wake any FOM, this locality's directly, others through an AST
    pub fn wakeup(&mut self, id: FomId) {
        if id.locality() == self.loc.id() {
            if self.loc.wakeup_locked(self.state, id) {
                self.loc.signal();
            }
        } else {
            self.loc.domain_handle().wakeup(id);
        }
    }

    /// Re-arm a callback for the target FOM
    pub fn arm(&mut self, chan: &Chan, cb: &Callback) {
        arm_on(self.loc, self.fom, chan, cb);
    }

    pub fn timeout_arm(&mut self, timeout: &Timeout, deadline: Instant) {
        arm_timeout(self.loc, self.fom, timeout, deadline);
    }

    pub fn cancel(&mut self, cb: &Callback) -> CancelOutcome {
        cb.cancel()
    }

    pub fn domain(&self) -> DomainHandle {
        self.loc.domain_handle()
    }
}

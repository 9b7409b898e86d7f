//! Locality: one scheduling partition of a domain
//!
//! A locality owns a run queue, a wait list and the slots of every FOM homed
//! on it, all guarded by a single group lock. Its handler threads take turns
//! under that lock, so transitions and bottom-halves of FOMs on one locality
//! never run concurrently.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use fom_core::{FomError, FomId, FomResult, LocalityId, RunState};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::ast::{Ast, AstQueue};
use crate::domain::{DomainHandle, DomainPolicy, DomainShared};
use crate::fom::{AstContext, Fom, FomInfo, FomSlot};
use crate::parking::{new_signal, RerunSignal};
use crate::timer::{HeapTimerBackend, TimerStats};
use crate::tls;
use crate::worker::WorkerPool;

/// State guarded by the group lock
pub(crate) struct LocalityState {
    pub(crate) foms: HashMap<FomId, FomSlot>,
    pub(crate) run_queue: VecDeque<FomId>,
    pub(crate) wait_list: BTreeSet<FomId>,
    /// FOMs currently inside `tick`
    pub(crate) running: usize,
    /// Handler threads alive
    pub(crate) threads: usize,
    /// Handler threads parked or about to park
    pub(crate) idle: usize,
    /// Handler threads inside a blocking region
    pub(crate) blocked: usize,
    /// Overflow threads that may still be started
    pub(crate) overflow_permits: usize,
    pub(crate) next_worker: usize,
    pub(crate) shutdown: bool,
    pub(crate) last_scan: Instant,
}

impl LocalityState {
    fn new(overflow_permits: usize) -> Self {
        Self {
            foms: HashMap::new(),
            run_queue: VecDeque::new(),
            wait_list: BTreeSet::new(),
            running: 0,
            threads: 0,
            idle: 0,
            blocked: 0,
            overflow_permits,
            next_worker: 0,
            shutdown: false,
            last_scan: Instant::now(),
        }
    }
}

/// Held group lock; records itself in the thread-local lock marker
pub(crate) struct GroupGuard<'a> {
    guard: MutexGuard<'a, LocalityState>,
    prev: usize,
}

impl Deref for GroupGuard<'_> {
    type Target = LocalityState;

    fn deref(&self) -> &LocalityState {
        &self.guard
    }
}

impl DerefMut for GroupGuard<'_> {
    fn deref_mut(&mut self) -> &mut LocalityState {
        &mut self.guard
    }
}

impl Drop for GroupGuard<'_> {
    fn drop(&mut self) {
        tls::release(self.prev);
    }
}

/// Initial timer heap size of a locality
const TIMER_CAPACITY: usize = 64;

/// Per-locality share of the domain configuration
#[derive(Debug, Clone)]
pub(crate) struct LocalitySettings {
    pub(crate) nominal_threads: usize,
    pub(crate) max_overflow_threads: usize,
    pub(crate) park_timeout: Duration,
    pub(crate) scan_interval: Duration,
    pub(crate) cpu: Option<usize>,
}

/// Counters of one locality
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalityStats {
    pub id: LocalityId,
    /// FOMs homed here and not yet finalised
    pub active: usize,
    pub ready: usize,
    pub waiting: usize,
    pub running: usize,
    pub threads: usize,
    pub idle: usize,
    /// Threads sleeping on the rerun signal
    pub parked: usize,
    pub blocked: usize,
    /// `block_enter` calls that had to wait for a spare handler thread
    pub block_waits: u64,
    /// `tick` calls so far
    pub ticks: u64,
    /// ASTs delivered so far
    pub asts: u64,
    pub overflow_spawned: u64,
    pub timers: TimerStats,
}

pub(crate) struct Locality {
    id: LocalityId,
    state: Mutex<LocalityState>,
    /// Signalled when a thread leaves a blocking region
    spare: Condvar,
    rerun: Box<dyn RerunSignal>,
    pub(crate) asts: AstQueue,
    timers: HeapTimerBackend,
    /// Mirror of `foms.len()`
    active: AtomicUsize,
    next_seq: AtomicU64,
    pub(crate) ticks: AtomicU64,
    pub(crate) asts_delivered: AtomicU64,
    overflow_spawned: AtomicU64,
    block_waits: AtomicU64,
    pub(crate) policy: Arc<dyn DomainPolicy>,
    domain: Weak<DomainShared>,
    this: Weak<Locality>,
    pool: WorkerPool,
    pub(crate) settings: LocalitySettings,
}

impl Locality {
    pub(crate) fn new(
        id: LocalityId,
        settings: LocalitySettings,
        policy: Arc<dyn DomainPolicy>,
        domain: Weak<DomainShared>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Locality {
            id,
            state: Mutex::new(LocalityState::new(settings.max_overflow_threads)),
            spare: Condvar::new(),
            rerun: new_signal(),
            asts: AstQueue::new(),
            timers: HeapTimerBackend::with_capacity(TIMER_CAPACITY),
            active: AtomicUsize::new(0),
            next_seq: AtomicU64::new(1),
            ticks: AtomicU64::new(0),
            asts_delivered: AtomicU64::new(0),
            overflow_spawned: AtomicU64::new(0),
            block_waits: AtomicU64::new(0),
            policy,
            domain,
            this: this.clone(),
            pool: WorkerPool::new(),
            settings,
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> LocalityId {
        self.id
    }

    /// Identity used by the thread-local lock marker
    #[inline]
    pub(crate) fn key(&self) -> usize {
        self as *const Locality as usize
    }

    #[inline]
    pub(crate) fn weak(&self) -> Weak<Locality> {
        self.this.clone()
    }

    #[inline]
    pub(crate) fn timers(&self) -> &HeapTimerBackend {
        &self.timers
    }

    /// Take the group lock
    ///
    /// # Panics
    ///
    /// If the calling thread already holds a group lock.
    pub(crate) fn lock(&self) -> GroupGuard<'_> {
        assert!(
            !tls::holds_group_lock(),
            "{}: thread already holds a group lock",
            self.id
        );
        let guard = self.state.lock();
        let prev = tls::acquire(self.key());
        GroupGuard { guard, prev }
    }

    /// Wake a handler thread
    #[inline]
    pub(crate) fn signal(&self) {
        self.rerun.wake_one();
    }

    pub(crate) fn park(&self, timeout: Duration) -> bool {
        self.rerun.park(Some(timeout))
    }

    pub(crate) fn domain_handle(&self) -> DomainHandle {
        match self.domain.upgrade() {
            Some(shared) => DomainHandle::from_shared(shared),
            None => panic!("{}: domain dropped while its handler threads run", self.id),
        }
    }

    /// Tell the domain that `n` queued FOMs are gone
    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(shared) = self.domain.upgrade() {
            shared.release(n);
        }
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_id(&self) -> FomId {
        FomId::new(self.id, self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Post an AST and wake a handler thread
    pub(crate) fn post(&self, ast: Ast) {
        trace!(locality = %self.id, fom = %ast.target(), ?ast, "ast posted");
        self.asts.push(ast);
        self.signal();
    }

    /// Hand a FOM over from a thread that holds some group lock
    pub(crate) fn post_enqueue(&self, fom: FomId, ops: Box<dyn Fom>) {
        self.post(Ast::Enqueue { fom, ops });
    }

    /// Add a FOM to the run queue
    pub(crate) fn insert(&self, st: &mut LocalityState, id: FomId, ops: Box<dyn Fom>) {
        if st.shutdown {
            warn!(locality = %self.id, fom = %id, name = ops.name(), "locality stopped, dropping fom");
            self.release(1);
            return;
        }
        trace!(locality = %self.id, fom = %id, name = ops.name(), "fom queued");
        st.foms.insert(id, FomSlot::new(ops));
        st.run_queue.push_back(id);
        self.active.store(st.foms.len(), Ordering::Release);
    }

    /// Remove a finished FOM's slot and refresh the active mirror
    ///
    /// The domain still counts the FOM until [`release`](Self::release).
    pub(crate) fn remove(&self, st: &mut LocalityState, id: FomId) -> Option<FomSlot> {
        let slot = st.foms.remove(&id)?;
        self.active.store(st.foms.len(), Ordering::Release);
        Some(slot)
    }

    /// WAITING → READY; returns whether the run queue grew
    ///
    /// READY is left alone; RUNNING records the wakeup until the FOM waits.
    pub(crate) fn wakeup_locked(&self, st: &mut LocalityState, id: FomId) -> bool {
        let Some(slot) = st.foms.get_mut(&id) else {
            trace!(locality = %self.id, fom = %id, "wakeup of unknown fom ignored");
            return false;
        };
        match slot.state {
            RunState::Waiting => {
                slot.state = RunState::Ready;
                slot.waiting_since = None;
                st.wait_list.remove(&id);
                st.run_queue.push_back(id);
                true
            }
            RunState::Ready => false,
            RunState::Running => {
                slot.wakeup_pending = true;
                false
            }
        }
    }

    /// Execute one AST under the group lock
    ///
    /// Callbacks and closures for a RUNNING FOM are parked on its slot and
    /// delivered once it returns `Wait`.
    pub(crate) fn deliver(&self, st: &mut LocalityState, ast: Ast) {
        self.asts_delivered.fetch_add(1, Ordering::Relaxed);
        match ast {
            Ast::Enqueue { fom, ops } => {
                self.insert(st, fom, ops);
            }
            Ast::Wakeup(fom) => {
                self.wakeup_locked(st, fom);
            }
            Ast::Callback { cb, fom, epoch } => match st.foms.get_mut(&fom) {
                None => {
                    trace!(locality = %self.id, fom = %fom, "callback for finished fom dropped");
                    cb.abandon(epoch);
                }
                Some(slot) if slot.state == RunState::Running => {
                    slot.pending.push(Ast::Callback { cb, fom, epoch });
                }
                Some(_) => {
                    if cb.begin_bottom(epoch) {
                        let mut ctx = AstContext::new(self, st, fom);
                        cb.run_bottom(epoch, &mut ctx);
                    }
                }
            },
            Ast::Closure { fom, f } => match st.foms.get_mut(&fom) {
                None => {
                    trace!(locality = %self.id, fom = %fom, "closure for finished fom dropped");
                }
                Some(slot) if slot.state == RunState::Running => {
                    slot.pending.push(Ast::Closure { fom, f });
                }
                Some(_) => {
                    let mut ctx = AstContext::new(self, st, fom);
                    f(&mut ctx);
                }
            },
        }
    }

    /// Deliver the ASTs queued so far
    ///
    /// ASTs posted meanwhile wait for the next scheduler iteration.
    pub(crate) fn drain_asts(&self, st: &mut LocalityState) {
        for _ in 0..self.asts.len() {
            match self.asts.pop() {
                Some(ast) => self.deliver(st, ast),
                None => break,
            }
        }
    }

    /// Start an overflow handler thread if a permit is left
    ///
    /// Returns whether a thread was started.
    pub(crate) fn spawn_overflow(&self, st: &mut LocalityState) -> FomResult<bool> {
        if st.shutdown || st.overflow_permits == 0 {
            return Ok(false);
        }
        st.overflow_permits -= 1;
        if let Err(err) = self.spawn_worker(st, true) {
            st.overflow_permits += 1;
            return Err(err);
        }
        self.overflow_spawned.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Make sure a handler thread other than the caller's stays unblocked
    ///
    /// Called by a FOM about to block its thread. Starts an overflow thread
    /// when none is idle; once the permits are used up and every other
    /// thread is blocked, waits until one of them leaves its blocking
    /// region. Only the caller can be waiting here at any time, so the
    /// wait always ends.
    pub(crate) fn reserve_spare(&self, st: &mut GroupGuard<'_>, fom: FomId) {
        let mut waited = false;
        loop {
            if st.shutdown {
                return;
            }
            if st.idle == 0 {
                if let Err(err) = self.spawn_overflow(st) {
                    warn!(locality = %self.id, fom = %fom, %err, "could not start overflow thread");
                }
            }
            if st.threads > st.blocked + 1 {
                return;
            }
            if !waited {
                waited = true;
                self.block_waits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    locality = %self.id,
                    fom = %fom,
                    threads = st.threads,
                    blocked = st.blocked,
                    "overflow threads exhausted, waiting for a spare handler thread"
                );
            }
            self.spare.wait_for(&mut st.guard, self.settings.park_timeout);
        }
    }

    /// A blocking region ended; called under the group lock
    #[inline]
    pub(crate) fn spare_freed(&self) {
        self.spare.notify_one();
    }

    pub(crate) fn spawn_worker(&self, st: &mut LocalityState, overflow: bool) -> FomResult<()> {
        let Some(this) = self.this.upgrade() else {
            return Err(FomError::WorkerSpawn(format!("{} is gone", self.id)));
        };
        let worker = st.next_worker;
        let name = format!("fom-loc{}-w{}", self.id.as_usize(), worker);
        self.pool
            .spawn(name, move || this.run_worker(worker, overflow))?;
        st.next_worker += 1;
        st.threads += 1;
        Ok(())
    }

    /// Start the nominal handler threads
    pub(crate) fn start(&self) -> FomResult<()> {
        let mut st = self.lock();
        for _ in 0..self.settings.nominal_threads {
            self.spawn_worker(&mut st, false)?;
        }
        debug!(locality = %self.id, threads = st.threads, cpu = ?self.settings.cpu, "locality started");
        Ok(())
    }

    /// Stop all handler threads and wait for them
    ///
    /// FOMs still homed here are dropped without `fini`.
    pub(crate) fn stop(&self) {
        {
            let mut st = self.lock();
            st.shutdown = true;
            self.spare.notify_all();
        }
        debug!(locality = %self.id, threads = self.pool.len(), "stopping locality");
        self.rerun.wake_all();
        self.pool.join_all();

        let mut st = self.lock();
        let mut dropped = st.foms.len();
        while let Some(ast) = self.asts.pop() {
            if let Ast::Enqueue { .. } = ast {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(locality = %self.id, dropped, "dropping unfinished foms");
        }
        st.foms.clear();
        st.run_queue.clear();
        st.wait_list.clear();
        self.active.store(0, Ordering::Release);
        drop(st);
        self.release(dropped);
        debug!(locality = %self.id, "locality stopped");
    }

    pub(crate) fn fom_info(&self, id: FomId) -> Option<FomInfo> {
        let st = self.lock();
        st.foms.get(&id).map(|slot| slot.info(id))
    }

    pub(crate) fn stats(&self) -> LocalityStats {
        let st = self.lock();
        LocalityStats {
            id: self.id,
            active: st.foms.len(),
            ready: st.run_queue.len(),
            waiting: st.wait_list.len(),
            running: st.running,
            threads: st.threads,
            idle: st.idle,
            parked: self.rerun.parked_count(),
            blocked: st.blocked,
            block_waits: self.block_waits.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            asts: self.asts_delivered.load(Ordering::Relaxed),
            overflow_spawned: self.overflow_spawned.load(Ordering::Relaxed),
            timers: self.timers.stats(),
        }
    }

    /// Verify list membership against run states
    pub(crate) fn check(&self) -> FomResult<()> {
        let st = self.lock();
        let fail = |msg: String| -> FomResult<()> {
            Err(FomError::Invariant(format!("{}: {}", self.id, msg)))
        };

        let mut seen = HashSet::with_capacity(st.foms.len());
        for id in &st.run_queue {
            if !seen.insert(*id) {
                return fail(format!("{id} queued twice"));
            }
            match st.foms.get(id) {
                Some(slot) if slot.state == RunState::Ready => {}
                Some(slot) => return fail(format!("{id} on run queue in state {}", slot.state)),
                None => return fail(format!("{id} on run queue without a slot")),
            }
        }
        for id in &st.wait_list {
            if !seen.insert(*id) {
                return fail(format!("{id} both ready and waiting"));
            }
            match st.foms.get(id) {
                Some(slot) if slot.state != RunState::Waiting => {
                    return fail(format!("{id} on wait list in state {}", slot.state))
                }
                Some(slot) if slot.phase.is_finish() => {
                    return fail(format!("{id} waits in phase FINISH"))
                }
                Some(_) => {}
                None => return fail(format!("{id} on wait list without a slot")),
            }
        }

        let listed = st.foms.values().filter(|slot| slot.state.is_listed()).count();
        let running = st.foms.len() - listed;
        if running != st.running {
            return fail(format!("{running} running slots, counter says {}", st.running));
        }
        if listed != st.run_queue.len() + st.wait_list.len() {
            return fail(format!(
                "{listed} ready or waiting slots, {} on the lists",
                st.run_queue.len() + st.wait_list.len()
            ));
        }
        if self.active() != st.foms.len() {
            return fail(format!("active mirror {} != {}", self.active(), st.foms.len()));
        }
        Ok(())
    }
}

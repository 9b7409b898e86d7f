//! Handler thread loop
//!
//! Every iteration, under the group lock:
//!
//! 1. fire expired timers (top-halves inline, bottom-halves as ASTs)
//! 2. deliver the ASTs queued so far
//! 3. every `scan_interval`, apply the time-is-out policy to waiting FOMs
//! 4. run one transition of the FOM at the head of the run queue
//!
//! With nothing to do the thread parks on the rerun signal, no longer than
//! the park timeout or the next timer deadline. Overflow threads retire
//! after an idle park once the locality has more unblocked threads than
//! it nominally needs.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use fom_core::{FomId, RunState, TickOutcome};
use tracing::{debug, trace, warn};

use crate::affinity;
use crate::ast::Ast;
use crate::domain::WaitingFom;
use crate::fom::{FiniInfo, Fom, FomContext};
use crate::locality::{GroupGuard, Locality, LocalityState};
use crate::timer::TimerBackend;
use crate::tls;

impl Locality {
    pub(crate) fn run_worker(self: Arc<Self>, worker: usize, overflow: bool) {
        tls::set_worker(self.id(), worker);
        if let Some(cpu) = self.settings.cpu {
            if !affinity::bind_current_thread(cpu) {
                warn!(locality = %self.id(), worker, cpu, "could not bind handler thread");
            }
        }
        debug!(locality = %self.id(), worker, overflow, "handler thread started");

        let mut st = self.lock();
        loop {
            if st.shutdown {
                break;
            }

            let now = Instant::now();
            self.fire_timers(now);
            self.drain_asts(&mut st);
            self.scan_timeouts(&mut st, now);

            if let Some(id) = st.run_queue.pop_front() {
                st = self.run_one(st, id);
                continue;
            }
            if !self.asts.is_empty() {
                continue;
            }

            let mut timeout = self.settings.park_timeout;
            if let Some(deadline) = self.timers().next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
            if timeout.is_zero() {
                continue;
            }

            st.idle += 1;
            drop(st);
            let signalled = self.park(timeout);
            st = self.lock();
            st.idle -= 1;

            if overflow
                && !signalled
                && st.run_queue.is_empty()
                && self.asts.is_empty()
                && st.threads > self.settings.nominal_threads + st.blocked
            {
                st.threads -= 1;
                st.overflow_permits += 1;
                debug!(locality = %self.id(), worker, threads = st.threads, "overflow thread retired");
                return;
            }
        }

        st.threads -= 1;
        if overflow {
            st.overflow_permits += 1;
        }
        debug!(locality = %self.id(), worker, "handler thread stopped");
    }

    /// Run one transition of `id` and file the FOM by its outcome
    fn run_one<'a>(&'a self, mut st: GroupGuard<'a>, id: FomId) -> GroupGuard<'a> {
        let Some(slot) = st.foms.get_mut(&id) else {
            warn!(locality = %self.id(), fom = %id, "run queue entry without slot");
            return st;
        };
        let Some(mut ops) = slot.ops.take() else {
            panic!("fom {id} queued while running");
        };
        slot.state = RunState::Running;
        slot.transitions += 1;
        st.running += 1;
        self.ticks.fetch_add(1, Ordering::Relaxed);

        let mut ctx = FomContext::new(self, st, id);
        let outcome = ops.tick(&mut ctx);
        let Some(mut st) = ctx.into_guard() else {
            panic!("fom {id} returned from tick inside a blocking region");
        };
        st.running -= 1;

        let Some(slot) = st.foms.get_mut(&id) else {
            panic!("fom {id} lost its slot while running");
        };
        match outcome {
            TickOutcome::Again => {
                slot.ops = Some(ops);
                slot.state = RunState::Ready;
                st.run_queue.push_back(id);
            }
            TickOutcome::Wait if slot.phase.is_finish() => {
                self.finish(&mut st, id, ops);
            }
            TickOutcome::Wait => {
                slot.ops = Some(ops);
                slot.state = RunState::Waiting;
                slot.waiting_since = Some(Instant::now());
                let pending = std::mem::take(&mut slot.pending);
                let woken = std::mem::take(&mut slot.wakeup_pending);
                st.wait_list.insert(id);

                for ast in pending {
                    self.deliver(&mut st, ast);
                }
                if woken {
                    self.wakeup_locked(&mut st, id);
                }
            }
        }
        st
    }

    fn finish(&self, st: &mut LocalityState, id: FomId, ops: Box<dyn Fom>) {
        let Some(slot) = self.remove(st, id) else {
            return;
        };
        if !slot.pending.is_empty() {
            warn!(
                locality = %self.id(),
                fom = %id,
                dropped = slot.pending.len(),
                "fom finished with deliveries outstanding"
            );
            for ast in slot.pending {
                if let Ast::Callback { cb, epoch, .. } = ast {
                    cb.abandon(epoch);
                }
            }
        }
        trace!(locality = %self.id(), fom = %id, name = slot.name, transitions = slot.transitions, "fom finished");
        ops.fini(FiniInfo {
            id,
            transitions: slot.transitions,
            transaction: slot.transaction,
        });
        self.release(1);
    }

    fn fire_timers(&self, now: Instant) {
        for entry in self.timers().poll_expired(now) {
            entry.callback.fire(entry.epoch);
        }
    }

    /// Move waiting FOMs the domain policy considers timed out to their
    /// timeout phase and make them ready
    fn scan_timeouts(&self, st: &mut LocalityState, now: Instant) {
        if now.saturating_duration_since(st.last_scan) < self.settings.scan_interval {
            return;
        }
        st.last_scan = now;

        let expired: Vec<FomId> = st
            .wait_list
            .iter()
            .filter(|id| {
                st.foms.get(*id).map_or(false, |slot| {
                    let waiting = WaitingFom {
                        id: **id,
                        phase: slot.phase,
                        transitions: slot.transitions,
                        waiting_since: slot.waiting_since.unwrap_or(now),
                        deadline: slot.deadline,
                    };
                    self.policy.time_is_out(&waiting, now)
                })
            })
            .copied()
            .collect();

        for id in expired {
            if let Some(slot) = st.foms.get_mut(&id) {
                if let Some(ops) = slot.ops.as_ref() {
                    slot.phase = ops.timeout_phase();
                }
                slot.deadline = None;
                debug!(locality = %self.id(), fom = %id, phase = %slot.phase, "fom timed out");
            }
            self.wakeup_locked(st, id);
        }
    }
}

//! Long lock shared by FOMs on several localities

mod common;

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{domain, FiniCounter, IDLE_TIMEOUT};
use fom_runtime::{
    FiniInfo, Fom, FomContext, LockKind, LockLink, LongLock, Phase, TickOutcome, Timeout,
};

const PH_LOCKED: Phase = Phase::type_specific(0);
const PH_DONE: Phase = Phase::type_specific(1);

/// Owners currently inside the critical section: readers count up,
/// a writer sets -1
#[derive(Default)]
struct Section {
    owners: AtomicIsize,
    violations: AtomicUsize,
}

impl Section {
    fn enter(&self, kind: LockKind) {
        let ok = match kind {
            LockKind::Read => self
                .owners
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n >= 0).then_some(n + 1))
                .is_ok(),
            LockKind::Write => self
                .owners
                .compare_exchange(0, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
        };
        if !ok {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn leave(&self, kind: LockKind) {
        match kind {
            LockKind::Read => {
                self.owners.fetch_sub(1, Ordering::SeqCst);
            }
            LockKind::Write => {
                self.owners.store(0, Ordering::SeqCst);
            }
        }
    }
}

struct User {
    kind: LockKind,
    home: usize,
    lock: Arc<LongLock>,
    link: LockLink,
    section: Arc<Section>,
    hold: Option<Timeout>,
    fini: FiniCounter,
}

impl Fom for User {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        match ctx.phase() {
            Phase::INIT => {
                let acquired = match self.kind {
                    LockKind::Read => self.lock.read_lock(ctx, &self.link, PH_LOCKED),
                    LockKind::Write => self.lock.write_lock(ctx, &self.link, PH_LOCKED),
                };
                if acquired {
                    assert_eq!(ctx.phase(), PH_LOCKED);
                }
                LongLock::tick_outcome(acquired)
            }
            PH_LOCKED => {
                assert_eq!(self.link.owns(), Some(self.kind));
                self.section.enter(self.kind);
                let hold = ctx.timeout_wait_on(Instant::now() + Duration::from_millis(2));
                self.hold = Some(hold);
                ctx.set_phase(PH_DONE);
                TickOutcome::Wait
            }
            PH_DONE => {
                self.section.leave(self.kind);
                match self.kind {
                    LockKind::Read => {
                        assert!(self.lock.is_read_locked(&self.link));
                        self.lock.read_unlock(ctx, &self.link);
                    }
                    LockKind::Write => {
                        assert!(self.lock.is_write_locked(&self.link));
                        self.lock.write_unlock(ctx, &self.link);
                    }
                }
                ctx.set_phase(Phase::FINISH);
                TickOutcome::Wait
            }
            other => panic!("unexpected phase {other}"),
        }
    }

    fn home_locality(&self, nr: usize) -> usize {
        self.home % nr
    }

    fn fini(self: Box<Self>, _info: FiniInfo) {
        assert_eq!(self.link.owns(), None);
        self.fini.bump();
    }
}

#[test]
fn readers_and_writers_exclude() {
    let domain = domain(4);
    let lock = Arc::new(LongLock::new());
    let section = Arc::new(Section::default());
    let fini = FiniCounter::new();

    let users = 64;
    for i in 0..users {
        let kind = if i % 4 == 0 {
            LockKind::Write
        } else {
            LockKind::Read
        };
        domain.queue(Box::new(User {
            kind,
            home: i,
            lock: Arc::clone(&lock),
            link: LockLink::new(),
            section: Arc::clone(&section),
            hold: None,
            fini: fini.clone(),
        }));
    }

    assert!(domain.wait_idle(IDLE_TIMEOUT));
    assert_eq!(fini.get(), users);
    assert_eq!(section.violations.load(Ordering::SeqCst), 0);
    assert_eq!(section.owners.load(Ordering::SeqCst), 0);
    assert_eq!(lock.readers(), 0);
    assert_eq!(lock.waiters(), 0);
    domain.fini();
}

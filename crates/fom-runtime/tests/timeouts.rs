//! Timers and the time-is-out policy

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use common::{domain, wait_for, IDLE_TIMEOUT};
use fom_runtime::{
    CancelOutcome, Chan, Domain, DomainConfig, DomainPolicy, Fom, FomContext, Phase, RunState,
    TickOutcome, Timeout, WaitingFom,
};

const PH_WOKEN: Phase = Phase::type_specific(0);

/// Sleeps on a timeout, then reports how long it waited
struct Nap {
    delay: Duration,
    started: Option<Instant>,
    timeout: Option<Timeout>,
    report: mpsc::Sender<Duration>,
}

impl Fom for Nap {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        match ctx.phase() {
            Phase::INIT => {
                let now = Instant::now();
                self.started = Some(now);
                self.timeout = Some(ctx.timeout_wait_on(now + self.delay));
                ctx.set_phase(PH_WOKEN);
                TickOutcome::Wait
            }
            _ => {
                if let Some(started) = self.started {
                    let _ = self.report.send(started.elapsed());
                }
                ctx.set_phase(Phase::FINISH);
                TickOutcome::Wait
            }
        }
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }
}

#[test]
fn timeout_wakes_fom() {
    let domain = domain(1);
    let (tx, rx) = mpsc::channel();
    domain.queue(Box::new(Nap {
        delay: Duration::from_millis(50),
        started: None,
        timeout: None,
        report: tx,
    }));

    let waited = rx.recv_timeout(IDLE_TIMEOUT).unwrap();
    assert!(waited >= Duration::from_millis(50), "woke after {waited:?}");
    assert!(domain.wait_idle(IDLE_TIMEOUT));
    let timers = domain.locality_stats(0).unwrap().timers;
    assert_eq!(timers.armed, 0);
    assert_eq!(timers.fired, 1);
    domain.fini();
}

/// Waits for a channel with a long timeout as a guard; cancels the
/// timeout once the channel fires
struct Guarded {
    chan: Arc<Chan>,
    fired: Arc<AtomicUsize>,
    timeout: Option<Timeout>,
    outcome: mpsc::Sender<CancelOutcome>,
}

impl Fom for Guarded {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        match ctx.phase() {
            Phase::INIT => {
                let fired = Arc::clone(&self.fired);
                let timeout = Timeout::new(move |ctx| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    ctx.ready();
                });
                ctx.timeout_arm(&timeout, Instant::now() + Duration::from_secs(30));
                self.timeout = Some(timeout);
                ctx.wait_on(&self.chan);
                ctx.set_phase(PH_WOKEN);
                TickOutcome::Wait
            }
            _ => {
                if let Some(timeout) = self.timeout.take() {
                    let _ = self.outcome.send(ctx.timeout_cancel(&timeout));
                }
                ctx.set_phase(Phase::FINISH);
                TickOutcome::Wait
            }
        }
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }
}

#[test]
fn cancelled_timeout_never_fires() {
    let domain = domain(1);
    let chan = Arc::new(Chan::new());
    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    domain.queue(Box::new(Guarded {
        chan: Arc::clone(&chan),
        fired: Arc::clone(&fired),
        timeout: None,
        outcome: tx,
    }));
    assert!(wait_for(IDLE_TIMEOUT, || {
        domain.locality_stats(0).unwrap().timers.armed == 1 && chan.len() == 1
    }));
    assert!(chan.signal());

    assert_eq!(rx.recv_timeout(IDLE_TIMEOUT).unwrap(), CancelOutcome::Prevented);
    assert!(domain.wait_idle(IDLE_TIMEOUT));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(domain.locality_stats(0).unwrap().timers.armed, 0);
    domain.fini();
}

/// Sets a deadline and waits with nothing armed
struct Deadline {
    after: Duration,
    phase_seen: mpsc::Sender<Phase>,
}

impl Fom for Deadline {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if ctx.phase() == Phase::INIT {
            ctx.set_deadline(Some(Instant::now() + self.after));
            ctx.set_phase(PH_WOKEN);
            return TickOutcome::Wait;
        }
        let _ = self.phase_seen.send(ctx.phase());
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }
}

#[test]
fn deadline_moves_fom_to_timeout_phase() {
    let domain = domain(1);
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    domain.queue(Box::new(Deadline {
        after: Duration::from_millis(30),
        phase_seen: tx,
    }));

    assert_eq!(rx.recv_timeout(IDLE_TIMEOUT).unwrap(), Phase::TIMEOUT);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert!(domain.wait_idle(IDLE_TIMEOUT));
    domain.fini();
}

/// Considers any FOM waiting longer than `limit` timed out
struct WaitLimit {
    limit: Duration,
}

impl DomainPolicy for WaitLimit {
    fn time_is_out(&self, fom: &WaitingFom, now: Instant) -> bool {
        now.saturating_duration_since(fom.waiting_since) >= self.limit
    }
}

const PH_GAVE_UP: Phase = Phase::type_specific(7);

/// Waits forever unless the domain times it out
struct Patient {
    phase_seen: mpsc::Sender<Phase>,
}

impl Fom for Patient {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if ctx.phase() == Phase::INIT {
            ctx.set_phase(PH_WOKEN);
            return TickOutcome::Wait;
        }
        let _ = self.phase_seen.send(ctx.phase());
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }

    fn timeout_phase(&self) -> Phase {
        PH_GAVE_UP
    }
}

#[test]
fn policy_decides_time_is_out() {
    let config = DomainConfig::new()
        .nr_localities(1)
        .park_timeout(Duration::from_millis(10))
        .timeout_scan_interval(Duration::from_millis(5));
    let domain = Domain::new(
        config,
        Arc::new(WaitLimit {
            limit: Duration::from_millis(40),
        }),
    )
    .unwrap();
    let (tx, rx) = mpsc::channel();
    let id = domain.queue(Box::new(Patient { phase_seen: tx }));

    assert!(wait_for(IDLE_TIMEOUT, || {
        domain
            .fom_info(id)
            .map_or(true, |info| info.run_state == RunState::Waiting)
    }));
    assert_eq!(rx.recv_timeout(IDLE_TIMEOUT).unwrap(), PH_GAVE_UP);
    assert!(domain.wait_idle(IDLE_TIMEOUT));
    domain.fini();
}

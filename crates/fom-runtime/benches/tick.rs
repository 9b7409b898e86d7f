//! Scheduling throughput: queue-to-fini latency of short FOMs, and the
//! callback round trip through the AST queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fom_runtime::{Chan, Domain, DomainConfig, FiniInfo, Fom, FomContext, Phase, TickOutcome};

struct Short {
    again: u64,
    home: usize,
    done: Arc<AtomicUsize>,
}

impl Fom for Short {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if ctx.transitions() <= self.again {
            return TickOutcome::Again;
        }
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        self.home
    }

    fn fini(self: Box<Self>, _info: FiniInfo) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }
}

fn bench_domain(nr_localities: usize) -> Domain {
    let config = DomainConfig::new()
        .nr_localities(nr_localities)
        .park_timeout(Duration::from_millis(10));
    Domain::with_default_policy(config).unwrap()
}

fn bench_queue_to_fini(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_to_fini");
    let batch = 1024;
    group.throughput(Throughput::Elements(batch as u64));

    for nr in [1, 2, 4] {
        let domain = bench_domain(nr);
        let done = Arc::new(AtomicUsize::new(0));
        group.bench_with_input(BenchmarkId::from_parameter(nr), &nr, |b, _| {
            b.iter(|| {
                for i in 0..batch {
                    domain.queue(Box::new(Short {
                        again: 3,
                        home: i,
                        done: Arc::clone(&done),
                    }));
                }
                assert!(domain.wait_idle(Duration::from_secs(30)));
            });
        });
        domain.fini();
    }
    group.finish();
}

/// Waits on a channel, finishes once signalled
struct Listener {
    chan: Arc<Chan>,
}

impl Fom for Listener {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if ctx.phase() == Phase::INIT {
            ctx.wait_on(&self.chan);
            ctx.set_phase(Phase::type_specific(0));
        } else {
            ctx.set_phase(Phase::FINISH);
        }
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }
}

fn bench_signal_round_trip(c: &mut Criterion) {
    let domain = bench_domain(1);
    let chan = Arc::new(Chan::new());

    c.bench_function("signal_round_trip", |b| {
        b.iter(|| {
            domain.queue(Box::new(Listener {
                chan: Arc::clone(&chan),
            }));
            while !chan.signal() {
                std::hint::spin_loop();
            }
            assert!(domain.wait_idle(Duration::from_secs(30)));
        });
    });
    domain.fini();
}

criterion_group!(benches, bench_queue_to_fini, bench_signal_round_trip);
criterion_main!(benches);

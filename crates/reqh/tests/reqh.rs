//! Request handler: fop intake, registry errors, shutdown and services

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use fom_core::{FomError, FomResult};
use fom_runtime::{DomainConfig, DomainHandle, FiniInfo, Fom, FomContext, Phase, TickOutcome};
use reqh::{
    Fop, FopType, RequestHandler, Service, ServicePhase, ServiceState, ServiceType,
};

const TIMEOUT: Duration = Duration::from_secs(10);
const ECHO: FopType = FopType::new("echo", 10);

fn handler() -> RequestHandler {
    let config = DomainConfig::new()
        .nr_localities(2)
        .park_timeout(Duration::from_millis(20));
    RequestHandler::with_default_policy(config).unwrap()
}

/// Sends its payload back once run
struct Echo {
    value: u64,
    reply: mpsc::Sender<u64>,
}

impl Fom for Echo {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        let _ = self.reply.send(self.value);
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, nr: usize) -> usize {
        self.value as usize % nr
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

fn register_echo(reqh: &RequestHandler, reply: mpsc::Sender<u64>) {
    let reply = parking_lot::Mutex::new(reply);
    reqh.register_fom_type(
        ECHO,
        Arc::new(move |fop: Fop| -> FomResult<Box<dyn Fom>> {
            let value = fop
                .into_payload::<u64>()
                .map_err(|fop| FomError::Factory(format!("bad payload for opcode {}", fop.opcode())))?;
            Ok(Box::new(Echo {
                value,
                reply: reply.lock().clone(),
            }))
        }),
    )
    .unwrap();
}

#[test]
fn fops_become_foms() {
    let reqh = handler();
    let (tx, rx) = mpsc::channel();
    register_echo(&reqh, tx);
    assert_eq!(reqh.fop_type(ECHO.opcode), Some(ECHO));

    let mut ids = Vec::new();
    for value in 0..100u64 {
        ids.push(reqh.fop_handle(Fop::new(ECHO.opcode, value)).unwrap());
    }
    let mut seen: Vec<u64> = (0..100).map(|_| rx.recv_timeout(TIMEOUT).unwrap()).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
    assert_eq!(ids[3].locality().as_usize(), 1);
    assert_eq!(reqh.handled(), 100);

    assert!(reqh.shutdown(TIMEOUT));
    reqh.fini();
}

#[test]
fn creation_errors_never_reach_scheduler() {
    let reqh = handler();
    let (tx, _rx) = mpsc::channel();
    register_echo(&reqh, tx);

    assert_eq!(
        reqh.fop_handle(Fop::empty(99)).unwrap_err(),
        FomError::NoSuchFomType { opcode: 99 }
    );
    assert!(matches!(
        reqh.fop_handle(Fop::new(ECHO.opcode, "not a number")),
        Err(FomError::Factory(_))
    ));
    assert_eq!(reqh.handled(), 0);
    assert_eq!(reqh.domain().active_foms(), 0);

    let (tx, _rx) = mpsc::channel();
    let dup = Arc::new(move |_fop: Fop| -> FomResult<Box<dyn Fom>> {
        Ok(Box::new(Echo {
            value: 0,
            reply: tx.clone(),
        }))
    });
    assert_eq!(
        reqh.register_fom_type(ECHO, dup).unwrap_err(),
        FomError::FomTypeExists { opcode: 10 }
    );
    assert!(reqh.unregister_fom_type(ECHO.opcode));
    assert!(!reqh.unregister_fom_type(ECHO.opcode));

    assert!(reqh.shutdown(TIMEOUT));
    reqh.fini();
}

/// Finishes only when its channel is signalled
struct Slow {
    done: mpsc::Receiver<()>,
    fini: Arc<AtomicUsize>,
}

impl Fom for Slow {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        if self.done.try_recv().is_err() {
            ctx.block(|| std::thread::sleep(Duration::from_millis(5)));
            return TickOutcome::Again;
        }
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }

    fn fini(self: Box<Self>, _info: FiniInfo) {
        self.fini.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn shutdown_rejects_new_fops_and_drains() {
    let reqh = handler();
    let fini = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = mpsc::channel();
    let slot = parking_lot::Mutex::new(Some(done_rx));
    let fini_count = Arc::clone(&fini);
    reqh.register_fom_type(
        FopType::new("slow", 20),
        Arc::new(move |_fop: Fop| -> FomResult<Box<dyn Fom>> {
            let done = slot
                .lock()
                .take()
                .ok_or_else(|| FomError::Factory("only one slow fop".into()))?;
            Ok(Box::new(Slow {
                done,
                fini: Arc::clone(&fini_count),
            }))
        }),
    )
    .unwrap();

    reqh.fop_handle(Fop::empty(20)).unwrap();
    assert!(!reqh.shutdown(Duration::from_millis(50)));
    assert!(reqh.is_shutting_down());
    assert_eq!(reqh.fop_handle(Fop::empty(20)).unwrap_err(), FomError::ShuttingDown);

    done_tx.send(()).unwrap();
    assert!(reqh.shutdown(TIMEOUT));
    assert_eq!(fini.load(Ordering::SeqCst), 1);
    reqh.fini();
}

#[test]
fn shutdown_waits_for_fops_being_created() {
    let reqh = handler();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();
    let entered = parking_lot::Mutex::new(entered_tx);
    let reply = parking_lot::Mutex::new(reply_tx);
    reqh.register_fom_type(
        FopType::new("slow-create", 30),
        Arc::new(move |_fop: Fop| -> FomResult<Box<dyn Fom>> {
            let _ = entered.lock().send(());
            std::thread::sleep(Duration::from_millis(200));
            Ok(Box::new(Echo {
                value: 7,
                reply: reply.lock().clone(),
            }))
        }),
    )
    .unwrap();

    std::thread::scope(|s| {
        let intake = s.spawn(|| reqh.fop_handle(Fop::empty(30)));
        entered_rx.recv_timeout(TIMEOUT).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert!(reqh.shutdown(TIMEOUT));
        assert!(intake.join().unwrap().is_ok());
    });
    assert_eq!(reply_rx.recv_timeout(TIMEOUT).unwrap(), 7);
    assert_eq!(reqh.domain().active_foms(), 0);
    assert_eq!(reqh.fop_handle(Fop::empty(30)).unwrap_err(), FomError::ShuttingDown);
    reqh.fini();
}

/// Records its life-cycle calls; queues one FOM at start
struct Recorder {
    log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    fail: bool,
}

struct Noop;

impl Fom for Noop {
    fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
        ctx.set_phase(Phase::FINISH);
        TickOutcome::Wait
    }

    fn home_locality(&self, _nr: usize) -> usize {
        0
    }
}

impl Service for Recorder {
    fn start(&mut self, domain: &DomainHandle) -> Result<(), String> {
        self.log.lock().push("start");
        if self.fail {
            return Err("no resources".into());
        }
        domain.queue(Box::new(Noop));
        Ok(())
    }

    fn stop(&mut self, _domain: &DomainHandle) {
        self.log.lock().push("stop");
    }

    fn fini(self: Box<Self>) {
        self.log.lock().push("fini");
    }
}

struct RecorderType {
    name: &'static str,
    log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    fail: bool,
}

impl ServiceType for RecorderType {
    fn name(&self) -> &'static str {
        self.name
    }

    fn alloc_and_init(&self) -> FomResult<Box<dyn Service>> {
        self.log.lock().push("alloc");
        Ok(Box::new(Recorder {
            log: Arc::clone(&self.log),
            fail: self.fail,
        }))
    }
}

#[test]
fn service_life_cycle() {
    let reqh = handler();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    reqh.register_service_type(Arc::new(RecorderType {
        name: "recorder",
        log: Arc::clone(&log),
        fail: false,
    }))
    .unwrap();

    assert_eq!(
        reqh.service_start("missing").unwrap_err(),
        FomError::ServiceNotFound("missing".into())
    );

    let uuid = reqh.service_start("recorder").unwrap();
    assert!(uuid.as_str().starts_with("recorder:"));
    let info = reqh.service_info("recorder").unwrap();
    assert_eq!(info.phase, ServicePhase::Started);
    assert_eq!(info.state, ServiceState::Running);
    assert_eq!(info.uuid, uuid);
    assert_eq!(
        reqh.service_start("recorder").unwrap_err(),
        FomError::ServiceExists("recorder".into())
    );
    assert!(reqh.domain().wait_idle(TIMEOUT));

    let stopped = reqh.service_stop("recorder").unwrap();
    assert_eq!(stopped.phase, ServicePhase::Stopped);
    assert_eq!(stopped.state, ServiceState::Stopped);
    assert!(reqh.services().is_empty());
    assert_eq!(*log.lock(), vec!["alloc", "start", "stop", "fini"]);

    assert!(reqh.shutdown(TIMEOUT));
    reqh.fini();
}

#[test]
fn failed_service_is_finalised() {
    let reqh = handler();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    reqh.register_service_type(Arc::new(RecorderType {
        name: "broken",
        log: Arc::clone(&log),
        fail: true,
    }))
    .unwrap();

    assert_eq!(
        reqh.service_start("broken").unwrap_err(),
        FomError::ServiceStart {
            name: "broken".into(),
            reason: "no resources".into(),
        }
    );
    assert!(reqh.service_info("broken").is_none());
    assert_eq!(*log.lock(), vec!["alloc", "start", "fini"]);
    assert_eq!(
        reqh.service_stop("broken").unwrap_err(),
        FomError::ServiceNotFound("broken".into())
    );

    assert!(reqh.shutdown(TIMEOUT));
    reqh.fini();
}

#[test]
fn shutdown_stops_running_services() {
    let reqh = handler();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    reqh.register_service_type(Arc::new(RecorderType {
        name: "recorder",
        log: Arc::clone(&log),
        fail: false,
    }))
    .unwrap();
    assert!(reqh
        .register_service_type(Arc::new(RecorderType {
            name: "recorder",
            log: Arc::clone(&log),
            fail: false,
        }))
        .is_err());

    reqh.service_start("recorder").unwrap();
    assert!(reqh.shutdown(TIMEOUT));
    assert!(reqh.services().is_empty());
    assert_eq!(reqh.service_start("recorder").unwrap_err(), FomError::ShuttingDown);
    assert_eq!(*log.lock(), vec!["alloc", "start", "stop", "fini"]);
    reqh.fini();
}

//! # reqh
//!
//! Request handler on top of `fom-runtime`.
//!
//! Fops (incoming requests) are matched by opcode to a registered
//! [`FomType`], which builds a FOM; the FOM is queued on its home locality
//! of the handler's domain. Services bundle FOM types and resources and are
//! started and stopped through the handler. FOM types that go through the
//! usual authentication, resource, transaction and reply steps can leave
//! those to [`generic`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use fom_runtime::{DomainConfig, Fom, FomContext, FomResult, Phase, TickOutcome};
//! use reqh::{Fop, FopType, RequestHandler};
//!
//! struct Ping;
//!
//! impl Fom for Ping {
//!     fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
//!         ctx.set_phase(Phase::FINISH);
//!         TickOutcome::Wait
//!     }
//!
//!     fn home_locality(&self, _nr: usize) -> usize {
//!         0
//!     }
//! }
//!
//! let reqh = RequestHandler::with_default_policy(DomainConfig::from_env()).unwrap();
//! reqh.register_fom_type(
//!     FopType::new("ping", 1),
//!     Arc::new(|_fop: Fop| -> FomResult<Box<dyn Fom>> { Ok(Box::new(Ping)) }),
//! )
//! .unwrap();
//! reqh.fop_handle(Fop::empty(1)).unwrap();
//! reqh.shutdown(Duration::from_secs(1));
//! reqh.fini();
//! ```

pub mod fop;
pub mod generic;
pub mod service;

mod reqh;

pub use fop::{FomType, Fop, FopType};
pub use generic::{GenericFom, GenericState, Step};
pub use reqh::RequestHandler;
pub use service::{
    Service, ServiceInfo, ServicePhase, ServiceState, ServiceType, ServiceUuid, SERVICE_UUID_SIZE,
};

//! Request handler: turns fops into queued FOMs

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fom_core::{FomError, FomId, FomResult};
use fom_runtime::{DefaultPolicy, Domain, DomainConfig, DomainHandle, DomainPolicy};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::fop::{Fop, FomType, FopType};
use crate::service::{ServiceInfo, ServiceInstance, ServiceType, ServiceUuid};

struct Registered {
    fop_type: FopType,
    factory: Arc<dyn FomType>,
}

/// Request handler owning one domain
///
/// ```text
///   fop ──► fop_handle ──► FomType::create ──► Domain::queue ──► home locality
///                │                │
///                │ shutting down  │ error
///                ▼                ▼
///           ShuttingDown     returned to caller
/// ```
pub struct RequestHandler {
    domain: Domain,
    fom_types: RwLock<HashMap<u32, Registered>>,
    service_types: Mutex<HashMap<&'static str, Arc<dyn ServiceType>>>,
    services: Mutex<Vec<ServiceInstance>>,
    /// Held for read while a fop or service is admitted, for write by shutdown
    intake: RwLock<()>,
    shutting_down: AtomicBool,
    handled: AtomicU64,
}

impl RequestHandler {
    pub fn new(config: DomainConfig, policy: Arc<dyn DomainPolicy>) -> FomResult<Self> {
        let domain = Domain::new(config, policy)?;
        info!(nr_localities = domain.nr_localities(), "request handler started");
        Ok(Self {
            domain,
            fom_types: RwLock::new(HashMap::new()),
            service_types: Mutex::new(HashMap::new()),
            services: Mutex::new(Vec::new()),
            intake: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
            handled: AtomicU64::new(0),
        })
    }

    pub fn with_default_policy(config: DomainConfig) -> FomResult<Self> {
        Self::new(config, Arc::new(DefaultPolicy))
    }

    /// Handle of the domain serving this request handler
    pub fn domain(&self) -> DomainHandle {
        self.domain.handle()
    }

    /// Register the factory serving `fop_type.opcode`
    pub fn register_fom_type(&self, fop_type: FopType, factory: Arc<dyn FomType>) -> FomResult<()> {
        let mut types = self.fom_types.write();
        if types.contains_key(&fop_type.opcode) {
            return Err(FomError::FomTypeExists {
                opcode: fop_type.opcode,
            });
        }
        types.insert(fop_type.opcode, Registered { fop_type, factory });
        debug!(fop_type = %fop_type, "fom type registered");
        Ok(())
    }

    /// Remove the factory for `opcode`; true if one was registered
    pub fn unregister_fom_type(&self, opcode: u32) -> bool {
        self.fom_types.write().remove(&opcode).is_some()
    }

    pub fn fop_type(&self, opcode: u32) -> Option<FopType> {
        self.fom_types.read().get(&opcode).map(|r| r.fop_type)
    }

    /// Create a FOM for `fop` and queue it on its home locality
    ///
    /// Fails while shutting down, for unregistered opcodes and when the
    /// FOM type's factory fails. Nothing is queued on failure. A FOM
    /// created here is queued before [`shutdown`](Self::shutdown) starts
    /// waiting for the domain to drain.
    pub fn fop_handle(&self, fop: Fop) -> FomResult<FomId> {
        let _intake = self.intake.read_recursive();
        if self.is_shutting_down() {
            return Err(FomError::ShuttingDown);
        }
        let opcode = fop.opcode();
        let factory = match self.fom_types.read().get(&opcode) {
            Some(registered) => Arc::clone(&registered.factory),
            None => return Err(FomError::NoSuchFomType { opcode }),
        };

        let fom = factory.create(fop)?;
        let id = self.domain.queue(fom);
        self.handled.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Fops turned into FOMs so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn register_service_type(&self, ty: Arc<dyn ServiceType>) -> FomResult<()> {
        let name = ty.name();
        let mut types = self.service_types.lock();
        if types.contains_key(name) {
            return Err(FomError::ServiceExists(name.to_string()));
        }
        types.insert(name, ty);
        debug!(service = name, "service type registered");
        Ok(())
    }

    /// Remove a service type; running instances are not affected
    pub fn unregister_service_type(&self, name: &str) -> bool {
        self.service_types.lock().remove(name).is_some()
    }

    /// Create and start an instance of the service type `name`
    ///
    /// At most one instance per service type runs at a time.
    pub fn service_start(&self, name: &str) -> FomResult<ServiceUuid> {
        let _intake = self.intake.read_recursive();
        if self.is_shutting_down() {
            return Err(FomError::ShuttingDown);
        }
        let ty = self
            .service_types
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| FomError::ServiceNotFound(name.to_string()))?;
        if self.service_info(name).is_some() {
            return Err(FomError::ServiceExists(name.to_string()));
        }

        let svc = ServiceInstance::init(ty.as_ref())?.start(&self.domain)?;
        let uuid = svc.info().uuid;

        let mut services = self.services.lock();
        if services.iter().any(|s| s.name() == svc.name()) {
            drop(services);
            warn!(service = name, "service started twice concurrently, stopping duplicate");
            svc.stop(&self.domain)?;
            return Err(FomError::ServiceExists(name.to_string()));
        }
        services.push(svc);
        Ok(uuid)
    }

    /// Stop and finalise the running instance of `name`
    pub fn service_stop(&self, name: &str) -> FomResult<ServiceInfo> {
        let svc = {
            let mut services = self.services.lock();
            let Some(pos) = services.iter().position(|s| s.name() == name) else {
                return Err(FomError::ServiceNotFound(name.to_string()));
            };
            services.remove(pos)
        };
        svc.stop(&self.domain)
    }

    pub fn service_info(&self, name: &str) -> Option<ServiceInfo> {
        self.services
            .lock()
            .iter()
            .find(|s| s.name() == name)
            .map(ServiceInstance::info)
    }

    /// Running services, in start order
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.lock().iter().map(ServiceInstance::info).collect()
    }

    /// Stop accepting fops, stop services and wait for the domain to drain
    ///
    /// Returns false if FOMs are still active after `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let first = {
            // waits out fop_handle and service_start calls already admitted
            let _intake = self.intake.write();
            !self.shutting_down.swap(true, Ordering::AcqRel)
        };
        if !first {
            return self.domain.wait_idle(timeout);
        }
        info!("request handler shutting down");

        let services = std::mem::take(&mut *self.services.lock());
        for svc in services.into_iter().rev() {
            let name = svc.name();
            if let Err(err) = svc.stop(&self.domain) {
                warn!(service = name, %err, "service stop failed");
            }
        }

        let idle = self.domain.wait_idle(timeout);
        if !idle {
            warn!(active = self.domain.active_foms(), "foms still active after shutdown timeout");
        }
        idle
    }

    /// Finalise the domain
    ///
    /// # Panics
    ///
    /// If FOMs are still active; call [`shutdown`](Self::shutdown) first.
    pub fn fini(self) {
        let services = self.services.lock().len();
        assert!(services == 0, "request handler finalised with {services} running services");
        self.domain.fini();
        debug!("request handler finalised");
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("domain", &self.domain)
            .field("fom_types", &self.fom_types.read().len())
            .field("services", &self.services.lock().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

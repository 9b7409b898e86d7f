//! Request handler services
//!
//! A service groups FOM types and resources that belong together (an I/O
//! service, a metadata service, ...). Service types are registered on a
//! request handler, which creates, starts and stops their instances.
//!
//! ```text
//!   alloc_and_init ─► INITIALISING ─► INITIALISED ─► STARTING ──start ok──► STARTED
//!    state UNDEFINED                  state READY        │                 state RUNNING
//!                                                        │ start failed        │ stop
//!                                                        ▼                     ▼
//!                                                     FAILED               STOPPING
//!                                                                              │
//!                                                                              ▼
//!                                                                           STOPPED
//!                                                                        state STOPPED
//! ```

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use fom_core::{FomError, FomResult};
use fom_runtime::DomainHandle;
use tracing::{debug, info, warn};

/// Maximum length of a service uuid
pub const SERVICE_UUID_SIZE: usize = 64;

/// Step of a service's life-cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePhase {
    Initialising,
    Initialised,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
}

impl ServicePhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            ServicePhase::Initialising => "INITIALISING",
            ServicePhase::Initialised => "INITIALISED",
            ServicePhase::Starting => "STARTING",
            ServicePhase::Started => "STARTED",
            ServicePhase::Stopping => "STOPPING",
            ServicePhase::Stopped => "STOPPED",
            ServicePhase::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ServicePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse availability of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Undefined,
    Ready,
    Running,
    Stopped,
}

/// Identity of a service instance: its type name and creation time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUuid(String);

impl ServiceUuid {
    /// `name:<hex nanoseconds>`, at most `SERVICE_UUID_SIZE` bytes
    ///
    /// Long names are shortened; the timestamp is always kept whole.
    pub fn generate(name: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let stamp = format!(":{nanos:x}");
        let mut cut = name.len().min(SERVICE_UUID_SIZE.saturating_sub(stamp.len()));
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        ServiceUuid(format!("{}{stamp}", &name[..cut]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Behaviour of a running service
pub trait Service: Send + 'static {
    /// Service specific start-up, e.g. registering FOM types or queueing
    /// long-running FOMs
    fn start(&mut self, domain: &DomainHandle) -> Result<(), String>;

    /// Service specific shutdown; no request for the service is handled
    /// afterwards
    fn stop(&mut self, domain: &DomainHandle);

    /// Release what `alloc_and_init` acquired
    fn fini(self: Box<Self>) {}
}

/// Factory of service instances, registered by name
pub trait ServiceType: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Allocate a service and do internal housekeeping only
    fn alloc_and_init(&self) -> FomResult<Box<dyn Service>>;
}

/// Snapshot of a service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub uuid: ServiceUuid,
    pub phase: ServicePhase,
    pub state: ServiceState,
}

/// A service instance and its life-cycle bookkeeping
pub(crate) struct ServiceInstance {
    name: &'static str,
    uuid: ServiceUuid,
    phase: ServicePhase,
    state: ServiceState,
    ops: Box<dyn Service>,
}

impl ServiceInstance {
    /// Allocate through the type and run the generic initialisation
    pub(crate) fn init(ty: &dyn ServiceType) -> FomResult<Self> {
        let name = ty.name();
        let ops = ty.alloc_and_init()?;
        let mut svc = Self {
            name,
            uuid: ServiceUuid::generate(name),
            phase: ServicePhase::Initialising,
            state: ServiceState::Undefined,
            ops,
        };
        svc.phase = ServicePhase::Initialised;
        svc.state = ServiceState::Ready;
        debug!(service = name, uuid = %svc.uuid, "service initialised");
        Ok(svc)
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: self.name,
            uuid: self.uuid.clone(),
            phase: self.phase,
            state: self.state,
        }
    }

    fn invalid(&self) -> FomError {
        FomError::InvalidServicePhase {
            name: self.name.to_string(),
            phase: self.phase.as_str(),
        }
    }

    /// INITIALISED → STARTING → STARTED, or FAILED
    ///
    /// A failed service is finalised and consumed.
    pub(crate) fn start(mut self, domain: &DomainHandle) -> FomResult<Self> {
        if self.phase != ServicePhase::Initialised {
            return Err(self.invalid());
        }
        self.phase = ServicePhase::Starting;
        match self.ops.start(domain) {
            Ok(()) => {
                self.phase = ServicePhase::Started;
                self.state = ServiceState::Running;
                info!(service = self.name, uuid = %self.uuid, "service started");
                Ok(self)
            }
            Err(reason) => {
                self.phase = ServicePhase::Failed;
                warn!(service = self.name, %reason, "service failed to start");
                let name = self.name.to_string();
                self.ops.fini();
                Err(FomError::ServiceStart { name, reason })
            }
        }
    }

    /// STARTED → STOPPING → STOPPED, then finalise
    pub(crate) fn stop(mut self, domain: &DomainHandle) -> FomResult<ServiceInfo> {
        if self.phase != ServicePhase::Started {
            return Err(self.invalid());
        }
        self.phase = ServicePhase::Stopping;
        self.ops.stop(domain);
        self.phase = ServicePhase::Stopped;
        self.state = ServiceState::Stopped;
        info!(service = self.name, uuid = %self.uuid, "service stopped");

        let info = self.info();
        self.ops.fini();
        Ok(info)
    }
}

//! FOM run state, phase and tick outcome types

use core::fmt;

/// Scheduler-level state of a FOM
///
/// Orthogonal to [`Phase`]: the run state says where the FOM sits in its
/// locality, the phase says how far the operation has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// In the run-queue of its home locality
    Ready = 0,

    /// Owned by a handler thread that is executing its tick
    Running = 1,

    /// In the wait-list of its home locality
    Waiting = 2,
}

impl RunState {
    /// Check if this FOM sits on one of the locality lists
    #[inline]
    pub const fn is_listed(&self) -> bool {
        matches!(self, RunState::Ready | RunState::Waiting)
    }
}

impl From<RunState> for u8 {
    fn from(state: RunState) -> u8 {
        state as u8
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Ready => write!(f, "READY"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Waiting => write!(f, "WAITING"),
        }
    }
}

/// Type-specific step of a FOM
///
/// The scheduler only interprets [`Phase::INIT`] and [`Phase::FINISH`].
/// The other values below [`Phase::NR`] are standard phases shared by FOM
/// types that run the generic request phases (authentication, resources,
/// transaction, reply); values from `NR` upwards belong to the individual
/// FOM type. Every standard phase that can wait has a `_WAIT` companion
/// the FOM resumes in.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Phase(pub u32);

impl Phase {
    /// Initial phase of every FOM
    pub const INIT: Phase = Phase(0);

    /// Terminal phase; a FOM returning `Wait` here is finalised
    pub const FINISH: Phase = Phase(1);

    /// Standard failure phase
    pub const FAILURE: Phase = Phase(2);

    /// Standard phase entered when the domain decides a waiting FOM timed out
    pub const TIMEOUT: Phase = Phase(3);

    pub const AUTHENTICATE: Phase = Phase(4);
    pub const AUTHENTICATE_WAIT: Phase = Phase(5);
    pub const RESOURCE_LOCAL: Phase = Phase(6);
    pub const RESOURCE_LOCAL_WAIT: Phase = Phase(7);
    pub const RESOURCE_DISTRIBUTED: Phase = Phase(8);
    pub const RESOURCE_DISTRIBUTED_WAIT: Phase = Phase(9);
    pub const OBJECT_CHECK: Phase = Phase(10);
    pub const OBJECT_CHECK_WAIT: Phase = Phase(11);
    pub const AUTHORISATION: Phase = Phase(12);
    pub const AUTHORISATION_WAIT: Phase = Phase(13);
    pub const TXN_CONTEXT: Phase = Phase(14);
    pub const TXN_CONTEXT_WAIT: Phase = Phase(15);
    /// Type-specific phases done; entered by the FOM type itself
    pub const SUCCESS: Phase = Phase(16);
    pub const LOG_RECORD: Phase = Phase(17);
    pub const TXN_COMMIT: Phase = Phase(18);
    pub const TXN_COMMIT_WAIT: Phase = Phase(19);
    pub const TXN_ABORT: Phase = Phase(20);
    pub const TXN_ABORT_WAIT: Phase = Phase(21);
    pub const QUEUE_REPLY: Phase = Phase(22);
    pub const QUEUE_REPLY_WAIT: Phase = Phase(23);

    /// Number of standard phases
    pub const NR: u32 = 24;

    /// The `n`-th type specific phase
    #[inline]
    pub const fn type_specific(n: u32) -> Phase {
        Phase(Self::NR + n)
    }

    #[inline]
    pub const fn is_init(self) -> bool {
        self.0 == Self::INIT.0
    }

    #[inline]
    pub const fn is_finish(self) -> bool {
        self.0 == Self::FINISH.0
    }

    #[inline]
    pub const fn is_standard(self) -> bool {
        self.0 < Self::NR
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Name of a standard phase
    pub const fn standard_name(self) -> Option<&'static str> {
        const NAMES: [&str; Phase::NR as usize] = [
            "INIT",
            "FINISH",
            "FAILURE",
            "TIMEOUT",
            "AUTHENTICATE",
            "AUTHENTICATE_WAIT",
            "RESOURCE_LOCAL",
            "RESOURCE_LOCAL_WAIT",
            "RESOURCE_DISTRIBUTED",
            "RESOURCE_DISTRIBUTED_WAIT",
            "OBJECT_CHECK",
            "OBJECT_CHECK_WAIT",
            "AUTHORISATION",
            "AUTHORISATION_WAIT",
            "TXN_CONTEXT",
            "TXN_CONTEXT_WAIT",
            "SUCCESS",
            "LOG_RECORD",
            "TXN_COMMIT",
            "TXN_COMMIT_WAIT",
            "TXN_ABORT",
            "TXN_ABORT_WAIT",
            "QUEUE_REPLY",
            "QUEUE_REPLY_WAIT",
        ];
        if self.is_standard() {
            Some(NAMES[self.0 as usize])
        } else {
            None
        }
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.standard_name() {
            Some(name) => write!(f, "Phase({})", name),
            None => write!(f, "Phase({})", self.0),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a single phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another transition is immediately possible
    Again,

    /// No further transition is possible until some event happens.
    /// With the phase at `FINISH` the FOM is finalised.
    Wait,
}

impl TickOutcome {
    /// `Again` when `progressed`, otherwise `Wait`
    #[inline]
    pub const fn from_progress(progressed: bool) -> Self {
        if progressed {
            TickOutcome::Again
        } else {
            TickOutcome::Wait
        }
    }
}

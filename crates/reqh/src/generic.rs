//! Standard request phases shared by FOM types
//!
//! Most FOMs serving a fop go through the same steps around their own
//! work. A FOM type implements the [`GenericFom`] hooks it cares about and
//! lets [`tick`] drive the standard phases, handling only the phases from
//! [`GenericFom::first_phase`] on itself:
//!
//! ```text
//!  INIT ─► AUTHENTICATE ─► RESOURCE_LOCAL ─► RESOURCE_DISTRIBUTED
//!       ─► OBJECT_CHECK ─► AUTHORISATION ─► TXN_CONTEXT
//!       ─► type-specific phases ─► SUCCESS ─► LOG_RECORD ─► TXN_COMMIT
//!       ─► QUEUE_REPLY ─► FINISH
//!
//!  TIMEOUT ─► FAILURE ─► TXN_ABORT ─► QUEUE_REPLY ─► FINISH
//! ```
//!
//! A hook error before `TXN_COMMIT` records the error and moves the FOM to
//! `FAILURE`. A hook that returns [`Step::Wait`] has arranged a wakeup; the
//! FOM resumes in the phase's `_WAIT` companion, which moves on without
//! running the hook again.
//!
//! ```ignore
//! impl Fom for Create {
//!     fn tick(&mut self, ctx: &mut FomContext<'_>) -> TickOutcome {
//!         if let Some(outcome) = generic::tick(self, ctx) {
//!             return outcome;
//!         }
//!         match self.create_object() {
//!             Ok(()) => generic::success(ctx),
//!             Err(err) => generic::failure(self, ctx, err),
//!         }
//!     }
//!     // ...
//! }
//! ```

use fom_core::{FomError, FomResult, Phase, TickOutcome};
use fom_runtime::FomContext;
use tracing::{debug, trace, warn};

/// What a hook asks of the phase engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move on to the next phase at once
    Next,
    /// Wait for a wakeup the hook arranged, then move on
    Wait,
}

/// Outcome of the operation and transaction state, kept by the FOM
#[derive(Debug, Default)]
pub struct GenericState {
    error: Option<FomError>,
    txn_open: bool,
}

impl GenericState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First error recorded, if any
    pub fn error(&self) -> Option<&FomError> {
        self.error.as_ref()
    }

    /// Between a successful `txn_open` and commit or abort
    pub fn is_txn_open(&self) -> bool {
        self.txn_open
    }

    fn record(&mut self, err: FomError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

/// Hooks of a FOM type running the standard phases
///
/// Every hook except [`queue_reply`](Self::queue_reply) defaults to
/// moving on. Hooks run under the group lock of the FOM's locality; use
/// [`FomContext::block`] around anything that may block the thread.
pub trait GenericFom {
    fn generic(&mut self) -> &mut GenericState;

    fn authenticate(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Acquire resources held by this node
    fn resource_local(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Acquire resources coordinated with other nodes
    fn resource_distributed(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Check that the objects the fop refers to exist
    fn object_check(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    fn authorise(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Open the transaction the type-specific phases run in
    ///
    /// On `Ok` the transaction counts as open and is later committed or
    /// aborted.
    fn txn_open(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Add the operation to the persistent log, inside the transaction
    fn log_record(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    fn txn_commit(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    fn txn_abort(&mut self, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
        Ok(Step::Next)
    }

    /// Send the reply: `Ok` after success, the first error otherwise
    fn queue_reply(
        &mut self,
        ctx: &mut FomContext<'_>,
        result: Result<(), FomError>,
    ) -> FomResult<Step>;

    /// Phase entered after `TXN_CONTEXT`
    fn first_phase(&self) -> Phase {
        Phase::type_specific(0)
    }
}

/// Run one standard phase of `fom`
///
/// Returns `None` in a type-specific phase, which the caller handles.
pub fn tick<F: GenericFom + ?Sized>(fom: &mut F, ctx: &mut FomContext<'_>) -> Option<TickOutcome> {
    let phase = ctx.phase();
    if phase.is_finish() {
        return Some(TickOutcome::Wait);
    }
    let ops = describe::<F>(phase)?;

    let outcome = match (ops.action)(fom, ctx) {
        Ok(Step::Next) => {
            let next = match ops.next {
                Then::Phase(next) => next,
                Then::TypeSpecific => fom.first_phase(),
            };
            ctx.set_phase(next);
            TickOutcome::from_progress(!next.is_finish())
        }
        Ok(Step::Wait) => {
            if let Some(wait) = ops.wait {
                ctx.set_phase(wait);
            }
            TickOutcome::Wait
        }
        Err(err) => {
            debug!(fom = %ctx.id(), phase = ops.name, %err, "standard phase failed");
            fom.generic().record(err);
            ctx.set_phase(ops.on_error);
            TickOutcome::from_progress(!ops.on_error.is_finish())
        }
    };
    trace!(fom = %ctx.id(), from = ops.name, to = %ctx.phase(), ?outcome, "standard phase");
    Some(outcome)
}

/// Leave the type-specific phases after success
pub fn success(ctx: &mut FomContext<'_>) -> TickOutcome {
    ctx.set_phase(Phase::SUCCESS);
    TickOutcome::Again
}

/// Leave the type-specific phases with `err`
pub fn failure<F: GenericFom + ?Sized>(
    fom: &mut F,
    ctx: &mut FomContext<'_>,
    err: FomError,
) -> TickOutcome {
    fom.generic().record(err);
    ctx.set_phase(Phase::FAILURE);
    TickOutcome::Again
}

type Action<F> = fn(&mut F, &mut FomContext<'_>) -> FomResult<Step>;

#[derive(Debug, Clone, Copy)]
enum Then {
    Phase(Phase),
    TypeSpecific,
}

/// Row of the standard phase table
struct PhaseOps<F: ?Sized> {
    name: &'static str,
    action: Action<F>,
    /// Phase to resume in after `Step::Wait`; `None` reruns the action
    wait: Option<Phase>,
    next: Then,
    on_error: Phase,
}

impl<F: ?Sized> PhaseOps<F> {
    fn new(name: &'static str, action: Action<F>, next: Then) -> Self {
        Self {
            name,
            action,
            wait: None,
            next,
            on_error: Phase::FAILURE,
        }
    }

    fn waits_in(mut self, wait: Phase) -> Self {
        self.wait = Some(wait);
        self
    }

    fn on_error(mut self, phase: Phase) -> Self {
        self.on_error = phase;
        self
    }
}

fn describe<F: GenericFom + ?Sized>(phase: Phase) -> Option<PhaseOps<F>> {
    use Then::Phase as To;

    let ops: PhaseOps<F> = match phase {
        Phase::INIT => PhaseOps::new("init", pass::<F>, To(Phase::AUTHENTICATE)),
        Phase::AUTHENTICATE => {
            PhaseOps::new("authenticate", F::authenticate, To(Phase::RESOURCE_LOCAL))
                .waits_in(Phase::AUTHENTICATE_WAIT)
        }
        Phase::AUTHENTICATE_WAIT => {
            PhaseOps::new("authenticate_wait", pass::<F>, To(Phase::RESOURCE_LOCAL))
        }
        Phase::RESOURCE_LOCAL => {
            PhaseOps::new("resource_local", F::resource_local, To(Phase::RESOURCE_DISTRIBUTED))
                .waits_in(Phase::RESOURCE_LOCAL_WAIT)
        }
        Phase::RESOURCE_LOCAL_WAIT => {
            PhaseOps::new("resource_local_wait", pass::<F>, To(Phase::RESOURCE_DISTRIBUTED))
        }
        Phase::RESOURCE_DISTRIBUTED => PhaseOps::new(
            "resource_distributed",
            F::resource_distributed,
            To(Phase::OBJECT_CHECK),
        )
        .waits_in(Phase::RESOURCE_DISTRIBUTED_WAIT),
        Phase::RESOURCE_DISTRIBUTED_WAIT => {
            PhaseOps::new("resource_distributed_wait", pass::<F>, To(Phase::OBJECT_CHECK))
        }
        Phase::OBJECT_CHECK => {
            PhaseOps::new("object_check", F::object_check, To(Phase::AUTHORISATION))
                .waits_in(Phase::OBJECT_CHECK_WAIT)
        }
        Phase::OBJECT_CHECK_WAIT => {
            PhaseOps::new("object_check_wait", pass::<F>, To(Phase::AUTHORISATION))
        }
        Phase::AUTHORISATION => PhaseOps::new("authorise", F::authorise, To(Phase::TXN_CONTEXT))
            .waits_in(Phase::AUTHORISATION_WAIT),
        Phase::AUTHORISATION_WAIT => {
            PhaseOps::new("authorisation_wait", pass::<F>, To(Phase::TXN_CONTEXT))
        }
        Phase::TXN_CONTEXT => PhaseOps::new("txn_open", open_txn::<F>, Then::TypeSpecific)
            .waits_in(Phase::TXN_CONTEXT_WAIT),
        Phase::TXN_CONTEXT_WAIT => PhaseOps::new("txn_open_wait", pass::<F>, Then::TypeSpecific),

        Phase::SUCCESS => PhaseOps::new("success", pass::<F>, To(Phase::LOG_RECORD)),
        Phase::LOG_RECORD => PhaseOps::new("log_record", F::log_record, To(Phase::TXN_COMMIT)),
        Phase::TXN_COMMIT => PhaseOps::new("txn_commit", commit_txn::<F>, To(Phase::QUEUE_REPLY))
            .waits_in(Phase::TXN_COMMIT_WAIT)
            .on_error(Phase::QUEUE_REPLY),
        Phase::TXN_COMMIT_WAIT => {
            PhaseOps::new("txn_commit_wait", pass::<F>, To(Phase::QUEUE_REPLY))
        }

        Phase::TIMEOUT => PhaseOps::new("timeout", timed_out::<F>, To(Phase::FAILURE)),
        Phase::FAILURE => PhaseOps::new("failure", failed::<F>, To(Phase::TXN_ABORT)),
        Phase::TXN_ABORT => PhaseOps::new("txn_abort", abort_txn::<F>, To(Phase::QUEUE_REPLY))
            .waits_in(Phase::TXN_ABORT_WAIT)
            .on_error(Phase::QUEUE_REPLY),
        Phase::TXN_ABORT_WAIT => {
            PhaseOps::new("txn_abort_wait", pass::<F>, To(Phase::QUEUE_REPLY))
        }

        Phase::QUEUE_REPLY => PhaseOps::new("queue_reply", reply::<F>, To(Phase::FINISH))
            .waits_in(Phase::QUEUE_REPLY_WAIT)
            .on_error(Phase::FINISH),
        Phase::QUEUE_REPLY_WAIT => PhaseOps::new("queue_reply_wait", pass::<F>, To(Phase::FINISH)),
        _ => return None,
    };
    Some(ops)
}

fn pass<F: ?Sized>(_fom: &mut F, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
    Ok(Step::Next)
}

fn open_txn<F: GenericFom + ?Sized>(fom: &mut F, ctx: &mut FomContext<'_>) -> FomResult<Step> {
    let step = fom.txn_open(ctx)?;
    fom.generic().txn_open = true;
    Ok(step)
}

/// The transaction is closed whatever the hook returns
fn commit_txn<F: GenericFom + ?Sized>(fom: &mut F, ctx: &mut FomContext<'_>) -> FomResult<Step> {
    if !std::mem::take(&mut fom.generic().txn_open) {
        return Ok(Step::Next);
    }
    fom.txn_commit(ctx)
}

fn abort_txn<F: GenericFom + ?Sized>(fom: &mut F, ctx: &mut FomContext<'_>) -> FomResult<Step> {
    if !std::mem::take(&mut fom.generic().txn_open) {
        return Ok(Step::Next);
    }
    fom.txn_abort(ctx)
}

fn timed_out<F: GenericFom + ?Sized>(fom: &mut F, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
    fom.generic().record(FomError::TimedOut);
    Ok(Step::Next)
}

/// Entered with the phase set directly, FAILURE may find no error
fn failed<F: GenericFom + ?Sized>(fom: &mut F, _ctx: &mut FomContext<'_>) -> FomResult<Step> {
    fom.generic().record(FomError::PhaseFailed {
        phase: "failure",
        reason: "no error recorded".into(),
    });
    Ok(Step::Next)
}

fn reply<F: GenericFom + ?Sized>(fom: &mut F, ctx: &mut FomContext<'_>) -> FomResult<Step> {
    let result = match fom.generic().error() {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    };
    fom.queue_reply(ctx, result).map_err(|err| {
        warn!(fom = %ctx.id(), %err, "reply not queued");
        err
    })
}

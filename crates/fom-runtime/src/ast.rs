//! Asynchronous system traps
//!
//! Every locality owns one lock-free AST queue. Any thread may post to it;
//! only a handler thread holding the locality's group lock drains it. This
//! is the single path through which other localities, signal sources and
//! timers reach a FOM.

use std::fmt;
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use fom_core::FomId;

use crate::callback::CallbackInner;
use crate::fom::{AstContext, Fom};

/// Closure posted through [`DomainHandle::post`](crate::DomainHandle::post)
pub type AstFn = Box<dyn FnOnce(&mut AstContext<'_>) + Send>;

/// A unit of work for a locality
pub(crate) enum Ast {
    /// Bottom-half of a fired callback
    Callback {
        cb: Arc<CallbackInner>,
        fom: FomId,
        epoch: u64,
    },
    /// Move a waiting FOM to the run queue
    Wakeup(FomId),
    /// Generic closure run under the lock on behalf of `fom`
    Closure { fom: FomId, f: AstFn },
    /// A FOM queued by a thread that held another group lock
    Enqueue { fom: FomId, ops: Box<dyn Fom> },
}

impl Ast {
    /// FOM this AST is addressed to
    pub(crate) fn target(&self) -> FomId {
        match self {
            Ast::Callback { fom, .. } => *fom,
            Ast::Wakeup(fom) => *fom,
            Ast::Closure { fom, .. } => *fom,
            Ast::Enqueue { fom, .. } => *fom,
        }
    }
}

impl fmt::Debug for Ast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ast::Callback { fom, epoch, .. } => write!(f, "Ast::Callback({fom:?}, epoch {epoch})"),
            Ast::Wakeup(fom) => write!(f, "Ast::Wakeup({fom:?})"),
            Ast::Closure { fom, .. } => write!(f, "Ast::Closure({fom:?})"),
            Ast::Enqueue { fom, .. } => write!(f, "Ast::Enqueue({fom:?})"),
        }
    }
}

/// Multi-producer AST queue of one locality
pub(crate) struct AstQueue {
    queue: SegQueue<Ast>,
}

impl AstQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }

    #[inline]
    pub(crate) fn push(&self, ast: Ast) {
        self.queue.push(ast);
    }

    #[inline]
    pub(crate) fn pop(&self) -> Option<Ast> {
        self.queue.pop()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

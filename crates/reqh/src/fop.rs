//! Fops and the FOM types that serve them
//!
//! A fop is an incoming request: an opcode plus an opaque payload. The
//! request handler looks up the [`FomType`] registered for the opcode and
//! asks it to build a FOM for the fop.

use std::any::Any;
use std::fmt;

use fom_core::FomResult;
use fom_runtime::Fom;

/// Incoming request
pub struct Fop {
    opcode: u32,
    payload: Box<dyn Any + Send>,
}

impl Fop {
    pub fn new<T: Any + Send>(opcode: u32, payload: T) -> Self {
        Self {
            opcode,
            payload: Box::new(payload),
        }
    }

    /// Fop without payload
    pub fn empty(opcode: u32) -> Self {
        Self::new(opcode, ())
    }

    #[inline]
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }

    /// Take the payload out; gives the fop back when the type is wrong
    pub fn into_payload<T: Any>(self) -> Result<T, Fop> {
        let opcode = self.opcode;
        match self.payload.downcast::<T>() {
            Ok(payload) => Ok(*payload),
            Err(payload) => Err(Fop { opcode, payload }),
        }
    }
}

impl fmt::Debug for Fop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fop").field("opcode", &self.opcode).finish_non_exhaustive()
    }
}

/// Name and opcode a FOM type is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FopType {
    pub name: &'static str,
    pub opcode: u32,
}

impl FopType {
    pub const fn new(name: &'static str, opcode: u32) -> Self {
        Self { name, opcode }
    }
}

impl fmt::Display for FopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.opcode)
    }
}

/// Factory of FOMs for one fop type
///
/// `create` runs in the thread that hands the fop over. An error is
/// returned to that caller; the fop never reaches the scheduler.
pub trait FomType: Send + Sync + 'static {
    /// Build a FOM in phase INIT for `fop`
    fn create(&self, fop: Fop) -> FomResult<Box<dyn Fom>>;
}

impl<F> FomType for F
where
    F: Fn(Fop) -> FomResult<Box<dyn Fom>> + Send + Sync + 'static,
{
    fn create(&self, fop: Fop) -> FomResult<Box<dyn Fom>> {
        self(fop)
    }
}

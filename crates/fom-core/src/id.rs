//! FOM and locality handles

use core::fmt;

/// Index of a locality inside its domain
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
#[repr(transparent)]
pub struct LocalityId(u16);

impl LocalityId {
    #[inline]
    pub const fn new(idx: u16) -> Self {
        LocalityId(idx)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.0)
    }
}

/// Stable handle of a queued FOM
///
/// Packs the home locality and a per-locality sequence number into a `u64`:
///
/// ```text
///  63        48 47                                  0
/// ┌────────────┬─────────────────────────────────────┐
/// │  locality  │              sequence               │
/// └────────────┴─────────────────────────────────────┘
/// ```
///
/// Sequence numbers are handed out by the home locality and never reused,
/// so a handle to a finished FOM can never name a live one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FomId(u64);

impl FomId {
    /// Bits available for the sequence number
    pub const SEQ_BITS: u32 = 48;

    const SEQ_MASK: u64 = (1 << Self::SEQ_BITS) - 1;

    /// Build a handle; `seq` is truncated to [`FomId::SEQ_BITS`] bits
    #[inline]
    pub const fn new(locality: LocalityId, seq: u64) -> Self {
        FomId(((locality.0 as u64) << Self::SEQ_BITS) | (seq & Self::SEQ_MASK))
    }

    /// Home locality of this FOM
    #[inline]
    pub const fn locality(self) -> LocalityId {
        LocalityId((self.0 >> Self::SEQ_BITS) as u16)
    }

    #[inline]
    pub const fn seq(self) -> u64 {
        self.0 & Self::SEQ_MASK
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        FomId(raw)
    }
}

impl From<FomId> for u64 {
    #[inline]
    fn from(id: FomId) -> Self {
        id.0
    }
}

impl fmt::Debug for FomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FomId({}:{})", self.locality().0, self.seq())
    }
}

impl fmt::Display for FomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.locality().0, self.seq())
    }
}

//! Error types for core cache operations.

use std::fmt;

/// Errors surfaced by the allocator contract and the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// The pool id does not name a regular pool.
    UnknownPool,

    /// The class id does not exist in the target pool.
    UnknownClass,

    /// The victim slab is pinned by in-flight references and cannot be
    /// released right now.
    SlabLocked,

    /// The pool has no slab available to satisfy the move.
    CapacityExceeded,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPool => write!(f, "unknown pool"),
            Self::UnknownClass => write!(f, "unknown class"),
            Self::SlabLocked => write!(f, "slab locked"),
            Self::CapacityExceeded => write!(f, "capacity exceeded"),
        }
    }
}

impl std::error::Error for CoreError {}

/// Result type for core cache operations.
pub type CoreResult<T> = Result<T, CoreError>;

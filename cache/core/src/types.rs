//! Identifiers and operation modes shared across the cache core.

/// Identifier of a memory pool (a collection of size classes under one
/// memory budget).
pub type PoolId = u8;

/// Identifier of a size class within a pool.
///
/// APIs that can name "no class" (for example a rebalance context without
/// a receiver) use `Option<ClassId>` rather than a sentinel value.
pub type ClassId = u8;

/// How an item was touched when recording an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// The item was read.
    Read,
    /// The item was written/updated in place.
    Write,
}

/// Why a slab is being released back to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabReleaseMode {
    /// Released by the pool rebalancer to move capacity between classes.
    Rebalance,
    /// Released because the pool itself is shrinking.
    Resize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_mode_distinguishes_reads_and_writes() {
        assert_ne!(AccessMode::Read, AccessMode::Write);
    }

    #[test]
    fn test_release_modes_compare() {
        assert_eq!(SlabReleaseMode::Rebalance, SlabReleaseMode::Rebalance);
        assert_ne!(SlabReleaseMode::Rebalance, SlabReleaseMode::Resize);
    }
}

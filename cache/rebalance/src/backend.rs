//! The allocator contract consumed by the rebalancer.

use std::sync::Arc;

use cache_core::{ClassId, CoreResult, PoolId, PoolStats, SlabReleaseMode};

use crate::strategy::RebalanceStrategy;

/// Interface the slab allocator exposes to the rebalancer.
///
/// Statistics are read-only snapshots; [`release_slab`] is the only
/// mutation path on slab layout and the allocator serializes it.
///
/// [`release_slab`]: Self::release_slab
pub trait SlabBackend: Send + Sync {
    /// Pools eligible for rebalancing.
    fn regular_pool_ids(&self) -> Vec<PoolId>;

    /// Snapshot the statistics of one pool.
    fn pool_stats(&self, pool: PoolId) -> PoolStats;

    /// Move one slab out of `victim`. With a receiver the slab is handed
    /// to that class; without one it returns to the pool's free pool.
    ///
    /// # Errors
    ///
    /// Propagates the allocator's operational failures (locked slab,
    /// exhausted capacity, unknown ids). Callers treat these as
    /// non-fatal and move on to the next pool.
    fn release_slab(
        &self,
        pool: PoolId,
        victim: ClassId,
        receiver: Option<ClassId>,
        mode: SlabReleaseMode,
    ) -> CoreResult<()>;

    /// Per-pool strategy override, if one is configured.
    fn rebalance_strategy(&self, pool: PoolId) -> Option<Arc<dyn RebalanceStrategy>> {
        let _ = pool;
        None
    }
}

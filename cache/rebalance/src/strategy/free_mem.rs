//! Free-memory reclamation.
//!
//! A class sitting on whole slabs of free allocations returns them to
//! the pool; no receiver is named, the memory goes back to the free
//! pool for whoever allocates next.

use cache_core::{PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::strategy::{RebalanceContext, RebalanceStrategy};

/// Tuning for [`FreeMemStrategy`].
#[derive(Debug, Clone)]
pub struct FreeMemConfig {
    /// Slabs a class must retain after giving one away.
    pub min_slabs: u64,
    /// Free slabs a class must hold to become a victim.
    pub num_free_slabs: u64,
    /// Stop releasing once the pool holds this many unassigned slabs.
    pub max_unallocated_slabs: u64,
}

impl Default for FreeMemConfig {
    fn default() -> Self {
        Self {
            min_slabs: 1,
            num_free_slabs: 3,
            max_unallocated_slabs: 1000,
        }
    }
}

/// Victim = class with the most idle free slabs; receiver invalid.
pub struct FreeMemStrategy {
    config: FreeMemConfig,
}

impl FreeMemStrategy {
    /// Create the strategy with `config`.
    pub fn new(config: FreeMemConfig) -> Self {
        Self { config }
    }
}

impl RebalanceStrategy for FreeMemStrategy {
    fn kind(&self) -> &'static str {
        "free-mem"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats: PoolStats = cache.pool_stats(pool);
        if stats.mp.slabs_unallocated > self.config.max_unallocated_slabs {
            return RebalanceContext::empty();
        }

        let victim = stats
            .mp
            .ac_stats
            .iter()
            .filter(|(_, ac)| ac.total_slabs > self.config.min_slabs)
            .filter(|(_, ac)| ac.free_slabs() >= self.config.num_free_slabs)
            .max_by_key(|(_, ac)| ac.free_slabs())
            .map(|(&class, _)| class);

        match victim {
            Some(victim) => RebalanceContext::with_victim(victim),
            None => RebalanceContext::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testing::StaticBackend;
    use cache_core::{AcStats, PoolStats};

    fn stats(classes: &[(u8, u64, u64)], unallocated: u64) -> PoolStats {
        // (class, slabs, free_allocs) triples; 8 allocs per slab.
        let mut stats = PoolStats::default();
        stats.mp.slabs_unallocated = unallocated;
        for &(class, slabs, free_allocs) in classes {
            stats.mp.class_ids.push(class);
            stats.mp.ac_stats.insert(
                class,
                AcStats {
                    total_slabs: slabs,
                    free_allocs,
                    allocs_per_slab: 8,
                },
            );
        }
        stats
    }

    #[test]
    fn test_idle_class_is_victim_without_receiver() {
        // Class 2 holds 5 free slabs worth of allocations.
        let backend = StaticBackend::with_pool(0, stats(&[(1, 8, 8), (2, 8, 40)], 0));
        let strategy = FreeMemStrategy::new(FreeMemConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert_eq!(context.victim, Some(2));
        assert_eq!(context.receiver, None);
    }

    #[test]
    fn test_below_threshold_is_kept() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 8, 16)], 0));
        let strategy = FreeMemStrategy::new(FreeMemConfig::default());
        // Two free slabs is under the three-slab threshold.
        assert!(!strategy.pick_victim_and_receiver(&backend, 0).requests_move());
    }

    #[test]
    fn test_unallocated_pool_memory_stops_releases() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 8, 64)], 2000));
        let strategy = FreeMemStrategy::new(FreeMemConfig::default());
        assert!(!strategy.pick_victim_and_receiver(&backend, 0).requests_move());
    }
}

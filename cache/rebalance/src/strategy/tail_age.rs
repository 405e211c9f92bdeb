//! Tail-age balancing: classes whose tails grow old are hoarding memory.

use cache_core::{PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::info::PoolStateMap;
use crate::strategy::{RebalanceContext, RebalanceStrategy, refresh_hold_offs, snapshot_all};

/// Tuning for [`LruTailAgeStrategy`].
#[derive(Debug, Clone)]
pub struct LruTailAgeConfig {
    /// The victim's tail age must exceed the receiver's by this ratio.
    pub tail_age_difference_ratio: f64,
    /// Minimum absolute tail-age gap (seconds) for a move.
    pub min_tail_age_difference: u64,
    /// Slabs a class must retain after giving one away.
    pub min_slabs: u64,
    /// Skip rebalancing while the pool still holds this many unassigned
    /// slabs; receivers can grow from free memory instead.
    pub num_slabs_free_mem: u64,
}

impl Default for LruTailAgeConfig {
    fn default() -> Self {
        Self {
            tail_age_difference_ratio: 0.25,
            min_tail_age_difference: 100,
            min_slabs: 1,
            num_slabs_free_mem: 3,
        }
    }
}

/// Victim = oldest tail, receiver = youngest tail.
pub struct LruTailAgeStrategy {
    config: LruTailAgeConfig,
    state: PoolStateMap,
}

impl LruTailAgeStrategy {
    /// Create the strategy with `config`.
    pub fn new(config: LruTailAgeConfig) -> Self {
        Self {
            config,
            state: PoolStateMap::new(),
        }
    }

    fn gates_pass(&self, victim_age: u64, receiver_age: u64) -> bool {
        if victim_age <= receiver_age {
            return false;
        }
        let gap = victim_age - receiver_age;
        victim_age as f64 > receiver_age as f64 * (1.0 + self.config.tail_age_difference_ratio)
            && gap > self.config.min_tail_age_difference
    }
}

impl RebalanceStrategy for LruTailAgeStrategy {
    fn kind(&self) -> &'static str {
        "tail-age"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats: PoolStats = cache.pool_stats(pool);
        self.state.with_pool(pool, &stats, |state| {
            refresh_hold_offs(state, &stats);

            let context = if stats.mp.slabs_unallocated >= self.config.num_slabs_free_mem {
                // Plenty of unassigned memory; let receivers grow from it.
                RebalanceContext::empty()
            } else {
                let victim = state
                    .values()
                    .filter(|info| {
                        stats.num_slabs_for_class(info.class_id) > self.config.min_slabs
                            && !info.is_on_hold_off()
                    })
                    .max_by_key(|info| stats.eviction_age_for_class(info.class_id))
                    .map(|info| info.class_id);

                match victim {
                    None => RebalanceContext::empty(),
                    Some(victim) => {
                        let receiver = state
                            .values()
                            .filter(|info| info.class_id != victim)
                            .filter(|info| stats.num_slabs_for_class(info.class_id) >= 1)
                            .min_by_key(|info| stats.eviction_age_for_class(info.class_id))
                            .map(|info| info.class_id);

                        match receiver {
                            Some(receiver)
                                if self.gates_pass(
                                    stats.eviction_age_for_class(victim),
                                    stats.eviction_age_for_class(receiver),
                                ) =>
                            {
                                RebalanceContext::with_pair(victim, receiver)
                            }
                            _ => RebalanceContext::empty(),
                        }
                    }
                }
            };

            snapshot_all(state, &stats);
            context
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testing::StaticBackend;
    use cache_core::{AcStats, CacheStat, ContainerStat, PoolStats};

    fn stats(ages: &[(u8, u64, u64)], unallocated: u64) -> PoolStats {
        // (class, slabs, tail_age) triples.
        let mut stats = PoolStats::default();
        stats.mp.slabs_unallocated = unallocated;
        for &(class, slabs, age) in ages {
            stats.mp.class_ids.push(class);
            stats.mp.ac_stats.insert(
                class,
                AcStats {
                    total_slabs: slabs,
                    free_allocs: 0,
                    allocs_per_slab: 8,
                },
            );
            stats.cache_stats.insert(
                class,
                CacheStat {
                    container_stat: ContainerStat {
                        oldest_element_age_secs: age,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            );
        }
        stats
    }

    #[test]
    fn test_picks_oldest_victim_and_youngest_receiver() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 5000), (2, 4, 40), (3, 4, 900)], 0));
        let strategy = LruTailAgeStrategy::new(LruTailAgeConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert_eq!(context.victim, Some(1));
        assert_eq!(context.receiver, Some(2));
    }

    #[test]
    fn test_small_gap_is_rejected() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 150), (2, 4, 100)], 0));
        let strategy = LruTailAgeStrategy::new(LruTailAgeConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
    }

    #[test]
    fn test_free_memory_short_circuits() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 5000), (2, 4, 40)], 5));
        let strategy = LruTailAgeStrategy::new(LruTailAgeConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
    }

    #[test]
    fn test_min_slabs_protects_victim() {
        let config = LruTailAgeConfig {
            min_slabs: 4,
            ..Default::default()
        };
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 5000), (2, 4, 40)], 0));
        let strategy = LruTailAgeStrategy::new(config);
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
    }
}

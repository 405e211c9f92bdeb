//! Locality-aware memory allocation.
//!
//! Delegates the whole-pool decision to the footprint profiler's
//! dynamic program and emits its move plan in one round. The other
//! strategies move one slab per round; this one converges in a single
//! step and then starts observing a fresh window.

use std::sync::Arc;

use cache_core::{ClassId, PoolId};

use crate::backend::SlabBackend;
use crate::mrc::FootprintMrc;
use crate::strategy::{RebalanceContext, RebalanceStrategy};

/// Tuning for [`LamaStrategy`].
#[derive(Debug, Clone, Default)]
pub struct LamaConfig {
    /// Minimum miss-rate improvement (absolute) required before the
    /// plan is applied.
    pub min_threshold: f64,
}

/// DP-based multi-move reallocation over the profiled window.
pub struct LamaStrategy {
    config: LamaConfig,
    mrc: Arc<FootprintMrc>,
}

impl LamaStrategy {
    /// Create the strategy over a shared profiler. The profiler is fed
    /// by the request path; this strategy only reads and resets it.
    pub fn new(config: LamaConfig, mrc: Arc<FootprintMrc>) -> Self {
        Self { config, mrc }
    }

    /// The shared profiler, for wiring into the request path.
    pub fn profiler(&self) -> &Arc<FootprintMrc> {
        &self.mrc
    }
}

impl RebalanceStrategy for LamaStrategy {
    fn kind(&self) -> &'static str {
        "lama"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats = cache.pool_stats(pool);

        let mut allocs_per_slab = std::collections::BTreeMap::<ClassId, u64>::new();
        let mut current = std::collections::BTreeMap::<ClassId, u64>::new();
        for (&class, ac) in &stats.mp.ac_stats {
            if ac.allocs_per_slab == 0 {
                continue;
            }
            allocs_per_slab.insert(class, ac.allocs_per_slab);
            current.insert(class, ac.total_slabs);
        }
        if current.is_empty() {
            return RebalanceContext::empty();
        }

        let plan = self.mrc.solve_slab_reallocation(&allocs_per_slab, &current);
        if plan.moves.is_empty() || plan.mr_old - plan.mr_new < self.config.min_threshold {
            return RebalanceContext::empty();
        }

        // The plan was consumed; observe a fresh window for the next
        // round instead of replaying the same accesses.
        self.mrc.reset_window_analysis();

        RebalanceContext {
            victim: None,
            receiver: None,
            pairs: plan.moves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testing::StaticBackend;
    use cache_core::{AcStats, PoolStats};

    fn stats(classes: &[(u8, u64, u64)]) -> PoolStats {
        // (class, slabs, allocs_per_slab) triples.
        let mut stats = PoolStats::default();
        for &(class, slabs, allocs) in classes {
            stats.mp.class_ids.push(class);
            stats.mp.ac_stats.insert(
                class,
                AcStats {
                    total_slabs: slabs,
                    free_allocs: 0,
                    allocs_per_slab: allocs,
                },
            );
        }
        stats
    }

    fn skewed_profiler() -> Arc<FootprintMrc> {
        let mrc = Arc::new(FootprintMrc::new(1 << 14));
        // Class 1 needs one slab; class 2 needs four.
        for _ in 0..50 {
            for key in 0..8 {
                mrc.feed_id(key, 1);
            }
        }
        for _ in 0..50 {
            for key in 0..35 {
                mrc.feed_id(1000 + key, 2);
            }
        }
        mrc
    }

    #[test]
    fn test_emits_pair_plan_and_resets_window() {
        let strategy = LamaStrategy::new(LamaConfig::default(), skewed_profiler());
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 10), (2, 2, 10)]));

        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.pairs.is_empty());
        assert!(context.pairs.iter().all(|&(v, r)| v == 1 && r == 2));
        assert!(strategy.profiler().is_empty());
    }

    #[test]
    fn test_threshold_suppresses_marginal_plans() {
        let config = LamaConfig { min_threshold: 0.9 };
        let strategy = LamaStrategy::new(config, skewed_profiler());
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 10), (2, 2, 10)]));

        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
        // The window is kept for the next round.
        assert!(!strategy.profiler().is_empty());
    }

    #[test]
    fn test_empty_window_is_a_noop() {
        let strategy = LamaStrategy::new(
            LamaConfig::default(),
            Arc::new(FootprintMrc::new(16)),
        );
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 10)]));
        assert!(!strategy.pick_victim_and_receiver(&backend, 0).requests_move());
    }
}

//! Hits-per-slab balancing in three flavors.
//!
//! A class whose slabs earn few hits is wasting memory that another
//! class would convert into hits. The three modes differ only in the
//! counter they normalize: raw hits, first-touch (toggle) hits, or
//! tail-slab hits.

use std::collections::BTreeMap;

use cache_core::{ClassId, PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::info::{PoolStateMap, RebalanceInfo};
use crate::strategy::{RebalanceContext, RebalanceStrategy, refresh_hold_offs, snapshot_all};

/// Which hit counter drives the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitsMode {
    /// Raw hits per slab.
    Hits,
    /// First-touch hits per slab.
    HitsToggle,
    /// Tail-slab hits per tail slab.
    TailSlab,
}

impl HitsMode {
    fn kind(self) -> &'static str {
        match self {
            HitsMode::Hits => "hits",
            HitsMode::HitsToggle => "hits-toggle",
            HitsMode::TailSlab => "hits-per-tail-slab",
        }
    }
}

/// Tuning for [`HitsPerSlabStrategy`].
#[derive(Debug, Clone)]
pub struct HitsPerSlabConfig {
    /// Minimum score gap between receiver and victim.
    pub min_diff: u64,
    /// Minimum score gap relative to the larger score.
    pub diff_ratio: f64,
    /// Slabs a class must retain after giving one away.
    pub min_slabs: u64,
    /// Skip rebalancing while the pool holds this many unassigned slabs.
    pub num_slabs_free_mem: u64,
    /// A victim's tail must be at least this old (seconds); 0 disables.
    pub min_lru_tail_age: u64,
    /// A class aging past this becomes victim regardless of its score;
    /// 0 disables.
    pub max_lru_tail_age: u64,
    /// Tail slabs counted by the tail-slab mode.
    pub tail_slab_cnt: u64,
}

impl Default for HitsPerSlabConfig {
    fn default() -> Self {
        Self {
            min_diff: 100,
            diff_ratio: 0.1,
            min_slabs: 1,
            num_slabs_free_mem: 3,
            min_lru_tail_age: 0,
            max_lru_tail_age: 0,
            tail_slab_cnt: 1,
        }
    }
}

/// Victim = lowest hits per slab, receiver = highest projected hits per
/// slab.
pub struct HitsPerSlabStrategy {
    mode: HitsMode,
    config: HitsPerSlabConfig,
    state: PoolStateMap,
}

impl HitsPerSlabStrategy {
    /// Create the strategy in `mode` with `config`.
    pub fn new(mode: HitsMode, config: HitsPerSlabConfig) -> Self {
        Self {
            mode,
            config,
            state: PoolStateMap::new(),
        }
    }

    fn score(&self, info: &RebalanceInfo, stats: &PoolStats) -> f64 {
        match self.mode {
            HitsMode::Hits => info.delta_hits_per_slab(stats) as f64,
            HitsMode::HitsToggle => info.delta_hits_toggle_per_slab(stats) as f64,
            HitsMode::TailSlab => info.marginal_hits(stats, self.config.tail_slab_cnt),
        }
    }

    fn projected_score(&self, info: &RebalanceInfo, stats: &PoolStats) -> f64 {
        match self.mode {
            HitsMode::Hits => {
                let projected = info.projected_delta_hits_per_slab(stats);
                if projected == u64::MAX {
                    f64::INFINITY
                } else {
                    projected as f64
                }
            }
            HitsMode::HitsToggle => {
                let projected = info.projected_delta_hits_toggle_per_slab(stats);
                if projected == u64::MAX {
                    f64::INFINITY
                } else {
                    projected as f64
                }
            }
            HitsMode::TailSlab => info.marginal_hits(stats, self.config.tail_slab_cnt),
        }
    }

    fn gates_pass(&self, victim_score: f64, receiver_score: f64) -> bool {
        if receiver_score == f64::INFINITY {
            // A single-slab receiver always deserves the move.
            return victim_score.is_finite();
        }
        let diff = receiver_score - victim_score;
        if diff <= self.config.min_diff as f64 {
            return false;
        }
        let max = receiver_score.max(victim_score);
        max > 0.0 && diff / max > self.config.diff_ratio
    }
}

impl RebalanceStrategy for HitsPerSlabStrategy {
    fn kind(&self) -> &'static str {
        self.mode.kind()
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats = cache.pool_stats(pool);
        self.state.with_pool(pool, &stats, |state| {
            refresh_hold_offs(state, &stats);

            let context = self.pick_locked(state, &stats);

            if self.mode == HitsMode::TailSlab {
                for info in state.values_mut() {
                    info.update_tail_hits(&stats, 0.0);
                }
            }
            snapshot_all(state, &stats);
            context
        })
    }
}

impl HitsPerSlabStrategy {
    fn pick_locked(
        &self,
        state: &BTreeMap<ClassId, RebalanceInfo>,
        stats: &PoolStats,
    ) -> RebalanceContext {
        if stats.mp.slabs_unallocated >= self.config.num_slabs_free_mem
            && self.config.num_slabs_free_mem > 0
        {
            return RebalanceContext::empty();
        }

        let victim_eligible = |info: &&RebalanceInfo| {
            let slabs = stats.num_slabs_for_class(info.class_id);
            if slabs <= self.config.min_slabs || info.is_on_hold_off() {
                return false;
            }
            self.config.min_lru_tail_age == 0
                || stats.eviction_age_for_class(info.class_id) >= self.config.min_lru_tail_age
        };

        // An over-aged class is provably over-provisioned; take from it
        // without consulting the score gates.
        let forced_victim = if self.config.max_lru_tail_age > 0 {
            state
                .values()
                .filter(victim_eligible)
                .filter(|info| {
                    stats.eviction_age_for_class(info.class_id) > self.config.max_lru_tail_age
                })
                .max_by_key(|info| stats.eviction_age_for_class(info.class_id))
                .map(|info| info.class_id)
        } else {
            None
        };

        let victim = forced_victim.or_else(|| {
            state
                .values()
                .filter(victim_eligible)
                .min_by(|a, b| {
                    self.score(a, stats)
                        .partial_cmp(&self.score(b, stats))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|info| info.class_id)
        });
        let Some(victim) = victim else {
            return RebalanceContext::empty();
        };

        let receiver = state
            .values()
            .filter(|info| info.class_id != victim)
            .max_by(|a, b| {
                self.projected_score(a, stats)
                    .partial_cmp(&self.projected_score(b, stats))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|info| info.class_id);
        let Some(receiver) = receiver else {
            return RebalanceContext::empty();
        };

        let victim_info = &state[&victim];
        let receiver_info = &state[&receiver];
        let gates_ok = forced_victim.is_some()
            || self.gates_pass(
                self.score(victim_info, stats),
                self.projected_score(receiver_info, stats),
            );

        if gates_ok {
            RebalanceContext::with_pair(victim, receiver)
        } else {
            RebalanceContext::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testing::StaticBackend;
    use cache_core::{AcStats, CacheStat, ContainerStat, PoolStats};

    fn stats(classes: &[(u8, u64, u64, u64)]) -> PoolStats {
        // (class, slabs, hits, tail_age) tuples.
        let mut stats = PoolStats::default();
        for &(class, slabs, hits, age) in classes {
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
                    num_hits: hits,
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
    fn test_low_hits_class_is_victim() {
        let backend =
            StaticBackend::with_pool(0, stats(&[(1, 4, 40, 0), (2, 4, 9000, 0), (3, 4, 500, 0)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, HitsPerSlabConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert_eq!(context.victim, Some(1));
        assert_eq!(context.receiver, Some(2));
    }

    #[test]
    fn test_small_diff_is_rejected() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 100, 0), (2, 4, 300, 0)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, HitsPerSlabConfig::default());
        // Scores are 25 vs 100 per slab; the gap of 75 is under min_diff.
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
    }

    #[test]
    fn test_min_tail_age_filters_victims() {
        let config = HitsPerSlabConfig {
            min_lru_tail_age: 1000,
            ..Default::default()
        };
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 40, 50), (2, 4, 9000, 50)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, config);
        // Both tails are too young to steal from.
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!context.requests_move());
    }

    #[test]
    fn test_max_tail_age_forces_victim() {
        let config = HitsPerSlabConfig {
            max_lru_tail_age: 100,
            ..Default::default()
        };
        // Class 2 has the higher hits score but its tail is ancient.
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4, 40, 50), (2, 4, 9000, 5000)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, config);
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert_eq!(context.victim, Some(2));
        assert_eq!(context.receiver, Some(1));
    }

    #[test]
    fn test_second_round_uses_deltas() {
        let backend =
            StaticBackend::with_pool(0, stats(&[(1, 4, 40, 0), (2, 4, 9000, 0)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, HitsPerSlabConfig::default());
        let first = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(first.requests_move());

        // Counters unchanged since the snapshot: all deltas are zero and
        // no move clears the gates.
        let second = strategy.pick_victim_and_receiver(&backend, 0);
        assert!(!second.requests_move());
    }

    #[test]
    fn test_single_slab_receiver_is_infinitely_hungry() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 8, 0, 0), (2, 1, 900, 0)]));
        let strategy = HitsPerSlabStrategy::new(HitsMode::Hits, HitsPerSlabConfig::default());
        let context = strategy.pick_victim_and_receiver(&backend, 0);
        assert_eq!(context.victim, Some(1));
        assert_eq!(context.receiver, Some(2));
    }
}

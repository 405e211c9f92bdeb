//! Eviction-rate balancing.
//!
//! A class evicting slowly per slab has slack; a class churning through
//! its tail needs room. Same shape as the hits-per-slab policy with the
//! eviction delta as the score.

use cache_core::{PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::info::{PoolStateMap, RebalanceInfo};
use crate::strategy::{RebalanceContext, RebalanceStrategy, refresh_hold_offs, snapshot_all};

/// Tuning for [`EvictionRateStrategy`].
#[derive(Debug, Clone)]
pub struct EvictionRateConfig {
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
    /// A class aging past this becomes victim regardless of score; 0
    /// disables.
    pub max_lru_tail_age: u64,
}

impl Default for EvictionRateConfig {
    fn default() -> Self {
        Self {
            min_diff: 100,
            diff_ratio: 0.1,
            min_slabs: 1,
            num_slabs_free_mem: 3,
            min_lru_tail_age: 0,
            max_lru_tail_age: 0,
        }
    }
}

/// Victim = fewest evictions per slab, receiver = most.
pub struct EvictionRateStrategy {
    config: EvictionRateConfig,
    state: PoolStateMap,
}

impl EvictionRateStrategy {
    /// Create the strategy with `config`.
    pub fn new(config: EvictionRateConfig) -> Self {
        Self {
            config,
            state: PoolStateMap::new(),
        }
    }

    fn score(info: &RebalanceInfo, stats: &PoolStats) -> f64 {
        let delta = info.delta_evictions(stats).max(0) as f64;
        delta / stats.num_slabs_for_class(info.class_id).max(1) as f64
    }

    fn gates_pass(&self, victim_score: f64, receiver_score: f64) -> bool {
        let diff = receiver_score - victim_score;
        if diff <= self.config.min_diff as f64 {
            return false;
        }
        let max = receiver_score.max(victim_score);
        max > 0.0 && diff / max > self.config.diff_ratio
    }
}

impl RebalanceStrategy for EvictionRateStrategy {
    fn kind(&self) -> &'static str {
        "eviction-rate"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats = cache.pool_stats(pool);
        self.state.with_pool(pool, &stats, |state| {
            refresh_hold_offs(state, &stats);

            let context = 'pick: {
                if stats.mp.slabs_unallocated >= self.config.num_slabs_free_mem
                    && self.config.num_slabs_free_mem > 0
                {
                    break 'pick RebalanceContext::empty();
                }

                let victim_eligible = |info: &&RebalanceInfo| {
                    let slabs = stats.num_slabs_for_class(info.class_id);
                    if slabs <= self.config.min_slabs || info.is_on_hold_off() {
                        return false;
                    }
                    self.config.min_lru_tail_age == 0
                        || stats.eviction_age_for_class(info.class_id)
                            >= self.config.min_lru_tail_age
                };

                let forced_victim = if self.config.max_lru_tail_age > 0 {
                    state
                        .values()
                        .filter(victim_eligible)
                        .filter(|info| {
                            stats.eviction_age_for_class(info.class_id)
                                > self.config.max_lru_tail_age
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
                            Self::score(a, &stats)
                                .partial_cmp(&Self::score(b, &stats))
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|info| info.class_id)
                });
                let Some(victim) = victim else {
                    break 'pick RebalanceContext::empty();
                };

                let receiver = state
                    .values()
                    .filter(|info| info.class_id != victim)
                    .max_by(|a, b| {
                        Self::score(a, &stats)
                            .partial_cmp(&Self::score(b, &stats))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|info| info.class_id);
                let Some(receiver) = receiver else {
                    break 'pick RebalanceContext::empty();
                };

                let gates_ok = forced_victim.is_some()
                    || self.gates_pass(
                        Self::score(&state[&victim], &stats),
                        Self::score(&state[&receiver], &stats),
                    );
                if gates_ok {
                    RebalanceContext::with_pair(victim, receiver)
                } else {
                    RebalanceContext::empty()
                }
            };

            snapshot_all(state, &stats);
            context
        })
    }
}

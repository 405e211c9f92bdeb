//! Uniform random victim/receiver selection.
//!
//! Useful as a baseline when evaluating the informed policies.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use cache_core::{PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::strategy::{RebalanceContext, RebalanceStrategy};

/// Uniformly random victim among classes that can spare a slab, and a
/// uniformly random receiver among the rest.
pub struct RandomStrategy {
    min_slabs: u64,
    rng: Mutex<Xoshiro256PlusPlus>,
}

impl RandomStrategy {
    /// Create the strategy; victims must hold at least `min_slabs + 1`
    /// slabs.
    pub fn new(min_slabs: u64) -> Self {
        Self {
            min_slabs,
            rng: Mutex::new(Xoshiro256PlusPlus::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(min_slabs: u64, seed: u64) -> Self {
        Self {
            min_slabs,
            rng: Mutex::new(Xoshiro256PlusPlus::seed_from_u64(seed)),
        }
    }
}

impl RebalanceStrategy for RandomStrategy {
    fn kind(&self) -> &'static str {
        "random"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats: PoolStats = cache.pool_stats(pool);
        let victims: Vec<_> = stats
            .mp
            .ac_stats
            .iter()
            .filter(|(_, ac)| ac.total_slabs >= self.min_slabs + 1)
            .map(|(&class, _)| class)
            .collect();
        if victims.is_empty() {
            return RebalanceContext::empty();
        }

        let mut rng = self.rng.lock();
        let victim = victims[rng.gen_range(0..victims.len())];

        let receivers: Vec<_> = stats
            .mp
            .class_ids
            .iter()
            .copied()
            .filter(|&class| class != victim)
            .collect();
        if receivers.is_empty() {
            return RebalanceContext::empty();
        }
        let receiver = receivers[rng.gen_range(0..receivers.len())];

        RebalanceContext::with_pair(victim, receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testing::StaticBackend;
    use cache_core::AcStats;

    fn stats(classes: &[(u8, u64)]) -> PoolStats {
        let mut stats = PoolStats::default();
        for &(class, slabs) in classes {
            stats.mp.class_ids.push(class);
            stats.mp.ac_stats.insert(
                class,
                AcStats {
                    total_slabs: slabs,
                    free_allocs: 0,
                    allocs_per_slab: 8,
                },
            );
        }
        stats
    }

    #[test]
    fn test_victim_must_have_spare_slabs() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 1), (2, 1)]));
        let strategy = RandomStrategy::with_seed(1, 7);
        for _ in 0..10 {
            assert!(!strategy.pick_victim_and_receiver(&backend, 0).requests_move());
        }
    }

    #[test]
    fn test_victim_and_receiver_differ() {
        let backend = StaticBackend::with_pool(0, stats(&[(1, 4), (2, 4), (3, 1)]));
        let strategy = RandomStrategy::with_seed(1, 7);
        for _ in 0..32 {
            let context = strategy.pick_victim_and_receiver(&backend, 0);
            let victim = context.victim.unwrap();
            let receiver = context.receiver.unwrap();
            assert_ne!(victim, receiver);
            // Class 3 cannot spare a slab.
            assert_ne!(victim, 3);
        }
    }
}

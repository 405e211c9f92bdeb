//! The rebalancer driver.
//!
//! One round visits every regular pool: release classes hoarding free
//! allocations, ask the pool's strategy for a move, apply it. A failing
//! pool is logged and skipped; the stop flag is honored between pools.
//! The embedder's scheduler decides when rounds run (periodically or on
//! allocation failure).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error};

use cache_core::{ClassId, CoreResult, PoolId, SlabReleaseMode};

use crate::backend::SlabBackend;
use crate::strategy::{RebalanceContext, RebalanceStrategy};

/// Loop timing counters: invocation count, last and average duration.
#[derive(Default)]
pub struct LoopStats {
    num_loops: AtomicU64,
    total_micros: AtomicU64,
    last_micros: AtomicU64,
}

impl LoopStats {
    /// Record one loop of the given duration.
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.num_loops.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.last_micros.store(micros, Ordering::Relaxed);
    }

    /// Loops recorded so far.
    pub fn num_loops(&self) -> u64 {
        self.num_loops.load(Ordering::Relaxed)
    }

    /// Duration of the most recent loop, in milliseconds.
    pub fn last_ms(&self) -> u64 {
        self.last_micros.load(Ordering::Relaxed) / 1000
    }

    /// Average loop duration, in milliseconds.
    pub fn avg_ms(&self) -> u64 {
        let loops = self.num_loops();
        if loops == 0 {
            0
        } else {
            self.total_micros.load(Ordering::Relaxed) / loops / 1000
        }
    }
}

/// Snapshot of rebalancer timing counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebalancerStats {
    /// Completed rebalancing rounds (one per pool visit).
    pub num_rebalance_rounds: u64,
    /// Duration of the last round, ms.
    pub last_rebalance_time_ms: u64,
    /// Average round duration, ms.
    pub avg_rebalance_time_ms: u64,
    /// Rounds that issued at least one slab release.
    pub num_release_rounds: u64,
    /// Duration of the last release phase, ms.
    pub last_release_time_ms: u64,
    /// Average release-phase duration, ms.
    pub avg_release_time_ms: u64,
    /// Strategy invocations.
    pub num_pick_rounds: u64,
    /// Duration of the last pick, ms.
    pub last_pick_time_ms: u64,
    /// Average pick duration, ms.
    pub avg_pick_time_ms: u64,
}

/// Applies strategy decisions to the allocator, pool by pool.
pub struct PoolRebalancer {
    cache: Arc<dyn SlabBackend>,
    default_strategy: Arc<dyn RebalanceStrategy>,
    /// A class whose free allocations exceed this many whole slabs gets
    /// one released unconditionally; 0 disables the pass.
    free_alloc_threshold: u64,
    stop: AtomicBool,
    rebalance_stats: LoopStats,
    release_stats: LoopStats,
    pick_stats: LoopStats,
    last_thrashing: Mutex<HashMap<PoolId, bool>>,
}

impl PoolRebalancer {
    /// Create a rebalancer over `cache`, falling back to
    /// `default_strategy` for pools without an override.
    pub fn new(
        cache: Arc<dyn SlabBackend>,
        default_strategy: Arc<dyn RebalanceStrategy>,
        free_alloc_threshold: u64,
    ) -> Self {
        Self {
            cache,
            default_strategy,
            free_alloc_threshold,
            stop: AtomicBool::new(false),
            rebalance_stats: LoopStats::default(),
            release_stats: LoopStats::default(),
            pick_stats: LoopStats::default(),
            last_thrashing: Mutex::new(HashMap::new()),
        }
    }

    /// Run one rebalancing round over every regular pool.
    ///
    /// Pool failures are logged and do not stop the remaining pools;
    /// [`stop`](Self::stop) is honored between pools.
    pub fn work(&self) {
        for pool in self.cache.regular_pool_ids() {
            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            let strategy = self.strategy_for(pool);
            let begin = Instant::now();
            let result = self.try_rebalancing(pool, strategy.as_ref());
            self.rebalance_stats.record(begin.elapsed());
            if let Err(err) = result {
                error!(pool, %err, "rebalancing pool failed, continuing");
            }
        }
    }

    /// Forward an allocation failure in `pool` to its strategy.
    pub fn process_alloc_failure(&self, pool: PoolId) {
        self.strategy_for(pool).upon_alloc_failure(pool);
    }

    /// Request that `work` stops before visiting the next pool.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether the most recent move in `pool` reversed its predecessor.
    pub fn is_last_rebalance_thrashing(&self, pool: PoolId) -> bool {
        self.last_thrashing
            .lock()
            .get(&pool)
            .copied()
            .unwrap_or(false)
    }

    /// Snapshot the timing counters.
    pub fn get_stats(&self) -> RebalancerStats {
        RebalancerStats {
            num_rebalance_rounds: self.rebalance_stats.num_loops(),
            last_rebalance_time_ms: self.rebalance_stats.last_ms(),
            avg_rebalance_time_ms: self.rebalance_stats.avg_ms(),
            num_release_rounds: self.release_stats.num_loops(),
            last_release_time_ms: self.release_stats.last_ms(),
            avg_release_time_ms: self.release_stats.avg_ms(),
            num_pick_rounds: self.pick_stats.num_loops(),
            last_pick_time_ms: self.pick_stats.last_ms(),
            avg_pick_time_ms: self.pick_stats.avg_ms(),
        }
    }

    fn strategy_for(&self, pool: PoolId) -> Arc<dyn RebalanceStrategy> {
        self.cache
            .rebalance_strategy(pool)
            .unwrap_or_else(|| Arc::clone(&self.default_strategy))
    }

    /// Classes with more than `free_alloc_threshold` slabs worth of free
    /// allocations give their largest hoard back to the pool.
    fn pick_victim_by_free_alloc(&self, pool: PoolId) -> Option<ClassId> {
        let stats = self.cache.pool_stats(pool);
        let mut max_free_slabs = 1;
        let mut victim = None;
        for (&class, ac) in &stats.mp.ac_stats {
            let free_slabs = ac.free_slabs();
            if free_slabs > self.free_alloc_threshold && free_slabs > max_free_slabs {
                max_free_slabs = free_slabs;
                victim = Some(class);
            }
        }
        victim
    }

    fn try_rebalancing(
        &self,
        pool: PoolId,
        strategy: &dyn RebalanceStrategy,
    ) -> CoreResult<bool> {
        if self.free_alloc_threshold > 0 {
            if let Some(victim) = self.pick_victim_by_free_alloc(pool) {
                self.release_slab(pool, victim, None)?;
            }
        }

        if !self.cache.pool_stats(pool).mp.all_slabs_allocated() {
            return Ok(false);
        }

        let pick_begin = Instant::now();
        let context = strategy.pick_victim_and_receiver(&*self.cache, pool);
        self.pick_stats.record(pick_begin.elapsed());
        self.last_thrashing
            .lock()
            .insert(pool, strategy.is_thrashing(pool, &context));

        if !context.requests_move() {
            debug!(pool, strategy = strategy.kind(), "no rebalance this round");
            return Ok(false);
        }

        let release_begin = Instant::now();
        let released = self.apply(pool, &context);
        self.release_stats.record(release_begin.elapsed());
        released?;
        Ok(true)
    }

    fn apply(&self, pool: PoolId, context: &RebalanceContext) -> CoreResult<()> {
        if !context.pairs.is_empty() {
            for &(victim, receiver) in &context.pairs {
                self.release_slab(pool, victim, Some(receiver))?;
            }
            return Ok(());
        }
        if let Some(victim) = context.victim {
            self.release_slab(pool, victim, context.receiver)?;
        }
        Ok(())
    }

    fn release_slab(
        &self,
        pool: PoolId,
        victim: ClassId,
        receiver: Option<ClassId>,
    ) -> CoreResult<()> {
        let begin = Instant::now();
        self.cache
            .release_slab(pool, victim, receiver, SlabReleaseMode::Rebalance)?;
        debug!(
            pool,
            victim,
            receiver = receiver.map(i64::from).unwrap_or(-1),
            elapsed_us = begin.elapsed().as_micros() as u64,
            "slab released"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A canned backend for strategy and rebalancer tests.

    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use cache_core::{ClassId, CoreError, CoreResult, PoolId, PoolStats, SlabReleaseMode};

    use crate::backend::SlabBackend;
    use crate::strategy::RebalanceStrategy;

    /// Serves fixed stats snapshots and records release calls.
    #[derive(Default)]
    pub(crate) struct StaticBackend {
        pools: Mutex<HashMap<PoolId, PoolStats>>,
        strategies: Mutex<HashMap<PoolId, Arc<dyn RebalanceStrategy>>>,
        releases: Mutex<Vec<(PoolId, ClassId, Option<ClassId>)>>,
        fail_releases: Mutex<bool>,
    }

    impl StaticBackend {
        pub(crate) fn with_pool(pool: PoolId, stats: PoolStats) -> Self {
            let backend = Self::default();
            backend.set_stats(pool, stats);
            backend
        }

        pub(crate) fn set_stats(&self, pool: PoolId, stats: PoolStats) {
            self.pools.lock().insert(pool, stats);
        }

        pub(crate) fn set_strategy(&self, pool: PoolId, strategy: Arc<dyn RebalanceStrategy>) {
            self.strategies.lock().insert(pool, strategy);
        }

        pub(crate) fn fail_releases(&self) {
            *self.fail_releases.lock() = true;
        }

        pub(crate) fn releases(&self) -> Vec<(PoolId, ClassId, Option<ClassId>)> {
            self.releases.lock().clone()
        }
    }

    impl SlabBackend for StaticBackend {
        fn regular_pool_ids(&self) -> Vec<PoolId> {
            let mut ids: Vec<PoolId> = self.pools.lock().keys().copied().collect();
            ids.sort_unstable();
            ids
        }

        fn pool_stats(&self, pool: PoolId) -> PoolStats {
            self.pools.lock().get(&pool).cloned().unwrap_or_default()
        }

        fn release_slab(
            &self,
            pool: PoolId,
            victim: ClassId,
            receiver: Option<ClassId>,
            _mode: SlabReleaseMode,
        ) -> CoreResult<()> {
            if *self.fail_releases.lock() {
                return Err(CoreError::SlabLocked);
            }
            self.releases.lock().push((pool, victim, receiver));
            Ok(())
        }

        fn rebalance_strategy(&self, pool: PoolId) -> Option<Arc<dyn RebalanceStrategy>> {
            self.strategies.lock().get(&pool).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StaticBackend;
    use super::*;
    use crate::strategy::DefaultStrategy;
    use cache_core::{AcStats, CacheStat, PoolStats};
    use std::sync::Arc;

    fn stats(classes: &[(u8, u64, u64, u64)], unallocated: u64) -> PoolStats {
        // (class, slabs, free_allocs, alloc_failures); 8 allocs per slab.
        let mut stats = PoolStats::default();
        stats.mp.slabs_unallocated = unallocated;
        for &(class, slabs, free_allocs, failures) in classes {
            stats.mp.class_ids.push(class);
            stats.mp.ac_stats.insert(
                class,
                AcStats {
                    total_slabs: slabs,
                    free_allocs,
                    allocs_per_slab: 8,
                },
            );
            stats.cache_stats.insert(
                class,
                CacheStat {
                    alloc_failures: failures,
                    ..Default::default()
                },
            );
        }
        stats
    }

    fn rebalancer(backend: Arc<StaticBackend>, threshold: u64) -> PoolRebalancer {
        PoolRebalancer::new(backend, Arc::new(DefaultStrategy::new()), threshold)
    }

    #[test]
    fn test_default_strategy_without_failure_is_noop() {
        let backend = Arc::new(StaticBackend::with_pool(
            0,
            stats(&[(1, 4, 0, 0), (2, 4, 0, 0)], 0),
        ));
        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.work();

        assert!(backend.releases().is_empty());
        let stats = rb.get_stats();
        assert_eq!(stats.num_rebalance_rounds, 1);
        assert_eq!(stats.num_release_rounds, 0);
        assert_eq!(stats.num_pick_rounds, 1);
    }

    #[test]
    fn test_alloc_failure_forces_release() {
        let backend = Arc::new(StaticBackend::with_pool(
            0,
            stats(&[(1, 4, 0, 0), (2, 4, 0, 9)], 0),
        ));
        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.process_alloc_failure(0);
        rb.work();

        // The failing class releases one slab back to the free pool.
        assert_eq!(backend.releases(), vec![(0, 2, None)]);
    }

    #[test]
    fn test_free_alloc_threshold_releases_hoarder() {
        // Class 2 holds 5 slabs of free allocations.
        let backend = Arc::new(StaticBackend::with_pool(
            0,
            stats(&[(1, 8, 0, 0), (2, 8, 40, 0)], 0),
        ));
        let rb = rebalancer(Arc::clone(&backend), 2);
        rb.work();
        assert_eq!(backend.releases(), vec![(0, 2, None)]);
    }

    #[test]
    fn test_unallocated_slabs_skip_strategy() {
        let backend = Arc::new(StaticBackend::with_pool(
            0,
            stats(&[(1, 4, 0, 9)], 4),
        ));
        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.process_alloc_failure(0);
        rb.work();

        // Free pool memory satisfies the failure without a move, but the
        // round itself is still counted.
        assert!(backend.releases().is_empty());
        assert_eq!(rb.get_stats().num_rebalance_rounds, 1);
        assert_eq!(rb.get_stats().num_pick_rounds, 0);
    }

    #[test]
    fn test_release_failure_does_not_stop_other_pools() {
        let backend = Arc::new(StaticBackend::default());
        backend.set_stats(0, stats(&[(1, 4, 0, 9)], 0));
        backend.set_stats(1, stats(&[(1, 4, 0, 9)], 0));
        backend.fail_releases();

        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.process_alloc_failure(0);
        rb.process_alloc_failure(1);
        rb.work();

        // Both pools attempted and failed; both rounds recorded.
        assert_eq!(rb.get_stats().num_rebalance_rounds, 2);
        assert!(backend.releases().is_empty());
    }

    #[test]
    fn test_stop_halts_between_pools() {
        let backend = Arc::new(StaticBackend::default());
        backend.set_stats(0, stats(&[(1, 4, 0, 0)], 0));
        backend.set_stats(1, stats(&[(1, 4, 0, 0)], 0));

        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.stop();
        rb.work();
        assert_eq!(rb.get_stats().num_rebalance_rounds, 0);
    }

    #[test]
    fn test_pair_list_issues_every_move() {
        struct PairStrategy;
        impl RebalanceStrategy for PairStrategy {
            fn kind(&self) -> &'static str {
                "pairs"
            }
            fn pick_victim_and_receiver(
                &self,
                _cache: &dyn SlabBackend,
                _pool: PoolId,
            ) -> RebalanceContext {
                RebalanceContext {
                    victim: None,
                    receiver: None,
                    pairs: vec![(1, 2), (1, 2), (3, 2)],
                }
            }
        }

        let backend = Arc::new(StaticBackend::with_pool(
            0,
            stats(&[(1, 4, 0, 0), (2, 4, 0, 0), (3, 4, 0, 0)], 0),
        ));
        backend.set_strategy(0, Arc::new(PairStrategy));

        let rb = rebalancer(Arc::clone(&backend), 0);
        rb.work();
        assert_eq!(
            backend.releases(),
            vec![(0, 1, Some(2)), (0, 1, Some(2)), (0, 3, Some(2))]
        );
        assert_eq!(rb.get_stats().num_release_rounds, 1);
    }
}

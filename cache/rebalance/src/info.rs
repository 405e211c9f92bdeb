//! Per-class rebalancing state.
//!
//! Each strategy keeps one [`RebalanceInfo`] per class per pool: the
//! counters it saw at the last decision, so the next decision can work
//! on deltas. Hold-off counters live here too; a class that just gained
//! a slab sits out the next [`NUM_HOLD_OFF_ROUNDS`] victim selections.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use cache_core::{ClassId, PoolId, PoolStats};

/// Rounds a class holds off after acquiring a slab.
pub const NUM_HOLD_OFF_ROUNDS: u32 = 10;

/// Snapshot of one class's counters from the last strategy decision.
#[derive(Debug, Clone, Default)]
pub struct RebalanceInfo {
    /// The class this record tracks.
    pub class_id: ClassId,
    /// Slabs owned at the last snapshot.
    pub n_slabs: u64,
    /// Evictions at the last snapshot.
    pub evictions: u64,
    /// Allocation failures at the last snapshot.
    pub alloc_failures: u64,
    /// Hits at the last snapshot.
    pub hits: u64,
    /// First-touch hits at the last snapshot.
    pub hits_toggle: u64,
    /// Tail-slab hits accumulated up to the last tail update.
    pub accu_tail_hits: u64,
    /// Second-to-last tail-slab hits at the last tail update.
    pub accu_second_last_tail_hits: u64,
    /// Cold-region hits at the last snapshot.
    pub accu_cold_hits: u64,
    /// Warm-region hits at the last snapshot.
    pub accu_warm_hits: u64,
    /// Hot-region hits at the last snapshot.
    pub accu_hot_hits: u64,
    /// Exponentially decayed tail-hit score.
    pub decayed_accu_tail_hits: f64,
    /// Requests (hits + allocation attempts) at the last snapshot.
    pub num_requests: u64,
    /// Requests at the last decay of the tail-hit score.
    pub num_requests_at_last_decay: u64,
    /// Allocation attempts at the last snapshot.
    pub num_allocations: u64,
    /// General hold-off rounds remaining.
    pub hold_off_remaining: u32,
    /// Rounds this class may not be picked as victim.
    pub victim_hold_off_remaining: u32,
    /// Rounds this class may not be picked as receiver.
    pub receiver_hold_off_remaining: u32,
}

impl RebalanceInfo {
    /// Fresh record for `class_id` with all counters at zero.
    pub fn new(class_id: ClassId) -> Self {
        Self {
            class_id,
            ..Default::default()
        }
    }

    /// Slab count change since the last snapshot.
    pub fn delta_slabs(&self, stats: &PoolStats) -> i64 {
        stats.num_slabs_for_class(self.class_id) as i64 - self.n_slabs as i64
    }

    /// Evictions since the last snapshot.
    pub fn delta_evictions(&self, stats: &PoolStats) -> i64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.num_evictions)
            .unwrap_or(0);
        current as i64 - self.evictions as i64
    }

    /// Allocation attempts since the last snapshot.
    pub fn delta_allocations(&self, stats: &PoolStats) -> i64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.alloc_attempts)
            .unwrap_or(0);
        current as i64 - self.num_allocations as i64
    }

    /// Hits since the last snapshot; clamps to zero if the counter went
    /// backwards (a reporting thread went away).
    pub fn delta_hits(&self, stats: &PoolStats) -> u64 {
        stats
            .num_hits_for_class(self.class_id)
            .saturating_sub(self.hits)
    }

    /// First-touch hits since the last snapshot, clamped at zero.
    pub fn delta_hits_toggle(&self, stats: &PoolStats) -> u64 {
        stats
            .num_hits_toggle_for_class(self.class_id)
            .saturating_sub(self.hits_toggle)
    }

    /// Allocation failures since the last snapshot, clamped at zero.
    pub fn delta_alloc_failures(&self, stats: &PoolStats) -> u64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.alloc_failures)
            .unwrap_or(0);
        current.saturating_sub(self.alloc_failures)
    }

    /// Requests (hits + alloc attempts) since the last snapshot.
    pub fn delta_requests(&self, stats: &PoolStats) -> u64 {
        stats
            .num_requests_for_class(self.class_id)
            .saturating_sub(self.num_requests)
    }

    /// Requests since the tail-hit score last decayed.
    pub fn delta_requests_since_last_decay(&self, stats: &PoolStats) -> u64 {
        stats
            .num_requests_for_class(self.class_id)
            .saturating_sub(self.num_requests_at_last_decay)
    }

    /// Hit delta normalized by the class's slab count.
    pub fn delta_hits_per_slab(&self, stats: &PoolStats) -> u64 {
        let slabs = stats.num_slabs_for_class(self.class_id).max(1);
        self.delta_hits(stats) / slabs
    }

    /// First-touch hit delta normalized by the slab count.
    pub fn delta_hits_toggle_per_slab(&self, stats: &PoolStats) -> u64 {
        let slabs = stats.num_slabs_for_class(self.class_id).max(1);
        self.delta_hits_toggle(stats) / slabs
    }

    /// Hit delta per slab if the class lost one slab; `u64::MAX` for a
    /// single-slab class, which must never be picked as victim on this
    /// score.
    pub fn projected_delta_hits_per_slab(&self, stats: &PoolStats) -> u64 {
        let slabs = stats.num_slabs_for_class(self.class_id);
        if slabs <= 1 {
            u64::MAX
        } else {
            self.delta_hits(stats) / (slabs - 1)
        }
    }

    /// Projected first-touch variant of
    /// [`projected_delta_hits_per_slab`](Self::projected_delta_hits_per_slab).
    pub fn projected_delta_hits_toggle_per_slab(&self, stats: &PoolStats) -> u64 {
        let slabs = stats.num_slabs_for_class(self.class_id);
        if slabs <= 1 {
            u64::MAX
        } else {
            self.delta_hits_toggle(stats) / (slabs - 1)
        }
    }

    /// Tail-slab hits since the last tail update, per tail slab.
    pub fn marginal_hits(&self, stats: &PoolStats, tail_slab_cnt: u64) -> f64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat.num_tail_accesses)
            .unwrap_or(0);
        let marginal = current.saturating_sub(self.accu_tail_hits) as f64;
        let total_slabs = stats.num_slabs_for_class(self.class_id);
        let true_tail = tail_slab_cnt.min(total_slabs).max(1);
        marginal / true_tail as f64
    }

    /// Decayed history plus the fresh marginal component.
    pub fn decayed_marginal_hits(
        &self,
        stats: &PoolStats,
        tail_slab_cnt: u64,
        decay_factor: f64,
    ) -> f64 {
        self.decayed_accu_tail_hits + self.marginal_hits(stats, tail_slab_cnt) * (1.0 - decay_factor)
    }

    /// Second-to-last tail-slab hits since the last tail update.
    pub fn second_last_tail_hits(&self, stats: &PoolStats) -> u64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat.num_second_last_tail_accesses)
            .unwrap_or(0);
        current.saturating_sub(self.accu_second_last_tail_hits)
    }

    /// Cold-region hits since the last snapshot.
    pub fn cold_hits(&self, stats: &PoolStats) -> u64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat.num_cold_accesses)
            .unwrap_or(0);
        current.saturating_sub(self.accu_cold_hits)
    }

    /// Warm-region hits since the last snapshot.
    pub fn warm_hits(&self, stats: &PoolStats) -> u64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat.num_warm_accesses)
            .unwrap_or(0);
        current.saturating_sub(self.accu_warm_hits)
    }

    /// Hot-region hits since the last snapshot.
    pub fn hot_hits(&self, stats: &PoolStats) -> u64 {
        let current = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat.num_hot_accesses)
            .unwrap_or(0);
        current.saturating_sub(self.accu_hot_hits)
    }

    /// Whether the general hold-off is active.
    pub fn is_on_hold_off(&self) -> bool {
        self.hold_off_remaining > 0
    }

    /// Arm the general hold-off.
    pub fn start_hold_off(&mut self) {
        self.hold_off_remaining = NUM_HOLD_OFF_ROUNDS;
    }

    /// Consume one general hold-off round.
    pub fn reduce_hold_off(&mut self) {
        debug_assert!(self.is_on_hold_off());
        self.hold_off_remaining = self.hold_off_remaining.saturating_sub(1);
    }

    /// Clear the general hold-off.
    pub fn reset_hold_off(&mut self) {
        self.hold_off_remaining = 0;
    }

    /// Arm the victim-side hold-off.
    pub fn start_victim_hold_off(&mut self) {
        self.victim_hold_off_remaining = NUM_HOLD_OFF_ROUNDS;
    }

    /// Arm the receiver-side hold-off.
    pub fn start_receiver_hold_off(&mut self) {
        self.receiver_hold_off_remaining = NUM_HOLD_OFF_ROUNDS;
    }

    /// Consume one victim hold-off round; true if one was active.
    pub fn decrement_victim_hold_off(&mut self) -> bool {
        if self.victim_hold_off_remaining > 0 {
            self.victim_hold_off_remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Consume one receiver hold-off round; true if one was active.
    pub fn decrement_receiver_hold_off(&mut self) -> bool {
        if self.receiver_hold_off_remaining > 0 {
            self.receiver_hold_off_remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Snapshot the hit counter.
    pub fn update_hits(&mut self, stats: &PoolStats) {
        self.hits = stats.num_hits_for_class(self.class_id);
    }

    /// Snapshot the first-touch hit counter.
    pub fn update_hits_toggle(&mut self, stats: &PoolStats) {
        self.hits_toggle = stats.num_hits_toggle_for_class(self.class_id);
    }

    /// Snapshot the allocation-attempt counter.
    pub fn update_allocations(&mut self, stats: &PoolStats) {
        self.num_allocations = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.alloc_attempts)
            .unwrap_or(0);
    }

    /// Snapshot the request counter.
    pub fn update_requests(&mut self, stats: &PoolStats) {
        self.num_requests = stats.num_requests_for_class(self.class_id);
    }

    /// Fold the fresh marginal hits into the decayed score and snapshot
    /// the tail counters.
    pub fn update_tail_hits(&mut self, stats: &PoolStats, decay_factor: f64) {
        self.decayed_accu_tail_hits =
            (self.decayed_accu_tail_hits + self.marginal_hits(stats, 1)) * decay_factor;
        let container = stats
            .cache_stats
            .get(&self.class_id)
            .map(|cs| cs.container_stat)
            .unwrap_or_default();
        self.accu_tail_hits = container.num_tail_accesses;
        self.accu_second_last_tail_hits = container.num_second_last_tail_accesses;
        self.num_requests_at_last_decay = stats.num_requests_for_class(self.class_id);
    }

    /// Snapshot slabs, evictions, region hits, and alloc failures.
    pub fn update_record(&mut self, stats: &PoolStats) {
        self.n_slabs = stats.num_slabs_for_class(self.class_id);
        if let Some(cs) = stats.cache_stats.get(&self.class_id) {
            self.evictions = cs.num_evictions;
            self.alloc_failures = cs.alloc_failures;
            self.accu_cold_hits = cs.container_stat.num_cold_accesses;
            self.accu_warm_hits = cs.container_stat.num_warm_accesses;
            self.accu_hot_hits = cs.container_stat.num_hot_accesses;
        }
    }
}

/// Per-pool class state shared by stateful strategies.
///
/// Decisions are serialized on the rebalancer thread; the mutex only
/// covers the map against concurrent stat readers.
#[derive(Default)]
pub struct PoolStateMap {
    pools: Mutex<HashMap<PoolId, BTreeMap<ClassId, RebalanceInfo>>>,
}

impl PoolStateMap {
    /// Empty state map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` over the state of `pool`, seeding records for classes the
    /// snapshot knows that the state does not.
    ///
    /// Seeded records take the current slab count as their baseline so a
    /// class is not treated as freshly grown (and held off) the first
    /// time it is seen; counter baselines start at zero.
    pub fn with_pool<R>(
        &self,
        pool: PoolId,
        stats: &PoolStats,
        f: impl FnOnce(&mut BTreeMap<ClassId, RebalanceInfo>) -> R,
    ) -> R {
        let mut pools = self.pools.lock();
        let state = pools.entry(pool).or_default();
        for &class in &stats.mp.class_ids {
            state.entry(class).or_insert_with(|| {
                let mut info = RebalanceInfo::new(class);
                info.n_slabs = stats.num_slabs_for_class(class);
                info
            });
        }
        f(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_core::{AcStats, CacheStat, ContainerStat};

    fn stats_for(class: ClassId, slabs: u64, hits: u64, evictions: u64) -> PoolStats {
        let mut stats = PoolStats::default();
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
                num_evictions: evictions,
                num_hits: hits,
                ..Default::default()
            },
        );
        stats
    }

    #[test]
    fn test_deltas_from_zero() {
        let info = RebalanceInfo::new(1);
        let stats = stats_for(1, 4, 100, 7);
        assert_eq!(info.delta_slabs(&stats), 4);
        assert_eq!(info.delta_hits(&stats), 100);
        assert_eq!(info.delta_evictions(&stats), 7);
    }

    #[test]
    fn test_deltas_after_snapshot() {
        let mut info = RebalanceInfo::new(1);
        let old = stats_for(1, 4, 100, 7);
        info.update_record(&old);
        info.update_hits(&old);

        let new = stats_for(1, 6, 180, 10);
        assert_eq!(info.delta_slabs(&new), 2);
        assert_eq!(info.delta_hits(&new), 80);
        assert_eq!(info.delta_evictions(&new), 3);
    }

    #[test]
    fn test_delta_hits_clamps_backwards_counter() {
        let mut info = RebalanceInfo::new(1);
        info.update_hits(&stats_for(1, 4, 100, 0));
        let shrunk = stats_for(1, 4, 60, 0);
        assert_eq!(info.delta_hits(&shrunk), 0);
    }

    #[test]
    fn test_hits_per_slab() {
        let info = RebalanceInfo::new(1);
        let stats = stats_for(1, 4, 100, 0);
        assert_eq!(info.delta_hits_per_slab(&stats), 25);
    }

    #[test]
    fn test_projected_hits_per_slab_single_slab_is_max() {
        let info = RebalanceInfo::new(1);
        let one_slab = stats_for(1, 1, 100, 0);
        assert_eq!(info.projected_delta_hits_per_slab(&one_slab), u64::MAX);

        let four_slabs = stats_for(1, 4, 99, 0);
        assert_eq!(info.projected_delta_hits_per_slab(&four_slabs), 33);
    }

    #[test]
    fn test_marginal_hits_clamps_tail_count() {
        let mut stats = stats_for(1, 2, 0, 0);
        stats.cache_stats.get_mut(&1).unwrap().container_stat = ContainerStat {
            num_tail_accesses: 40,
            ..Default::default()
        };
        let info = RebalanceInfo::new(1);
        // Requested 8 tail slabs but the class only has 2.
        assert_eq!(info.marginal_hits(&stats, 8), 20.0);
    }

    #[test]
    fn test_decayed_marginal_hits() {
        let mut stats = stats_for(1, 1, 0, 0);
        stats.cache_stats.get_mut(&1).unwrap().container_stat = ContainerStat {
            num_tail_accesses: 10,
            ..Default::default()
        };
        let mut info = RebalanceInfo::new(1);
        info.decayed_accu_tail_hits = 4.0;
        assert_eq!(info.decayed_marginal_hits(&stats, 1, 0.5), 4.0 + 5.0);
    }

    #[test]
    fn test_update_tail_hits_folds_and_snapshots() {
        let mut stats = stats_for(1, 1, 20, 0);
        stats.cache_stats.get_mut(&1).unwrap().container_stat = ContainerStat {
            num_tail_accesses: 10,
            ..Default::default()
        };
        let mut info = RebalanceInfo::new(1);
        info.update_tail_hits(&stats, 0.5);
        assert_eq!(info.decayed_accu_tail_hits, 5.0);
        assert_eq!(info.accu_tail_hits, 10);
        assert_eq!(info.num_requests_at_last_decay, 20);
        // The fresh snapshot zeroes the marginal component.
        assert_eq!(info.marginal_hits(&stats, 1), 0.0);
    }

    #[test]
    fn test_hold_off_cycle() {
        let mut info = RebalanceInfo::new(1);
        assert!(!info.is_on_hold_off());
        info.start_hold_off();
        assert!(info.is_on_hold_off());
        for _ in 0..NUM_HOLD_OFF_ROUNDS {
            info.reduce_hold_off();
        }
        assert!(!info.is_on_hold_off());
    }

    #[test]
    fn test_victim_receiver_hold_offs_independent() {
        let mut info = RebalanceInfo::new(1);
        info.start_victim_hold_off();
        assert!(info.decrement_victim_hold_off());
        assert!(!info.decrement_receiver_hold_off());
        info.start_receiver_hold_off();
        assert!(info.decrement_receiver_hold_off());
    }

    #[test]
    fn test_pool_state_map_seeds_classes() {
        let map = PoolStateMap::new();
        let stats = stats_for(3, 2, 0, 0);
        let seeded = map.with_pool(0, &stats, |state| {
            state.contains_key(&3) && state.len() == 1
        });
        assert!(seeded);

        // A second class appearing later is seeded on the next visit.
        let mut stats2 = stats_for(3, 2, 0, 0);
        stats2.mp.class_ids.push(5);
        let len = map.with_pool(0, &stats2, |state| state.len());
        assert_eq!(len, 2);
    }
}

//! Allocator statistics snapshots.
//!
//! The allocator hands these to the rebalancer as read-only snapshots.
//! All counters are cumulative since pool creation; consumers compute
//! deltas between successive snapshots.

use std::collections::BTreeMap;

use crate::types::ClassId;

/// Per-class allocation statistics from the memory pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcStats {
    /// Slabs currently owned by this class (in use plus advised-away).
    pub total_slabs: u64,
    /// Allocation slots sitting on the class free list.
    pub free_allocs: u64,
    /// How many allocations of this class fit in one slab.
    pub allocs_per_slab: u64,
}

impl AcStats {
    /// Number of whole slabs worth of free allocations.
    pub fn free_slabs(&self) -> u64 {
        if self.allocs_per_slab == 0 {
            0
        } else {
            self.free_allocs / self.allocs_per_slab
        }
    }
}

/// Memory-pool level statistics: the per-class slab layout.
#[derive(Debug, Clone, Default)]
pub struct MPStats {
    /// Classes present in the pool, ascending.
    pub class_ids: Vec<ClassId>,
    /// Allocation stats per class.
    pub ac_stats: BTreeMap<ClassId, AcStats>,
    /// Slabs in the pool not yet assigned to any class.
    pub slabs_unallocated: u64,
}

impl MPStats {
    /// Whether every slab in the pool has been handed to a class.
    pub fn all_slabs_allocated(&self) -> bool {
        self.slabs_unallocated == 0
    }
}

/// Access-position counters exported by an eviction container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerStat {
    /// Hits on items currently in the tail-slab region.
    pub num_tail_accesses: u64,
    /// Hits on items in the second-to-last tail slab.
    pub num_second_last_tail_accesses: u64,
    /// Hits on cold (probationary) items.
    pub num_cold_accesses: u64,
    /// Hits on warm items.
    pub num_warm_accesses: u64,
    /// Hits on hot items.
    pub num_hot_accesses: u64,
    /// Age in seconds of the oldest element in the container.
    pub oldest_element_age_secs: u64,
}

/// Per-class cache behavior counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStat {
    /// Items evicted from this class.
    pub num_evictions: u64,
    /// Allocation attempts against this class.
    pub alloc_attempts: u64,
    /// Allocation attempts that failed.
    pub alloc_failures: u64,
    /// Item hits for this class.
    pub num_hits: u64,
    /// First-touch hits (each item counted once per residency).
    pub num_hits_toggle: u64,
    /// Access-position counters from the eviction container.
    pub container_stat: ContainerStat,
}

/// Full statistics snapshot for one pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Slab layout of the pool.
    pub mp: MPStats,
    /// Cache behavior per class.
    pub cache_stats: BTreeMap<ClassId, CacheStat>,
}

impl PoolStats {
    /// Slabs currently owned by `class`, zero for unknown classes.
    pub fn num_slabs_for_class(&self, class: ClassId) -> u64 {
        self.mp
            .ac_stats
            .get(&class)
            .map(|ac| ac.total_slabs)
            .unwrap_or(0)
    }

    /// Cumulative hits for `class`.
    pub fn num_hits_for_class(&self, class: ClassId) -> u64 {
        self.cache_stats
            .get(&class)
            .map(|cs| cs.num_hits)
            .unwrap_or(0)
    }

    /// Cumulative first-touch hits for `class`.
    pub fn num_hits_toggle_for_class(&self, class: ClassId) -> u64 {
        self.cache_stats
            .get(&class)
            .map(|cs| cs.num_hits_toggle)
            .unwrap_or(0)
    }

    /// Age of the oldest element in `class`, in seconds.
    pub fn eviction_age_for_class(&self, class: ClassId) -> u64 {
        self.cache_stats
            .get(&class)
            .map(|cs| cs.container_stat.oldest_element_age_secs)
            .unwrap_or(0)
    }

    /// Approximate requests for `class`: hits plus allocation attempts.
    pub fn num_requests_for_class(&self, class: ClassId) -> u64 {
        let attempts = self
            .cache_stats
            .get(&class)
            .map(|cs| cs.alloc_attempts)
            .unwrap_or(0);
        self.num_hits_for_class(class) + attempts
    }
}

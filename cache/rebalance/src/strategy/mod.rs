//! Pluggable victim/receiver selection policies.
//!
//! Every strategy answers the same question: within one pool, which
//! size class should give up a slab, and which should receive it. The
//! rebalancer invokes one strategy per pool per round, serialized on its
//! own thread.

mod eviction_rate;
mod free_mem;
mod hits_per_slab;
mod lama;
mod marginal_hits;
mod random;
mod tail_age;

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use cache_core::{ClassId, PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::info::{PoolStateMap, RebalanceInfo};

pub use eviction_rate::{EvictionRateConfig, EvictionRateStrategy};
pub use free_mem::{FreeMemConfig, FreeMemStrategy};
pub use hits_per_slab::{HitsMode, HitsPerSlabConfig, HitsPerSlabStrategy};
pub use lama::{LamaConfig, LamaStrategy};
pub use marginal_hits::{MarginalHitsConfig, MarginalHitsStrategy};
pub use random::RandomStrategy;
pub use tail_age::{LruTailAgeConfig, LruTailAgeStrategy};

/// Outcome of one strategy decision.
///
/// Either a single victim (optionally with a receiver), or an explicit
/// list of (victim, receiver) pairs for multi-move strategies. An empty
/// context means "no move this round".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceContext {
    /// Class that should give up a slab.
    pub victim: Option<ClassId>,
    /// Class that should receive it; `None` returns the slab to the
    /// pool's free pool.
    pub receiver: Option<ClassId>,
    /// Multi-move plan; when non-empty it takes precedence over the
    /// single victim/receiver fields.
    pub pairs: Vec<(ClassId, ClassId)>,
}

impl RebalanceContext {
    /// A context that requests no move.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single victim-to-receiver move.
    pub fn with_pair(victim: ClassId, receiver: ClassId) -> Self {
        Self {
            victim: Some(victim),
            receiver: Some(receiver),
            pairs: Vec::new(),
        }
    }

    /// A victim whose slab goes back to the pool free pool.
    pub fn with_victim(victim: ClassId) -> Self {
        Self {
            victim: Some(victim),
            receiver: None,
            pairs: Vec::new(),
        }
    }

    /// Whether this context requests any move at all.
    pub fn requests_move(&self) -> bool {
        self.victim.is_some() || !self.pairs.is_empty()
    }
}

/// A slab-move selection policy.
pub trait RebalanceStrategy: Send + Sync {
    /// Stable name of the policy, matching its config spelling.
    fn kind(&self) -> &'static str;

    /// Decide the next move for `pool`.
    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext;

    /// Signal that an allocation in `pool` failed; strategies may force
    /// a victim selection on the next round.
    fn upon_alloc_failure(&self, pool: PoolId) {
        let _ = pool;
    }

    /// Whether `context` reverses the previous move for `pool`.
    /// The default is stateless and never reports thrashing.
    fn is_thrashing(&self, pool: PoolId, context: &RebalanceContext) -> bool {
        let _ = (pool, context);
        false
    }
}

impl std::fmt::Debug for dyn RebalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceStrategy")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Last applied (victim, receiver) per pool, for thrash detection.
#[derive(Default)]
pub(crate) struct MoveHistory {
    last: Mutex<HashMap<PoolId, (ClassId, ClassId)>>,
}

impl MoveHistory {
    /// Record `context` and report whether it reverses the previous
    /// recorded move (the classic A->B, B->A ping-pong).
    pub(crate) fn observe(&self, pool: PoolId, context: &RebalanceContext) -> bool {
        let (Some(victim), Some(receiver)) = (context.victim, context.receiver) else {
            return false;
        };
        let mut last = self.last.lock();
        let thrashing = last
            .get(&pool)
            .is_some_and(|&(v, r)| v == receiver && r == victim);
        last.insert(pool, (victim, receiver));
        thrashing
    }
}

/// Arm hold-offs for classes that gained slabs since the last round and
/// consume one round from classes already holding off.
pub(crate) fn refresh_hold_offs(
    state: &mut BTreeMap<ClassId, RebalanceInfo>,
    stats: &PoolStats,
) {
    for info in state.values_mut() {
        if info.delta_slabs(stats) > 0 {
            info.start_hold_off();
            info.n_slabs = stats.num_slabs_for_class(info.class_id);
        } else if info.is_on_hold_off() {
            info.reduce_hold_off();
        }
    }
}

/// Snapshot every class record so the next round sees fresh deltas.
pub(crate) fn snapshot_all(state: &mut BTreeMap<ClassId, RebalanceInfo>, stats: &PoolStats) {
    for info in state.values_mut() {
        info.update_record(stats);
        info.update_hits(stats);
        info.update_hits_toggle(stats);
        info.update_allocations(stats);
        info.update_requests(stats);
    }
}

/// The fallback policy: move nothing unless an allocation failure was
/// signalled, then release a slab from the failing class back to the
/// pool so it can re-acquire usable memory.
#[derive(Default)]
pub struct DefaultStrategy {
    pending: Mutex<HashSet<PoolId>>,
    state: PoolStateMap,
}

impl DefaultStrategy {
    /// Create the default strategy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RebalanceStrategy for DefaultStrategy {
    fn kind(&self) -> &'static str {
        "default"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        if !self.pending.lock().remove(&pool) {
            return RebalanceContext::empty();
        }
        let stats = cache.pool_stats(pool);
        self.state.with_pool(pool, &stats, |state| {
            let victim = state
                .values()
                .filter(|info| info.delta_alloc_failures(&stats) > 0)
                .filter(|info| stats.num_slabs_for_class(info.class_id) > 0)
                .max_by_key(|info| info.delta_alloc_failures(&stats))
                .map(|info| info.class_id);
            snapshot_all(state, &stats);
            match victim {
                Some(victim) => RebalanceContext::with_victim(victim),
                None => RebalanceContext::empty(),
            }
        })
    }

    fn upon_alloc_failure(&self, pool: PoolId) {
        self.pending.lock().insert(pool);
    }
}

//! Marginal-hits balancing.
//!
//! Scores each class by the hits landing in its tail-slab region: the
//! marginal utility of the last slab. A class whose tail earns little
//! gives a slab to the class whose tail earns the most. Scores are
//! smoothed with a moving average, optionally decayed as requests
//! accumulate, and moves arm directional hold-offs so a pair does not
//! ping-pong a slab back and forth.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use cache_core::{ClassId, PoolId, PoolStats};

use crate::backend::SlabBackend;
use crate::info::PoolStateMap;
use crate::strategy::{
    MoveHistory, RebalanceContext, RebalanceStrategy, refresh_hold_offs, snapshot_all,
};

/// Tuning for [`MarginalHitsStrategy`].
#[derive(Debug, Clone)]
pub struct MarginalHitsConfig {
    /// Slabs a class must retain after giving one away.
    pub min_slabs: u64,
    /// Tail slabs the marginal score is normalized by.
    pub tail_slab_cnt: u64,
    /// Weight of the previous smoothed score in [0, 1).
    pub moving_average_param: f64,
    /// Arm victim/receiver hold-offs after each move.
    pub enable_hold_off: bool,
    /// Minimum score gap for a move.
    pub min_diff: f64,
    /// Minimum score gap relative to the larger score; 0 disables.
    pub min_diff_ratio: f64,
    /// Decay tail-hit history once enough requests accumulate instead of
    /// resetting it every round.
    pub decay_with_hits: bool,
    /// Fraction of history kept at each decay.
    pub decay_factor: f64,
    /// Requests per class between decays (with `decay_with_hits`).
    pub decay_interval_requests: u64,
    /// Only accept receivers that evicted something since last round.
    pub filter_receiver_by_eviction_rate: bool,
    /// Raise the effective min-diff by this much when a move reverses
    /// the previous one; 0 disables.
    pub auto_inc_threshold: f64,
    /// Lower the effective min-diff by this much on idle rounds; 0
    /// disables.
    pub auto_dec_threshold: f64,
    /// Score victims as if they had already lost one slab.
    pub use_projected_score_for_victim: bool,
}

impl Default for MarginalHitsConfig {
    fn default() -> Self {
        Self {
            min_slabs: 1,
            tail_slab_cnt: 1,
            moving_average_param: 0.3,
            enable_hold_off: true,
            min_diff: 0.0,
            min_diff_ratio: 0.0,
            decay_with_hits: false,
            decay_factor: 0.0,
            decay_interval_requests: 100_000,
            filter_receiver_by_eviction_rate: false,
            auto_inc_threshold: 0.0,
            auto_dec_threshold: 0.0,
            use_projected_score_for_victim: false,
        }
    }
}

#[derive(Default)]
struct PoolSmoothing {
    scores: BTreeMap<ClassId, f64>,
    effective_min_diff: f64,
    last_was_reversal: bool,
}

/// Victim = lowest smoothed tail-hit score, receiver = highest.
pub struct MarginalHitsStrategy {
    config: MarginalHitsConfig,
    state: PoolStateMap,
    smoothing: Mutex<HashMap<PoolId, PoolSmoothing>>,
    history: MoveHistory,
}

impl MarginalHitsStrategy {
    /// Create the strategy with `config`.
    pub fn new(config: MarginalHitsConfig) -> Self {
        Self {
            config,
            state: PoolStateMap::new(),
            smoothing: Mutex::new(HashMap::new()),
            history: MoveHistory::default(),
        }
    }

    fn gates_pass(&self, effective_min_diff: f64, victim: f64, receiver: f64) -> bool {
        let diff = receiver - victim;
        if diff <= 0.0 || diff < effective_min_diff {
            return false;
        }
        let max = receiver.max(victim);
        max > 0.0 && diff / max > self.config.min_diff_ratio
    }
}

impl RebalanceStrategy for MarginalHitsStrategy {
    fn kind(&self) -> &'static str {
        "marginal-hits"
    }

    fn pick_victim_and_receiver(&self, cache: &dyn SlabBackend, pool: PoolId) -> RebalanceContext {
        let stats = cache.pool_stats(pool);
        let mut smoothing_map = self.smoothing.lock();
        let smoothing = smoothing_map.entry(pool).or_insert_with(|| PoolSmoothing {
            effective_min_diff: self.config.min_diff,
            ..Default::default()
        });

        self.state.with_pool(pool, &stats, |state| {
            refresh_hold_offs(state, &stats);

            if self.config.decay_with_hits {
                for info in state.values_mut() {
                    if info.delta_requests_since_last_decay(&stats)
                        > self.config.decay_interval_requests
                    {
                        info.update_tail_hits(&stats, self.config.decay_factor);
                    }
                }
            }

            // Smooth the raw marginal scores and consume one hold-off
            // round per class.
            let ma = self.config.moving_average_param;
            let mut victim_blocked: BTreeMap<ClassId, bool> = BTreeMap::new();
            let mut receiver_blocked: BTreeMap<ClassId, bool> = BTreeMap::new();
            for info in state.values_mut() {
                let raw = info.decayed_marginal_hits(
                    &stats,
                    self.config.tail_slab_cnt,
                    self.config.decay_factor,
                );
                let smoothed = smoothing
                    .scores
                    .get(&info.class_id)
                    .map(|prev| ma * prev + (1.0 - ma) * raw)
                    .unwrap_or(raw);
                smoothing.scores.insert(info.class_id, smoothed);
                victim_blocked.insert(info.class_id, info.decrement_victim_hold_off());
                receiver_blocked.insert(info.class_id, info.decrement_receiver_hold_off());
            }

            let victim_score = |class: ClassId| -> f64 {
                let score = smoothing.scores[&class];
                let slabs = stats.num_slabs_for_class(class);
                if self.config.use_projected_score_for_victim && slabs > 1 {
                    score * slabs as f64 / (slabs - 1) as f64
                } else {
                    score
                }
            };

            let victim = state
                .values()
                .filter(|info| {
                    stats.num_slabs_for_class(info.class_id) > self.config.min_slabs
                        && !victim_blocked[&info.class_id]
                })
                .min_by(|a, b| {
                    victim_score(a.class_id)
                        .partial_cmp(&victim_score(b.class_id))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|info| info.class_id);

            let context = match victim {
                None => RebalanceContext::empty(),
                Some(victim) => {
                    let receiver = state
                        .values()
                        .filter(|info| info.class_id != victim)
                        .filter(|info| !receiver_blocked[&info.class_id])
                        .filter(|info| {
                            !self.config.filter_receiver_by_eviction_rate
                                || info.delta_evictions(&stats) > 0
                        })
                        .max_by(|a, b| {
                            smoothing.scores[&a.class_id]
                                .partial_cmp(&smoothing.scores[&b.class_id])
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|info| info.class_id);

                    match receiver {
                        Some(receiver)
                            if self.gates_pass(
                                smoothing.effective_min_diff,
                                victim_score(victim),
                                smoothing.scores[&receiver],
                            ) =>
                        {
                            RebalanceContext::with_pair(victim, receiver)
                        }
                        _ => RebalanceContext::empty(),
                    }
                }
            };

            if context.requests_move() {
                if self.config.enable_hold_off {
                    // The victim must not immediately take memory back,
                    // nor the receiver give it away.
                    if let Some(victim) = context.victim {
                        state.get_mut(&victim).unwrap().start_receiver_hold_off();
                    }
                    if let Some(receiver) = context.receiver {
                        state.get_mut(&receiver).unwrap().start_victim_hold_off();
                    }
                }
                smoothing.last_was_reversal = self.history.observe(pool, &context);
                if smoothing.last_was_reversal && self.config.auto_inc_threshold > 0.0 {
                    smoothing.effective_min_diff += self.config.auto_inc_threshold;
                }
            } else if self.config.auto_dec_threshold > 0.0 {
                smoothing.effective_min_diff = (smoothing.effective_min_diff
                    - self.config.auto_dec_threshold)
                    .max(self.config.min_diff);
            }

            if !self.config.decay_with_hits {
                for info in state.values_mut() {
                    info.update_tail_hits(&stats, self.config.decay_factor);
                }
            }
            snapshot_all(state, &stats);
            context
        })
    }

    fn is_thrashing(&self, pool: PoolId, context: &RebalanceContext) -> bool {
        let _ = context;
        self.smoothing
            .lock()
            .get(&pool)
            .map(|s| s.last_was_reversal)
            .unwrap_or(false)
    }
}

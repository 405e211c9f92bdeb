//! Rebalancing configuration.
//!
//! Mirrors the embedder-facing option surface: a strategy name plus the
//! shared and strategy-specific tuning knobs, deserialized from the
//! embedder's config file. Unknown fields and unknown strategy names
//! are rejected at construction.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::mrc::FootprintMrc;
use crate::strategy::{
    DefaultStrategy, EvictionRateConfig, EvictionRateStrategy, FreeMemConfig, FreeMemStrategy,
    HitsMode, HitsPerSlabConfig, HitsPerSlabStrategy, LamaConfig, LamaStrategy,
    LruTailAgeConfig, LruTailAgeStrategy, MarginalHitsConfig, MarginalHitsStrategy,
    RandomStrategy, RebalanceStrategy,
};

/// Strategy selector, spelled the way config files spell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Balance by LRU tail age.
    TailAge,
    /// Balance by hits per slab.
    Hits,
    /// Balance by tail-slab hits per tail slab.
    HitsPerTailSlab,
    /// Balance by first-touch hits per slab.
    HitsToggle,
    /// Balance by eviction deltas per slab.
    EvictionRate,
    /// Balance by smoothed marginal tail hits.
    MarginalHits,
    /// Marginal hits with adaptive thresholds and receiver filtering.
    MarginalHitsNew,
    /// Marginal hits with plain moving-average scoring.
    MarginalHitsOld,
    /// Release idle free slabs back to the pool.
    FreeMem,
    /// DP reallocation over the footprint profiler.
    Lama,
    /// Only react to allocation failures.
    Default,
    /// No rebalancing at all.
    Disabled,
    /// Uniform random victim/receiver.
    Random,
}

/// Errors raised while building a strategy from configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// `rebalance_min_slabs` must leave every class at least one slab.
    #[error("rebalance_min_slabs must be at least 1, got {0}")]
    InvalidMinSlabs(u64),

    /// Ratio knobs live in [0, 1].
    #[error("{name} must be within [0, 1], got {value}")]
    InvalidRatio {
        /// Offending option name.
        name: &'static str,
        /// Offending value.
        value: f64,
    },

    /// The profiler window cannot be empty.
    #[error("mrc_buffer_size must be at least 1")]
    InvalidBufferSize,
}

/// All recognized rebalancing options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebalanceConfig {
    /// Which policy to run.
    pub rebalance_strategy: StrategyKind,
    /// Slabs every class keeps; victims must hold more than this.
    pub rebalance_min_slabs: u64,
    /// Relative score-gap gate shared by the delta strategies.
    pub rebalance_diff_ratio: f64,
    /// Absolute score-gap gate shared by the delta strategies.
    pub min_diff: u64,
    /// Free-slab ratio above which the rebalancer releases a class's
    /// memory unconditionally; 0 disables the pass.
    pub free_alloc_threshold: u64,
    /// Minimum absolute tail-age gap for the tail-age strategy.
    pub min_tail_age_difference: u64,
    /// Unassigned-slab count that short-circuits rebalancing.
    pub num_slabs_free_mem: u64,
    /// Victim tail-age floor for the hits strategies; 0 disables.
    pub min_lru_tail_age: u64,
    /// Forced-victim tail-age ceiling for the hits strategies; 0
    /// disables.
    pub max_lru_tail_age: u64,
    /// Tail slabs scored by the tail strategies.
    pub tail_slab_cnt: u64,
    /// History weight of the marginal-hits moving average.
    pub moving_average_param: f64,
    /// Arm directional hold-offs after marginal-hits moves.
    pub enable_hold_off: bool,
    /// Decay marginal-hits history by request volume.
    pub decay_with_hits: bool,
    /// Fraction of marginal-hits history kept per decay.
    pub decay_factor: f64,
    /// Requests between marginal-hits decays.
    pub decay_interval_requests: u64,
    /// Require receivers to show eviction pressure.
    pub filter_receiver_by_eviction_rate: bool,
    /// Adaptive min-diff increment on reversals; 0 disables.
    pub auto_inc_threshold: f64,
    /// Adaptive min-diff decrement on idle rounds; 0 disables.
    pub auto_dec_threshold: f64,
    /// Free slabs a class must hold for the free-mem strategy.
    pub num_free_slabs: u64,
    /// Unassigned-slab ceiling for the free-mem strategy.
    pub max_unallocated_slabs: u64,
    /// Minimum miss-rate improvement before a LAMA plan is applied.
    pub lama_min_threshold: f64,
    /// Capacity of the footprint profiler window.
    pub mrc_buffer_size: usize,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            rebalance_strategy: StrategyKind::Default,
            rebalance_min_slabs: 1,
            rebalance_diff_ratio: 0.1,
            min_diff: 100,
            free_alloc_threshold: 0,
            min_tail_age_difference: 100,
            num_slabs_free_mem: 3,
            min_lru_tail_age: 0,
            max_lru_tail_age: 0,
            tail_slab_cnt: 1,
            moving_average_param: 0.3,
            enable_hold_off: true,
            decay_with_hits: false,
            decay_factor: 0.5,
            decay_interval_requests: 100_000,
            filter_receiver_by_eviction_rate: false,
            auto_inc_threshold: 0.0,
            auto_dec_threshold: 0.0,
            num_free_slabs: 3,
            max_unallocated_slabs: 1000,
            lama_min_threshold: 0.0,
            mrc_buffer_size: FootprintMrc::DEFAULT_CAPACITY,
        }
    }
}

impl RebalanceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.rebalance_min_slabs < 1 {
            return Err(ConfigError::InvalidMinSlabs(self.rebalance_min_slabs));
        }
        for (name, value) in [
            ("rebalance_diff_ratio", self.rebalance_diff_ratio),
            ("moving_average_param", self.moving_average_param),
            ("decay_factor", self.decay_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidRatio { name, value });
            }
        }
        if self.mrc_buffer_size < 1 {
            return Err(ConfigError::InvalidBufferSize);
        }
        Ok(())
    }

    fn hits_config(&self) -> HitsPerSlabConfig {
        HitsPerSlabConfig {
            min_diff: self.min_diff,
            diff_ratio: self.rebalance_diff_ratio,
            min_slabs: self.rebalance_min_slabs,
            num_slabs_free_mem: self.num_slabs_free_mem,
            min_lru_tail_age: self.min_lru_tail_age,
            max_lru_tail_age: self.max_lru_tail_age,
            tail_slab_cnt: self.tail_slab_cnt,
        }
    }

    fn marginal_config(&self) -> MarginalHitsConfig {
        MarginalHitsConfig {
            min_slabs: self.rebalance_min_slabs,
            tail_slab_cnt: self.tail_slab_cnt,
            moving_average_param: self.moving_average_param,
            enable_hold_off: self.enable_hold_off,
            min_diff: self.min_diff as f64,
            min_diff_ratio: self.rebalance_diff_ratio,
            decay_with_hits: self.decay_with_hits,
            decay_factor: self.decay_factor,
            decay_interval_requests: self.decay_interval_requests,
            filter_receiver_by_eviction_rate: self.filter_receiver_by_eviction_rate,
            auto_inc_threshold: self.auto_inc_threshold,
            auto_dec_threshold: self.auto_dec_threshold,
            use_projected_score_for_victim: false,
        }
    }
}

/// Build the configured strategy.
///
/// Returns `Ok(None)` for [`StrategyKind::Disabled`]. The profiler
/// backing the LAMA strategy is created here and reachable through
/// [`LamaStrategy::profiler`] on the returned object.
pub fn build_strategy(
    config: &RebalanceConfig,
) -> Result<Option<Arc<dyn RebalanceStrategy>>, ConfigError> {
    config.validate()?;

    let strategy: Arc<dyn RebalanceStrategy> = match config.rebalance_strategy {
        StrategyKind::Disabled => return Ok(None),
        StrategyKind::Default => Arc::new(DefaultStrategy::new()),
        StrategyKind::Random => Arc::new(RandomStrategy::new(config.rebalance_min_slabs)),
        StrategyKind::TailAge => Arc::new(LruTailAgeStrategy::new(LruTailAgeConfig {
            tail_age_difference_ratio: config.rebalance_diff_ratio,
            min_tail_age_difference: config.min_tail_age_difference,
            min_slabs: config.rebalance_min_slabs,
            num_slabs_free_mem: config.num_slabs_free_mem,
        })),
        StrategyKind::Hits => Arc::new(HitsPerSlabStrategy::new(
            HitsMode::Hits,
            config.hits_config(),
        )),
        StrategyKind::HitsToggle => Arc::new(HitsPerSlabStrategy::new(
            HitsMode::HitsToggle,
            config.hits_config(),
        )),
        StrategyKind::HitsPerTailSlab => Arc::new(HitsPerSlabStrategy::new(
            HitsMode::TailSlab,
            config.hits_config(),
        )),
        StrategyKind::EvictionRate => Arc::new(EvictionRateStrategy::new(EvictionRateConfig {
            min_diff: config.min_diff,
            diff_ratio: config.rebalance_diff_ratio,
            min_slabs: config.rebalance_min_slabs,
            num_slabs_free_mem: config.num_slabs_free_mem,
            min_lru_tail_age: config.min_lru_tail_age,
            max_lru_tail_age: config.max_lru_tail_age,
        })),
        StrategyKind::MarginalHits => Arc::new(MarginalHitsStrategy::new(config.marginal_config())),
        StrategyKind::MarginalHitsNew => {
            let mut marginal = config.marginal_config();
            marginal.decay_with_hits = true;
            marginal.filter_receiver_by_eviction_rate = true;
            if marginal.auto_inc_threshold == 0.0 {
                marginal.auto_inc_threshold = 1.0;
            }
            if marginal.auto_dec_threshold == 0.0 {
                marginal.auto_dec_threshold = 0.5;
            }
            Arc::new(MarginalHitsStrategy::new(marginal))
        }
        StrategyKind::MarginalHitsOld => {
            let mut marginal = config.marginal_config();
            marginal.enable_hold_off = false;
            marginal.min_diff = 0.0;
            marginal.min_diff_ratio = 0.0;
            Arc::new(MarginalHitsStrategy::new(marginal))
        }
        StrategyKind::FreeMem => Arc::new(FreeMemStrategy::new(FreeMemConfig {
            min_slabs: config.rebalance_min_slabs,
            num_free_slabs: config.num_free_slabs,
            max_unallocated_slabs: config.max_unallocated_slabs,
        })),
        StrategyKind::Lama => Arc::new(LamaStrategy::new(
            LamaConfig {
                min_threshold: config.lama_min_threshold,
            },
            Arc::new(FootprintMrc::new(config.mrc_buffer_size)),
        )),
    };
    Ok(Some(strategy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds_default_strategy() {
        let config = RebalanceConfig::default();
        let strategy = build_strategy(&config).unwrap().unwrap();
        assert_eq!(strategy.kind(), "default");
    }

    #[test]
    fn test_disabled_builds_nothing() {
        let config = RebalanceConfig {
            rebalance_strategy: StrategyKind::Disabled,
            ..Default::default()
        };
        assert!(build_strategy(&config).unwrap().is_none());
    }

    #[test]
    fn test_every_kind_maps_to_its_name() {
        let cases = [
            (StrategyKind::TailAge, "tail-age"),
            (StrategyKind::Hits, "hits"),
            (StrategyKind::HitsToggle, "hits-toggle"),
            (StrategyKind::HitsPerTailSlab, "hits-per-tail-slab"),
            (StrategyKind::EvictionRate, "eviction-rate"),
            (StrategyKind::MarginalHits, "marginal-hits"),
            (StrategyKind::MarginalHitsNew, "marginal-hits"),
            (StrategyKind::MarginalHitsOld, "marginal-hits"),
            (StrategyKind::FreeMem, "free-mem"),
            (StrategyKind::Lama, "lama"),
            (StrategyKind::Random, "random"),
        ];
        for (kind, name) in cases {
            let config = RebalanceConfig {
                rebalance_strategy: kind,
                mrc_buffer_size: 1024,
                ..Default::default()
            };
            let strategy = build_strategy(&config).unwrap().unwrap();
            assert_eq!(strategy.kind(), name);
        }
    }

    #[test]
    fn test_strategy_names_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            rebalance_strategy: StrategyKind,
        }
        let wrapper: Wrapper =
            serde_json::from_str(r#"{"rebalance_strategy": "marginal-hits-new"}"#).unwrap();
        assert_eq!(wrapper.rebalance_strategy, StrategyKind::MarginalHitsNew);

        let unknown =
            serde_json::from_str::<Wrapper>(r#"{"rebalance_strategy": "clock-pro"}"#);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_invalid_min_slabs_rejected() {
        let config = RebalanceConfig {
            rebalance_min_slabs: 0,
            ..Default::default()
        };
        assert_eq!(
            build_strategy(&config).unwrap_err(),
            ConfigError::InvalidMinSlabs(0)
        );
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let config = RebalanceConfig {
            rebalance_diff_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            build_strategy(&config).unwrap_err(),
            ConfigError::InvalidRatio {
                name: "rebalance_diff_ratio",
                ..
            }
        ));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = RebalanceConfig {
            rebalance_strategy: StrategyKind::Lama,
            mrc_buffer_size: 0,
            ..Default::default()
        };
        assert_eq!(
            build_strategy(&config).unwrap_err(),
            ConfigError::InvalidBufferSize
        );
    }
}

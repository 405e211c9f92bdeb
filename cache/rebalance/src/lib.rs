//! Slab-pool rebalancing: strategies, miss-ratio-curve profiling, and
//! the driver that applies slab moves.
//!
//! The allocator exposes its pools through the [`SlabBackend`] contract;
//! this crate decides which size class should give up a slab and which
//! should receive it, then asks the allocator to perform the move.
//!
//! # Architecture
//!
//! ```text
//!  request threads                    rebalancer thread
//!  ---------------                    -----------------
//!  FootprintMrc::feed ----+           PoolRebalancer::work
//!                         |                  |
//!                         v                  v
//!                 +--------------+    +-----------------------+
//!                 | FootprintMrc |<---| RebalanceStrategy     |
//!                 | (window +    |    | tail-age, hits, lama, |
//!                 |  MRC + DP)   |    | marginal-hits, ...    |
//!                 +--------------+    +-----------+-----------+
//!                                                 |
//!                                                 v
//!                                  SlabBackend::release_slab(victim, receiver)
//! ```
//!
//! Strategies are pluggable ([`RebalanceStrategy`]) and built from a
//! [`RebalanceConfig`] by name. Per-class deltas and hold-off cooldowns
//! live in [`RebalanceInfo`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backend;
mod config;
mod info;
mod mrc;
mod rebalancer;
mod strategy;

pub use backend::SlabBackend;
pub use config::{ConfigError, RebalanceConfig, StrategyKind, build_strategy};
pub use info::{NUM_HOLD_OFF_ROUNDS, PoolStateMap, RebalanceInfo};
pub use mrc::{ClassMrc, FootprintMrc, ReallocationPlan};
pub use rebalancer::{LoopStats, PoolRebalancer, RebalancerStats};
pub use strategy::{
    DefaultStrategy, EvictionRateConfig, EvictionRateStrategy, FreeMemConfig, FreeMemStrategy,
    HitsMode, HitsPerSlabConfig, HitsPerSlabStrategy, LamaConfig, LamaStrategy, LruTailAgeConfig,
    LruTailAgeStrategy, MarginalHitsConfig, MarginalHitsStrategy, RandomStrategy,
    RebalanceContext, RebalanceStrategy,
};

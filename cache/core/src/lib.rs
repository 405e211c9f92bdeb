//! Shared model for the slab cache core.
//!
//! This crate carries the vocabulary the eviction engine (`s3fifo`) and
//! the slab-pool rebalancer (`rebalance`) have in common:
//!
//! - [`PoolId`] / [`ClassId`] identifiers and the access/release enums
//! - the allocator statistics snapshot model ([`PoolStats`] and friends)
//! - the core error type ([`CoreError`])
//!
//! The item/slab allocator itself lives outside this workspace; it
//! produces the statistics snapshots consumed here and executes the slab
//! moves the rebalancer decides on.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod stats;
mod types;

pub use error::{CoreError, CoreResult};
pub use stats::{AcStats, CacheStat, ContainerStat, MPStats, PoolStats};
pub use types::{AccessMode, ClassId, PoolId, SlabReleaseMode};

//! S3-FIFO memory-management container with ghost-history admission.
//!
//! This crate implements the eviction side of a slab cache: an ordered
//! S3-FIFO state machine over allocator-owned items, plus the compact
//! FIFO-history hash table that backs its admission decisions.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                        MMContainer                            |
//! |  (mutex-serialized add/remove/replace + eviction iterator)    |
//! |                                                               |
//! |  +---------------------------------------------------------+  |
//! |  | S3FifoList                                              |  |
//! |  |                                                         |  |
//! |  |  +------------------+      +------------------------+   |  |
//! |  |  | Probationary (P) |      | Main (M)               |   |  |
//! |  |  | new admissions   | ---> | promoted on access or  |   |  |
//! |  |  | ~5% of items     |      | re-admission via ghost |   |  |
//! |  |  +------------------+      +------------------------+   |  |
//! |  |        |  evict                      ^                  |  |
//! |  |        v                             | contains() hit   |  |
//! |  |  +---------------------------------------------------+  |  |
//! |  |  | AtomicFifoHashTable (ghost history)               |  |  |
//! |  |  | fingerprints of recent P evictions, FIFO expiry   |  |  |
//! |  |  +---------------------------------------------------+  |  |
//! |  +---------------------------------------------------------+  |
//! +---------------------------------------------------------------+
//! ```
//!
//! Items are referenced by [`ItemId`] handles into an internal node
//! arena; the allocator creates an [`Item`], hands it to
//! [`MMContainer::add`], and gets it back from `remove` or the eviction
//! iterator when the residency ends.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod container;
mod dlist;
mod history;
mod item;
mod list;

pub use container::{
    EvictionIterator, MMContainer, MMContainerConfig, MMContainerState, MMContainerStat,
};
pub use dlist::DListState;
pub use history::AtomicFifoHashTable;
pub use item::{Item, ItemId};
pub use list::{S3FifoList, S3FifoListState};

//! The S3-FIFO ordering state machine.
//!
//! Two FIFO queues plus a ghost history:
//!
//! - **Probationary (P)**: new admissions, sized to hold one-hit wonders.
//! - **Main (M)**: items that proved themselves, either by an access
//!   while in P (promoted lazily during the eviction scan) or by a prior
//!   eviction recorded in the history (admitted straight to M).
//!
//! The 5% P/M ratio keeps M dominant; recycling accessed M-tail items to
//! the head approximates CLOCK without per-item reference sweeps.
//!
//! Callers serialize access externally; the container wraps this type in
//! its mutex. Only the `ACCESSED` flag may be set concurrently.

use std::hash::BuildHasher;

use serde::{Deserialize, Serialize};

use crate::dlist::{DList, DListState};
use crate::history::AtomicFifoHashTable;
use crate::item::{Item, ItemId, NodeArena, flags};

/// Share of the resident items the probationary queue is allowed to
/// hold before it becomes the eviction source.
const P_RATIO: f64 = 0.05;

/// Probationary + main FIFO pair with ghost-history admission.
pub struct S3FifoList {
    arena: NodeArena,
    pfifo: DList,
    mfifo: DList,
    hist: AtomicFifoHashTable,
    /// Slack (in items) tolerated between the history window and its
    /// target of half the resident set before a resize is forced.
    tail_size: usize,
    hasher: ahash::RandomState,
}

/// Persisted shape of an [`S3FifoList`]: both queue states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3FifoListState {
    /// Probationary queue state.
    pub pfifo: DListState,
    /// Main queue state.
    pub mfifo: DListState,
}

impl S3FifoList {
    /// Create an empty list. The ghost history is initialized lazily on
    /// the first eviction scan, once the resident set has a size.
    pub fn new(tail_size: usize) -> Self {
        Self {
            arena: NodeArena::new(),
            pfifo: DList::new(),
            mfifo: DList::new(),
            hist: AtomicFifoHashTable::new(),
            tail_size,
            hasher: ahash::RandomState::new(),
        }
    }

    /// Total resident items.
    #[inline]
    pub fn len(&self) -> usize {
        self.pfifo.len() + self.mfifo.len()
    }

    /// Whether no items are resident.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items in the probationary queue.
    #[inline]
    pub fn probationary_len(&self) -> usize {
        self.pfifo.len()
    }

    /// Items in the main queue.
    #[inline]
    pub fn main_len(&self) -> usize {
        self.mfifo.len()
    }

    /// Admit an item.
    ///
    /// A live ghost-history entry for the key routes it straight to the
    /// main queue; otherwise it starts probationary. The `ACCESSED` bit
    /// is left clear either way.
    pub fn add(&mut self, item: Item) -> ItemId {
        let fingerprint = self.fingerprint(item.key());
        let id = self.arena.insert(item);
        if self.hist.initialized() && self.hist.contains(fingerprint) {
            let node = self.arena.node(id);
            node.set_flag(flags::MAIN);
            node.unset_flag(flags::PROBATIONARY);
            self.mfifo.link_at_head(&mut self.arena, id);
        } else {
            let node = self.arena.node(id);
            node.set_flag(flags::PROBATIONARY);
            node.unset_flag(flags::MAIN);
            self.pfifo.link_at_head(&mut self.arena, id);
        }
        id
    }

    /// Mark an item accessed. No list mutation; promotion happens lazily
    /// during the eviction scan.
    #[inline]
    pub fn record_access(&self, id: ItemId) {
        self.arena.node(id).set_flag(flags::ACCESSED);
    }

    /// Remove a resident item and hand it back.
    ///
    /// Removing a probationary item records its fingerprint in the ghost
    /// history (when initialized) so a prompt re-insert is admitted to
    /// the main queue.
    pub fn remove(&mut self, id: ItemId) -> Item {
        if self.is_main(id) {
            self.mfifo.remove(&mut self.arena, id);
        } else {
            if self.hist.initialized() {
                let fingerprint = self.fingerprint(self.arena.node(id).key());
                self.hist.insert(fingerprint);
            }
            self.pfifo.remove(&mut self.arena, id);
        }
        self.arena.remove(id)
    }

    /// Splice `new` into the list position of `old`, returning the new
    /// handle and the displaced item. List membership flags transfer with
    /// the position; the caller copies the remaining flag state.
    pub fn replace(&mut self, old: ItemId, new: Item) -> (ItemId, Item) {
        let new_id = self.arena.insert(new);
        if self.is_main(old) {
            self.arena.node(new_id).set_flag(flags::MAIN);
            self.mfifo.replace(&mut self.arena, old, new_id);
        } else {
            self.arena.node(new_id).set_flag(flags::PROBATIONARY);
            self.pfifo.replace(&mut self.arena, old, new_id);
        }
        (new_id, self.arena.remove(old))
    }

    /// Select the next eviction candidate.
    ///
    /// Returns the candidate handle and whether it came from the
    /// probationary queue. Accessed candidates are recycled on the way:
    /// P-tail items promote to the main head, M-tail items rotate back to
    /// the main head with their access bit cleared. Returns `None` only
    /// when the list is empty.
    pub fn get_eviction_candidate(&mut self) -> Option<(ItemId, bool)> {
        let total = self.len();
        if total == 0 {
            return None;
        }

        if !self.hist.initialized() {
            self.hist.set_fifo_size((total / 2) as u32);
            self.hist.init_hashtable();
        }
        self.maybe_resize_history(total);

        // Every recycle moves an accessed item, so a pass over the whole
        // resident set twice means the bookkeeping is corrupt.
        let mut budget = 2 * total + 1;
        loop {
            budget -= 1;
            assert!(budget > 0, "eviction scan exceeded its recycle bound");

            let p_len = self.pfifo.len();
            let m_len = self.mfifo.len();
            let use_p = p_len as f64 > (p_len + m_len) as f64 * P_RATIO;

            let curr = if use_p {
                self.pfifo.tail()
            } else {
                self.mfifo.tail()
            };
            let Some(curr) = curr else {
                assert!(
                    if use_p { p_len == 0 } else { m_len == 0 },
                    "fifo tail missing while size is non-zero"
                );
                continue;
            };

            let node = self.arena.node(curr);
            if use_p {
                if node.has_flag(flags::ACCESSED) {
                    node.unset_flag(flags::ACCESSED);
                    node.unset_flag(flags::PROBATIONARY);
                    node.set_flag(flags::MAIN);
                    self.pfifo.remove(&mut self.arena, curr);
                    self.mfifo.link_at_head(&mut self.arena, curr);
                    continue;
                }
                return Some((curr, true));
            }
            if node.has_flag(flags::ACCESSED) {
                node.unset_flag(flags::ACCESSED);
                self.mfifo.remove(&mut self.arena, curr);
                self.mfifo.link_at_head(&mut self.arena, curr);
                continue;
            }
            return Some((curr, false));
        }
    }

    /// Whether the item sits in the main queue.
    #[inline]
    pub fn is_main(&self, id: ItemId) -> bool {
        self.arena.node(id).has_flag(flags::MAIN)
    }

    /// Whether the item sits in the probationary queue.
    #[inline]
    pub fn is_probationary(&self, id: ItemId) -> bool {
        self.arena.node(id).has_flag(flags::PROBATIONARY)
    }

    /// Whether the item's access bit is set.
    #[inline]
    pub fn is_accessed(&self, id: ItemId) -> bool {
        self.arena.node(id).has_flag(flags::ACCESSED)
    }

    /// Key bytes of a resident item.
    #[inline]
    pub fn key(&self, id: ItemId) -> &[u8] {
        self.arena.node(id).key()
    }

    /// The ghost history table.
    pub fn history(&self) -> &AtomicFifoHashTable {
        &self.hist
    }

    /// Export both queue states for persistence.
    pub fn save_state(&self) -> S3FifoListState {
        S3FifoListState {
            pfifo: self.pfifo.save_state(),
            mfifo: self.mfifo.save_state(),
        }
    }

    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    pub(crate) fn pfifo(&self) -> &DList {
        &self.pfifo
    }

    pub(crate) fn mfifo(&self) -> &DList {
        &self.mfifo
    }

    /// 32-bit key fingerprint for the ghost history.
    fn fingerprint(&self, key: &[u8]) -> u32 {
        self.hasher.hash_one(key) as u32
    }

    /// Track the history window against half the resident set, resizing
    /// once the drift exceeds the tail-size slack. A target that aligns
    /// to the current table size is left alone.
    fn maybe_resize_history(&mut self, total: usize) {
        let target = (total / 2) as u32;
        let current = self.hist.fifo_size();
        let drift = (target as i64 - current as i64).unsigned_abs() as usize;
        if drift >= self.tail_size && AtomicFifoHashTable::align_fifo_size(target) != current {
            self.hist.resize(target);
        }
    }
}

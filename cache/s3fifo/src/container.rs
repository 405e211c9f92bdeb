//! Memory-management container wrapping the S3-FIFO list.
//!
//! Structural mutation (`add`, `remove`, `replace`) and eviction
//! iteration serialize on one mutex. `record_access` takes the same
//! mutex briefly (a flag set plus counter bumps); with
//! `try_lock_update` it degrades to best-effort under contention.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use cache_core::AccessMode;

use crate::item::{Item, ItemId, flags};
use crate::list::{S3FifoList, S3FifoListState};

/// Container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MMContainerConfig {
    /// Record accesses for reads.
    pub update_on_read: bool,
    /// Record accesses for writes.
    pub update_on_write: bool,
    /// Seconds between config reconfigure checks; 0 disables them.
    pub mm_reconfigure_interval_secs: u64,
    /// Use `try_lock` in `record_access` and give up under contention.
    pub try_lock_update: bool,
    /// Serialize iterator-style stat reads in one combined critical
    /// section instead of handing out a locked iterator.
    pub use_combined_lock_for_iterators: bool,
    /// Number of main-queue items from the tail tracked as the tail-slab
    /// region; 0 disables tail tracking.
    pub tail_size: usize,
}

impl Default for MMContainerConfig {
    fn default() -> Self {
        Self {
            update_on_read: true,
            update_on_write: false,
            mm_reconfigure_interval_secs: 0,
            try_lock_update: false,
            use_combined_lock_for_iterators: false,
            tail_size: 0,
        }
    }
}

/// Counters exported by [`MMContainer::get_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MMContainerStat {
    /// Resident items.
    pub size: u64,
    /// First-touch hits since creation.
    pub num_hits_toggle: u64,
    /// First-touch hits on probationary items.
    pub num_hits_toggle_small: u64,
    /// First-touch hits on main-queue items.
    pub num_hits_toggle_large: u64,
    /// First-touch hits on tail-region items.
    pub num_tail_accesses: u64,
}

/// Persisted shape of a container: config plus both queue states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MMContainerState {
    /// The configuration at save time.
    pub config: MMContainerConfig,
    /// Queue states of the wrapped list.
    pub s3fifo: S3FifoListState,
}

struct Inner {
    list: S3FifoList,
    config: MMContainerConfig,
    next_reconfigure_secs: u64,
    num_tail: usize,
}

/// S3-FIFO memory-management container.
pub struct MMContainer {
    inner: Mutex<Inner>,
    // Snapshot of config.try_lock_update so record_access can pick its
    // locking mode before holding the lock.
    try_lock_update: AtomicBool,
    num_hits_toggle: AtomicU64,
    num_hits_toggle_small: AtomicU64,
    num_hits_toggle_large: AtomicU64,
    num_hits_toggle_tail: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn next_reconfigure_deadline(config: &MMContainerConfig, now: u64) -> u64 {
    if config.mm_reconfigure_interval_secs == 0 {
        u64::MAX
    } else {
        now + config.mm_reconfigure_interval_secs
    }
}

impl MMContainer {
    /// Create a container with the given configuration.
    pub fn new(config: MMContainerConfig) -> Self {
        let now = now_secs();
        Self {
            try_lock_update: AtomicBool::new(config.try_lock_update),
            inner: Mutex::new(Inner {
                list: S3FifoList::new(config.tail_size),
                next_reconfigure_secs: next_reconfigure_deadline(&config, now),
                num_tail: 0,
                config,
            }),
            num_hits_toggle: AtomicU64::new(0),
            num_hits_toggle_small: AtomicU64::new(0),
            num_hits_toggle_large: AtomicU64::new(0),
            num_hits_toggle_tail: AtomicU64::new(0),
        }
    }

    /// Resident item count.
    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    /// Whether the container holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an item and return its handle.
    ///
    /// The item enters with a clear access bit; the ghost history decides
    /// between probationary and main admission.
    pub fn add(&self, item: Item) -> ItemId {
        let now = now_secs();
        let mut inner = self.inner.lock();
        let id = inner.list.add(item);
        {
            let node = inner.list.arena().node(id);
            node.unset_flag(flags::ACCESSED);
            node.set_flag(flags::IN_CONTAINER);
        }
        inner.list.arena_mut().node_mut(id).set_update_time(now);
        Self::reconfigure_locked(&mut inner, now);
        Self::rebalance_tail(&mut inner);
        id
    }

    /// Remove a resident item, handing it back to the caller.
    ///
    /// Returns `None` if the handle is no longer in the container.
    pub fn remove(&self, id: ItemId) -> Option<Item> {
        let mut inner = self.inner.lock();
        Self::remove_locked(&mut inner, id)
    }

    fn remove_locked(inner: &mut Inner, id: ItemId) -> Option<Item> {
        let node = inner.list.arena().node(id);
        if !node.has_flag(flags::IN_CONTAINER) {
            return None;
        }
        if node.has_flag(flags::TAIL) {
            inner.num_tail -= 1;
        }
        Some(inner.list.remove(id))
    }

    /// Replace `old` with `new` in place.
    ///
    /// The new item inherits the old item's queue position, flag state,
    /// and update time. Returns the new handle and the displaced item, or
    /// `None` if `old` is not resident.
    pub fn replace(&self, old: ItemId, new: Item) -> Option<(ItemId, Item)> {
        let mut inner = self.inner.lock();
        let (old_flags, update_time) = {
            let node = inner.list.arena().node(old);
            if !node.has_flag(flags::IN_CONTAINER) {
                debug_assert!(false, "replace of an item not in the container");
                return None;
            }
            (node.flags_snapshot(), node.update_time())
        };
        let (new_id, old_item) = inner.list.replace(old, new);
        {
            let node = inner.list.arena().node(new_id);
            node.set_flags(old_flags);
        }
        inner
            .list
            .arena_mut()
            .node_mut(new_id)
            .set_update_time(update_time);
        Some((new_id, old_item))
    }

    /// Record an access on a resident item.
    ///
    /// Returns `true` when this call flipped the access bit. Repeat
    /// accesses before the next eviction scan return `false`, as do
    /// accesses filtered by the update-on-read/write config, and (under
    /// `try_lock_update`) calls that lose the lock race.
    pub fn record_access(&self, id: ItemId, mode: AccessMode) -> bool {
        let mut inner = if self.try_lock_update.load(Ordering::Relaxed) {
            match self.inner.try_lock() {
                Some(guard) => guard,
                None => return false,
            }
        } else {
            self.inner.lock()
        };

        if (mode == AccessMode::Write && !inner.config.update_on_write)
            || (mode == AccessMode::Read && !inner.config.update_on_read)
        {
            return false;
        }

        {
            let node = inner.list.arena().node(id);
            if !node.has_flag(flags::IN_CONTAINER) || node.has_flag(flags::ACCESSED) {
                return false;
            }
            node.set_flag(flags::ACCESSED);
            self.num_hits_toggle.fetch_add(1, Ordering::Relaxed);
            if node.has_flag(flags::PROBATIONARY) {
                self.num_hits_toggle_small.fetch_add(1, Ordering::Relaxed);
            } else {
                self.num_hits_toggle_large.fetch_add(1, Ordering::Relaxed);
                if node.has_flag(flags::TAIL) {
                    self.num_hits_toggle_tail.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let now = now_secs();
        inner.list.arena_mut().node_mut(id).set_update_time(now);
        true
    }

    /// Begin eviction. The returned iterator holds the container mutex
    /// for its lifetime.
    pub fn get_eviction_iterator(&self) -> EvictionIterator<'_> {
        let mut guard = self.inner.lock();
        let current = guard.list.get_eviction_candidate();
        EvictionIterator { guard, current }
    }

    /// Run `f` over an eviction iterator inside one critical section.
    ///
    /// This is the combined-lock path selected by
    /// [`MMContainerConfig::use_combined_lock_for_iterators`]; both paths
    /// serialize on the same mutex here.
    pub fn with_eviction_iterator<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut EvictionIterator<'_>) -> R,
    {
        let mut iter = self.get_eviction_iterator();
        f(&mut iter)
    }

    /// Snapshot the container counters.
    pub fn get_stats(&self) -> MMContainerStat {
        let size = self.inner.lock().list.len() as u64;
        MMContainerStat {
            size,
            num_hits_toggle: self.num_hits_toggle.load(Ordering::Relaxed),
            num_hits_toggle_small: self.num_hits_toggle_small.load(Ordering::Relaxed),
            num_hits_toggle_large: self.num_hits_toggle_large.load(Ordering::Relaxed),
            num_tail_accesses: self.num_hits_toggle_tail.load(Ordering::Relaxed),
        }
    }

    /// The active configuration.
    pub fn get_config(&self) -> MMContainerConfig {
        self.inner.lock().config.clone()
    }

    /// Swap the configuration and re-arm the reconfigure deadline.
    pub fn set_config(&self, config: MMContainerConfig) {
        let now = now_secs();
        let mut inner = self.inner.lock();
        self.try_lock_update
            .store(config.try_lock_update, Ordering::Relaxed);
        inner.next_reconfigure_secs = next_reconfigure_deadline(&config, now);
        inner.config = config;
    }

    /// Export the persistable state: config plus queue shapes.
    pub fn save_state(&self) -> MMContainerState {
        let inner = self.inner.lock();
        MMContainerState {
            config: inner.config.clone(),
            s3fifo: inner.list.save_state(),
        }
    }

    /// Whether the item sits in the main queue.
    pub fn is_main(&self, id: ItemId) -> bool {
        self.inner.lock().list.is_main(id)
    }

    /// Whether the item sits in the probationary queue.
    pub fn is_probationary(&self, id: ItemId) -> bool {
        self.inner.lock().list.is_probationary(id)
    }

    /// Reconfiguration only moves the deadline; no list restructuring.
    fn reconfigure_locked(inner: &mut Inner, now: u64) {
        if now < inner.next_reconfigure_secs {
            return;
        }
        inner.next_reconfigure_secs = now + inner.config.mm_reconfigure_interval_secs;
    }

    /// Re-mark the tail region: the last `tail_size` main-queue items
    /// carry the TAIL bit, the first item past the region loses it.
    fn rebalance_tail(inner: &mut Inner) {
        let tail_size = inner.config.tail_size;
        if tail_size == 0 {
            return;
        }
        let mut walked = 0usize;
        let mut cursor = inner.list.mfifo().tail();
        while let Some(id) = cursor {
            let node = inner.list.arena().node(id);
            if walked < tail_size {
                if !node.has_flag(flags::TAIL) {
                    node.set_flag(flags::TAIL);
                    inner.num_tail += 1;
                }
            } else {
                if node.has_flag(flags::TAIL) {
                    node.unset_flag(flags::TAIL);
                    inner.num_tail -= 1;
                }
                break;
            }
            walked += 1;
            cursor = inner.list.mfifo().prev(inner.list.arena(), id);
        }
    }
}

/// Walks eviction candidates while holding the container mutex.
pub struct EvictionIterator<'a> {
    guard: MutexGuard<'a, Inner>,
    current: Option<(ItemId, bool)>,
}

impl EvictionIterator<'_> {
    /// The current candidate, if any.
    pub fn current(&self) -> Option<ItemId> {
        self.current.map(|(id, _)| id)
    }

    /// Whether the current candidate came from the probationary queue.
    pub fn from_probationary(&self) -> Option<bool> {
        self.current.map(|(_, from_prob)| from_prob)
    }

    /// Key bytes of the current candidate.
    pub fn key(&self) -> Option<&[u8]> {
        self.current.map(|(id, _)| self.guard.list.key(id))
    }

    /// Step past the current candidate without evicting it, walking from
    /// the tail of its queue towards the head.
    pub fn advance(&mut self) {
        let Some((id, _)) = self.current else {
            return;
        };
        let list = &self.guard.list;
        let queue = if list.is_main(id) {
            list.mfifo()
        } else {
            list.pfifo()
        };
        let prev = queue.prev(list.arena(), id);
        self.current = prev.map(|p| (p, self.guard.list.is_probationary(p)));
    }

    /// Evict the current candidate, returning its item, and move to the
    /// next candidate. Probationary evictions feed the ghost history via
    /// the list removal path.
    pub fn remove_current(&mut self) -> Option<Item> {
        let (id, _) = self.current.take()?;
        let item = MMContainer::remove_locked(&mut self.guard, id);
        debug_assert!(item.is_some(), "eviction candidate left the container");
        self.current = self.guard.list.get_eviction_candidate();
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container() -> MMContainer {
        MMContainer::new(MMContainerConfig::default())
    }

    fn add_keys(c: &MMContainer, keys: &[&[u8]]) -> Vec<ItemId> {
        keys.iter().map(|k| c.add(Item::new(k.to_vec()))).collect()
    }

    #[test]
    fn test_add_and_len() {
        let c = container();
        assert!(c.is_empty());
        add_keys(&c, &[b"a", b"b"]);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_remove_returns_item() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b"]);
        let item = c.remove(ids[0]).unwrap();
        assert_eq!(item.key(), b"a");
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_record_access_toggles_once() {
        let c = container();
        let ids = add_keys(&c, &[b"a"]);
        assert!(c.record_access(ids[0], AccessMode::Read));
        // Second access before an eviction scan does not count again.
        assert!(!c.record_access(ids[0], AccessMode::Read));
        assert_eq!(c.get_stats().num_hits_toggle, 1);
        assert_eq!(c.get_stats().num_hits_toggle_small, 1);
    }

    #[test]
    fn test_record_access_respects_mode_config() {
        let c = container();
        let ids = add_keys(&c, &[b"a"]);
        // Writes are not recorded by default.
        assert!(!c.record_access(ids[0], AccessMode::Write));
        assert_eq!(c.get_stats().num_hits_toggle, 0);

        let mut config = c.get_config();
        config.update_on_write = true;
        config.update_on_read = false;
        c.set_config(config);

        assert!(!c.record_access(ids[0], AccessMode::Read));
        assert!(c.record_access(ids[0], AccessMode::Write));
        assert_eq!(c.get_stats().num_hits_toggle, 1);
    }

    #[test]
    fn test_eviction_iterator_walks_candidates() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b", b"c"]);

        let mut iter = c.get_eviction_iterator();
        assert_eq!(iter.current(), Some(ids[0]));
        assert_eq!(iter.from_probationary(), Some(true));
        assert_eq!(iter.key(), Some(&b"a"[..]));

        let evicted = iter.remove_current().unwrap();
        assert_eq!(evicted.key(), b"a");
        assert_eq!(iter.current(), Some(ids[1]));
        drop(iter);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_eviction_iterator_advance_skips() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b", b"c"]);
        let mut iter = c.get_eviction_iterator();
        assert_eq!(iter.current(), Some(ids[0]));
        iter.advance();
        assert_eq!(iter.current(), Some(ids[1]));
        iter.advance();
        assert_eq!(iter.current(), Some(ids[2]));
        iter.advance();
        assert_eq!(iter.current(), None);
    }

    #[test]
    fn test_evicted_probationary_readmits_to_main() {
        let c = container();
        add_keys(&c, &[b"a", b"b", b"c"]);
        let evicted = c.with_eviction_iterator(|iter| iter.remove_current().unwrap());
        assert_eq!(evicted.key(), b"a");

        let readmitted = c.add(Item::new(&b"a"[..]));
        assert!(c.is_main(readmitted));
        assert!(!c.is_probationary(readmitted));
    }

    #[test]
    fn test_replace_inherits_position_and_flags() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b", b"c"]);
        c.record_access(ids[1], AccessMode::Read);

        let (new_id, old) = c.replace(ids[1], Item::new(&b"b2"[..])).unwrap();
        assert_eq!(old.key(), b"b");
        assert!(c.is_probationary(new_id));
        assert_eq!(c.len(), 3);

        // The inherited access bit promotes the replacement during the
        // next scan rather than evicting it.
        let evicted = c.with_eviction_iterator(|iter| {
            iter.remove_current();
            iter.remove_current().unwrap()
        });
        assert_eq!(evicted.key(), b"c");
        assert!(c.is_main(new_id));
    }

    #[test]
    fn test_replace_of_removed_item_fails() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b"]);
        let removed = c.remove(ids[0]);
        assert!(removed.is_some());
        assert!(c.remove(ids[0]).is_none());
    }

    #[test]
    fn test_tail_tracking_counts_tail_hits() {
        let config = MMContainerConfig {
            tail_size: 2,
            ..Default::default()
        };
        let c = MMContainer::new(config);
        let ids = add_keys(&c, &[b"a", b"b", b"c", b"d"]);
        for id in &ids {
            c.record_access(*id, AccessMode::Read);
        }
        // Promote everything to main via an eviction scan, then re-mark
        // the tail region with another add.
        c.with_eviction_iterator(|iter| iter.current());
        let extra = c.add(Item::new(&b"e"[..]));

        // a and b sit at the main tail now.
        assert!(c.record_access(ids[0], AccessMode::Read));
        assert!(c.record_access(ids[2], AccessMode::Read));
        let stats = c.get_stats();
        assert_eq!(stats.num_tail_accesses, 1);
        assert_eq!(stats.num_hits_toggle_large, 2);
        let _ = extra;
    }

    #[test]
    fn test_stats_size_tracks_len() {
        let c = container();
        let ids = add_keys(&c, &[b"a", b"b", b"c"]);
        assert_eq!(c.get_stats().size, 3);
        c.remove(ids[2]);
        assert_eq!(c.get_stats().size, 2);
    }

    #[test]
    fn test_save_state_roundtrips_config() {
        let config = MMContainerConfig {
            update_on_write: true,
            tail_size: 4,
            ..Default::default()
        };
        let c = MMContainer::new(config.clone());
        add_keys(&c, &[b"a", b"b"]);
        let state = c.save_state();
        assert_eq!(state.config, config);
        assert_eq!(state.s3fifo.pfifo.len, 2);
        assert_eq!(state.s3fifo.mfifo.len, 0);
    }

    #[test]
    fn test_try_lock_update_gives_up_under_contention() {
        let config = MMContainerConfig {
            try_lock_update: true,
            ..Default::default()
        };
        let c = MMContainer::new(config);
        let ids = add_keys(&c, &[b"a"]);

        // The iterator holds the container mutex.
        let iter = c.get_eviction_iterator();
        assert!(!c.record_access(ids[0], AccessMode::Read));
        drop(iter);
        assert!(c.record_access(ids[0], AccessMode::Read));
    }
}

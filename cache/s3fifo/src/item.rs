//! Items, handles, and the node arena.
//!
//! The allocator owns item memory; this container only tracks membership
//! and ordering. Items handed across the boundary carry just their key.
//! Internally each resident item occupies one arena node holding the
//! list hook, the MM flag bits, and the last update time.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;

/// An item as seen by the container: the key it was stored under.
///
/// Created by the allocator, consumed by [`add`](crate::MMContainer::add)
/// and returned on removal or eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    key: Bytes,
}

impl Item {
    /// Create an item for `key`.
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self { key: key.into() }
    }

    /// The item's key bytes.
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

/// Handle to a resident item.
///
/// Valid from the `add` that produced it until the matching removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(u32);

impl ItemId {
    #[inline]
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub(crate) fn index(self) -> u32 {
        self.0
    }
}

/// MM flag bits, one atomic byte per node.
///
/// `PROBATIONARY` and `MAIN` are mutually exclusive while `IN_CONTAINER`
/// is set. `ACCESSED` is set-only outside the container lock; a lost
/// concurrent update is harmless.
pub(crate) mod flags {
    pub const ACCESSED: u8 = 1 << 0;
    pub const PROBATIONARY: u8 = 1 << 1;
    pub const MAIN: u8 = 1 << 2;
    pub const IN_CONTAINER: u8 = 1 << 3;
    pub const TAIL: u8 = 1 << 4;
}

/// Sentinel for "no node" in list hooks.
pub(crate) const NIL: u32 = u32::MAX;

/// One resident item: key, flag bits, list hook, update time.
pub(crate) struct Node {
    key: Bytes,
    flags: AtomicU8,
    update_time: u64,
    pub(crate) prev: u32,
    pub(crate) next: u32,
    occupied: bool,
}

impl Node {
    fn new(key: Bytes) -> Self {
        Self {
            key,
            flags: AtomicU8::new(0),
            update_time: 0,
            prev: NIL,
            next: NIL,
            occupied: true,
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> &Bytes {
        &self.key
    }

    #[inline]
    pub(crate) fn set_flag(&self, bit: u8) {
        self.flags.fetch_or(bit, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn unset_flag(&self, bit: u8) {
        self.flags.fetch_and(!bit, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn has_flag(&self, bit: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & bit != 0
    }

    #[inline]
    pub(crate) fn flags_snapshot(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_flags(&self, bits: u8) {
        self.flags.store(bits, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn update_time(&self) -> u64 {
        self.update_time
    }

    #[inline]
    pub(crate) fn set_update_time(&mut self, secs: u64) {
        self.update_time = secs;
    }
}

/// Slab-style arena of nodes with a free list.
///
/// Handles are indices into `nodes`; freed slots are reused in LIFO
/// order. All mutation happens under the container mutex.
#[derive(Default)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
    free: Vec<u32>,
    len: usize,
}

impl NodeArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, item: Item) -> ItemId {
        let node = Node::new(item.key);
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = node;
                ItemId::new(index)
            }
            None => {
                let index = self.nodes.len() as u32;
                assert!(index != NIL, "node arena exhausted");
                self.nodes.push(node);
                ItemId::new(index)
            }
        }
    }

    /// Free the node and hand the item back to the caller.
    pub(crate) fn remove(&mut self, id: ItemId) -> Item {
        let node = &mut self.nodes[id.index() as usize];
        assert!(node.occupied, "stale item handle");
        debug_assert!(node.prev == NIL && node.next == NIL, "node still linked");
        node.occupied = false;
        node.flags = AtomicU8::new(0);
        let key = std::mem::take(&mut node.key);
        self.free.push(id.index());
        self.len -= 1;
        Item { key }
    }

    #[inline]
    pub(crate) fn node(&self, id: ItemId) -> &Node {
        let node = &self.nodes[id.index() as usize];
        assert!(node.occupied, "stale item handle");
        node
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, id: ItemId) -> &mut Node {
        let node = &mut self.nodes[id.index() as usize];
        assert!(node.occupied, "stale item handle");
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_roundtrip() {
        let mut arena = NodeArena::new();
        let id = arena.insert(Item::new(&b"alpha"[..]));
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.node(id).key().as_ref(), b"alpha");

        let item = arena.remove(id);
        assert_eq!(item.key(), b"alpha");
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn test_slot_reuse() {
        let mut arena = NodeArena::new();
        let a = arena.insert(Item::new(&b"a"[..]));
        arena.remove(a);
        let b = arena.insert(Item::new(&b"b"[..]));
        // The freed slot is reused for the next insert.
        assert_eq!(a.index(), b.index());
        assert_eq!(arena.node(b).key().as_ref(), b"b");
    }

    #[test]
    #[should_panic(expected = "stale item handle")]
    fn test_stale_handle_panics() {
        let mut arena = NodeArena::new();
        let id = arena.insert(Item::new(&b"x"[..]));
        arena.remove(id);
        arena.node(id);
    }

    #[test]
    fn test_flag_ops() {
        let mut arena = NodeArena::new();
        let id = arena.insert(Item::new(&b"k"[..]));
        let node = arena.node(id);
        assert!(!node.has_flag(flags::ACCESSED));

        node.set_flag(flags::ACCESSED);
        node.set_flag(flags::MAIN);
        assert!(node.has_flag(flags::ACCESSED));
        assert!(node.has_flag(flags::MAIN));

        node.unset_flag(flags::ACCESSED);
        assert!(!node.has_flag(flags::ACCESSED));
        assert!(node.has_flag(flags::MAIN));

        arena.remove(id);
        let id2 = arena.insert(Item::new(&b"k2"[..]));
        // Fresh node starts with a clean flag byte even on a reused slot.
        assert_eq!(arena.node(id2).flags_snapshot(), 0);
    }
}

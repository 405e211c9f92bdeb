//! Compact FIFO-history hash table.
//!
//! Records fingerprints of recently evicted probationary items so a
//! re-inserted key can be admitted straight to the main queue. Entries
//! expire by insertion age: a slot is live only while
//! `now - insertion_time <= fifo_size`, where "time" is the logical
//! insert counter.
//!
//! Slot encoding packs both fields into one `u64`:
//!
//! ```text
//! [ insertion_time: 32 bits ][ key fingerprint: 32 bits ]
//! ```
//!
//! Zero means empty. `insert` and `contains` are wait-free relaxed
//! CAS/load loops; there is no linearizable guarantee between concurrent
//! inserts of the same key. Best-effort recency is the contract.

use std::sync::atomic::{AtomicU64, Ordering};

/// Slots scanned per bucket; buckets are 8-slot aligned groups.
const ITEMS_PER_BUCKET: usize = 8;

/// Table slots per unit of fifo size.
const LOAD_FACTOR_INV: usize = 2;

const BUCKET_MASK: usize = !0x7;
const KEY_MASK: u64 = 0x0000_0000_FFFF_FFFF;

/// Lock-free bucketed hash table with FIFO-by-insertion-time expiry.
pub struct AtomicFifoHashTable {
    table: Box<[AtomicU64]>,
    num_elem: usize,
    fifo_size: u32,
    num_inserts: AtomicU64,
    num_evicts: AtomicU64,
}

impl Default for AtomicFifoHashTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicFifoHashTable {
    /// Create an uninitialized table; call [`set_fifo_size`] and
    /// [`init_hashtable`] before use.
    ///
    /// [`set_fifo_size`]: Self::set_fifo_size
    /// [`init_hashtable`]: Self::init_hashtable
    pub fn new() -> Self {
        Self {
            table: Box::new([]),
            num_elem: 0,
            fifo_size: 0,
            num_inserts: AtomicU64::new(0),
            num_evicts: AtomicU64::new(0),
        }
    }

    /// Create a table sized for a logical expiry window of `fifo_size`.
    pub fn with_fifo_size(fifo_size: u32) -> Self {
        let mut table = Self::new();
        table.set_fifo_size(fifo_size);
        table.init_hashtable();
        table
    }

    /// Whether the backing table has been allocated.
    #[inline]
    pub fn initialized(&self) -> bool {
        !self.table.is_empty()
    }

    /// Set the expiry window. The size is rounded up into the next
    /// 8-aligned bucket multiple; the table holds
    /// `fifo_size * LOAD_FACTOR_INV` slots.
    pub fn set_fifo_size(&mut self, fifo_size: u32) {
        self.fifo_size = Self::align_fifo_size(fifo_size);
        self.num_elem = self.fifo_size as usize * LOAD_FACTOR_INV;
    }

    /// Allocate (or reallocate) the zeroed backing table.
    pub fn init_hashtable(&mut self) {
        self.table = (0..self.num_elem).map(|_| AtomicU64::new(0)).collect();
    }

    /// The effective (aligned) expiry window.
    #[inline]
    pub fn fifo_size(&self) -> u32 {
        self.fifo_size
    }

    /// Slots overwritten because their bucket was full.
    #[inline]
    pub fn num_evicts(&self) -> u64 {
        self.num_evicts.load(Ordering::Relaxed)
    }

    /// The 8-aligned window a given target would round to.
    #[inline]
    pub fn align_fifo_size(fifo_size: u32) -> u32 {
        ((fifo_size >> 3) + 1) << 3
    }

    /// Record `key` at the current logical time.
    ///
    /// Takes the first empty slot in the key's bucket. If the bucket is
    /// full, one slot is overwritten unconditionally and the eviction
    /// counter is bumped.
    pub fn insert(&self, key: u32) {
        let time = self.next_insert_time();
        if !self.initialized() {
            return;
        }
        let bucket = self.bucket_index(key);
        let value = Self::slot_value(key, time);

        for slot in &self.table[bucket..bucket + ITEMS_PER_BUCKET] {
            if slot.load(Ordering::Relaxed) == 0
                && slot
                    .compare_exchange(0, value, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
        }

        // No empty slot: overwrite the key's natural position.
        self.num_evicts.fetch_add(1, Ordering::Relaxed);
        self.table[key as usize % self.num_elem].store(value, Ordering::Relaxed);
    }

    /// Check for a live entry of `key`, consuming it on hit.
    ///
    /// Expired slots encountered during the scan are zeroed best-effort.
    /// A hit zeroes the slot as well: the history only needs to classify
    /// the next insert of the key, and a one-shot answer frees capacity.
    pub fn contains(&self, key: u32) -> bool {
        if !self.initialized() {
            return false;
        }
        let now = self.num_inserts.load(Ordering::Relaxed) as u32;
        let bucket = self.bucket_index(key);

        for slot in &self.table[bucket..bucket + ITEMS_PER_BUCKET] {
            let value = slot.load(Ordering::Relaxed);
            if value == 0 {
                continue;
            }
            // Unsigned 32-bit age arithmetic so a wrapped insert counter
            // still compares correctly.
            let age = now.wrapping_sub(Self::insertion_time(value));
            if age > self.fifo_size {
                let _ = slot.compare_exchange(value, 0, Ordering::Relaxed, Ordering::Relaxed);
                continue;
            }
            if value & KEY_MASK == key as u64 {
                let _ = slot.compare_exchange(value, 0, Ordering::Relaxed, Ordering::Relaxed);
                return true;
            }
        }
        false
    }

    /// Grow or shrink the expiry window, rehashing live entries into the
    /// new table. Callers serialize resizes (the container mutex); the
    /// wait-free paths stay untouched while the new table is built.
    pub fn resize(&mut self, new_fifo_size: u32) {
        let aligned = Self::align_fifo_size(new_fifo_size);
        let new_num_elem = aligned as usize * LOAD_FACTOR_INV;
        let new_table: Box<[AtomicU64]> = (0..new_num_elem).map(|_| AtomicU64::new(0)).collect();

        if self.initialized() {
            let now = self.num_inserts.load(Ordering::Relaxed) as u32;
            for slot in self.table.iter() {
                let value = slot.load(Ordering::Relaxed);
                if value == 0 {
                    continue;
                }
                let age = now.wrapping_sub(Self::insertion_time(value));
                if age > self.fifo_size {
                    continue;
                }
                let key = (value & KEY_MASK) as usize;
                let bucket = (key % new_num_elem) & BUCKET_MASK;
                for new_slot in &new_table[bucket..bucket + ITEMS_PER_BUCKET] {
                    if new_slot.load(Ordering::Relaxed) == 0 {
                        new_slot.store(value, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }

        self.table = new_table;
        self.fifo_size = aligned;
        self.num_elem = new_num_elem;
    }

    /// Fetch-and-increment the logical clock, wrapping to zero once the
    /// counter exceeds `u32::MAX`.
    fn next_insert_time(&self) -> u32 {
        let time = self.num_inserts.fetch_add(1, Ordering::Relaxed);
        if time > u32::MAX as u64 {
            self.num_inserts.store(0, Ordering::Relaxed);
            0
        } else {
            time as u32
        }
    }

    #[inline]
    fn bucket_index(&self, key: u32) -> usize {
        (key as usize % self.num_elem) & BUCKET_MASK
    }

    #[inline]
    fn slot_value(key: u32, time: u32) -> u64 {
        key as u64 | ((time as u64) << 32)
    }

    #[inline]
    fn insertion_time(value: u64) -> u32 {
        (value >> 32) as u32
    }

    #[cfg(test)]
    pub(crate) fn set_insert_clock(&self, time: u64) {
        self.num_inserts.store(time, Ordering::Relaxed);
    }
}

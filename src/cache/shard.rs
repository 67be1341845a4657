//! # Cache Shard
//!
//! One partition of the node cache. Entries live in a slot arena and are
//! threaded through two intrusive lists by slot index:
//!
//! ```text
//! buckets: [ 0 ]─> slot 4 ─> slot 9          (hash chains, fixed bucket count)
//!          [ 1 ]─> slot 2
//!          [ 2 ]   -
//!
//! LRU:  head (newest) <-> slot 2 <-> slot 9 <-> slot 4 <-> tail (oldest)
//!                                    ^ hand walks from the tail toward the head
//! ```
//!
//! Handles returned to callers carry the slot generation, so a handle that
//! outlives its entry is detected instead of releasing an unrelated entry.
//!
//! Deleted entries that are still pinned are unlinked from the bucket chain
//! and the LRU list at once, so they can neither be found nor chosen by the
//! clock, and are freed by the release that drops their last pin.

use std::hash::Hash;

use eyre::Result;

use super::EvictionHandler;
use crate::error::BtreeError;
use crate::memory::MemoryBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

struct Entry<K, V> {
    key: K,
    value: V,
    refcount: u32,
    deleted: bool,
    referenced: bool,
    dirty: bool,
    bucket: u32,
    bucket_next: Option<u32>,
    lru_prev: Option<u32>,
    lru_next: Option<u32>,
}

struct Slot<K, V> {
    generation: u32,
    entry: Option<Entry<K, V>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub creates: u64,
    pub frees: u64,
}

pub struct CacheShard<K, V> {
    buckets: Box<[Option<u32>]>,
    slots: Vec<Slot<K, V>>,
    free: Vec<u32>,
    lru_head: Option<u32>,
    lru_tail: Option<u32>,
    lru_len: usize,
    hand: Option<u32>,
    occupied: usize,
    max_entries: usize,
    pin_limit: Option<usize>,
    stats: ShardStats,
}

/// What a release did to the entry.
#[derive(Debug, PartialEq, Eq)]
pub enum Released<V> {
    StillCached,
    Freed(V),
}

impl<K: Eq + Hash + Clone, V: Clone> CacheShard<K, V> {
    pub fn new(max_entries: usize, nbuckets: usize) -> Self {
        Self {
            buckets: vec![None; nbuckets.max(1)].into_boxed_slice(),
            slots: Vec::with_capacity(max_entries),
            free: Vec::new(),
            lru_head: None,
            lru_tail: None,
            lru_len: 0,
            hand: None,
            occupied: 0,
            max_entries,
            pin_limit: None,
            stats: ShardStats::default(),
        }
    }

    /// Entries currently holding a slot, including deleted ones still pinned.
    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Caps growth past `max_entries` while everything is pinned.
    pub fn set_pin_limit(&mut self, limit: Option<usize>) {
        self.pin_limit = limit;
    }

    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ShardStats::default();
    }

    pub fn pinned(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.refcount > 0)
            .count()
    }

    fn bucket_of(&self, hash: u64) -> u32 {
        ((hash >> 32) as usize % self.buckets.len()) as u32
    }

    fn entry(&self, idx: u32) -> &Entry<K, V> {
        match &self.slots[idx as usize].entry {
            Some(e) => e,
            None => unreachable!("cache slot {} linked but empty", idx),
        }
    }

    fn entry_mut(&mut self, idx: u32) -> &mut Entry<K, V> {
        match &mut self.slots[idx as usize].entry {
            Some(e) => e,
            None => unreachable!("cache slot {} linked but empty", idx),
        }
    }

    fn handle(&self, idx: u32) -> SlotHandle {
        SlotHandle {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    fn lookup(&self, hash: u64, key: &K) -> Option<u32> {
        let mut cur = self.buckets[self.bucket_of(hash) as usize];
        while let Some(idx) = cur {
            let e = self.entry(idx);
            if e.key == *key {
                return Some(idx);
            }
            cur = e.bucket_next;
        }
        None
    }

    fn link(&mut self, hash: u64, key: K, value: V) -> u32 {
        let bucket = self.bucket_of(hash);
        let entry = Entry {
            key,
            value,
            refcount: 0,
            deleted: false,
            referenced: true,
            dirty: false,
            bucket,
            bucket_next: self.buckets[bucket as usize],
            lru_prev: None,
            lru_next: self.lru_head,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize].entry = Some(entry);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.buckets[bucket as usize] = Some(idx);
        if let Some(head) = self.lru_head {
            self.entry_mut(head).lru_prev = Some(idx);
        }
        self.lru_head = Some(idx);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(idx);
        }
        self.lru_len += 1;
        self.occupied += 1;
        self.stats.creates += 1;
        idx
    }

    fn unlink_bucket(&mut self, idx: u32) {
        let (bucket, next) = {
            let e = self.entry(idx);
            (e.bucket, e.bucket_next)
        };
        let mut cur = self.buckets[bucket as usize];
        let mut prev: Option<u32> = None;
        while let Some(c) = cur {
            if c == idx {
                match prev {
                    Some(p) => self.entry_mut(p).bucket_next = next,
                    None => self.buckets[bucket as usize] = next,
                }
                return;
            }
            prev = Some(c);
            cur = self.entry(c).bucket_next;
        }
    }

    fn unlink_lru(&mut self, idx: u32) {
        let (prev, next) = {
            let e = self.entry(idx);
            (e.lru_prev, e.lru_next)
        };
        match prev {
            Some(p) => self.entry_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entry_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
        if self.hand == Some(idx) {
            self.hand = prev;
        }
        let e = self.entry_mut(idx);
        e.lru_prev = None;
        e.lru_next = None;
        self.lru_len -= 1;
    }

    fn free_slot(&mut self, idx: u32) -> Option<Entry<K, V>> {
        let slot = &mut self.slots[idx as usize];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        self.occupied -= 1;
        self.stats.frees += 1;
        entry
    }

    /// Looks up `key`, pinning it and setting its use bit.
    pub fn get(&mut self, hash: u64, key: &K) -> Option<(SlotHandle, V)> {
        match self.lookup(hash, key) {
            Some(idx) => {
                self.stats.hits += 1;
                let e = self.entry_mut(idx);
                e.refcount += 1;
                e.referenced = true;
                let value = e.value.clone();
                Some((self.handle(idx), value))
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, hash: u64, key: &K) -> bool {
        self.lookup(hash, key).is_some()
    }

    /// Inserts a pinned entry. The caller has already made room.
    pub fn insert_pinned(&mut self, hash: u64, key: K, value: V) -> SlotHandle {
        let idx = self.link(hash, key, value);
        self.entry_mut(idx).refcount = 1;
        self.handle(idx)
    }

    /// Replaces the value of a live entry and pins it.
    pub fn replace(&mut self, hash: u64, key: &K, value: V) -> Option<(SlotHandle, V)> {
        let idx = self.lookup(hash, key)?;
        let e = self.entry_mut(idx);
        let previous = std::mem::replace(&mut e.value, value);
        e.refcount += 1;
        e.referenced = true;
        Some((self.handle(idx), previous))
    }

    pub fn increment_refcount(&mut self, hash: u64, key: &K) -> bool {
        match self.lookup(hash, key) {
            Some(idx) => {
                self.entry_mut(idx).refcount += 1;
                true
            }
            None => false,
        }
    }

    pub fn set_dirty(&mut self, hash: u64, key: &K, dirty: bool) -> bool {
        match self.lookup(hash, key) {
            Some(idx) => {
                self.entry_mut(idx).dirty = dirty;
                true
            }
            None => false,
        }
    }

    pub fn refcount(&self, hash: u64, key: &K) -> Option<u32> {
        self.lookup(hash, key).map(|idx| self.entry(idx).refcount)
    }

    fn release_slot(&mut self, idx: u32) -> Result<Released<V>> {
        let e = self.entry_mut(idx);
        if e.refcount == 0 {
            return Err(BtreeError::corruption(
                "cache refcount",
                format!("release of cache slot {} without a matching pin", idx),
            )
            .into());
        }
        e.refcount -= 1;
        if e.refcount == 0 && e.deleted {
            if let Some(entry) = self.free_slot(idx) {
                return Ok(Released::Freed(entry.value));
            }
        }
        Ok(Released::StillCached)
    }

    pub fn release_handle(&mut self, handle: SlotHandle) -> Result<Released<V>> {
        let slot = self.slots.get(handle.index as usize);
        let valid = slot.is_some_and(|s| s.generation == handle.generation && s.entry.is_some());
        if !valid {
            return Err(BtreeError::corruption(
                "cache handle",
                format!(
                    "stale handle for slot {} generation {}",
                    handle.index, handle.generation
                ),
            )
            .into());
        }
        self.release_slot(handle.index)
    }

    pub fn release_key(&mut self, hash: u64, key: &K) -> Result<Released<V>> {
        match self.lookup(hash, key) {
            Some(idx) => self.release_slot(idx),
            None => Err(BtreeError::corruption("cache refcount", "release of an uncached key").into()),
        }
    }

    /// Removes `key` from lookup. Unpinned entries are freed and their value
    /// returned; pinned ones are freed by their last release.
    pub fn delete(&mut self, hash: u64, key: &K) -> Option<Released<V>> {
        let idx = self.lookup(hash, key)?;
        self.unlink_bucket(idx);
        self.unlink_lru(idx);
        let e = self.entry_mut(idx);
        e.deleted = true;
        if e.refcount > 0 {
            return Some(Released::StillCached);
        }
        self.free_slot(idx).map(|e| Released::Freed(e.value))
    }

    /// Runs the clock until one unpinned, unreferenced entry is evicted.
    /// Returns false when every entry is pinned.
    pub fn evict_one<H: EvictionHandler<K, V> + ?Sized>(
        &mut self,
        handler: &H,
        budget: Option<&MemoryBudget>,
        weight: usize,
    ) -> Result<bool> {
        let limit = 2 * self.lru_len + 1;
        let mut cur = self.hand.or(self.lru_tail);
        let mut steps = 0;

        while let Some(idx) = cur {
            if steps >= limit {
                break;
            }
            steps += 1;

            let wrap = self.lru_tail;
            let e = self.entry_mut(idx);
            let next = e.lru_prev.or(wrap);
            if e.refcount > 0 || e.referenced {
                e.referenced = false;
                cur = next;
                continue;
            }

            handler.on_evict(&e.key, &e.value, e.dirty)?;
            tracing::trace!(slot = idx, dirty = e.dirty, "evicting cache entry");

            self.unlink_bucket(idx);
            self.unlink_lru(idx);
            self.hand = if next == Some(idx) { None } else { next };
            self.free_slot(idx);
            self.stats.evictions += 1;
            if let Some(budget) = budget {
                budget.release(weight);
            }
            return Ok(true);
        }

        self.hand = cur;
        Ok(false)
    }

    /// Makes room for one new entry: evicts past `max_entries` and charges
    /// the budget. Grows past `max_entries` when everything is pinned, up to
    /// the pin limit (`NoNodeRefs`); fails otherwise only when a budget
    /// refuses the allocation and nothing can be evicted.
    pub fn reserve<H: EvictionHandler<K, V> + ?Sized>(
        &mut self,
        handler: &H,
        budget: Option<&MemoryBudget>,
        weight: usize,
    ) -> Result<()> {
        if self.occupied >= self.max_entries && !self.evict_one(handler, budget, weight)? {
            if self.pin_limit.is_some_and(|limit| self.occupied >= limit) {
                return Err(BtreeError::NoNodeRefs.into());
            }
            tracing::warn!(
                entries = self.occupied,
                max_entries = self.max_entries,
                "all cache entries pinned, growing shard"
            );
        }

        if let Some(budget) = budget {
            while let Err(e) = budget.allocate(weight) {
                if !self.evict_one(handler, Some(budget), weight)? {
                    let oom = match e.downcast_ref::<crate::memory::MemoryError>() {
                        Some(m) => BtreeError::from(m),
                        None => BtreeError::OutOfMemory {
                            requested: weight,
                            available: budget.available(),
                        },
                    };
                    return Err(oom.into());
                }
            }
        }
        Ok(())
    }

    pub fn set_max_entries<H: EvictionHandler<K, V> + ?Sized>(
        &mut self,
        max_entries: usize,
        handler: &H,
        budget: Option<&MemoryBudget>,
        weight: usize,
    ) -> Result<usize> {
        self.max_entries = max_entries;
        let mut evicted = 0;
        while self.occupied > self.max_entries && self.evict_one(handler, budget, weight)? {
            evicted += 1;
        }
        Ok(evicted)
    }

    /// Drops every unpinned entry and marks pinned ones deleted.
    pub fn clear<H: EvictionHandler<K, V> + ?Sized>(
        &mut self,
        handler: &H,
        budget: Option<&MemoryBudget>,
        weight: usize,
    ) -> Result<usize> {
        let mut dropped = 0;
        while let Some(idx) = self.lru_tail {
            let e = self.entry(idx);
            if e.refcount == 0 {
                handler.on_evict(&e.key, &e.value, e.dirty)?;
            }
            self.unlink_bucket(idx);
            self.unlink_lru(idx);
            let e = self.entry_mut(idx);
            e.deleted = true;
            if e.refcount == 0 {
                self.free_slot(idx);
                if let Some(budget) = budget {
                    budget.release(weight);
                }
                dropped += 1;
            }
        }
        self.hand = None;
        Ok(dropped)
    }

    /// Keys of every live entry whose dirty bit is set.
    pub fn dirty_keys(&self) -> Vec<K> {
        self.slots
            .iter()
            .filter_map(|s| s.entry.as_ref())
            .filter(|e| e.dirty && !e.deleted)
            .map(|e| e.key.clone())
            .collect()
    }
}

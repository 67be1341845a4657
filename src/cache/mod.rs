//! # Partitioned Node Cache
//!
//! In-memory copies of tree nodes, pinned while an operation uses them and
//! evicted with a CLOCK hand when a partition outgrows its entry limit.
//!
//! ## Why CLOCK over strict LRU?
//!
//! A range scan touches every leaf once. Under strict recency ordering each
//! of those leaves would push out interior nodes that every descent needs.
//! CLOCK keeps a use bit instead:
//!
//! - On access: set the use bit
//! - On eviction: walk the hand over the LRU list
//!   - pinned or use bit set: clear the bit, move on (second chance)
//!   - otherwise: call the eviction handler, then free the entry
//!
//! ## Partitioning
//!
//! ```text
//! NodeCache
//! ├── Partition 0:  Mutex<CacheShard>
//! ├── Partition 1:  Mutex<CacheShard>
//! ├── ...
//! └── Partition N-1
//! ```
//!
//! A key is hashed once. The low bits pick the partition and the high bits
//! pick the bucket inside it, so every operation takes exactly one partition
//! lock.
//!
//! ## Pin Protocol
//!
//! 1. `get`/`create`/`update`/`set` return a [`CacheRef`] holding one pin
//! 2. The caller reads the value through the guard
//! 3. Dropping the guard releases the pin
//! 4. Entries with pins are never evicted; a deleted entry is freed by the
//!    release that drops its last pin, which calls [`EvictionHandler::on_free`]
//!
//! `increment_refcount`/`release` expose the same counting for callers that
//! manage pins by key.
//!
//! ## Memory Budget
//!
//! With a [`MemoryBudget`] every resident entry is charged `entry_weight`
//! bytes. When the budget refuses a charge the partition evicts and retries;
//! if every entry is pinned the insert fails with `OutOfMemory`.

mod shard;

use std::hash::{BuildHasher, Hash};
use std::ops::Deref;
use std::sync::Arc;

use eyre::Result;
use hashbrown::DefaultHashBuilder;
use parking_lot::Mutex;

use crate::memory::MemoryBudget;

pub use shard::{Released, ShardStats, SlotHandle};
use shard::CacheShard;

/// Identity of a cached node: owning container, logical id and whether the
/// payload is raw bytes (overflow) or a cooked tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub cguid: u64,
    pub id: u64,
    pub raw: bool,
}

impl NodeKey {
    pub fn new(cguid: u64, id: u64, raw: bool) -> Self {
        Self { cguid, id, raw }
    }
}

/// Callbacks run under the partition lock.
pub trait EvictionHandler<K, V>: Send + Sync {
    /// Called before an unpinned entry leaves the cache. An error keeps it.
    fn on_evict(&self, key: &K, value: &V, dirty: bool) -> Result<()>;

    /// Called when a deleted entry is physically freed.
    fn on_free(&self, key: &K, value: &V) {
        let _ = (key, value);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl<K, V> EvictionHandler<K, V> for NoopHandler {
    fn on_evict(&self, _key: &K, _value: &V, _dirty: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub pinned: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub creates: u64,
    pub frees: u64,
}

pub struct NodeCache<K, V, H = NoopHandler> {
    partitions: Box<[Mutex<CacheShard<K, V>>]>,
    hasher: DefaultHashBuilder,
    handler: H,
    budget: Option<Arc<MemoryBudget>>,
    entry_weight: usize,
}

impl<K, V, H> NodeCache<K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: EvictionHandler<K, V>,
{
    pub fn new(max_entries: usize, partitions: usize, handler: H) -> Result<Self> {
        Self::with_budget(max_entries, partitions, handler, None, 0)
    }

    pub fn with_budget(
        max_entries: usize,
        partitions: usize,
        handler: H,
        budget: Option<Arc<MemoryBudget>>,
        entry_weight: usize,
    ) -> Result<Self> {
        eyre::ensure!(partitions > 0, "node cache needs at least one partition");
        eyre::ensure!(
            max_entries >= partitions,
            "cache capacity {} must be at least {} (one per partition)",
            max_entries,
            partitions
        );

        let per_partition = max_entries / partitions;
        let remainder = max_entries % partitions;
        let partitions = (0..partitions)
            .map(|i| {
                let cap = if i < remainder {
                    per_partition + 1
                } else {
                    per_partition
                };
                Mutex::new(CacheShard::new(cap, cap.next_power_of_two()))
            })
            .collect();

        Ok(Self {
            partitions,
            hasher: DefaultHashBuilder::default(),
            handler,
            budget,
            entry_weight,
        })
    }

    fn locate(&self, key: &K) -> (u64, &Mutex<CacheShard<K, V>>) {
        let hash = self.hasher.hash_one(key);
        let partition = (hash as usize) % self.partitions.len();
        (hash, &self.partitions[partition])
    }

    fn guard(&self, key: K, hash: u64, handle: SlotHandle, value: V) -> CacheRef<'_, K, V, H> {
        CacheRef {
            cache: self,
            key,
            hash,
            handle,
            value,
        }
    }

    fn after_release(&self, key: &K, released: Released<V>) {
        if let Released::Freed(value) = released {
            if let Some(budget) = &self.budget {
                budget.release(self.entry_weight);
            }
            self.handler.on_free(key, &value);
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn budget(&self) -> Option<&Arc<MemoryBudget>> {
        self.budget.as_ref()
    }

    /// Pins and returns an existing entry.
    pub fn get(&self, key: &K) -> Option<CacheRef<'_, K, V, H>> {
        let (hash, partition) = self.locate(key);
        let (handle, value) = partition.lock().get(hash, key)?;
        Some(self.guard(key.clone(), hash, handle, value))
    }

    /// Inserts a new pinned entry, or `None` when `key` is already cached.
    pub fn create(&self, key: K, value: V) -> Result<Option<CacheRef<'_, K, V, H>>> {
        let (hash, partition) = self.locate(&key);
        let mut shard = partition.lock();
        if shard.contains(hash, &key) {
            return Ok(None);
        }
        shard.reserve(&self.handler, self.budget.as_deref(), self.entry_weight)?;
        let handle = shard.insert_pinned(hash, key.clone(), value.clone());
        drop(shard);
        Ok(Some(self.guard(key, hash, handle, value)))
    }

    /// Replaces the value of a cached entry, or `None` when absent.
    pub fn update(&self, key: &K, value: V) -> Option<CacheRef<'_, K, V, H>> {
        let (hash, partition) = self.locate(key);
        let (handle, _previous) = partition.lock().replace(hash, key, value.clone())?;
        Some(self.guard(key.clone(), hash, handle, value))
    }

    /// Inserts or replaces, returning the previous value if there was one.
    pub fn set(&self, key: K, value: V) -> Result<(CacheRef<'_, K, V, H>, Option<V>)> {
        let (hash, partition) = self.locate(&key);
        let mut shard = partition.lock();
        if let Some((handle, previous)) = shard.replace(hash, &key, value.clone()) {
            drop(shard);
            return Ok((self.guard(key, hash, handle, value), Some(previous)));
        }
        shard.reserve(&self.handler, self.budget.as_deref(), self.entry_weight)?;
        let handle = shard.insert_pinned(hash, key.clone(), value.clone());
        drop(shard);
        Ok((self.guard(key, hash, handle, value), None))
    }

    pub fn increment_refcount(&self, key: &K) -> bool {
        let (hash, partition) = self.locate(key);
        partition.lock().increment_refcount(hash, key)
    }

    /// Drops one pin taken with `increment_refcount`.
    pub fn release(&self, key: &K) -> Result<()> {
        let (hash, partition) = self.locate(key);
        let released = partition.lock().release_key(hash, key)?;
        self.after_release(key, released);
        Ok(())
    }

    fn release_handle(&self, key: &K, hash: u64, handle: SlotHandle) -> Result<()> {
        let partition = &self.partitions[(hash as usize) % self.partitions.len()];
        let released = partition.lock().release_handle(handle)?;
        self.after_release(key, released);
        Ok(())
    }

    /// Removes `key` from lookup; returns false when it was not cached.
    pub fn delete(&self, key: &K) -> bool {
        let (hash, partition) = self.locate(key);
        let deleted = partition.lock().delete(hash, key);
        match deleted {
            Some(released) => {
                self.after_release(key, released);
                true
            }
            None => false,
        }
    }

    pub fn mark_dirty(&self, key: &K) -> bool {
        let (hash, partition) = self.locate(key);
        partition.lock().set_dirty(hash, key, true)
    }

    pub fn clear_dirty(&self, key: &K) -> bool {
        let (hash, partition) = self.locate(key);
        partition.lock().set_dirty(hash, key, false)
    }

    pub fn dirty_keys(&self) -> Vec<K> {
        self.partitions
            .iter()
            .flat_map(|p| p.lock().dirty_keys())
            .collect()
    }

    pub fn refcount(&self, key: &K) -> Option<u32> {
        let (hash, partition) = self.locate(key);
        partition.lock().refcount(hash, key)
    }

    pub fn contains(&self, key: &K) -> bool {
        let (hash, partition) = self.locate(key);
        partition.lock().contains(hash, key)
    }

    /// Changes the total entry limit, evicting down to it where possible.
    /// Caps the entries a partition may hold while all of them are pinned.
    /// Past the cap, inserts fail with `NoNodeRefs` instead of growing.
    pub fn set_pin_limit(&self, total: Option<usize>) {
        let n = self.partitions.len();
        let per_partition = total.map(|t| t.div_ceil(n).max(1));
        for partition in self.partitions.iter() {
            partition.lock().set_pin_limit(per_partition);
        }
    }

    pub fn set_max_entries(&self, max_entries: usize) -> Result<usize> {
        eyre::ensure!(
            max_entries >= self.partitions.len(),
            "cache capacity {} must be at least {} (one per partition)",
            max_entries,
            self.partitions.len()
        );
        let per_partition = max_entries / self.partitions.len();
        let remainder = max_entries % self.partitions.len();
        let mut evicted = 0;
        for (i, partition) in self.partitions.iter().enumerate() {
            let cap = if i < remainder {
                per_partition + 1
            } else {
                per_partition
            };
            evicted += partition.lock().set_max_entries(
                cap,
                &self.handler,
                self.budget.as_deref(),
                self.entry_weight,
            )?;
        }
        Ok(evicted)
    }

    /// Drops every unpinned entry. Returns how many were dropped.
    pub fn clear(&self) -> Result<usize> {
        let mut dropped = 0;
        for partition in self.partitions.iter() {
            dropped += partition
                .lock()
                .clear(&self.handler, self.budget.as_deref(), self.entry_weight)?;
        }
        Ok(dropped)
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for partition in self.partitions.iter() {
            let shard = partition.lock();
            let s = shard.stats();
            stats.entries += shard.len();
            stats.pinned += shard.pinned();
            stats.max_entries += shard.max_entries();
            stats.hits += s.hits;
            stats.misses += s.misses;
            stats.evictions += s.evictions;
            stats.creates += s.creates;
            stats.frees += s.frees;
        }
        stats
    }

    pub fn reset_stats(&self) {
        for partition in self.partitions.iter() {
            partition.lock().reset_stats();
        }
    }
}

/// A pinned cache entry. Dropping it releases the pin.
pub struct CacheRef<'c, K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: EvictionHandler<K, V>,
{
    cache: &'c NodeCache<K, V, H>,
    key: K,
    hash: u64,
    handle: SlotHandle,
    value: V,
}

impl<K, V, H> CacheRef<'_, K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: EvictionHandler<K, V>,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn mark_dirty(&self) -> bool {
        self.cache.mark_dirty(&self.key)
    }
}

impl<K, V, H> Deref for CacheRef<'_, K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: EvictionHandler<K, V>,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V, H> Drop for CacheRef<'_, K, V, H>
where
    K: Eq + Hash + Clone,
    V: Clone,
    H: EvictionHandler<K, V>,
{
    fn drop(&mut self) {
        if let Err(e) = self.cache.release_handle(&self.key, self.hash, self.handle) {
            tracing::error!(error = %e, "failed to release cache pin");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHandler {
        evicted_dirty: AtomicUsize,
        evicted_clean: AtomicUsize,
        freed: AtomicUsize,
    }

    impl EvictionHandler<NodeKey, u32> for CountingHandler {
        fn on_evict(&self, _key: &NodeKey, _value: &u32, dirty: bool) -> Result<()> {
            if dirty {
                self.evicted_dirty.fetch_add(1, Ordering::Relaxed);
            } else {
                self.evicted_clean.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }

        fn on_free(&self, _key: &NodeKey, _value: &u32) {
            self.freed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn key(id: u64) -> NodeKey {
        NodeKey::new(1, id, false)
    }

    #[test]
    fn create_get_and_drop_guard() -> Result<()> {
        let cache = NodeCache::new(16, 4, NoopHandler)?;
        let created = cache.create(key(1), 100u32)?.unwrap();
        assert_eq!(*created, 100);
        assert_eq!(cache.refcount(&key(1)), Some(1));
        drop(created);

        assert!(cache.create(key(1), 5)?.is_none());
        let got = cache.get(&key(1)).unwrap();
        assert_eq!(*got, 100);
        assert_eq!(cache.refcount(&key(1)), Some(1));
        drop(got);
        assert_eq!(cache.refcount(&key(1)), Some(0));
        Ok(())
    }

    #[test]
    fn raw_and_cooked_keys_are_distinct() -> Result<()> {
        let cache = NodeCache::new(16, 2, NoopHandler)?;
        drop(cache.create(NodeKey::new(1, 9, false), 1u32)?);
        drop(cache.create(NodeKey::new(1, 9, true), 2u32)?);
        drop(cache.create(NodeKey::new(2, 9, false), 3u32)?);

        assert_eq!(cache.len(), 3);
        assert_eq!(*cache.get(&NodeKey::new(1, 9, true)).unwrap(), 2);
        Ok(())
    }

    #[test]
    fn update_and_set() -> Result<()> {
        let cache = NodeCache::new(16, 2, NoopHandler)?;
        assert!(cache.update(&key(3), 1u32).is_none());

        let (r, previous) = cache.set(key(3), 1)?;
        assert!(previous.is_none());
        drop(r);
        let (r, previous) = cache.set(key(3), 2)?;
        assert_eq!(previous, Some(1));
        drop(r);

        drop(cache.update(&key(3), 9).unwrap());
        assert_eq!(*cache.get(&key(3)).unwrap(), 9);
        Ok(())
    }

    #[test]
    fn increment_and_release_by_key() -> Result<()> {
        let cache = NodeCache::new(16, 2, NoopHandler)?;
        drop(cache.create(key(4), 1u32)?);

        assert!(cache.increment_refcount(&key(4)));
        assert!(!cache.increment_refcount(&key(5)));
        cache.release(&key(4))?;
        assert_eq!(cache.refcount(&key(4)), Some(0));
        assert!(cache.release(&key(4)).is_err());
        Ok(())
    }

    #[test]
    fn delete_while_pinned_frees_on_drop() -> Result<()> {
        let cache = NodeCache::new(16, 2, CountingHandler::default())?;
        let pinned = cache.create(key(6), 1u32)?.unwrap();

        assert!(cache.delete(&key(6)));
        assert!(cache.get(&key(6)).is_none());
        assert_eq!(cache.handler().freed.load(Ordering::Relaxed), 0);

        drop(pinned);
        assert_eq!(cache.handler().freed.load(Ordering::Relaxed), 1);
        assert!(cache.is_empty());
        Ok(())
    }

    #[test]
    fn eviction_reports_dirty_bit() -> Result<()> {
        let cache = NodeCache::new(2, 1, CountingHandler::default())?;
        drop(cache.create(key(1), 1u32)?);
        assert!(cache.mark_dirty(&key(1)));
        drop(cache.create(key(2), 2u32)?);
        drop(cache.create(key(3), 3u32)?);

        let h = cache.handler();
        assert_eq!(h.evicted_dirty.load(Ordering::Relaxed), 1);
        assert_eq!(h.evicted_clean.load(Ordering::Relaxed), 0);
        assert!(!cache.contains(&key(1)));
        Ok(())
    }

    #[test]
    fn shrinking_limit_evicts() -> Result<()> {
        let cache = NodeCache::new(8, 1, NoopHandler)?;
        for id in 0..8 {
            drop(cache.create(key(id), id as u32)?);
        }
        let evicted = cache.set_max_entries(4)?;

        assert_eq!(evicted, 4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 4);
        Ok(())
    }

    #[test]
    fn budget_is_charged_and_released() -> Result<()> {
        let budget = Arc::new(MemoryBudget::with_limit(4 * 1000));
        let cache = NodeCache::with_budget(64, 4, NoopHandler, Some(Arc::clone(&budget)), 1000)?;

        let pinned: Vec<_> = (0..4)
            .map(|id| cache.create(key(id), 0u32).map(Option::unwrap))
            .collect::<Result<_>>()?;
        assert_eq!(budget.used(), 4000);

        let err = cache.create(key(99), 0).err().unwrap();
        assert_eq!(crate::error::Status::of(&err), crate::error::Status::OutOfMemory);

        drop(pinned);
        assert_eq!(cache.clear()?, 4);
        assert_eq!(budget.used(), 0);
        Ok(())
    }

    #[test]
    fn stats_count_hits_and_misses() -> Result<()> {
        let cache = NodeCache::new(16, 4, NoopHandler)?;
        drop(cache.create(key(1), 1u32)?);
        drop(cache.get(&key(1)));
        drop(cache.get(&key(2)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.max_entries, 16);

        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
        Ok(())
    }
}

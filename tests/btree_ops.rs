//! # B-Tree Operation Tests
//!
//! Point operations through the public API against an in-memory store:
//! round trips, write semantics, growth and shrinkage with `check()` after
//! every phase, overflow values, tombstones, seqno guards, batch puts,
//! reopening a tree from its store and recovery from store faults.
//!
//! ```sh
//! cargo test --test btree_ops
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use flashtree::btree::{AlwaysOverwrite, KeepExisting, MputDecision};
use flashtree::storage::{AtomicSeqno, DeleteFlags};
use flashtree::{
    Btree, BtreeConfig, BtreeError, GetInto, Ioctl, MemStore, MemoryBudget, MetaFlags, Metadata,
    NodeStore, Record, Status,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// HELPERS
// ============================================================================

fn open(store: &Arc<MemStore>) -> Result<Btree> {
    Btree::open(BtreeConfig::builder().store(store.clone()).build()?)
}

fn fresh() -> Result<(Arc<MemStore>, Btree)> {
    let store = Arc::new(MemStore::new());
    let tree = open(&store)?;
    Ok((store, tree))
}

fn key(i: usize) -> Vec<u8> {
    format!("{:08}", i).into_bytes()
}

/// 600 byte values: about a dozen fit in a default leaf.
fn value(i: usize, version: usize) -> Vec<u8> {
    let mut out = format!("value-{:08}-v{}-", i, version).into_bytes();
    out.resize(600, b'a' + (i % 26) as u8);
    out
}

fn get_value(tree: &Btree, k: &[u8]) -> Result<Option<Vec<u8>>> {
    Ok(tree.get(k, &Metadata::default())?.map(|r| r.value))
}

fn status<T: std::fmt::Debug>(result: Result<T>) -> Status {
    match result {
        Ok(v) => panic!("expected an error, got {:?}", v),
        Err(e) => Status::of(&e),
    }
}

// ============================================================================
// ROUND TRIP AND WRITE SEMANTICS
// ============================================================================

mod semantics {
    use super::*;

    #[test]
    fn insert_then_get_returns_value_and_seqno() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();

        tree.insert(b"alpha", b"one", &none)?;
        tree.insert(b"beta", b"two", &none)?;

        let alpha = tree.get(b"alpha", &none)?.expect("alpha present");
        assert_eq!(alpha.value, b"one");
        assert_eq!(alpha.key, b"alpha");
        let beta = tree.get(b"beta", &none)?.expect("beta present");
        assert!(beta.seqno > alpha.seqno);
        assert!(tree.get(b"gamma", &none)?.is_none());
        Ok(())
    }

    #[test]
    fn insert_existing_key_fails_with_key_exists() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        tree.insert(b"k", b"v1", &none)?;

        assert_eq!(status(tree.insert(b"k", b"v2", &none)), Status::KeyExists);
        assert_eq!(get_value(&tree, b"k")?, Some(b"v1".to_vec()));
        Ok(())
    }

    #[test]
    fn update_requires_existing_key() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();

        assert_eq!(status(tree.update(b"k", b"v", &none)), Status::KeyNotFound);
        tree.insert(b"k", b"v1", &none)?;
        tree.update(b"k", b"v2", &none)?;
        assert_eq!(get_value(&tree, b"k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn set_inserts_or_replaces() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();

        tree.set(b"k", b"first", &none)?;
        tree.set(b"k", b"second", &none)?;
        assert_eq!(get_value(&tree, b"k")?, Some(b"second".to_vec()));
        assert_eq!(tree.check()?.entries, 1);
        Ok(())
    }

    #[test]
    fn delete_missing_key_fails_with_key_not_found() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        tree.insert(b"k", b"v", &none)?;

        assert_eq!(status(tree.delete(b"other", &none)), Status::KeyNotFound);
        tree.delete(b"k", &none)?;
        assert!(tree.get(b"k", &none)?.is_none());
        assert_eq!(status(tree.delete(b"k", &none)), Status::KeyNotFound);
        Ok(())
    }

    #[test]
    fn oversized_key_is_rejected() -> Result<()> {
        let (_store, tree) = fresh()?;
        let long = vec![b'x'; tree.layout().max_key_size + 1];

        assert_eq!(status(tree.insert(&long, b"v", &Metadata::default())), Status::ObjectTooBig);
        assert_eq!(status(tree.get(&long, &Metadata::default())), Status::ObjectTooBig);
        Ok(())
    }

    #[test]
    fn empty_key_and_value_round_trip() -> Result<()> {
        let (_store, tree) = fresh()?;
        tree.insert(b"", b"", &Metadata::default())?;
        assert_eq!(get_value(&tree, b"")?, Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn get_into_copies_into_buffer() -> Result<()> {
        let (_store, tree) = fresh()?;
        tree.insert(b"k", b"hello", &Metadata::default())?;

        let provided = Metadata::with_flags(MetaFlags::BUFFER_PROVIDED);
        let mut buf = [0u8; 16];
        match tree.get_into(b"k", &mut buf, &provided)? {
            Some(GetInto::InBuffer { len, .. }) => assert_eq!(&buf[..len], b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        let mut small = [0u8; 2];
        assert_eq!(status(tree.get_into(b"k", &mut small, &provided)), Status::BufferTooSmall);

        let alloc = Metadata::with_flags(MetaFlags::BUFFER_PROVIDED | MetaFlags::ALLOC_IF_TOO_SMALL);
        match tree.get_into(b"k", &mut small, &alloc)? {
            Some(GetInto::Allocated(Record { value, .. })) => assert_eq!(value, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }
}

// ============================================================================
// GROWTH AND SHRINKAGE
// ============================================================================

mod structure {
    use super::*;

    #[test]
    fn hundred_keys_grow_then_shrink_to_fifty() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        assert_eq!(tree.height(), 1);

        let mut last_height = 1;
        let mut grew_at = Vec::new();
        for i in 1..=100 {
            tree.insert(&key(i), &value(i, 0), &none)?;
            let report = tree.check()?;
            assert_eq!(report.height, tree.height());
            assert_eq!(report.entries, i);
            assert!(tree.height() >= last_height, "height never shrinks on insert");
            if tree.height() > last_height {
                grew_at.push(i);
                last_height = tree.height();
            }
            // Height 1 is exactly the single-leaf tree.
            assert_eq!(report.height == 1, report.leaves == 1);
        }
        assert!(!grew_at.is_empty(), "100 entries of 600 bytes must split the root");
        assert!(grew_at[0] > 8, "a default leaf holds more than 8 such entries");
        for i in 1..=100 {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }

        // Interleaved updates and deletes down to 50 keys.
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live: Vec<Option<usize>> = vec![Some(0); 101];
        live[0] = None;
        let mut remaining = 100;
        let mut ops = 0;
        while remaining > 50 {
            let i = rng.gen_range(1..=100);
            match live[i] {
                Some(version) if rng.gen_bool(0.5) => {
                    tree.update(&key(i), &value(i, version + 1), &none)?;
                    live[i] = Some(version + 1);
                }
                Some(_) => {
                    tree.delete(&key(i), &none)?;
                    live[i] = None;
                    remaining -= 1;
                }
                None => {
                    assert_eq!(status(tree.update(&key(i), &value(i, 9), &none)), Status::KeyNotFound);
                }
            }
            ops += 1;
            if ops % 10 == 0 {
                tree.check()?;
            }
        }

        let report = tree.check()?;
        assert_eq!(report.entries, 50);
        for i in 1..=100 {
            let expected = live[i].map(|version| value(i, version));
            assert_eq!(get_value(&tree, &key(i))?, expected, "key {}", i);
        }
        Ok(())
    }

    #[test]
    fn deleting_everything_collapses_to_one_leaf() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        for i in 0..300 {
            tree.insert(&key(i), &value(i, 0), &none)?;
        }
        assert!(tree.height() >= 2);

        for i in (0..300).rev() {
            tree.delete(&key(i), &none)?;
            if i % 25 == 0 {
                tree.check()?;
            }
        }
        let report = tree.check()?;
        assert_eq!(report.height, 1);
        assert_eq!(report.leaves, 1);
        assert_eq!(report.entries, 0);
        assert!(tree.stats().ops.root_collapses > 0);
        Ok(())
    }

    #[test]
    fn deep_tree_with_small_nodes() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let config = BtreeConfig::builder()
            .store(store.clone())
            .node_size(1024)
            .max_key_size(16)
            .min_keys_per_node(2)
            .build()?;
        let tree = Btree::open(config)?;
        let none = Metadata::default();

        for i in 0..2_000 {
            // Scattered insertion order.
            let k = (i * 7919) % 2_000;
            tree.insert(&key(k), format!("v{}", k).as_bytes(), &none)?;
        }
        let report = tree.check()?;
        assert!(report.height >= 3, "height {}", report.height);
        assert_eq!(report.entries, 2_000);

        for k in (0..2_000).step_by(3) {
            tree.delete(&key(k), &none)?;
        }
        let report = tree.check()?;
        assert_eq!(report.entries, 2_000 - 667);
        for k in 0..2_000 {
            let expected = (k % 3 != 0).then(|| format!("v{}", k).into_bytes());
            assert_eq!(get_value(&tree, &key(k))?, expected);
        }
        Ok(())
    }

    #[test]
    fn delete_interior_entry_keeps_separators_valid() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        for i in 0..120 {
            tree.insert(&key(i), &value(i, 0), &none)?;
        }
        let refresh = Metadata::with_flags(MetaFlags::DELETE_INTERIOR_ENTRY);
        for i in (0..120).step_by(2) {
            tree.delete(&key(i), &refresh)?;
        }
        assert_eq!(tree.check()?.entries, 60);
        Ok(())
    }
}

// ============================================================================
// OVERFLOW VALUES
// ============================================================================

mod overflow {
    use super::*;

    #[test]
    fn long_value_lives_in_a_chain() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        let payload = tree.layout().overflow_payload;
        let long: Vec<u8> = (0..payload * 2 + 17).map(|i| (i % 251) as u8).collect();

        tree.insert(b"big", &long, &none)?;
        assert_eq!(get_value(&tree, b"big")?, Some(long.clone()));
        let report = tree.check()?;
        assert_eq!(report.overflow_nodes, 3);
        assert_eq!(tree.stats().ops.overflow_writes, 1);

        tree.update(b"big", b"small now", &none)?;
        assert_eq!(get_value(&tree, b"big")?, Some(b"small now".to_vec()));
        assert_eq!(tree.check()?.overflow_nodes, 0);
        Ok(())
    }

    #[test]
    fn value_just_past_inline_limit_overflows() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        let max_inline = tree.layout().max_inline;

        tree.insert(b"inline", &vec![1u8; max_inline], &none)?;
        tree.insert(b"chained", &vec![2u8; max_inline + 1], &none)?;
        let report = tree.check()?;
        assert_eq!(report.overflow_nodes, 1);
        assert_eq!(get_value(&tree, b"chained")?, Some(vec![2u8; max_inline + 1]));
        Ok(())
    }

    #[test]
    fn deleting_chained_value_frees_its_nodes() -> Result<()> {
        let (store, tree) = fresh()?;
        let none = Metadata::default();
        let before = store.node_count();

        tree.insert(b"big", &vec![7u8; 50_000], &none)?;
        assert!(store.node_count() > before);
        tree.delete(b"big", &none)?;
        assert_eq!(store.node_count(), before);
        assert_eq!(tree.check()?.overflow_nodes, 0);
        Ok(())
    }
}

// ============================================================================
// TOMBSTONES AND SEQNOS
// ============================================================================

mod versions {
    use super::*;

    #[test]
    fn tombstone_hides_entry_until_reinserted() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        tree.insert(b"k", b"v1", &none)?;

        tree.delete(b"k", &Metadata::with_flags(MetaFlags::INSERT_TOMBSTONE))?;
        assert!(tree.get(b"k", &none)?.is_none());
        let report = tree.check()?;
        assert_eq!((report.entries, report.tombstones), (0, 1));

        assert_eq!(status(tree.update(b"k", b"v2", &none)), Status::KeyNotFound);
        assert_eq!(status(tree.delete(b"k", &none)), Status::KeyNotFound);

        tree.insert(b"k", b"v3", &none)?;
        assert_eq!(get_value(&tree, b"k")?, Some(b"v3".to_vec()));
        assert_eq!(tree.check()?.tombstones, 0);
        Ok(())
    }

    #[test]
    fn force_delete_removes_tombstone() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        tree.insert(b"k", b"v", &none)?;
        tree.delete(b"k", &Metadata::with_flags(MetaFlags::INSERT_TOMBSTONE))?;

        tree.delete(b"k", &Metadata::with_flags(MetaFlags::FORCE_DELETE))?;
        let report = tree.check()?;
        assert_eq!((report.entries, report.tombstones), (0, 0));
        Ok(())
    }

    #[test]
    fn caller_seqno_is_stored_and_guards_writes() -> Result<()> {
        let (_store, tree) = fresh()?;
        let pinned = Metadata::with_flags(MetaFlags::UPDATE_USE_SEQNO).seqno(500);
        tree.insert(b"k", b"v1", &pinned)?;
        assert_eq!(tree.get(b"k", &Metadata::default())?.map(|r| r.seqno), Some(500));

        let stale = Metadata::with_flags(MetaFlags::OLD_SEQNO_MUST_MATCH).seqno(499);
        assert_eq!(status(tree.update(b"k", b"v2", &stale)), Status::StaleSeqno);
        assert_eq!(status(tree.delete(b"k", &stale)), Status::StaleSeqno);
        assert_eq!(get_value(&tree, b"k")?, Some(b"v1".to_vec()));

        let current = Metadata::with_flags(MetaFlags::OLD_SEQNO_MUST_MATCH).seqno(500);
        tree.update(b"k", b"v2", &current)?;
        assert_eq!(get_value(&tree, b"k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn read_filters_select_by_seqno() -> Result<()> {
        let (_store, tree) = fresh()?;
        tree.insert(b"k", b"v", &Metadata::with_flags(MetaFlags::UPDATE_USE_SEQNO).seqno(40))?;

        let eq = |s| Metadata::with_flags(MetaFlags::READ_SEQNO_EQ).seqno(s);
        let le = |s| Metadata::with_flags(MetaFlags::READ_SEQNO_LE).seqno(s);
        let window = |a, b| Metadata::with_flags(MetaFlags::READ_SEQNO_GT_LE).seqno_window(a, b);

        assert!(tree.get(b"k", &eq(40))?.is_some());
        assert!(tree.get(b"k", &eq(41))?.is_none());
        assert!(tree.get(b"k", &le(40))?.is_some());
        assert!(tree.get(b"k", &le(39))?.is_none());
        assert!(tree.get(b"k", &window(39, 40))?.is_some());
        assert!(tree.get(b"k", &window(40, 50))?.is_none());
        Ok(())
    }
}

// ============================================================================
// BATCH PUT
// ============================================================================

mod mput {
    use super::*;

    #[test]
    fn unsorted_batch_lands_sorted_and_last_duplicate_wins() -> Result<()> {
        let (_store, tree) = fresh()?;
        let keys: Vec<Vec<u8>> = (0..1_000).rev().map(key).collect();
        let values: Vec<Vec<u8>> = (0..1_000).rev().map(|i| value(i, 0)).collect();
        let mut batch: Vec<(&[u8], &[u8])> = keys
            .iter()
            .zip(&values)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();
        let dup_key = key(10);
        batch.push((&dup_key, b"latest"));

        let written = tree.mput(&batch, &Metadata::default(), &AlwaysOverwrite)?;
        assert_eq!(written, 1_000);
        let report = tree.check()?;
        assert_eq!(report.entries, 1_000);
        assert_eq!(get_value(&tree, &key(10))?, Some(b"latest".to_vec()));
        assert_eq!(get_value(&tree, &key(999))?, Some(value(999, 0)));
        assert_eq!(tree.stats().ops.mput_objects, 1_000);
        Ok(())
    }

    #[test]
    fn resolver_decides_for_existing_keys() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        tree.insert(b"a", b"old-a", &none)?;
        tree.insert(b"b", b"old-b", &none)?;

        let batch: [(&[u8], &[u8]); 3] = [(b"a", b"new-a"), (b"b", b"new-b"), (b"c", b"new-c")];
        assert_eq!(tree.mput(&batch, &none, &KeepExisting)?, 1);
        assert_eq!(get_value(&tree, b"a")?, Some(b"old-a".to_vec()));
        assert_eq!(get_value(&tree, b"c")?, Some(b"new-c".to_vec()));

        let only_a = |k: &[u8], _old: &Record, _new: &[u8]| {
            if k == b"a" {
                MputDecision::Overwrite
            } else {
                MputDecision::Skip
            }
        };
        assert_eq!(tree.mput(&batch, &none, &only_a)?, 1);
        assert_eq!(get_value(&tree, b"a")?, Some(b"new-a".to_vec()));
        assert_eq!(get_value(&tree, b"b")?, Some(b"old-b".to_vec()));
        Ok(())
    }

    #[test]
    fn oversized_member_rejects_whole_batch() -> Result<()> {
        let (_store, tree) = fresh()?;
        let long = vec![b'k'; 500];
        let batch: [(&[u8], &[u8]); 2] = [(b"fine", b"v"), (&long, b"v")];

        assert_eq!(
            status(tree.mput(&batch, &Metadata::default(), &AlwaysOverwrite)),
            Status::ObjectTooBig
        );
        assert!(tree.get(b"fine", &Metadata::default())?.is_none());
        Ok(())
    }

    #[test]
    fn every_object_draws_one_seqno() -> Result<()> {
        let seqno = Arc::new(AtomicSeqno::default());
        let tree = Btree::open(BtreeConfig::builder().seqno(seqno.clone()).build()?)?;
        let keys: Vec<Vec<u8>> = (0..200).map(key).collect();
        let values: Vec<Vec<u8>> = (0..200).map(|i| vec![b'v'; 300 + i % 7]).collect();
        let batch: Vec<(&[u8], &[u8])> = keys
            .iter()
            .zip(&values)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
            .collect();

        assert_eq!(tree.mput(&batch, &Metadata::default(), &AlwaysOverwrite)?, 200);
        assert!(tree.stats().ops.splits > 0);
        assert_eq!(seqno.peek(), 201);

        let mut seen = Vec::new();
        for k in &keys {
            seen.push(tree.get(k, &Metadata::default())?.expect("present").seqno);
        }
        seen.sort_unstable();
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
        Ok(())
    }
}

// ============================================================================
// PERSISTENCE, STATS AND CONTROL
// ============================================================================

mod lifecycle {
    use super::*;

    #[test]
    fn reopen_reads_committed_tree_from_store() -> Result<()> {
        let store = Arc::new(MemStore::new());
        {
            let tree = open(&store)?;
            for i in 0..400 {
                tree.insert(&key(i), &value(i, 0), &Metadata::default())?;
            }
            tree.insert(b"big", &vec![3u8; 30_000], &Metadata::default())?;
        }

        let tree = open(&store)?;
        let report = tree.check()?;
        assert_eq!(report.entries, 401);
        assert!(report.height >= 2);
        for i in (0..400).step_by(37) {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }
        assert_eq!(get_value(&tree, b"big")?, Some(vec![3u8; 30_000]));
        Ok(())
    }

    #[test]
    fn reopen_with_other_geometry_fails() -> Result<()> {
        let store = Arc::new(MemStore::new());
        open(&store)?;
        let other = BtreeConfig::builder().store(store.clone()).node_size(4096).build()?;
        assert!(Btree::open(other).is_err());
        Ok(())
    }

    #[test]
    fn damaged_node_reports_corruption() -> Result<()> {
        let store = Arc::new(MemStore::new());
        open(&store)?.insert(b"k", b"v", &Metadata::default())?;
        assert!(store.tamper(1, |image| image[100] ^= 0xff));

        let tree = open(&store)?;
        assert_eq!(status(tree.get(b"k", &Metadata::default())), Status::Corruption);
        Ok(())
    }

    #[test]
    fn flush_reaches_the_store() -> Result<()> {
        let (store, tree) = fresh()?;
        tree.insert(b"k", b"v", &Metadata::default())?;

        tree.flush(b"k")?;
        assert_eq!(store.stats().flushes, 1);
        assert_eq!(status(tree.flush(b"missing")), Status::KeyNotFound);

        tree.ioctl(Ioctl::FlushAll)?;
        assert!(store.stats().flushes >= 3);
        Ok(())
    }

    #[test]
    fn stats_count_operations_and_reset() -> Result<()> {
        let (_store, tree) = fresh()?;
        let none = Metadata::default();
        for i in 0..50 {
            tree.insert(&key(i), &value(i, 0), &none)?;
        }
        tree.get(&key(1), &none)?;
        tree.delete(&key(2), &none)?;

        let stats = tree.stats();
        assert_eq!(stats.ops.inserts, 50);
        assert_eq!(stats.ops.gets, 1);
        assert_eq!(stats.ops.deletes, 1);
        assert!(stats.ops.splits > 0);
        assert!(stats.ops.root_grows > 0);
        assert_eq!(stats.height, tree.height());

        tree.ioctl(Ioctl::ResetStats)?;
        let stats = tree.stats();
        assert_eq!(stats.ops.inserts, 0);
        assert_eq!(stats.cache.hits, 0);
        Ok(())
    }

    #[test]
    fn small_cache_evicts_and_reloads() -> Result<()> {
        let store = Arc::new(MemStore::new());
        let config = BtreeConfig::builder()
            .store(store.clone())
            .cache_entries(16)
            .cache_partitions(2)
            .build()?;
        let tree = Btree::open(config)?;
        let none = Metadata::default();
        for i in 0..500 {
            tree.insert(&key(i), &value(i, 0), &none)?;
        }
        assert!(tree.stats().cache.evictions > 0);
        for i in (0..500).step_by(11) {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }
        tree.check()?;

        tree.ioctl(Ioctl::SetCacheLimit(64))?;
        assert_eq!(tree.stats().cache.max_entries, 64);
        Ok(())
    }
}

// ============================================================================
// STORE FAULTS AND RESOURCE LIMITS
// ============================================================================

mod failures {
    use super::*;

    /// Wraps a `MemStore` and fails whichever calls are switched on.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemStore,
        fail_writes: AtomicBool,
        fail_deletes: AtomicBool,
        fail_reads: AtomicBool,
    }

    impl FaultyStore {
        fn set(flag: &AtomicBool, on: bool) {
            flag.store(on, Ordering::Release);
        }
    }

    impl NodeStore for FaultyStore {
        fn read_node(&self, id: u64) -> Result<Option<Box<[u8]>>> {
            if self.fail_reads.load(Ordering::Acquire) {
                bail!("media error reading node {}", id);
            }
            self.inner.read_node(id)
        }

        fn write_nodes(&self, nodes: &[(u64, &[u8])]) -> Result<()> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(BtreeError::OutOfStorage.into());
            }
            self.inner.write_nodes(nodes)
        }

        fn flush_node(&self, id: u64) -> Result<()> {
            self.inner.flush_node(id)
        }

        fn delete_node(&self, id: u64, flags: DeleteFlags) -> Result<()> {
            if self.fail_deletes.load(Ordering::Acquire) {
                bail!("device busy");
            }
            self.inner.delete_node(id, flags)
        }
    }

    fn faulty(store: &Arc<FaultyStore>, cache_entries: usize) -> Result<Btree> {
        Btree::open(
            BtreeConfig::builder()
                .store(store.clone())
                .cache_entries(cache_entries)
                .cache_partitions(1)
                .build()?,
        )
    }

    fn fill(tree: &Btree, n: usize) -> Result<()> {
        for i in 0..n {
            tree.insert(&key(i), &value(i, 0), &Metadata::default())?;
        }
        Ok(())
    }

    #[test]
    fn full_store_reports_out_of_storage() -> Result<()> {
        let store = Arc::new(MemStore::with_max_nodes(6));
        let tree = open(&store)?;
        let none = Metadata::default();

        let mut inserted = 0;
        let err = loop {
            match tree.insert(&key(inserted), &value(inserted, 0), &none) {
                Ok(()) => inserted += 1,
                Err(e) => break e,
            }
            assert!(inserted < 1_000, "bounded store never filled");
        };
        assert_eq!(Status::of(&err), Status::OutOfStorage);
        assert!(inserted > 0);

        assert_eq!(tree.check()?.entries, inserted);
        assert!(tree.get(&key(inserted), &none)?.is_none());
        for i in 0..inserted {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }
        tree.update(&key(0), &value(0, 1), &none)?;
        assert_eq!(get_value(&tree, &key(0))?, Some(value(0, 1)));
        Ok(())
    }

    #[test]
    fn failed_commit_batch_leaves_tree_intact() -> Result<()> {
        let store = Arc::new(FaultyStore::default());
        let tree = faulty(&store, 1_024)?;
        let none = Metadata::default();
        fill(&tree, 100)?;

        FaultyStore::set(&store.fail_writes, true);
        assert_eq!(status(tree.insert(b"new", b"v", &none)), Status::OutOfStorage);
        assert_eq!(status(tree.update(&key(5), &value(5, 1), &none)), Status::OutOfStorage);
        assert_eq!(status(fill_from(&tree, 100, 200)), Status::OutOfStorage);
        assert_eq!(
            status(tree.insert(b"big", &vec![1u8; 30_000], &none)),
            Status::OutOfStorage
        );
        assert!(tree.stats().ops.aborts > 0);

        FaultyStore::set(&store.fail_writes, false);
        assert_eq!(tree.check()?.entries, 100);
        assert!(tree.get(b"new", &none)?.is_none());
        assert!(tree.get(b"big", &none)?.is_none());
        assert_eq!(get_value(&tree, &key(5))?, Some(value(5, 0)));

        fill_from(&tree, 100, 300)?;
        assert_eq!(tree.check()?.entries, 300);

        drop(tree);
        let reopened = faulty(&store, 1_024)?;
        assert_eq!(reopened.check()?.entries, 300);
        Ok(())
    }

    fn fill_from(tree: &Btree, from: usize, to: usize) -> Result<()> {
        for i in from..to {
            tree.insert(&key(i), &value(i, 0), &Metadata::default())?;
        }
        Ok(())
    }

    #[test]
    fn failed_node_delete_after_commit_leaks_but_succeeds() -> Result<()> {
        let store = Arc::new(FaultyStore::default());
        let tree = faulty(&store, 1_024)?;
        let none = Metadata::default();
        fill(&tree, 300)?;
        let leaves = tree.check()?.leaves;

        FaultyStore::set(&store.fail_deletes, true);
        for i in 0..250 {
            tree.delete(&key(i), &none)?;
        }
        assert!(tree.stats().ops.leaked_nodes > 0);
        assert!(tree.check()?.leaves < leaves);

        FaultyStore::set(&store.fail_deletes, false);
        let report = tree.check()?;
        assert_eq!(report.entries, 50);
        for i in 250..300 {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }
        tree.insert(&key(0), &value(0, 2), &none)?;

        drop(tree);
        let reopened = faulty(&store, 1_024)?;
        assert_eq!(reopened.check()?.entries, 51);
        assert_eq!(get_value(&reopened, &key(0))?, Some(value(0, 2)));
        Ok(())
    }

    #[test]
    fn failed_node_read_reports_io_then_recovers() -> Result<()> {
        let store = Arc::new(FaultyStore::default());
        let tree = faulty(&store, 4)?;
        let none = Metadata::default();
        fill(&tree, 300)?;
        assert!(tree.stats().cache.evictions > 0);

        FaultyStore::set(&store.fail_reads, true);
        assert_eq!(status(tree.check()), Status::Io);
        let statuses: Vec<Status> = (0..300)
            .step_by(29)
            .map(|i| match tree.get(&key(i), &none) {
                Ok(_) => Status::Success,
                Err(e) => Status::of(&e),
            })
            .collect();
        assert!(statuses.contains(&Status::Io));
        assert!(statuses.iter().all(|s| matches!(s, Status::Success | Status::Io)));

        FaultyStore::set(&store.fail_reads, false);
        assert_eq!(tree.check()?.entries, 300);
        for i in (0..300).step_by(29) {
            assert_eq!(get_value(&tree, &key(i))?, Some(value(i, 0)));
        }
        tree.insert(b"after", b"v", &none)?;
        Ok(())
    }

    #[test]
    fn exhausted_budget_reports_out_of_memory() -> Result<()> {
        let node_size = 4096;
        let budget = Arc::new(MemoryBudget::with_limit(64 * node_size));
        let tree = Btree::open(
            BtreeConfig::builder()
                .node_size(node_size)
                .memory_budget(Arc::clone(&budget))
                .build()?,
        )?;
        let none = Metadata::default();
        for i in 0..300 {
            tree.insert(&key(i), &[b'x'; 400], &none)?;
        }
        let nodes = tree.check()?.leaves + 1;

        // Too small to hold the root and every leaf pinned by a full check.
        budget.set_limit(4 * node_size);
        assert!(nodes > 4);
        assert_eq!(status(tree.check()), Status::OutOfMemory);
        assert!(budget.used() <= budget.limit());
        assert_eq!(tree.get(&key(7), &none)?.map(|r| r.value), Some(vec![b'x'; 400]));

        budget.set_limit(64 * node_size);
        assert_eq!(tree.check()?.entries, 300);
        tree.update(&key(7), b"fits again", &none)?;
        Ok(())
    }

    #[test]
    fn pin_limit_reports_no_node_refs() -> Result<()> {
        let tree = Btree::open(
            BtreeConfig::builder()
                .cache_entries(4)
                .cache_partitions(1)
                .max_pinned_nodes(6)
                .build()?,
        )?;
        let none = Metadata::default();
        fill(&tree, 200)?;

        assert_eq!(status(tree.check()), Status::NoNodeRefs);
        assert_eq!(get_value(&tree, &key(150))?, Some(value(150, 0)));
        tree.update(&key(150), &value(150, 1), &none)?;
        assert_eq!(get_value(&tree, &key(150))?, Some(value(150, 1)));
        Ok(())
    }
}

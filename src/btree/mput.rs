//! # Batch Put
//!
//! `mput` writes many objects with few descents. The input is sorted by the
//! tree comparator (when a key repeats, its last occurrence wins) and cut into
//! chunks of `MPUT_BATCH_SIZE`, each applied under one tree write lock and
//! committed as one operation:
//!
//! ```text
//! chunk: k0 k1 k2 k3 k4 ...
//!        │  └──┴──┘ same leaf as k0 (below its upper anchor) and fits:
//!        │           applied in place, no descent
//!        └─ full descent with preemptive splits, remembers the landing leaf
//! ```
//!
//! A key at or past the landing leaf's upper anchor, or one that no longer
//! fits in it, starts a new descent. Existing live keys are offered to the
//! [`MputResolver`], which overwrites or skips them.

use std::cmp::Ordering;

use eyre::Result;

use super::context::OpContext;
use super::metadata::{MputResolver, Metadata};
use super::stats::Counters;
use super::tree::{apply_at_leaf, write_entry, Btree, LeafOutcome, WriteMode, WriteRequest};
use crate::config::MPUT_BATCH_SIZE;

impl Btree {
    /// Writes every `(key, value)` of `batch`. Returns how many objects were
    /// written; keys the resolver skipped are not counted.
    pub fn mput(
        &self,
        batch: &[(&[u8], &[u8])],
        meta: &Metadata,
        resolver: &dyn MputResolver,
    ) -> Result<usize> {
        let inner = self.inner();
        for (key, value) in batch {
            inner.check_key(key)?;
            inner.check_value(value)?;
        }

        let cmp = inner.cmp();
        let mut order: Vec<usize> = (0..batch.len()).collect();
        order.sort_by(|&a, &b| cmp.compare(batch[a].0, batch[b].0).then(b.cmp(&a)));
        order.dedup_by(|later, earlier| cmp.compare(batch[*later].0, batch[*earlier].0).is_eq());

        let mut written = 0;
        for chunk in order.chunks(MPUT_BATCH_SIZE) {
            written += self.write_op(|ctx| apply_chunk(ctx, batch, chunk, meta, resolver))?;
        }
        Counters::add(&inner.counters.mput_objects, written as u64);
        tracing::trace!(objects = batch.len(), written, "mput");
        Ok(written)
    }
}

fn apply_chunk(
    ctx: &mut OpContext<'_>,
    batch: &[(&[u8], &[u8])],
    chunk: &[usize],
    meta: &Metadata,
    resolver: &dyn MputResolver,
) -> Result<usize> {
    let tree = ctx.tree();
    let request = |i: usize| {
        let (key, value) = batch[chunk[i]];
        WriteRequest {
            key,
            value,
            seqno: tree.seqno_for(meta),
            mode: WriteMode::Mput,
            meta,
            resolver: Some(resolver),
        }
    };

    // A request that ends a same-leaf run is carried into the next descent,
    // so every object draws exactly one seqno.
    let mut written = 0;
    let mut next = 0;
    let mut pending: Option<WriteRequest<'_>> = None;
    loop {
        let req = match pending.take() {
            Some(req) => req,
            None if next < chunk.len() => {
                next += 1;
                request(next - 1)
            }
            None => break,
        };
        let (outcome, landing) = write_entry(ctx, &req)?;
        if outcome == LeafOutcome::Written {
            written += 1;
        }

        while next < chunk.len() {
            let req = request(next);
            next += 1;
            if let Some(upper) = &landing.upper {
                if tree.cmp().compare(req.key, upper) != Ordering::Less {
                    pending = Some(req);
                    break;
                }
            }
            match apply_at_leaf(ctx, &landing.leaf, &req)? {
                LeafOutcome::NoRoom => {
                    pending = Some(req);
                    break;
                }
                LeafOutcome::Written => written += 1,
                LeafOutcome::Skipped => {}
            }
        }
    }
    Ok(written)
}

//! # Overflow Chains
//!
//! Values longer than the layout's `max_inline` live outside the leaf in a
//! singly linked chain of `OVERFLOW` nodes. The leaf entry keeps only the
//! head id and the value length.
//!
//! ```text
//! leaf entry ──> [hdr | ...free... | bytes 0..P  ] ──next──> [hdr | ... | bytes P..len]
//!                      insert_ptr ^                               insert_ptr ^
//! ```
//!
//! Each node stores its slice of the value at the top of the node, in
//! `[insert_ptr, node_size)`, so the slice length is `node_size - insert_ptr`
//! and every node except the last is full. Overflow nodes are cached under
//! raw keys.

use eyre::Result;

use super::context::OpContext;
use super::stats::Counters;
use crate::ensure_node;
use crate::storage::{DeleteFlags, NodeHeader, NodeKind};

/// Writes `value` into a new chain and returns the head node id.
pub(crate) fn write_chain(ctx: &mut OpContext<'_>, value: &[u8]) -> Result<u64> {
    let payload = ctx.layout().overflow_payload;
    let node_size = ctx.layout().node_size;
    ensure_node!(!value.is_empty(), "overflow chain", "empty value needs no chain");

    // Built back to front so every node can point at its successor.
    let mut next = 0u64;
    let chunks: Vec<&[u8]> = value.chunks(payload).collect();
    for chunk in chunks.iter().rev() {
        let node = ctx.create_node(NodeKind::Overflow, 0)?;
        {
            let mut data = node.data.write();
            let start = node_size - chunk.len();
            data[start..].copy_from_slice(chunk);
            let header = NodeHeader::from_bytes_mut(&mut data)?;
            header.set_insert_ptr(start as u16);
            header.set_next(next);
        }
        next = node.id;
    }
    Counters::bump(&ctx.tree().counters.overflow_writes);
    tracing::trace!(head = next, len = value.len(), nodes = chunks.len(), "wrote overflow chain");
    Ok(next)
}

/// Reads a `len` byte value starting at chain node `head`.
pub(crate) fn read_chain(ctx: &mut OpContext<'_>, head: u64, len: usize) -> Result<Vec<u8>> {
    let mut value = Vec::with_capacity(len);
    let mut id = head;
    while id != 0 {
        ensure_node!(
            value.len() < len,
            "overflow chain",
            "chain at {} is longer than {} bytes",
            head,
            len
        );
        let node = ctx.raw_node(id)?;
        let data = node.data.read();
        let header = NodeHeader::from_bytes(&data)?;
        value.extend_from_slice(&data[header.insert_ptr() as usize..]);
        id = header.next();
    }
    ensure_node!(
        value.len() == len,
        "overflow chain",
        "chain at {} holds {} bytes, entry says {}",
        head,
        value.len(),
        len
    );
    Ok(value)
}

/// Frees every node of the chain starting at `head`. Returns the node count.
pub(crate) fn delete_chain(ctx: &mut OpContext<'_>, head: u64) -> Result<usize> {
    let mut freed = 0;
    let mut id = head;
    while id != 0 {
        let node = ctx.raw_node(id)?;
        id = NodeHeader::from_bytes(&node.data.read())?.next();
        ctx.delete_node(&node, DeleteFlags::OVERFLOW);
        freed += 1;
    }
    Ok(freed)
}

/// Ids of every node in the chain, head first.
pub(crate) fn chain_ids(ctx: &mut OpContext<'_>, head: u64) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut id = head;
    while id != 0 {
        ensure_node!(
            !ids.contains(&id),
            "overflow chain",
            "chain at {} loops back to {}",
            head,
            id
        );
        ids.push(id);
        let node = ctx.raw_node(id)?;
        id = NodeHeader::from_bytes(&node.data.read())?.next();
    }
    Ok(ids)
}

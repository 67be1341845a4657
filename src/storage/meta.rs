//! # Tree Meta Record
//!
//! Logical node 0 of every tree is a `META` node whose payload starts with
//! a fixed 64-byte record describing the tree:
//!
//! ```text
//! Offset  Size  Field       Description
//! ------  ----  ----------  -------------------------------------------
//! 52      16    magic       "flashtree meta\0\0"
//! 68      4     version     format version (1)
//! 72      4     node_size   node size the tree was created with
//! 76      8     root        logical id of the root node
//! 84      8     next_id     next logical id to hand out (never reused)
//! 92      8     node_count  live tree nodes, overflow nodes included
//! 100     2     height      levels, 1 for a single leaf root
//! 102     2     max_key     max key size the tree was created with
//! 104     12    reserved
//! ```
//!
//! The record is rewritten in the commit batch of any operation that moves
//! the root, changes the height or allocates ids.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::node::{NodeHeader, NodeKind};
use crate::config::{META_NODE_ID, NODE_HEADER_SIZE};

pub const META_MAGIC: &[u8; 16] = b"flashtree meta\x00\x00";
pub const META_VERSION: u32 = 1;
pub const META_RECORD_SIZE: usize = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct MetaRecord {
    magic: [u8; 16],
    version: U32,
    node_size: U32,
    root: U64,
    next_id: U64,
    node_count: U64,
    height: U16,
    max_key: U16,
    reserved: [u8; 12],
}

const _: () = assert!(size_of::<MetaRecord>() == META_RECORD_SIZE);

impl MetaRecord {
    pub fn new(node_size: usize, max_key: usize) -> Self {
        Self {
            magic: *META_MAGIC,
            version: U32::new(META_VERSION),
            node_size: U32::new(node_size as u32),
            root: U64::new(0),
            next_id: U64::new(0),
            node_count: U64::new(0),
            height: U16::new(0),
            max_key: U16::new(max_key as u16),
            reserved: [0u8; 12],
        }
    }

    /// Reads the record out of a verified meta node image.
    pub fn from_node(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE + META_RECORD_SIZE,
            "buffer too small for MetaRecord: {} bytes",
            data.len()
        );
        let kind = NodeHeader::from_bytes(data)?.kind()?;
        crate::ensure_node!(
            kind == NodeKind::Meta,
            "meta node",
            "node {} has kind {:?}",
            META_NODE_ID,
            kind
        );

        let record =
            Self::ref_from_bytes(&data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + META_RECORD_SIZE])
                .map_err(|e| eyre::eyre!("failed to parse MetaRecord: {:?}", e))?;
        crate::ensure_node!(
            &record.magic == META_MAGIC,
            "meta node",
            "invalid magic bytes in meta node"
        );
        crate::ensure_node!(
            record.version.get() == META_VERSION,
            "meta node",
            "unsupported version: {} (expected {})",
            record.version.get(),
            META_VERSION
        );
        Ok(record)
    }

    /// Formats `data` as a meta node carrying this record.
    pub fn write_node(&self, data: &mut [u8], lsn: u64) -> Result<()> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE + META_RECORD_SIZE,
            "buffer too small for MetaRecord: {} bytes",
            data.len()
        );
        let header = NodeHeader::init(data, NodeKind::Meta, 0, META_NODE_ID)?;
        header.set_lsn(lsn);
        header.set_insert_ptr((NODE_HEADER_SIZE + META_RECORD_SIZE) as u16);
        data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + META_RECORD_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn node_size(&self) -> usize {
        self.node_size.get() as usize
    }

    pub fn max_key(&self) -> usize {
        self.max_key.get() as usize
    }

    pub fn height(&self) -> usize {
        self.height.get() as usize
    }

    pub fn set_height(&mut self, height: usize) {
        self.height = U16::new(height as u16);
    }

    crate::zerocopy_accessors! {
        root: u64,
        next_id: u64,
        node_count: u64,
    }
}

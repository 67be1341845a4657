//! # Node Header Layout
//!
//! Every node, whatever its kind, starts with a 52-byte header read in place
//! through `zerocopy`. All multi-byte fields are little-endian and the struct
//! is `Unaligned`, so a header can be viewed at any offset of any buffer.
//!
//! ## Node Header Layout (52 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------------
//! 0       1     flags        NodeFlags (LEAF, OVERFLOW, META, UNKNOWN)
//! 1       1     level        0 for leaves, child level + 1 for interiors
//! 2       2     nkeys        Entries (leaf) or separators (interior)
//! 4       2     insert_ptr   Low boundary of the payload region
//! 6       2     frag_bytes   Reserved, always zero
//! 8       4     checksum     CRC-32 over the node with this field zeroed
//! 12      8     logical_id   Logical node id
//! 20      8     lsn          Bumped on every write of the node
//! 28      8     prev         Left leaf sibling (0 = none)
//! 36      8     next         Right leaf sibling / next overflow node
//! 44      8     rightmost    Interior: child for keys >= last separator
//! ```
//!
//! ## Node Kinds
//!
//! ```text
//! +-------------+---------------------------------------------+
//! | flags       | payload after the header                    |
//! +-------------+---------------------------------------------+
//! | LEAF        | leaf codec: index records up, blobs down    |
//! | (none)      | interior: fixed-size separator records      |
//! | OVERFLOW    | raw value bytes up to insert_ptr            |
//! | META        | tree meta record                            |
//! +-------------+---------------------------------------------+
//! ```
//!
//! A header with the `UNKNOWN` bit set, or with no recognizable kind, is
//! rejected on read.
//!
//! ## Checksum
//!
//! The checksum is computed with the checksum field treated as zero, stored
//! when a node is written and verified when a node is read back from the
//! store. Nodes that live only in the cache are never verified.

use bitflags::bitflags;
use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::NODE_HEADER_SIZE;
use crate::error::BtreeError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Byte offset of the checksum field inside the header.
const CHECKSUM_OFFSET: usize = 8;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u8 {
        const LEAF = 0x01;
        const OVERFLOW = 0x02;
        const META = 0x04;
        const UNKNOWN = 0x80;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Interior,
    Overflow,
    Meta,
}

impl NodeKind {
    pub fn flags(self) -> NodeFlags {
        match self {
            NodeKind::Leaf => NodeFlags::LEAF,
            NodeKind::Interior => NodeFlags::empty(),
            NodeKind::Overflow => NodeFlags::OVERFLOW,
            NodeKind::Meta => NodeFlags::META,
        }
    }

    pub fn from_flags(flags: NodeFlags) -> Result<Self> {
        if flags.contains(NodeFlags::UNKNOWN) {
            return Err(BtreeError::corruption(
                "node kind",
                format!("unknown node flags {:#04x}", flags.bits()),
            )
            .into());
        }
        let kinds = flags & (NodeFlags::LEAF | NodeFlags::OVERFLOW | NodeFlags::META);
        match kinds.bits().count_ones() {
            0 => Ok(NodeKind::Interior),
            1 if kinds == NodeFlags::LEAF => Ok(NodeKind::Leaf),
            1 if kinds == NodeFlags::OVERFLOW => Ok(NodeKind::Overflow),
            1 => Ok(NodeKind::Meta),
            _ => Err(BtreeError::corruption(
                "node kind",
                format!("conflicting node flags {:#04x}", flags.bits()),
            )
            .into()),
        }
    }

    /// Overflow nodes hold uninterpreted bytes and are cached as raw.
    pub fn is_raw(self) -> bool {
        matches!(self, NodeKind::Overflow)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    flags: u8,
    level: u8,
    nkeys: U16,
    insert_ptr: U16,
    frag_bytes: U16,
    checksum: U32,
    logical_id: U64,
    lsn: U64,
    prev: U64,
    next: U64,
    rightmost: U64,
}

const _: () = assert!(size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    /// Resets `data` to an empty node of `kind` owned by `logical_id`.
    pub fn init(data: &mut [u8], kind: NodeKind, level: u8, logical_id: u64) -> Result<&mut Self> {
        let node_size = data.len();
        ensure!(
            node_size <= u16::MAX as usize,
            "node size {} does not fit u16 offsets",
            node_size
        );
        data.fill(0);
        let header = Self::from_bytes_mut(data)?;
        header.flags = kind.flags().bits();
        header.level = level;
        header.set_insert_ptr(node_size as u16);
        header.set_logical_id(logical_id);
        Ok(header)
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_retain(self.flags)
    }

    pub fn set_flags(&mut self, flags: NodeFlags) {
        self.flags = flags.bits();
    }

    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::from_flags(self.flags())
    }

    pub fn is_leaf(&self) -> bool {
        self.flags().contains(NodeFlags::LEAF)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level;
    }

    crate::zerocopy_accessors! {
        nkeys: u16,
        insert_ptr: u16,
        frag_bytes: u16,
        checksum: u32,
        logical_id: u64,
        lsn: u64,
        prev: u64,
        next: u64,
        rightmost: u64,
    }
}

fn compute_checksum(data: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&data[..CHECKSUM_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&data[CHECKSUM_OFFSET + 4..]);
    digest.finalize()
}

/// Stores the node checksum. Called right before a node is handed to the store.
pub fn seal(data: &mut [u8]) -> Result<u32> {
    ensure!(data.len() >= NODE_HEADER_SIZE, "node too small to seal");
    let sum = compute_checksum(data);
    NodeHeader::from_bytes_mut(data)?.set_checksum(sum);
    Ok(sum)
}

/// Verifies a node read back from the store: checksum, identity and kind.
pub fn verify(data: &[u8], expected_id: u64, node_size: usize) -> Result<NodeKind> {
    crate::ensure_node!(
        data.len() == node_size,
        "node size",
        "node {} has {} bytes, expected {}",
        expected_id,
        data.len(),
        node_size
    );
    let header = NodeHeader::from_bytes(data)?;
    let stored = header.checksum();
    let actual = compute_checksum(data);
    crate::ensure_node!(
        stored == actual,
        "checksum",
        "node {} checksum {:#010x} != computed {:#010x}",
        expected_id,
        stored,
        actual
    );
    crate::ensure_node!(
        header.logical_id() == expected_id,
        "logical id",
        "node read for id {} carries id {}",
        expected_id,
        header.logical_id()
    );
    let kind = header.kind()?;
    let insert_ptr = header.insert_ptr() as usize;
    crate::ensure_node!(
        (NODE_HEADER_SIZE..=node_size).contains(&insert_ptr),
        "insert_ptr bounds",
        "node {} insert_ptr {} outside [{}, {}]",
        expected_id,
        insert_ptr,
        NODE_HEADER_SIZE,
        node_size
    );
    Ok(kind)
}

//! # Per-Call Metadata
//!
//! Point operations take a [`Metadata`] selecting seqno and buffer
//! behavior; range queries take a [`RangeMeta`]. Both are plain values the
//! caller builds per call.
//!
//! ## Point Operation Flags
//!
//! | Flag                    | Effect                                              |
//! |-------------------------|-----------------------------------------------------|
//! | `BUFFER_PROVIDED`       | `get_into` copies into the caller's buffer          |
//! | `ALLOC_IF_TOO_SMALL`    | `get_into` allocates instead of `BufferTooSmall`    |
//! | `OLD_SEQNO_MUST_MATCH`  | write/delete only if stored seqno == `seqno`        |
//! | `UPDATE_USE_SEQNO`      | store `seqno` instead of allocating one             |
//! | `READ_SEQNO_EQ`         | get sees the entry only if its seqno == `seqno`     |
//! | `READ_SEQNO_LE`         | ... if its seqno <= `seqno`                         |
//! | `READ_SEQNO_GT_LE`      | ... if `start_seqno` < seqno <= `end_seqno`         |
//! | `INSERT_TOMBSTONE`      | delete leaves a tombstone                           |
//! | `FORCE_DELETE`          | delete removes tombstones and skips seqno checks    |
//! | `DELETE_INTERIOR_ENTRY` | delete refreshes an equal ancestor separator        |
//!
//! ## Range Flags
//!
//! A range names at most one start comparison and one end comparison. The
//! comparisons imply the direction:
//!
//! ```text
//! ascending:   START_GT | START_GE   ...   END_LT | END_LE
//! descending:  START_LT | START_LE   ...   END_GT | END_GE
//! ```
//!
//! `DESCENDING` may be given explicitly; it must agree with the comparisons.

use bitflags::bitflags;
use eyre::Result;

use crate::error::BtreeError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MetaFlags: u32 {
        const BUFFER_PROVIDED = 1 << 0;
        const ALLOC_IF_TOO_SMALL = 1 << 1;
        const OLD_SEQNO_MUST_MATCH = 1 << 2;
        const UPDATE_USE_SEQNO = 1 << 3;
        const READ_SEQNO_EQ = 1 << 4;
        const READ_SEQNO_LE = 1 << 5;
        const READ_SEQNO_GT_LE = 1 << 6;
        const INSERT_TOMBSTONE = 1 << 7;
        const FORCE_DELETE = 1 << 8;
        const DELETE_INTERIOR_ENTRY = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Metadata {
    pub flags: MetaFlags,
    pub seqno: u64,
    pub start_seqno: u64,
    pub end_seqno: u64,
}

impl Metadata {
    pub fn with_flags(flags: MetaFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn seqno(mut self, seqno: u64) -> Self {
        self.seqno = seqno;
        self
    }

    pub fn seqno_window(mut self, start_exclusive: u64, end_inclusive: u64) -> Self {
        self.start_seqno = start_exclusive;
        self.end_seqno = end_inclusive;
        self
    }

    /// Whether an entry with `seqno` is visible to a read under these flags.
    pub(crate) fn admits(&self, seqno: u64) -> bool {
        if self.flags.contains(MetaFlags::READ_SEQNO_EQ) && seqno != self.seqno {
            return false;
        }
        if self.flags.contains(MetaFlags::READ_SEQNO_LE) && seqno > self.seqno {
            return false;
        }
        if self.flags.contains(MetaFlags::READ_SEQNO_GT_LE)
            && !(seqno > self.start_seqno && seqno <= self.end_seqno)
        {
            return false;
        }
        true
    }

    pub(crate) fn check_old_seqno(&self, stored: u64) -> Result<()> {
        if self.flags.contains(MetaFlags::OLD_SEQNO_MUST_MATCH)
            && !self.flags.contains(MetaFlags::FORCE_DELETE)
            && stored != self.seqno
        {
            return Err(BtreeError::StaleSeqno {
                expected: self.seqno,
                found: stored,
            }
            .into());
        }
        Ok(())
    }
}

/// A fully materialized entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub seqno: u64,
}

/// Result of [`Btree::get_into`](crate::btree::Btree::get_into).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetInto {
    /// The value was copied into the caller's buffer.
    InBuffer { len: usize, seqno: u64 },
    /// The buffer was too small and `ALLOC_IF_TOO_SMALL` was set.
    Allocated(Record),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MputDecision {
    Overwrite,
    Skip,
}

/// Decides what mput does with a key that already exists.
pub trait MputResolver: Send + Sync {
    fn resolve(&self, key: &[u8], old: &Record, new_value: &[u8]) -> MputDecision;
}

impl<F> MputResolver for F
where
    F: Fn(&[u8], &Record, &[u8]) -> MputDecision + Send + Sync,
{
    fn resolve(&self, key: &[u8], old: &Record, new_value: &[u8]) -> MputDecision {
        self(key, old, new_value)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOverwrite;

impl MputResolver for AlwaysOverwrite {
    fn resolve(&self, _key: &[u8], _old: &Record, _new_value: &[u8]) -> MputDecision {
        MputDecision::Overwrite
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeepExisting;

impl MputResolver for KeepExisting {
    fn resolve(&self, _key: &[u8], _old: &Record, _new_value: &[u8]) -> MputDecision {
        MputDecision::Skip
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RangeFlags: u32 {
        const START_GT = 1 << 0;
        const START_GE = 1 << 1;
        const START_LT = 1 << 2;
        const START_LE = 1 << 3;
        const END_GT = 1 << 4;
        const END_GE = 1 << 5;
        const END_LT = 1 << 6;
        const END_LE = 1 << 7;
        const DESCENDING = 1 << 8;
        const SEQNO_LE = 1 << 9;
        const SEQNO_GT_LE = 1 << 10;
        const BUFFER_PROVIDED = 1 << 11;
        const ALLOC_IF_TOO_SMALL = 1 << 12;
        const KEYS_ONLY = 1 << 13;
    }
}

impl RangeFlags {
    const START: RangeFlags = RangeFlags::START_GT
        .union(RangeFlags::START_GE)
        .union(RangeFlags::START_LT)
        .union(RangeFlags::START_LE);
    const END: RangeFlags = RangeFlags::END_GT
        .union(RangeFlags::END_GE)
        .union(RangeFlags::END_LT)
        .union(RangeFlags::END_LE);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeMeta {
    pub flags: RangeFlags,
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    /// Upper bound for `SEQNO_LE`.
    pub seqno: u64,
    /// Exclusive lower bound for `SEQNO_GT_LE`.
    pub start_seqno: u64,
    /// Inclusive upper bound for `SEQNO_GT_LE`.
    pub end_seqno: u64,
    pub key_buf_size: usize,
    pub value_buf_size: usize,
}

impl RangeMeta {
    pub fn new(flags: RangeFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub fn start(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.start = Some(key.into());
        self
    }

    pub fn end(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.end = Some(key.into());
        self
    }

    pub fn buffers(mut self, key_buf_size: usize, value_buf_size: usize) -> Self {
        self.flags |= RangeFlags::BUFFER_PROVIDED;
        self.key_buf_size = key_buf_size;
        self.value_buf_size = value_buf_size;
        self
    }

    pub fn seqno_le(mut self, seqno: u64) -> Self {
        self.flags |= RangeFlags::SEQNO_LE;
        self.seqno = seqno;
        self
    }

    pub fn seqno_gt_le(mut self, start_exclusive: u64, end_inclusive: u64) -> Self {
        self.flags |= RangeFlags::SEQNO_GT_LE;
        self.start_seqno = start_exclusive;
        self.end_seqno = end_inclusive;
        self
    }

    /// Checks flag combinations and resolves the scan direction and bound
    /// inclusivity.
    pub(crate) fn resolve(&self) -> Result<RangeBounds> {
        let f = self.flags;
        let invalid = |reason| -> Result<RangeBounds> { Err(BtreeError::InvalidQuery(reason).into()) };

        if (f & RangeFlags::START).bits().count_ones() > 1 {
            return invalid("more than one start comparison");
        }
        if (f & RangeFlags::END).bits().count_ones() > 1 {
            return invalid("more than one end comparison");
        }
        if f.contains(RangeFlags::SEQNO_LE | RangeFlags::SEQNO_GT_LE) {
            return invalid("both seqno filters");
        }
        if f.contains(RangeFlags::SEQNO_GT_LE) && self.start_seqno >= self.end_seqno {
            return invalid("empty seqno window");
        }
        if f.intersects(RangeFlags::START) && self.start.is_none() {
            return invalid("start comparison without a start key");
        }
        if f.intersects(RangeFlags::END) && self.end.is_none() {
            return invalid("end comparison without an end key");
        }

        let asc_hint = f.intersects(
            RangeFlags::START_GT | RangeFlags::START_GE | RangeFlags::END_LT | RangeFlags::END_LE,
        );
        let desc_hint = f.intersects(
            RangeFlags::START_LT | RangeFlags::START_LE | RangeFlags::END_GT | RangeFlags::END_GE,
        );
        if asc_hint && desc_hint {
            return invalid("start and end comparisons disagree on direction");
        }
        if asc_hint && f.contains(RangeFlags::DESCENDING) {
            return invalid("ascending comparisons on a descending query");
        }
        let descending = desc_hint || f.contains(RangeFlags::DESCENDING);

        Ok(RangeBounds {
            descending,
            start_inclusive: !f.intersects(RangeFlags::START_GT | RangeFlags::START_LT),
            end_inclusive: f.intersects(RangeFlags::END_LE | RangeFlags::END_GE),
        })
    }

    pub(crate) fn admits_seqno(&self, seqno: u64) -> bool {
        if self.flags.contains(RangeFlags::SEQNO_LE) {
            seqno <= self.seqno
        } else if self.flags.contains(RangeFlags::SEQNO_GT_LE) {
            seqno > self.start_seqno && seqno <= self.end_seqno
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeBounds {
    pub descending: bool,
    pub start_inclusive: bool,
    pub end_inclusive: bool,
}

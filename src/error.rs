//! # Error Taxonomy
//!
//! Every fallible function returns `eyre::Result<T>`. Conditions a caller may
//! want to branch on are carried inside the report as a typed [`BtreeError`],
//! either as the root error or as context added with `wrap_err`, and are
//! recovered through [`Status::of`]:
//!
//! ```text
//! eyre::Report
//!   ├─ BtreeError::KeyNotFound / KeyExists / StaleSeqno      (expected outcomes)
//!   ├─ BtreeError::ObjectTooBig / BufferTooSmall / InvalidQuery (caller input)
//!   ├─ BtreeError::OutOfMemory / NoNodeRefs / OutOfStorage   (recoverable pressure)
//!   ├─ BtreeError::Corruption { invariant, detail }          (structural)
//!   └─ BtreeError::Io { op, node } wrapping the store error  (I/O pass-through)
//! ```
//!
//! Structural violations are also reported through [`Diagnostics`] before
//! they are returned. Under [`ErrorPolicy::Abort`] an error-level report ends
//! the process instead.
//!
//! ```rust,ignore
//! match tree.insert(b"k", b"v", &Metadata::default()) {
//!     Ok(()) => {}
//!     Err(e) if Status::of(&e) == Status::KeyExists => {}
//!     Err(e) => return Err(e),
//! }
//! ```

use std::fmt;

use crate::memory::MemoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtreeError {
    KeyNotFound,
    KeyExists,
    ObjectTooBig {
        what: &'static str,
        len: usize,
        max: usize,
    },
    OutOfMemory {
        requested: usize,
        available: usize,
    },
    NoNodeRefs,
    OutOfStorage,
    BufferTooSmall {
        needed: usize,
        provided: usize,
    },
    InvalidQuery(&'static str),
    StaleSeqno {
        expected: u64,
        found: u64,
    },
    Corruption {
        invariant: &'static str,
        detail: String,
    },
    Io {
        op: &'static str,
        node: u64,
    },
}

impl BtreeError {
    pub fn corruption(invariant: &'static str, detail: impl Into<String>) -> Self {
        BtreeError::Corruption {
            invariant,
            detail: detail.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            BtreeError::KeyNotFound => Status::KeyNotFound,
            BtreeError::KeyExists => Status::KeyExists,
            BtreeError::ObjectTooBig { .. } => Status::ObjectTooBig,
            BtreeError::OutOfMemory { .. } => Status::OutOfMemory,
            BtreeError::NoNodeRefs => Status::NoNodeRefs,
            BtreeError::OutOfStorage => Status::OutOfStorage,
            BtreeError::BufferTooSmall { .. } => Status::BufferTooSmall,
            BtreeError::InvalidQuery(_) => Status::InvalidQuery,
            BtreeError::StaleSeqno { .. } => Status::StaleSeqno,
            BtreeError::Corruption { .. } => Status::Corruption,
            BtreeError::Io { .. } => Status::Io,
        }
    }

    /// Pressure on memory, cache pins or storage. The operation was rolled
    /// back and may be retried once the pressure clears.
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            BtreeError::OutOfMemory { .. } | BtreeError::NoNodeRefs | BtreeError::OutOfStorage
        )
    }

    /// Outcomes that leave the tree fully consistent, so an operation that
    /// ends with one still commits whatever structural work it already did.
    pub fn is_clean(&self) -> bool {
        matches!(
            self,
            BtreeError::KeyNotFound
                | BtreeError::KeyExists
                | BtreeError::ObjectTooBig { .. }
                | BtreeError::BufferTooSmall { .. }
                | BtreeError::InvalidQuery(_)
                | BtreeError::StaleSeqno { .. }
        )
    }
}

impl fmt::Display for BtreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BtreeError::KeyNotFound => write!(f, "key not found"),
            BtreeError::KeyExists => write!(f, "key already exists"),
            BtreeError::ObjectTooBig { what, len, max } => {
                write!(f, "{} of {} bytes exceeds the limit of {} bytes", what, len, max)
            }
            BtreeError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {} bytes, {} available",
                requested, available
            ),
            BtreeError::NoNodeRefs => write!(f, "no free node references"),
            BtreeError::OutOfStorage => write!(f, "node store is out of space"),
            BtreeError::BufferTooSmall { needed, provided } => write!(
                f,
                "buffer too small: need {} bytes, {} provided",
                needed, provided
            ),
            BtreeError::InvalidQuery(reason) => write!(f, "invalid range query: {}", reason),
            BtreeError::StaleSeqno { expected, found } => write!(
                f,
                "stale seqno: expected {}, stored entry has {}",
                expected, found
            ),
            BtreeError::Corruption { invariant, detail } => {
                write!(f, "node corruption ({}): {}", invariant, detail)
            }
            BtreeError::Io { op, node } => write!(f, "store {} failed for node {}", op, node),
        }
    }
}

impl std::error::Error for BtreeError {}

impl From<&MemoryError> for BtreeError {
    fn from(e: &MemoryError) -> Self {
        BtreeError::OutOfMemory {
            requested: e.requested,
            available: e.available,
        }
    }
}

/// Closed status set returned to embedders that want a flat code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Failure,
    KeyNotFound,
    KeyExists,
    ObjectTooBig,
    QueryDone,
    OutOfMemory,
    NoNodeRefs,
    OutOfStorage,
    BufferTooSmall,
    InvalidQuery,
    StaleSeqno,
    Corruption,
    Io,
}

impl Status {
    /// Classifies a report by its typed cause. A resource cause anywhere in
    /// the chain wins over the contexts wrapped around it; otherwise the
    /// outermost typed error decides. Reports with no typed cause map to
    /// `Failure`.
    pub fn of(report: &eyre::Report) -> Status {
        let typed = btree_error(report);
        if let Some(e) = typed.filter(|e| e.is_resource()) {
            return e.status();
        }
        let out_of_memory = report.downcast_ref::<MemoryError>().is_some()
            || report
                .chain()
                .any(|cause| cause.downcast_ref::<MemoryError>().is_some());
        if out_of_memory {
            return Status::OutOfMemory;
        }
        typed.map_or(Status::Failure, BtreeError::status)
    }

    pub fn of_result<T>(result: &eyre::Result<T>) -> Status {
        match result {
            Ok(_) => Status::Success,
            Err(e) => Status::of(e),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Returns the typed error carried by `report`, if any. A resource error
/// below an `Io` context is returned in preference to the context.
pub fn btree_error(report: &eyre::Report) -> Option<&BtreeError> {
    let typed = || {
        report
            .downcast_ref::<BtreeError>()
            .into_iter()
            .chain(report.chain().filter_map(|c| c.downcast_ref::<BtreeError>()))
    };
    typed().find(|e| e.is_resource()).or_else(|| typed().next())
}

/// True when the report's typed cause says the tree is still consistent.
pub(crate) fn is_clean(report: &eyre::Report) -> bool {
    btree_error(report).is_some_and(BtreeError::is_clean)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Sink for engine messages. The default forwards to `tracing`.
pub trait Diagnostics: Send + Sync {
    fn message(&self, level: Level, text: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn message(&self, level: Level, text: &str) {
        match level {
            Level::Trace => tracing::trace!(target: "flashtree", "{}", text),
            Level::Debug => tracing::debug!(target: "flashtree", "{}", text),
            Level::Info => tracing::info!(target: "flashtree", "{}", text),
            Level::Warn => tracing::warn!(target: "flashtree", "{}", text),
            Level::Error => tracing::error!(target: "flashtree", "{}", text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    #[default]
    ReportOnly,
    Abort,
}

impl ErrorPolicy {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            ErrorPolicy::ReportOnly => 0,
            ErrorPolicy::Abort => 1,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        if v == 1 {
            ErrorPolicy::Abort
        } else {
            ErrorPolicy::ReportOnly
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn status_of_root_error() {
        let report: eyre::Report = BtreeError::KeyExists.into();
        assert_eq!(Status::of(&report), Status::KeyExists);
    }

    #[test]
    fn status_of_wrapped_context() {
        let inner: eyre::Result<()> = Err(eyre::eyre!("disk on fire"));
        let report = inner
            .wrap_err(BtreeError::Io {
                op: "read_node",
                node: 7,
            })
            .unwrap_err();
        assert_eq!(Status::of(&report), Status::Io);
        assert!(report.to_string().contains("node 7"));
    }

    #[test]
    fn resource_cause_wins_over_io_context() {
        let inner: eyre::Result<()> = Err(BtreeError::OutOfStorage.into());
        let report = inner
            .wrap_err(BtreeError::Io {
                op: "write_nodes",
                node: 6,
            })
            .unwrap_err();
        assert_eq!(Status::of(&report), Status::OutOfStorage);
        assert!(btree_error(&report).is_some_and(BtreeError::is_resource));
        assert!(report.to_string().contains("node 6"));
    }

    #[test]
    fn memory_error_below_io_context_is_out_of_memory() {
        let inner: eyre::Result<()> = Err(MemoryError {
            requested: 4096,
            available: 0,
        }
        .into());
        let report = inner
            .wrap_err(BtreeError::Io {
                op: "read_node",
                node: 2,
            })
            .unwrap_err();
        assert_eq!(Status::of(&report), Status::OutOfMemory);
    }

    #[test]
    fn status_of_untyped_report_is_failure() {
        let report = eyre::eyre!("something else");
        assert_eq!(Status::of(&report), Status::Failure);
        assert_eq!(Status::of_result::<()>(&Ok(())), Status::Success);
    }

    #[test]
    fn memory_error_maps_to_out_of_memory() {
        let report: eyre::Report = MemoryError {
            requested: 10,
            available: 2,
        }
        .into();
        assert_eq!(Status::of(&report), Status::OutOfMemory);
    }

    #[test]
    fn corruption_display_names_invariant() {
        let e = BtreeError::corruption("key order", "entry 3 < entry 2");
        assert_eq!(e.status(), Status::Corruption);
        assert!(!e.is_clean());
        assert_eq!(e.to_string(), "node corruption (key order): entry 3 < entry 2");
    }

    #[test]
    fn expected_outcomes_are_clean() {
        assert!(BtreeError::KeyNotFound.is_clean());
        assert!(BtreeError::StaleSeqno { expected: 1, found: 2 }.is_clean());
        assert!(!BtreeError::OutOfStorage.is_clean());
        assert!(!BtreeError::Io { op: "write_nodes", node: 1 }.is_clean());
    }

    #[test]
    fn error_policy_round_trips_through_u8() {
        for p in [ErrorPolicy::ReportOnly, ErrorPolicy::Abort] {
            assert_eq!(ErrorPolicy::from_u8(p.as_u8()), p);
        }
    }
}

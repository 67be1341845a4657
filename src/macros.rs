//! # Internal Macros
//!
//! Boilerplate reducers shared by the node views.
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32, U64). Node headers are read straight
//! out of node buffers, so every multi-byte field is stored as one of these
//! wrappers and exposed as a native integer.
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     nkeys: U16,
//!     logical_id: U64,
//! }
//!
//! impl Header {
//!     zerocopy_accessors! {
//!         nkeys: u16,
//!         logical_id: u64,
//!     }
//! }
//!
//! // Generates nkeys()/set_nkeys() and logical_id()/set_logical_id().
//! ```
//!
//! ## ensure_node!
//!
//! Like `eyre::ensure!`, but the error is a typed
//! [`BtreeError::Corruption`](crate::error::BtreeError) naming the violated
//! node invariant, so callers can classify it with
//! [`Status::of`](crate::error::Status::of).

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Returns a `BtreeError::Corruption` for `$invariant` when `$cond` is false.
#[macro_export]
macro_rules! ensure_node {
    ($cond:expr, $invariant:expr, $($arg:tt)+) => {
        if !$cond {
            return ::std::result::Result::Err(
                $crate::error::BtreeError::corruption($invariant, format!($($arg)+)).into(),
            );
        }
    };
}

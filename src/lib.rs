//! Heap allocator core for an embedded JavaScript runtime.
//!
//! Services small, short-lived engine allocations (objects, strings,
//! property slots, bytecode) from a bounded budget. Free space is kept in
//! an address-ordered free list with in-place headers and compressed
//! (offset-form) links; when a request cannot be satisfied the heap runs a
//! registered reclamation callback at escalating severities and, in
//! segmented mode, attaches further segments before giving up.
//!
//! The heap is single-threaded and non-reentrant by contract: at most one
//! call is in flight, and reclamation callbacks may free but never
//! allocate.

#![cfg_attr(not(test), no_std)]

mod free_list;
mod heap;
mod offset;
mod options;
mod os;
mod segment;
mod stats;
mod system;
mod types;

pub use crate::heap::Heap;
pub use crate::options::HeapOptions;
pub use crate::stats::HeapStats;
pub use crate::types::{GcCallback, GcSeverity, HeapBackend, ALIGNMENT, END_OF_LIST};

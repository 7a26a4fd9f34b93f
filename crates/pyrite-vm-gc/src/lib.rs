//! # Pyrite VM garbage collector
//!
//! Pooled allocation and reachability-based collection.
//!
//! ## Design
//!
//! - **Object pool**: arena/block allocation with per-arena free lists
//!   and integer handles (arena slot + generation) instead of raw
//!   pointers; empty arenas can be released via `shrink_to_fit`
//! - **Slab pool**: fixed-size transient records (call frames) with
//!   O(1) free-list push/pop
//! - **Heap**: single collectible generation plus an exempt set,
//!   mark-and-sweep over a caller-provided root set, threshold doubled
//!   on survival, nestable scope lock deferring collection

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod heap;
pub mod pool;
pub mod slab;

pub use heap::{Heap, HeapStats, Trace};
pub use pool::{Handle, ObjectPool};
pub use slab::SlabPool;

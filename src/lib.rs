//! # `strata`: layered allocation primitives
//!
//! A two-layer allocation toolkit: boundary-tag **arenas** that manage
//! integer-addressed resource ranges, and **slab caches** that carve
//! fixed-size objects out of pages.
//!
//! ## Key pieces
//!
//! - **Arenas**: best-fit / instant-fit / next-fit policies, constrained
//!   placement (`xalloc`: align, phase, no-cross boundaries, address
//!   windows), segment coalescing on every free, and layering: a sourced
//!   arena imports spans on demand and returns each span the moment it
//!   falls empty.
//! - **Slab caches**: small objects share a page with their header; large
//!   objects get bufctl records from a seed cache. Constructors run once
//!   per object when a slab is built.
//! - **Bootstrap**: the base arena charges its own tag metadata to itself,
//!   so the stack needs nothing but an address range to start.
//!
//! ## Example
//!
//! ```rust
//! use strata::{AllocFlags, Arena};
//!
//! let arena = Arena::create("example", 0x1000, 0x10000, 1);
//! let p = arena.alloc(0x200, AllocFlags::BESTFIT).unwrap();
//! assert_eq!(p, 0x1000);
//! arena.free(p, 0x200);
//! assert_eq!(arena.amt_free(), 0x10000);
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod arena;
pub mod boot;
pub mod constants;
pub mod page;
pub mod slab;

pub use arena::{
    AllocFlags, Arena, ArenaBuilder, ArenaStats, Constraints, OomPolicy, SegState, Segment,
};
pub use boot::{MappedSystem, MemorySystem};
pub use page::{ArenaPages, HeapPages, PageSource, HEAP_PAGES};
pub use slab::{CacheStats, KmcFlags, KmemCache};

// Compile-time layout claims the two layers rely on.
const _: () = {
    use crate::constants::{PGSIZE, SLAB_LARGE_CUTOFF, WORD};

    // The small/large split must leave small slabs room for several
    // objects beside the in-page header.
    assert!(SLAB_LARGE_CUTOFF < PGSIZE / 2);

    // The free-list link must fit inside the smallest aligned object.
    assert!(WORD <= SLAB_LARGE_CUTOFF);
};

//! Bootstrap of the layered memory system.
//!
//! Builds the canonical three-arena stack (a self-sufficient base arena
//! over boot-known space, a page arena importing from it, and a
//! fine-grained arena importing from the page arena) and makes sure the
//! slab seed caches exist before the first dynamic cache is created.

use std::sync::Arc;

use tracing::debug;

use crate::arena::{Arena, ArenaBuilder};
use crate::constants::PGSIZE;
use crate::page::sys::MapPages;
use crate::page::ArenaPages;
use crate::slab;

/// Grain of the fine-grained arena.
const KMALLOC_ALIGN: usize = 16;

/// The layered arena stack.
pub struct MemorySystem {
    /// Self-sufficient root; charges its own metadata to itself.
    pub base: Arc<Arena>,
    /// Page-grained arena importing spans from `base`.
    pub kpages: Arc<Arena>,
    /// Fine-grained arena importing page spans from `kpages`.
    pub kmalloc: Arc<Arena>,
}

impl MemorySystem {
    /// Builds the stack over `[span_base, span_base + span_size)`. The span
    /// must be page-aligned; the addresses need not be backed by anything.
    pub fn bootstrap(span_base: usize, span_size: usize) -> Self {
        let base = ArenaBuilder::new("base")
            .base()
            .quantum(PGSIZE)
            .span(span_base, span_size)
            .build();
        let kpages = ArenaBuilder::new("kpages")
            .quantum(PGSIZE)
            .source(base.clone())
            .build();
        let kmalloc = ArenaBuilder::new("kmalloc")
            .quantum(KMALLOC_ALIGN)
            .source(kpages.clone())
            .build();

        // Seed caches up before the first dynamic cache wants a header.
        let _ = slab::cache_cache();

        debug!(base = span_base, size = span_size, "memory system bootstrapped");
        Self {
            base,
            kpages,
            kmalloc,
        }
    }
}

/// A [`MemorySystem`] whose base arena manages a real mapped region, so
/// arena addresses are dereferenceable and `pages` can back slab caches.
///
/// The region and the page-source adapter are leaked: cache sources must
/// live for the rest of the process, the same lifetime a kernel gives its
/// boot memory.
pub struct MappedSystem {
    pub system: MemorySystem,
    pub region: &'static MapPages,
    pub pages: &'static ArenaPages,
}

impl MappedSystem {
    /// Maps `pages` pages and bootstraps the stack over them. Returns
    /// `None` when the mapping fails.
    pub fn bootstrap(pages: usize) -> Option<Self> {
        let region: &'static MapPages = Box::leak(Box::new(MapPages::new(pages)?));
        let system = MemorySystem::bootstrap(region.base(), region.size());
        let pages: &'static ArenaPages =
            Box::leak(Box::new(ArenaPages::new(system.kpages.clone())));
        Some(Self {
            system,
            region,
            pages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::AllocFlags;

    #[test]
    fn bootstrap_layers_import_and_return() {
        let sys = MemorySystem::bootstrap(0x10_0000, 256 * PGSIZE);

        let p = sys.kmalloc.alloc(100, AllocFlags::empty()).unwrap();
        // The import chain pulled real space out of base.
        assert!(sys.base.nr_allocs() > 0);
        sys.kmalloc.free(p, 100);

        sys.base.assert_consistency();
        sys.kpages.assert_consistency();
        sys.kmalloc.assert_consistency();
    }
}

//! Page-allocator collaborators.
//!
//! The slab layer does not carve pages itself; it asks a [`PageSource`] for
//! runs of `2^order` contiguous pages. This keeps the object caches usable
//! against the process heap ([`HeapPages`]), a reserved memory region
//! ([`sys::MapPages`]), or an arena managing real addresses
//! ([`ArenaPages`]).

pub mod sys;

use core::ptr::NonNull;
use std::alloc::{alloc, dealloc, Layout};
use std::sync::Arc;

use crate::arena::{AllocFlags, Arena};
use crate::constants::PGSIZE;

/// A supplier of page runs (`2^order` pages, base aligned to [`PGSIZE`]).
///
/// Mirrors the contract of a kernel page allocator: order-0 requests are
/// single pages, higher orders are physically (here: virtually) contiguous
/// runs.
pub trait PageSource: Sync {
    /// Allocates `2^order` contiguous pages. Returns `None` when the source
    /// is exhausted.
    fn alloc_pages(&self, order: usize) -> Option<NonNull<u8>>;

    /// Returns a run previously obtained from [`Self::alloc_pages`].
    ///
    /// # Safety
    /// `ptr` must have come from `alloc_pages(order)` on this source and
    /// must not be used afterwards.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: usize);
}

/// A page source backed by the global allocator.
#[derive(Default, Clone, Copy, Debug)]
pub struct HeapPages;

/// Shared instance handed to caches that do not name a source.
pub static HEAP_PAGES: HeapPages = HeapPages;

impl HeapPages {
    fn layout(order: usize) -> Layout {
        // PGSIZE alignment lets small slabs recover their header by masking.
        Layout::from_size_align(PGSIZE << order, PGSIZE).expect("page run layout")
    }
}

impl PageSource for HeapPages {
    fn alloc_pages(&self, order: usize) -> Option<NonNull<u8>> {
        let ptr = unsafe { alloc(Self::layout(order)) };
        NonNull::new(ptr)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: usize) {
        dealloc(ptr.as_ptr(), Self::layout(order));
    }
}

/// A page source drawing from an arena whose addresses are real, mapped
/// memory (e.g. an arena layered over a [`sys::MapPages`] region).
///
/// The arena must have quantum [`PGSIZE`] and page-aligned spans so every
/// segment boundary stays page-aligned.
pub struct ArenaPages {
    arena: Arc<Arena>,
}

impl ArenaPages {
    pub fn new(arena: Arc<Arena>) -> Self {
        assert_eq!(
            arena.quantum() % PGSIZE,
            0,
            "ArenaPages needs a page-grained arena"
        );
        Self { arena }
    }

    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }
}

impl PageSource for ArenaPages {
    fn alloc_pages(&self, order: usize) -> Option<NonNull<u8>> {
        // Exhaustion is the caller's problem; report it as None.
        let addr = self.arena.alloc(PGSIZE << order, AllocFlags::MEM_ERROR)?;
        NonNull::new(addr as *mut u8)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: usize) {
        self.arena.free(ptr.as_ptr() as usize, PGSIZE << order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_pages_are_page_aligned() {
        let p = HEAP_PAGES.alloc_pages(0).unwrap();
        assert_eq!(p.as_ptr() as usize % PGSIZE, 0);
        unsafe { HEAP_PAGES.free_pages(p, 0) };
    }

    #[test]
    fn heap_pages_higher_order() {
        let p = HEAP_PAGES.alloc_pages(3).unwrap();
        assert_eq!(p.as_ptr() as usize % PGSIZE, 0);
        // The whole run must be writable.
        unsafe {
            core::ptr::write_bytes(p.as_ptr(), 0xa5, PGSIZE << 3);
            HEAP_PAGES.free_pages(p, 3);
        }
    }
}

//! Layout constants shared by the arena and slab layers.

/// The page size (4KB). Arena metadata growth, slab backing stores and the
/// page-source contract all speak in units of this.
pub const PGSIZE: usize = 4096;

/// log2 of [`PGSIZE`].
pub const PGSHIFT: u32 = 12;

/// Machine word size in bytes. Slab objects reserve one trailing word for
/// the free-list link (small slabs) or the bufctl back-pointer (large slabs).
pub const WORD: usize = core::mem::size_of::<usize>();

/// Objects up to this size use the in-page small-slab layout; anything
/// larger gets a separately allocated header and bufctl tracking.
pub const SLAB_LARGE_CUTOFF: usize = PGSIZE / 8;

/// Target object count per large slab; the backing run is sized up to the
/// next power-of-two page count that holds this many objects.
pub const NUM_BUF_PER_SLAB: usize = 8;

/// Number of power-of-two free-list size classes kept by an arena. One per
/// possible bit position of a `usize` size.
pub const NR_FREE_LISTS: usize = usize::BITS as usize;

/// Width of the allocated-segment hash table. Static; chains lengthen under
/// load but lookups stay correct.
pub const ALLOC_HASH_CHAINS: usize = 193;

const _: () = assert!(PGSIZE == 1 << PGSHIFT);

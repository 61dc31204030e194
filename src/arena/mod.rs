//! Boundary-tag resource arenas.
//!
//! An [`Arena`] manages an integer-addressed resource namespace by boundary
//! tags: every covered address belongs to exactly one FREE or ALLOC
//! segment, spans imported from a source arena are tracked by SPAN tags,
//! and neighboring free segments coalesce on every free. Arenas layer:
//! a child with a source imports spans on demand and hands whole spans back
//! the moment they fall empty.

mod index;
mod stats;
mod tag;
mod xalloc;

pub use stats::{ArenaStats, ClassCount};
pub use xalloc::Constraints;

use std::sync::{Arc, Mutex, MutexGuard};

use bitflags::bitflags;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::constants::{ALLOC_HASH_CHAINS, NR_FREE_LISTS, PGSIZE};
use index::{size_class, size_class_ceil, SegIndex};
use tag::{Tag, TagId, TagPool, TagState, NIL};

bitflags! {
    /// Allocation request flags: one style bit OR'd with one memory
    /// discipline bit. Style and discipline occupy disjoint bit ranges.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AllocFlags: u32 {
        /// Smallest fitting segment in the natural size class.
        const BESTFIT = 1 << 0;
        /// First segment guaranteed to fit, no scanning (default).
        const INSTANTFIT = 1 << 1;
        /// Rotor search upward from the last allocation.
        const NEXTFIT = 1 << 2;

        /// Must not block; failure is a `None` return.
        const MEM_ATOMIC = 1 << 8;
        /// May block on the source chain (default).
        const MEM_WAIT = 1 << 9;
        /// Out-of-space is reported as `None` instead of the arena's OOM
        /// policy.
        const MEM_ERROR = 1 << 10;
    }
}

const STYLE_MASK: AllocFlags = AllocFlags::BESTFIT
    .union(AllocFlags::INSTANTFIT)
    .union(AllocFlags::NEXTFIT);
const MEM_MASK: AllocFlags = AllocFlags::MEM_ATOMIC
    .union(AllocFlags::MEM_WAIT)
    .union(AllocFlags::MEM_ERROR);

// Style and memory bits must never collide; the split is part of the API.
const _: () = assert!(STYLE_MASK.bits() & MEM_MASK.bits() == 0);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Style {
    BestFit,
    InstantFit,
    NextFit,
}

impl AllocFlags {
    fn style(self) -> Style {
        let s = self.intersection(STYLE_MASK);
        if s.is_empty() || s == AllocFlags::INSTANTFIT {
            Style::InstantFit
        } else if s == AllocFlags::BESTFIT {
            Style::BestFit
        } else if s == AllocFlags::NEXTFIT {
            Style::NextFit
        } else {
            panic!("conflicting allocation styles: {s:?}")
        }
    }

    fn discipline(self) -> AllocFlags {
        self.intersection(MEM_MASK)
    }
}

/// What to do when a non-atomic allocation cannot be satisfied.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OomPolicy {
    /// Panic, naming the arena and request.
    #[default]
    Panic,
    /// Report `None` like `MEM_ERROR`.
    Fail,
}

/// Import hook: allocate `size` from the source arena.
pub type ImportFn = fn(&Arena, usize, AllocFlags) -> Option<usize>;
/// Release hook: hand a whole span back to the source. Infallible.
pub type ReleaseFn = fn(&Arena, usize, usize);

/// Default import hook.
pub fn import_alloc(source: &Arena, size: usize, flags: AllocFlags) -> Option<usize> {
    source.alloc(size, flags)
}

/// Default release hook.
pub fn import_free(source: &Arena, base: usize, size: usize) {
    source.free(base, size);
}

struct ArenaSource {
    arena: Arc<Arena>,
    afunc: ImportFn,
    ffunc: ReleaseFn,
}

/// Public snapshot of one segment, in address order.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct Segment {
    pub start: usize,
    pub size: usize,
    pub state: SegState,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum SegState {
    Span,
    Free,
    Alloc,
}

struct ArenaState {
    tags: TagPool,
    index: SegIndex,
    amt_total_segs: usize,
    amt_alloc_segs: usize,
    nr_allocs: usize,
    last_nextfit: Option<usize>,
    /// Segments the base arena carved out of itself for tag storage.
    meta_segs: Vec<usize>,
    /// Pages a sourced arena drew from its base for tag storage.
    meta_pages: Vec<usize>,
}

type Guard<'a> = MutexGuard<'a, ArenaState>;

/// A boundary-tag arena over an integer address space.
pub struct Arena {
    name: &'static str,
    quantum: usize,
    is_base: bool,
    import_scale: u32,
    #[allow(dead_code)]
    qcache_max: usize, // reserved: no magazine layer consumes this yet
    oom: OomPolicy,
    source: Option<ArenaSource>,
    state: CachePadded<Mutex<ArenaState>>,
}

impl Arena {
    /// Starts configuring an arena.
    pub fn builder(name: &'static str) -> ArenaBuilder {
        ArenaBuilder::new(name)
    }

    /// A standalone arena seeded with one span.
    pub fn create(name: &'static str, base: usize, size: usize, quantum: usize) -> Arc<Arena> {
        ArenaBuilder::new(name)
            .quantum(quantum)
            .span(base, size)
            .build()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn quantum(&self) -> usize {
        self.quantum
    }

    pub fn is_base(&self) -> bool {
        self.is_base
    }

    /// Adds a span of resource. Only source-less arenas take manual spans;
    /// sourced arenas import instead.
    pub fn add(&self, base: usize, size: usize) -> usize {
        assert!(
            self.source.is_none(),
            "arena {}: manual span add on a sourced arena",
            self.name
        );
        assert!(size > 0, "arena {}: empty span", self.name);
        assert!(
            base % self.quantum == 0 && size % self.quantum == 0,
            "arena {}: misaligned span [{base:#x}, +{size:#x})",
            self.name
        );
        base.checked_add(size)
            .unwrap_or_else(|| panic!("arena {}: span wraps the address space", self.name));

        let st = self.lock();
        let mut st = match self.ensure_tags(st, 2, AllocFlags::MEM_WAIT) {
            Ok(g) => g,
            Err(_) => panic!("arena {}: no tags for span add", self.name),
        };
        self.add_span_locked(&mut st, base, size);
        base
    }

    /// Allocates `size` bytes (rounded up to the quantum) using the style
    /// in `flags`. Returns the placement address, or `None` under
    /// `MEM_ATOMIC`/`MEM_ERROR` (or a `Fail` OOM policy) when the arena and
    /// its source chain are exhausted.
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Option<usize> {
        let size = self.checked_size(size);
        let style = flags.style();
        let st = self.lock();
        let mut st = match self.ensure_tags(st, 3, flags) {
            Ok(g) => g,
            Err(g) => {
                drop(g);
                return self.oom(size, flags);
            }
        };

        let found = match style {
            Style::BestFit => Self::best_fit(&st, size),
            Style::InstantFit => Self::instant_fit(&st, size),
            Style::NextFit => self.next_fit(&st, size),
        };

        let addr = match found {
            Some((id, addr)) => Self::commit(&mut st, id, addr, size),
            None => {
                // Satisfy the request straight from the imported span; a
                // policy re-run could miss it (its size class may sit below
                // the probe class).
                let Some(free_id) = self.import_span(&mut st, size, flags) else {
                    drop(st);
                    return self.oom(size, flags);
                };
                let start = st.tags[free_id].start;
                Self::commit(&mut st, free_id, start, size)
            }
        };
        if style == Style::NextFit {
            st.last_nextfit = Some(addr);
        }
        Some(addr)
    }

    /// Constrained allocation: align, phase, no-cross boundary, address
    /// window.
    /// When the window or boundary constraints cannot be met from present
    /// spans, the request fails rather than importing blind.
    pub fn xalloc(&self, size: usize, c: &Constraints, flags: AllocFlags) -> Option<usize> {
        let size = self.checked_size(size);
        let (align, phase, nocross) = c.resolve(self.quantum, size);
        let windowed = c.minaddr != 0 || c.maxaddr != 0;
        let st = self.lock();
        let mut st = match self.ensure_tags(st, 4, flags) {
            Ok(g) => g,
            Err(g) => {
                drop(g);
                return self.oom(size, flags);
            }
        };

        let found = if windowed {
            xalloc::tree_search(
                &st.tags, &st.index, size, align, phase, nocross, c.minaddr, c.maxaddr,
            )
        } else {
            xalloc::bucket_search(
                &st.tags,
                &st.index,
                size,
                align,
                phase,
                nocross,
                flags.style() != Style::BestFit,
            )
        };

        if let Some((id, addr)) = found {
            return Some(Self::commit(&mut st, id, addr, size));
        }

        if c.forbids_import() {
            drop(st);
            return self.oom(size, flags);
        }
        // A blind import still satisfies align/phase if it carries alignment
        // slack; place within the fresh span directly.
        let need = if align > self.quantum {
            size.checked_add(align).expect("size arithmetic overflow")
        } else {
            size
        };
        let Some(free_id) = self.import_span(&mut st, need, flags) else {
            drop(st);
            return self.oom(size, flags);
        };
        let t = st.tags[free_id];
        let Some(addr) = xalloc::fit(t.start, t.size, size, align, phase, 0, 0, 0) else {
            drop(st);
            return self.oom(size, flags);
        };
        Some(Self::commit(&mut st, free_id, addr, size))
    }

    /// Returns `[addr, addr + size)` to the arena. Freeing an address the
    /// arena did not hand out, or with the wrong size, is a caller bug and
    /// panics.
    pub fn free(&self, addr: usize, size: usize) {
        let size = self.checked_size(size);
        let mut st = self.lock();
        let span_return = self.free_locked(&mut st, addr, size);
        drop(st);

        // The source's lock is independent; ours is already gone.
        if let Some((base, len)) = span_return {
            let src = self.source.as_ref().expect("span return without source");
            (src.ffunc)(&src.arena, base, len);
            trace!(arena = self.name, base, len, "span returned to source");
        }
    }

    /// Alias of [`Arena::free`] for constrained allocations.
    pub fn xfree(&self, addr: usize, size: usize) {
        self.free(addr, size);
    }

    pub fn amt_total(&self) -> usize {
        self.lock().amt_total_segs
    }

    pub fn amt_free(&self) -> usize {
        let st = self.lock();
        st.amt_total_segs - st.amt_alloc_segs
    }

    pub fn nr_allocs(&self) -> usize {
        self.lock().nr_allocs
    }

    /// Address-ordered snapshot of every tag.
    pub fn segments(&self) -> Vec<Segment> {
        let st = self.lock();
        st.index
            .all
            .values()
            .map(|&id| {
                let t = &st.tags[id];
                Segment {
                    start: t.start,
                    size: t.size,
                    state: match t.state {
                        TagState::Span => SegState::Span,
                        TagState::Free => SegState::Free,
                        TagState::Alloc => SegState::Alloc,
                        TagState::Unused => unreachable!("unused tag in segment index"),
                    },
                }
            })
            .collect()
    }

    /// Accounting snapshot.
    pub fn stats(&self) -> ArenaStats {
        let st = self.lock();
        let free_segs_by_class = (0..NR_FREE_LISTS)
            .filter_map(|c| {
                let count = st.index.freelist_iter(&st.tags, c).count();
                (count > 0).then_some(ClassCount {
                    class: c as u32,
                    count,
                })
            })
            .collect();
        ArenaStats {
            name: self.name,
            quantum: self.quantum,
            is_base: self.is_base,
            amt_total_segs: st.amt_total_segs,
            amt_alloc_segs: st.amt_alloc_segs,
            amt_free: st.amt_total_segs - st.amt_alloc_segs,
            nr_allocs: st.nr_allocs,
            nr_unused_tags: st.tags.nr_unused(),
            tag_capacity: st.tags.capacity(),
            free_segs_by_class,
        }
    }

    /// Tears the arena down. All allocations must have been freed; tag
    /// pages drawn from the base go back to it.
    pub fn destroy(&self) {
        let mut st = self.lock();
        assert_eq!(
            st.nr_allocs,
            st.meta_segs.len(),
            "arena {}: destroyed with outstanding allocations",
            self.name
        );
        let pages = core::mem::take(&mut st.meta_pages);
        st.index = SegIndex::new();
        st.tags = TagPool::with_seed(0);
        st.amt_total_segs = 0;
        st.amt_alloc_segs = 0;
        st.nr_allocs = 0;
        st.meta_segs.clear();
        st.last_nextfit = None;
        drop(st);

        if !pages.is_empty() {
            let base = self.find_base().expect("tag pages without a base arena");
            let page_size = round_up(PGSIZE, base.quantum);
            for p in pages {
                base.free(p, page_size);
            }
        }
        debug!(arena = self.name, "arena destroyed");
    }

    /// Walks every index and re-derives the counters, panicking on any
    /// broken invariant. Meant for tests and debugging sweeps.
    pub fn assert_consistency(&self) {
        let st = self.lock();

        for c in 0..NR_FREE_LISTS {
            for id in st.index.freelist_iter(&st.tags, c) {
                let t = &st.tags[id];
                assert_eq!(t.state, TagState::Free, "non-free tag on a free list");
                assert_eq!(size_class(t.size), c, "tag on wrong size class");
            }
        }
        for chain in 0..ALLOC_HASH_CHAINS {
            for id in st.index.hash_iter(&st.tags, chain) {
                assert_eq!(
                    st.tags[id].state,
                    TagState::Alloc,
                    "non-alloc tag on a hash chain"
                );
            }
        }

        let mut free_sum = 0usize;
        let mut alloc_sum = 0usize;
        let mut nr = 0usize;
        let mut last: Option<TagId> = None;
        let mut span_end = 0usize;
        let mut span_size = 0usize;
        let mut span_acc = 0usize;
        let mut in_span = false;

        for (&key, &id) in &st.index.all {
            let t = &st.tags[id];
            assert_eq!(key.start, t.start, "tree key out of sync");
            assert!(t.size > 0, "empty segment");

            match t.state {
                TagState::Free => free_sum += t.size,
                TagState::Alloc => {
                    alloc_sum += t.size;
                    nr += 1;
                    assert_eq!(
                        st.index.hash_lookup(&st.tags, t.start),
                        Some(id),
                        "alloc tag not reachable through the hash"
                    );
                }
                TagState::Span => {}
                TagState::Unused => panic!("unused tag in the segment tree"),
            }

            if let Some(prev) = last {
                let pt = &st.tags[prev];
                assert!(
                    !(pt.state == TagState::Free && t.state == TagState::Free),
                    "adjacent free tags survived coalescing"
                );
            }

            if t.state == TagState::Span {
                if in_span {
                    assert_eq!(span_acc, span_size, "span not fully covered by tags");
                }
                in_span = true;
                span_size = t.size;
                span_acc = 0;
                span_end = t.end();
            } else if in_span {
                assert!(t.end() <= span_end, "segment leaks past its span");
                span_acc += t.size;
            }

            last = Some(id);
        }
        if in_span {
            assert_eq!(span_acc, span_size, "span not fully covered by tags");
        }

        assert_eq!(st.amt_alloc_segs, alloc_sum, "amt_alloc_segs drifted");
        assert_eq!(
            st.amt_total_segs,
            free_sum + alloc_sum,
            "amt_total_segs drifted"
        );
        assert_eq!(st.nr_allocs, nr, "nr_allocs drifted");

        let list_sum: usize = (0..NR_FREE_LISTS)
            .map(|c| {
                st.index
                    .freelist_iter(&st.tags, c)
                    .map(|id| st.tags[id].size)
                    .sum::<usize>()
            })
            .sum();
        assert_eq!(list_sum, free_sum, "free tag missing from its size class");
    }

    // ---- internals ----------------------------------------------------

    fn lock(&self) -> Guard<'_> {
        self.state.lock().unwrap()
    }

    fn checked_size(&self, size: usize) -> usize {
        assert!(size > 0, "arena {}: zero-size request", self.name);
        round_up(size, self.quantum)
    }

    /// Guarantees `need` unused tags, growing the pool a page-batch at a
    /// time. The base arena charges itself under the held lock; a sourced
    /// arena drops its lock, draws a page from the base, retakes and
    /// re-checks (another allocation may have run in between).
    fn ensure_tags<'a>(
        &'a self,
        mut st: Guard<'a>,
        need: usize,
        flags: AllocFlags,
    ) -> Result<Guard<'a>, Guard<'a>> {
        loop {
            if st.tags.nr_unused() >= need {
                return Ok(st);
            }
            if self.is_base {
                st.tags.grow_batch();
                match self.carve_meta_seg(&mut st) {
                    Some(addr) => {
                        st.meta_segs.push(addr);
                        trace!(arena = self.name, addr, "tag batch charged to base arena");
                    }
                    None => {
                        st.tags.retract_batch();
                        return Err(st);
                    }
                }
            } else if let Some(base) = self.find_base() {
                drop(st);
                let page = base.alloc(
                    round_up(PGSIZE, base.quantum),
                    flags.discipline() | AllocFlags::INSTANTFIT,
                );
                st = self.lock();
                match page {
                    Some(p) => {
                        st.tags.grow_batch();
                        st.meta_pages.push(p);
                        trace!(arena = self.name, page = p, "tag batch drawn from base");
                    }
                    None => return Err(st),
                }
            } else {
                // Standalone arena: no arena space to charge the batch to.
                st.tags.grow_batch();
            }
        }
    }

    /// Base-arena self-recursion: pull a page-sized segment off our own
    /// free lists to account for a tag batch. Runs under the held lock.
    fn carve_meta_seg(&self, st: &mut ArenaState) -> Option<usize> {
        let size = round_up(PGSIZE, self.quantum);
        let (id, addr) = Self::instant_fit(st, size)?;
        Some(Self::commit(st, id, addr, size))
    }

    fn find_base(&self) -> Option<Arc<Arena>> {
        let mut cur = self.source.as_ref()?.arena.clone();
        loop {
            if cur.is_base {
                return Some(cur);
            }
            let next = cur.source.as_ref()?.arena.clone();
            cur = next;
        }
    }

    fn best_fit(st: &ArenaState, size: usize) -> Option<(TagId, usize)> {
        let class = size_class(size);
        let mut best: Option<(TagId, usize)> = None;
        for id in st.index.freelist_iter(&st.tags, class) {
            let sz = st.tags[id].size;
            if sz >= size && best.map_or(true, |(_, b)| sz < b) {
                best = Some((id, sz));
            }
        }
        if let Some((id, _)) = best {
            return Some((id, st.tags[id].start));
        }
        for c in class + 1..NR_FREE_LISTS {
            if let Some(id) = st.index.freelist_head(c) {
                return Some((id, st.tags[id].start));
            }
        }
        None
    }

    fn instant_fit(st: &ArenaState, size: usize) -> Option<(TagId, usize)> {
        for c in size_class_ceil(size)..NR_FREE_LISTS {
            if let Some(id) = st.index.freelist_head(c) {
                return Some((id, st.tags[id].start));
            }
        }
        None
    }

    fn next_fit(&self, st: &ArenaState, size: usize) -> Option<(TagId, usize)> {
        let first_min = match st.last_nextfit {
            Some(cursor) => cursor + self.quantum,
            None => 0,
        };
        let hit = xalloc::tree_search(
            &st.tags, &st.index, size, self.quantum, 0, 0, first_min, 0,
        );
        if hit.is_some() {
            return hit;
        }
        if first_min > 0 {
            // Wrap: retry from the bottom of the space.
            return xalloc::tree_search(&st.tags, &st.index, size, self.quantum, 0, 0, 0, 0);
        }
        None
    }

    /// Takes `[addr, addr + size)` out of free tag `id`, splitting head and
    /// tail as needed, and records the allocation. Callers pre-ensure tags.
    fn commit(st: &mut ArenaState, id: TagId, addr: usize, size: usize) -> usize {
        let (t_start, t_size) = (st.tags[id].start, st.tags[id].size);
        let t_end = t_start + t_size;
        debug_assert!(addr >= t_start && addr + size <= t_end);

        st.index.freelist_remove(&mut st.tags, id);

        let alloc_id = if addr > t_start {
            // The original stays as the free head; its start is unchanged,
            // so its tree entry stays valid.
            st.tags[id].size = addr - t_start;
            st.index.freelist_push(&mut st.tags, id);
            let a = st.tags.pop_unused();
            st.tags[a] = Tag {
                start: addr,
                size,
                state: TagState::Alloc,
                next: NIL,
                prev: NIL,
            };
            st.index.tree_insert(&st.tags, a);
            a
        } else {
            st.tags[id].state = TagState::Alloc;
            st.tags[id].size = size;
            id
        };

        let end = addr + size;
        if end < t_end {
            let r = st.tags.pop_unused();
            st.tags[r] = Tag {
                start: end,
                size: t_end - end,
                state: TagState::Free,
                next: NIL,
                prev: NIL,
            };
            st.index.tree_insert(&st.tags, r);
            st.index.freelist_push(&mut st.tags, r);
        }

        st.index.hash_insert(&mut st.tags, alloc_id);
        st.amt_alloc_segs += size;
        st.nr_allocs += 1;
        addr
    }

    /// Pulls a span from the source and returns its free tag. Needs two
    /// unused tags, which the caller's `ensure_tags` already guaranteed
    /// (the failed fit consumed none).
    fn import_span(&self, st: &mut ArenaState, need: usize, flags: AllocFlags) -> Option<TagId> {
        let src = self.source.as_ref()?;
        let scaled = if self.import_scale == 0 {
            need
        } else {
            need.checked_mul(1usize << self.import_scale)
                .expect("size arithmetic overflow")
        };
        let import_size = round_up(scaled, src.arena.quantum);
        let base = (src.afunc)(&src.arena, import_size, flags.discipline())?;
        let free_id = self.add_span_locked(st, base, import_size);
        trace!(
            arena = self.name,
            source = src.arena.name,
            base,
            size = import_size,
            "imported span"
        );
        Some(free_id)
    }

    /// Installs a span as a SPAN/FREE tag pair and returns the free tag.
    /// Needs two unused tags.
    fn add_span_locked(&self, st: &mut ArenaState, base: usize, size: usize) -> TagId {
        let span = st.tags.pop_unused();
        st.tags[span] = Tag {
            start: base,
            size,
            state: TagState::Span,
            next: NIL,
            prev: NIL,
        };
        st.index.tree_insert(&st.tags, span);

        let free = st.tags.pop_unused();
        st.tags[free] = Tag {
            start: base,
            size,
            state: TagState::Free,
            next: NIL,
            prev: NIL,
        };
        st.index.tree_insert(&st.tags, free);
        st.index.freelist_push(&mut st.tags, free);

        st.amt_total_segs += size;
        free
    }

    /// Frees and coalesces under the lock. Returns the extent of a span
    /// that fell entirely free and must go back to the source (called
    /// after the lock is released).
    fn free_locked(
        &self,
        st: &mut ArenaState,
        addr: usize,
        size: usize,
    ) -> Option<(usize, usize)> {
        let id = st
            .index
            .hash_lookup(&st.tags, addr)
            .unwrap_or_else(|| panic!("arena {}: freeing untracked address {addr:#x}", self.name));
        let recorded = st.tags[id].size;
        assert_eq!(
            recorded, size,
            "arena {}: free of {addr:#x} with size {size:#x}, recorded {recorded:#x}",
            self.name
        );

        st.index.hash_remove(&mut st.tags, id);
        st.tags[id].state = TagState::Free;
        st.amt_alloc_segs -= size;
        st.nr_allocs -= 1;

        let mut cur = id;

        // Successor first: fold it into the freed tag.
        if let Some(next) = st.index.tree_next(&st.tags, cur) {
            if st.tags[next].state == TagState::Free {
                debug_assert_eq!(st.tags[next].start, st.tags[cur].end());
                st.index.freelist_remove(&mut st.tags, next);
                st.index.tree_remove(&st.tags, next);
                let grown = st.tags[next].size;
                st.tags[cur].size += grown;
                st.tags.push_unused(next);
            }
        }

        // Then the predecessor: fold the freed tag into it.
        if let Some(prev) = st.index.tree_prev(&st.tags, cur) {
            if st.tags[prev].state == TagState::Free {
                debug_assert_eq!(st.tags[prev].end(), st.tags[cur].start);
                st.index.freelist_remove(&mut st.tags, prev);
                st.index.tree_remove(&st.tags, cur);
                let grown = st.tags[cur].size;
                st.tags[prev].size += grown;
                st.tags.push_unused(cur);
                cur = prev;
            }
        }

        // A span whose whole extent is now one free tag goes home.
        if self.source.is_some() {
            if let Some(prev) = st.index.tree_prev(&st.tags, cur) {
                let span = st.tags[prev];
                let merged = st.tags[cur];
                if span.state == TagState::Span
                    && span.start == merged.start
                    && span.size == merged.size
                {
                    st.index.tree_remove(&st.tags, cur);
                    st.index.tree_remove(&st.tags, prev);
                    st.tags.push_unused(cur);
                    st.tags.push_unused(prev);
                    st.amt_total_segs -= span.size;
                    return Some((span.start, span.size));
                }
            }
        }

        st.index.freelist_push(&mut st.tags, cur);
        None
    }

    fn oom(&self, size: usize, flags: AllocFlags) -> Option<usize> {
        if flags.intersects(AllocFlags::MEM_ATOMIC | AllocFlags::MEM_ERROR)
            || self.oom == OomPolicy::Fail
        {
            warn!(arena = self.name, size, "out of space");
            return None;
        }
        panic!(
            "arena {}: out of space allocating {size:#x} bytes",
            self.name
        );
    }
}

pub(crate) fn round_up(x: usize, quantum: usize) -> usize {
    x.checked_add(quantum - 1).expect("size arithmetic overflow") / quantum * quantum
}

/// Configuration for [`Arena`] construction.
pub struct ArenaBuilder {
    name: &'static str,
    quantum: usize,
    is_base: bool,
    import_scale: u32,
    qcache_max: usize,
    oom: OomPolicy,
    source: Option<(Arc<Arena>, ImportFn, ReleaseFn)>,
    span: Option<(usize, usize)>,
}

impl ArenaBuilder {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            quantum: 1,
            is_base: false,
            import_scale: 0,
            qcache_max: 0,
            oom: OomPolicy::default(),
            source: None,
            span: None,
        }
    }

    /// Minimum grain and alignment of allocation.
    pub fn quantum(mut self, quantum: usize) -> Self {
        assert!(quantum >= 1, "quantum must be at least 1");
        self.quantum = quantum;
        self
    }

    /// Marks this as the base arena: it charges its own tag storage to
    /// itself and anchors every source chain.
    pub fn base(mut self) -> Self {
        self.is_base = true;
        self
    }

    /// Import requests are inflated to `size << scale`.
    pub fn import_scale(mut self, scale: u32) -> Self {
        assert!(scale < usize::BITS, "import scale out of range");
        self.import_scale = scale;
        self
    }

    /// Reserved: quantum-cache roster threshold. Stored, never consumed.
    pub fn qcache_max(mut self, max: usize) -> Self {
        self.qcache_max = max;
        self
    }

    pub fn oom_policy(mut self, oom: OomPolicy) -> Self {
        self.oom = oom;
        self
    }

    /// Layers this arena on `source` with the default import hooks.
    pub fn source(self, source: Arc<Arena>) -> Self {
        self.source_with(source, import_alloc, import_free)
    }

    /// Layers this arena on `source` with custom hooks.
    pub fn source_with(mut self, source: Arc<Arena>, afunc: ImportFn, ffunc: ReleaseFn) -> Self {
        self.source = Some((source, afunc, ffunc));
        self
    }

    /// Seeds the arena with an initial span (source-less arenas only).
    pub fn span(mut self, base: usize, size: usize) -> Self {
        self.span = Some((base, size));
        self
    }

    pub fn build(self) -> Arc<Arena> {
        assert!(
            !(self.is_base && self.source.is_some()),
            "the base arena has no source"
        );
        assert!(
            !(self.source.is_some() && self.span.is_some()),
            "sourced arenas import spans; they do not take manual ones"
        );

        let arena = Arc::new(Arena {
            name: self.name,
            quantum: self.quantum,
            is_base: self.is_base,
            import_scale: self.import_scale,
            qcache_max: self.qcache_max,
            oom: self.oom,
            source: self
                .source
                .map(|(arena, afunc, ffunc)| ArenaSource { arena, afunc, ffunc }),
            state: CachePadded::new(Mutex::new(ArenaState {
                tags: TagPool::with_seed(2),
                index: SegIndex::new(),
                amt_total_segs: 0,
                amt_alloc_segs: 0,
                nr_allocs: 0,
                last_nextfit: None,
                meta_segs: Vec::new(),
                meta_pages: Vec::new(),
            })),
        });
        debug!(
            arena = arena.name,
            quantum = arena.quantum,
            base = arena.is_base,
            "arena created"
        );
        if let Some((base, size)) = self.span {
            arena.add(base, size);
        }
        arena
    }
}

//! Slab object caches.
//!
//! A [`KmemCache`] hands out fixed-size objects carved from page runs
//! obtained through a [`PageSource`]. Slabs move between the cache's
//! `empty`, `partial` and `full` lists as objects come and go; a slab whose
//! last object returns drops back to `empty`, where [`KmemCache::reap`]
//! can release its backing.
//!
//! Three seed caches bootstrap the layer: cache headers come from
//! [`cache_cache`], large-slab headers from [`slab_cache`], and bufctls
//! from [`bufctl_cache`].

mod layout;
mod registry;

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, OnceLock};

use bitflags::bitflags;
use crossbeam_utils::CachePadded;
use serde::Serialize;
use tracing::{debug, trace};

use crate::arena::AllocFlags;
use crate::constants::{PGSIZE, SLAB_LARGE_CUTOFF};
use crate::page::{PageSource, HEAP_PAGES};
use layout::{Bufctl, Slab, SlabList};

bitflags! {
    /// Cache-creation flags. The bit space is reserved; nothing consumes it
    /// yet.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct KmcFlags: u32 {}
}

/// Object constructor, run over every object when a slab is built.
pub type ObjCtor = fn(*mut u8, usize);
/// Object destructor, run over every object when a slab is torn down.
pub type ObjDtor = fn(*mut u8, usize);

struct CacheState {
    full: SlabList,
    partial: SlabList,
    empty: SlabList,
    nr_cur_alloc: usize,
    nr_slabs: usize,
}

type Guard<'a> = MutexGuard<'a, CacheState>;

/// A cache of fixed-size objects backed by slabs.
pub struct KmemCache {
    name: &'static str,
    obj_size: usize,
    aligned_obj_size: usize,
    large: bool,
    order: usize,
    #[allow(dead_code)]
    flags: KmcFlags,
    ctor: Option<ObjCtor>,
    dtor: Option<ObjDtor>,
    source: &'static dyn PageSource,
    is_seed: bool,
    state: CachePadded<Mutex<CacheState>>,
}

// Raw slab pointers are only touched under the cache lock.
unsafe impl Send for KmemCache {}
unsafe impl Sync for KmemCache {}

struct Seeds {
    cache_cache: KmemCache,
    slab_cache: KmemCache,
    bufctl_cache: KmemCache,
}

static SEEDS: OnceLock<&'static Seeds> = OnceLock::new();

fn seeds() -> &'static Seeds {
    SEEDS.get_or_init(|| {
        let s: &'static Seeds = Box::leak(Box::new(Seeds {
            cache_cache: KmemCache::init(
                "kmem_cache",
                size_of::<KmemCache>(),
                align_of::<KmemCache>(),
                KmcFlags::empty(),
                None,
                None,
                &HEAP_PAGES,
                true,
            ),
            slab_cache: KmemCache::init(
                "kmem_slab",
                size_of::<Slab>(),
                align_of::<Slab>(),
                KmcFlags::empty(),
                None,
                None,
                &HEAP_PAGES,
                true,
            ),
            bufctl_cache: KmemCache::init(
                "kmem_bufctl",
                size_of::<Bufctl>(),
                align_of::<Bufctl>(),
                KmcFlags::empty(),
                None,
                None,
                &HEAP_PAGES,
                true,
            ),
        }));
        registry::insert(&s.cache_cache);
        registry::insert(&s.slab_cache);
        registry::insert(&s.bufctl_cache);
        s
    })
}

/// The cache that cache headers themselves come from.
pub fn cache_cache() -> &'static KmemCache {
    &seeds().cache_cache
}

/// The cache for large-slab headers.
pub fn slab_cache() -> &'static KmemCache {
    &seeds().slab_cache
}

/// The cache for large-slab bufctl records.
pub fn bufctl_cache() -> &'static KmemCache {
    &seeds().bufctl_cache
}

impl KmemCache {
    /// Creates a cache over the default heap page source. The header is
    /// allocated from [`cache_cache`].
    pub fn create(
        name: &'static str,
        obj_size: usize,
        align: usize,
        flags: KmcFlags,
        ctor: Option<ObjCtor>,
        dtor: Option<ObjDtor>,
    ) -> &'static KmemCache {
        Self::create_with_source(name, obj_size, align, flags, ctor, dtor, &HEAP_PAGES)
    }

    /// Creates a cache drawing its slabs from `source`.
    pub fn create_with_source(
        name: &'static str,
        obj_size: usize,
        align: usize,
        flags: KmcFlags,
        ctor: Option<ObjCtor>,
        dtor: Option<ObjDtor>,
        source: &'static dyn PageSource,
    ) -> &'static KmemCache {
        let hdr = cache_cache()
            .alloc(AllocFlags::MEM_WAIT)
            .unwrap_or_else(|| panic!("kmem: no memory for cache {name}"));
        let ptr = hdr.as_ptr() as *mut KmemCache;
        unsafe {
            ptr.write(KmemCache::init(
                name, obj_size, align, flags, ctor, dtor, source, false,
            ));
        }
        let cache = unsafe { &*ptr };
        registry::insert(cache);
        debug!(cache = name, obj_size, "kmem cache created");
        cache
    }

    #[allow(clippy::too_many_arguments)]
    fn init(
        name: &'static str,
        obj_size: usize,
        align: usize,
        flags: KmcFlags,
        ctor: Option<ObjCtor>,
        dtor: Option<ObjDtor>,
        source: &'static dyn PageSource,
        is_seed: bool,
    ) -> KmemCache {
        assert!(obj_size > 0, "cache {name}: zero object size");
        assert!(
            align.is_power_of_two(),
            "cache {name}: alignment must be a power of two"
        );
        assert!(align <= PGSIZE, "cache {name}: alignment beyond a page");

        let aligned = layout::aligned_obj_size(obj_size, align);
        let large = obj_size > SLAB_LARGE_CUTOFF;
        let order = if large { layout::large_order(aligned) } else { 0 };
        if !large {
            assert!(
                layout::small_capacity(aligned) > 0,
                "cache {name}: alignment leaves no room in a page"
            );
        }

        KmemCache {
            name,
            obj_size,
            aligned_obj_size: aligned,
            large,
            order,
            flags,
            ctor,
            dtor,
            source,
            is_seed,
            state: CachePadded::new(Mutex::new(CacheState {
                full: SlabList::new(),
                partial: SlabList::new(),
                empty: SlabList::new(),
                nr_cur_alloc: 0,
                nr_slabs: 0,
            })),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Objects carried by each slab of this cache.
    pub fn objs_per_slab(&self) -> usize {
        if self.large {
            (PGSIZE << self.order) / self.aligned_obj_size
        } else {
            layout::small_capacity(self.aligned_obj_size)
        }
    }

    /// Takes one object. A partial slab is preferred, then an empty one,
    /// growing the cache when both lists are dry.
    pub fn alloc(&self, flags: AllocFlags) -> Option<NonNull<u8>> {
        let mut st = self.lock();

        let slab = if !st.partial.is_empty() {
            st.partial.head()
        } else {
            if st.empty.is_empty() {
                self.grow(&mut st, flags)?;
            }
            st.empty.head()
        };
        debug_assert!(!slab.is_null());

        unsafe {
            let was_empty = (*slab).num_busy == 0;
            let obj = if self.large {
                let bc = (*slab).free as *mut Bufctl;
                (*slab).free = (*bc).next as *mut u8;
                (*bc).buf
            } else {
                let obj = (*slab).free;
                (*slab).free = *layout::tail_word(obj, self.aligned_obj_size) as *mut u8;
                obj
            };
            (*slab).num_busy += 1;

            if was_empty {
                st.empty.unlink(slab);
                st.partial.push(slab);
            }
            if (*slab).num_busy == (*slab).num_total {
                st.partial.unlink(slab);
                st.full.push(slab);
            }
            st.nr_cur_alloc += 1;
            Some(NonNull::new_unchecked(obj))
        }
    }

    /// Returns an object to its slab.
    ///
    /// # Safety
    /// `obj` must have come from this cache's [`Self::alloc`] and must not
    /// be used (or freed) again.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let obj = obj.as_ptr();
        unsafe {
            let slab = if self.large {
                let bc = *layout::tail_word(obj, self.aligned_obj_size) as *mut Bufctl;
                (*bc).slab
            } else {
                layout::small_slab_of(obj)
            };

            let mut st = self.lock();
            if self.large {
                let bc = *layout::tail_word(obj, self.aligned_obj_size) as *mut Bufctl;
                (*bc).next = (*slab).free as *mut Bufctl;
                (*slab).free = bc as *mut u8;
            } else {
                *layout::tail_word(obj, self.aligned_obj_size) = (*slab).free as usize;
                (*slab).free = obj;
            }

            let was_full = (*slab).num_busy == (*slab).num_total;
            (*slab).num_busy -= 1;
            if was_full {
                st.full.unlink(slab);
                st.partial.push(slab);
            }
            if (*slab).num_busy == 0 {
                st.partial.unlink(slab);
                st.empty.push(slab);
            }
            st.nr_cur_alloc -= 1;
        }
    }

    /// Releases every empty slab.
    pub fn reap(&self) {
        let mut st = self.lock();
        let mut n = 0usize;
        while let Some(slab) = unsafe { st.empty.pop() } {
            unsafe { self.destroy_slab(slab) };
            st.nr_slabs -= 1;
            n += 1;
        }
        if n > 0 {
            trace!(cache = self.name, slabs = n, "reaped");
        }
    }

    /// Tears the cache down. Every object must have been freed; the header
    /// returns to [`cache_cache`].
    pub fn destroy(&'static self) {
        assert!(!self.is_seed, "cache {}: destroying a seed cache", self.name);
        {
            let mut st = self.lock();
            assert!(
                st.full.is_empty() && st.partial.is_empty(),
                "cache {}: destroyed with outstanding objects",
                self.name
            );
            while let Some(slab) = unsafe { st.empty.pop() } {
                unsafe { self.destroy_slab(slab) };
                st.nr_slabs -= 1;
            }
        }
        registry::remove(self);
        debug!(cache = self.name, "kmem cache destroyed");
        unsafe {
            let ptr = self as *const KmemCache as *mut KmemCache;
            ptr::drop_in_place(ptr);
            cache_cache().free(NonNull::new_unchecked(ptr as *mut u8));
        }
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        CacheStats {
            name: self.name,
            obj_size: self.obj_size,
            aligned_obj_size: self.aligned_obj_size,
            large: self.large,
            objs_per_slab: self.objs_per_slab(),
            nr_cur_alloc: st.nr_cur_alloc,
            nr_slabs: st.nr_slabs,
            nr_full: st.full.len(),
            nr_partial: st.partial.len(),
            nr_empty: st.empty.len(),
        }
    }

    // ---- internals ----------------------------------------------------

    fn lock(&self) -> Guard<'_> {
        self.state.lock().unwrap()
    }

    fn grow(&self, st: &mut Guard<'_>, flags: AllocFlags) -> Option<()> {
        if self.large {
            self.grow_large(st, flags)
        } else {
            self.grow_small(st)
        }
    }

    fn grow_small(&self, st: &mut Guard<'_>) -> Option<()> {
        let page = self.source.alloc_pages(0)?;
        let base = page.as_ptr();
        let aligned = self.aligned_obj_size;
        let num = layout::small_capacity(aligned);

        unsafe {
            for i in 0..num {
                let obj = base.add(i * aligned);
                let next = if i + 1 < num {
                    base.add((i + 1) * aligned) as usize
                } else {
                    0
                };
                *layout::tail_word(obj, aligned) = next;
                if let Some(ctor) = self.ctor {
                    ctor(obj, self.obj_size);
                }
            }
            let hdr = base.add(PGSIZE - size_of::<Slab>()) as *mut Slab;
            ptr::write(
                hdr,
                Slab {
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    free: base,
                    backing: base,
                    num_busy: 0,
                    num_total: num,
                },
            );
            st.empty.push(hdr);
        }
        st.nr_slabs += 1;
        trace!(cache = self.name, objs = num, "slab grown");
        Some(())
    }

    fn grow_large(&self, st: &mut Guard<'_>, flags: AllocFlags) -> Option<()> {
        let hdr_obj = slab_cache().alloc(flags)?;
        let hdr = hdr_obj.as_ptr() as *mut Slab;

        let Some(run) = self.source.alloc_pages(self.order) else {
            unsafe { slab_cache().free(hdr_obj) };
            return None;
        };
        let base = run.as_ptr();
        let aligned = self.aligned_obj_size;
        let num = (PGSIZE << self.order) / aligned;

        unsafe {
            ptr::write(
                hdr,
                Slab {
                    next: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    free: ptr::null_mut(),
                    backing: base,
                    num_busy: 0,
                    num_total: num,
                },
            );
            for i in 0..num {
                let Some(bc_obj) = bufctl_cache().alloc(flags) else {
                    // Unwind the half-built slab: bufctls, run, header.
                    let mut bc = (*hdr).free as *mut Bufctl;
                    while !bc.is_null() {
                        let next = (*bc).next;
                        bufctl_cache().free(NonNull::new_unchecked(bc as *mut u8));
                        bc = next;
                    }
                    self.source.free_pages(run, self.order);
                    slab_cache().free(hdr_obj);
                    return None;
                };
                let bc = bc_obj.as_ptr() as *mut Bufctl;
                let obj = base.add(i * aligned);
                (*bc).buf = obj;
                (*bc).slab = hdr;
                (*bc).next = (*hdr).free as *mut Bufctl;
                (*hdr).free = bc as *mut u8;
                *layout::tail_word(obj, aligned) = bc as usize;
                if let Some(ctor) = self.ctor {
                    ctor(obj, self.obj_size);
                }
            }
            st.empty.push(hdr);
        }
        st.nr_slabs += 1;
        trace!(cache = self.name, objs = num, order = self.order, "slab grown");
        Some(())
    }

    /// Destroys one empty slab: destructors, bufctls, backing, header.
    unsafe fn destroy_slab(&self, slab: *mut Slab) {
        debug_assert_eq!((*slab).num_busy, 0);
        let base = (*slab).backing;

        if let Some(dtor) = self.dtor {
            for i in 0..(*slab).num_total {
                dtor(base.add(i * self.aligned_obj_size), self.obj_size);
            }
        }

        if self.large {
            let mut bc = (*slab).free as *mut Bufctl;
            while !bc.is_null() {
                let next = (*bc).next;
                bufctl_cache().free(NonNull::new_unchecked(bc as *mut u8));
                bc = next;
            }
            self.source
                .free_pages(NonNull::new_unchecked(base), self.order);
            slab_cache().free(NonNull::new_unchecked(slab as *mut u8));
        } else {
            self.source.free_pages(NonNull::new_unchecked(base), 0);
        }
    }
}

/// Counters for one cache.
#[derive(Clone, Debug, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub obj_size: usize,
    pub aligned_obj_size: usize,
    pub large: bool,
    pub objs_per_slab: usize,
    pub nr_cur_alloc: usize,
    pub nr_slabs: usize,
    pub nr_full: usize,
    pub nr_partial: usize,
    pub nr_empty: usize,
}

/// Stats for every registered cache, smallest objects first.
pub fn dump_caches() -> Vec<CacheStats> {
    registry::snapshot().iter().map(|c| c.stats()).collect()
}

/// JSON rendering of [`dump_caches`] for diagnostics.
pub fn dump_caches_json() -> String {
    serde_json::to_string_pretty(&dump_caches()).expect("cache stats serialize")
}

use std::thread;

use strata::{AllocFlags, KmcFlags, KmemCache};

#[test]
fn slab_lifecycle_empty_partial_full() {
    let cache = KmemCache::create("life-64", 64, 8, KmcFlags::empty(), None, None);
    let per_slab = cache.objs_per_slab();
    assert!(per_slab > 1);

    // Fill all but one object: exactly one slab, partial.
    let mut objs = Vec::new();
    for _ in 0..per_slab - 1 {
        objs.push(cache.alloc(AllocFlags::empty()).unwrap());
    }
    let stats = cache.stats();
    assert_eq!((stats.nr_slabs, stats.nr_partial, stats.nr_full), (1, 1, 0));

    // The last object moves the slab to full.
    objs.push(cache.alloc(AllocFlags::empty()).unwrap());
    let stats = cache.stats();
    assert_eq!((stats.nr_partial, stats.nr_full), (0, 1));

    // Freeing any one object demotes it to partial.
    unsafe { cache.free(objs.swap_remove(3)) };
    let stats = cache.stats();
    assert_eq!((stats.nr_partial, stats.nr_full), (1, 0));

    // Freeing the rest leaves it empty.
    for obj in objs.drain(..) {
        unsafe { cache.free(obj) };
    }
    let stats = cache.stats();
    assert_eq!((stats.nr_partial, stats.nr_full, stats.nr_empty), (0, 0, 1));
    assert_eq!(stats.nr_cur_alloc, 0);

    cache.destroy();
}

#[test]
fn objects_do_not_overlap_and_hold_data() {
    let cache = KmemCache::create("data-48", 48, 16, KmcFlags::empty(), None, None);
    let n = cache.objs_per_slab() * 3 + 5; // span several slabs
    let mut objs = Vec::new();
    for i in 0..n {
        let p = cache.alloc(AllocFlags::empty()).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        unsafe { core::ptr::write_bytes(p.as_ptr(), (i % 251) as u8, 48) };
        objs.push(p);
    }
    for (i, p) in objs.iter().enumerate() {
        let b = unsafe { *p.as_ptr().add(47) };
        assert_eq!(b, (i % 251) as u8, "object {i} was clobbered");
    }
    for p in objs {
        unsafe { cache.free(p) };
    }
    cache.reap();
    cache.destroy();
}

#[test]
fn reap_is_idempotent() {
    let cache = KmemCache::create("reap-128", 128, 8, KmcFlags::empty(), None, None);
    let p = cache.alloc(AllocFlags::empty()).unwrap();
    unsafe { cache.free(p) };
    assert_eq!(cache.stats().nr_empty, 1);

    cache.reap();
    assert_eq!(cache.stats().nr_slabs, 0);

    // A second reap with no allocations in between is a no-op.
    cache.reap();
    assert_eq!(cache.stats().nr_slabs, 0);
    cache.destroy();
}

#[test]
fn large_object_cache_round_trip() {
    // Above the cutoff: separately allocated headers and bufctls.
    let cache = KmemCache::create("large-4k", 4096, 64, KmcFlags::empty(), None, None);
    let stats = cache.stats();
    assert!(stats.large);

    let mut objs = Vec::new();
    for i in 0..20u8 {
        let p = cache.alloc(AllocFlags::empty()).unwrap();
        assert_eq!(p.as_ptr() as usize % 64, 0);
        unsafe { core::ptr::write_bytes(p.as_ptr(), i, 4096) };
        objs.push(p);
    }
    for (i, p) in objs.iter().enumerate() {
        let b = unsafe { *p.as_ptr().add(4095) };
        assert_eq!(b, i as u8);
    }
    for p in objs {
        unsafe { cache.free(p) };
    }
    assert_eq!(cache.stats().nr_cur_alloc, 0);
    cache.reap();
    assert_eq!(cache.stats().nr_slabs, 0);
    cache.destroy();
}

#[test]
fn cache_registry_is_size_sorted() {
    let small = KmemCache::create("reg-a", 24, 8, KmcFlags::empty(), None, None);
    let big = KmemCache::create("reg-b", 2048, 8, KmcFlags::empty(), None, None);

    let dump = strata::slab::dump_caches();
    let sizes: Vec<_> = dump.iter().map(|s| s.obj_size).collect();
    let mut sorted = sizes.clone();
    sorted.sort();
    assert_eq!(sizes, sorted, "registry lost its size order");

    let json = strata::slab::dump_caches_json();
    assert!(json.contains("reg-a"));
    assert!(json.contains("reg-b"));

    small.destroy();
    big.destroy();
}

#[test]
fn concurrent_alloc_free() {
    let cache = KmemCache::create("mt-96", 96, 8, KmcFlags::empty(), None, None);

    thread::scope(|s| {
        for t in 0..4u64 {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..300u64 {
                    let p = cache.alloc(AllocFlags::empty()).unwrap();
                    unsafe {
                        let val = t * 1_000_000 + i;
                        *(p.as_ptr() as *mut u64) = val;
                        std::hint::spin_loop();
                        assert_eq!(*(p.as_ptr() as *mut u64), val);
                    }
                    unsafe { cache.free(p) };
                }
            });
        }
    });

    assert_eq!(cache.stats().nr_cur_alloc, 0);
    cache.reap();
    cache.destroy();
}

use std::thread;

use strata::{AllocFlags, Arena, SegState, Segment};

fn seg(start: usize, size: usize, state: SegState) -> Segment {
    Segment { start, size, state }
}

#[test]
fn best_fit_on_single_segment() {
    // Single free segment [0x1000, 0x1000 + 0x10000).
    let arena = Arena::create("bestfit", 0x1000, 0x10000, 1);

    let p = arena.alloc(0x200, AllocFlags::BESTFIT).unwrap();
    assert_eq!(p, 0x1000);
    assert_eq!(arena.amt_total() - arena.amt_free(), 0x200);

    arena.free(p, 0x200);
    assert_eq!(
        arena.segments(),
        vec![
            seg(0x1000, 0x10000, SegState::Span),
            seg(0x1000, 0x10000, SegState::Free),
        ]
    );
    arena.assert_consistency();
}

#[test]
fn best_fit_prefers_the_tightest_segment() {
    let arena = Arena::create("tightest", 0, 0x10000, 1);
    // Carve two holes in the same size class: 0x180 at 0x0, 0x100 at 0x800.
    let a = arena.alloc(0x180, AllocFlags::empty()).unwrap(); // 0x0
    let b = arena.alloc(0x680, AllocFlags::empty()).unwrap(); // 0x180
    let c = arena.alloc(0x100, AllocFlags::empty()).unwrap(); // 0x800
    let d = arena.alloc(0x100, AllocFlags::empty()).unwrap(); // 0x900
    arena.free(a, 0x180);
    arena.free(c, 0x100);
    arena.assert_consistency();

    // Both holes live in class 8; best fit scans the class and takes the
    // tighter 0x100 hole for a 0x100 request.
    let e = arena.alloc(0x100, AllocFlags::BESTFIT).unwrap();
    assert_eq!(e, 0x800);

    arena.free(e, 0x100);
    arena.free(b, 0x680);
    arena.free(d, 0x100);
    arena.assert_consistency();
}

#[test]
fn next_fit_advances_and_wraps() {
    // Segment [0x0, 0x1000), quantum 0x100.
    let arena = Arena::create("nextfit", 0x0, 0x1000, 0x100);

    let a1 = arena.alloc(0x100, AllocFlags::NEXTFIT).unwrap();
    let a2 = arena.alloc(0x100, AllocFlags::NEXTFIT).unwrap();
    assert_eq!((a1, a2), (0x0, 0x100));

    arena.free(a1, 0x100);

    // The cursor keeps advancing past the hole at 0x0.
    let a3 = arena.alloc(0x100, AllocFlags::NEXTFIT).unwrap();
    assert_eq!(a3, 0x200);

    // Exhaust the tail: 0x300 through 0xf00.
    for want in (0x300..0x1000).step_by(0x100) {
        assert_eq!(arena.alloc(0x100, AllocFlags::NEXTFIT).unwrap(), want);
    }

    // Only now does the rotor wrap and find the hole at 0x0.
    assert_eq!(arena.alloc(0x100, AllocFlags::NEXTFIT).unwrap(), 0x0);
    assert!(arena.alloc(0x100, AllocFlags::NEXTFIT | AllocFlags::MEM_ATOMIC).is_none());
    arena.assert_consistency();
}

#[test]
fn instant_fit_skips_undersized_buckets() {
    let arena = Arena::create("instant", 0, 0x10000, 1);
    // Leave a 0x180 hole (class 8) and keep the big tail (class ~14).
    let a = arena.alloc(0x180, AllocFlags::empty()).unwrap();
    let b = arena.alloc(0x80, AllocFlags::empty()).unwrap();
    arena.free(a, 0x180);

    // Instant fit for 0x180 starts at class 9 and must not scan the class-8
    // hole, even though it would fit exactly.
    let c = arena.alloc(0x180, AllocFlags::INSTANTFIT).unwrap();
    assert_ne!(c, a);

    // Best fit does take the exact hole.
    let d = arena.alloc(0x180, AllocFlags::BESTFIT).unwrap();
    assert_eq!(d, a);

    arena.free(b, 0x80);
    arena.free(c, 0x180);
    arena.free(d, 0x180);
    arena.assert_consistency();
}

#[test]
fn round_trip_restores_counters_and_layout() {
    let arena = Arena::create("roundtrip", 0x4000, 0x40000, 0x10);
    let before_segs = arena.segments();
    let before_free = arena.amt_free();
    let before_allocs = arena.nr_allocs();

    let p = arena.alloc(0x123, AllocFlags::empty()).unwrap();
    arena.free(p, 0x123);

    assert_eq!(arena.segments(), before_segs);
    assert_eq!(arena.amt_free(), before_free);
    assert_eq!(arena.nr_allocs(), before_allocs);
    arena.assert_consistency();
}

#[test]
fn multiple_spans_do_not_merge_across_boundaries() {
    let arena = Arena::create("spans", 0x0, 0x1000, 1);
    arena.add(0x1000, 0x1000);
    // Spans are contiguous but stay distinct; the frees never merge across
    // the span boundary.
    assert_eq!(
        arena.segments(),
        vec![
            seg(0x0, 0x1000, SegState::Span),
            seg(0x0, 0x1000, SegState::Free),
            seg(0x1000, 0x1000, SegState::Span),
            seg(0x1000, 0x1000, SegState::Free),
        ]
    );
    arena.assert_consistency();

    // A request larger than either span fails even though the total fits.
    assert!(arena.alloc(0x1800, AllocFlags::MEM_ATOMIC).is_none());
    arena.assert_consistency();
}

#[test]
fn stats_snapshot_tracks_accounting() {
    let arena = Arena::create("stats", 0, 0x10000, 1);
    let p = arena.alloc(0x1000, AllocFlags::empty()).unwrap();
    let stats = arena.stats();
    assert_eq!(stats.amt_total_segs, 0x10000);
    assert_eq!(stats.amt_alloc_segs, 0x1000);
    assert_eq!(stats.amt_free, 0xf000);
    assert_eq!(stats.nr_allocs, 1);
    assert!(!stats.free_segs_by_class.is_empty());

    // The JSON dump carries the same numbers.
    let json = stats.to_json();
    assert!(json.contains("\"amt_alloc_segs\": 4096"));
    arena.free(p, 0x1000);
}

#[test]
fn concurrent_alloc_free_stays_consistent() {
    let arena = Arena::create("threads", 0, 1 << 22, 8);
    let arena_ref = &arena;

    thread::scope(|s| {
        for t in 0..4 {
            s.spawn(move || {
                let mut held = Vec::new();
                for i in 0..200usize {
                    let size = 8 + (t * 40 + i % 17) * 8;
                    match arena_ref.alloc(size, AllocFlags::MEM_ATOMIC) {
                        Some(p) => held.push((p, size)),
                        None => break,
                    }
                    if i % 3 == 0 {
                        if let Some((p, sz)) = held.pop() {
                            arena_ref.free(p, sz);
                        }
                    }
                }
                for (p, sz) in held {
                    arena_ref.free(p, sz);
                }
            });
        }
    });

    assert_eq!(arena.nr_allocs(), 0);
    assert_eq!(arena.amt_free(), 1 << 22);
    arena.assert_consistency();
}

#[test]
fn destroy_accounts_for_metadata() {
    let arena = Arena::create("destroyable", 0, 0x100000, 1);
    let p = arena.alloc(0x100, AllocFlags::empty()).unwrap();
    arena.free(p, 0x100);
    arena.destroy();
    assert_eq!(arena.amt_total(), 0);
}

//! Constrained placement: candidate testing and the two search strategies
//! behind `Arena::xalloc` and the next-fit policy.

use super::index::{size_class, SegIndex, SegKey};
use super::tag::{TagId, TagPool, TagState};
use crate::constants::NR_FREE_LISTS;

/// Placement constraints. Zero fields are unset; a zero `align` means the
/// arena quantum.
///
/// A successful placement `p` satisfies `p ≡ phase (mod align)`,
/// `minaddr ≤ p`, `p + size ≤ maxaddr` (when set), and `[p, p + size)`
/// does not cross a `nocross` boundary (when set).
#[derive(Clone, Copy, Debug, Default)]
pub struct Constraints {
    pub align: usize,
    pub phase: usize,
    pub nocross: usize,
    pub minaddr: usize,
    pub maxaddr: usize,
}

impl Constraints {
    /// Alignment-only constraints.
    pub const fn aligned(align: usize) -> Self {
        Self {
            align,
            phase: 0,
            nocross: 0,
            minaddr: 0,
            maxaddr: 0,
        }
    }

    /// Validates against the arena's quantum and resolves defaults.
    /// Violations are caller bugs and panic.
    pub(crate) fn resolve(&self, quantum: usize, size: usize) -> (usize, usize, usize) {
        let align = if self.align == 0 {
            quantum.next_power_of_two()
        } else {
            self.align
        };
        assert!(align.is_power_of_two(), "xalloc: align must be a power of two");
        assert!(
            align % quantum == 0 || quantum % align == 0,
            "xalloc: align not quantum-aligned"
        );
        assert!(self.phase % quantum == 0, "xalloc: phase not quantum-aligned");
        assert!(self.phase < align, "xalloc: phase must be below align");
        if self.nocross != 0 {
            assert!(
                self.nocross.is_power_of_two(),
                "xalloc: nocross must be a power of two"
            );
            assert!(
                self.nocross >= size,
                "xalloc: request cannot avoid crossing a smaller boundary"
            );
        }
        if self.maxaddr != 0 {
            assert!(self.minaddr < self.maxaddr, "xalloc: empty address window");
        }
        (align, self.phase, self.nocross)
    }

    /// Window or boundary constraints forbid importing: a blind import
    /// cannot be steered to land inside them.
    pub(crate) fn forbids_import(&self) -> bool {
        self.nocross != 0 || self.minaddr != 0 || self.maxaddr != 0
    }
}

/// First boundary strictly after `p`.
fn next_boundary(p: usize, nocross: usize) -> usize {
    (p / nocross + 1).saturating_mul(nocross)
}

/// First address at or above `lo` congruent to `phase` mod `align`.
fn align_up_phase(lo: usize, align: usize, phase: usize) -> Option<usize> {
    let r = lo % align;
    let base = lo - r;
    if r <= phase {
        base.checked_add(phase)
    } else {
        base.checked_add(align)?.checked_add(phase)
    }
}

/// Tests one free segment `[bt_start, bt_start + bt_size)` for a placement
/// of `size` bytes. `minaddr`/`maxaddr` of zero are unset. Returns the
/// placement address.
pub(crate) fn fit(
    bt_start: usize,
    bt_size: usize,
    size: usize,
    align: usize,
    phase: usize,
    nocross: usize,
    minaddr: usize,
    maxaddr: usize,
) -> Option<usize> {
    let bt_end = bt_start + bt_size;
    let limit = if maxaddr == 0 { usize::MAX } else { maxaddr };

    let p = align_up_phase(bt_start.max(minaddr), align, phase)?;
    let end = p.checked_add(size)?;
    if end > bt_end || end > limit {
        return None;
    }
    if nocross == 0 || next_boundary(p, nocross) >= end {
        return Some(p);
    }

    // The first candidate crosses; the only other viable placement in this
    // segment starts at the boundary it ran into.
    let p2 = align_up_phase(next_boundary(p, nocross), align, phase)?;
    let end2 = p2.checked_add(size)?;
    if end2 > bt_end || end2 > limit {
        return None;
    }
    if next_boundary(p2, nocross) < end2 {
        // phase + size straddle every boundary; no segment can satisfy this.
        return None;
    }
    Some(p2)
}

/// Ordered walk of the segment tree, used when an address window is in
/// play. Starts at the last tag at or below `minaddr` so a straddling free
/// segment is still considered, and stops once starts run past the window.
pub(crate) fn tree_search(
    pool: &TagPool,
    index: &SegIndex,
    size: usize,
    align: usize,
    phase: usize,
    nocross: usize,
    minaddr: usize,
    maxaddr: usize,
) -> Option<(TagId, usize)> {
    let limit = if maxaddr == 0 { usize::MAX } else { maxaddr };
    let start_key = index
        .all
        .range(..=SegKey::seg(minaddr))
        .next_back()
        .map(|(k, _)| *k);

    let iter: Box<dyn Iterator<Item = (&SegKey, &TagId)> + '_> = match start_key {
        Some(k) => Box::new(index.all.range(k..)),
        None => Box::new(index.all.iter()),
    };

    for (_, &id) in iter {
        let t = &pool[id];
        if t.start.saturating_add(size) > limit {
            break;
        }
        if t.state != TagState::Free {
            continue;
        }
        if let Some(p) = fit(t.start, t.size, size, align, phase, nocross, minaddr, maxaddr) {
            return Some((id, p));
        }
    }
    None
}

/// Free-list bucket scan for windowless constrained requests. The probe
/// class covers the aligned request; instant-style starts one class higher
/// so the first candidate is likely to fit without draining a bucket.
pub(crate) fn bucket_search(
    pool: &TagPool,
    index: &SegIndex,
    size: usize,
    align: usize,
    phase: usize,
    nocross: usize,
    instant: bool,
) -> Option<(TagId, usize)> {
    let aligned = size
        .checked_add(align - 1)
        .expect("size arithmetic overflow")
        & !(align - 1);
    let probe = aligned.checked_add(phase).expect("size arithmetic overflow");
    let mut class = size_class(probe);
    if instant {
        class = (class + 1).min(NR_FREE_LISTS - 1);
    }

    for c in class..NR_FREE_LISTS {
        for id in index.freelist_iter(pool, c) {
            let t = &pool[id];
            if let Some(p) = fit(t.start, t.size, size, align, phase, nocross, 0, 0) {
                return Some((id, p));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_align_phase() {
        // Segment [0x1000, 0x5000): 0x1000-aligned with phase 0x40 lands at
        // 0x1040.
        assert_eq!(
            fit(0x1000, 0x4000, 0x100, 0x1000, 0x40, 0, 0, 0),
            Some(0x1040)
        );
    }

    #[test]
    fn fit_rejects_window_overflow() {
        assert_eq!(fit(0x1000, 0x1000, 0x100, 1, 0, 0, 0, 0x10ff), None);
        assert_eq!(fit(0x1000, 0x1000, 0x100, 1, 0, 0, 0, 0x1100), Some(0x1000));
        assert_eq!(fit(0x1000, 0x1000, 0x100, 1, 0, 0, 0x1f00, 0), Some(0x1f00));
        assert_eq!(fit(0x1000, 0x1000, 0x100, 1, 0, 0, 0x1f01, 0), None);
    }

    #[test]
    fn fit_nocross_steps_to_boundary() {
        // [0x800, 0x2800): a 0x800 request abuts the boundary exactly and
        // stays put.
        assert_eq!(fit(0x800, 0x2000, 0x800, 0x100, 0, 0x1000, 0, 0), Some(0x800));
        // A 0x900 request crosses from 0x800 and must move up to 0x1000.
        assert_eq!(
            fit(0x800, 0x2000, 0x900, 0x100, 0, 0x1000, 0, 0),
            Some(0x1000)
        );
    }

    #[test]
    fn fit_boundary_start_is_not_a_cross() {
        assert_eq!(fit(0x1000, 0x1000, 0x800, 0x100, 0, 0x1000, 0, 0), Some(0x1000));
    }

    #[test]
    fn fit_phase_plus_size_past_boundary_fails() {
        // phase 0x80 with size 0x1000 == nocross always straddles.
        assert_eq!(
            fit(0x0, 0x4000, 0x1000, 0x100, 0x80, 0x1000, 0, 0),
            None
        );
    }
}

//! Accounting snapshots for diagnostics.

use core::fmt;

use serde::Serialize;

/// Point-in-time accounting for one arena, taken under its lock.
#[derive(Clone, Debug, Serialize)]
pub struct ArenaStats {
    pub name: &'static str,
    pub quantum: usize,
    pub is_base: bool,
    pub amt_total_segs: usize,
    pub amt_alloc_segs: usize,
    pub amt_free: usize,
    pub nr_allocs: usize,
    pub nr_unused_tags: usize,
    pub tag_capacity: usize,
    /// (size class, number of free segments in that class); empty classes
    /// are omitted.
    pub free_segs_by_class: Vec<ClassCount>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct ClassCount {
    pub class: u32,
    pub count: usize,
}

impl ArenaStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("arena stats serialize")
    }
}

impl fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Arena {}: quantum {:#x}{}",
            self.name,
            self.quantum,
            if self.is_base { ", base" } else { "" }
        )?;
        writeln!(
            f,
            "\ttotal {:#x}, alloc {:#x}, free {:#x}, {} allocations",
            self.amt_total_segs, self.amt_alloc_segs, self.amt_free, self.nr_allocs
        )?;
        writeln!(
            f,
            "\ttags: {} unused of {}",
            self.nr_unused_tags, self.tag_capacity
        )?;
        for cc in &self.free_segs_by_class {
            writeln!(f, "\tclass {:>2}: {} free segs", cc.class, cc.count)?;
        }
        Ok(())
    }
}

use crate::utils::align_up_u64;
use std::collections::BTreeMap;
use tracing::warn;

/// Hands out GPU virtual address ranges for host-backed buffers.
///
/// Each range is followed by `guard` unmapped bytes so an instruction
/// prefetch running off the end of one buffer never lands in the next.
#[derive(Debug)]
pub struct Aperture {
    base: u64,
    limit: u64,
    align: u64,
    guard: u64,

    // start -> reserved length (guard included)
    ranges: BTreeMap<u64, u64>,
}

impl Aperture {
    #[must_use]
    pub fn new(base: u64, limit: u64, align: u64, guard: u64) -> Self {
        Self {
            base,
            limit,
            align: align.max(1),
            guard,
            ranges: BTreeMap::new(),
        }
    }

    /// First-fit search for a hole of `size` bytes.
    pub fn reserve(&mut self, size: usize, align: usize) -> Option<u64> {
        let align = (align as u64).max(self.align);
        let needed = size as u64 + self.guard;
        let mut cursor = align_up_u64(self.base, align);

        for (&start, &len) in &self.ranges {
            if start >= cursor && start - cursor >= needed {
                break;
            }
            cursor = cursor.max(align_up_u64(start + len, align));
        }

        if cursor.checked_add(needed)? > self.limit {
            return None;
        }
        self.ranges.insert(cursor, needed);
        Some(cursor)
    }

    pub fn release(&mut self, addr: u64) {
        if self.ranges.remove(&addr).is_none() {
            warn!(addr = format_args!("{addr:#x}"), "release of untracked GPU VA");
        }
    }

    #[must_use]
    pub fn reserved_ranges(&self) -> usize {
        self.ranges.len()
    }
}

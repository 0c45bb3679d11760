#![allow(clippy::cast_possible_truncation)]

pub const PAGE_SIZE: usize = 4096;

/// Rounds `val` up to a multiple of `align`. `align` of 0 or 1 is a no-op.
#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    if align <= 1 {
        return val;
    }
    val.div_ceil(align) * align
}

#[must_use]
pub const fn align_up_u64(val: u64, align: u64) -> u64 {
    if align <= 1 {
        return val;
    }
    val.div_ceil(align) * align
}

#[must_use]
pub const fn align_up_u32(val: u32, align: u32) -> u32 {
    align_up(val as usize, align as usize) as u32
}

#[must_use]
pub const fn page_align(val: usize) -> usize {
    align_up(val, PAGE_SIZE)
}

#[must_use]
pub const fn is_aligned(val: usize, align: usize) -> bool {
    align <= 1 || val % align == 0
}

/// Smallest power of two multiple of `granularity` that is `>= size`.
#[must_use]
pub const fn pow2_granular(size: usize, granularity: usize) -> usize {
    let mut v = if granularity == 0 { 1 } else { granularity };
    while v < size {
        v <<= 1;
    }
    v
}

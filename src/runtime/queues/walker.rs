//! Media-object walker programming.
//!
//! The walker iterates a kernel over a 2D thread space. Its loop registers
//! are derived from the thread space's dependency pattern; getting a stride
//! wrong makes the hardware skip or repeat threads, so the derivation is a
//! pure function tested value by value.

#![allow(clippy::cast_possible_truncation)]

use crate::error::{HeapError, HeapResult};
use smallvec::SmallVec;
use tracing::warn;

/// Inter-thread dependency a kernel declares over its thread space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DependencyPattern {
    #[default]
    None = 0,
    Wavefront = 1,
    Wavefront26 = 2,
    Vertical = 3,
    Horizontal = 4,
    Wavefront26Z = 5,
    Wavefront26X = 6,
    Wavefront26Zig = 7,
    Wavefront26ZI = 8,
}

impl DependencyPattern {
    /// `(dx, dy)` of every thread a thread waits on.
    #[must_use]
    pub const fn deltas(self) -> &'static [(i8, i8)] {
        match self {
            Self::None => &[],
            Self::Wavefront => &[(-1, 0), (-1, -1), (0, -1)],
            Self::Wavefront26 => &[(-1, 0), (-1, -1), (0, -1), (1, -1)],
            Self::Vertical => &[(-1, 0)],
            Self::Horizontal => &[(0, -1)],
            Self::Wavefront26Z | Self::Wavefront26Zig => {
                &[(-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1)]
            }
            Self::Wavefront26ZI => &[
                (-1, 1),
                (-2, 0),
                (-1, 0),
                (-1, -1),
                (0, -1),
                (1, -1),
                (1, 0),
            ],
            Self::Wavefront26X => &[
                (-1, 3),
                (-1, 1),
                (-1, -1),
                (0, -1),
                (0, -2),
                (0, -3),
                (1, -3),
            ],
        }
    }
}

/// Hardware walk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkingPattern {
    #[default]
    Default = 0,
    Wavefront = 1,
    Wavefront26 = 2,
    Vertical = 3,
    Horizontal = 4,
    Wavefront26X = 5,
    Wavefront26Zig = 6,
    Wavefront45D = 7,
    Wavefront45XD2 = 8,
    Wavefront26XAlt = 9,
    Wavefront26D = 10,
    Wavefront26XD = 11,
}

/// A classic 2D thread space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSpace {
    pub width: u32,
    pub height: u32,
    pub dependency: DependencyPattern,
    pub walk: WalkingPattern,
}

impl ThreadSpace {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            dependency: DependencyPattern::None,
            walk: WalkingPattern::Default,
        }
    }

    #[must_use]
    pub const fn with_dependency(mut self, dependency: DependencyPattern) -> Self {
        self.dependency = dependency;
        self
    }

    #[must_use]
    pub const fn with_walk(mut self, walk: WalkingPattern) -> Self {
        self.walk = walk;
        self
    }

    #[must_use]
    pub const fn thread_count(&self) -> u32 {
        self.width * self.height
    }
}

/// Unsigned register pair. Negative strides are stored as 16-bit two's
/// complement, e.g. `0xFFFF` for -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalkerParams {
    pub walk: WalkingPattern,
    pub block_resolution: Coord,
    pub local_start: Coord,
    pub local_end: Coord,
    pub local_outer_stride: Coord,
    pub local_inner_unit: Coord,
    pub local_loop_exec_count: u32,
    pub global_loop_exec_count: u32,
    pub middle_loop_extra_steps: u32,
    pub mid_loop_unit: Coord,
    pub global_resolution: Coord,
    pub global_start: Coord,
    pub global_outer_stride: Coord,
    pub global_inner_unit: Coord,
    pub use_scoreboard: bool,
    pub scoreboard_mask: u8,
}

const NEG1: u32 = 0xFFFF;
const NEG2: u32 = 0xFFFE;
const NEG4: u32 = 0xFFFC;
const UNBOUNDED_LOOP: u32 = 0x7ff;

/// Walk order the hardware must use for `space`.
#[must_use]
pub fn effective_walk(space: &ThreadSpace) -> WalkingPattern {
    match space.dependency {
        DependencyPattern::None => space.walk,
        DependencyPattern::Horizontal => WalkingPattern::Horizontal,
        DependencyPattern::Vertical => WalkingPattern::Vertical,
        DependencyPattern::Wavefront => WalkingPattern::Wavefront,
        DependencyPattern::Wavefront26 => WalkingPattern::Wavefront26,
        DependencyPattern::Wavefront26X if space.width > 1 => WalkingPattern::Wavefront26X,
        DependencyPattern::Wavefront26Zig if space.width > 2 => WalkingPattern::Wavefront26Zig,
        DependencyPattern::Wavefront26X | DependencyPattern::Wavefront26Zig => {
            WalkingPattern::Default
        }
        DependencyPattern::Wavefront26Z | DependencyPattern::Wavefront26ZI => {
            warn!(
                dependency = ?space.dependency,
                "no walker order for dependency pattern, using default"
            );
            WalkingPattern::Default
        }
    }
}

/// Whether `walk` folds a single row wider than the walker into several
/// rows. Other orders need the row to fit as is.
#[must_use]
pub const fn folds_single_row(walk: WalkingPattern) -> bool {
    matches!(walk, WalkingPattern::Default | WalkingPattern::Horizontal)
}

/// Derives the walker loop registers for `space`. `max_width` is the
/// platform's widest walker row. The scoreboard mask is left at 0 for the
/// caller to fill in.
#[must_use]
pub fn derive(space: &ThreadSpace, max_width: u32) -> WalkerParams {
    let width = space.width;
    let height = space.height;
    let thread_count = space.thread_count();
    let walk = effective_walk(space);

    let mut p = WalkerParams {
        walk,
        block_resolution: Coord::new(width, height),
        global_loop_exec_count: 1,
        use_scoreboard: true,
        ..WalkerParams::default()
    };

    let adj_height = ((height + 1) >> 1) << 1;
    let adj_width = ((width + 1) >> 1) << 1;

    match walk {
        WalkingPattern::Default | WalkingPattern::Horizontal => {
            if width == thread_count && height == 1 {
                p.block_resolution =
                    Coord::new(thread_count.min(max_width), 1 + thread_count / max_width);
            }
            p.local_loop_exec_count = p.block_resolution.y - 1;
            p.local_outer_stride = Coord::new(0, 1);
            p.local_inner_unit = Coord::new(1, 0);
            p.local_end.x = p.block_resolution.x - 1;
        }
        WalkingPattern::Wavefront => {
            p.local_loop_exec_count = width + (height - 1) - 1;
            p.local_outer_stride = Coord::new(1, 0);
            p.local_inner_unit = Coord::new(NEG1, 1);
        }
        WalkingPattern::Wavefront26 => {
            p.local_loop_exec_count = width + (height - 1) * 2 - 1;
            p.local_outer_stride = Coord::new(1, 0);
            p.local_inner_unit = Coord::new(NEG2, 1);
        }
        WalkingPattern::Wavefront26X | WalkingPattern::Wavefront26XAlt => {
            p.local_loop_exec_count = UNBOUNDED_LOOP;
            p.global_loop_exec_count = 0;
            p.local_outer_stride = Coord::new(1, 0);
            p.local_inner_unit = Coord::new(NEG2, 2);
            p.middle_loop_extra_steps = 1;
            p.mid_loop_unit = Coord::new(0, 1);
        }
        WalkingPattern::Wavefront26Zig => {
            p.local_loop_exec_count = 1;
            p.global_loop_exec_count = (adj_height / 2 - 1) * 2 + (adj_width / 2) - 1;
            p.local_outer_stride = Coord::new(0, 1);
            p.local_inner_unit = Coord::new(1, 0);
            p.block_resolution = Coord::new(2, 2);
            p.local_end.x = p.block_resolution.x - 1;
        }
        WalkingPattern::Vertical => {
            p.local_loop_exec_count = p.block_resolution.x - 1;
            p.local_outer_stride = Coord::new(1, 0);
            p.local_inner_unit = Coord::new(0, 1);
            p.local_end.y = p.block_resolution.y - 1;
        }
        WalkingPattern::Wavefront45D
        | WalkingPattern::Wavefront45XD2
        | WalkingPattern::Wavefront26D
        | WalkingPattern::Wavefront26XD => {
            p.local_loop_exec_count = UNBOUNDED_LOOP;
            p.global_loop_exec_count = UNBOUNDED_LOOP;
            p.local_start.x = width;
            p.local_outer_stride = Coord::new(1, 0);
            p.local_inner_unit = match walk {
                WalkingPattern::Wavefront45D => Coord::new(NEG1, 1),
                WalkingPattern::Wavefront45XD2 => Coord::new(NEG1, 2),
                WalkingPattern::Wavefront26D => Coord::new(NEG2, 1),
                _ => Coord::new(NEG2, 2),
            };
            if matches!(walk, WalkingPattern::Wavefront45XD2 | WalkingPattern::Wavefront26XD) {
                p.middle_loop_extra_steps = 1;
                p.mid_loop_unit = Coord::new(0, 1);
            }
        }
    }

    // No global loop: the global window is the block itself, except for
    // the zigzag walk which steps 2x2 blocks across the whole space.
    if walk == WalkingPattern::Wavefront26Zig {
        p.global_resolution = Coord::new(width, height);
        p.global_outer_stride = Coord::new(2, 0);
        p.global_inner_unit = Coord::new(NEG4, 2);
    } else {
        p.global_resolution = p.block_resolution;
        p.global_outer_stride = Coord::new(p.global_resolution.x, 0);
        p.global_inner_unit = Coord::new(0, p.global_resolution.y);
    }

    p
}

// ===============================================================================================
// Scoreboard
// ===============================================================================================

pub const MAX_SCOREBOARD_DELTAS: usize = 8;

/// Scoreboard programming shared by every kernel of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScoreboardConfig {
    /// Deduplicated `(dx, dy)` deltas in first-seen order, at most 8.
    pub deltas: SmallVec<[(i8, i8); 8]>,
    /// Per kernel, the deltas it depends on.
    pub kernel_masks: Vec<u8>,
    /// One bit per delta.
    pub mask: u8,
    /// Non-stalling scoreboard when any delta is in use.
    pub non_stalling: bool,
}

/// Builds the scoreboard from each kernel's dependency pattern. With
/// `shared` set a single thread space covers every kernel, and every kernel
/// takes the first one's mask.
pub fn scoreboard(patterns: &[DependencyPattern], shared: bool) -> HeapResult<ScoreboardConfig> {
    let mut cfg = ScoreboardConfig {
        kernel_masks: vec![0; patterns.len()],
        ..ScoreboardConfig::default()
    };

    let spaces = if shared { &patterns[..patterns.len().min(1)] } else { patterns };
    for (i, pattern) in spaces.iter().enumerate() {
        for &delta in pattern.deltas() {
            let bit = match cfg.deltas.iter().position(|&d| d == delta) {
                Some(bit) => bit,
                None if cfg.deltas.len() == MAX_SCOREBOARD_DELTAS => {
                    return Err(HeapError::InvalidParameter(format!(
                        "dependency patterns need more than {MAX_SCOREBOARD_DELTAS} scoreboard deltas"
                    )));
                }
                None => {
                    cfg.deltas.push(delta);
                    cfg.deltas.len() - 1
                }
            };
            cfg.kernel_masks[i] |= 1 << bit;
        }
    }

    if shared && let Some(&first) = cfg.kernel_masks.first() {
        cfg.kernel_masks.iter_mut().for_each(|m| *m = first);
    }

    cfg.mask = ((1u16 << cfg.deltas.len()) - 1) as u8;
    cfg.non_stalling = cfg.mask != 0;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_row_is_folded_into_max_width() {
        let space = ThreadSpace::new(5000, 1);
        let p = derive(&space, 2047);
        assert_eq!(p.block_resolution, Coord::new(2047, 3));
        assert_eq!(p.local_loop_exec_count, 2);
        assert_eq!(p.local_end, Coord::new(2046, 0));
        assert_eq!(p.global_resolution, p.block_resolution);
        assert_eq!(p.global_outer_stride, Coord::new(2047, 0));
        assert_eq!(p.global_inner_unit, Coord::new(0, 3));
    }

    #[test]
    fn default_two_dimensional() {
        let p = derive(&ThreadSpace::new(16, 8), 2047);
        assert_eq!(p.block_resolution, Coord::new(16, 8));
        assert_eq!(p.local_loop_exec_count, 7);
        assert_eq!(p.local_outer_stride, Coord::new(0, 1));
        assert_eq!(p.local_inner_unit, Coord::new(1, 0));
        assert_eq!(p.global_loop_exec_count, 1);
    }

    #[test]
    fn wavefront_strides() {
        let space = ThreadSpace::new(10, 4).with_dependency(DependencyPattern::Wavefront);
        let p = derive(&space, 2047);
        assert_eq!(p.walk, WalkingPattern::Wavefront);
        assert_eq!(p.local_loop_exec_count, 12);
        assert_eq!(p.local_inner_unit, Coord::new(0xFFFF, 1));

        let space = ThreadSpace::new(10, 4).with_dependency(DependencyPattern::Wavefront26);
        let p = derive(&space, 2047);
        assert_eq!(p.local_loop_exec_count, 15);
        assert_eq!(p.local_inner_unit, Coord::new(0xFFFE, 1));
    }

    #[test]
    fn zigzag_uses_two_by_two_blocks() {
        let space = ThreadSpace::new(7, 5).with_dependency(DependencyPattern::Wavefront26Zig);
        let p = derive(&space, 2047);
        assert_eq!(p.walk, WalkingPattern::Wavefront26Zig);
        assert_eq!(p.block_resolution, Coord::new(2, 2));
        // adjusted 8x6: (3 - 1) * 2 + 4 - 1
        assert_eq!(p.global_loop_exec_count, 7);
        assert_eq!(p.global_resolution, Coord::new(7, 5));
        assert_eq!(p.global_inner_unit, Coord::new(0xFFFC, 2));
        assert_eq!(p.global_outer_stride, Coord::new(2, 0));
    }

    #[test]
    fn narrow_spaces_fall_back_to_default() {
        let zig = ThreadSpace::new(2, 4).with_dependency(DependencyPattern::Wavefront26Zig);
        assert_eq!(effective_walk(&zig), WalkingPattern::Default);
        let x = ThreadSpace::new(1, 4).with_dependency(DependencyPattern::Wavefront26X);
        assert_eq!(effective_walk(&x), WalkingPattern::Default);
        let z = ThreadSpace::new(8, 4).with_dependency(DependencyPattern::Wavefront26Z);
        assert_eq!(effective_walk(&z), WalkingPattern::Default);
    }

    #[test]
    fn diagonal_walks_start_at_the_right_edge() {
        let space = ThreadSpace::new(9, 3).with_walk(WalkingPattern::Wavefront26XD);
        let p = derive(&space, 2047);
        assert_eq!(p.local_start, Coord::new(9, 0));
        assert_eq!(p.local_inner_unit, Coord::new(0xFFFE, 2));
        assert_eq!(p.middle_loop_extra_steps, 1);
        assert_eq!(p.global_loop_exec_count, 0x7ff);
    }

    #[test]
    fn scoreboard_dedups_deltas() {
        let cfg = scoreboard(
            &[DependencyPattern::Wavefront, DependencyPattern::Horizontal],
            false,
        )
        .unwrap();
        assert_eq!(cfg.deltas.len(), 3);
        assert_eq!(cfg.kernel_masks, vec![0b111, 0b100]);
        assert_eq!(cfg.mask, 0b111);
        assert!(cfg.non_stalling);

        let shared = scoreboard(&[DependencyPattern::Vertical, DependencyPattern::None], true).unwrap();
        assert_eq!(shared.kernel_masks, vec![1, 1]);

        let none = scoreboard(&[DependencyPattern::None], false).unwrap();
        assert_eq!(none.mask, 0);
        assert!(!none.non_stalling);
    }

    #[test]
    fn too_many_deltas_is_rejected() {
        let patterns = [DependencyPattern::Wavefront26X, DependencyPattern::Wavefront26ZI];
        assert!(scoreboard(&patterns, false).is_err());
    }
}

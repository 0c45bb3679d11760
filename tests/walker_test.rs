//! Integration tests for walker derivation and scoreboard programming.

use gpu_state_heap::PlatformInfo;
use gpu_state_heap::runtime::queues::walker::{
    Coord, DependencyPattern, ThreadSpace, WalkingPattern, derive, scoreboard,
};

const ALL_DEPENDENCIES: [DependencyPattern; 9] = [
    DependencyPattern::None,
    DependencyPattern::Wavefront,
    DependencyPattern::Wavefront26,
    DependencyPattern::Vertical,
    DependencyPattern::Horizontal,
    DependencyPattern::Wavefront26Z,
    DependencyPattern::Wavefront26X,
    DependencyPattern::Wavefront26Zig,
    DependencyPattern::Wavefront26ZI,
];

#[test]
fn derivation_is_pure() {
    for dependency in ALL_DEPENDENCIES {
        for (w, h) in [(1, 1), (3, 2), (16, 9), (640, 360)] {
            let space = ThreadSpace::new(w, h).with_dependency(dependency);
            assert_eq!(derive(&space, 2047), derive(&space, 2047), "{dependency:?} {w}x{h}");
        }
    }
}

#[test]
fn single_row_is_clamped_to_platform_width() {
    for platform in [PlatformInfo::default(), PlatformInfo::legacy()] {
        let max = platform.walker_max_width;
        for count in [1, max - 1, max, max + 1, 3 * max + 7] {
            let p = derive(&ThreadSpace::new(count, 1), max);
            assert_eq!(p.block_resolution, Coord::new(count.min(max), 1 + count / max));
            assert_eq!(p.walk, WalkingPattern::Default);
        }
    }
}

#[test]
fn dependency_selects_walk_order() {
    let walk = |dep, w| derive(&ThreadSpace::new(w, 4).with_dependency(dep), 2047).walk;
    assert_eq!(walk(DependencyPattern::Horizontal, 8), WalkingPattern::Horizontal);
    assert_eq!(walk(DependencyPattern::Vertical, 8), WalkingPattern::Vertical);
    assert_eq!(walk(DependencyPattern::Wavefront26X, 8), WalkingPattern::Wavefront26X);
    assert_eq!(walk(DependencyPattern::Wavefront26X, 1), WalkingPattern::Default);
    assert_eq!(walk(DependencyPattern::Wavefront26Zig, 2), WalkingPattern::Default);
    assert_eq!(walk(DependencyPattern::Wavefront26ZI, 8), WalkingPattern::Default);

    let requested = ThreadSpace::new(8, 4).with_walk(WalkingPattern::Wavefront45D);
    assert_eq!(derive(&requested, 2047).walk, WalkingPattern::Wavefront45D);
}

#[test]
fn shared_space_gives_every_kernel_the_full_mask() {
    let cfg = scoreboard(
        &[DependencyPattern::Wavefront26, DependencyPattern::None],
        true,
    )
    .unwrap();
    assert_eq!(cfg.deltas.len(), 4);
    assert_eq!(cfg.mask, 0b1111);
    assert_eq!(cfg.kernel_masks, vec![0b1111, 0b1111]);
    assert!(cfg.non_stalling);

    let none = scoreboard(&[DependencyPattern::None], false).unwrap();
    assert_eq!(none.mask, 0);
    assert!(!none.non_stalling);
}

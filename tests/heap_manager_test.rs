//! Integration tests for heap acquisition, extension and tracker-gated reuse.

use std::sync::Arc;
use std::time::Duration;

use gpu_state_heap::runtime::heap::BlockState;
use gpu_state_heap::{
    AcquireParams, Behavior, FrameTrackerProducer, FrameTrackerToken, HeapError, HeapManager,
    HostDevice, MemoryBlock,
};

const KB: usize = 1024;

fn manager(
    behavior: Behavior,
    initial: usize,
    extend: usize,
) -> (Arc<HostDevice>, HeapManager, Arc<FrameTrackerProducer>) {
    let dev = Arc::new(HostDevice::new());
    let mut mgr = HeapManager::new(dev.clone(), "test");
    mgr.set_default_behavior(behavior).unwrap();
    mgr.set_initial_heap_size(initial).unwrap();
    if behavior != Behavior::Wait {
        mgr.set_extend_heap_size(extend).unwrap();
    }
    mgr.set_wait_policy(Duration::from_millis(1), Duration::from_millis(5));
    let producer = Arc::new(FrameTrackerProducer::new(2));
    mgr.register_tracker_producer(producer.clone());
    (dev, mgr, producer)
}

fn overlaps(a: &MemoryBlock, b: &MemoryBlock) -> bool {
    a.heap_id() == b.heap_id()
        && a.offset() < b.offset() + b.size()
        && b.offset() < a.offset() + a.size()
}

// === Extend behavior ===

#[test]
fn extend_never_hands_out_overlapping_blocks() {
    let (_dev, mut mgr, _) = manager(Behavior::Extend, 16 * KB, 16 * KB);
    let sizes = [3000, 700, 9000, 64, 12_000, 5000, 4096, 1, 15_000, 2500];
    let mut live: Vec<MemoryBlock> = Vec::new();

    for round in 0..4 {
        for (i, &size) in sizes.iter().enumerate() {
            let params = AcquireParams::new(vec![size, size / 2 + 1]);
            let blocks = mgr.acquire_space(&params).unwrap();
            mgr.submit_blocks(&blocks).unwrap();
            live.extend(blocks);

            let used: usize = live.iter().map(MemoryBlock::size).sum();
            assert!(used <= mgr.total_heap_size(), "round {round} step {i}");
        }
    }

    for (i, a) in live.iter().enumerate() {
        for b in &live[i + 1..] {
            assert!(!overlaps(a, b), "{a:?} overlaps {b:?}");
        }
    }
    assert!(mgr.extension_count() > 0);
}

#[test]
fn destructive_extend_grows_once_and_retires_original() {
    let (dev, mut mgr, _) = manager(Behavior::DestructiveExtend, 512 * KB, 512 * KB);
    let blocks = mgr
        .acquire_space(&AcquireParams::new(vec![600 * KB]))
        .unwrap();

    assert_eq!(mgr.extension_count(), 1);
    assert_eq!(mgr.current_heap_size(), 1024 * KB);
    assert_eq!(blocks[0].size(), 600 * KB);
    assert_eq!(mgr.active_heap_ids(), vec![blocks[0].heap_id()]);

    mgr.refresh();
    assert_eq!(mgr.heap_count(), 1);
    assert_eq!(dev.live_allocations(), 1);
}

#[test]
fn extension_grows_in_whole_steps() {
    let (_dev, mut mgr, _) = manager(Behavior::Extend, 16 * KB, 16 * KB);
    mgr.acquire_space(&AcquireParams::new(vec![4 * KB])).unwrap();

    // 16K + 16K is short of 40K; one more step covers it
    let blocks = mgr
        .acquire_space(&AcquireParams::new(vec![40 * KB]))
        .unwrap();
    assert_eq!(mgr.extension_count(), 1);
    assert_eq!(mgr.current_heap_size(), 48 * KB);
    assert_eq!(mgr.heap_count(), 2);
    assert_eq!(blocks[0].offset(), 0);
}

#[test]
fn wait_reports_no_space_until_gpu_catches_up() {
    let (_dev, mut mgr, producer) = manager(Behavior::Wait, 64 * KB, 0);
    let first = mgr
        .acquire_space(&AcquireParams::new(vec![48 * KB]))
        .unwrap();
    mgr.submit_blocks(&first).unwrap();
    let value = producer.next_tracker(0).unwrap();
    producer.step_forward(0).unwrap();

    let params = AcquireParams::new(vec![48 * KB]);
    assert!(matches!(
        mgr.acquire_space(&params),
        Err(HeapError::NoSpace { .. })
    ));

    producer.counter(0).unwrap().store(value);
    let second = mgr.acquire_space(&params).unwrap();
    assert_eq!(second[0].heap_id(), first[0].heap_id());
    assert_eq!(first[0].state(), BlockState::Free);
}

// === Tracker monotonicity ===

#[test]
fn token_expires_exactly_when_counter_passes() {
    let producer = Arc::new(FrameTrackerProducer::new(1));
    let index = producer.assign_index().unwrap();
    let counter = producer.counter(index).unwrap();

    let mut tokens = Vec::new();
    for _ in 0..5 {
        let value = producer.next_tracker(index).unwrap();
        tokens.push((value, FrameTrackerToken::from_producer(producer.clone(), index, value)));
        producer.step_forward(index).unwrap();
    }

    for step in 1..=5u32 {
        counter.store(step);
        for (value, token) in &tokens {
            assert_eq!(token.is_expired(), *value <= step, "value {value} at {step}");
        }
    }
}

#[test]
fn client_controlled_static_block_is_freed_only_by_clear_space() {
    let (_dev, mut mgr, producer) = manager(Behavior::ClientControlled, 8 * KB, 8 * KB);
    let params = AcquireParams::new(vec![8 * KB]).static_block();
    let block = mgr.acquire_space(&params).unwrap().remove(0);
    mgr.submit_blocks(std::slice::from_ref(&block)).unwrap();

    // completing every submission does not release a static block
    let value = producer.next_tracker(0).unwrap();
    producer.counter(0).unwrap().store(value);
    mgr.refresh();
    assert!(mgr.acquire_space(&params).is_err());

    mgr.clear_space(&block).unwrap();
    assert!(mgr.acquire_space(&params).is_ok());
}

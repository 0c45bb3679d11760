use super::block::{BlockShared, BlockState, HeapMemory, MemoryBlock};
use crate::error::{HeapError, HeapResult};
use crate::utils::align_up;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
struct BlockRecord {
    size: usize,
    is_static: bool,
    shared: Arc<BlockShared>,
}

impl BlockRecord {
    fn free(size: usize) -> Self {
        Self {
            size,
            is_static: false,
            shared: BlockShared::new(BlockState::Free, 0, 0),
        }
    }

    fn state(&self) -> BlockState {
        self.shared.state()
    }
}

#[derive(Debug)]
struct HeapEntry {
    memory: Arc<HeapMemory>,
    // offset -> record; records tile the heap without gaps
    blocks: BTreeMap<usize, BlockRecord>,
    retired: bool,
}

impl HeapEntry {
    fn new(memory: Arc<HeapMemory>) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(0, BlockRecord::free(memory.size()));
        Self {
            memory,
            blocks,
            retired: false,
        }
    }

    fn is_idle(&self) -> bool {
        self.blocks.values().all(|b| b.state() == BlockState::Free)
    }

    /// Merges runs of adjacent free records.
    fn coalesce(&mut self) {
        let mut merged: BTreeMap<usize, BlockRecord> = BTreeMap::new();
        let mut run: Option<(usize, usize)> = None;
        for (offset, record) in std::mem::take(&mut self.blocks) {
            if record.state() == BlockState::Free {
                run = Some(match run {
                    Some((start, size)) => (start, size + record.size),
                    None => (offset, record.size),
                });
                continue;
            }
            if let Some((start, size)) = run.take() {
                merged.insert(start, BlockRecord::free(size));
            }
            merged.insert(offset, record);
        }
        if let Some((start, size)) = run {
            merged.insert(start, BlockRecord::free(size));
        }
        self.blocks = merged;
    }
}

/// Where one requested block will land.
#[derive(Debug, Clone, Copy)]
struct Placement {
    request: usize,
    heap_slot: usize,
    start: usize,
    size: usize,
}

/// Sub-allocation bookkeeping over a FIFO of heaps.
#[derive(Debug, Default)]
pub struct BlockManager {
    heaps: Vec<HeapEntry>,
}

impl BlockManager {
    #[must_use]
    pub const fn new() -> Self {
        Self { heaps: Vec::new() }
    }

    pub fn add_heap(&mut self, memory: Arc<HeapMemory>) {
        self.heaps.push(HeapEntry::new(memory));
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    #[must_use]
    pub fn active_heap_ids(&self) -> Vec<u32> {
        self.heaps
            .iter()
            .filter(|h| !h.retired)
            .map(|h| h.memory.id())
            .collect()
    }

    #[must_use]
    pub fn heap_ids(&self) -> Vec<u32> {
        self.heaps.iter().map(|h| h.memory.id()).collect()
    }

    #[must_use]
    pub fn total_size(&self) -> usize {
        self.heaps.iter().map(|h| h.memory.size()).sum()
    }

    /// Bytes held by blocks that are not free.
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.heaps
            .iter()
            .flat_map(|h| h.blocks.values())
            .filter(|b| b.state() != BlockState::Free)
            .map(|b| b.size)
            .sum()
    }

    /// Bytes `acquire` would consume for `sizes`.
    #[must_use]
    pub fn space_needed(sizes: &[usize], alignment: usize) -> usize {
        sizes.iter().map(|s| align_up(*s, alignment)).sum()
    }

    #[must_use]
    pub fn can_acquire(&self, sizes: &[usize], alignment: usize) -> bool {
        self.plan(sizes, alignment).is_some()
    }

    /// Places every size or none. Larger requests are placed first, each in
    /// the smallest free record of an active heap that holds it.
    pub fn acquire(
        &mut self,
        sizes: &[usize],
        alignment: usize,
        is_static: bool,
        tracker_index: u32,
        tracker_id: u32,
    ) -> HeapResult<Vec<MemoryBlock>> {
        let Some(plan) = self.plan(sizes, alignment) else {
            return Err(HeapError::NoSpace {
                needed: Self::space_needed(sizes, alignment),
            });
        };

        let mut out: Vec<Option<MemoryBlock>> = vec![None; sizes.len()];
        for p in plan {
            let heap = &mut self.heaps[p.heap_slot];
            let record_offset = heap
                .blocks
                .range(..=p.start)
                .next_back()
                .filter(|(off, r)| {
                    r.state() == BlockState::Free && **off + r.size >= p.start + p.size
                })
                .map(|(off, _)| *off)
                .ok_or_else(|| HeapError::InvalidState("planned range not free".into()))?;
            let Some(free) = heap.blocks.remove(&record_offset) else {
                return Err(HeapError::InvalidState("planned record vanished".into()));
            };
            let head = p.start - record_offset;
            let tail = free.size - head - p.size;
            if head > 0 {
                heap.blocks.insert(record_offset, BlockRecord::free(head));
            }
            if tail > 0 {
                heap.blocks
                    .insert(p.start + p.size, BlockRecord::free(tail));
            }
            let shared = BlockShared::new(BlockState::Acquired, tracker_index, tracker_id);
            heap.blocks.insert(
                p.start,
                BlockRecord {
                    size: p.size,
                    is_static,
                    shared: shared.clone(),
                },
            );
            trace!(heap = heap.memory.id(), offset = p.start, size = p.size, "block acquired");
            out[p.request] = Some(MemoryBlock::new(
                heap.memory.clone(),
                p.start,
                p.size,
                is_static,
                shared,
            ));
        }
        Ok(out.into_iter().flatten().collect())
    }

    fn plan(&self, sizes: &[usize], alignment: usize) -> Option<Vec<Placement>> {
        // free extents as (heap slot, start, end)
        let mut extents: Vec<(usize, usize, usize)> = self
            .heaps
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.retired)
            .flat_map(|(slot, h)| {
                h.blocks
                    .iter()
                    .filter(|(_, b)| b.state() == BlockState::Free)
                    .map(move |(off, b)| (slot, *off, off + b.size))
            })
            .collect();

        let mut order: Vec<usize> = (0..sizes.len()).collect();
        order.sort_by(|a, b| sizes[*b].cmp(&sizes[*a]));

        let mut plan = Vec::with_capacity(sizes.len());
        for request in order {
            let size = align_up(sizes[request].max(1), alignment);
            let best = extents
                .iter()
                .enumerate()
                .filter_map(|(i, &(_, start, end))| {
                    let aligned = align_up(start, alignment);
                    (aligned + size <= end).then_some((i, end - start))
                })
                .min_by_key(|&(_, len)| len)
                .map(|(i, _)| i)?;

            let (heap_slot, start, end) = extents[best];
            let aligned = align_up(start, alignment);
            plan.push(Placement {
                request,
                heap_slot,
                start: aligned,
                size,
            });

            // the alignment gap in front stays free but too small to matter
            extents.swap_remove(best);
            if aligned + size < end {
                extents.push((heap_slot, aligned + size, end));
            }
        }
        Some(plan)
    }

    /// Marks acquired blocks submitted. Static blocks keep no token.
    pub fn submit(
        &mut self,
        block: &MemoryBlock,
        token: crate::runtime::tracker::FrameTrackerToken,
    ) -> HeapResult<()> {
        let (retired, record) = self.find(block)?;
        let state = record.state();
        if state != BlockState::Acquired {
            debug_assert!(false, "submit of block in state {state:?}");
            return Err(HeapError::InvalidState(format!(
                "submit of block in state {state:?}"
            )));
        }
        if !record.is_static {
            record.shared.set_token(token);
        }
        record.shared.set_state(if retired && !record.is_static {
            BlockState::PendingFree
        } else {
            BlockState::Submitted
        });
        Ok(())
    }

    /// Returns a block to the free pool without consulting its tracker.
    pub fn release(&mut self, block: &MemoryBlock) -> HeapResult<()> {
        let slot = self.slot_of(block.heap_id())?;
        {
            let (_, record) = self.find(block)?;
            if record.state() == BlockState::Free {
                debug_assert!(false, "double free of block");
                return Err(HeapError::InvalidState("double free of block".into()));
            }
            record.shared.set_state(BlockState::Free);
        }
        self.heaps[slot].coalesce();
        trace!(heap = block.heap_id(), offset = block.offset(), "block released");
        Ok(())
    }

    /// Frees blocks whose tokens expired and drops idle retired heaps, oldest
    /// first. Returns the number of blocks freed.
    pub fn refresh(&mut self) -> usize {
        let mut freed = 0;
        for heap in &mut self.heaps {
            let mut changed = false;
            for record in heap.blocks.values() {
                let state = record.state();
                let gated = matches!(state, BlockState::Submitted | BlockState::PendingFree);
                if gated && !record.is_static && record.shared.token().is_expired() {
                    record.shared.set_state(BlockState::Free);
                    changed = true;
                    freed += 1;
                }
            }
            if changed {
                heap.coalesce();
            }
        }

        while let Some(pos) = self.heaps.iter().position(|h| h.retired) {
            if !self.heaps[pos].is_idle() {
                break;
            }
            let entry = self.heaps.remove(pos);
            debug!(heap = entry.memory.id(), "retired heap destroyed");
        }
        freed
    }

    /// Stops placing new blocks in the oldest active heap. Its outstanding
    /// submitted blocks become pending-free.
    pub fn retire_oldest(&mut self) -> Option<u32> {
        let heap = self.heaps.iter_mut().find(|h| !h.retired)?;
        heap.retired = true;
        for record in heap.blocks.values() {
            if record.state() == BlockState::Submitted && !record.is_static {
                record.shared.set_state(BlockState::PendingFree);
            }
        }
        debug!(heap = heap.memory.id(), "heap retired");
        Some(heap.memory.id())
    }

    fn slot_of(&self, heap_id: u32) -> HeapResult<usize> {
        self.heaps
            .iter()
            .position(|h| h.memory.id() == heap_id)
            .ok_or(HeapError::UnknownHeap(heap_id))
    }

    fn find(&self, block: &MemoryBlock) -> HeapResult<(bool, &BlockRecord)> {
        let slot = self.slot_of(block.heap_id())?;
        let heap = &self.heaps[slot];
        let record = heap
            .blocks
            .get(&block.offset())
            .filter(|r| Arc::ptr_eq(&r.shared, &block.shared))
            .ok_or_else(|| {
                HeapError::InvalidState(format!(
                    "stale block handle at {} of heap {}",
                    block.offset(),
                    block.heap_id()
                ))
            })?;
        Ok((heap.retired, record))
    }
}

use super::Behavior;
use super::block::{HeapMemory, MemoryBlock};
use super::block_manager::BlockManager;
use crate::error::{HeapError, HeapResult};
use crate::os::OsInterface;
use crate::runtime::tracker::{FrameTrackerProducer, FrameTrackerToken, TrackerCounter};
use crate::utils::page_align;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Arguments of [`HeapManager::acquire_space`].
#[derive(Debug, Clone)]
pub struct AcquireParams {
    pub block_sizes: Vec<usize>,
    pub alignment: usize,
    /// Producer slot the blocks are tracked on.
    pub tracker_index: u32,
    /// Completion value when tracking against a raw counter.
    pub tracker_id: u32,
    pub zero_assigned: bool,
    pub static_block: bool,
}

impl AcquireParams {
    #[must_use]
    pub fn new(block_sizes: Vec<usize>) -> Self {
        Self {
            block_sizes,
            alignment: 64,
            tracker_index: 0,
            tracker_id: 0,
            zero_assigned: false,
            static_block: false,
        }
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn with_tracker_index(mut self, index: u32) -> Self {
        self.tracker_index = index;
        self
    }

    #[must_use]
    pub const fn with_tracker_id(mut self, id: u32) -> Self {
        self.tracker_id = id;
        self
    }

    #[must_use]
    pub const fn zeroed(mut self) -> Self {
        self.zero_assigned = true;
        self
    }

    #[must_use]
    pub const fn static_block(mut self) -> Self {
        self.static_block = true;
        self
    }
}

/// Owns a FIFO of heaps and hands out tracker-gated blocks from them.
#[derive(Debug)]
pub struct HeapManager {
    os: Arc<dyn OsInterface>,
    name: String,
    behavior: Behavior,
    initial_size: usize,
    extend_size: usize,
    /// Size of the newest heap; grows with each extension.
    curr_size: usize,
    keep_locked: bool,
    hw_write_only: bool,
    wait_step: Duration,
    wait_timeout: Duration,
    producer: Option<Arc<FrameTrackerProducer>>,
    counter: Option<TrackerCounter>,
    blocks: BlockManager,
    next_heap_id: u32,
    extensions: u32,
}

impl HeapManager {
    #[must_use]
    pub fn new(os: Arc<dyn OsInterface>, name: &str) -> Self {
        Self {
            os,
            name: name.to_string(),
            behavior: Behavior::default(),
            initial_size: 0,
            extend_size: 0,
            curr_size: 0,
            keep_locked: false,
            hw_write_only: false,
            wait_step: Duration::from_millis(10),
            wait_timeout: Duration::from_millis(100),
            producer: None,
            counter: None,
            blocks: BlockManager::new(),
            next_heap_id: 1,
            extensions: 0,
        }
    }

    // ===========================================================================================
    // Configuration
    // ===========================================================================================

    pub fn set_default_behavior(&mut self, behavior: Behavior) -> HeapResult<()> {
        if !behavior.extends() && self.extend_size > 0 {
            debug!(heap = %self.name, %behavior, "extend size ignored by behavior");
        }
        self.behavior = behavior;
        Ok(())
    }

    pub fn set_initial_heap_size(&mut self, size: usize) -> HeapResult<()> {
        if size == 0 {
            return Err(HeapError::InvalidParameter(
                "initial heap size must be non-zero".into(),
            ));
        }
        if self.blocks.heap_count() > 0 {
            return Err(HeapError::InvalidState(
                "initial heap size set after first allocation".into(),
            ));
        }
        self.initial_size = size;
        Ok(())
    }

    pub fn set_extend_heap_size(&mut self, size: usize) -> HeapResult<()> {
        if size == 0 {
            return Err(HeapError::InvalidParameter(
                "extend heap size must be non-zero".into(),
            ));
        }
        if self.behavior == Behavior::Wait {
            return Err(HeapError::InvalidParameter(
                "extend heap size is meaningless under the wait behavior".into(),
            ));
        }
        self.extend_size = size;
        Ok(())
    }

    pub fn set_wait_policy(&mut self, step: Duration, timeout: Duration) {
        self.wait_step = step.max(Duration::from_millis(1));
        self.wait_timeout = timeout;
    }

    pub const fn set_hw_write_only(&mut self, hw_write_only: bool) {
        self.hw_write_only = hw_write_only;
    }

    /// Keeps every heap CPU-mapped from allocation to destruction. Only legal
    /// before the first heap exists.
    pub fn lock_heaps_on_allocate(&mut self) -> HeapResult<()> {
        if self.blocks.heap_count() > 0 {
            return Err(HeapError::InvalidState(
                "heaps must be locked before the first allocation".into(),
            ));
        }
        self.keep_locked = true;
        Ok(())
    }

    pub fn register_tracker_producer(&mut self, producer: Arc<FrameTrackerProducer>) {
        self.producer = Some(producer);
    }

    pub fn register_tracker_resource(&mut self, counter: TrackerCounter) {
        self.counter = Some(counter);
    }

    #[must_use]
    pub const fn behavior(&self) -> Behavior {
        self.behavior
    }

    #[must_use]
    pub const fn extend_heap_size(&self) -> usize {
        self.extend_size
    }

    #[must_use]
    pub const fn current_heap_size(&self) -> usize {
        self.curr_size
    }

    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.blocks.heap_count()
    }

    #[must_use]
    pub fn heap_ids(&self) -> Vec<u32> {
        self.blocks.heap_ids()
    }

    #[must_use]
    pub fn active_heap_ids(&self) -> Vec<u32> {
        self.blocks.active_heap_ids()
    }

    #[must_use]
    pub fn total_heap_size(&self) -> usize {
        self.blocks.total_size()
    }

    #[must_use]
    pub fn used_space(&self) -> usize {
        self.blocks.used_space()
    }

    /// Number of times a heap was added because the existing ones were full.
    #[must_use]
    pub const fn extension_count(&self) -> u32 {
        self.extensions
    }

    // ===========================================================================================
    // Acquisition
    // ===========================================================================================

    /// Returns one block per requested size, or `NoSpace` with the byte
    /// count that could not be satisfied.
    pub fn acquire_space(&mut self, params: &AcquireParams) -> HeapResult<Vec<MemoryBlock>> {
        self.validate(params)?;

        if self.blocks.heap_count() == 0 {
            let size = self.initial_size;
            self.allocate_heap(size)?;
        }

        match self.try_acquire(params) {
            Err(HeapError::NoSpace { .. }) => {}
            other => return other,
        }

        self.blocks.refresh();
        let needed = match self.try_acquire(params) {
            Err(HeapError::NoSpace { needed }) => needed,
            other => return other,
        };

        self.behave_when_no_space(params, needed)?;
        self.try_acquire(params)
    }

    /// Hands blocks over to the GPU. Each non-static block captures the
    /// tracker value its submission will report on completion.
    pub fn submit_blocks(&mut self, blocks: &[MemoryBlock]) -> HeapResult<()> {
        for block in blocks {
            let token = if block.is_static() {
                FrameTrackerToken::default()
            } else {
                self.token_for(block.shared.tracker_index, block.shared.tracker_id)?
            };
            self.blocks.submit(block, token)?;
        }
        Ok(())
    }

    /// Frees a client-controlled block without waiting on a tracker.
    pub fn clear_space(&mut self, block: &MemoryBlock) -> HeapResult<()> {
        if self.behavior != Behavior::ClientControlled {
            return Err(HeapError::InvalidState(format!(
                "clear_space requires clientControlled, manager is {}",
                self.behavior
            )));
        }
        self.blocks.release(block)
    }

    /// Returns blocks that were acquired but never submitted.
    pub fn release_unsubmitted(&mut self, blocks: &[MemoryBlock]) -> HeapResult<()> {
        for block in blocks {
            if block.state() != super::BlockState::Acquired {
                return Err(HeapError::InvalidState(
                    "only unsubmitted blocks can be released".into(),
                ));
            }
            self.blocks.release(block)?;
        }
        Ok(())
    }

    /// Frees submitted blocks whose command buffer was never queued, so no
    /// tracker value will ever cover them.
    pub fn withdraw_blocks(&mut self, blocks: &[MemoryBlock]) -> HeapResult<()> {
        for block in blocks {
            if !matches!(
                block.state(),
                super::BlockState::Submitted | super::BlockState::PendingFree
            ) {
                return Err(HeapError::InvalidState(
                    "only submitted blocks can be withdrawn".into(),
                ));
            }
            self.blocks.release(block)?;
        }
        Ok(())
    }

    /// Reclaims blocks whose trackers expired.
    pub fn refresh(&mut self) -> usize {
        self.blocks.refresh()
    }

    fn validate(&self, params: &AcquireParams) -> HeapResult<()> {
        if params.block_sizes.is_empty() || params.block_sizes.contains(&0) {
            return Err(HeapError::InvalidParameter(
                "block sizes must be non-empty and non-zero".into(),
            ));
        }
        if self.initial_size == 0 {
            return Err(HeapError::InvalidParameter(format!(
                "heap manager '{}' has no initial size",
                self.name
            )));
        }
        if self.behavior == Behavior::ClientControlled {
            return Ok(());
        }
        if params.static_block {
            return Err(HeapError::InvalidParameter(
                "static blocks require the clientControlled behavior".into(),
            ));
        }
        if self.producer.is_none() && self.counter.is_none() {
            return Err(HeapError::TrackerNotRegistered);
        }
        Ok(())
    }

    fn try_acquire(&mut self, params: &AcquireParams) -> HeapResult<Vec<MemoryBlock>> {
        let blocks = self.blocks.acquire(
            &params.block_sizes,
            params.alignment,
            params.static_block,
            params.tracker_index,
            params.tracker_id,
        )?;
        if params.zero_assigned
            && let Err(e) = blocks.iter().try_for_each(MemoryBlock::zero)
        {
            if let Err(release) = self.release_unsubmitted(&blocks) {
                error!(heap = %self.name, "blocks that failed zeroing were not released: {release}");
            }
            return Err(e);
        }
        Ok(blocks)
    }

    fn token_for(&self, index: u32, id: u32) -> HeapResult<FrameTrackerToken> {
        if let Some(producer) = &self.producer {
            let value = producer.next_tracker(index)?;
            return Ok(FrameTrackerToken::from_producer(
                producer.clone(),
                index,
                value,
            ));
        }
        if let Some(counter) = &self.counter {
            return Ok(FrameTrackerToken::from_counter(counter.clone(), id));
        }
        if self.behavior == Behavior::ClientControlled {
            return Ok(FrameTrackerToken::default());
        }
        Err(HeapError::TrackerNotRegistered)
    }

    fn behave_when_no_space(&mut self, params: &AcquireParams, needed: usize) -> HeapResult<()> {
        match self.behavior {
            Behavior::Wait => self.wait_for_space(params, needed),
            Behavior::Extend => self.extend(needed, false),
            Behavior::DestructiveExtend => self.extend(needed, true),
            Behavior::WaitAndExtend => match self.wait_for_space(params, needed) {
                Err(HeapError::NoSpace { .. }) => self.extend(needed, false),
                other => other,
            },
            Behavior::ClientControlled => Err(HeapError::NoSpace { needed }),
        }
    }

    fn wait_for_space(&mut self, params: &AcquireParams, needed: usize) -> HeapResult<()> {
        let start = Instant::now();
        loop {
            if self.blocks.can_acquire(&params.block_sizes, params.alignment) {
                return Ok(());
            }
            if start.elapsed() >= self.wait_timeout {
                debug!(heap = %self.name, needed, "wait for heap space timed out");
                return Err(HeapError::NoSpace { needed });
            }
            std::thread::sleep(self.wait_step);
            self.blocks.refresh();
        }
    }

    fn extend(&mut self, needed: usize, destructive: bool) -> HeapResult<()> {
        if self.extend_size == 0 {
            return Err(HeapError::InvalidParameter(format!(
                "heap manager '{}' has no extend size",
                self.name
            )));
        }
        let mut size = self.curr_size + self.extend_size;
        while size < needed {
            size += self.extend_size;
        }
        self.allocate_heap(size)?;
        self.extensions += 1;

        if destructive {
            // the new heap is the newest, so the oldest active one is never it
            if let Some(id) = self.blocks.retire_oldest() {
                info!(heap = %self.name, retired = id, new_size = self.curr_size, "heap replaced");
            }
        } else {
            info!(heap = %self.name, new_size = self.curr_size, "heap extended");
        }
        Ok(())
    }

    fn allocate_heap(&mut self, size: usize) -> HeapResult<()> {
        let size = page_align(size);
        let id = self.next_heap_id;
        let memory = HeapMemory::allocate(
            self.os.clone(),
            id,
            size,
            self.hw_write_only,
            self.keep_locked,
            &format!("{}#{id}", self.name),
        )
        .inspect_err(|e| {
            warn!(heap = %self.name, size, "heap allocation failed: {e}");
        })?;
        self.next_heap_id += 1;
        self.curr_size = size;
        self.blocks.add_heap(Arc::new(memory));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::device::HostDevice;

    const KB: usize = 1024;

    fn manager(behavior: Behavior) -> (Arc<HostDevice>, HeapManager, Arc<FrameTrackerProducer>) {
        let dev = Arc::new(HostDevice::new());
        let mut mgr = HeapManager::new(dev.clone(), "dsh");
        mgr.set_default_behavior(behavior).unwrap();
        mgr.set_initial_heap_size(512 * KB).unwrap();
        if behavior.extends() {
            mgr.set_extend_heap_size(512 * KB).unwrap();
        }
        mgr.set_wait_policy(Duration::from_millis(1), Duration::from_millis(5));
        let producer = Arc::new(FrameTrackerProducer::new(4));
        mgr.register_tracker_producer(producer.clone());
        (dev, mgr, producer)
    }

    #[test]
    fn zero_sizes_rejected() {
        let dev = Arc::new(HostDevice::new());
        let mut mgr = HeapManager::new(dev.clone(), "x");
        assert!(matches!(
            mgr.set_initial_heap_size(0),
            Err(HeapError::InvalidParameter(_))
        ));
        assert!(matches!(
            mgr.set_extend_heap_size(0),
            Err(HeapError::InvalidParameter(_))
        ));
        mgr.set_default_behavior(Behavior::Wait).unwrap();
        assert!(mgr.set_extend_heap_size(4096).is_err());
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn tracker_required() {
        let dev = Arc::new(HostDevice::new());
        let mut mgr = HeapManager::new(dev, "x");
        mgr.set_initial_heap_size(4096).unwrap();
        assert!(matches!(
            mgr.acquire_space(&AcquireParams::new(vec![64])),
            Err(HeapError::TrackerNotRegistered)
        ));
    }

    #[test]
    fn first_acquire_allocates_lazily() {
        let (dev, mut mgr, _) = manager(Behavior::Extend);
        assert_eq!(dev.live_allocations(), 0);
        let blocks = mgr.acquire_space(&AcquireParams::new(vec![100])).unwrap();
        assert_eq!(dev.live_allocations(), 1);
        assert_eq!(blocks[0].size(), 128);
    }

    #[test]
    fn destructive_extend_replaces_heap() {
        let (_dev, mut mgr, _) = manager(Behavior::DestructiveExtend);
        let blocks = mgr
            .acquire_space(&AcquireParams::new(vec![600 * KB]))
            .unwrap();
        assert_eq!(mgr.extension_count(), 1);
        assert_eq!(mgr.current_heap_size(), 1024 * KB);
        assert_eq!(mgr.active_heap_ids(), vec![2]);
        assert_eq!(blocks[0].heap_id(), 2);
        // the idle original is destroyed on the next refresh
        mgr.refresh();
        assert_eq!(mgr.heap_ids(), vec![2]);
    }

    #[test]
    fn wait_times_out_then_succeeds_after_completion() {
        let (_dev, mut mgr, producer) = manager(Behavior::Wait);
        let first = mgr
            .acquire_space(&AcquireParams::new(vec![400 * KB]))
            .unwrap();
        mgr.submit_blocks(&first).unwrap();

        let params = AcquireParams::new(vec![400 * KB]);
        assert!(matches!(
            mgr.acquire_space(&params),
            Err(HeapError::NoSpace { needed }) if needed == 400 * KB
        ));

        let value = producer.next_tracker(0).unwrap();
        producer.counter(0).unwrap().store(value);
        let second = mgr.acquire_space(&params).unwrap();
        assert_eq!(second[0].offset(), 0);
        assert_eq!(mgr.heap_count(), 1);
    }

    #[test]
    fn wait_and_extend_falls_back_to_extend() {
        let (_dev, mut mgr, _) = manager(Behavior::WaitAndExtend);
        let first = mgr
            .acquire_space(&AcquireParams::new(vec![400 * KB]))
            .unwrap();
        mgr.submit_blocks(&first).unwrap();
        let second = mgr
            .acquire_space(&AcquireParams::new(vec![400 * KB]))
            .unwrap();
        assert_ne!(first[0].heap_id(), second[0].heap_id());
        assert_eq!(mgr.heap_count(), 2);
    }

    #[test]
    fn client_controlled_uses_clear_space() {
        let dev = Arc::new(HostDevice::new());
        let mut mgr = HeapManager::new(dev, "cc");
        mgr.set_default_behavior(Behavior::ClientControlled).unwrap();
        mgr.set_initial_heap_size(8 * KB).unwrap();

        let params = AcquireParams::new(vec![8 * KB]).static_block();
        let block = mgr.acquire_space(&params).unwrap().remove(0);
        mgr.submit_blocks(std::slice::from_ref(&block)).unwrap();
        assert!(matches!(
            mgr.acquire_space(&params),
            Err(HeapError::NoSpace { .. })
        ));
        mgr.clear_space(&block).unwrap();
        assert!(mgr.acquire_space(&params).is_ok());
    }

    #[test]
    fn static_blocks_need_client_control() {
        let (_dev, mut mgr, _) = manager(Behavior::Extend);
        assert!(matches!(
            mgr.acquire_space(&AcquireParams::new(vec![64]).static_block()),
            Err(HeapError::InvalidParameter(_))
        ));
    }

    #[test]
    fn lock_heaps_only_before_allocation() {
        let (dev, mut mgr, _) = manager(Behavior::Extend);
        mgr.lock_heaps_on_allocate().unwrap();
        let block = mgr.acquire_space(&AcquireParams::new(vec![64])).unwrap();
        assert!(block[0].heap().keeps_locked());
        assert_eq!(dev.lock_count(block[0].heap().resource().handle), 1);
        assert!(mgr.lock_heaps_on_allocate().is_err());
    }

    /// Host device whose CPU mappings can be refused.
    #[derive(Debug, Default)]
    struct UnmappableDevice {
        inner: HostDevice,
        refuse_lock: std::sync::atomic::AtomicBool,
    }

    impl OsInterface for UnmappableDevice {
        fn allocate(
            &self,
            size: usize,
            flags: crate::os::AllocFlags,
            name: &str,
        ) -> HeapResult<crate::os::GpuResource> {
            self.inner.allocate(size, flags, name)
        }

        fn free(&self, resource: &crate::os::GpuResource) {
            self.inner.free(resource);
        }

        fn lock(&self, resource: &crate::os::GpuResource) -> HeapResult<*mut u8> {
            if self.refuse_lock.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(HeapError::AllocationFailed("mapping refused".into()));
            }
            self.inner.lock(resource)
        }

        fn unlock(&self, resource: &crate::os::GpuResource) {
            self.inner.unlock(resource);
        }

        fn register_resource(&self, handle: u64, write: bool) -> HeapResult<()> {
            self.inner.register_resource(handle, write)
        }

        fn submit(&self, submission: crate::os::Submission) -> HeapResult<()> {
            self.inner.submit(submission)
        }
    }

    #[test]
    fn failed_zeroing_returns_the_blocks() {
        let dev = Arc::new(UnmappableDevice::default());
        let mut mgr = HeapManager::new(dev.clone(), "zeroed");
        mgr.set_default_behavior(Behavior::ClientControlled).unwrap();
        mgr.set_initial_heap_size(64 * KB).unwrap();
        let params = AcquireParams::new(vec![4 * KB, 8 * KB]).zeroed();

        dev.refuse_lock.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            mgr.acquire_space(&params),
            Err(HeapError::AllocationFailed(_))
        ));
        assert_eq!(mgr.used_space(), 0);

        dev.refuse_lock.store(false, std::sync::atomic::Ordering::SeqCst);
        let blocks = mgr.acquire_space(&params).unwrap();
        assert_eq!(blocks[0].offset(), 0);
        assert_eq!(mgr.used_space(), 12 * KB);
    }

    #[test]
    fn withdrawn_submission_frees_at_once() {
        let (_dev, mut mgr, _) = manager(Behavior::Extend);
        let blocks = mgr.acquire_space(&AcquireParams::new(vec![1024])).unwrap();
        assert!(mgr.withdraw_blocks(&blocks).is_err());

        mgr.submit_blocks(&blocks).unwrap();
        mgr.withdraw_blocks(&blocks).unwrap();
        assert_eq!(blocks[0].state(), crate::runtime::heap::BlockState::Free);
        assert_eq!(mgr.used_space(), 0);
    }

    #[test]
    fn unsubmitted_blocks_can_be_returned() {
        let (_dev, mut mgr, _) = manager(Behavior::Extend);
        let blocks = mgr
            .acquire_space(&AcquireParams::new(vec![1024, 2048]))
            .unwrap();
        assert_eq!(mgr.used_space(), 3072);
        mgr.release_unsubmitted(&blocks).unwrap();
        assert_eq!(mgr.used_space(), 0);
    }
}

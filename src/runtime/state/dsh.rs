use super::kernel::Kernel;
use super::platform::PlatformInfo;
use crate::error::{HeapError, HeapResult};
use crate::runtime::heap::{AcquireParams, HeapManager, HeapMemory, MemoryBlock};
use crate::utils::{align_up, pow2_granular};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

// ===============================================================================================
// Layout
// ===============================================================================================

/// Per-kernel placement inside a dispatch. Sampler sub-offsets are relative
/// to the kernel's own sampler heap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelLayout {
    pub curbe_offset: usize,
    pub curbe_size: usize,
    pub sampler_heap_offset: usize,
    pub sampler_heap_size: usize,
    pub reserved_slots: u32,
    pub avs_offset: usize,
    pub samplers_avs: u32,
    pub sampler_3d_offset: usize,
    pub samplers_3d: u32,
    pub indirect_offset: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScratchLayout {
    /// Start of the region, before 1k alignment against the heap.
    pub offset: usize,
    pub size: usize,
    pub per_thread: usize,
}

/// Packed dynamic state of one dispatch; offsets are relative to the
/// dispatch's block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchLayout {
    pub kernels: Vec<KernelLayout>,
    pub curbe_offset: usize,
    pub curbe_size: usize,
    pub sampler_offset: usize,
    pub sampler_size: usize,
    pub media_id_offset: usize,
    pub media_id_size: usize,
    pub scratch: Option<ScratchLayout>,
    pub total_size: usize,
}

impl DispatchLayout {
    pub fn compute(kernels: &[Arc<Kernel>], platform: &PlatformInfo) -> HeapResult<Self> {
        if kernels.is_empty() || kernels.len() > platform.max_kernels_per_task {
            return Err(HeapError::InvalidParameter(format!(
                "dispatch of {} kernels, limit is {}",
                kernels.len(),
                platform.max_kernels_per_task
            )));
        }

        let mut layout = Self::default();

        let mut curbe = 0;
        for kernel in kernels {
            let size = align_up(kernel.curbe_size(), platform.curbe_alignment);
            layout.kernels.push(KernelLayout {
                curbe_offset: curbe,
                curbe_size: size,
                ..KernelLayout::default()
            });
            curbe += size;
        }
        layout.curbe_size = curbe;
        let mut offset = align_up(
            align_up(curbe, platform.curbe_alignment),
            platform.sampler_alignment,
        );

        layout.sampler_offset = offset;
        for (kernel, kl) in kernels.iter().zip(layout.kernels.iter_mut()) {
            Self::layout_samplers(kernel, platform, kl)?;
            kl.sampler_heap_offset = offset;
            offset += kl.sampler_heap_size;
        }
        layout.sampler_size = offset - layout.sampler_offset;

        layout.media_id_offset = offset;
        layout.media_id_size = kernels.len() * platform.interface_descriptor_size;
        offset += layout.media_id_size;

        let max_spill = kernels.iter().map(|k| k.spill_size()).max().unwrap_or(0);
        if max_spill > 0 && !platform.dedicated_scratch {
            let per_thread = pow2_granular(max_spill, platform.scratch_granularity);
            // slack lets the region start on a scratch-aligned heap offset
            let size = per_thread * platform.max_hw_threads + platform.scratch_alignment;
            layout.scratch = Some(ScratchLayout {
                offset,
                size,
                per_thread,
            });
            offset += size;
        }

        layout.total_size = offset;
        Ok(layout)
    }

    fn layout_samplers(
        kernel: &Kernel,
        platform: &PlatformInfo,
        kl: &mut KernelLayout,
    ) -> HeapResult<()> {
        let reserved = kernel.reserved_sampler_slots();
        let samplers_3d = kernel.samplers_3d();
        let samplers_avs = kernel.samplers_avs();
        if reserved + samplers_3d > platform.max_3d_samplers || samplers_avs > platform.max_avs_samplers
        {
            return Err(HeapError::InvalidParameter(format!(
                "kernel '{}' requests {} 3D and {samplers_avs} AVS samplers",
                kernel.name(),
                reserved + samplers_3d
            )));
        }

        let mut end = reserved as usize * platform.sampler_state_size;
        kl.reserved_slots = reserved;
        kl.avs_offset = end;
        kl.samplers_avs = samplers_avs;
        end += samplers_avs as usize * platform.avs_sampler_state_size;
        kl.sampler_3d_offset = end;
        kl.samplers_3d = samplers_3d;
        end += samplers_3d as usize * platform.sampler_state_size;

        let total_3d = (reserved + samplers_3d) as usize;
        if total_3d > 0 {
            kl.indirect_offset = align_up(end, platform.sampler_indirect_alignment);
            end = kl.indirect_offset + total_3d * platform.sampler_indirect_state_size;
        } else {
            kl.indirect_offset = end;
        }
        kl.sampler_heap_size = align_up(end, platform.sampler_alignment);
        Ok(())
    }
}

// ===============================================================================================
// Heap
// ===============================================================================================

/// Dynamic-state heap: one block of packed per-dispatch state per dispatch.
#[derive(Debug, Clone)]
pub struct DynamicStateHeap {
    manager: Arc<Mutex<HeapManager>>,
    platform: Arc<PlatformInfo>,
}

impl DynamicStateHeap {
    #[must_use]
    pub const fn new(manager: Arc<Mutex<HeapManager>>, platform: Arc<PlatformInfo>) -> Self {
        Self { manager, platform }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<Mutex<HeapManager>> {
        &self.manager
    }

    /// Lays out and reserves the dynamic state for `kernels`. The block is
    /// zeroed.
    pub fn allocate(
        &self,
        kernels: &[Arc<Kernel>],
        tracker_index: u32,
        tracker_id: u32,
    ) -> HeapResult<MediaState> {
        let layout = DispatchLayout::compute(kernels, &self.platform)?;

        let mut manager = self.manager.lock();
        if let Some(scratch) = &layout.scratch
            && manager.behavior().extends()
            && manager.extend_heap_size() < layout.total_size
        {
            debug!(
                scratch = scratch.size,
                total = layout.total_size,
                "raising DSH extend size for scratch"
            );
            manager.set_extend_heap_size(layout.total_size)?;
        }

        let params = AcquireParams::new(vec![layout.total_size])
            .with_alignment(self.platform.dsh_block_alignment)
            .with_tracker_index(tracker_index)
            .with_tracker_id(tracker_id)
            .zeroed();
        let mut blocks = manager.acquire_space(&params).inspect_err(|e| {
            warn!(size = layout.total_size, "dynamic state allocation failed: {e}");
        })?;
        drop(manager);

        let block = blocks
            .pop()
            .ok_or_else(|| HeapError::InvalidState("acquire returned no block".into()))?;
        let kernel_count = kernels.len();
        Ok(MediaState {
            manager: self.manager.clone(),
            platform: self.platform.clone(),
            layout,
            block: Some(block),
            next_sampler: vec![0; kernel_count],
            next_avs: vec![0; kernel_count],
            submitted: false,
        })
    }
}

// ===============================================================================================
// Media state
// ===============================================================================================

/// The dynamic state of one dispatch. Offsets returned by the accessors are
/// relative to the heap base, i.e. ready for the state-base-address
/// relative fields of hardware commands.
#[derive(Debug)]
pub struct MediaState {
    manager: Arc<Mutex<HeapManager>>,
    platform: Arc<PlatformInfo>,
    layout: DispatchLayout,
    block: Option<MemoryBlock>,
    next_sampler: Vec<u32>,
    next_avs: Vec<u32>,
    submitted: bool,
}

impl MediaState {
    #[must_use]
    pub const fn layout(&self) -> &DispatchLayout {
        &self.layout
    }

    #[must_use]
    pub const fn block(&self) -> Option<&MemoryBlock> {
        self.block.as_ref()
    }

    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.submitted
    }

    fn live_block(&self) -> HeapResult<&MemoryBlock> {
        match &self.block {
            Some(b) if !self.submitted => Ok(b),
            _ => {
                debug_assert!(false, "media state used after submit or release");
                Err(HeapError::InvalidState(
                    "media state has no writable block".into(),
                ))
            }
        }
    }

    fn kernel(&self, index: usize) -> HeapResult<&KernelLayout> {
        self.layout.kernels.get(index).ok_or_else(|| {
            debug_assert!(false, "kernel index {index} out of range");
            HeapError::InvalidState(format!("kernel index {index} out of range"))
        })
    }

    pub fn heap(&self) -> HeapResult<&Arc<HeapMemory>> {
        self.block
            .as_ref()
            .map(MemoryBlock::heap)
            .ok_or_else(|| HeapError::InvalidState("media state released".into()))
    }

    fn base(&self) -> usize {
        self.block.as_ref().map_or(0, MemoryBlock::offset)
    }

    #[must_use]
    pub fn curbe_offset(&self) -> usize {
        self.base() + self.layout.curbe_offset
    }

    pub fn kernel_curbe_offset(&self, index: usize) -> HeapResult<usize> {
        Ok(self.curbe_offset() + self.kernel(index)?.curbe_offset)
    }

    pub fn sampler_heap_offset(&self, index: usize) -> HeapResult<usize> {
        Ok(self.base() + self.kernel(index)?.sampler_heap_offset)
    }

    #[must_use]
    pub fn media_id_offset(&self) -> usize {
        self.base() + self.layout.media_id_offset
    }

    /// Heap offset of the scratch region, aligned for the hardware.
    #[must_use]
    pub fn scratch_offset(&self) -> Option<usize> {
        self.layout
            .scratch
            .map(|s| align_up(self.base() + s.offset, self.platform.scratch_alignment))
    }

    #[must_use]
    pub fn per_thread_scratch(&self) -> usize {
        self.layout.scratch.map_or(0, |s| s.per_thread)
    }

    #[must_use]
    pub const fn total_size(&self) -> usize {
        self.layout.total_size
    }

    /// Copies a kernel's per-thread constants into its curbe slot.
    pub fn load_curbe(&self, index: usize, data: &[u8]) -> HeapResult<usize> {
        let kl = self.kernel(index)?;
        if data.len() > kl.curbe_size {
            return Err(HeapError::InvalidState(format!(
                "curbe of {} bytes exceeds slot of {}",
                data.len(),
                kl.curbe_size
            )));
        }
        let at = self.layout.curbe_offset + kl.curbe_offset;
        self.live_block()?.add_data(at, data)?;
        Ok(self.base() + at)
    }

    /// Writes the interface descriptor of kernel `index`.
    pub fn load_media_id(&self, index: usize, descriptor: &[u8]) -> HeapResult<usize> {
        self.kernel(index)?;
        if descriptor.len() > self.platform.interface_descriptor_size {
            return Err(HeapError::InvalidState(format!(
                "interface descriptor of {} bytes, slot is {}",
                descriptor.len(),
                self.platform.interface_descriptor_size
            )));
        }
        let at = self.layout.media_id_offset + index * self.platform.interface_descriptor_size;
        self.live_block()?.add_data(at, descriptor)?;
        Ok(self.base() + at)
    }

    /// Writes a 3D sampler and its indirect state. `slot` selects a pinned
    /// index; otherwise the next free index after the pinned ones is used.
    /// Returns the sampler index the kernel sees.
    pub fn add_sampler(
        &mut self,
        index: usize,
        state: &[u8],
        indirect: &[u8],
        slot: Option<u32>,
    ) -> HeapResult<u32> {
        let kl = self.kernel(index)?.clone();
        let sampler_index = match slot {
            Some(s) if s < kl.reserved_slots => s,
            Some(s) => {
                return Err(HeapError::InvalidParameter(format!(
                    "sampler slot {s} outside the {} pinned slots",
                    kl.reserved_slots
                )));
            }
            None => {
                let next = self.next_sampler[index];
                if next >= kl.samplers_3d {
                    return Err(HeapError::InvalidParameter(format!(
                        "kernel {index} has no free sampler slots"
                    )));
                }
                self.next_sampler[index] += 1;
                kl.reserved_slots + next
            }
        };

        let size = self.platform.sampler_state_size;
        if state.len() > size || indirect.len() > self.platform.sampler_indirect_state_size {
            return Err(HeapError::InvalidState("sampler state too large".into()));
        }
        let state_at = if sampler_index < kl.reserved_slots {
            sampler_index as usize * size
        } else {
            kl.sampler_3d_offset + (sampler_index - kl.reserved_slots) as usize * size
        };
        let indirect_at =
            kl.indirect_offset + sampler_index as usize * self.platform.sampler_indirect_state_size;

        let block = self.live_block()?;
        block.add_data(kl.sampler_heap_offset + state_at, state)?;
        if !indirect.is_empty() {
            block.add_data(kl.sampler_heap_offset + indirect_at, indirect)?;
        }
        Ok(sampler_index)
    }

    pub fn add_avs_sampler(&mut self, index: usize, state: &[u8]) -> HeapResult<u32> {
        let kl = self.kernel(index)?.clone();
        let next = self.next_avs[index];
        if next >= kl.samplers_avs {
            return Err(HeapError::InvalidParameter(format!(
                "kernel {index} has no free AVS sampler slots"
            )));
        }
        let size = self.platform.avs_sampler_state_size;
        if state.len() > size {
            return Err(HeapError::InvalidState("AVS sampler state too large".into()));
        }
        let at = kl.sampler_heap_offset + kl.avs_offset + next as usize * size;
        self.live_block()?.add_data(at, state)?;
        self.next_avs[index] += 1;
        Ok(next)
    }

    /// Hands the block to the heap manager. Repeated calls do nothing.
    pub fn submit(&mut self) -> HeapResult<()> {
        if self.submitted {
            return Ok(());
        }
        let Some(block) = &self.block else {
            return Ok(());
        };
        self.manager
            .lock()
            .submit_blocks(std::slice::from_ref(block))?;
        self.submitted = true;
        Ok(())
    }

    /// Gives back an unsubmitted block, e.g. when the dispatch is abandoned.
    pub fn release(&mut self) -> HeapResult<()> {
        if self.submitted {
            return Ok(());
        }
        if let Some(block) = self.block.take() {
            self.manager
                .lock()
                .release_unsubmitted(std::slice::from_ref(&block))?;
        }
        Ok(())
    }

    /// Takes the block back when its command buffer never reached the GPU,
    /// whether or not [`MediaState::submit`] already ran.
    pub fn withdraw(&mut self) -> HeapResult<()> {
        if !self.submitted {
            return self.release();
        }
        if let Some(block) = self.block.take() {
            self.manager
                .lock()
                .withdraw_blocks(std::slice::from_ref(&block))?;
        }
        self.submitted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::device::HostDevice;
    use crate::runtime::heap::{Behavior, BlockState};
    use crate::runtime::tracker::FrameTrackerProducer;

    fn dsh(platform: PlatformInfo) -> (Arc<HostDevice>, DynamicStateHeap) {
        let dev = Arc::new(HostDevice::new());
        let mut mgr = HeapManager::new(dev.clone(), "dsh");
        mgr.set_default_behavior(Behavior::Extend).unwrap();
        mgr.set_initial_heap_size(64 * 1024).unwrap();
        mgr.set_extend_heap_size(64 * 1024).unwrap();
        mgr.register_tracker_producer(Arc::new(FrameTrackerProducer::new(2)));
        let heap = DynamicStateHeap::new(Arc::new(Mutex::new(mgr)), Arc::new(platform));
        (dev, heap)
    }

    #[test]
    fn two_kernel_layout() {
        let platform = PlatformInfo::default().with_sampler_alignment(256);
        let kernels = vec![
            Arc::new(Kernel::new("a", vec![0; 16]).with_curbe_size(128)),
            Arc::new(Kernel::new("b", vec![0; 16]).with_curbe_size(64)),
        ];
        let layout = DispatchLayout::compute(&kernels, &platform).unwrap();
        assert_eq!(layout.curbe_size, 192);
        assert_eq!(layout.kernels[1].curbe_offset, 128);
        assert_eq!(layout.sampler_offset, 256);
        assert_eq!(layout.sampler_size, 0);
        assert_eq!(layout.media_id_offset, 256);
        assert_eq!(layout.media_id_size, 64);
        assert_eq!(layout.total_size, 320);
    }

    #[test]
    fn sampler_sub_layout() {
        let platform = PlatformInfo::default();
        let kernels = vec![Arc::new(
            Kernel::new("s", vec![0; 16])
                .with_samplers(2, 1)
                .with_pinned_sampler(0),
        )];
        let layout = DispatchLayout::compute(&kernels, &platform).unwrap();
        let kl = &layout.kernels[0];
        assert_eq!(kl.reserved_slots, 1);
        assert_eq!(kl.avs_offset, 16);
        assert_eq!(kl.sampler_3d_offset, 16 + 2048);
        assert_eq!(kl.indirect_offset, align_up(16 + 2048 + 32, 64));
        assert_eq!(kl.sampler_heap_size, align_up(kl.indirect_offset + 3 * 64, 64));
    }

    #[test]
    fn scratch_region_is_power_of_two_per_thread() {
        let platform = PlatformInfo::default().with_max_hw_threads(8);
        let kernels = vec![Arc::new(Kernel::new("spill", vec![0; 16]).with_spill_size(3000))];
        let layout = DispatchLayout::compute(&kernels, &platform).unwrap();
        let scratch = layout.scratch.unwrap();
        assert_eq!(scratch.per_thread, 4096);
        assert_eq!(scratch.size, 4096 * 8 + 1024);

        let dedicated = platform.with_dedicated_scratch(true);
        assert!(DispatchLayout::compute(&kernels, &dedicated).unwrap().scratch.is_none());
    }

    #[test]
    fn allocate_writes_and_submits() {
        let (_dev, heap) = dsh(PlatformInfo::default().with_max_hw_threads(8));
        let kernels = vec![
            Arc::new(
                Kernel::new("a", vec![0; 16])
                    .with_curbe_size(64)
                    .with_samplers(1, 0)
                    .with_spill_size(100),
            ),
            Arc::new(Kernel::new("b", vec![0; 16]).with_curbe_size(32)),
        ];
        let mut ms = heap.allocate(&kernels, 0, 0).unwrap();
        let at = ms.load_curbe(1, &[7; 32]).unwrap();
        assert_eq!(at, ms.curbe_offset() + 64);
        assert_eq!(ms.add_sampler(0, &[1; 16], &[2; 64], None).unwrap(), 0);
        assert!(ms.add_sampler(0, &[1; 16], &[], None).is_err());
        ms.load_media_id(1, &[9; 32]).unwrap();
        assert_eq!(ms.scratch_offset().unwrap() % 1024, 0);

        let block = ms.block().unwrap().clone();
        let curbe = block.read_data(ms.layout().curbe_offset + 64, 32).unwrap();
        assert_eq!(curbe, vec![7; 32]);

        ms.submit().unwrap();
        ms.submit().unwrap();
        assert_eq!(block.state(), BlockState::Submitted);
    }

    #[test]
    fn release_returns_block() {
        let (_dev, heap) = dsh(PlatformInfo::default());
        let kernels = vec![Arc::new(Kernel::new("a", vec![0; 16]).with_curbe_size(64))];
        let mut ms = heap.allocate(&kernels, 0, 0).unwrap();
        ms.release().unwrap();
        assert_eq!(heap.manager().lock().used_space(), 0);
    }

    #[test]
    fn large_scratch_raises_extend_size() {
        let (_dev, heap) = dsh(PlatformInfo::default().with_max_hw_threads(64));
        let kernels = vec![Arc::new(Kernel::new("a", vec![0; 16]).with_spill_size(4096))];
        let ms = heap.allocate(&kernels, 0, 0).unwrap();
        assert!(heap.manager().lock().extend_heap_size() >= ms.total_size());
    }
}

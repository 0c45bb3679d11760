#![allow(clippy::cast_possible_truncation)]

use super::command_buffer::CommandBuffer;
use super::encoder::{
    GpgpuWalkerParams, HwCommand, InterfaceDescriptor, RenderEncoder, StateBaseAddress, VfeParams,
};
use super::task::{DispatchSpace, Task};
use super::walker::{self, DependencyPattern, ScoreboardConfig};
use crate::error::{HeapError, HeapResult};
use crate::os::OsInterface;
use crate::runtime::state::dsh::{DynamicStateHeap, MediaState};
use crate::runtime::state::ish::InstructionStateHeap;
use crate::runtime::state::platform::PlatformInfo;
use crate::runtime::state::scratch::ScratchSpace;
use crate::runtime::tracker::{FrameTrackerProducer, FrameTrackerToken};
use crate::utils::{align_up, align_up_u32, page_align};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const URB_ENTRIES: u32 = 32;

/// VFE per-thread scratch field: `log2(bytes / 1k)`.
#[must_use]
pub fn encode_scratch_size(per_thread: usize) -> u32 {
    (per_thread >> 10).max(1).ilog2()
}

/// Assembles tasks into command buffers and submits them.
///
/// Each queue owns one tracker slot; every submission writes the slot's next
/// value when it completes, which is what the heaps wait on before reusing
/// memory.
#[derive(Debug)]
pub struct ComputeQueue {
    pub(crate) os: Arc<dyn OsInterface>,
    pub(crate) platform: Arc<PlatformInfo>,
    pub(crate) encoder: Arc<dyn RenderEncoder>,
    pub(crate) producer: Arc<FrameTrackerProducer>,
    pub(crate) tracker_index: u32,
    pub(crate) ish: InstructionStateHeap,
    pub(crate) dsh: DynamicStateHeap,
    pub(crate) scratch: Option<ScratchSpace>,
    pub(crate) in_flight: VecDeque<(CommandBuffer, FrameTrackerToken)>,
    pub(crate) cmd_buffer_size: usize,
    pub(crate) ssh_size: usize,
    pub(crate) submitted: u64,
}

/// Offsets a dispatch needs once its heaps are populated.
struct Placement<'a> {
    kernel_offsets: &'a [usize],
    sampler_counts: &'a [u32],
    value: u32,
}

impl ComputeQueue {
    #[must_use]
    pub const fn tracker_index(&self) -> u32 {
        self.tracker_index
    }

    #[must_use]
    pub const fn ish(&self) -> &InstructionStateHeap {
        &self.ish
    }

    pub fn ish_mut(&mut self) -> &mut InstructionStateHeap {
        &mut self.ish
    }

    #[must_use]
    pub const fn dsh(&self) -> &DynamicStateHeap {
        &self.dsh
    }

    #[must_use]
    pub const fn scratch(&self) -> Option<&ScratchSpace> {
        self.scratch.as_ref()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub const fn submitted(&self) -> u64 {
        self.submitted
    }

    /// Current command buffer size; grows when a task does not fit.
    #[must_use]
    pub const fn command_buffer_size(&self) -> usize {
        self.cmd_buffer_size
    }

    /// Latest value the GPU reported for this queue.
    pub fn completed_value(&self) -> HeapResult<u32> {
        self.producer.latest(self.tracker_index)
    }

    /// Drops finished command buffers and lets every heap reclaim memory the
    /// GPU is done with.
    pub fn reclaim(&mut self) -> usize {
        let mut done = 0;
        while self
            .in_flight
            .front()
            .is_some_and(|(_, token)| token.is_expired())
        {
            self.in_flight.pop_front();
            done += 1;
        }
        let ish = self.ish.reclaim();
        let scratch = self.scratch.as_mut().map_or(0, ScratchSpace::reclaim);
        let blocks = self.dsh.manager().lock().refresh();
        if done + ish + scratch + blocks > 0 {
            debug!(
                queue = self.tracker_index,
                buffers = done,
                ish,
                scratch,
                blocks,
                "reclaimed"
            );
        }
        done
    }

    /// Blocks until every submission of this queue has completed.
    pub fn finish(&mut self, timeout: std::time::Duration) -> HeapResult<()> {
        if let Some((_, token)) = self.in_flight.back()
            && let Some(&(_, value)) = token.entries().first()
        {
            self.producer.wait_until(
                self.tracker_index,
                value,
                timeout,
                std::time::Duration::from_millis(1),
            )?;
        }
        self.reclaim();
        Ok(())
    }

    /// Loads, lays out and submits `task`. The returned token expires when
    /// the GPU has finished it.
    pub fn enqueue(&mut self, task: &Task) -> HeapResult<FrameTrackerToken> {
        task.validate(&self.platform)?;
        self.reclaim();

        let kernels = task.kernel_list();
        let kernel_offsets = self.ish.load_kernels(&kernels).inspect_err(|e| {
            warn!(queue = self.tracker_index, "kernel load failed: {e}");
        })?;

        let spill = task.max_spill();
        if spill > 0
            && let Some(scratch) = self.scratch.as_mut()
        {
            scratch.ensure(spill)?;
        }

        let value = self.producer.next_tracker(self.tracker_index)?;
        let mut media = self.dsh.allocate(&kernels, self.tracker_index, value)?;

        // nothing reaches the device unless every step succeeds
        let submitted = self
            .populate_and_assemble(task, &mut media, &kernel_offsets, value)
            .and_then(|cb| self.submit(cb, &mut media, value));
        submitted.inspect_err(|_| Self::abandon(&mut media))
    }

    fn populate_and_assemble(
        &mut self,
        task: &Task,
        media: &mut MediaState,
        kernel_offsets: &[usize],
        value: u32,
    ) -> HeapResult<CommandBuffer> {
        let sampler_counts = self.write_dynamic_state(task, media)?;
        let placement = Placement {
            kernel_offsets,
            sampler_counts: &sampler_counts,
            value,
        };

        let size = self.cmd_buffer_size;
        match self.assemble(task, media, &placement, size) {
            Err(HeapError::CommandBufferFull { needed, remaining }) => {
                let grown = page_align((size * 2).max(needed + self.ssh_size));
                warn!(
                    queue = self.tracker_index,
                    needed,
                    remaining,
                    size,
                    grown,
                    "command buffer too small, retrying"
                );
                let cb = self.assemble(task, media, &placement, grown)?;
                self.cmd_buffer_size = grown;
                Ok(cb)
            }
            other => other,
        }
    }

    /// Curbe and sampler writes. Done once per task; they do not depend on
    /// the command buffer.
    fn write_dynamic_state(&self, task: &Task, media: &mut MediaState) -> HeapResult<Vec<u32>> {
        let mut counts = Vec::with_capacity(task.kernels.len());
        for (i, tk) in task.kernels.iter().enumerate() {
            if !tk.curbe.is_empty() {
                media.load_curbe(i, &tk.curbe)?;
            }
            for state in &tk.avs_samplers {
                media.add_avs_sampler(i, state)?;
            }
            let mut highest = None;
            for (desc, slot) in &tk.samplers {
                let (state, indirect) = self.encoder.encode_sampler(desc);
                let index = media.add_sampler(i, &state, &indirect, *slot)?;
                highest = highest.max(Some(index));
            }
            counts.push(highest.map_or(0, |h| h + 1));
        }
        Ok(counts)
    }

    fn assemble(
        &self,
        task: &Task,
        media: &MediaState,
        placement: &Placement<'_>,
        size: usize,
    ) -> HeapResult<CommandBuffer> {
        let mut cb = CommandBuffer::new(
            self.os.clone(),
            self.encoder.clone(),
            self.platform.clone(),
            size,
            self.ssh_size,
        )?;

        let mut binding_tables = Vec::with_capacity(task.kernels.len());
        for tk in &task.kernels {
            let ssh = cb.ssh_mut();
            let table = ssh.assign_binding_table()?;
            for (surface, bte) in &tk.surfaces {
                ssh.add_surface_state(surface, *bte, Some(table))?;
            }
            binding_tables.push(ssh.binding_table_offset(table)?);
        }
        if let Some(scratch) = &self.scratch
            && scratch.handle().is_some()
            && task.max_spill() > 0
        {
            cb.ssh_mut().add_scratch_space(scratch)?;
        }

        for (i, tk) in task.kernels.iter().enumerate() {
            let layout = &media.layout().kernels[i];
            let (threads_per_group, barrier) = match task.space_of(i) {
                Some(DispatchSpace::Groups(g)) => (g.threads_per_group(), g.threads_per_group() > 1),
                _ => (0, false),
            };
            let desc = InterfaceDescriptor {
                kernel_offset: placement.kernel_offsets[i] as u64,
                sampler_offset: media.sampler_heap_offset(i)? as u32,
                sampler_count: placement.sampler_counts[i],
                binding_table_offset: binding_tables[i],
                curbe_read_length: (layout.curbe_size / 32) as u32,
                curbe_offset: layout.curbe_offset as u32,
                threads_per_group,
                slm_size: self.slm_size(tk.kernel.slm_size()),
                barrier,
            };
            media.load_media_id(i, &self.encoder.encode_interface_descriptor(&desc))?;
        }

        let cmds = self.build_commands(task, media, &cb, placement.value)?;
        let needed = cb.size_of(&cmds);
        if needed > cb.remaining() {
            let remaining = cb.remaining();
            cb.return_whole_buffer();
            return Err(HeapError::CommandBufferFull { needed, remaining });
        }
        for cmd in cmds {
            cb.emit(cmd)?;
        }
        Ok(cb)
    }

    fn abandon(media: &mut MediaState) {
        if let Err(e) = media.withdraw() {
            error!("dynamic state of an abandoned task was not released: {e}");
        }
    }

    fn slm_size(&self, requested: u32) -> u32 {
        if requested == 0 {
            0
        } else {
            align_up_u32(requested, self.platform.slm_granularity)
        }
    }

    fn scoreboard(&self, task: &Task) -> HeapResult<ScoreboardConfig> {
        let patterns: Vec<DependencyPattern> = (0..task.kernels.len())
            .map(|i| match task.space_of(i) {
                Some(DispatchSpace::Threads(ts)) => ts.dependency,
                _ => DependencyPattern::None,
            })
            .collect();
        walker::scoreboard(&patterns, task.has_shared_space())
    }

    fn build_commands(
        &self,
        task: &Task,
        media: &MediaState,
        cb: &CommandBuffer,
        value: u32,
    ) -> HeapResult<Vec<HwCommand>> {
        let gpgpu = task.is_gpgpu();
        let dsh_heap = media.heap()?;
        let layout = media.layout();
        let mut cmds = Vec::with_capacity(12 + task.kernels.len() * 2);

        cmds.push(HwCommand::PipelineSelect { gpgpu });
        cmds.push(HwCommand::StateBaseAddress(StateBaseAddress {
            dynamic_state: dsh_heap.gpu_address(),
            dynamic_state_size: dsh_heap.size() as u32,
            instruction: self.ish.base_address(),
            instruction_size: self.ish.size() as u32,
            surface_state: cb.surface_state_base(),
        }));

        if self.platform.has_sip
            && let Some(offset) = self.ish.sip_offset()
        {
            cmds.push(HwCommand::PipeControl {
                flush_caches: false,
                cs_stall: true,
            });
            cmds.push(HwCommand::StateSip {
                offset: offset as u64,
            });
        }

        let scoreboard = self.scoreboard(task)?;
        let (per_thread, scratch_base) = match &self.scratch {
            Some(scratch) if task.max_spill() > 0 => (
                scratch.per_thread(),
                scratch.gpu_address().unwrap_or_default(),
            ),
            _ => (
                media.per_thread_scratch(),
                media
                    .scratch_offset()
                    .map_or(0, |offset| dsh_heap.gpu_address() + offset as u64),
            ),
        };
        cmds.push(HwCommand::VfeState(VfeParams {
            max_threads: self.platform.max_hw_threads as u32,
            urb_entries: URB_ENTRIES,
            curbe_allocation: align_up(layout.curbe_size, 32) as u32,
            per_thread_scratch: if per_thread > 0 {
                encode_scratch_size(per_thread)
            } else {
                0
            },
            scratch_base,
            scoreboard_enable: scoreboard.mask != 0,
            scoreboard_mask: scoreboard.mask,
            scoreboard_non_stalling: scoreboard.non_stalling,
            scoreboard_deltas: scoreboard.deltas.clone(),
        }));

        if layout.curbe_size > 0 {
            cmds.push(HwCommand::CurbeLoad {
                length: layout.curbe_size as u32,
                offset: media.curbe_offset() as u32,
            });
        }
        cmds.push(HwCommand::MediaIdLoad {
            length: layout.media_id_size as u32,
            offset: media.media_id_offset() as u32,
        });

        for (i, tk) in task.kernels.iter().enumerate() {
            if i > 0 && task.sync_between_kernels {
                cmds.push(HwCommand::PipeControl {
                    flush_caches: true,
                    cs_stall: false,
                });
            }
            match task.space_of(i) {
                Some(DispatchSpace::Threads(ts)) => {
                    let mut params = walker::derive(&ts, self.platform.walker_max_width);
                    params.scoreboard_mask = scoreboard.kernel_masks[i];
                    params.use_scoreboard = params.scoreboard_mask != 0;
                    cmds.push(HwCommand::MediaObjectWalker {
                        interface_descriptor: i as u32,
                        params,
                    });
                }
                Some(DispatchSpace::Groups(gs)) => {
                    cmds.push(HwCommand::GpgpuWalker(GpgpuWalkerParams {
                        interface_descriptor: i as u32,
                        simd_size: tk.simd_size,
                        thread_width: gs.thread_width,
                        thread_height: gs.thread_height,
                        thread_depth: gs.thread_depth,
                        group_width: gs.group_width,
                        group_height: gs.group_height,
                        group_depth: gs.group_depth,
                        right_mask: u32::MAX >> (32 - tk.simd_size),
                        bottom_mask: u32::MAX,
                        slm_size: self.slm_size(tk.kernel.slm_size()),
                    }));
                }
                None => {
                    return Err(HeapError::InvalidState(format!(
                        "kernel {i} lost its thread space"
                    )));
                }
            }
        }

        cmds.push(HwCommand::PipeControl {
            flush_caches: true,
            cs_stall: true,
        });
        cmds.push(HwCommand::TrackerStore {
            slot: self.tracker_index,
            value,
        });
        cmds.push(HwCommand::BatchBufferEnd);
        Ok(cmds)
    }

    /// Hands the command buffer to the device. Every fallible step runs
    /// before the device sees the batch; an error leaves nothing queued.
    fn submit(
        &mut self,
        mut cb: CommandBuffer,
        media: &mut MediaState,
        value: u32,
    ) -> HeapResult<FrameTrackerToken> {
        let counter = self.producer.counter(self.tracker_index)?;
        let resources = self.register_heaps(media)?;
        media.submit()?;
        cb.submit(&resources, vec![(counter, value)])
            .inspect_err(|e| warn!(queue = self.tracker_index, "submission failed: {e}"))?;

        let token = FrameTrackerToken::from_producer(self.producer.clone(), self.tracker_index, value);
        self.ish.submit(&token);
        if let Some(scratch) = self.scratch.as_mut() {
            scratch.submit(&token);
        }
        if let Err(e) = self.producer.step_forward(self.tracker_index) {
            error!(queue = self.tracker_index, value, "tracker did not advance: {e}");
        }
        self.submitted += 1;
        info!(
            queue = self.tracker_index,
            value,
            bytes = cb.used(),
            "task submitted"
        );
        self.in_flight.push_back((cb, token.clone()));
        Ok(token)
    }

    /// Registers the queue's heaps with the OS and returns their handles.
    fn register_heaps(&self, media: &MediaState) -> HeapResult<Vec<u64>> {
        let dsh_handle = media.heap()?.resource().handle;
        let ish_handle = self.ish.heap().resource().handle;
        let mut resources = vec![dsh_handle, ish_handle];
        self.os.register_resource(dsh_handle, true)?;
        self.os.register_resource(ish_handle, false)?;
        if let Some(handle) = self.scratch.as_ref().and_then(ScratchSpace::handle) {
            self.os.register_resource(handle, true)?;
            resources.push(handle);
        }
        Ok(resources)
    }
}

impl Drop for ComputeQueue {
    fn drop(&mut self) {
        self.producer.release_index(self.tracker_index);
    }
}

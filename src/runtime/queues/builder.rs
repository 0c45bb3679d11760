use super::encoder::RenderEncoder;
use super::queue::ComputeQueue;
use crate::config::StateHeapSettings;
use crate::error::HeapResult;
use crate::os::OsInterface;
use crate::runtime::heap::{Behavior, HeapManager};
use crate::runtime::state::dsh::DynamicStateHeap;
use crate::runtime::state::ish::{InstructionStateHeap, IshConfig};
use crate::runtime::state::kernel::Kernel;
use crate::runtime::state::platform::PlatformInfo;
use crate::runtime::state::scratch::ScratchSpace;
use crate::runtime::tracker::FrameTrackerProducer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{error, info};

/// Sets up a [`ComputeQueue`] and the heaps it owns.
///
/// Sizes and policies default to the [`StateHeapSettings`] passed in; the
/// `with_*` methods override them for this queue only.
pub struct QueueBuilder<'a> {
    os: &'a Arc<dyn OsInterface>,
    platform: &'a Arc<PlatformInfo>,
    settings: &'a StateHeapSettings,
    producer: &'a Arc<FrameTrackerProducer>,
    encoder: &'a Arc<dyn RenderEncoder>,

    // Inputs
    behavior: Behavior,
    dsh_initial_size: usize,
    command_buffer_size: usize,
    ssh_size: usize,
    sip: Option<Arc<Kernel>>,
}

impl<'a> QueueBuilder<'a> {
    pub fn new(
        os: &'a Arc<dyn OsInterface>,
        platform: &'a Arc<PlatformInfo>,
        settings: &'a StateHeapSettings,
        producer: &'a Arc<FrameTrackerProducer>,
        encoder: &'a Arc<dyn RenderEncoder>,
    ) -> Self {
        Self {
            os,
            platform,
            settings,
            producer,
            encoder,
            behavior: settings.dsh_behavior,
            dsh_initial_size: settings.dsh_initial_size,
            command_buffer_size: settings.command_buffer_size,
            ssh_size: settings.ssh_size,
            sip: None,
        }
    }

    #[must_use]
    pub const fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    #[must_use]
    pub const fn with_dsh_size(mut self, size: usize) -> Self {
        self.dsh_initial_size = size;
        self
    }

    /// Command buffer size including the surface-state region.
    #[must_use]
    pub const fn with_command_buffer(mut self, size: usize, ssh_size: usize) -> Self {
        self.command_buffer_size = size;
        self.ssh_size = ssh_size;
        self
    }

    /// Preemption handler loaded into the queue's instruction heap.
    #[must_use]
    pub fn with_sip(mut self, sip: Arc<Kernel>) -> Self {
        self.sip = Some(sip);
        self
    }

    /// Claims a tracker slot and allocates the queue's heaps.
    ///
    /// # Errors
    /// Fails when every tracker slot is taken, when a size or policy is
    /// rejected, or when the instruction heap cannot be allocated. The slot
    /// is given back on failure.
    pub fn create(self) -> HeapResult<ComputeQueue> {
        let tracker_index = self.producer.assign_index().inspect_err(|e| {
            error!("no tracker slot for a new queue: {e}");
        })?;

        self.build(tracker_index).inspect_err(|e| {
            error!(queue = tracker_index, "queue setup failed: {e}");
            self.producer.release_index(tracker_index);
        })
    }

    fn build(&self, tracker_index: u32) -> HeapResult<ComputeQueue> {
        // a settings-level request for dedicated scratch must also keep the
        // DSH from carving its own region
        let platform = if self.settings.dedicated_scratch && !self.platform.dedicated_scratch {
            Arc::new((**self.platform).clone().with_dedicated_scratch(true))
        } else {
            self.platform.clone()
        };

        let dsh = DynamicStateHeap::new(Arc::new(Mutex::new(self.dsh_manager()?)), platform.clone());

        let mut ish = InstructionStateHeap::new(self.os.clone(), self.ish_config())?;
        if let Some(sip) = &self.sip {
            ish.set_sip_kernel(sip.clone());
        }

        let scratch = platform
            .dedicated_scratch
            .then(|| ScratchSpace::new(self.os.clone(), &platform));

        info!(
            queue = tracker_index,
            behavior = %self.behavior,
            dsh = self.dsh_initial_size,
            ish = ish.size(),
            command_buffer = self.command_buffer_size,
            dedicated_scratch = scratch.is_some(),
            "compute queue created"
        );

        Ok(ComputeQueue {
            os: self.os.clone(),
            platform,
            encoder: self.encoder.clone(),
            producer: self.producer.clone(),
            tracker_index,
            ish,
            dsh,
            scratch,
            in_flight: VecDeque::new(),
            cmd_buffer_size: self.command_buffer_size,
            ssh_size: self.ssh_size,
            submitted: 0,
        })
    }

    fn dsh_manager(&self) -> HeapResult<HeapManager> {
        let mut manager = HeapManager::new(self.os.clone(), "dsh");
        manager.set_default_behavior(self.behavior)?;
        manager.set_initial_heap_size(self.dsh_initial_size)?;
        if self.behavior != Behavior::Wait {
            manager.set_extend_heap_size(self.settings.dsh_extend_size)?;
        }
        manager.set_wait_policy(self.settings.wait_step, self.settings.wait_timeout);
        if self.settings.lock_heaps {
            manager.lock_heaps_on_allocate()?;
        }
        manager.register_tracker_producer(self.producer.clone());
        Ok(manager)
    }

    fn ish_config(&self) -> IshConfig {
        IshConfig {
            initial_size: self.settings.ish_initial_size,
            expand_step: self.settings.ish_expand_step,
            max_size: self.settings.ish_max_size,
            padding: self.settings.kernel_padding,
            alignment: self.settings.kernel_alignment,
            keep_locked: self.settings.lock_heaps,
        }
    }
}

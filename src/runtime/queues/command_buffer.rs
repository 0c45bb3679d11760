use super::encoder::{HwCommand, RenderEncoder};
use crate::error::{HeapError, HeapResult};
use crate::os::{OsInterface, Submission};
use crate::runtime::heap::HeapMemory;
use crate::runtime::state::platform::PlatformInfo;
use crate::runtime::state::ssh::SurfaceStateHeap;
use crate::runtime::tracker::TrackerCounter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

static NEXT_BUFFER_ID: AtomicU32 = AtomicU32::new(1);

/// One batch buffer: commands grow from offset 0, the surface-state heap
/// occupies a fixed region at the tail.
///
/// Commands are staged on the host and copied into the GPU buffer when the
/// batch is submitted, so an abandoned batch leaves nothing behind.
#[derive(Debug)]
pub struct CommandBuffer {
    memory: HeapMemory,
    encoder: Arc<dyn RenderEncoder>,
    ssh: SurfaceStateHeap,
    ssh_offset: usize,
    stream: Vec<u8>,
    emitted: Vec<HwCommand>,
    submitted: bool,
}

impl CommandBuffer {
    pub fn new(
        os: Arc<dyn OsInterface>,
        encoder: Arc<dyn RenderEncoder>,
        platform: Arc<PlatformInfo>,
        size: usize,
        ssh_size: usize,
    ) -> HeapResult<Self> {
        if ssh_size == 0 || ssh_size >= size {
            return Err(HeapError::InvalidParameter(format!(
                "surface state region of {ssh_size} bytes does not fit a {size} byte command buffer"
            )));
        }
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let memory = HeapMemory::allocate(os, id, size, false, false, &format!("cmdbuf#{id}"))?;
        let ssh = SurfaceStateHeap::new(platform, encoder.clone(), ssh_size)?;
        Ok(Self {
            memory,
            encoder,
            ssh,
            ssh_offset: size - ssh_size,
            stream: Vec::new(),
            emitted: Vec::new(),
            submitted: false,
        })
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.ssh_offset
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.stream.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.ssh_offset - self.stream.len()
    }

    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.memory.resource().handle
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.memory.gpu_address()
    }

    /// Surface-state base address for state-base-address.
    #[must_use]
    pub const fn surface_state_base(&self) -> u64 {
        self.memory.gpu_address() + self.ssh_offset as u64
    }

    #[must_use]
    pub const fn ssh(&self) -> &SurfaceStateHeap {
        &self.ssh
    }

    pub fn ssh_mut(&mut self) -> &mut SurfaceStateHeap {
        &mut self.ssh
    }

    /// Commands emitted so far, in order.
    #[must_use]
    pub fn commands(&self) -> &[HwCommand] {
        &self.emitted
    }

    #[must_use]
    pub fn stream(&self) -> &[u8] {
        &self.stream
    }

    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Bytes `cmds` would take.
    #[must_use]
    pub fn size_of(&self, cmds: &[HwCommand]) -> usize {
        cmds.iter().map(|c| self.encoder.command_size(c)).sum()
    }

    pub fn emit(&mut self, cmd: HwCommand) -> HeapResult<()> {
        let needed = self.encoder.command_size(&cmd);
        if self.submitted {
            debug_assert!(false, "emit into a submitted command buffer");
            return Err(HeapError::InvalidState("command buffer already submitted".into()));
        }
        if needed > self.remaining() {
            return Err(HeapError::CommandBufferFull {
                needed,
                remaining: self.remaining(),
            });
        }
        trace!(?cmd, needed, "emit");
        self.encoder.encode(&cmd, &mut self.stream);
        self.emitted.push(cmd);
        Ok(())
    }

    /// Drops everything emitted since the buffer was obtained.
    pub fn return_whole_buffer(&mut self) {
        debug!(
            buffer = self.handle(),
            discarded = self.stream.len(),
            "command buffer returned"
        );
        self.stream.clear();
        self.emitted.clear();
    }

    /// Copies the commands and the surface-state heap into the GPU buffer
    /// and queues it. `tracker_stores` are performed when the batch
    /// completes.
    pub fn submit(
        &mut self,
        resources: &[u64],
        tracker_stores: Vec<(TrackerCounter, u32)>,
    ) -> HeapResult<()> {
        if self.submitted {
            return Err(HeapError::InvalidState("command buffer already submitted".into()));
        }
        self.memory.write(0, &self.stream)?;
        self.memory.write(self.ssh_offset, self.ssh.bytes())?;

        let os = self.memory.os();
        for &(handle, write) in self.ssh.resources() {
            os.register_resource(handle, write)?;
        }

        let mut all = Vec::with_capacity(resources.len() + self.ssh.resources().len());
        all.extend_from_slice(resources);
        for &(handle, _) in self.ssh.resources() {
            if !all.contains(&handle) {
                all.push(handle);
            }
        }

        os.submit(Submission {
            buffer: self.handle(),
            used: self.stream.len(),
            resources: all,
            tracker_stores,
        })?;
        self.submitted = true;
        debug!(
            buffer = self.handle(),
            used = self.stream.len(),
            surfaces = self.ssh.surface_state_count(),
            "command buffer submitted"
        );
        Ok(())
    }
}

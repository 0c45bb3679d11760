use super::platform::PlatformInfo;
use crate::error::HeapResult;
use crate::os::{AllocFlags, GpuResource, OsInterface};
use crate::runtime::tracker::FrameTrackerToken;
use crate::utils::{page_align, pow2_granular};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// Spill memory in its own buffer, for platforms that do not carve scratch
/// out of the dynamic-state heap.
///
/// The buffer only grows. A replaced buffer stays alive until the last
/// submission that used it has completed.
#[derive(Debug)]
pub struct ScratchSpace {
    os: Arc<dyn OsInterface>,
    granularity: usize,
    threads: usize,
    current: Option<GpuResource>,
    per_thread: usize,
    last_use: FrameTrackerToken,
    pending_free: VecDeque<(GpuResource, FrameTrackerToken)>,
}

impl ScratchSpace {
    #[must_use]
    pub fn new(os: Arc<dyn OsInterface>, platform: &PlatformInfo) -> Self {
        Self {
            os,
            granularity: platform.scratch_granularity,
            threads: platform.max_hw_threads,
            current: None,
            per_thread: 0,
            last_use: FrameTrackerToken::default(),
            pending_free: VecDeque::new(),
        }
    }

    /// Makes sure every hardware thread has at least `spill` bytes.
    /// Returns `true` when a new buffer was allocated.
    pub fn ensure(&mut self, spill: usize) -> HeapResult<bool> {
        let per_thread = pow2_granular(spill, self.granularity);
        if self.current.is_some() && per_thread <= self.per_thread {
            return Ok(false);
        }

        let size = page_align(per_thread * self.threads);
        let resource = self
            .os
            .allocate(size, AllocFlags::new().hw_write_only(), "scratch")
            .inspect_err(|e| {
                tracing::error!(size, "scratch allocation failed: {e}");
            })?;
        info!(per_thread, size, "scratch space grown");

        if let Some(old) = self.current.replace(resource) {
            if self.last_use.is_valid() {
                let token = std::mem::take(&mut self.last_use);
                self.pending_free.push_back((old, token));
            } else {
                self.os.free(&old);
            }
        }
        self.per_thread = per_thread;
        Ok(true)
    }

    /// Records a submission that reads the current buffer.
    pub fn submit(&mut self, token: &FrameTrackerToken) {
        self.last_use.merge(token);
    }

    /// Frees replaced buffers whose last submission has completed.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        while let Some((_, token)) = self.pending_free.front() {
            if !token.is_expired() {
                break;
            }
            if let Some((resource, _)) = self.pending_free.pop_front() {
                self.os.free(&resource);
                freed += 1;
            }
        }
        if freed > 0 {
            debug!(freed, "retired scratch buffers released");
        }
        freed
    }

    #[must_use]
    pub const fn per_thread(&self) -> usize {
        self.per_thread
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.current.as_ref().map_or(0, |r| r.size)
    }

    #[must_use]
    pub fn gpu_address(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.gpu_va)
    }

    #[must_use]
    pub fn handle(&self) -> Option<u64> {
        self.current.as_ref().map(|r| r.handle)
    }

    #[must_use]
    pub fn pending_free_count(&self) -> usize {
        self.pending_free.len()
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        for (resource, _) in self.pending_free.drain(..) {
            self.os.free(&resource);
        }
        if let Some(resource) = self.current.take() {
            self.os.free(&resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::device::HostDevice;
    use crate::runtime::tracker::TrackerCounter;

    #[test]
    fn grows_and_retires_old_buffer() {
        let dev = Arc::new(HostDevice::new());
        let platform = PlatformInfo::default().with_max_hw_threads(4);
        let mut scratch = ScratchSpace::new(dev.clone(), &platform);

        assert!(scratch.ensure(100).unwrap());
        assert_eq!(scratch.per_thread(), 1024);
        assert!(!scratch.ensure(1024).unwrap());

        let counter = TrackerCounter::new();
        scratch.submit(&FrameTrackerToken::from_counter(counter.clone(), 1));
        assert!(scratch.ensure(3000).unwrap());
        assert_eq!(scratch.per_thread(), 4096);
        assert_eq!(scratch.pending_free_count(), 1);
        assert_eq!(dev.live_allocations(), 2);

        assert_eq!(scratch.reclaim(), 0);
        counter.store(1);
        assert_eq!(scratch.reclaim(), 1);
        assert_eq!(dev.live_allocations(), 1);

        drop(scratch);
        assert_eq!(dev.live_allocations(), 0);
    }
}

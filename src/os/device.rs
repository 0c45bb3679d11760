#![allow(clippy::cast_possible_truncation)]

use crate::error::{HeapError, HeapResult};
use crate::os::aperture::Aperture;
use crate::os::{AllocFlags, GpuResource, OsInterface, Submission};
use crate::utils::{PAGE_SIZE, page_align};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

const HOST_VA_BASE: u64 = 0x1000_0000; // Start at 256MB
const HOST_VA_LIMIT: u64 = (1 << 47) - 1;
const HOST_GUARD_BYTES: u64 = PAGE_SIZE as u64;

#[derive(Debug)]
struct HostAllocation {
    ptr: *mut u8,
    mapped: usize,
    gpu_va: u64,
    locks: u32,
}

// The mapping is owned by the device and only touched under its mutex.
unsafe impl Send for HostAllocation {}

/// A batch handed to the device, kept until [`HostDevice::execute_all`].
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub commands: Vec<u8>,
    pub resources: Vec<u64>,
    pub submission: Submission,
}

#[derive(Debug, Default)]
struct HostState {
    allocations: HashMap<u64, HostAllocation>,
    allocated_bytes: usize,
    registered: Vec<(u64, bool)>,
    pending: VecDeque<SubmittedBatch>,
    completed: Vec<SubmittedBatch>,
}

/// An [`OsInterface`] backed by anonymous host memory.
///
/// Buffers are `mmap`ed pages with GPU addresses carved out of a private
/// aperture. Submitted batches are queued; [`HostDevice::execute_all`] plays
/// the GPU by performing each batch's tracker writes in order.
#[derive(Debug)]
pub struct HostDevice {
    aperture: Mutex<Aperture>,
    state: Mutex<HostState>,
    next_handle: AtomicU64,
    capacity: Option<usize>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDevice {
    #[must_use]
    pub fn new() -> Self {
        Self {
            aperture: Mutex::new(Aperture::new(
                HOST_VA_BASE,
                HOST_VA_LIMIT,
                PAGE_SIZE as u64,
                HOST_GUARD_BYTES,
            )),
            state: Mutex::new(HostState::default()),
            next_handle: AtomicU64::new(1),
            capacity: None,
        }
    }

    /// Limits the total bytes that may be allocated at once.
    #[must_use]
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Completes every pending batch in submission order. Returns how many
    /// ran.
    pub fn execute_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut ran = 0;
        while let Some(batch) = state.pending.pop_front() {
            for (counter, value) in &batch.submission.tracker_stores {
                counter.store(*value);
            }
            trace!(buffer = batch.submission.buffer, "batch executed");
            state.completed.push(batch);
            ran += 1;
        }
        ran
    }

    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Every batch submitted so far, completed ones first.
    #[must_use]
    pub fn submitted(&self) -> Vec<SubmittedBatch> {
        let state = self.state.lock();
        state
            .completed
            .iter()
            .chain(state.pending.iter())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated_bytes
    }

    #[must_use]
    pub fn lock_count(&self, handle: u64) -> u32 {
        self.state
            .lock()
            .allocations
            .get(&handle)
            .map_or(0, |a| a.locks)
    }

    /// Resources registered since the last submission.
    #[must_use]
    pub fn registered_resources(&self) -> Vec<(u64, bool)> {
        self.state.lock().registered.clone()
    }

    /// Reads back `len` bytes of a live buffer.
    pub fn read(&self, handle: u64, offset: usize, len: usize) -> HeapResult<Vec<u8>> {
        let state = self.state.lock();
        let alloc = state
            .allocations
            .get(&handle)
            .ok_or_else(|| HeapError::InvalidParameter(format!("unknown handle {handle}")))?;
        if offset + len > alloc.mapped {
            return Err(HeapError::InvalidParameter(format!(
                "read of {len} bytes at {offset} past end of buffer"
            )));
        }
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(alloc.ptr.add(offset), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn map_pages(size: usize) -> HeapResult<*mut u8> {
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            error!("host mmap of {size} bytes failed: {err}");
            return Err(HeapError::Io(err));
        }
        Ok(ret.cast::<u8>())
    }
}

impl OsInterface for HostDevice {
    fn allocate(&self, size: usize, flags: AllocFlags, name: &str) -> HeapResult<GpuResource> {
        if size == 0 {
            return Err(HeapError::InvalidParameter(format!(
                "zero sized allocation '{name}'"
            )));
        }
        let mapped = page_align(size);

        {
            let state = self.state.lock();
            if let Some(cap) = self.capacity
                && state.allocated_bytes + mapped > cap
            {
                debug!(name, size, cap, "host device capacity exhausted");
                return Err(HeapError::OutOfMemory);
            }
        }

        let gpu_va = self
            .aperture
            .lock()
            .reserve(mapped, PAGE_SIZE)
            .ok_or(HeapError::OutOfMemory)?;

        // Anonymous mappings are zero filled, so `flags.zeroed` needs no work.
        let ptr = match Self::map_pages(mapped) {
            Ok(p) => p,
            Err(e) => {
                self.aperture.lock().release(gpu_va);
                return Err(e);
            }
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.allocations.insert(
            handle,
            HostAllocation {
                ptr,
                mapped,
                gpu_va,
                locks: 0,
            },
        );
        state.allocated_bytes += mapped;
        debug!(name, handle, size, gpu_va = format_args!("{gpu_va:#x}"), "allocated");

        Ok(GpuResource {
            handle,
            size,
            gpu_va,
            flags,
            name: name.to_string(),
        })
    }

    fn free(&self, resource: &GpuResource) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.allocations.remove(&resource.handle);
            if let Some(alloc) = &removed {
                state.allocated_bytes -= alloc.mapped;
                state.registered.retain(|(h, _)| *h != resource.handle);
            }
            removed
        };

        let Some(alloc) = removed else {
            error!(handle = resource.handle, "free of unknown resource");
            return;
        };
        if alloc.locks != 0 {
            debug!(handle = resource.handle, locks = alloc.locks, "freeing a locked resource");
        }
        unsafe {
            libc::munmap(alloc.ptr.cast(), alloc.mapped);
        }
        self.aperture.lock().release(alloc.gpu_va);
        debug!(name = %resource.name, handle = resource.handle, "freed");
    }

    fn lock(&self, resource: &GpuResource) -> HeapResult<*mut u8> {
        let mut state = self.state.lock();
        let alloc = state.allocations.get_mut(&resource.handle).ok_or_else(|| {
            HeapError::InvalidState(format!("lock of unknown resource {}", resource.handle))
        })?;
        alloc.locks += 1;
        Ok(alloc.ptr)
    }

    fn unlock(&self, resource: &GpuResource) {
        let mut state = self.state.lock();
        if let Some(alloc) = state.allocations.get_mut(&resource.handle) {
            debug_assert!(alloc.locks > 0, "unbalanced unlock");
            alloc.locks = alloc.locks.saturating_sub(1);
        }
    }

    fn register_resource(&self, handle: u64, write: bool) -> HeapResult<()> {
        let mut state = self.state.lock();
        if !state.allocations.contains_key(&handle) {
            return Err(HeapError::InvalidParameter(format!(
                "register of unknown resource {handle}"
            )));
        }
        match state.registered.iter_mut().find(|(h, _)| *h == handle) {
            Some(entry) => entry.1 |= write,
            None => state.registered.push((handle, write)),
        }
        Ok(())
    }

    fn submit(&self, submission: Submission) -> HeapResult<()> {
        let mut state = self.state.lock();
        let alloc = state.allocations.get(&submission.buffer).ok_or_else(|| {
            HeapError::InvalidParameter(format!("submit of unknown buffer {}", submission.buffer))
        })?;
        if submission.used > alloc.mapped {
            return Err(HeapError::InvalidParameter(
                "submission larger than its buffer".into(),
            ));
        }
        let mut commands = vec![0u8; submission.used];
        unsafe {
            ptr::copy_nonoverlapping(alloc.ptr, commands.as_mut_ptr(), submission.used);
        }
        let registered = std::mem::take(&mut state.registered);
        let mut resources: Vec<u64> = registered.into_iter().map(|(h, _)| h).collect();
        for h in &submission.resources {
            if !resources.contains(h) {
                resources.push(*h);
            }
        }
        trace!(buffer = submission.buffer, used = submission.used, "batch queued");
        state.pending.push_back(SubmittedBatch {
            commands,
            resources,
            submission,
        });
        Ok(())
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (handle, alloc) in state.allocations.drain() {
            debug!(handle, "releasing leaked host allocation");
            unsafe {
                libc::munmap(alloc.ptr.cast(), alloc.mapped);
            }
        }
    }
}

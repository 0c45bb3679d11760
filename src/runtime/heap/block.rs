use crate::error::{HeapError, HeapResult};
use crate::os::{AllocFlags, GpuResource, OsInterface};
use crate::runtime::tracker::FrameTrackerToken;
use parking_lot::Mutex;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

// ===============================================================================================
// Heap memory
// ===============================================================================================

/// One contiguous GPU allocation managed as a unit.
///
/// The backing buffer is freed when the last reference goes away, which is
/// after the heap manager has dropped it and every block handle into it is
/// gone.
#[derive(Debug)]
pub struct HeapMemory {
    id: u32,
    resource: GpuResource,
    os: Arc<dyn OsInterface>,
    /// CPU mapping held for the heap's whole life, if requested.
    persistent: Option<*mut u8>,
}

// The persistent mapping is only dereferenced through bounds-checked
// methods, and the OS layer owns the underlying memory.
unsafe impl Send for HeapMemory {}
unsafe impl Sync for HeapMemory {}

impl HeapMemory {
    pub fn allocate(
        os: Arc<dyn OsInterface>,
        id: u32,
        size: usize,
        hw_write_only: bool,
        keep_locked: bool,
        name: &str,
    ) -> HeapResult<Self> {
        let mut flags = AllocFlags::new().host_access();
        if hw_write_only {
            flags = flags.hw_write_only();
        }
        let resource = os.allocate(size, flags, name)?;
        let persistent = if keep_locked {
            match os.lock(&resource) {
                Ok(p) => Some(p),
                Err(e) => {
                    os.free(&resource);
                    return Err(e);
                }
            }
        } else {
            None
        };
        debug!(id, size, keep_locked, "heap created");
        Ok(Self {
            id,
            resource,
            os,
            persistent,
        })
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.resource.size
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.resource.gpu_va
    }

    #[must_use]
    pub const fn resource(&self) -> &GpuResource {
        &self.resource
    }

    #[must_use]
    pub const fn os(&self) -> &Arc<dyn OsInterface> {
        &self.os
    }

    #[must_use]
    pub const fn is_hw_write_only(&self) -> bool {
        self.resource.flags.hw_write_only
    }

    #[must_use]
    pub const fn keeps_locked(&self) -> bool {
        self.persistent.is_some()
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> HeapResult<()> {
        self.check_range(offset, data.len())?;
        self.with_mapping(|base| unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), base.add(offset), data.len());
        })
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> HeapResult<()> {
        self.check_range(offset, len)?;
        self.with_mapping(|base| unsafe {
            ptr::write_bytes(base.add(offset), byte, len);
        })
    }

    pub fn read(&self, offset: usize, len: usize) -> HeapResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let mut out = vec![0u8; len];
        self.with_mapping(|base| unsafe {
            ptr::copy_nonoverlapping(base.add(offset), out.as_mut_ptr(), len);
        })?;
        Ok(out)
    }

    fn check_range(&self, offset: usize, len: usize) -> HeapResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(HeapError::InvalidParameter(format!(
                "access of {len} bytes at {offset} outside heap {} of {} bytes",
                self.id,
                self.size()
            ))),
        }
    }

    /// Runs `f` on the CPU mapping, locking around it unless the heap stays
    /// locked.
    fn with_mapping<T>(&self, f: impl FnOnce(*mut u8) -> T) -> HeapResult<T> {
        if let Some(base) = self.persistent {
            return Ok(f(base));
        }
        let base = self.os.lock(&self.resource)?;
        let out = f(base);
        self.os.unlock(&self.resource);
        Ok(out)
    }
}

impl Drop for HeapMemory {
    fn drop(&mut self) {
        if self.persistent.take().is_some() {
            self.os.unlock(&self.resource);
        }
        self.os.free(&self.resource);
        debug!(id = self.id, "heap released");
    }
}

// ===============================================================================================
// Blocks
// ===============================================================================================

/// Lifecycle of a block. `PendingFree` only occurs in retired heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    Free = 0,
    Acquired = 1,
    Submitted = 2,
    PendingFree = 3,
}

impl BlockState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Acquired,
            2 => Self::Submitted,
            3 => Self::PendingFree,
            _ => Self::Free,
        }
    }
}

/// State shared between the block manager's record and client handles.
#[derive(Debug)]
pub(crate) struct BlockShared {
    state: AtomicU8,
    token: Mutex<FrameTrackerToken>,
    pub(crate) tracker_index: u32,
    pub(crate) tracker_id: u32,
}

impl BlockShared {
    pub(crate) fn new(state: BlockState, tracker_index: u32, tracker_id: u32) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(state as u8),
            token: Mutex::new(FrameTrackerToken::default()),
            tracker_index,
            tracker_id,
        })
    }

    pub(crate) fn state(&self) -> BlockState {
        BlockState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: BlockState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_token(&self, token: FrameTrackerToken) {
        *self.token.lock() = token;
    }

    pub(crate) fn token(&self) -> FrameTrackerToken {
        self.token.lock().clone()
    }
}

/// A client handle to a sub-range of a heap.
///
/// Handles stay cheap to clone; ownership of the range itself is tracked by
/// the heap manager, and a handle whose range was reclaimed reports
/// [`BlockState::Free`].
#[derive(Debug, Clone)]
pub struct MemoryBlock {
    heap: Arc<HeapMemory>,
    offset: usize,
    size: usize,
    is_static: bool,
    pub(crate) shared: Arc<BlockShared>,
}

impl MemoryBlock {
    pub(crate) const fn new(
        heap: Arc<HeapMemory>,
        offset: usize,
        size: usize,
        is_static: bool,
        shared: Arc<BlockShared>,
    ) -> Self {
        Self {
            heap,
            offset,
            size,
            is_static,
            shared,
        }
    }

    #[must_use]
    pub fn heap_id(&self) -> u32 {
        self.heap.id()
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn is_static(&self) -> bool {
        self.is_static
    }

    #[must_use]
    pub fn heap(&self) -> &Arc<HeapMemory> {
        &self.heap
    }

    #[must_use]
    pub fn state(&self) -> BlockState {
        self.shared.state()
    }

    /// True while the range still belongs to this handle.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.state() != BlockState::Free
    }

    #[must_use]
    pub fn token(&self) -> FrameTrackerToken {
        self.shared.token()
    }

    #[must_use]
    pub fn gpu_address(&self) -> u64 {
        self.heap.gpu_address() + self.offset as u64
    }

    /// Copies `data` to `offset` within the block. Writes are only legal
    /// before submission.
    pub fn add_data(&self, offset: usize, data: &[u8]) -> HeapResult<()> {
        self.check_writable(offset, data.len())?;
        self.heap.write(self.offset + offset, data)
    }

    pub fn zero(&self) -> HeapResult<()> {
        self.check_writable(0, self.size)?;
        self.heap.fill(self.offset, self.size, 0)
    }

    pub fn zero_range(&self, offset: usize, len: usize) -> HeapResult<()> {
        self.check_writable(offset, len)?;
        self.heap.fill(self.offset + offset, len, 0)
    }

    pub fn read_data(&self, offset: usize, len: usize) -> HeapResult<Vec<u8>> {
        self.check_range(offset, len)?;
        self.heap.read(self.offset + offset, len)
    }

    fn check_writable(&self, offset: usize, len: usize) -> HeapResult<()> {
        let state = self.state();
        if state != BlockState::Acquired {
            debug_assert!(false, "CPU write to block in state {state:?}");
            return Err(HeapError::InvalidState(format!(
                "write to block at {} of heap {} in state {state:?}",
                self.offset,
                self.heap_id()
            )));
        }
        self.check_range(offset, len)
    }

    fn check_range(&self, offset: usize, len: usize) -> HeapResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HeapError::InvalidParameter(format!(
                "block access of {len} bytes at {offset} exceeds block size {}",
                self.size
            ))),
        }
    }
}

use super::kernel::{IshSlot, Kernel};
use crate::error::{HeapError, HeapResult};
use crate::os::OsInterface;
use crate::runtime::heap::HeapMemory;
use crate::runtime::tracker::FrameTrackerToken;
use crate::utils::align_up;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

static NEXT_ISH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct IshConfig {
    pub initial_size: usize,
    pub expand_step: usize,
    pub max_size: usize,
    /// Zeroed bytes kept after every kernel for instruction prefetch.
    pub padding: usize,
    pub alignment: usize,
    pub keep_locked: bool,
}

impl Default for IshConfig {
    fn default() -> Self {
        Self {
            initial_size: 1024 * 1024,
            expand_step: 64 * 1024,
            max_size: 16 * 1024 * 1024,
            padding: 64,
            alignment: 64,
            keep_locked: false,
        }
    }
}

/// A kernel copy in the current backing.
#[derive(Debug)]
struct Resident {
    offset: usize,
    size: usize,
    name: String,
    /// Submissions that read this copy.
    token: FrameTrackerToken,
    uses: u64,
    last_touch: u64,
}

/// Instruction-state heap: resident kernel binaries, deduplicated by content.
///
/// Kernels that no pending submission reads can be evicted, least recently
/// used first, to make room before the heap is expanded.
#[derive(Debug)]
pub struct InstructionStateHeap {
    os: Arc<dyn OsInterface>,
    id: u64,
    config: IshConfig,
    current: Arc<HeapMemory>,
    next_heap_id: u32,
    generation: u32,
    cursor: usize,
    /// content hash -> copy, valid for the current generation only
    resident: HashMap<[u8; 32], Resident>,
    /// Evicted ranges below the cursor, sorted by offset and coalesced.
    holes: Vec<(usize, usize)>,
    /// Kernels handed out since the last submit.
    touched: Vec<[u8; 32]>,
    touch_clock: u64,
    evictions: u64,
    sip: Option<Arc<Kernel>>,
    sip_offset: Option<usize>,
    /// Last submission that used the current backing.
    last_use: FrameTrackerToken,
    pending_free: VecDeque<(Arc<HeapMemory>, FrameTrackerToken)>,
}

/// First fit among `holes`, else append at `cursor`.
fn place(
    holes: &mut Vec<(usize, usize)>,
    cursor: &mut usize,
    capacity: usize,
    size: usize,
) -> Option<usize> {
    if let Some(i) = holes.iter().position(|&(_, len)| len >= size) {
        let (offset, len) = holes[i];
        if len == size {
            holes.remove(i);
        } else {
            holes[i] = (offset + size, len - size);
        }
        return Some(offset);
    }
    if *cursor + size > capacity {
        return None;
    }
    let offset = *cursor;
    *cursor += size;
    Some(offset)
}

impl InstructionStateHeap {
    pub fn new(os: Arc<dyn OsInterface>, config: IshConfig) -> HeapResult<Self> {
        if config.initial_size == 0 || config.alignment == 0 {
            return Err(HeapError::InvalidParameter(
                "instruction heap size and alignment must be non-zero".into(),
            ));
        }
        if config.initial_size > config.max_size {
            return Err(HeapError::InvalidParameter(format!(
                "instruction heap initial size {} exceeds its limit {}",
                config.initial_size, config.max_size
            )));
        }
        let id = NEXT_ISH_ID.fetch_add(1, Ordering::Relaxed);
        let size = align_up(config.initial_size, config.expand_step.max(1)).min(config.max_size);
        let current = Arc::new(Self::allocate_backing(&os, id, 1, size, config.keep_locked)?);
        Ok(Self {
            os,
            id,
            config,
            current,
            next_heap_id: 2,
            generation: 1,
            cursor: 0,
            resident: HashMap::new(),
            holes: Vec::new(),
            touched: Vec::new(),
            touch_clock: 0,
            evictions: 0,
            sip: None,
            sip_offset: None,
            last_use: FrameTrackerToken::default(),
            pending_free: VecDeque::new(),
        })
    }

    fn allocate_backing(
        os: &Arc<dyn OsInterface>,
        owner: u64,
        heap_id: u32,
        size: usize,
        keep_locked: bool,
    ) -> HeapResult<HeapMemory> {
        HeapMemory::allocate(
            os.clone(),
            heap_id,
            size,
            false,
            keep_locked,
            &format!("ish{owner}#{heap_id}"),
        )
    }

    /// Installs the preemption handler. It is loaded ahead of the next user
    /// kernel and again after every expansion, and is never evicted.
    pub fn set_sip_kernel(&mut self, sip: Arc<Kernel>) {
        self.sip = Some(sip);
        self.sip_offset = None;
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[must_use]
    pub fn base_address(&self) -> u64 {
        self.current.gpu_address()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.current.size()
    }

    /// Bytes held by resident kernels and the SIP.
    #[must_use]
    pub fn used(&self) -> usize {
        self.cursor - self.holes.iter().map(|&(_, len)| len).sum::<usize>()
    }

    #[must_use]
    pub fn heap(&self) -> &Arc<HeapMemory> {
        &self.current
    }

    #[must_use]
    pub const fn sip_offset(&self) -> Option<usize> {
        self.sip_offset
    }

    #[must_use]
    pub fn pending_free_count(&self) -> usize {
        self.pending_free.len()
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    #[must_use]
    pub const fn evictions(&self) -> u64 {
        self.evictions
    }

    /// How many loads handed out the resident copy of `kernel`.
    #[must_use]
    pub fn use_count(&self, kernel: &Kernel) -> Option<u64> {
        self.resident.get(kernel.hash()).map(|r| r.uses)
    }

    /// Offset of a kernel if it is resident in this generation.
    #[must_use]
    pub fn kernel_offset(&self, kernel: &Kernel) -> Option<usize> {
        self.resident.get(kernel.hash()).map(|r| r.offset)
    }

    fn padded_size(&self, kernel: &Kernel) -> usize {
        align_up(kernel.binary().len() + self.config.padding, self.config.alignment)
    }

    /// Makes every kernel resident and returns their offsets in input order.
    ///
    /// Missing kernels go into free ranges first. When they do not fit, idle
    /// kernels are evicted oldest first; only then is the heap expanded,
    /// never past `max_size`.
    pub fn load_kernels(&mut self, kernels: &[Arc<Kernel>]) -> HeapResult<Vec<usize>> {
        for kernel in kernels {
            let padded = self.padded_size(kernel);
            if padded > self.config.max_size {
                return Err(HeapError::InvalidParameter(format!(
                    "kernel '{}' needs {padded} bytes, instruction heap limit is {}",
                    kernel.name(),
                    self.config.max_size
                )));
            }
        }
        self.touched.clear();

        let mut missing = self.request_sizes(kernels, false);
        if !self.fits(&missing) {
            self.evict_for(&missing, kernels);
        }
        if !self.fits(&missing) {
            // a fresh generation must hold the whole request
            let fresh: usize = self.request_sizes(kernels, true).iter().sum();
            if fresh > self.config.max_size {
                warn!(
                    ish = self.id,
                    needed = fresh,
                    limit = self.config.max_size,
                    "kernels do not fit the instruction heap limit"
                );
                return Err(HeapError::NoSpace { needed: fresh });
            }
            self.expand(missing.iter().sum(), fresh)?;
            missing = self.request_sizes(kernels, false);
            if !self.fits(&missing) {
                return Err(HeapError::NoSpace {
                    needed: missing.iter().sum(),
                });
            }
        }

        if self.sip_offset.is_none()
            && let Some(sip) = self.sip.clone()
        {
            let offset = self.copy_kernel(&sip)?;
            self.sip_offset = Some(offset);
        }

        let mut offsets = Vec::with_capacity(kernels.len());
        for kernel in kernels {
            let offset = match self.kernel_offset(kernel) {
                Some(offset) => {
                    kernel.set_ish_slot(self.slot(offset, kernel));
                    offset
                }
                None => {
                    let offset = self.copy_kernel(kernel)?;
                    let size = self.padded_size(kernel);
                    self.resident.insert(
                        *kernel.hash(),
                        Resident {
                            offset,
                            size,
                            name: kernel.name().to_string(),
                            token: FrameTrackerToken::default(),
                            uses: 0,
                            last_touch: 0,
                        },
                    );
                    offset
                }
            };
            self.touch(kernel.hash());
            offsets.push(offset);
        }
        Ok(offsets)
    }

    /// Padded sizes this call would place, SIP first. With `fresh`, sizes
    /// for an empty heap.
    fn request_sizes(&self, kernels: &[Arc<Kernel>], fresh: bool) -> Vec<usize> {
        let mut seen: Vec<&[u8; 32]> = Vec::new();
        let mut sizes = Vec::with_capacity(kernels.len() + 1);
        if (fresh || self.sip_offset.is_none())
            && let Some(sip) = &self.sip
        {
            sizes.push(self.padded_size(sip));
        }
        for kernel in kernels {
            let resident = !fresh && self.kernel_offset(kernel).is_some();
            if resident || seen.contains(&kernel.hash()) {
                continue;
            }
            seen.push(kernel.hash());
            sizes.push(self.padded_size(kernel));
        }
        sizes
    }

    fn fits(&self, sizes: &[usize]) -> bool {
        let mut holes = self.holes.clone();
        let mut cursor = self.cursor;
        let capacity = self.current.size();
        sizes
            .iter()
            .all(|&size| place(&mut holes, &mut cursor, capacity, size).is_some())
    }

    /// Evicts idle kernels, least recently used first, until `sizes` fit.
    /// Kernels of the current request stay.
    fn evict_for(&mut self, sizes: &[usize], keep: &[Arc<Kernel>]) -> usize {
        let mut idle: Vec<([u8; 32], u64)> = self
            .resident
            .iter()
            .filter(|(hash, r)| r.token.is_expired() && !keep.iter().any(|k| k.hash() == *hash))
            .map(|(hash, r)| (*hash, r.last_touch))
            .collect();
        idle.sort_by_key(|&(_, touched)| touched);

        let mut evicted = 0;
        for (hash, _) in idle {
            if self.fits(sizes) {
                break;
            }
            if let Some(r) = self.evict(&hash) {
                debug!(ish = self.id, kernel = %r.name, offset = r.offset, "idle kernel evicted");
                evicted += 1;
            }
        }
        evicted
    }

    fn evict(&mut self, hash: &[u8; 32]) -> Option<Resident> {
        let resident = self.resident.remove(hash)?;
        self.release_range(resident.offset, resident.size);
        self.touched.retain(|h| h != hash);
        self.evictions += 1;
        Some(resident)
    }

    fn release_range(&mut self, offset: usize, size: usize) {
        let at = self.holes.partition_point(|&(o, _)| o < offset);
        self.holes.insert(at, (offset, size));
        if at + 1 < self.holes.len() && offset + size == self.holes[at + 1].0 {
            self.holes[at].1 += self.holes[at + 1].1;
            self.holes.remove(at + 1);
        }
        if at > 0 && self.holes[at - 1].0 + self.holes[at - 1].1 == offset {
            self.holes[at - 1].1 += self.holes[at].1;
            self.holes.remove(at);
        }
        // a hole at the top goes back to the cursor
        if let Some(&(last, len)) = self.holes.last()
            && last + len == self.cursor
        {
            self.cursor = last;
            self.holes.pop();
        }
    }

    fn touch(&mut self, hash: &[u8; 32]) {
        self.touch_clock += 1;
        if let Some(r) = self.resident.get_mut(hash) {
            r.last_touch = self.touch_clock;
            r.uses += 1;
        }
        if !self.touched.contains(hash) {
            self.touched.push(*hash);
        }
    }

    fn slot(&self, offset: usize, kernel: &Kernel) -> IshSlot {
        IshSlot {
            owner: self.id,
            generation: self.generation,
            offset,
            hash: *kernel.hash(),
        }
    }

    fn copy_kernel(&mut self, kernel: &Kernel) -> HeapResult<usize> {
        let padded = self.padded_size(kernel);
        let offset = place(&mut self.holes, &mut self.cursor, self.current.size(), padded)
            .ok_or(HeapError::NoSpace { needed: padded })?;
        let binary = kernel.binary();
        self.current.write(offset, binary)?;
        self.current
            .fill(offset + binary.len(), padded - binary.len(), 0)?;
        kernel.set_ish_slot(self.slot(offset, kernel));
        debug!(kernel = kernel.name(), offset, size = padded, "kernel loaded");
        Ok(offset)
    }

    /// Replaces the backing with a larger buffer of at most `max_size`
    /// bytes and at least `fresh`. The old one is freed once the last
    /// submission that used it completes.
    fn expand(&mut self, needed: usize, fresh: usize) -> HeapResult<()> {
        self.reclaim();

        let step = self.config.expand_step.max(1);
        let size = align_up(self.current.size() + needed, step)
            .min(self.config.max_size)
            .max(fresh);
        let heap_id = self.next_heap_id;
        let backing = Self::allocate_backing(&self.os, self.id, heap_id, size, self.config.keep_locked)?;
        self.next_heap_id += 1;

        let old = std::mem::replace(&mut self.current, Arc::new(backing));
        let token = std::mem::take(&mut self.last_use);
        if token.is_valid() {
            self.pending_free.push_back((old, token));
        }
        self.generation += 1;
        self.reset_residency();
        info!(ish = self.id, generation = self.generation, size, "instruction heap expanded");
        Ok(())
    }

    fn reset_residency(&mut self) {
        self.cursor = 0;
        self.resident.clear();
        self.holes.clear();
        self.touched.clear();
        self.sip_offset = None;
    }

    /// Frees retired backings from the oldest while their trackers expired.
    pub fn reclaim(&mut self) -> usize {
        let mut freed = 0;
        while let Some((_, token)) = self.pending_free.front() {
            if !token.is_expired() {
                break;
            }
            self.pending_free.pop_front();
            freed += 1;
        }
        if freed > 0 {
            debug!(ish = self.id, freed, "retired instruction heaps released");
        }
        freed
    }

    /// Records a submission that references kernels in the current backing,
    /// including every kernel handed out since the previous call.
    pub fn submit(&mut self, token: &FrameTrackerToken) {
        self.last_use.merge(token);
        for hash in self.touched.drain(..) {
            if let Some(r) = self.resident.get_mut(&hash) {
                r.token.merge(token);
            }
        }
    }

    /// Removes `kernel` and frees its range. Returns `false` when it was not
    /// resident.
    ///
    /// # Errors
    /// `KernelBusy` while a submission that reads the kernel is pending.
    pub fn unload_kernel(&mut self, kernel: &Kernel) -> HeapResult<bool> {
        let Some(resident) = self.resident.get(kernel.hash()) else {
            return Ok(false);
        };
        if !resident.token.is_expired() {
            return Err(HeapError::KernelBusy(kernel.name().to_string()));
        }
        if let Some(r) = self.evict(kernel.hash()) {
            debug!(ish = self.id, kernel = %r.name, offset = r.offset, uses = r.uses, "kernel unloaded");
        }
        Ok(true)
    }

    /// Rewinds the append cursor for a whole-heap reuse cycle. Residency
    /// records from before the call stop matching.
    pub fn clean(&mut self) {
        self.generation += 1;
        self.reset_residency();
        debug!(ish = self.id, generation = self.generation, "instruction heap cleaned");
    }
}

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// Where a kernel was last copied into an instruction heap.
///
/// The owner and generation identify the heap instance; a slot from any
/// other instance or generation is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IshSlot {
    pub owner: u64,
    pub generation: u32,
    pub offset: usize,
    pub hash: [u8; 32],
}

/// A compiled GPU kernel and the resources it asks for per dispatch.
#[derive(Debug)]
pub struct Kernel {
    name: String,
    binary: Vec<u8>,
    hash: [u8; 32],
    curbe_size: usize,
    spill_size: usize,
    samplers_3d: u32,
    samplers_avs: u32,
    /// Highest sampler index the kernel binds explicitly, if any.
    max_pinned_sampler: Option<u32>,
    slm_size: u32,
    ish_slot: Mutex<Option<IshSlot>>,
}

#[must_use]
pub fn content_hash(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

impl Kernel {
    #[must_use]
    pub fn new(name: &str, binary: Vec<u8>) -> Self {
        let hash = content_hash(&binary);
        Self {
            name: name.to_string(),
            binary,
            hash,
            curbe_size: 0,
            spill_size: 0,
            samplers_3d: 0,
            samplers_avs: 0,
            max_pinned_sampler: None,
            slm_size: 0,
            ish_slot: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_curbe_size(mut self, size: usize) -> Self {
        self.curbe_size = size;
        self
    }

    #[must_use]
    pub const fn with_spill_size(mut self, size: usize) -> Self {
        self.spill_size = size;
        self
    }

    #[must_use]
    pub const fn with_samplers(mut self, samplers_3d: u32, samplers_avs: u32) -> Self {
        self.samplers_3d = samplers_3d;
        self.samplers_avs = samplers_avs;
        self
    }

    #[must_use]
    pub const fn with_pinned_sampler(mut self, index: u32) -> Self {
        self.max_pinned_sampler = match self.max_pinned_sampler {
            Some(cur) if cur >= index => Some(cur),
            _ => Some(index),
        };
        self
    }

    #[must_use]
    pub const fn with_slm_size(mut self, size: u32) -> Self {
        self.slm_size = size;
        self
    }

    /// Replaces the binary; the kernel is treated as new by every heap.
    pub fn set_binary(&mut self, binary: Vec<u8>) {
        self.hash = content_hash(&binary);
        self.binary = binary;
        *self.ish_slot.get_mut() = None;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    #[must_use]
    pub const fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    #[must_use]
    pub const fn curbe_size(&self) -> usize {
        self.curbe_size
    }

    #[must_use]
    pub const fn spill_size(&self) -> usize {
        self.spill_size
    }

    #[must_use]
    pub const fn samplers_3d(&self) -> u32 {
        self.samplers_3d
    }

    #[must_use]
    pub const fn samplers_avs(&self) -> u32 {
        self.samplers_avs
    }

    /// Number of 3D sampler slots kept for explicitly bound samplers.
    #[must_use]
    pub const fn reserved_sampler_slots(&self) -> u32 {
        match self.max_pinned_sampler {
            Some(i) => i + 1,
            None => 0,
        }
    }

    #[must_use]
    pub const fn slm_size(&self) -> u32 {
        self.slm_size
    }

    #[must_use]
    pub fn ish_slot(&self) -> Option<IshSlot> {
        *self.ish_slot.lock()
    }

    pub(crate) fn set_ish_slot(&self, slot: IshSlot) {
        *self.ish_slot.lock() = Some(slot);
    }
}

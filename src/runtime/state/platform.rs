/// Hardware sizes, alignments and limits the heaps lay their contents out
/// with. Defaults describe a Gen9-class part.
#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub name: String,

    // Dynamic state
    pub sampler_state_size: usize,
    pub avs_sampler_state_size: usize,
    pub sampler_indirect_state_size: usize,
    pub sampler_indirect_alignment: usize,
    pub sampler_alignment: usize,
    pub interface_descriptor_size: usize,
    pub curbe_alignment: usize,
    pub dsh_block_alignment: usize,

    // Scratch
    pub scratch_granularity: usize,
    pub scratch_alignment: usize,
    pub max_hw_threads: usize,
    /// Scratch lives in its own buffer instead of the dynamic-state heap.
    pub dedicated_scratch: bool,

    // Surface state
    pub surface_state_size: usize,
    pub bte_size: usize,
    pub binding_table_alignment: usize,
    pub max_bte_per_table: u32,
    pub max_binding_tables: u32,
    pub max_surface_states: u32,
    /// `[start, end)` entry ranges no table may hand out.
    pub reserved_bte_ranges: Vec<(u32, u32)>,

    // Dispatch
    pub max_kernels_per_task: usize,
    pub max_3d_samplers: u32,
    pub max_avs_samplers: u32,
    pub walker_max_width: u32,
    pub walker_max_height: u32,
    pub max_threads_per_group: u32,
    pub slm_granularity: u32,
    pub has_sip: bool,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            name: "gen9".to_string(),
            sampler_state_size: 16,
            avs_sampler_state_size: 2048,
            sampler_indirect_state_size: 64,
            sampler_indirect_alignment: 64,
            sampler_alignment: 64,
            interface_descriptor_size: 32,
            curbe_alignment: 64,
            dsh_block_alignment: 64,
            scratch_granularity: 1024,
            scratch_alignment: 1024,
            max_hw_threads: 448,
            dedicated_scratch: false,
            surface_state_size: 64,
            bte_size: 4,
            binding_table_alignment: 64,
            max_bte_per_table: 256,
            max_binding_tables: 64,
            max_surface_states: 1024,
            reserved_bte_ranges: Vec::new(),
            max_kernels_per_task: 16,
            max_3d_samplers: 16,
            max_avs_samplers: 8,
            walker_max_width: 2047,
            walker_max_height: 2047,
            max_threads_per_group: 64,
            slm_granularity: 4096,
            has_sip: false,
        }
    }
}

impl PlatformInfo {
    /// Pre-Gen9 walker width limit.
    pub const LEGACY_WALKER_MAX_WIDTH: u32 = 511;

    /// A Gen8-class part: narrower walker, no SIP.
    #[must_use]
    pub fn legacy() -> Self {
        Self {
            name: "gen8".to_string(),
            walker_max_width: Self::LEGACY_WALKER_MAX_WIDTH,
            walker_max_height: Self::LEGACY_WALKER_MAX_WIDTH,
            max_hw_threads: 336,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_sampler_alignment(mut self, align: usize) -> Self {
        self.sampler_alignment = align;
        self
    }

    #[must_use]
    pub const fn with_max_hw_threads(mut self, threads: usize) -> Self {
        self.max_hw_threads = threads;
        self
    }

    #[must_use]
    pub const fn with_dedicated_scratch(mut self, dedicated: bool) -> Self {
        self.dedicated_scratch = dedicated;
        self
    }

    #[must_use]
    pub const fn with_sip(mut self, has_sip: bool) -> Self {
        self.has_sip = has_sip;
        self
    }

    #[must_use]
    pub const fn with_surface_limits(mut self, max_bte_per_table: u32, max_surface_states: u32) -> Self {
        self.max_bte_per_table = max_bte_per_table;
        self.max_surface_states = max_surface_states;
        self
    }

    #[must_use]
    pub fn with_reserved_bte_range(mut self, start: u32, end: u32) -> Self {
        self.reserved_bte_ranges.push((start, end));
        self
    }

    #[must_use]
    pub fn is_reserved_bte(&self, index: u32) -> bool {
        self.reserved_bte_ranges
            .iter()
            .any(|&(s, e)| index >= s && index < e)
    }
}

#![allow(clippy::cast_possible_truncation)]

use super::platform::PlatformInfo;
use super::scratch::ScratchSpace;
use super::surface::{SurfaceRecord, SurfaceState};
use crate::error::{HeapError, HeapResult};
use crate::runtime::queues::encoder::RenderEncoder;
use crate::utils::align_up;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static NEXT_SSH_ID: AtomicU64 = AtomicU64::new(1);

/// Hardware ceiling on entries per binding table.
pub const MAX_BTE_PER_TABLE: u32 = 256;

#[derive(Debug, Clone)]
struct BindingTable {
    /// Byte offset inside the region.
    start: usize,
    occupied: [u64; 4],
    cursor: u32,
    highest: Option<u32>,
}

impl BindingTable {
    const fn new(start: usize) -> Self {
        Self {
            start,
            occupied: [0; 4],
            cursor: 0,
            highest: None,
        }
    }

    const fn is_set(&self, index: u32) -> bool {
        self.occupied[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: u32) {
        self.occupied[(index / 64) as usize] |= 1 << (index % 64);
        self.highest = Some(self.highest.map_or(index, |h| h.max(index)));
    }

    fn used_len(&self) -> u32 {
        self.highest.map_or(0, |h| h + 1)
    }
}

/// Surface-state heap of one command buffer.
///
/// The region is split into a binding-table area (the first quarter) and the
/// surface-state slots after it. Contents are staged here and copied into
/// the tail of the command buffer when it is finalized; offsets are relative
/// to the region start, which is the surface-state base address.
#[derive(Debug)]
pub struct SurfaceStateHeap {
    id: u64,
    platform: Arc<PlatformInfo>,
    encoder: Arc<dyn RenderEncoder>,
    region: Vec<u8>,
    bt_area: usize,
    ss_base: usize,
    ss_capacity: u32,
    next_ss: u32,
    tables: Vec<BindingTable>,
    resources: Vec<(u64, bool)>,
}

impl SurfaceStateHeap {
    pub fn new(
        platform: Arc<PlatformInfo>,
        encoder: Arc<dyn RenderEncoder>,
        size: usize,
    ) -> HeapResult<Self> {
        let bt_area = align_up(size / 4, platform.binding_table_alignment);
        let ss_base = align_up(bt_area, platform.surface_state_size);
        if platform.bte_size == 0 || platform.surface_state_size == 0 || ss_base >= size {
            return Err(HeapError::InvalidParameter(format!(
                "surface state region of {size} bytes is too small"
            )));
        }
        let slots = (size - ss_base) / platform.surface_state_size;
        let ss_capacity = (slots as u32).min(platform.max_surface_states);
        let id = NEXT_SSH_ID.fetch_add(1, Ordering::Relaxed);
        debug!(ssh = id, size, bt_area, ss_capacity, "surface state heap created");
        Ok(Self {
            id,
            platform,
            encoder,
            region: vec![0; size],
            bt_area,
            ss_base,
            ss_capacity,
            next_ss: 0,
            tables: Vec::new(),
            resources: Vec::new(),
        })
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Staged region bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.region
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    #[must_use]
    pub const fn surface_state_count(&self) -> u32 {
        self.next_ss
    }

    /// Buffers referenced by the surface states, with their write flag.
    #[must_use]
    pub fn resources(&self) -> &[(u64, bool)] {
        &self.resources
    }

    /// Offset of the table relative to the surface-state base.
    pub fn binding_table_offset(&self, table: u32) -> HeapResult<u32> {
        Ok(self.table(table)?.start as u32)
    }

    #[must_use]
    pub fn surface_state_offset(&self, index: u32) -> usize {
        self.ss_base + index as usize * self.platform.surface_state_size
    }

    /// The 32-bit entry written at `bte` of `table`.
    pub fn binding_table_entry(&self, table: u32, bte: u32) -> HeapResult<u32> {
        let at = self.table(table)?.start + bte as usize * self.platform.bte_size;
        self.region
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| HeapError::InvalidState(format!("entry {bte} outside the region")))
    }

    fn table(&self, table: u32) -> HeapResult<&BindingTable> {
        self.tables.get(table as usize).ok_or_else(|| {
            debug_assert!(false, "binding table {table} was never assigned");
            HeapError::InvalidState(format!("binding table {table} was never assigned"))
        })
    }

    fn table_capacity(&self, table: usize) -> u32 {
        let start = self.tables[table].start;
        let end = self.tables.get(table + 1).map_or(self.bt_area, |next| next.start);
        let by_space = ((end - start) / self.platform.bte_size) as u32;
        by_space
            .min(self.platform.max_bte_per_table)
            .min(MAX_BTE_PER_TABLE)
    }

    // ===========================================================================================
    // Binding tables
    // ===========================================================================================

    /// Opens the next binding table, placed after the highest entry the
    /// previous table used.
    pub fn assign_binding_table(&mut self) -> HeapResult<u32> {
        if self.tables.len() >= self.platform.max_binding_tables as usize {
            warn!(ssh = self.id, "binding table limit reached");
            return Err(HeapError::TooManyBindingTableEntries);
        }
        let start = self.tables.last().map_or(0, |prev| {
            align_up(
                prev.start + prev.used_len() as usize * self.platform.bte_size,
                self.platform.binding_table_alignment,
            )
        });
        if start + self.platform.bte_size > self.bt_area {
            warn!(ssh = self.id, start, "binding table area exhausted");
            return Err(HeapError::TooManyBindingTableEntries);
        }
        self.tables.push(BindingTable::new(start));
        Ok(self.tables.len() as u32 - 1)
    }

    /// Reserves `count` contiguous entries in `table`, scanning from the
    /// table's cursor and stepping over reserved ranges.
    pub fn get_free_binding_table_entries(&mut self, count: u32, table: u32) -> HeapResult<u32> {
        if count == 0 {
            return Err(HeapError::InvalidParameter("zero binding table entries".into()));
        }
        self.table(table)?;
        let capacity = self.table_capacity(table as usize);
        let platform = &self.platform;
        let bt = &mut self.tables[table as usize];

        let mut start = bt.cursor;
        while start + count <= capacity {
            match (start..start + count).find(|&i| bt.is_set(i) || platform.is_reserved_bte(i)) {
                Some(blocked) => start = blocked + 1,
                None => {
                    (start..start + count).for_each(|i| bt.set(i));
                    bt.cursor = start + count;
                    return Ok(start);
                }
            }
        }
        warn!(ssh = self.id, table, count, capacity, "binding table full");
        Err(HeapError::TooManyBindingTableEntries)
    }

    fn claim_entries(&mut self, table: u32, bte: u32, count: u32) -> HeapResult<()> {
        let capacity = self.table_capacity(table as usize);
        if bte.checked_add(count).is_none_or(|end| end > capacity) {
            return Err(HeapError::TooManyBindingTableEntries);
        }
        let bt = &mut self.tables[table as usize];
        if (bte..bte + count).any(|i| bt.is_set(i)) {
            return Err(HeapError::InvalidParameter(format!(
                "binding table entry {bte} of table {table} is already bound"
            )));
        }
        (bte..bte + count).for_each(|i| bt.set(i));
        Ok(())
    }

    // ===========================================================================================
    // Surface states
    // ===========================================================================================

    fn allocate_surface_states(&mut self, count: u32) -> HeapResult<u32> {
        if self.next_ss + count > self.ss_capacity {
            warn!(ssh = self.id, capacity = self.ss_capacity, "surface state slots exhausted");
            return Err(HeapError::TooManySurfaceStates);
        }
        let index = self.next_ss;
        self.next_ss += count;
        Ok(index)
    }

    fn write_at(&mut self, at: usize, data: &[u8]) -> HeapResult<()> {
        self.region
            .get_mut(at..at + data.len())
            .map(|dst| dst.copy_from_slice(data))
            .ok_or_else(|| {
                HeapError::InvalidState(format!(
                    "write of {} bytes at {at} outside the surface state region",
                    data.len()
                ))
            })
    }

    fn write_surface_state(&mut self, index: u32, encoded: &[u8]) -> HeapResult<()> {
        if encoded.len() > self.platform.surface_state_size {
            return Err(HeapError::InvalidState(format!(
                "encoded surface state of {} bytes, slot is {}",
                encoded.len(),
                self.platform.surface_state_size
            )));
        }
        self.write_at(self.surface_state_offset(index), encoded)
    }

    fn register(&mut self, handle: u64, write: bool) {
        match self.resources.iter_mut().find(|(h, _)| *h == handle) {
            Some(entry) => entry.1 |= write,
            None => self.resources.push((handle, write)),
        }
    }

    /// Binds `surface` into a binding table and returns its first entry.
    ///
    /// `table` defaults to the most recently assigned table (one is opened if
    /// none exists); `bte` defaults to the next free run. A surface already
    /// bound at the same place in this heap returns its existing entry.
    pub fn add_surface_state(
        &mut self,
        surface: &SurfaceState,
        bte: Option<u32>,
        table: Option<u32>,
    ) -> HeapResult<u32> {
        let table = match table {
            Some(t) => {
                self.table(t)?;
                t
            }
            None if self.tables.is_empty() => self.assign_binding_table()?,
            None => self.tables.len() as u32 - 1,
        };

        if let Some(record) = surface.find_record(self.id, table, bte) {
            return Ok(record.bte);
        }

        let planes = surface.planes().len() as u32;
        let existing_slot = surface.slot_in(self.id);
        if existing_slot.is_none() && self.next_ss + planes > self.ss_capacity {
            warn!(ssh = self.id, capacity = self.ss_capacity, "surface state slots exhausted");
            return Err(HeapError::TooManySurfaceStates);
        }

        let bte = match bte {
            Some(b) => {
                self.claim_entries(table, b, planes)?;
                b
            }
            None => self.get_free_binding_table_entries(planes, table)?,
        };

        let ss_index = match existing_slot {
            Some(index) => index,
            None => {
                let index = self.allocate_surface_states(planes)?;
                for plane in 0..planes {
                    let encoded = self.encoder.encode_surface_state(surface, plane as usize);
                    self.write_surface_state(index + plane, &encoded)?;
                }
                index
            }
        };

        let table_start = self.tables[table as usize].start;
        for plane in 0..planes {
            let entry = self.surface_state_offset(ss_index + plane) as u32;
            let at = table_start + (bte + plane) as usize * self.platform.bte_size;
            self.write_at(at, &entry.to_le_bytes())?;
        }

        self.register(surface.handle(), surface.is_write());
        surface.record(SurfaceRecord {
            ssh_id: self.id,
            table,
            bte,
            ss_index,
        });
        Ok(bte)
    }

    /// Gives the scratch buffer a surface state so the hardware can address
    /// it. Returns the slot index; no binding-table entry is used.
    pub fn add_scratch_space(&mut self, scratch: &ScratchSpace) -> HeapResult<u32> {
        let (Some(gpu_va), Some(handle)) = (scratch.gpu_address(), scratch.handle()) else {
            return Err(HeapError::InvalidState("scratch space has no buffer".into()));
        };
        let index = self.allocate_surface_states(1)?;
        let encoded = self.encoder.encode_scratch_surface(gpu_va, scratch.size());
        self.write_surface_state(index, &encoded)?;
        self.register(handle, true);
        Ok(index)
    }
}

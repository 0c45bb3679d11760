#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use crate::runtime::queues::walker::{Coord, WalkerParams};
use crate::runtime::state::surface::{SurfaceKind, SurfaceState};
use smallvec::SmallVec;

// ===============================================================================================
// Command parameters
// ===============================================================================================

/// Base addresses the relative offsets of later commands resolve against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateBaseAddress {
    /// General, dynamic and indirect-object state all live in the DSH heap.
    pub dynamic_state: u64,
    pub dynamic_state_size: u32,
    pub instruction: u64,
    pub instruction_size: u32,
    pub surface_state: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VfeParams {
    pub max_threads: u32,
    pub urb_entries: u32,
    /// Curbe bytes, rounded up to 32.
    pub curbe_allocation: u32,
    /// `log2(per_thread_bytes / 1024)`.
    pub per_thread_scratch: u32,
    pub scratch_base: u64,
    pub scoreboard_enable: bool,
    pub scoreboard_mask: u8,
    pub scoreboard_non_stalling: bool,
    pub scoreboard_deltas: SmallVec<[(i8, i8); 8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpgpuWalkerParams {
    pub interface_descriptor: u32,
    pub simd_size: u32,
    pub thread_width: u32,
    pub thread_height: u32,
    pub thread_depth: u32,
    pub group_width: u32,
    pub group_height: u32,
    pub group_depth: u32,
    pub right_mask: u32,
    pub bottom_mask: u32,
    pub slm_size: u32,
}

/// Hardware commands the dispatch assembler emits, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCommand {
    PipelineSelect { gpgpu: bool },
    StateBaseAddress(StateBaseAddress),
    StateSip { offset: u64 },
    VfeState(VfeParams),
    CurbeLoad { length: u32, offset: u32 },
    MediaIdLoad { length: u32, offset: u32 },
    MediaObjectWalker {
        interface_descriptor: u32,
        params: WalkerParams,
    },
    GpgpuWalker(GpgpuWalkerParams),
    PipeControl { flush_caches: bool, cs_stall: bool },
    /// Writes `value` into tracker slot `slot` once prior work completes.
    TrackerStore { slot: u32, value: u32 },
    BatchBufferEnd,
}

/// Per-kernel dispatch descriptor in the DSH media-ID region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterfaceDescriptor {
    /// Kernel start, relative to the instruction base.
    pub kernel_offset: u64,
    /// Sampler heap, relative to the dynamic-state base.
    pub sampler_offset: u32,
    pub sampler_count: u32,
    /// Binding table, relative to the surface-state base.
    pub binding_table_offset: u32,
    pub curbe_read_length: u32,
    pub curbe_offset: u32,
    pub threads_per_group: u32,
    pub slm_size: u32,
    pub barrier: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    #[default]
    Clamp,
    Wrap,
    Mirror,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplerDesc {
    pub filter: FilterMode,
    pub address: [AddressMode; 3],
    pub border_color: [f32; 4],
}

// ===============================================================================================
// Encoder
// ===============================================================================================

/// Turns commands and state records into the bytes the GPU consumes.
pub trait RenderEncoder: Send + Sync + std::fmt::Debug {
    /// Bytes `cmd` takes in the command stream.
    fn command_size(&self, cmd: &HwCommand) -> usize;

    fn encode(&self, cmd: &HwCommand, out: &mut Vec<u8>);

    fn encode_interface_descriptor(&self, desc: &InterfaceDescriptor) -> Vec<u8>;

    /// Surface state of one plane of `surface`.
    fn encode_surface_state(&self, surface: &SurfaceState, plane: usize) -> Vec<u8>;

    /// Raw-buffer surface state covering the scratch buffer.
    fn encode_scratch_surface(&self, gpu_va: u64, size: usize) -> Vec<u8>;

    /// Sampler state and its indirect (border color) state.
    fn encode_sampler(&self, sampler: &SamplerDesc) -> (Vec<u8>, Vec<u8>);
}

pub mod opcode {
    pub const PIPELINE_SELECT: u16 = 0x6904;
    pub const STATE_BASE_ADDRESS: u16 = 0x6101;
    pub const STATE_SIP: u16 = 0x6102;
    pub const MEDIA_VFE_STATE: u16 = 0x7000;
    pub const MEDIA_CURBE_LOAD: u16 = 0x7001;
    pub const MEDIA_ID_LOAD: u16 = 0x7002;
    pub const MEDIA_OBJECT_WALKER: u16 = 0x7103;
    pub const GPGPU_WALKER: u16 = 0x7105;
    pub const PIPE_CONTROL: u16 = 0x7A00;
    pub const TRACKER_STORE: u16 = 0x1020;
    pub const BATCH_BUFFER_END: u16 = 0x0500;
}

/// Reference encoder: a header dword `opcode << 16 | payload_dwords`
/// followed by little-endian payload dwords. Not bit-exact with any
/// hardware generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearEncoder;

type Payload = SmallVec<[u32; 40]>;

fn split(v: u64) -> [u32; 2] {
    [v as u32, (v >> 32) as u32]
}

fn coord(c: Coord) -> u32 {
    (c.y & 0xFFFF) << 16 | (c.x & 0xFFFF)
}

fn to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

impl LinearEncoder {
    fn payload(cmd: &HwCommand) -> (u16, Payload) {
        let mut p = Payload::new();
        let op = match cmd {
            HwCommand::PipelineSelect { gpgpu } => {
                p.push(u32::from(*gpgpu));
                opcode::PIPELINE_SELECT
            }
            HwCommand::StateBaseAddress(sba) => {
                p.extend(split(sba.dynamic_state));
                p.push(sba.dynamic_state_size);
                p.extend(split(sba.instruction));
                p.push(sba.instruction_size);
                p.extend(split(sba.surface_state));
                opcode::STATE_BASE_ADDRESS
            }
            HwCommand::StateSip { offset } => {
                p.extend(split(*offset));
                opcode::STATE_SIP
            }
            HwCommand::VfeState(vfe) => {
                p.push(vfe.max_threads);
                p.push(vfe.urb_entries);
                p.push(vfe.curbe_allocation);
                p.push(vfe.per_thread_scratch);
                p.extend(split(vfe.scratch_base));
                p.push(
                    u32::from(vfe.scoreboard_enable) << 31
                        | u32::from(vfe.scoreboard_non_stalling) << 30
                        | u32::from(vfe.scoreboard_mask),
                );
                let mut deltas = [0u32; 2];
                for (i, &(dx, dy)) in vfe.scoreboard_deltas.iter().take(8).enumerate() {
                    let nibbles = u32::from(dy as u8 & 0xF) << 4 | u32::from(dx as u8 & 0xF);
                    deltas[i / 4] |= nibbles << ((i % 4) * 8);
                }
                p.extend(deltas);
                opcode::MEDIA_VFE_STATE
            }
            HwCommand::CurbeLoad { length, offset } => {
                p.push(*length);
                p.push(*offset);
                opcode::MEDIA_CURBE_LOAD
            }
            HwCommand::MediaIdLoad { length, offset } => {
                p.push(*length);
                p.push(*offset);
                opcode::MEDIA_ID_LOAD
            }
            HwCommand::MediaObjectWalker {
                interface_descriptor,
                params: w,
            } => {
                p.push(*interface_descriptor);
                p.push(w.walk as u32);
                p.push(u32::from(w.use_scoreboard) << 31 | u32::from(w.scoreboard_mask));
                p.push(w.middle_loop_extra_steps << 16 | coord(w.mid_loop_unit));
                p.push(w.local_loop_exec_count);
                p.push(w.global_loop_exec_count);
                p.push(coord(w.block_resolution));
                p.push(coord(w.local_start));
                p.push(coord(w.local_end));
                p.push(coord(w.local_outer_stride));
                p.push(coord(w.local_inner_unit));
                p.push(coord(w.global_resolution));
                p.push(coord(w.global_start));
                p.push(coord(w.global_outer_stride));
                p.push(coord(w.global_inner_unit));
                opcode::MEDIA_OBJECT_WALKER
            }
            HwCommand::GpgpuWalker(g) => {
                p.push(g.interface_descriptor);
                p.push(g.simd_size);
                p.extend([g.thread_width, g.thread_height, g.thread_depth]);
                p.extend([g.group_width, g.group_height, g.group_depth]);
                p.push(g.right_mask);
                p.push(g.bottom_mask);
                p.push(g.slm_size);
                opcode::GPGPU_WALKER
            }
            HwCommand::PipeControl {
                flush_caches,
                cs_stall,
            } => {
                p.push(u32::from(*flush_caches) | u32::from(*cs_stall) << 1);
                opcode::PIPE_CONTROL
            }
            HwCommand::TrackerStore { slot, value } => {
                p.push(*slot);
                p.push(*value);
                opcode::TRACKER_STORE
            }
            HwCommand::BatchBufferEnd => opcode::BATCH_BUFFER_END,
        };
        (op, p)
    }
}

impl RenderEncoder for LinearEncoder {
    fn command_size(&self, cmd: &HwCommand) -> usize {
        (Self::payload(cmd).1.len() + 1) * 4
    }

    fn encode(&self, cmd: &HwCommand, out: &mut Vec<u8>) {
        let (op, payload) = Self::payload(cmd);
        let header = u32::from(op) << 16 | payload.len() as u32;
        out.extend_from_slice(&header.to_le_bytes());
        for word in payload {
            out.extend_from_slice(&word.to_le_bytes());
        }
    }

    fn encode_interface_descriptor(&self, desc: &InterfaceDescriptor) -> Vec<u8> {
        let [lo, hi] = split(desc.kernel_offset);
        to_bytes(&[
            lo,
            hi,
            desc.sampler_offset,
            desc.sampler_count,
            desc.binding_table_offset,
            desc.curbe_read_length << 16 | (desc.curbe_offset >> 5),
            desc.threads_per_group,
            u32::from(desc.barrier) << 31 | desc.slm_size,
        ])
    }

    fn encode_surface_state(&self, surface: &SurfaceState, plane: usize) -> Vec<u8> {
        let Some(pl) = surface.planes().get(plane) else {
            return Vec::new();
        };
        let kind = match surface.kind() {
            SurfaceKind::Buffer => 4,
            SurfaceKind::Image2D => 1,
            SurfaceKind::Image3D => 2,
        };
        let [lo, hi] = split(surface.gpu_address() + pl.offset);
        to_bytes(&[
            kind << 29 | pl.format.code() << 18 | u32::from(surface.is_write()),
            pl.width,
            pl.height,
            pl.depth,
            pl.pitch,
            lo,
            hi,
            pl.format.bytes_per_pixel(),
        ])
    }

    fn encode_scratch_surface(&self, gpu_va: u64, size: usize) -> Vec<u8> {
        let [lo, hi] = split(gpu_va);
        to_bytes(&[4 << 29 | 0x1FF << 18 | 1, size as u32, 1, 1, 0, lo, hi, 1])
    }

    fn encode_sampler(&self, sampler: &SamplerDesc) -> (Vec<u8>, Vec<u8>) {
        let state = to_bytes(&[
            sampler.filter as u32,
            sampler.address[0] as u32,
            sampler.address[1] as u32,
            sampler.address[2] as u32,
        ]);
        let indirect = to_bytes(&sampler.border_color.map(f32::to_bits));
        (state, indirect)
    }
}

/// Opcodes of a stream written by [`LinearEncoder`], in order. Parsing stops
/// at the first truncated command.
#[must_use]
pub fn decode_opcodes(bytes: &[u8]) -> Vec<u16> {
    let mut ops = Vec::new();
    let mut at = 0;
    while let Some(chunk) = bytes.get(at..at + 4) {
        let header = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let op = (header >> 16) as u16;
        let len = (header & 0xFFFF) as usize;
        if at + 4 + len * 4 > bytes.len() {
            break;
        }
        ops.push(op);
        at += 4 + len * 4;
        if op == opcode::BATCH_BUFFER_END {
            break;
        }
    }
    ops
}

use crate::os::GpuResource;
use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    /// Untyped bytes, addressed as a buffer.
    Raw,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R16Uint,
    R32Float,
    R32Uint,
}

impl SurfaceFormat {
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Raw | Self::R8Unorm => 1,
            Self::R8G8Unorm | Self::R16Uint => 2,
            Self::R8G8B8A8Unorm | Self::R32Float | Self::R32Uint => 4,
        }
    }

    /// Hardware surface-format code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Raw => 0x1FF,
            Self::R8Unorm => 0x140,
            Self::R8G8Unorm => 0x106,
            Self::R8G8B8A8Unorm => 0x0C7,
            Self::R16Uint => 0x10E,
            Self::R32Float => 0x0D8,
            Self::R32Uint => 0x0D7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Buffer,
    Image2D,
    Image3D,
}

/// One plane of a surface. Multi-planar images (e.g. NV12) get one
/// surface-state slot and one binding-table entry per plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfacePlane {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub pitch: u32,
    pub format: SurfaceFormat,
    /// Byte offset of the plane inside the resource.
    pub offset: u64,
}

/// Where a surface was last bound. Only meaningful for the SSH instance
/// named by `ssh_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceRecord {
    pub ssh_id: u64,
    pub table: u32,
    pub bte: u32,
    pub ss_index: u32,
}

/// A memory resource described for kernel access.
#[derive(Debug)]
pub struct SurfaceState {
    handle: u64,
    gpu_va: u64,
    size: usize,
    kind: SurfaceKind,
    planes: SmallVec<[SurfacePlane; 2]>,
    write: bool,
    records: Mutex<Vec<SurfaceRecord>>,
}

impl SurfaceState {
    #[must_use]
    pub fn buffer(resource: &GpuResource, write: bool) -> Self {
        let plane = SurfacePlane {
            width: u32::try_from(resource.size).unwrap_or(u32::MAX),
            height: 1,
            depth: 1,
            pitch: 0,
            format: SurfaceFormat::Raw,
            offset: 0,
        };
        Self::with_planes(resource, SurfaceKind::Buffer, smallvec![plane], write)
    }

    #[must_use]
    pub fn image_2d(
        resource: &GpuResource,
        width: u32,
        height: u32,
        pitch: u32,
        format: SurfaceFormat,
        write: bool,
    ) -> Self {
        let plane = SurfacePlane {
            width,
            height,
            depth: 1,
            pitch,
            format,
            offset: 0,
        };
        Self::with_planes(resource, SurfaceKind::Image2D, smallvec![plane], write)
    }

    #[must_use]
    pub fn image_3d(
        resource: &GpuResource,
        width: u32,
        height: u32,
        depth: u32,
        pitch: u32,
        format: SurfaceFormat,
        write: bool,
    ) -> Self {
        let plane = SurfacePlane {
            width,
            height,
            depth,
            pitch,
            format,
            offset: 0,
        };
        Self::with_planes(resource, SurfaceKind::Image3D, smallvec![plane], write)
    }

    /// Luma plane followed by an interleaved half-resolution chroma plane.
    #[must_use]
    pub fn nv12(resource: &GpuResource, width: u32, height: u32, pitch: u32, write: bool) -> Self {
        let luma = SurfacePlane {
            width,
            height,
            depth: 1,
            pitch,
            format: SurfaceFormat::R8Unorm,
            offset: 0,
        };
        let chroma = SurfacePlane {
            width: width / 2,
            height: height / 2,
            depth: 1,
            pitch,
            format: SurfaceFormat::R8G8Unorm,
            offset: u64::from(pitch) * u64::from(height),
        };
        Self::with_planes(resource, SurfaceKind::Image2D, smallvec![luma, chroma], write)
    }

    fn with_planes(
        resource: &GpuResource,
        kind: SurfaceKind,
        planes: SmallVec<[SurfacePlane; 2]>,
        write: bool,
    ) -> Self {
        Self {
            handle: resource.handle,
            gpu_va: resource.gpu_va,
            size: resource.size,
            kind,
            planes,
            write,
            records: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    #[must_use]
    pub const fn gpu_address(&self) -> u64 {
        self.gpu_va
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn kind(&self) -> SurfaceKind {
        self.kind
    }

    #[must_use]
    pub fn planes(&self) -> &[SurfacePlane] {
        &self.planes
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.write
    }

    /// Record for `(ssh_id, table)`, and for `bte` when one is requested.
    #[must_use]
    pub fn find_record(&self, ssh_id: u64, table: u32, bte: Option<u32>) -> Option<SurfaceRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.ssh_id == ssh_id && r.table == table && bte.is_none_or(|b| b == r.bte))
            .copied()
    }

    /// Surface-state slot this surface already occupies in `ssh_id`.
    #[must_use]
    pub fn slot_in(&self, ssh_id: u64) -> Option<u32> {
        self.records
            .lock()
            .iter()
            .find(|r| r.ssh_id == ssh_id)
            .map(|r| r.ss_index)
    }

    /// Stores a binding. Records from other SSH instances are dropped, they
    /// can never match again.
    pub(crate) fn record(&self, record: SurfaceRecord) {
        let mut records = self.records.lock();
        records.retain(|r| r.ssh_id == record.ssh_id);
        records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> Vec<SurfaceRecord> {
        self.records.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::AllocFlags;

    fn resource(size: usize) -> GpuResource {
        GpuResource {
            handle: 7,
            size,
            gpu_va: 0x10_0000,
            flags: AllocFlags::new(),
            name: "surf".into(),
        }
    }

    #[test]
    fn nv12_has_two_planes() {
        let s = SurfaceState::nv12(&resource(64 * 48 * 3 / 2), 64, 48, 64, false);
        assert_eq!(s.planes().len(), 2);
        assert_eq!(s.planes()[1].offset, 64 * 48);
        assert_eq!(s.planes()[1].width, 32);
    }

    #[test]
    fn records_from_older_instances_are_dropped() {
        let s = SurfaceState::buffer(&resource(4096), true);
        s.record(SurfaceRecord {
            ssh_id: 1,
            table: 0,
            bte: 3,
            ss_index: 0,
        });
        assert_eq!(s.find_record(1, 0, None).map(|r| r.bte), Some(3));
        assert!(s.find_record(1, 0, Some(4)).is_none());

        s.record(SurfaceRecord {
            ssh_id: 2,
            table: 0,
            bte: 0,
            ss_index: 5,
        });
        assert!(s.find_record(1, 0, None).is_none());
        assert_eq!(s.slot_in(2), Some(5));
    }
}

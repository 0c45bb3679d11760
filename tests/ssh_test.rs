//! Integration tests for binding tables and surface states.

use std::sync::Arc;

use gpu_state_heap::runtime::queues::LinearEncoder;
use gpu_state_heap::runtime::state::{SurfaceFormat, SurfaceStateHeap};
use gpu_state_heap::{AllocFlags, HostDevice, OsInterface, PlatformInfo, SurfaceState};

fn heap() -> SurfaceStateHeap {
    SurfaceStateHeap::new(
        Arc::new(PlatformInfo::default()),
        Arc::new(LinearEncoder),
        16 * 1024,
    )
    .unwrap()
}

#[test]
fn identical_surface_reuses_entry_in_same_table_only() {
    let dev = HostDevice::new();
    let buffer = dev.allocate(8192, AllocFlags::new(), "input").unwrap();
    let surface = SurfaceState::buffer(&buffer, false);
    let mut ssh = heap();

    let t0 = ssh.assign_binding_table().unwrap();
    let bte = ssh.add_surface_state(&surface, None, Some(t0)).unwrap();
    for _ in 0..3 {
        assert_eq!(ssh.add_surface_state(&surface, None, Some(t0)).unwrap(), bte);
    }

    let other = SurfaceState::buffer(&buffer, false);
    assert_ne!(ssh.add_surface_state(&other, None, Some(t0)).unwrap(), bte);

    let t1 = ssh.assign_binding_table().unwrap();
    ssh.add_surface_state(&surface, None, Some(t1)).unwrap();
    assert_eq!(surface.records().len(), 2);
    assert!(surface.records().iter().any(|r| r.table == t1));

    dev.free(&buffer);
}

#[test]
fn planar_surface_takes_one_entry_per_plane() {
    let dev = HostDevice::new();
    let frame = dev.allocate(64 * 48 * 3 / 2, AllocFlags::new(), "nv12").unwrap();
    let image = dev.allocate(64 * 64 * 4, AllocFlags::new(), "rgba").unwrap();
    let nv12 = SurfaceState::nv12(&frame, 64, 48, 64, false);
    let rgba = SurfaceState::image_2d(&image, 64, 64, 256, SurfaceFormat::R8G8B8A8Unorm, true);
    let mut ssh = heap();

    let t = ssh.assign_binding_table().unwrap();
    assert_eq!(ssh.add_surface_state(&nv12, None, Some(t)).unwrap(), 0);
    assert_eq!(ssh.add_surface_state(&rgba, None, Some(t)).unwrap(), 2);
    assert_eq!(ssh.surface_state_count(), 3);

    // luma and chroma entries point at consecutive surface states
    let luma = ssh.binding_table_entry(t, 0).unwrap();
    let chroma = ssh.binding_table_entry(t, 1).unwrap();
    assert_eq!(chroma - luma, 64);
    assert!(ssh.resources().contains(&(image.handle, true)));

    dev.free(&frame);
    dev.free(&image);
}

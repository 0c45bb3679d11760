//! End-to-end dispatch tests against the host device.

use std::sync::Arc;

use gpu_state_heap::runtime::queues::encoder::{decode_opcodes, opcode};
use gpu_state_heap::runtime::queues::{
    DependencyPattern, DispatchSpace, SamplerDesc, ThreadGroupSpace, ThreadSpace,
};
use gpu_state_heap::{
    AllocFlags, Behavior, HeapError, HostDevice, Kernel, OsInterface, PlatformInfo,
    RuntimeContext, StateHeapSettings, SurfaceState, Task, TaskKernel,
};

fn context(platform: PlatformInfo, settings: StateHeapSettings) -> (Arc<HostDevice>, RuntimeContext) {
    let dev = Arc::new(HostDevice::new());
    let ctx = RuntimeContext::new(dev.clone(), platform, settings);
    (dev, ctx)
}

fn kernel(name: &str, curbe: usize) -> Arc<Kernel> {
    Arc::new(Kernel::new(name, vec![0x5A; 512]).with_curbe_size(curbe))
}

// === Media dispatch ===

#[test]
fn media_task_runs_and_completes() {
    let (dev, ctx) = context(PlatformInfo::default(), StateHeapSettings::default());
    let queue = ctx.create_queue().unwrap();
    let input = dev.allocate(4096, AllocFlags::new(), "input").unwrap();
    let output = dev.allocate(4096, AllocFlags::new(), "output").unwrap();
    let src = Arc::new(SurfaceState::buffer(&input, false));
    let dst = Arc::new(SurfaceState::buffer(&output, true));

    let sampled = Arc::new(
        Kernel::new("blur", vec![0x11; 700])
            .with_curbe_size(64)
            .with_samplers(1, 0),
    );
    let task = Task::new()
        .with_kernel(
            TaskKernel::new(sampled)
                .with_curbe(vec![1; 64])
                .with_surface(src.clone(), None)
                .with_surface(dst.clone(), None)
                .with_sampler(SamplerDesc::default(), None),
        )
        .with_kernel(
            TaskKernel::new(kernel("copy", 32))
                .with_curbe(vec![2; 32])
                .with_surface(dst, Some(0)),
        )
        .with_space(DispatchSpace::Threads(
            ThreadSpace::new(8, 8).with_dependency(DependencyPattern::Wavefront),
        ))
        .with_sync();

    let mut q = queue.lock();
    let token = q.enqueue(&task).unwrap();
    assert!(!token.is_expired());
    assert_eq!(q.in_flight(), 1);

    let batches = dev.submitted();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        decode_opcodes(&batches[0].commands),
        vec![
            opcode::PIPELINE_SELECT,
            opcode::STATE_BASE_ADDRESS,
            opcode::MEDIA_VFE_STATE,
            opcode::MEDIA_CURBE_LOAD,
            opcode::MEDIA_ID_LOAD,
            opcode::MEDIA_OBJECT_WALKER,
            opcode::PIPE_CONTROL,
            opcode::MEDIA_OBJECT_WALKER,
            opcode::PIPE_CONTROL,
            opcode::TRACKER_STORE,
            opcode::BATCH_BUFFER_END,
        ]
    );
    assert!(batches[0].resources.contains(&input.handle));
    assert!(batches[0].resources.contains(&output.handle));

    assert_eq!(dev.execute_all(), 1);
    assert!(token.is_expired());
    assert_eq!(q.reclaim(), 1);
    assert_eq!(q.in_flight(), 0);
    assert_eq!(q.dsh().manager().lock().used_space(), 0);
}

#[test]
fn completed_dispatches_recycle_dynamic_state() {
    let settings = StateHeapSettings {
        dsh_behavior: Behavior::Wait,
        dsh_initial_size: 4096,
        ..StateHeapSettings::default()
    };
    let (dev, ctx) = context(PlatformInfo::default(), settings);
    let queue = ctx.create_queue().unwrap();
    let task = Task::new()
        .with_kernel(TaskKernel::new(kernel("k", 256)).with_curbe(vec![3; 256]))
        .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4)));

    let mut q = queue.lock();
    let mut previous = None;
    for _ in 0..40 {
        let token = q.enqueue(&task).unwrap();
        dev.execute_all();
        assert!(token.is_expired());
        if let Some(prev) = previous.replace(q.completed_value().unwrap()) {
            assert_eq!(q.completed_value().unwrap(), prev + 1);
        }
    }
    assert_eq!(q.dsh().manager().lock().heap_count(), 1);
    assert_eq!(q.submitted(), 40);
}

// === Failure paths ===

#[test]
fn small_command_buffer_is_retried_once() {
    let (dev, ctx) = context(PlatformInfo::default(), StateHeapSettings::default());
    let mut q = ctx
        .queue_builder()
        .with_command_buffer(4096 + 64, 4096)
        .create()
        .unwrap();
    let task = Task::new()
        .with_kernel(TaskKernel::new(kernel("k", 64)))
        .with_space(DispatchSpace::Threads(ThreadSpace::new(16, 16)));

    q.enqueue(&task).unwrap();
    assert!(q.command_buffer_size() > 4096 + 64);
    assert_eq!(q.command_buffer_size() % 4096, 0);
    assert_eq!(dev.submitted().len(), 1);

    // the grown size sticks
    q.enqueue(&task).unwrap();
    assert_eq!(dev.submitted().len(), 2);
}

#[test]
fn failed_assembly_releases_dynamic_state() {
    let platform = PlatformInfo::default().with_surface_limits(256, 1);
    let (dev, ctx) = context(platform, StateHeapSettings::default());
    let queue = ctx.create_queue().unwrap();
    let a = dev.allocate(4096, AllocFlags::new(), "a").unwrap();
    let b = dev.allocate(4096, AllocFlags::new(), "b").unwrap();
    let task = Task::new()
        .with_kernel(
            TaskKernel::new(kernel("k", 0))
                .with_surface(Arc::new(SurfaceState::buffer(&a, false)), None)
                .with_surface(Arc::new(SurfaceState::buffer(&b, true)), None),
        )
        .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4)));

    let mut q = queue.lock();
    assert!(matches!(
        q.enqueue(&task),
        Err(HeapError::TooManySurfaceStates)
    ));
    assert!(dev.submitted().is_empty());
    assert_eq!(q.dsh().manager().lock().used_space(), 0);
    assert_eq!(q.in_flight(), 0);
}

#[test]
fn failed_registration_returns_dynamic_state() {
    let (dev, ctx) = context(PlatformInfo::default(), StateHeapSettings::default());
    let queue = ctx.create_queue().unwrap();
    let gone = dev.allocate(4096, AllocFlags::new(), "gone").unwrap();
    let stale = Arc::new(SurfaceState::buffer(&gone, true));
    dev.free(&gone);

    let mut q = queue.lock();
    let value = q.completed_value().unwrap();
    let broken = Task::new()
        .with_kernel(
            TaskKernel::new(kernel("k", 64))
                .with_curbe(vec![1; 64])
                .with_surface(stale, None),
        )
        .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4)));
    assert!(matches!(
        q.enqueue(&broken),
        Err(HeapError::InvalidParameter(_))
    ));
    assert!(dev.submitted().is_empty());
    assert_eq!(q.in_flight(), 0);

    q.reclaim();
    assert_eq!(q.dsh().manager().lock().used_space(), 0);

    // the tracker value was not consumed by the failed task
    let healthy = Task::new()
        .with_kernel(TaskKernel::new(kernel("k", 64)).with_curbe(vec![1; 64]))
        .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4)));
    let token = q.enqueue(&healthy).unwrap();
    assert_eq!(dev.execute_all(), 1);
    assert!(token.is_expired());
    assert_eq!(q.completed_value().unwrap(), value + 1);
    q.reclaim();
    assert_eq!(q.dsh().manager().lock().used_space(), 0);
}

#[test]
fn invalid_task_is_rejected_before_any_allocation() {
    let (dev, ctx) = context(PlatformInfo::default(), StateHeapSettings::default());
    let queue = ctx.create_queue().unwrap();
    let before = dev.live_allocations();
    let task = Task::new().with_kernel(TaskKernel::new(kernel("k", 0)));

    assert!(matches!(
        queue.lock().enqueue(&task),
        Err(HeapError::InvalidParameter(_))
    ));
    assert_eq!(dev.live_allocations(), before);
}

// === Optional state ===

#[test]
fn sip_is_programmed_after_base_addresses() {
    let (dev, ctx) = context(PlatformInfo::default().with_sip(true), StateHeapSettings::default());
    let mut q = ctx
        .queue_builder()
        .with_sip(Arc::new(Kernel::new("sip", vec![0xEE; 256])))
        .create()
        .unwrap();
    let task = Task::new()
        .with_kernel(TaskKernel::new(kernel("k", 0)))
        .with_space(DispatchSpace::Threads(ThreadSpace::new(2, 2)));

    q.enqueue(&task).unwrap();
    let ops = decode_opcodes(&dev.submitted()[0].commands);
    assert_eq!(
        &ops[..5],
        &[
            opcode::PIPELINE_SELECT,
            opcode::STATE_BASE_ADDRESS,
            opcode::PIPE_CONTROL,
            opcode::STATE_SIP,
            opcode::MEDIA_VFE_STATE,
        ]
    );
    // no curbe, so no curbe load
    assert!(!ops.contains(&opcode::MEDIA_CURBE_LOAD));
    assert_eq!(q.ish().sip_offset(), Some(0));
}

#[test]
fn gpgpu_task_with_spill_uses_dedicated_scratch() {
    let settings = StateHeapSettings {
        dedicated_scratch: true,
        ..StateHeapSettings::default()
    };
    let (dev, ctx) = context(PlatformInfo::default().with_max_hw_threads(16), settings);
    let queue = ctx.create_queue().unwrap();
    let spilling = Arc::new(Kernel::new("spill", vec![1; 256]).with_spill_size(3000));
    let task = Task::new()
        .with_kernel(TaskKernel::new(spilling).with_simd_size(8))
        .with_space(DispatchSpace::Groups(ThreadGroupSpace::new(
            (8, 1, 1),
            (4, 2, 1),
        )));

    let mut q = queue.lock();
    q.enqueue(&task).unwrap();
    let scratch = q.scratch().unwrap();
    assert_eq!(scratch.per_thread(), 4096);
    let handle = scratch.handle().unwrap();

    let batch = &dev.submitted()[0];
    assert!(batch.resources.contains(&handle));
    assert!(decode_opcodes(&batch.commands).contains(&opcode::GPGPU_WALKER));
    assert!(q.dsh().manager().lock().used_space() > 0);
    assert!(q.dsh().manager().lock().used_space() < 4096 * 16);
}

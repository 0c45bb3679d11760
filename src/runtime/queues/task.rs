use super::encoder::SamplerDesc;
use super::walker::{self, ThreadSpace};
use crate::error::{HeapError, HeapResult};
use crate::runtime::state::kernel::Kernel;
use crate::runtime::state::platform::PlatformInfo;
use crate::runtime::state::surface::SurfaceState;
use std::sync::Arc;

/// Thread-group dispatch: `group_*` groups of `thread_*` threads each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadGroupSpace {
    pub thread_width: u32,
    pub thread_height: u32,
    pub thread_depth: u32,
    pub group_width: u32,
    pub group_height: u32,
    pub group_depth: u32,
}

impl ThreadGroupSpace {
    #[must_use]
    pub const fn new(threads: (u32, u32, u32), groups: (u32, u32, u32)) -> Self {
        Self {
            thread_width: threads.0,
            thread_height: threads.1,
            thread_depth: threads.2,
            group_width: groups.0,
            group_height: groups.1,
            group_depth: groups.2,
        }
    }

    #[must_use]
    pub const fn threads_per_group(&self) -> u32 {
        self.thread_width * self.thread_height * self.thread_depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSpace {
    /// Classic media-walker dispatch.
    Threads(ThreadSpace),
    /// GPGPU-walker dispatch.
    Groups(ThreadGroupSpace),
}

impl DispatchSpace {
    #[must_use]
    pub const fn is_gpgpu(&self) -> bool {
        matches!(self, Self::Groups(_))
    }
}

/// One kernel of a task with its arguments.
#[derive(Debug, Clone)]
pub struct TaskKernel {
    pub kernel: Arc<Kernel>,
    pub curbe: Vec<u8>,
    /// Surfaces and optional fixed binding-table entries.
    pub surfaces: Vec<(Arc<SurfaceState>, Option<u32>)>,
    /// Samplers and optional pinned slots.
    pub samplers: Vec<(SamplerDesc, Option<u32>)>,
    /// Pre-encoded AVS sampler states.
    pub avs_samplers: Vec<Vec<u8>>,
    pub space: Option<DispatchSpace>,
    pub simd_size: u32,
}

impl TaskKernel {
    #[must_use]
    pub const fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            curbe: Vec::new(),
            surfaces: Vec::new(),
            samplers: Vec::new(),
            avs_samplers: Vec::new(),
            space: None,
            simd_size: 16,
        }
    }

    #[must_use]
    pub fn with_curbe(mut self, data: Vec<u8>) -> Self {
        self.curbe = data;
        self
    }

    #[must_use]
    pub fn with_surface(mut self, surface: Arc<SurfaceState>, bte: Option<u32>) -> Self {
        self.surfaces.push((surface, bte));
        self
    }

    #[must_use]
    pub fn with_sampler(mut self, sampler: SamplerDesc, slot: Option<u32>) -> Self {
        self.samplers.push((sampler, slot));
        self
    }

    #[must_use]
    pub fn with_avs_sampler(mut self, state: Vec<u8>) -> Self {
        self.avs_samplers.push(state);
        self
    }

    #[must_use]
    pub const fn with_space(mut self, space: DispatchSpace) -> Self {
        self.space = Some(space);
        self
    }

    #[must_use]
    pub const fn with_simd_size(mut self, simd: u32) -> Self {
        self.simd_size = simd;
        self
    }
}

/// Kernels dispatched together in one batch.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub kernels: Vec<TaskKernel>,
    /// Space used by kernels without their own.
    pub space: Option<DispatchSpace>,
    /// Barrier between consecutive kernels.
    pub sync_between_kernels: bool,
}

impl Task {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_kernel(mut self, kernel: TaskKernel) -> Self {
        self.kernels.push(kernel);
        self
    }

    #[must_use]
    pub const fn with_space(mut self, space: DispatchSpace) -> Self {
        self.space = Some(space);
        self
    }

    #[must_use]
    pub const fn with_sync(mut self) -> Self {
        self.sync_between_kernels = true;
        self
    }

    /// Dispatch space of kernel `index`.
    #[must_use]
    pub fn space_of(&self, index: usize) -> Option<DispatchSpace> {
        self.kernels.get(index).and_then(|k| k.space).or(self.space)
    }

    /// True when one task-wide space drives every kernel.
    #[must_use]
    pub fn has_shared_space(&self) -> bool {
        self.space.is_some() && self.kernels.iter().all(|k| k.space.is_none())
    }

    #[must_use]
    pub fn is_gpgpu(&self) -> bool {
        self.space_of(0).is_some_and(|s| s.is_gpgpu())
    }

    #[must_use]
    pub fn kernel_list(&self) -> Vec<Arc<Kernel>> {
        self.kernels.iter().map(|k| k.kernel.clone()).collect()
    }

    /// Largest spill of any kernel in the task.
    #[must_use]
    pub fn max_spill(&self) -> usize {
        self.kernels
            .iter()
            .map(|k| k.kernel.spill_size())
            .max()
            .unwrap_or(0)
    }

    /// Rejects tasks the dispatch path cannot express.
    pub fn validate(&self, platform: &PlatformInfo) -> HeapResult<()> {
        if self.kernels.is_empty() {
            return Err(HeapError::InvalidParameter("task has no kernels".into()));
        }
        if self.kernels.len() > platform.max_kernels_per_task {
            return Err(HeapError::InvalidParameter(format!(
                "task has {} kernels, limit is {}",
                self.kernels.len(),
                platform.max_kernels_per_task
            )));
        }

        let gpgpu = self.is_gpgpu();
        for (i, tk) in self.kernels.iter().enumerate() {
            let name = tk.kernel.name();
            let Some(space) = self.space_of(i) else {
                return Err(HeapError::InvalidParameter(format!(
                    "kernel '{name}' has no thread space"
                )));
            };
            if space.is_gpgpu() != gpgpu {
                return Err(HeapError::InvalidParameter(
                    "media and GPGPU kernels cannot share a task".into(),
                ));
            }
            match space {
                DispatchSpace::Threads(ts) => {
                    if ts.width == 0 || ts.height == 0 {
                        return Err(HeapError::InvalidParameter(format!(
                            "kernel '{name}' has an empty thread space"
                        )));
                    }
                    let folded =
                        ts.height == 1 && walker::folds_single_row(walker::effective_walk(&ts));
                    if (!folded && ts.width > platform.walker_max_width)
                        || ts.height > platform.walker_max_height
                    {
                        return Err(HeapError::InvalidParameter(format!(
                            "thread space {}x{} exceeds the walker limits",
                            ts.width, ts.height
                        )));
                    }
                }
                DispatchSpace::Groups(gs) => {
                    let per_group = gs.threads_per_group();
                    if per_group == 0
                        || gs.group_width == 0
                        || gs.group_height == 0
                        || gs.group_depth == 0
                    {
                        return Err(HeapError::InvalidParameter(format!(
                            "kernel '{name}' has an empty thread group space"
                        )));
                    }
                    if per_group > platform.max_threads_per_group {
                        return Err(HeapError::InvalidParameter(format!(
                            "{per_group} threads per group, limit is {}",
                            platform.max_threads_per_group
                        )));
                    }
                }
            }
            if !matches!(tk.simd_size, 8 | 16 | 32) {
                return Err(HeapError::InvalidParameter(format!(
                    "SIMD width {} is not supported",
                    tk.simd_size
                )));
            }
            if tk.curbe.len() > tk.kernel.curbe_size() {
                return Err(HeapError::InvalidParameter(format!(
                    "kernel '{name}' got {} curbe bytes for a {} byte curbe",
                    tk.curbe.len(),
                    tk.kernel.curbe_size()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::queues::walker::{DependencyPattern, WalkingPattern};

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new("k", vec![0; 64]).with_curbe_size(32))
    }

    #[test]
    fn shared_space_applies_to_every_kernel() {
        let task = Task::new()
            .with_kernel(TaskKernel::new(kernel()))
            .with_kernel(TaskKernel::new(kernel()))
            .with_space(DispatchSpace::Threads(ThreadSpace::new(8, 8)));
        assert!(task.has_shared_space());
        assert_eq!(task.space_of(1), task.space);
        task.validate(&PlatformInfo::default()).unwrap();
    }

    #[test]
    fn rejects_mixed_and_oversized_tasks() {
        let platform = PlatformInfo::default();
        let mixed = Task::new()
            .with_kernel(
                TaskKernel::new(kernel())
                    .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4))),
            )
            .with_kernel(TaskKernel::new(kernel()).with_space(DispatchSpace::Groups(
                ThreadGroupSpace::new((8, 1, 1), (2, 1, 1)),
            )));
        assert!(mixed.validate(&platform).is_err());

        let big_group = Task::new().with_kernel(TaskKernel::new(kernel()).with_space(
            DispatchSpace::Groups(ThreadGroupSpace::new((16, 8, 1), (1, 1, 1))),
        ));
        assert!(big_group.validate(&platform).is_err());

        let curbe = Task::new()
            .with_kernel(TaskKernel::new(kernel()).with_curbe(vec![0; 64]))
            .with_space(DispatchSpace::Threads(ThreadSpace::new(4, 4)));
        assert!(curbe.validate(&platform).is_err());

        assert!(Task::new().validate(&platform).is_err());
    }

    #[test]
    fn single_row_may_exceed_walker_width() {
        let task = Task::new()
            .with_kernel(TaskKernel::new(kernel()))
            .with_space(DispatchSpace::Threads(ThreadSpace::new(10_000, 1)));
        task.validate(&PlatformInfo::default()).unwrap();

        // vertical and 45 degree walks cannot fold the row
        for space in [
            ThreadSpace::new(10_000, 1).with_dependency(DependencyPattern::Vertical),
            ThreadSpace::new(10_000, 1).with_walk(WalkingPattern::Wavefront45D),
        ] {
            let task = Task::new()
                .with_kernel(TaskKernel::new(kernel()))
                .with_space(DispatchSpace::Threads(space));
            assert!(matches!(
                task.validate(&PlatformInfo::default()),
                Err(HeapError::InvalidParameter(_))
            ));
        }

        let horizontal = Task::new()
            .with_kernel(TaskKernel::new(kernel()))
            .with_space(DispatchSpace::Threads(
                ThreadSpace::new(10_000, 1).with_dependency(DependencyPattern::Horizontal),
            ));
        horizontal.validate(&PlatformInfo::default()).unwrap();
    }
}

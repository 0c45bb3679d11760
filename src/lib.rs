//! Resource heaps and command assembly for a GPU compute runtime.
//!
//! Kernels, per-dispatch state and surface descriptors are sub-allocated
//! from GPU-visible heaps and only reused once the frame tracker shows the
//! GPU has finished with them. [`ComputeQueue`] ties the heaps together and
//! emits the command stream of each dispatch.

pub mod config;
pub mod error;
pub mod os;
pub mod runtime;
pub mod telemetry;
pub mod utils;

pub use config::StateHeapSettings;
pub use error::{HeapError, HeapResult};
pub use os::device::HostDevice;
pub use os::{AllocFlags, GpuResource, OsInterface};
pub use runtime::RuntimeContext;
pub use runtime::heap::{AcquireParams, Behavior, HeapManager, MemoryBlock};
pub use runtime::queues::{ComputeQueue, QueueBuilder, Task, TaskKernel};
pub use runtime::state::{Kernel, PlatformInfo, SurfaceState};
pub use runtime::tracker::{FrameTrackerProducer, FrameTrackerToken};

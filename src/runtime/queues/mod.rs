//! Turning tasks into command buffers.

pub mod builder;
pub mod command_buffer;
pub mod encoder;
pub mod queue;
pub mod task;
pub mod walker;

pub use builder::QueueBuilder;
pub use command_buffer::CommandBuffer;
pub use encoder::{HwCommand, LinearEncoder, RenderEncoder, SamplerDesc};
pub use queue::ComputeQueue;
pub use task::{DispatchSpace, Task, TaskKernel, ThreadGroupSpace};
pub use walker::{DependencyPattern, ThreadSpace, WalkingPattern};

//! The three state heaps a dispatch references, plus the data placed in
//! them.

pub mod dsh;
pub mod ish;
pub mod kernel;
pub mod platform;
pub mod scratch;
pub mod ssh;
pub mod surface;

pub use dsh::{DispatchLayout, DynamicStateHeap, MediaState};
pub use ish::{InstructionStateHeap, IshConfig};
pub use kernel::Kernel;
pub use platform::PlatformInfo;
pub use scratch::ScratchSpace;
pub use ssh::SurfaceStateHeap;
pub use surface::{SurfaceFormat, SurfaceState};

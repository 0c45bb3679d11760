pub mod context;
pub mod heap;
pub mod queues;
pub mod state;
pub mod tracker;

pub use context::RuntimeContext;

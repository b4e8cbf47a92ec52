// Frame engine - device selection, queue allocation and the
// acquire/submit/present loop on top of ash.

pub mod backend;
pub mod config;
pub mod error;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use backend::{GpuApi, VulkanContext};
pub use config::Config;
pub use error::{EngineError, Result};
pub use scheduler::{FrameOutcome, FrameScheduler, FrameState, Invalidation};

// Backend module - Vulkan abstraction layer
//
// `context` owns the real Vulkan objects; everything the frame scheduler
// touches goes through the `api::GpuApi` seam.

pub mod api;
pub mod command;
pub mod context;
pub mod debug;
pub mod device;
pub mod instance;
pub mod queue;
pub mod render_pass;
pub mod selector;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use api::GpuApi;
pub use context::VulkanContext;
pub use swapchain::SwapchainResources;

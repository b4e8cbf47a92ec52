// GPU operations used by the swapchain and the frame scheduler
//
// `VulkanContext` implements this with ash. Everything above this trait only
// sees handles and outcome values, never an `ash::Device`.

use ash::vk;
use std::time::Duration;

use super::queue::QueueAllocation;
use crate::error::Result;

/// Result of asking the chain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Image { index: u32, suboptimal: bool },
    /// The chain no longer matches the surface and must be rebuilt.
    OutOfDate,
    /// No image became available within the acquire timeout.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Present {
    Presented { suboptimal: bool },
    OutOfDate,
}

/// A freshly created chain and its images.
#[derive(Debug, Clone)]
pub struct ChainInfo {
    pub chain: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub images: Vec<vk::Image>,
}

/// One queue submission: a single command buffer between a wait and a
/// signal semaphore, with a fence for the CPU.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

pub trait GpuApi {
    /// Current drawable size of the presentation surface.
    fn surface_extent(&self) -> Result<vk::Extent2D>;

    fn queues(&self) -> &QueueAllocation;

    /// Create a chain at `extent`. `old` is passed as the creation hint and may
    /// be null.
    fn create_chain(&self, extent: vk::Extent2D, old: vk::SwapchainKHR) -> Result<ChainInfo>;
    fn destroy_chain(&self, chain: vk::SwapchainKHR);

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_framebuffer(
        &self,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Allocate and record one command buffer per framebuffer, in order.
    fn record_commands(
        &self,
        framebuffers: &[vk::Framebuffer],
        extent: vk::Extent2D,
    ) -> Result<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);

    /// Wait up to `timeout`. `Ok(false)` means the fence is still unsignaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn acquire_next_image(
        &self,
        chain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<Acquire>;

    fn submit(&self, queue: vk::Queue, submission: &Submission) -> Result<()>;

    fn present(
        &self,
        queue: vk::Queue,
        chain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<Present>;

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()>;
    fn device_wait_idle(&self) -> Result<()>;
}

/// Vulkan timeouts are nanoseconds in a `u64`.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_saturates() {
        assert_eq!(timeout_nanos(Duration::from_millis(5)), 5_000_000);
        assert_eq!(timeout_nanos(Duration::MAX), u64::MAX);
    }
}

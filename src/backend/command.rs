// Command recording
//
// Command buffers are recorded once per swapchain build, one per image, and
// resubmitted every frame. What goes into them is up to a `CommandRecorder`;
// the default just clears the image inside the render pass.

use ash::vk;

use super::device::LogicalDevice;
use crate::error::{EngineError, Result};

/// Everything a recorder may draw into.
#[derive(Debug, Clone, Copy)]
pub struct RecordTarget {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
}

impl RecordTarget {
    pub fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        }
    }
}

/// Records the body of one command buffer. `begin`/`end` are handled by the
/// caller.
pub trait CommandRecorder {
    /// # Safety
    /// `command_buffer` is in the recording state and belongs to `device`.
    unsafe fn record(
        &self,
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        target: &RecordTarget,
    );
}

/// Begin the render pass with a clear color and end it.
#[derive(Debug, Clone, Copy)]
pub struct ClearPass {
    pub color: [f32; 4],
}

impl ClearPass {
    pub fn new(color: [f32; 4]) -> Self {
        Self { color }
    }

    pub fn clear_values(&self) -> [vk::ClearValue; 1] {
        [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.color,
            },
        }]
    }
}

impl CommandRecorder for ClearPass {
    unsafe fn record(
        &self,
        device: &ash::Device,
        command_buffer: vk::CommandBuffer,
        target: &RecordTarget,
    ) {
        let clear_values = self.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(target.render_pass)
            .framebuffer(target.framebuffer)
            .render_area(target.render_area())
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
        device.cmd_end_render_pass(command_buffer);
    }
}

/// Allocate one primary buffer per framebuffer from `pool` and record each.
/// On failure the allocated buffers are freed again.
pub fn record_all(
    logical: &LogicalDevice,
    pool: vk::CommandPool,
    recorder: &dyn CommandRecorder,
    render_pass: vk::RenderPass,
    framebuffers: &[vk::Framebuffer],
    extent: vk::Extent2D,
) -> Result<Vec<vk::CommandBuffer>> {
    if framebuffers.is_empty() {
        return Ok(Vec::new());
    }
    let device = &logical.device;

    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(framebuffers.len() as u32);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(logical.creation_failed("command buffers"))?;

    for (&command_buffer, &framebuffer) in buffers.iter().zip(framebuffers) {
        let target = RecordTarget {
            render_pass,
            framebuffer,
            extent,
        };
        if let Err(e) = unsafe { record_one(device, command_buffer, recorder, &target) } {
            unsafe { device.free_command_buffers(pool, &buffers) };
            return Err(e);
        }
    }

    log::debug!("Recorded {} command buffers", buffers.len());
    Ok(buffers)
}

unsafe fn record_one(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    recorder: &dyn CommandRecorder,
    target: &RecordTarget,
) -> Result<()> {
    let begin_info = vk::CommandBufferBeginInfo::builder();
    device
        .begin_command_buffer(command_buffer, &begin_info)
        .map_err(EngineError::vulkan("vkBeginCommandBuffer"))?;
    recorder.record(device, command_buffer, target);
    device
        .end_command_buffer(command_buffer)
        .map_err(EngineError::vulkan("vkEndCommandBuffer"))
}

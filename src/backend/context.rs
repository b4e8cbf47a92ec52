// Vulkan context - owns every long-lived Vulkan object
//
// Creation order: instance (with debug messenger) -> surface -> physical
// device selection -> queue reservation -> logical device -> render pass and
// command pool. Drop runs the reverse: the pool and render pass are destroyed
// explicitly, the rest follows field order.
//
// The context implements `GpuApi`, which is all the frame scheduler sees.

use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::api::{timeout_nanos, Acquire, ChainInfo, GpuApi, Present, Submission};
use super::command::{self, ClearPass, CommandRecorder};
use super::debug::DiagnosticsSink;
use super::device::{LogicalDevice, LogicalDeviceFactory};
use super::instance::Instance;
use super::queue::{CapabilityClass, QueueAllocation, QueueAllocator};
use super::render_pass;
use super::selector::{self, Requirements};
use super::shader::ShaderLibrary;
use super::surface::{self, Surface, SurfaceProvider};
use super::swapchain::choose_image_count;
use crate::config::{Config, QueueConfig};
use crate::error::{EngineError, Result};

pub struct VulkanContext {
    recorder: Box<dyn CommandRecorder>,
    shaders: ShaderLibrary,
    command_pool: vk::CommandPool,
    render_pass: vk::RenderPass,
    swapchain_loader: khr::Swapchain,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    // Field order is drop order: device, then surface, then instance.
    device: LogicalDevice,
    surface: Surface,
    instance: Instance,
    window: Arc<dyn SurfaceProvider>,
}

impl VulkanContext {
    /// Bring up Vulkan for `window`. Command buffers are recorded with a
    /// `ClearPass` using the configured clear color.
    pub fn new(
        window: Arc<dyn SurfaceProvider>,
        config: &Config,
        sink: Box<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        let recorder = Box::new(ClearPass::new(config.graphics.clear_color));
        Self::with_recorder(window, config, sink, recorder)
    }

    pub fn with_recorder(
        window: Arc<dyn SurfaceProvider>,
        config: &Config,
        sink: Box<dyn DiagnosticsSink>,
        recorder: Box<dyn CommandRecorder>,
    ) -> Result<Self> {
        let display = surface::display_handle_of(window.as_ref())?;
        let surface_extensions = surface::required_extensions(display)?;
        let instance =
            Instance::new(&config.window.title, &surface_extensions, &config.debug, sink)?;
        let surface = Surface::new(&instance.entry, &instance.instance, window.as_ref())?;

        let requirements = Requirements::from_config(config);
        let candidate =
            selector::pick_physical_device(&instance.instance, &surface, &requirements)?;
        let surface_format = candidate.format()?;

        let mut allocator = QueueAllocator::classify(
            &candidate.name,
            &candidate.queue_families,
            config.queues.duplicate_families,
        )?;
        reserve_configured(&mut allocator, &config.queues)?;
        let present_class = allocator.resolve_present()?;
        log::info!("Presenting from the {} queue", present_class);

        let device = LogicalDeviceFactory::new(&instance.instance, &candidate)
            .create(allocator, &requirements.extensions)?;
        let swapchain_loader = khr::Swapchain::new(&instance.instance, &device.device);

        let render_pass = render_pass::create_render_pass(&device, surface_format.format)?;
        let command_pool = match create_command_pool(&device) {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_render_pass(render_pass, None) };
                return Err(e);
            }
        };

        log::info!(
            "Surface format {:?} / {:?}, present mode {:?}",
            surface_format.format,
            surface_format.color_space,
            candidate.present_mode
        );

        Ok(Self {
            recorder,
            shaders: ShaderLibrary::new(&config.graphics.shader_dir),
            command_pool,
            render_pass,
            swapchain_loader,
            surface_format,
            present_mode: candidate.present_mode,
            device,
            surface,
            instance,
            window,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device.name
    }

    pub fn validation_enabled(&self) -> bool {
        self.instance.validation_enabled()
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn shaders(&self) -> &ShaderLibrary {
        &self.shaders
    }

    /// Load `<shader_dir>/<name>.spv` into a module owned by the caller.
    pub fn create_shader_module(&self, name: &str) -> Result<vk::ShaderModule> {
        self.shaders.create_module(&self.device, name)
    }

    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.device.destroy_shader_module(module, None) };
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Device did not go idle: {}", e);
        }
        unsafe {
            // Also frees any command buffers still allocated from it.
            self.device.device.destroy_command_pool(self.command_pool, None);
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Reserve the configured queue counts. At least one graphics queue is always
/// reserved; compute and transfer requests are skipped when the device has no
/// family of that class.
pub fn reserve_configured(allocator: &mut QueueAllocator, queues: &QueueConfig) -> Result<()> {
    allocator.reserve(CapabilityClass::Graphics, queues.graphics.max(1))?;

    for (class, count) in [
        (CapabilityClass::Compute, queues.compute),
        (CapabilityClass::Transfer, queues.transfer),
    ] {
        if count == 0 {
            continue;
        }
        if allocator.family(class).is_none() {
            log::info!("No {} queue family, skipping {} requested queue(s)", class, count);
            continue;
        }
        allocator.reserve(class, count)?;
    }
    Ok(())
}

fn create_command_pool(device: &LogicalDevice) -> Result<vk::CommandPool> {
    let family = device
        .queues
        .family_index(CapabilityClass::Graphics)
        .ok_or(EngineError::QueueUnavailable {
            class: CapabilityClass::Graphics,
        })?;
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.device.create_command_pool(&pool_info, None) }
        .map_err(device.creation_failed("command pool"))
}

impl GpuApi for VulkanContext {
    fn surface_extent(&self) -> Result<vk::Extent2D> {
        let drawable = self.window.drawable_extent();
        if surface::is_zero(drawable) {
            return Ok(drawable);
        }
        let capabilities = self.surface.capabilities(self.device.physical_device)?;
        Ok(surface::choose_extent(&capabilities, drawable))
    }

    fn queues(&self) -> &QueueAllocation {
        &self.device.queues
    }

    fn create_chain(&self, extent: vk::Extent2D, old: vk::SwapchainKHR) -> Result<ChainInfo> {
        let capabilities = self.surface.capabilities(self.device.physical_device)?;
        let image_count = choose_image_count(&capabilities);

        let graphics_family = self.device.queues.family_index(CapabilityClass::Graphics);
        let present_family = self
            .device
            .queues
            .present_class()
            .and_then(|class| self.device.queues.family_index(class));
        let shared_families: Vec<u32> = match (graphics_family, present_family) {
            (Some(graphics), Some(present)) if graphics != present => vec![graphics, present],
            _ => Vec::new(),
        };

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.handle)
            .min_image_count(image_count)
            .image_format(self.surface_format.format)
            .image_color_space(self.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(self.present_mode)
            .clipped(true)
            .old_swapchain(old);
        create_info = if shared_families.is_empty() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&shared_families)
        };

        let chain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(self.device.creation_failed("swapchain"))?;

        let images = match unsafe { self.swapchain_loader.get_swapchain_images(chain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { self.swapchain_loader.destroy_swapchain(chain, None) };
                return Err(EngineError::Vulkan {
                    call: "vkGetSwapchainImagesKHR",
                    result,
                });
            }
        };

        Ok(ChainInfo {
            chain,
            extent,
            format: self.surface_format.format,
            images,
        })
    }

    fn destroy_chain(&self, chain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(chain, None) };
    }

    fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.device.create_image_view(&create_info, None) }
            .map_err(self.device.creation_failed("image view"))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.device.destroy_image_view(view, None) };
    }

    fn create_framebuffer(
        &self,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        render_pass::create_framebuffer(&self.device, self.render_pass, view, extent)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
    }

    fn record_commands(
        &self,
        framebuffers: &[vk::Framebuffer],
        extent: vk::Extent2D,
    ) -> Result<Vec<vk::CommandBuffer>> {
        command::record_all(
            &self.device,
            self.command_pool,
            self.recorder.as_ref(),
            self.render_pass,
            framebuffers,
            extent,
        )
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.command_pool, buffers)
            };
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.device.create_semaphore(&create_info, None) }
            .map_err(self.device.creation_failed("semaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        unsafe { self.device.device.create_fence(&create_info, None) }
            .map_err(self.device.creation_failed("fence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<bool> {
        match unsafe {
            self.device
                .device
                .wait_for_fences(&[fence], true, timeout_nanos(timeout))
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(EngineError::Vulkan {
                call: "vkWaitForFences",
                result,
            }),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }
            .map_err(EngineError::vulkan("vkResetFences"))
    }

    fn acquire_next_image(
        &self,
        chain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: Duration,
    ) -> Result<Acquire> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                chain,
                timeout_nanos(timeout),
                signal,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Ok(Acquire::TimedOut),
            Err(result) => Err(EngineError::Vulkan {
                call: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    fn submit(&self, queue: vk::Queue, submission: &Submission) -> Result<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(queue, &[submit_info.build()], submission.fence)
        }
        .map_err(EngineError::vulkan("vkQueueSubmit"))
    }

    fn present(
        &self,
        queue: vk::Queue,
        chain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<Present> {
        let wait_semaphores = [wait];
        let swapchains = [chain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(Present::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::OutOfDate),
            Err(result) => Err(EngineError::Vulkan {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        unsafe { self.device.device.queue_wait_idle(queue) }
            .map_err(EngineError::vulkan("vkQueueWaitIdle"))
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

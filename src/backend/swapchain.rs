// Swapchain resources - the presentable images and everything derived from them
//
// A build creates the chain, then one view and one framebuffer per image.
// Teardown runs in reverse: framebuffers, views, chain. Every derived handle
// carries the generation of the build that made it, so a handle that survives
// a rebuild is caught the moment it is read.

use ash::vk;

use super::api::GpuApi;
use crate::error::Result;

/// A handle stamped with the swapchain generation it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tagged<T> {
    generation: u64,
    value: T,
}

impl<T: Copy> Tagged<T> {
    pub fn new(generation: u64, value: T) -> Self {
        Self { generation, value }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The handle, if it belongs to `current`. Panics otherwise.
    pub fn get(&self, current: u64) -> T {
        assert_eq!(
            self.generation, current,
            "handle from swapchain generation {} used in generation {}",
            self.generation, current
        );
        self.value
    }

    /// The raw handle without a generation check. Only for destruction.
    pub fn into_raw(self) -> T {
        self.value
    }
}

/// `min + 1` images, capped by the maximum when the surface has one.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        wanted.min(capabilities.max_image_count)
    } else {
        wanted
    }
}

pub struct SwapchainResources {
    chain: vk::SwapchainKHR,
    extent: vk::Extent2D,
    format: vk::Format,
    generation: u64,
    images: Vec<Tagged<vk::Image>>,
    views: Vec<Tagged<vk::ImageView>>,
    framebuffers: Vec<Tagged<vk::Framebuffer>>,
}

impl SwapchainResources {
    /// Build a chain at `extent` with `old_chain` as the creation hint.
    ///
    /// The old chain is retired by the create call whether or not it succeeds,
    /// so it is destroyed here in both cases. On a partial failure everything
    /// created so far is released before the error is returned.
    pub fn build<G: GpuApi + ?Sized>(
        gpu: &G,
        extent: vk::Extent2D,
        old_chain: vk::SwapchainKHR,
        generation: u64,
    ) -> Result<Self> {
        let created = gpu.create_chain(extent, old_chain);
        if old_chain != vk::SwapchainKHR::null() {
            gpu.destroy_chain(old_chain);
        }
        let info = created?;

        let mut resources = Self {
            chain: info.chain,
            extent: info.extent,
            format: info.format,
            generation,
            images: info
                .images
                .iter()
                .map(|&image| Tagged::new(generation, image))
                .collect(),
            views: Vec::with_capacity(info.images.len()),
            framebuffers: Vec::with_capacity(info.images.len()),
        };

        if let Err(e) = resources.derive(gpu) {
            resources.destroy(gpu);
            return Err(e);
        }

        log::debug!(
            "Swapchain generation {}: {}x{}, {:?}, {} images",
            generation,
            resources.extent.width,
            resources.extent.height,
            resources.format,
            resources.images.len()
        );
        Ok(resources)
    }

    fn derive<G: GpuApi + ?Sized>(&mut self, gpu: &G) -> Result<()> {
        for image in &self.images {
            let view = gpu.create_image_view(image.get(self.generation), self.format)?;
            self.views.push(Tagged::new(self.generation, view));
        }
        for view in &self.views {
            let framebuffer = gpu.create_framebuffer(view.get(self.generation), self.extent)?;
            self.framebuffers.push(Tagged::new(self.generation, framebuffer));
        }
        Ok(())
    }

    pub fn chain(&self) -> vk::SwapchainKHR {
        self.chain
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> Vec<vk::ImageView> {
        self.views.iter().map(|v| v.get(self.generation)).collect()
    }

    pub fn framebuffers(&self) -> Vec<vk::Framebuffer> {
        self.framebuffers
            .iter()
            .map(|f| f.get(self.generation))
            .collect()
    }

    /// Destroy framebuffers then views, and hand back the chain so it can be
    /// passed as the hint for the next build. The device must be idle.
    pub fn retire<G: GpuApi + ?Sized>(mut self, gpu: &G) -> vk::SwapchainKHR {
        self.release_derived(gpu);
        self.chain
    }

    /// Full teardown. The device must be idle.
    pub fn destroy<G: GpuApi + ?Sized>(mut self, gpu: &G) {
        self.release_derived(gpu);
        gpu.destroy_chain(self.chain);
    }

    fn release_derived<G: GpuApi + ?Sized>(&mut self, gpu: &G) {
        for framebuffer in self.framebuffers.drain(..).rev() {
            gpu.destroy_framebuffer(framebuffer.into_raw());
        }
        for view in self.views.drain(..).rev() {
            gpu.destroy_image_view(view.into_raw());
        }
        // Images belong to the chain.
        self.images.clear();
    }
}

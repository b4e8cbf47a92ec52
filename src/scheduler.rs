// Frame scheduler - the acquire / submit / present loop
//
// FRAME FLOW:
// 1. Wait for the current slot's fence (bounded, cancellable)
// 2. Acquire the next swapchain image
// 3. Wait for whichever slot last rendered that image
// 4. Submit the pre-recorded command buffer for the image
// 5. Present, then advance to the next slot
//
// An out-of-date or suboptimal chain sends the cycle through Invalidated and
// Rebuilding before the slot advances. A zero-sized surface short-circuits
// the whole call.

use ash::vk;
use std::time::Duration;

use crate::backend::api::{Acquire, GpuApi, Present, Submission};
use crate::backend::queue::CapabilityClass;
use crate::backend::surface::is_zero;
use crate::backend::swapchain::{SwapchainResources, Tagged};
use crate::backend::sync::{self, CancelToken, FrameSlot};
use crate::config::FrameConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Ready,
    Acquiring,
    Submitted,
    Presenting,
    Invalidated,
    Rebuilding,
    ShutDown,
}

/// What a `draw_frame` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// An image was submitted and presented.
    Presented,
    /// The chain was invalidated during the cycle and rebuilt.
    Rebuilt,
    /// Nothing was drawn: the surface has no area.
    Idle,
    /// The cancel token is set.
    Cancelled,
}

/// Why the chain has to be rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    OutOfDate,
    Suboptimal,
    Resized,
}

struct Timing {
    fence_timeout: Duration,
    acquire_timeout: Duration,
    poll_interval: Duration,
}

pub struct FrameScheduler<G: GpuApi> {
    gpu: G,
    timing: Timing,
    swapchain: Option<SwapchainResources>,
    slots: Vec<FrameSlot>,
    /// One per swap image, recorded against the current generation.
    commands: Vec<Tagged<vk::CommandBuffer>>,
    /// For each swap image, the slot whose submission last used it.
    images_in_flight: Vec<Option<usize>>,
    current_slot: usize,
    generation: u64,
    state: FrameState,
    pending: Option<Invalidation>,
    cancel: CancelToken,
}

impl<G: GpuApi> FrameScheduler<G> {
    /// Take ownership of `gpu` and build the first chain if the surface has
    /// area. Otherwise the chain is built by the first non-idle `draw_frame`.
    pub fn new(gpu: G, frame: &FrameConfig) -> Result<Self> {
        let mut scheduler = Self {
            gpu,
            timing: Timing {
                fence_timeout: frame.fence_timeout(),
                acquire_timeout: frame.acquire_timeout(),
                poll_interval: frame.poll_interval(),
            },
            swapchain: None,
            slots: Vec::new(),
            commands: Vec::new(),
            images_in_flight: Vec::new(),
            current_slot: 0,
            generation: 0,
            state: FrameState::Ready,
            pending: None,
            cancel: CancelToken::new(),
        };

        let extent = scheduler.gpu.surface_extent()?;
        if is_zero(extent) {
            log::info!("Surface has no area yet, deferring swapchain creation");
        } else {
            scheduler.rebuild(extent)?;
        }
        Ok(scheduler)
    }

    /// Run one frame.
    pub fn draw_frame(&mut self) -> Result<FrameOutcome> {
        if self.state == FrameState::ShutDown {
            return Err(EngineError::ShutDown);
        }
        if self.cancel.is_cancelled() {
            return Ok(FrameOutcome::Cancelled);
        }

        let extent = self.gpu.surface_extent()?;
        if is_zero(extent) {
            log::trace!("Surface is {}x{}, idling", extent.width, extent.height);
            return Ok(FrameOutcome::Idle);
        }

        // Deferred rebuilds, a missing chain and a changed surface size are
        // all handled before acquiring.
        match &self.swapchain {
            None => self.rebuild(extent)?,
            Some(_) if self.pending.is_some() => self.rebuild(extent)?,
            Some(chain) if chain.extent() != extent => {
                log::debug!(
                    "Surface is {}x{}, chain is {}x{}",
                    extent.width,
                    extent.height,
                    chain.extent().width,
                    chain.extent().height
                );
                self.pending = Some(Invalidation::Resized);
                self.rebuild(extent)?;
            }
            Some(_) => {}
        }

        let outcome = self.run_cycle()?;
        if outcome != FrameOutcome::Cancelled {
            self.current_slot = (self.current_slot + 1) % self.slots.len();
        }
        Ok(outcome)
    }

    fn run_cycle(&mut self) -> Result<FrameOutcome> {
        let slot = self.slots[self.current_slot];
        let (chain, generation) = match &self.swapchain {
            Some(resources) => (resources.chain(), resources.generation()),
            None => return Err(EngineError::Surface("no swapchain to draw into".to_string())),
        };

        // ─── Acquiring ───
        self.transition(FrameState::Acquiring);
        if !self.wait_fence(slot.in_flight, "frame fence")? {
            self.transition(FrameState::Ready);
            return Ok(FrameOutcome::Cancelled);
        }

        let acquired = self.gpu.acquire_next_image(
            chain,
            slot.image_available,
            self.timing.acquire_timeout,
        )?;
        let (image_index, acquire_suboptimal) = match acquired {
            Acquire::Image { index, suboptimal } => (index, suboptimal),
            Acquire::OutOfDate => return self.invalidate(Invalidation::OutOfDate, false),
            Acquire::TimedOut => {
                self.transition(FrameState::Ready);
                if self.cancel.is_cancelled() {
                    return Ok(FrameOutcome::Cancelled);
                }
                return Err(EngineError::Timeout {
                    what: "image acquire",
                    timeout: self.timing.acquire_timeout,
                });
            }
        };

        // The acquire semaphore is now pending. Anything short of a submit
        // leaves it signaled, so the chain has to be rebuilt.
        match self.submit_image(slot, generation, image_index) {
            Ok(true) => {}
            Ok(false) => {
                self.abandon_acquired_image(image_index);
                return Ok(FrameOutcome::Cancelled);
            }
            Err(e) => {
                self.abandon_acquired_image(image_index);
                return Err(e);
            }
        }

        // ─── Presenting ───
        self.transition(FrameState::Presenting);
        let presented = self.gpu.present(
            self.gpu.queues().present()?,
            chain,
            image_index,
            slot.render_finished,
        )?;

        match presented {
            Present::OutOfDate => self.invalidate(Invalidation::OutOfDate, false),
            Present::Presented { suboptimal: true } => {
                self.invalidate(Invalidation::Suboptimal, true)
            }
            Present::Presented { .. } if acquire_suboptimal => {
                self.invalidate(Invalidation::Suboptimal, true)
            }
            Present::Presented { .. } => {
                self.transition(FrameState::Ready);
                Ok(FrameOutcome::Presented)
            }
        }
    }

    /// Wait out any earlier frame still using `image_index`, then submit its
    /// commands. `Ok(false)` means the wait was cancelled.
    fn submit_image(
        &mut self,
        slot: FrameSlot,
        generation: u64,
        image_index: u32,
    ) -> Result<bool> {
        let image = image_index as usize;
        if image >= self.commands.len() {
            return Err(EngineError::Surface(format!(
                "acquired image {} but the chain has {}",
                image_index,
                self.commands.len()
            )));
        }

        // ─── Submitted ───
        self.transition(FrameState::Submitted);
        if let Some(previous) = self.images_in_flight[image] {
            if previous != self.current_slot {
                let fence = self.slots[previous].in_flight;
                if !self.wait_fence(fence, "image-in-flight fence")? {
                    return Ok(false);
                }
            }
        }

        self.gpu.reset_fence(slot.in_flight)?;
        let submission = Submission {
            command_buffer: self.commands[image].get(generation),
            wait_semaphore: slot.image_available,
            wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            signal_semaphore: slot.render_finished,
            fence: slot.in_flight,
        };
        self.gpu.submit(self.gpu.queues().graphics()?, &submission)?;
        self.images_in_flight[image] = Some(self.current_slot);
        Ok(true)
    }

    /// An image was acquired but never submitted. Its semaphore stays
    /// signaled, so the slots and chain are rebuilt on the next call.
    fn abandon_acquired_image(&mut self, image_index: u32) {
        log::debug!("Image {} acquired but not submitted", image_index);
        self.pending = Some(Invalidation::OutOfDate);
        self.transition(FrameState::Invalidated);
    }

    /// Record the reason and rebuild now, unless the surface has no area, in
    /// which case the rebuild waits for the next non-idle call.
    fn invalidate(&mut self, reason: Invalidation, presented: bool) -> Result<FrameOutcome> {
        self.transition(FrameState::Invalidated);
        log::debug!("Swapchain invalidated: {:?}", reason);
        self.pending = Some(reason);

        let extent = self.gpu.surface_extent()?;
        if is_zero(extent) {
            log::debug!("Surface has no area, rebuild deferred");
            return Ok(if presented {
                FrameOutcome::Presented
            } else {
                FrameOutcome::Idle
            });
        }

        self.rebuild(extent)?;
        Ok(FrameOutcome::Rebuilt)
    }

    /// Tear down slots, commands and the chain, and build them again at
    /// `extent`. The old chain is passed as the creation hint.
    fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        self.transition(FrameState::Rebuilding);

        let graphics = self.gpu.queues().graphics()?;
        self.gpu.queue_wait_idle(graphics)?;
        sync::destroy_slots(&self.gpu, &mut self.slots);
        self.gpu.device_wait_idle()?;
        self.release_commands();

        let old_chain = self
            .swapchain
            .take()
            .map(|resources| resources.retire(&self.gpu))
            .unwrap_or_else(vk::SwapchainKHR::null);

        self.generation += 1;
        let resources = SwapchainResources::build(&self.gpu, extent, old_chain, self.generation)?;
        if resources.image_count() == 0 {
            resources.destroy(&self.gpu);
            return Err(EngineError::Surface("swapchain has no images".to_string()));
        }

        let slots = match sync::create_slots(&self.gpu, resources.image_count()) {
            Ok(slots) => slots,
            Err(e) => {
                resources.destroy(&self.gpu);
                return Err(e);
            }
        };
        let commands = match self
            .gpu
            .record_commands(&resources.framebuffers(), resources.extent())
        {
            Ok(commands) => commands,
            Err(e) => {
                let mut slots = slots;
                sync::destroy_slots(&self.gpu, &mut slots);
                resources.destroy(&self.gpu);
                return Err(e);
            }
        };

        let image_count = resources.image_count();
        self.commands = commands
            .into_iter()
            .map(|buffer| Tagged::new(self.generation, buffer))
            .collect();
        self.slots = slots;
        self.images_in_flight = vec![None; image_count];
        self.current_slot %= image_count;
        self.swapchain = Some(resources);

        if let Some(reason) = self.pending.take() {
            log::info!(
                "Swapchain rebuilt ({:?}): {}x{}, {} images, generation {}",
                reason,
                extent.width,
                extent.height,
                image_count,
                self.generation
            );
        } else {
            log::info!(
                "Swapchain created: {}x{}, {} images",
                extent.width,
                extent.height,
                image_count
            );
        }
        self.transition(FrameState::Ready);
        Ok(())
    }

    fn release_commands(&mut self) {
        if self.commands.is_empty() {
            return;
        }
        let buffers: Vec<vk::CommandBuffer> =
            self.commands.drain(..).map(Tagged::into_raw).collect();
        self.gpu.free_command_buffers(&buffers);
    }

    /// Wait for `fence` in poll-interval steps until it signals, the token is
    /// cancelled (`Ok(false)`) or the fence timeout is spent.
    fn wait_fence(&self, fence: vk::Fence, what: &'static str) -> Result<bool> {
        let budget = self.timing.fence_timeout;
        let mut waited = Duration::ZERO;

        loop {
            let step = self.timing.poll_interval.min(budget - waited);
            if self.gpu.wait_for_fence(fence, step)? {
                return Ok(true);
            }
            if self.cancel.is_cancelled() {
                log::debug!("Cancelled while waiting for {}", what);
                return Ok(false);
            }
            waited += step;
            if waited >= budget {
                return Err(EngineError::Timeout {
                    what,
                    timeout: budget,
                });
            }
        }
    }

    fn transition(&mut self, next: FrameState) {
        log::trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Block until the device has finished all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.gpu.device_wait_idle()
    }

    pub fn queue(&self, class: CapabilityClass, index: usize) -> Option<vk::Queue> {
        self.gpu.queues().queue(class, index)
    }

    /// Shared with the event loop; cancelling stops fence waits and makes
    /// every later `draw_frame` return `Cancelled`.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drain the device, then release commands, slots and the chain in reverse
    /// creation order. Safe to call more than once.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == FrameState::ShutDown {
            return Ok(());
        }
        log::info!("Shutting down frame scheduler...");

        let drained = self.gpu.device_wait_idle();
        if let Err(e) = &drained {
            log::error!("Device did not drain before shutdown: {}", e);
        }

        self.release_commands();
        sync::destroy_slots(&self.gpu, &mut self.slots);
        if let Some(resources) = self.swapchain.take() {
            resources.destroy(&self.gpu);
        }
        self.images_in_flight.clear();
        self.transition(FrameState::ShutDown);
        drained
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(SwapchainResources::extent)
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }
}

impl<G: GpuApi> Drop for FrameScheduler<G> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame scheduler shutdown failed: {}", e);
        }
    }
}

// In-memory `GpuApi` for tests
//
// Hands out fake handles, tracks which are alive and records every call. Using
// a destroyed handle, destroying one twice, submitting with a signaled fence
// or building a zero-sized chain panics, so tests fail at the offending call.

use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::backend::api::{Acquire, ChainInfo, GpuApi, Present, Submission};
use crate::backend::queue::{CapabilityClass, FamilyProbe, QueueAllocation, QueueAllocator};
use crate::backend::sync::CancelToken;
use crate::config::DuplicateFamilyPolicy;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Chain,
    ImageView,
    Framebuffer,
    CommandBuffer,
    Semaphore,
    Fence,
}

impl Kind {
    fn resource(self) -> &'static str {
        match self {
            Self::Chain => "swapchain",
            Self::ImageView => "image view",
            Self::Framebuffer => "framebuffer",
            Self::CommandBuffer => "command buffers",
            Self::Semaphore => "semaphore",
            Self::Fence => "fence",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateChain {
        old: vk::SwapchainKHR,
        new: vk::SwapchainKHR,
        extent: vk::Extent2D,
    },
    DestroyChain(vk::SwapchainKHR),
    CreateImageView(vk::ImageView),
    DestroyImageView(vk::ImageView),
    CreateFramebuffer(vk::Framebuffer),
    DestroyFramebuffer(vk::Framebuffer),
    RecordCommands(Vec<vk::CommandBuffer>),
    FreeCommandBuffers(Vec<vk::CommandBuffer>),
    CreateSemaphore(vk::Semaphore),
    DestroySemaphore(vk::Semaphore),
    CreateFence(vk::Fence),
    DestroyFence(vk::Fence),
    WaitFence(vk::Fence),
    ResetFence(vk::Fence),
    Acquire(vk::SwapchainKHR),
    Submit {
        queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
    },
    Present {
        queue: vk::Queue,
        chain: vk::SwapchainKHR,
        image_index: u32,
    },
    QueueWaitIdle(vk::Queue),
    DeviceWaitIdle,
}

struct State {
    next_handle: u64,
    live: HashMap<u64, Kind>,
    signaled: HashMap<u64, bool>,
    calls: Vec<Call>,
    extent: vk::Extent2D,
    image_count: u32,
    next_image: u32,
    acquires: VecDeque<Acquire>,
    presents: VecDeque<Present>,
    failures: HashMap<Kind, usize>,
    hang_fences: bool,
    extent_after_present: Option<vk::Extent2D>,
    cancel_on_wait: Option<(usize, CancelToken)>,
    unsignaled_waits: usize,
}

impl State {
    fn create(&mut self, kind: Kind) -> Result<u64> {
        if let Some(left) = self.failures.get_mut(&kind) {
            if *left == 0 {
                self.failures.remove(&kind);
                return Err(EngineError::ResourceCreation {
                    resource: kind.resource(),
                    device: "mock".to_string(),
                    result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                });
            }
            *left -= 1;
        }
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        Ok(self.next_handle)
    }

    fn destroy(&mut self, raw: u64, kind: Kind) {
        match self.live.remove(&raw) {
            Some(found) => assert_eq!(found, kind, "handle {raw:#x} destroyed as {kind:?}"),
            None => panic!("{kind:?} {raw:#x} destroyed twice or never created"),
        }
        self.signaled.remove(&raw);
    }

    fn expect_live(&self, raw: u64, kind: Kind) {
        assert_eq!(
            self.live.get(&raw),
            Some(&kind),
            "{kind:?} {raw:#x} used after destruction"
        );
    }
}

pub struct MockGpu {
    state: RefCell<State>,
    queues: QueueAllocation,
}

impl MockGpu {
    /// One graphics family that can present, one queue reserved.
    pub fn new(extent: vk::Extent2D, image_count: u32) -> Self {
        Self::with_families(
            extent,
            image_count,
            &[FamilyProbe {
                flags: vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
                queue_count: 4,
                present_support: true,
            }],
        )
    }

    /// A graphics family that cannot present next to a compute family that
    /// can, so rendering and presentation land on different queues.
    pub fn with_separate_present(extent: vk::Extent2D, image_count: u32) -> Self {
        Self::with_families(
            extent,
            image_count,
            &[
                FamilyProbe {
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 4,
                    present_support: false,
                },
                FamilyProbe {
                    flags: vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                    present_support: true,
                },
            ],
        )
    }

    fn with_families(extent: vk::Extent2D, image_count: u32, probes: &[FamilyProbe]) -> Self {
        let mut allocator = QueueAllocator::classify("mock", probes, DuplicateFamilyPolicy::Reject)
            .expect("families classify");
        allocator
            .reserve(CapabilityClass::Graphics, 1)
            .expect("family has capacity");
        allocator.resolve_present().expect("a family can present");
        let queues = allocator.populate(|family, index| {
            vk::Queue::from_raw(0x1000 + u64::from(family) * 16 + u64::from(index))
        });

        Self {
            state: RefCell::new(State {
                next_handle: 0,
                live: HashMap::new(),
                signaled: HashMap::new(),
                calls: Vec::new(),
                extent,
                image_count,
                next_image: 0,
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                failures: HashMap::new(),
                hang_fences: false,
                extent_after_present: None,
                cancel_on_wait: None,
                unsignaled_waits: 0,
            }),
            queues,
        }
    }

    pub fn set_extent(&self, width: u32, height: u32) {
        self.state.borrow_mut().extent = vk::Extent2D { width, height };
    }

    /// Number of images the next chain will have.
    pub fn set_image_count(&self, count: u32) {
        self.state.borrow_mut().image_count = count;
    }

    /// Queue a result for an upcoming acquire. Unscripted acquires hand out
    /// images round-robin.
    pub fn script_acquire(&self, result: Acquire) {
        self.state.borrow_mut().acquires.push_back(result);
    }

    pub fn script_present(&self, result: Present) {
        self.state.borrow_mut().presents.push_back(result);
    }

    /// Let `successes` more creations of `kind` succeed, then fail one.
    pub fn fail_after(&self, kind: Kind, successes: usize) {
        self.state.borrow_mut().failures.insert(kind, successes);
    }

    /// Submissions stop signaling their fence.
    pub fn hang_fences(&self) {
        self.state.borrow_mut().hang_fences = true;
    }

    /// The surface takes this size as soon as the next present returns.
    pub fn extent_after_present(&self, width: u32, height: u32) {
        self.state.borrow_mut().extent_after_present = Some(vk::Extent2D { width, height });
    }

    /// Cancel `token` on the `n`th wait that finds a fence unsignaled.
    pub fn cancel_on_wait(&self, n: usize, token: CancelToken) {
        self.state.borrow_mut().cancel_on_wait = Some((n, token));
    }

    pub fn live(&self, kind: Kind) -> usize {
        self.state
            .borrow()
            .live
            .values()
            .filter(|&&k| k == kind)
            .count()
    }

    pub fn live_total(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn is_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .borrow()
            .signaled
            .get(&fence.as_raw())
            .copied()
            .unwrap_or(false)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }
}

impl GpuApi for MockGpu {
    fn surface_extent(&self) -> Result<vk::Extent2D> {
        Ok(self.state.borrow().extent)
    }

    fn queues(&self) -> &QueueAllocation {
        &self.queues
    }

    fn create_chain(&self, extent: vk::Extent2D, old: vk::SwapchainKHR) -> Result<ChainInfo> {
        let mut state = self.state.borrow_mut();
        assert!(
            extent.width > 0 && extent.height > 0,
            "zero-sized chain requested: {extent:?}"
        );
        if old != vk::SwapchainKHR::null() {
            state.expect_live(old.as_raw(), Kind::Chain);
        }
        let chain = vk::SwapchainKHR::from_raw(state.create(Kind::Chain)?);
        state.calls.push(Call::CreateChain {
            old,
            new: chain,
            extent,
        });

        // Images are owned by the chain and not tracked.
        let images = (0..state.image_count)
            .map(|i| vk::Image::from_raw(0xFFFF_0000 + chain.as_raw() * 64 + u64::from(i)))
            .collect();
        state.next_image = 0;

        Ok(ChainInfo {
            chain,
            extent,
            format: vk::Format::B8G8R8A8_SRGB,
            images,
        })
    }

    fn destroy_chain(&self, chain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.destroy(chain.as_raw(), Kind::Chain);
        state.calls.push(Call::DestroyChain(chain));
    }

    fn create_image_view(&self, _image: vk::Image, _format: vk::Format) -> Result<vk::ImageView> {
        let mut state = self.state.borrow_mut();
        let view = vk::ImageView::from_raw(state.create(Kind::ImageView)?);
        state.calls.push(Call::CreateImageView(view));
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = self.state.borrow_mut();
        state.destroy(view.as_raw(), Kind::ImageView);
        state.calls.push(Call::DestroyImageView(view));
    }

    fn create_framebuffer(
        &self,
        view: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let mut state = self.state.borrow_mut();
        state.expect_live(view.as_raw(), Kind::ImageView);
        let framebuffer = vk::Framebuffer::from_raw(state.create(Kind::Framebuffer)?);
        state.calls.push(Call::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = self.state.borrow_mut();
        state.destroy(framebuffer.as_raw(), Kind::Framebuffer);
        state.calls.push(Call::DestroyFramebuffer(framebuffer));
    }

    fn record_commands(
        &self,
        framebuffers: &[vk::Framebuffer],
        _extent: vk::Extent2D,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.borrow_mut();
        for framebuffer in framebuffers {
            state.expect_live(framebuffer.as_raw(), Kind::Framebuffer);
        }
        let mut buffers = Vec::with_capacity(framebuffers.len());
        for _ in framebuffers {
            match state.create(Kind::CommandBuffer) {
                Ok(raw) => buffers.push(vk::CommandBuffer::from_raw(raw)),
                Err(e) => {
                    // All or nothing, like vkAllocateCommandBuffers.
                    for buffer in &buffers {
                        state.live.remove(&buffer.as_raw());
                    }
                    return Err(e);
                }
            }
        }
        state.calls.push(Call::RecordCommands(buffers.clone()));
        Ok(buffers)
    }

    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.borrow_mut();
        for buffer in buffers {
            state.destroy(buffer.as_raw(), Kind::CommandBuffer);
        }
        state.calls.push(Call::FreeCommandBuffers(buffers.to_vec()));
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.state.borrow_mut();
        let semaphore = vk::Semaphore::from_raw(state.create(Kind::Semaphore)?);
        state.calls.push(Call::CreateSemaphore(semaphore));
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = self.state.borrow_mut();
        state.destroy(semaphore.as_raw(), Kind::Semaphore);
        state.calls.push(Call::DestroySemaphore(semaphore));
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.borrow_mut();
        let raw = state.create(Kind::Fence)?;
        state.signaled.insert(raw, signaled);
        let fence = vk::Fence::from_raw(raw);
        state.calls.push(Call::CreateFence(fence));
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        state.destroy(fence.as_raw(), Kind::Fence);
        state.calls.push(Call::DestroyFence(fence));
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: Duration) -> Result<bool> {
        let mut state = self.state.borrow_mut();
        state.expect_live(fence.as_raw(), Kind::Fence);
        state.calls.push(Call::WaitFence(fence));
        if state.signaled.get(&fence.as_raw()).copied().unwrap_or(false) {
            return Ok(true);
        }

        state.unsignaled_waits += 1;
        let waits = state.unsignaled_waits;
        if let Some((n, token)) = &state.cancel_on_wait {
            if *n == waits {
                token.cancel();
            }
        }
        Ok(false)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.expect_live(fence.as_raw(), Kind::Fence);
        state.signaled.insert(fence.as_raw(), false);
        state.calls.push(Call::ResetFence(fence));
        Ok(())
    }

    fn acquire_next_image(
        &self,
        chain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout: Duration,
    ) -> Result<Acquire> {
        let mut state = self.state.borrow_mut();
        state.expect_live(chain.as_raw(), Kind::Chain);
        state.expect_live(signal.as_raw(), Kind::Semaphore);
        state.calls.push(Call::Acquire(chain));

        if let Some(scripted) = state.acquires.pop_front() {
            return Ok(scripted);
        }
        let index = state.next_image % state.image_count.max(1);
        state.next_image += 1;
        Ok(Acquire::Image {
            index,
            suboptimal: false,
        })
    }

    fn submit(&self, queue: vk::Queue, submission: &Submission) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.expect_live(submission.command_buffer.as_raw(), Kind::CommandBuffer);
        state.expect_live(submission.wait_semaphore.as_raw(), Kind::Semaphore);
        state.expect_live(submission.signal_semaphore.as_raw(), Kind::Semaphore);
        state.expect_live(submission.fence.as_raw(), Kind::Fence);
        assert!(
            !state
                .signaled
                .get(&submission.fence.as_raw())
                .copied()
                .unwrap_or(false),
            "fence submitted while still signaled"
        );

        let completes = !state.hang_fences;
        state.signaled.insert(submission.fence.as_raw(), completes);
        state.calls.push(Call::Submit {
            queue,
            command_buffer: submission.command_buffer,
        });
        Ok(())
    }

    fn present(
        &self,
        queue: vk::Queue,
        chain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<Present> {
        let mut state = self.state.borrow_mut();
        state.expect_live(chain.as_raw(), Kind::Chain);
        state.expect_live(wait.as_raw(), Kind::Semaphore);
        state.calls.push(Call::Present {
            queue,
            chain,
            image_index,
        });
        if let Some(extent) = state.extent_after_present.take() {
            state.extent = extent;
        }
        Ok(state
            .presents
            .pop_front()
            .unwrap_or(Present::Presented { suboptimal: false }))
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> Result<()> {
        self.state.borrow_mut().calls.push(Call::QueueWaitIdle(queue));
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.state.borrow_mut().calls.push(Call::DeviceWaitIdle);
        Ok(())
    }
}

// Synchronization primitives
//
// One `FrameSlot` per swap image: a semaphore pair orders acquire, render and
// present on the GPU, and a fence tells the CPU when the slot's last
// submission has finished.

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::api::GpuApi;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub index: usize,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    /// Created signaled so the first wait on a fresh slot returns at once.
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    pub fn create<G: GpuApi + ?Sized>(gpu: &G, index: usize) -> Result<Self> {
        let image_available = gpu.create_semaphore()?;
        let render_finished = match gpu.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                gpu.destroy_semaphore(image_available);
                return Err(e);
            }
        };
        let in_flight = match gpu.create_fence(true) {
            Ok(fence) => fence,
            Err(e) => {
                gpu.destroy_semaphore(render_finished);
                gpu.destroy_semaphore(image_available);
                return Err(e);
            }
        };

        Ok(Self {
            index,
            image_available,
            render_finished,
            in_flight,
        })
    }

    pub fn destroy<G: GpuApi + ?Sized>(&self, gpu: &G) {
        gpu.destroy_fence(self.in_flight);
        gpu.destroy_semaphore(self.render_finished);
        gpu.destroy_semaphore(self.image_available);
    }
}

/// `count` slots, or none: slots made before a failure are destroyed.
pub fn create_slots<G: GpuApi + ?Sized>(gpu: &G, count: usize) -> Result<Vec<FrameSlot>> {
    let mut slots = Vec::with_capacity(count);
    for index in 0..count {
        match FrameSlot::create(gpu, index) {
            Ok(slot) => slots.push(slot),
            Err(e) => {
                destroy_slots(gpu, &mut slots);
                return Err(e);
            }
        }
    }
    Ok(slots)
}

/// Destroy in reverse creation order and empty the list.
pub fn destroy_slots<G: GpuApi + ?Sized>(gpu: &G, slots: &mut Vec<FrameSlot>) {
    for slot in slots.drain(..).rev() {
        slot.destroy(gpu);
    }
}

/// Shared flag the event loop sets to stop the frame loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

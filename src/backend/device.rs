// Logical device creation
//
// The device is created from the reservations made on a `QueueAllocator`:
// one `DeviceQueueCreateInfo` per family with reserved queues, every queue at
// priority 1.0. Queue handles are fetched right after creation, which freezes
// the reservations into a `QueueAllocation`.

use ash::vk;
use std::ffi::{c_char, CStr};

use super::queue::{CapabilityClass, QueueAllocation, QueueAllocator};
use super::selector::DeviceCandidate;
use crate::error::{EngineError, Result};

/// Owns the `VkDevice` and the queues fetched from it.
pub struct LogicalDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub name: String,
    pub queues: QueueAllocation,
}

impl LogicalDevice {
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.map_err(EngineError::vulkan("vkDeviceWaitIdle"))
    }

    /// Wrap a raw failure from creating `resource` on this device.
    pub fn creation_failed(
        &self,
        resource: &'static str,
    ) -> impl FnOnce(vk::Result) -> EngineError {
        EngineError::creation_failed(resource, &self.name)
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        log::info!("Destroying logical device...");
        if let Err(e) = self.wait_idle() {
            log::warn!("Device did not go idle before destruction: {}", e);
        }
        unsafe { self.device.destroy_device(None) };
    }
}

/// One priority per queue; families share the slice up to their own count.
pub fn queue_priorities(requests: &[(u32, u32)]) -> Vec<f32> {
    let widest = requests.iter().map(|&(_, count)| count).max().unwrap_or(0);
    vec![1.0; widest as usize]
}

pub struct LogicalDeviceFactory<'a> {
    instance: &'a ash::Instance,
    candidate: &'a DeviceCandidate,
}

impl<'a> LogicalDeviceFactory<'a> {
    pub fn new(instance: &'a ash::Instance, candidate: &'a DeviceCandidate) -> Self {
        Self {
            instance,
            candidate,
        }
    }

    /// Create the device with `extensions` enabled and populate `allocator`.
    pub fn create(&self, allocator: QueueAllocator, extensions: &[&CStr]) -> Result<LogicalDevice> {
        let requests = allocator.queue_requests();
        if requests.is_empty() {
            return Err(EngineError::QueueUnavailable {
                class: CapabilityClass::Graphics,
            });
        }

        let priorities = queue_priorities(&requests);
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = requests
            .iter()
            .map(|&(family, count)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count as usize])
                    .build()
            })
            .collect();

        let extension_names: Vec<*const c_char> =
            extensions.iter().map(|ext| ext.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        let device = unsafe {
            self.instance
                .create_device(self.candidate.handle, &create_info, None)
        }
        .map_err(EngineError::creation_failed("logical device", &self.candidate.name))?;

        let queues =
            allocator.populate(|family, index| unsafe { device.get_device_queue(family, index) });

        log::info!(
            "Created logical device on \"{}\" with queues {:?}",
            self.candidate.name,
            requests
        );

        Ok(LogicalDevice {
            device,
            physical_device: self.candidate.handle,
            name: self.candidate.name.clone(),
            queues,
        })
    }
}

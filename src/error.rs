// Engine errors
//
// Every failure that can leave the frame loop is one of these. Out-of-date and
// suboptimal surfaces are not errors: they travel as `Acquire`/`Present` data.

use ash::vk;
use std::time::Duration;
use thiserror::Error;

use crate::backend::queue::CapabilityClass;

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(
        "no graphics device supports presentation ({examined} examined){}",
        format_rejections(.rejected)
    )]
    UnsupportedDevice {
        examined: usize,
        /// `(device name, reason)` for every rejected device, in enumeration order.
        rejected: Vec<(String, String)>,
    },

    #[error("failed to create {resource} on \"{device}\": {result}")]
    ResourceCreation {
        resource: &'static str,
        device: String,
        result: vk::Result,
    },

    #[error(
        "cannot reserve {requested} {class} queue(s) in family {family} on \"{device}\": \
         {reserved} of {capacity} already reserved"
    )]
    QueueCapacityExceeded {
        device: String,
        class: CapabilityClass,
        family: u32,
        requested: u32,
        reserved: u32,
        capacity: u32,
    },

    #[error("queue families {first} and {second} on \"{device}\" both classify as {class}")]
    DuplicateClass {
        device: String,
        class: CapabilityClass,
        first: u32,
        second: u32,
    },

    #[error("no {class} queue is available on this device")]
    QueueUnavailable { class: CapabilityClass },

    #[error("validation layer {layer} is not available")]
    ValidationLayerUnavailable { layer: String },

    #[error("{what} did not complete within {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },

    #[error("{call} failed: {result}")]
    Vulkan { call: &'static str, result: vk::Result },

    #[error("surface error: {0}")]
    Surface(String),

    #[error("failed to read shader \"{name}\"")]
    Shader {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shader \"{name}\" is not valid SPIR-V: {reason}")]
    InvalidShader { name: String, reason: &'static str },

    #[error("failed to load the Vulkan library: {0}")]
    LoaderUnavailable(String),

    #[error("the frame scheduler has been shut down")]
    ShutDown,
}

impl EngineError {
    /// Shorthand for wrapping a raw `vk::Result` from `call`.
    pub fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Vulkan { call, result }
    }

    /// Wrap a failure to create `resource` on the named device.
    pub fn creation_failed(
        resource: &'static str,
        device: &str,
    ) -> impl FnOnce(vk::Result) -> Self {
        let device = device.to_string();
        move |result| Self::ResourceCreation {
            resource,
            device,
            result,
        }
    }
}

fn format_rejections(rejected: &[(String, String)]) -> String {
    rejected
        .iter()
        .map(|(name, reason)| format!("; {name}: {reason}"))
        .collect()
}

// Physical device selection
//
// Every device is probed into plain data first (`DeviceProbe`), then scored
// and checked for presentation support. Selection takes the highest score
// among presentable devices; equal scores keep enumeration order.

use ash::vk;
use std::ffi::CStr;

use super::queue::FamilyProbe;
use super::surface::Surface;
use crate::config::{Config, SurfaceFormatPolicy};
use crate::error::{EngineError, Result};

pub const DISCRETE_GPU_SCORE: i32 = 100;
pub const GEOMETRY_SHADER_SCORE: i32 = 20;
pub const PREFERRED_DEVICE_SCORE: i32 = 1000;

/// Formats accepted without a policy decision, best first.
pub const PREFERRED_FORMATS: [vk::Format; 2] =
    [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];

/// Everything selection needs to know about one device.
#[derive(Debug, Clone)]
pub struct DeviceProbe {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub geometry_shader: bool,
    pub extensions: Vec<String>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub queue_families: Vec<FamilyProbe>,
}

/// Selection requirements, derived from `Config`.
#[derive(Debug, Clone)]
pub struct Requirements {
    pub extensions: Vec<&'static CStr>,
    pub present_mode: vk::PresentModeKHR,
    pub format_policy: SurfaceFormatPolicy,
    pub preferred_device: Option<String>,
}

impl Requirements {
    pub fn from_config(config: &Config) -> Self {
        Self {
            extensions: required_device_extensions(),
            present_mode: config.preferred_present_mode(),
            format_policy: config.graphics.surface_format,
            preferred_device: config
                .graphics
                .preferred_device
                .as_ref()
                .filter(|name| !name.is_empty())
                .cloned(),
        }
    }
}

pub fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::extensions::khr::Swapchain::name()]
}

/// A scored device. Immutable once evaluated.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub index: usize,
    pub name: String,
    pub score: i32,
    pub discrete: bool,
    pub surface_format: Option<vk::SurfaceFormatKHR>,
    pub present_mode: vk::PresentModeKHR,
    pub queue_families: Vec<FamilyProbe>,
    /// Why the device cannot present, if it cannot.
    pub rejection: Option<String>,
}

impl DeviceCandidate {
    pub fn evaluate(
        index: usize,
        handle: vk::PhysicalDevice,
        probe: DeviceProbe,
        requirements: &Requirements,
    ) -> Self {
        let discrete = probe.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        let mut score = 0;
        if discrete {
            score += DISCRETE_GPU_SCORE;
        }
        if probe.geometry_shader {
            score += GEOMETRY_SHADER_SCORE;
        }
        if let Some(wanted) = &requirements.preferred_device {
            if probe.name.to_lowercase().contains(&wanted.to_lowercase()) {
                score += PREFERRED_DEVICE_SCORE;
            }
        }

        let surface_format =
            choose_surface_format(&probe.surface_formats, requirements.format_policy);
        let present_mode = choose_present_mode(&probe.present_modes, requirements.present_mode);
        let rejection = presentation_problem(&probe, requirements, surface_format.is_some());

        log::debug!(
            "GPU [{}] {}: {:?}, score {}, {}",
            index,
            probe.name,
            probe.device_type,
            score,
            rejection.as_deref().unwrap_or("can present")
        );

        Self {
            handle,
            index,
            name: probe.name,
            score,
            discrete,
            surface_format,
            present_mode,
            queue_families: probe.queue_families,
            rejection,
        }
    }

    /// A device whose surface or queue queries failed. It is kept so the
    /// failure shows up among the rejection reasons.
    pub fn unprobed(
        index: usize,
        handle: vk::PhysicalDevice,
        name: String,
        error: &EngineError,
    ) -> Self {
        log::warn!("GPU [{}] {} could not be probed: {}", index, name, error);
        Self {
            handle,
            index,
            name,
            score: 0,
            discrete: false,
            surface_format: None,
            present_mode: vk::PresentModeKHR::FIFO,
            queue_families: Vec::new(),
            rejection: Some(format!("probe failed: {}", error)),
        }
    }

    pub fn supports_present(&self) -> bool {
        self.rejection.is_none()
    }

    /// The chosen surface format. Only `None` on candidates that cannot present.
    pub fn format(&self) -> Result<vk::SurfaceFormatKHR> {
        self.surface_format.ok_or_else(|| EngineError::UnsupportedDevice {
            examined: 1,
            rejected: vec![(
                self.name.clone(),
                self.rejection
                    .clone()
                    .unwrap_or_else(|| "no usable surface format".to_string()),
            )],
        })
    }
}

fn presentation_problem(
    probe: &DeviceProbe,
    requirements: &Requirements,
    has_format: bool,
) -> Option<String> {
    if let Some(missing) = requirements
        .extensions
        .iter()
        .find(|ext| {
            !probe
                .extensions
                .iter()
                .any(|have| have.as_bytes() == ext.to_bytes())
        })
    {
        return Some(format!("missing {}", missing.to_string_lossy()));
    }
    if !has_format {
        return Some(format!(
            "no preferred surface format among {:?}",
            probe.surface_formats.iter().map(|f| f.format).collect::<Vec<_>>()
        ));
    }
    if probe.present_modes.is_empty() {
        return Some("no present modes".to_string());
    }
    // A max of zero means no upper limit.
    let max = probe.capabilities.max_image_count;
    if max != 0 && max < 2 {
        return Some("surface supports a single image".to_string());
    }
    if !probe.queue_families.iter().any(|family| family.present_support) {
        return Some("no queue family can present".to_string());
    }
    None
}

/// Prefer an sRGB-nonlinear BGRA8 format. A lone `UNDEFINED` entry means the
/// surface has no preference.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    policy: SurfaceFormatPolicy,
) -> Option<vk::SurfaceFormatKHR> {
    if let [only] = formats {
        if only.format == vk::Format::UNDEFINED {
            return Some(vk::SurfaceFormatKHR {
                format: PREFERRED_FORMATS[0],
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            });
        }
    }

    let preferred = PREFERRED_FORMATS.iter().find_map(|&wanted| {
        formats
            .iter()
            .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
            .copied()
    });

    match (preferred, policy) {
        (Some(format), _) => Some(format),
        (None, SurfaceFormatPolicy::FirstAvailable) => {
            let first = formats.first().copied();
            if let Some(format) = first {
                log::warn!(
                    "No sRGB BGRA8 surface format, falling back to {:?} / {:?}",
                    format.format,
                    format.color_space
                );
            }
            first
        }
        (None, SurfaceFormatPolicy::Strict) => None,
    }
}

/// The preferred mode if offered, otherwise FIFO, which every device supports.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Highest score among presentable candidates; ties go to the earlier index.
pub fn select(candidates: Vec<DeviceCandidate>) -> Result<DeviceCandidate> {
    let examined = candidates.len();
    let mut ranked = candidates;
    // Stable: equal scores stay in enumeration order.
    ranked.sort_by(|a, b| b.score.cmp(&a.score));

    let rejected = ranked
        .iter()
        .filter_map(|c| {
            c.rejection
                .as_ref()
                .map(|why| (c.index, c.name.clone(), why.clone()))
        })
        .collect::<Vec<_>>();

    match ranked.into_iter().find(DeviceCandidate::supports_present) {
        Some(chosen) => {
            log::info!("Picked device \"{}\" (score {})", chosen.name, chosen.score);
            Ok(chosen)
        }
        None => {
            let mut rejected = rejected;
            rejected.sort_by_key(|(index, _, _)| *index);
            Err(EngineError::UnsupportedDevice {
                examined,
                rejected: rejected.into_iter().map(|(_, name, why)| (name, why)).collect(),
            })
        }
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Query one physical device into a `DeviceProbe`.
pub fn probe_device(
    instance: &ash::Instance,
    surface: &Surface,
    device: vk::PhysicalDevice,
) -> Result<DeviceProbe> {
    let properties = unsafe { instance.get_physical_device_properties(device) };
    let features = unsafe { instance.get_physical_device_features(device) };
    let name = device_name(&properties);

    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
        .map_err(EngineError::vulkan("vkEnumerateDeviceExtensionProperties"))?
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();

    let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) }
        .iter()
        .enumerate()
        .map(|(index, props)| {
            let present_support = unsafe {
                surface.loader.get_physical_device_surface_support(
                    device,
                    index as u32,
                    surface.handle,
                )
            }
            .map_err(EngineError::vulkan("vkGetPhysicalDeviceSurfaceSupportKHR"))?;
            Ok(FamilyProbe {
                flags: props.queue_flags,
                queue_count: props.queue_count,
                present_support,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let capabilities = surface.capabilities(device)?;
    let surface_formats = unsafe {
        surface
            .loader
            .get_physical_device_surface_formats(device, surface.handle)
    }
    .map_err(EngineError::vulkan("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
    let present_modes = unsafe {
        surface
            .loader
            .get_physical_device_surface_present_modes(device, surface.handle)
    }
    .map_err(EngineError::vulkan("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;

    Ok(DeviceProbe {
        name,
        device_type: properties.device_type,
        geometry_shader: features.geometry_shader == vk::TRUE,
        extensions,
        surface_formats,
        present_modes,
        capabilities,
        queue_families,
    })
}

/// Enumerate, probe and pick.
pub fn pick_physical_device(
    instance: &ash::Instance,
    surface: &Surface,
    requirements: &Requirements,
) -> Result<DeviceCandidate> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(EngineError::vulkan("vkEnumeratePhysicalDevices"))?;

    let candidates = devices
        .into_iter()
        .enumerate()
        .map(|(index, device)| match probe_device(instance, surface, device) {
            Ok(probe) => DeviceCandidate::evaluate(index, device, probe, requirements),
            Err(e) => {
                let properties = unsafe { instance.get_physical_device_properties(device) };
                DeviceCandidate::unprobed(index, device, device_name(&properties), &e)
            }
        })
        .collect();

    select(candidates)
}

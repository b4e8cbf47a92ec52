// Vulkan instance - library loading, validation layers, debug messenger
//
// The instance outlives every other Vulkan object; `VulkanContext` keeps it as
// its last field so it is destroyed last.

use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};

use super::debug::{self, DiagnosticsSink};
use crate::config::DebugConfig;
use crate::error::{EngineError, Result};

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub struct Instance {
    pub instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    // The messenger's user data points into this box.
    _sink: Box<Box<dyn DiagnosticsSink>>,
    pub entry: Entry,
}

impl Instance {
    /// Create the instance with `surface_extensions` enabled. Validation is
    /// enabled when configured and available; when it is configured but
    /// missing, startup only fails if `require_validation` is set.
    pub fn new(
        app_name: &str,
        surface_extensions: &[&'static CStr],
        debug: &DebugConfig,
        sink: Box<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        log::info!("Creating Vulkan instance: {}", app_name);

        let entry = unsafe { Entry::load() }
            .map_err(|e| EngineError::LoaderUnavailable(e.to_string()))?;

        let enable_validation = debug.validation_layers && {
            let layers = entry
                .enumerate_instance_layer_properties()
                .map_err(EngineError::vulkan("vkEnumerateInstanceLayerProperties"))?;
            let available = layer_available(&layers, VALIDATION_LAYER);
            if !available {
                if debug.require_validation {
                    return Err(EngineError::ValidationLayerUnavailable {
                        layer: VALIDATION_LAYER.to_string_lossy().into_owned(),
                    });
                }
                log::warn!(
                    "{} not available, continuing without validation",
                    VALIDATION_LAYER.to_string_lossy()
                );
            }
            available
        };

        let app_name_cstr = CString::new(app_name)
            .unwrap_or_else(|_| CString::from(c"frame-engine"));
        let engine_name = c"frame-engine";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions: Vec<*const c_char> =
            surface_extensions.iter().map(|ext| ext.as_ptr()).collect();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(EngineError::vulkan("vkCreateInstance"))?;

        let sink = Box::new(sink);
        let user_data = &*sink as *const Box<dyn DiagnosticsSink> as *mut std::ffi::c_void;
        let debug_utils = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance, user_data) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            instance,
            debug_utils,
            _sink: sink,
            entry,
        })
    }

    pub fn validation_enabled(&self) -> bool {
        self.debug_utils.is_some()
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
        user_data: *mut std::ffi::c_void,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(debug::subscribed_severities())
            .message_type(debug::subscribed_categories())
            .pfn_user_callback(Some(debug::debug_callback))
            .user_data(user_data);

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .map_err(EngineError::vulkan("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Whether `name` is among the reported layers.
pub fn layer_available(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers.iter().any(|layer| {
        let layer_name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        layer_name == name
    })
}

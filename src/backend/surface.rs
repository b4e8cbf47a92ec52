// Presentation surface
//
// A `SurfaceProvider` is anything with window/display handles that can report
// its drawable size. The surface itself is created per platform from the raw
// handles, the same way for every windowing library.

use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::CStr;

use crate::error::{EngineError, Result};

pub trait SurfaceProvider: HasWindowHandle + HasDisplayHandle {
    /// Current drawable size in pixels. Zero in either dimension while the
    /// window is minimized.
    fn drawable_extent(&self) -> vk::Extent2D;
}

impl SurfaceProvider for winit::window::Window {
    fn drawable_extent(&self) -> vk::Extent2D {
        if self.is_minimized() == Some(true) {
            return vk::Extent2D::default();
        }
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

/// Instance extensions needed to present to windows of this display kind.
pub fn required_extensions(display: RawDisplayHandle) -> Result<Vec<&'static CStr>> {
    use ash::extensions::khr;

    let platform = match display {
        RawDisplayHandle::Windows(_) => khr::Win32Surface::name(),
        RawDisplayHandle::Xlib(_) => khr::XlibSurface::name(),
        RawDisplayHandle::Xcb(_) => khr::XcbSurface::name(),
        RawDisplayHandle::Wayland(_) => khr::WaylandSurface::name(),
        other => {
            return Err(EngineError::Surface(format!(
                "unsupported display handle: {:?}",
                other
            )))
        }
    };

    Ok(vec![khr::Surface::name(), platform])
}

pub fn display_handle_of(provider: &dyn SurfaceProvider) -> Result<RawDisplayHandle> {
    provider
        .display_handle()
        .map(|handle| handle.as_raw())
        .map_err(|e| EngineError::Surface(format!("failed to get display handle: {}", e)))
}

/// Owns a `VkSurfaceKHR` and the loader that destroys it.
pub struct Surface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        provider: &dyn SurfaceProvider,
    ) -> Result<Self> {
        let display = display_handle_of(provider)?;
        let window = provider
            .window_handle()
            .map(|handle| handle.as_raw())
            .map_err(|e| EngineError::Surface(format!("failed to get window handle: {}", e)))?;

        let handle = unsafe { create_platform_surface(entry, instance, display, window) }?;
        log::info!("Surface created");

        Ok(Self {
            loader: ash::extensions::khr::Surface::new(entry, instance),
            handle,
        })
    }

    pub fn capabilities(&self, device: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(device, self.handle)
        }
        .map_err(EngineError::vulkan("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

unsafe fn create_platform_surface(
    entry: &Entry,
    instance: &ash::Instance,
    display: RawDisplayHandle,
    window: RawWindowHandle,
) -> Result<vk::SurfaceKHR> {
    use ash::extensions::khr;

    let surface = match (display, window) {
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(handle)) => {
            let hinstance =
                handle.hinstance.map(|h| h.get()).unwrap_or(0) as *const std::ffi::c_void;
            let hwnd = handle.hwnd.get() as *const std::ffi::c_void;
            let create_info = vk::Win32SurfaceCreateInfoKHR::builder()
                .hinstance(hinstance)
                .hwnd(hwnd);
            khr::Win32Surface::new(entry, instance).create_win32_surface(&create_info, None)
        }
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(handle)) => {
            let dpy = display
                .display
                .ok_or_else(|| EngineError::Surface("Xlib display handle is null".to_string()))?;
            let create_info = vk::XlibSurfaceCreateInfoKHR::builder()
                .dpy(dpy.as_ptr().cast())
                .window(handle.window);
            khr::XlibSurface::new(entry, instance).create_xlib_surface(&create_info, None)
        }
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(handle)) => {
            let connection = display
                .connection
                .ok_or_else(|| EngineError::Surface("XCB connection is null".to_string()))?;
            let create_info = vk::XcbSurfaceCreateInfoKHR::builder()
                .connection(connection.as_ptr())
                .window(handle.window.get());
            khr::XcbSurface::new(entry, instance).create_xcb_surface(&create_info, None)
        }
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(handle)) => {
            let create_info = vk::WaylandSurfaceCreateInfoKHR::builder()
                .display(display.display.as_ptr())
                .surface(handle.surface.as_ptr());
            khr::WaylandSurface::new(entry, instance).create_wayland_surface(&create_info, None)
        }
        (display, window) => {
            return Err(EngineError::Surface(format!(
                "unsupported window/display handle pair: {:?} / {:?}",
                window, display
            )))
        }
    };

    surface.map_err(EngineError::vulkan("vkCreate*SurfaceKHR"))
}

/// Pick the swapchain extent. The sentinel `u32::MAX` means the surface
/// follows the swapchain, so the window's drawable size is used, clamped to
/// what the device reports.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    drawable: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: drawable.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width.max(capabilities.min_image_extent.width),
        ),
        height: drawable.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height.max(capabilities.min_image_extent.height),
        ),
    }
}

pub fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1280, 720),
            ..Default::default()
        };

        assert_eq!(choose_extent(&capabilities, extent(1920, 1080)), extent(1280, 720));
    }

    #[test]
    fn sentinel_extent_clamps_drawable_size() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(u32::MAX, u32::MAX),
            min_image_extent: extent(640, 480),
            max_image_extent: extent(1920, 1080),
            ..Default::default()
        };

        assert_eq!(choose_extent(&capabilities, extent(4000, 200)), extent(1920, 480));
    }

    #[test]
    fn minimized_drawable_passes_through_as_zero() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(0, 0),
            min_image_extent: extent(0, 0),
            max_image_extent: extent(0, 0),
            ..Default::default()
        };

        assert!(is_zero(choose_extent(&capabilities, extent(800, 600))));
        assert!(is_zero(extent(800, 0)));
        assert!(!is_zero(extent(1, 1)));
    }

    #[test]
    fn unknown_display_kinds_are_rejected() {
        let display = RawDisplayHandle::Web(raw_window_handle::WebDisplayHandle::new());
        assert!(matches!(required_extensions(display), Err(EngineError::Surface(_))));
    }

    #[test]
    fn wayland_needs_surface_and_wayland_extensions() {
        let mut dummy = 0u8;
        let ptr = std::ptr::NonNull::from(&mut dummy).cast();
        let display = RawDisplayHandle::Wayland(raw_window_handle::WaylandDisplayHandle::new(ptr));

        let extensions = required_extensions(display).unwrap();
        assert_eq!(
            extensions,
            vec![
                ash::extensions::khr::Surface::name(),
                ash::extensions::khr::WaylandSurface::name()
            ]
        );
    }
}

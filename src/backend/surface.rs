// Presentation surface
//
// The window's Vulkan surface plus the capability queries the swapchain
// negotiation reads on every (re)build.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use winit::raw_window_handle_05::{HasRawDisplayHandle, HasRawWindowHandle};
use winit::window::Window;

use super::swapchain::SurfaceSupport;
use super::VulkanInstance;

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::extensions::khr::Surface,
    _instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(instance: Arc<VulkanInstance>, window: &Window) -> Result<Self> {
        let handle = unsafe {
            ash_window::create_surface(
                &instance.entry,
                &instance.instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        let loader = ash::extensions::khr::Surface::new(&instance.entry, &instance.instance);

        Ok(Self {
            handle,
            loader,
            _instance: instance,
        })
    }

    pub fn supports_presentation(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> Result<bool> {
        unsafe {
            self.loader
                .get_physical_device_surface_support(physical_device, queue_family, self.handle)
        }
        .with_context(|| format!("Failed to query presentation support for family {}", queue_family))
    }

    /// Fresh capability, format and present-mode facts for this surface.
    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
                .context("Failed to query surface capabilities")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)
                .context("Failed to query surface formats")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
                .context("Failed to query surface present modes")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

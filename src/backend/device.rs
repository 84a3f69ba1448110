// Vulkan instance and device
//
// Responsibilities:
// - Instance creation (surface extensions + optional validation)
// - Physical device selection (first enumerated, no ranking)
// - Queue family assignment (graphics + presentation)
// - Logical device + queue retrieval

use anyhow::{Context, Result};
use ash::{vk, Entry};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::RendererError;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loader entry, instance and the optional debug messenger.
pub struct VulkanInstance {
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub instance: ash::Instance,
    pub entry: Entry,
}

impl VulkanInstance {
    /// Create the instance with the surface extensions the windowing system
    /// requires. Validation is dropped with a warning if the layer is missing.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        surface_extensions: &[*const c_char],
    ) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let enable_validation = enable_validation && {
            let available = validation_layer_available(&entry);
            if !available {
                log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
            }
            available
        };

        let app_name_cstr = CString::new(app_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let mut extensions = surface_extensions.to_vec();
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
            .context("Failed to create Vulkan instance")?;

        let debug_utils = if enable_validation {
            match setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Arc::new(Self {
            debug_utils,
            instance,
            entry,
        }))
    }

    /// The first enumerated physical device. There's no preference heuristic.
    pub fn first_physical_device(&self) -> Result<vk::PhysicalDevice> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        devices
            .first()
            .copied()
            .ok_or_else(|| RendererError::NoPhysicalDevice.into())
    }

    pub fn queue_families(&self, physical_device: vk::PhysicalDevice) -> Vec<vk::QueueFamilyProperties> {
        unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

fn validation_layer_available(entry: &Entry) -> bool {
    #[allow(unused_unsafe)]
    let layers = unsafe { entry.enumerate_instance_layer_properties() };
    layers
        .map(|layers| {
            layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == VALIDATION_LAYER
            })
        })
        .unwrap_or(false)
}

fn setup_debug_messenger(
    entry: &Entry,
    instance: &ash::Instance,
) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
    let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .context("Failed to create debug messenger")?;

    Ok((debug_utils, messenger))
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[{:?}] {}", message_type, message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[{:?}] {}", message_type, message),
        _ => log::debug!("[{:?}] {}", message_type, message),
    }

    vk::FALSE
}

// =============================================================================
// QUEUE SELECTION
// =============================================================================

/// Queue family indices found while scanning a physical device.
/// Either may be missing until [`QueueAssignment::resolve`] proves otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    pub graphics: Option<u32>,
    pub presentation: Option<u32>,
}

impl QueueAssignment {
    /// Record the first family with graphics support and, independently, the
    /// first family that can present. Presentation support is asked per family.
    pub fn find<F>(families: &[vk::QueueFamilyProperties], mut supports_presentation: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut assignment = Self::default();

        for (index, family) in families.iter().enumerate() {
            let index = index as u32;

            if assignment.graphics.is_none() && family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                assignment.graphics = Some(index);
            }
            if assignment.presentation.is_none() && supports_presentation(index)? {
                assignment.presentation = Some(index);
            }
        }

        Ok(assignment)
    }

    pub fn resolve(&self) -> Result<QueueFamilies, RendererError> {
        let graphics = self.graphics.ok_or(RendererError::MissingGraphicsQueue)?;
        let presentation = self
            .presentation
            .ok_or(RendererError::MissingPresentationQueue)?;
        Ok(QueueFamilies {
            graphics,
            presentation,
        })
    }
}

/// Resolved queue families. Immutable once the device exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub presentation: u32,
}

impl QueueFamilies {
    /// Graphics and presentation on one family (headless use).
    pub fn single(family: u32) -> Self {
        Self {
            graphics: family,
            presentation: family,
        }
    }

    pub fn is_shared(&self) -> bool {
        self.graphics == self.presentation
    }

    /// Distinct family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        if self.is_shared() {
            vec![self.graphics]
        } else {
            vec![self.graphics, self.presentation]
        }
    }
}

// =============================================================================
// LOGICAL DEVICE
// =============================================================================

/// Logical device with its queues. Shared read-only by every component.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: Arc<VulkanInstance>,

    pub graphics_queue: vk::Queue,
    pub presentation_queue: vk::Queue,
    pub queue_families: QueueFamilies,

    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanDevice {
    pub fn new(
        instance: Arc<VulkanInstance>,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilies,
        extensions: &[&CStr],
    ) -> Result<Arc<Self>> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extension_names: Vec<_> = extensions.iter().map(|name| name.as_ptr()).collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_names)
            .enabled_features(&features);

        // Nothing below may touch the device unless creation succeeded.
        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &create_info, None)
        }
        .context("Failed to create logical device")?;

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let presentation_queue = unsafe { device.get_device_queue(queue_families.presentation, 0) };

        let properties = unsafe {
            instance
                .instance
                .get_physical_device_properties(physical_device)
        };
        let memory_properties = unsafe {
            instance
                .instance
                .get_physical_device_memory_properties(physical_device)
        };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics={} presentation={}",
            queue_families.graphics,
            queue_families.presentation
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            graphics_queue,
            presentation_queue,
            queue_families,
            memory_properties,
        }))
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");
        let _ = self.wait_idle();
        unsafe { self.device.destroy_device(None) };
    }
}

// Fatal renderer conditions
//
// Startup failures that mean the environment can't run the renderer at all.
// They travel inside anyhow::Error so callers can downcast and inspect them.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RendererError {
    #[error("No Vulkan-capable GPU found")]
    NoPhysicalDevice,

    #[error("Could not find a queue family with graphics support")]
    MissingGraphicsQueue,

    #[error("Could not find a queue family that can present to the surface")]
    MissingPresentationQueue,

    #[error("No memory type matches mask {type_bits:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("Swapchain returned {count} images but only {capacity} are supported")]
    SwapchainImageOverflow { count: usize, capacity: usize },
}

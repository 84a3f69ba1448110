// Backend module - Vulkan layer
//
// Design: thin owning wrappers around ash handles, destroyed through Drop in
// reverse order of creation (children hold an Arc to their parent).

pub mod buffer;
pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use command::CommandPool;
pub use device::{QueueAssignment, QueueFamilies, VulkanDevice, VulkanInstance};
pub use error::RendererError;
pub use surface::Surface;
pub use swapchain::SwapchainManager;

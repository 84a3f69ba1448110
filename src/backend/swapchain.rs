// Swapchain - Window presentation
//
// Owns everything whose validity is tied to the window size: the swapchain,
// one image view and one framebuffer per image, and the pipeline built for
// the negotiated color format. A generation is created and destroyed as a
// whole; rebuild waits for the device, tears down in reverse order and
// builds again against the current framebuffer size.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline::GraphicsPipeline;
use super::shader::ShaderCode;
use super::{RendererError, Surface, VulkanDevice};
use crate::window::PresentationWindow;

/// Upper bound on swapchain images this renderer will manage.
pub const MAX_SWAPCHAIN_IMAGES: usize = 10;

/// Surface facts queried fresh for every build.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Negotiated configuration of one swapchain generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SwapchainConfig {
    pub fn negotiate(
        support: &SurfaceSupport,
        framebuffer_size: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self, RendererError> {
        Ok(Self {
            surface_format: choose_surface_format(&support.formats)?,
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            extent: choose_extent(&support.capabilities, framebuffer_size),
            image_count: choose_image_count(&support.capabilities),
        })
    }
}

/// A fixed current extent wins; the `u32::MAX` sentinel means the window
/// decides, clamped per axis to the surface limits.
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, framebuffer_size: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: framebuffer_size.width.clamp(min.width, max.width),
        height: framebuffer_size.height.clamp(min.height, max.height),
    }
}

/// BGRA8 sRGB if offered, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR, RendererError> {
    formats
        .iter()
        .find(|f| f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first())
        .copied()
        .ok_or(RendererError::NoSurfaceFormat)
}

/// The preferred mode if supported, otherwise FIFO (always available).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

pub fn check_image_capacity(count: usize) -> Result<(), RendererError> {
    if count > MAX_SWAPCHAIN_IMAGES {
        return Err(RendererError::SwapchainImageOverflow {
            count,
            capacity: MAX_SWAPCHAIN_IMAGES,
        });
    }
    Ok(())
}

/// Concurrent across both families when they differ, exclusive otherwise.
pub fn image_sharing(families: &super::QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Block on window events until the framebuffer has a drawable size.
/// Returns `None` if the window is closed while waiting.
pub fn wait_for_drawable_size<W>(window: &mut W) -> Option<vk::Extent2D>
where
    W: PresentationWindow + ?Sized,
{
    loop {
        let (width, height) = window.framebuffer_size();
        if width > 0 && height > 0 {
            return Some(vk::Extent2D { width, height });
        }
        if window.close_requested() {
            return None;
        }
        log::debug!("Framebuffer is {}x{}, waiting for events", width, height);
        window.wait_events();
    }
}

/// Stall until the window is drawable, then run `recreate` with its size.
/// `recreate` is skipped entirely if the window closes first.
fn rebuild_when_drawable<W, F>(window: &mut W, recreate: F) -> Result<bool>
where
    W: PresentationWindow + ?Sized,
    F: FnOnce(vk::Extent2D) -> Result<()>,
{
    let Some(size) = wait_for_drawable_size(window) else {
        return Ok(false);
    };
    recreate(size)?;
    Ok(true)
}

// =============================================================================
// ONE GENERATION
// =============================================================================

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub config: SwapchainConfig,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        config: SwapchainConfig,
        render_pass: vk::RenderPass,
    ) -> Result<Self> {
        let swapchain_loader = ash::extensions::khr::Swapchain::new(&device.instance.instance, &device.device);
        let (sharing_mode, queue_family_indices) = image_sharing(&device.queue_families);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Partially built generations are released by Drop
        let mut this = Self {
            swapchain,
            swapchain_loader,
            config,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            device,
        };

        let images = unsafe { this.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;
        check_image_capacity(images.len())?;
        this.images = images;

        this.image_views.reserve_exact(this.images.len());
        for &image in &this.images {
            let view = create_image_view(&this.device, image, config.surface_format.format)?;
            this.image_views.push(view);
        }

        this.framebuffers.reserve_exact(this.image_views.len());
        for &view in &this.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(config.extent.width)
                .height(config.extent.height)
                .layers(1);

            let framebuffer = unsafe { this.device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")?;
            this.framebuffers.push(framebuffer);
        }

        Ok(this)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Reverse of creation: framebuffers, views, then the swapchain
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

fn create_image_view(device: &VulkanDevice, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&create_info, None) }.context("Failed to create image view")
}

// =============================================================================
// LIFECYCLE MANAGER
// =============================================================================

pub struct SwapchainManager {
    // Field order matters for Drop: framebuffers reference the render pass,
    // and the swapchain must go before the surface.
    swapchain: Option<Swapchain>,
    pipeline: Option<GraphicsPipeline>,
    surface: Arc<Surface>,
    device: Arc<VulkanDevice>,
    shaders: ShaderCode,
    preferred_present_mode: vk::PresentModeKHR,
    generation: u64,
}

impl SwapchainManager {
    pub fn new(
        device: Arc<VulkanDevice>,
        surface: Arc<Surface>,
        shaders: ShaderCode,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Self {
        Self {
            swapchain: None,
            pipeline: None,
            surface,
            device,
            shaders,
            preferred_present_mode,
            generation: 0,
        }
    }

    /// Negotiate a configuration for `framebuffer_size` and create the
    /// swapchain, views and framebuffers, plus the pipeline if the color
    /// format is new.
    pub fn build(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        anyhow::ensure!(self.swapchain.is_none(), "Swapchain built twice without teardown");

        let support = self.surface.query_support(self.device.physical_device)?;
        let config = SwapchainConfig::negotiate(&support, framebuffer_size, self.preferred_present_mode)?;

        let format = config.surface_format.format;
        if self.pipeline.as_ref().map(|p| p.format) != Some(format) {
            self.pipeline = None;
            self.pipeline = Some(GraphicsPipeline::new(self.device.clone(), format, &self.shaders)?);
        }
        let render_pass = self.pipeline()?.render_pass;

        let swapchain = Swapchain::new(
            self.device.clone(),
            &self.surface,
            &support.capabilities,
            config,
            render_pass,
        )?;

        self.generation += 1;
        log::info!(
            "Swapchain #{}: {}x{} {:?}/{:?} {:?}, {} images",
            self.generation,
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.surface_format.color_space,
            config.present_mode,
            swapchain.image_count()
        );

        self.swapchain = Some(swapchain);
        Ok(())
    }

    /// Wait for a drawable window size, drain the device, tear down the
    /// current generation and build a new one. Returns `false` without
    /// touching anything if the window closed while minimized.
    pub fn rebuild<W>(&mut self, window: &mut W) -> Result<bool>
    where
        W: PresentationWindow + ?Sized,
    {
        rebuild_when_drawable(window, |size| {
            self.device.wait_idle()?;
            self.teardown();
            self.build(size)
        })
    }

    /// Release exactly what the last build produced. The pipeline is kept.
    pub fn teardown(&mut self) {
        self.swapchain = None;
    }

    pub fn current(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not built")
    }

    pub fn pipeline(&self) -> Result<&GraphicsPipeline> {
        self.pipeline.as_ref().context("Pipeline not built")
    }
}

// Renderer - the owning aggregate
//
// Holds every GPU object the quad needs, grouped by lifetime:
//   device level     instance, surface, device, command pool, static buffers
//   generation level swapchain manager (swapchain, views, framebuffers, pipeline)
//   frame level      one FrameSlot per frame in flight
//
// and performs the per-frame GPU work the FrameLoop sequences.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use std::sync::Arc;
use winit::raw_window_handle_05::HasRawDisplayHandle;

use crate::backend::buffer::{self, DeviceBuffer};
use crate::backend::frame::{AcquireOutcome, FrameBackend, PresentOutcome, MAX_FRAMES_IN_FLIGHT};
use crate::backend::geometry::{QUAD_INDICES, QUAD_VERTICES};
use crate::backend::shader::ShaderCode;
use crate::backend::swapchain::wait_for_drawable_size;
use crate::backend::sync::FrameSlot;
use crate::backend::{
    CommandPool, QueueAssignment, Surface, SwapchainManager, VulkanDevice, VulkanInstance,
};
use crate::config::Config;
use crate::window::{AppWindow, PresentationWindow};

/// IMPORTANT: Field order matters for Drop! Frame slots and buffers go
/// first, then the swapchain generation, then the pool, device and surface.
pub struct Renderer {
    frames: Vec<FrameSlot>,
    vertex_buffer: DeviceBuffer,
    index_buffer: DeviceBuffer,
    index_count: u32,
    swapchain: SwapchainManager,
    _command_pool: CommandPool,
    device: Arc<VulkanDevice>,
    _surface: Arc<Surface>,
    clear_color: [f32; 4],
}

impl Renderer {
    /// Bring up everything needed to draw, in dependency order. Any failure
    /// here is fatal for the process.
    pub fn new(config: &Config, window: &mut AppWindow) -> Result<Self> {
        log::info!("Initializing Vulkan...");

        let shaders = ShaderCode::load(&config.shaders.vertex, &config.shaders.fragment)?;

        let surface_extensions =
            ash_window::enumerate_required_extensions(window.window().raw_display_handle())
                .context("Failed to query required surface extensions")?;
        let instance = VulkanInstance::new(
            &config.window.title,
            config.validation_enabled(),
            surface_extensions,
        )?;
        let surface = Arc::new(Surface::new(instance.clone(), window.window())?);

        // Device & queue selection
        let physical_device = instance.first_physical_device()?;
        let queue_families = QueueAssignment::find(&instance.queue_families(physical_device), |family| {
            surface.supports_presentation(physical_device, family)
        })?
        .resolve()?;

        let device = VulkanDevice::new(
            instance,
            physical_device,
            queue_families,
            &[ash::extensions::khr::Swapchain::name()],
        )?;
        let command_pool = CommandPool::new(device.clone())?;

        let mut swapchain = SwapchainManager::new(
            device.clone(),
            surface.clone(),
            shaders,
            config.present_mode(),
        );
        let size = wait_for_drawable_size(window).context("Window closed before the first frame")?;
        swapchain.build(size)?;

        let vertex_buffer = buffer::upload(
            &device,
            &command_pool,
            bytemuck::cast_slice(&QUAD_VERTICES),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        let index_buffer = buffer::upload(
            &device,
            &command_pool,
            bytemuck::cast_slice(&QUAD_INDICES),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        let frames = command_pool
            .allocate(MAX_FRAMES_IN_FLIGHT as u32)?
            .into_iter()
            .map(|cmd| FrameSlot::new(device.clone(), cmd))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            frames,
            vertex_buffer,
            index_buffer,
            index_count: QUAD_INDICES.len() as u32,
            swapchain,
            _command_pool: command_pool,
            device,
            _surface: surface,
            clear_color: config.graphics.clear_color,
        })
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl FrameBackend for Renderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].wait()
    }

    fn acquire_image(&mut self, slot: usize) -> AcquireOutcome {
        let Ok(swapchain) = self.swapchain.current() else {
            return AcquireOutcome::OutOfDate;
        };

        unsafe {
            swapchain.swapchain_loader.acquire_next_image(
                swapchain.swapchain,
                u64::MAX,
                self.frames[slot].image_available,
                vk::Fence::null(),
            )
        }
        .into()
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].reset()
    }

    fn record(&mut self, slot: usize, image_index: u32) -> VkResult<()> {
        // Acquire succeeded, so a generation and its pipeline exist
        let swapchain = self.swapchain.current().map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        let pipeline = self.swapchain.pipeline().map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let extent = swapchain.config.extent;

        let device = &self.device.device;
        let cmd = self.frames[slot].command_buffer;

        unsafe {
            device.begin_command_buffer(cmd, &vk::CommandBufferBeginInfo::builder())?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            }];
            let render_pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(pipeline.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);

            // Dynamic state, follows the current extent
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                }],
            );

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd)
        }
    }

    fn submit(&mut self, slot: usize) -> VkResult<()> {
        let frame = &self.frames[slot];

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight_fence,
            )
        }
    }

    fn rearm_slot(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].rearm()
    }

    fn present(&mut self, slot: usize, image_index: u32) -> PresentOutcome {
        let Ok(swapchain) = self.swapchain.current() else {
            return PresentOutcome::OutOfDate;
        };

        let wait_semaphores = [self.frames[slot].render_finished];
        let swapchains = [swapchain.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe {
            swapchain
                .swapchain_loader
                .queue_present(self.device.presentation_queue, &present_info)
        }
        .into()
    }

    fn rebuild_swapchain(&mut self, window: &mut dyn PresentationWindow) -> Result<()> {
        if !self.swapchain.rebuild(window)? {
            log::info!("Window closed while minimized, skipping rebuild");
        }
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be destroyed while the GPU still uses it
        let _ = self.device.wait_idle();
    }
}

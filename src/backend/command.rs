// Command pool on the graphics family
//
// Per-frame buffers are allocated once and reset individually; one-shot
// buffers are allocated, submitted, waited on and freed in one call.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_families.graphics)
            // RESET: frame slots reset their own buffer every cycle
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self { pool, device })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Record `record` into a throwaway buffer, submit it on the graphics
    /// queue and block until the queue is idle.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self.allocate(1)?[0];

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

            unsafe {
                device
                    .begin_command_buffer(cmd, &begin_info)
                    .context("Failed to begin one-shot command buffer")?;
                record(device, cmd);
                device
                    .end_command_buffer(cmd)
                    .context("Failed to end one-shot command buffer")?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                device
                    .queue_submit(self.device.graphics_queue, &[submit_info.build()], vk::Fence::null())
                    .context("Failed to submit one-shot command buffer")?;
                device
                    .queue_wait_idle(self.device.graphics_queue)
                    .context("Failed to wait for graphics queue")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Also frees every buffer allocated from it
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}

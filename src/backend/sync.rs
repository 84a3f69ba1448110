// Synchronization primitives
//
// One FrameSlot per frame in flight: a command buffer, the acquire and
// render semaphores, and the fence the CPU waits on before reusing any of it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSlot {
    /// `command_buffer` comes from a pool with individual reset enabled.
    pub fn new(device: Arc<VulkanDevice>, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let image_available = create_semaphore(&device)?;
        let render_finished = match create_semaphore(&device) {
            Ok(semaphore) => semaphore,
            Err(e) => {
                unsafe { device.device.destroy_semaphore(image_available, None) };
                return Err(e);
            }
        };
        let in_flight_fence = match create_signaled_fence(&device) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            command_buffer,
            image_available,
            render_finished,
            in_flight_fence,
            device,
        })
    }

    /// Block until the GPU has finished the last submission from this slot.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed to wait for in-flight fence")
    }

    /// Unsignal the fence and clear the command buffer for a new recording.
    /// Only valid once an image has been acquired for this slot.
    pub fn reset(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .reset_fences(&[self.in_flight_fence])
                .context("Failed to reset in-flight fence")?;
            self.device
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
        }
        Ok(())
    }

    /// Restore the slot after its frame was abandoned between reset and
    /// submit: the fence would never be signaled and the acquire semaphore
    /// may hold a signal nobody waits on, so both are replaced. On error the
    /// slot still owns valid handles.
    pub fn rearm(&mut self) -> Result<()> {
        self.device.wait_idle()?;

        unsafe {
            self.device
                .device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")?;

        let device = &self.device;
        let (fence, image_available) = create_pair(
            create_signaled_fence(device)?,
            || create_semaphore(device),
            |fence| unsafe { device.device.destroy_fence(fence, None) },
        )?;

        let old_fence = std::mem::replace(&mut self.in_flight_fence, fence);
        let old_semaphore = std::mem::replace(&mut self.image_available, image_available);
        unsafe {
            device.device.destroy_fence(old_fence, None);
            device.device.destroy_semaphore(old_semaphore, None);
        }
        Ok(())
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // The command buffer is freed with its pool
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Create `second` once `first` exists, handing `first` to `discard` if
/// that fails.
fn create_pair<A, B>(
    first: A,
    second: impl FnOnce() -> Result<B>,
    discard: impl FnOnce(A),
) -> Result<(A, B)> {
    match second() {
        Ok(second) => Ok((first, second)),
        Err(e) => {
            discard(first);
            Err(e)
        }
    }
}

fn create_semaphore(device: &VulkanDevice) -> Result<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.device.create_semaphore(&semaphore_info, None) }.context("Failed to create semaphore")
}

fn create_signaled_fence(device: &VulkanDevice) -> Result<vk::Fence> {
    // Start signaled so the first wait on every slot returns immediately
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
    unsafe { device.device.create_fence(&fence_info, None) }.context("Failed to create fence")
}

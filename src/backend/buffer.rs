// Buffer utilities and the staging uploader
//
// Static geometry is written into a host-visible staging buffer, copied into
// device-local memory with a one-shot command, and the staging buffer is
// dropped before `upload` returns.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::{CommandPool, RendererError, VulkanDevice};

/// A buffer and the memory bound to it. Both are released on drop.
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    device: Arc<VulkanDevice>,
}

impl DeviceBuffer {
    /// Create a buffer with specified usage, backed by the first memory type
    /// that carries every requested property.
    pub fn new(
        device: Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        // From here on Drop cleans up whatever has been created
        let mut this = Self {
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            device,
        };

        let requirements = unsafe { this.device.device.get_buffer_memory_requirements(buffer) };
        let memory_type_index = find_memory_type(
            &this.device.memory_properties,
            requirements.memory_type_bits,
            memory_properties,
        )?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        this.memory = unsafe { this.device.device.allocate_memory(&alloc_info, None) }
            .context("Failed to allocate buffer memory")?;

        unsafe { this.device.device.bind_buffer_memory(buffer, this.memory, 0) }
            .context("Failed to bind buffer memory")?;

        Ok(this)
    }

    /// Map, copy, unmap. The memory must be host-visible and coherent.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        anyhow::ensure!(
            data.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes exceeds buffer size {}",
            data.len(),
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;
            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Map, copy out, unmap. The memory must be host-visible and coherent.
    pub fn read(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.size as usize];
        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *const u8;
            ptr.copy_to_nonoverlapping(bytes.as_mut_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(bytes)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            if self.memory != vk::DeviceMemory::null() {
                self.device.device.free_memory(self.memory, None);
            }
        }
    }
}

/// Move `data` into a device-local buffer with `usage | TRANSFER_DST`.
/// Blocks until the copy has finished; no host-visible copy survives.
pub fn upload(
    device: &Arc<VulkanDevice>,
    command_pool: &CommandPool,
    data: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<DeviceBuffer> {
    let size = data.len() as vk::DeviceSize;

    let staging = DeviceBuffer::new(
        device.clone(),
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.write(data)?;

    let resident = DeviceBuffer::new(
        device.clone(),
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    copy_buffer(command_pool, &staging, &resident, size)?;

    log::debug!("Uploaded {} bytes ({:?})", size, usage);
    Ok(resident)
}

/// Copy a device-local buffer back into host memory. The source needs
/// TRANSFER_SRC usage.
pub fn read_back(device: &Arc<VulkanDevice>, command_pool: &CommandPool, source: &DeviceBuffer) -> Result<Vec<u8>> {
    let readback = DeviceBuffer::new(
        device.clone(),
        source.size,
        vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    copy_buffer(command_pool, source, &readback, source.size)?;
    readback.read()
}

fn copy_buffer(
    command_pool: &CommandPool,
    src: &DeviceBuffer,
    dst: &DeviceBuffer,
    size: vk::DeviceSize,
) -> Result<()> {
    command_pool.one_shot(|device, cmd| {
        let region = vk::BufferCopy::builder().size(size).build();
        unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
    })
}

/// First memory type allowed by `type_filter` whose flags are a superset of
/// `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32, RendererError> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let allowed = (type_filter & (1 << i)) != 0;
            allowed
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(RendererError::NoSuitableMemoryType {
            type_bits: type_filter,
            properties,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::geometry::{QUAD_INDICES, QUAD_VERTICES};
    use crate::backend::{QueueFamilies, VulkanInstance};

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
        vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw() | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
    );

    #[test]
    fn picks_first_type_with_superset_of_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            HOST | vk::MemoryPropertyFlags::HOST_CACHED,
            HOST,
        ]);

        assert_eq!(find_memory_type(&props, 0b1111, HOST), Ok(2));
        assert_eq!(
            find_memory_type(&props, 0b1111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Ok(0)
        );
    }

    #[test]
    fn respects_the_resource_type_mask() {
        let props = memory_properties(&[HOST, HOST]);

        assert_eq!(find_memory_type(&props, 0b10, HOST), Ok(1));
    }

    #[test]
    fn no_matching_type_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        assert_eq!(
            find_memory_type(&props, 0b1, HOST),
            Err(RendererError::NoSuitableMemoryType {
                type_bits: 0b1,
                properties: HOST,
            })
        );
    }

    #[test]
    fn ignores_types_beyond_the_reported_count() {
        let mut props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        props.memory_types[1].property_flags = HOST;

        assert!(find_memory_type(&props, 0b11, HOST).is_err());
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn uploaded_geometry_reads_back_identically() -> Result<()> {
        let instance = VulkanInstance::new("upload-test", false, &[])?;
        let physical_device = instance.first_physical_device()?;
        let graphics = instance
            .queue_families(physical_device)
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .context("no graphics family")? as u32;
        let device = VulkanDevice::new(instance, physical_device, QueueFamilies::single(graphics), &[])?;
        let pool = CommandPool::new(device.clone())?;

        let usage = vk::BufferUsageFlags::TRANSFER_SRC;
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        let index_bytes: &[u8] = bytemuck::cast_slice(&QUAD_INDICES);

        let vertices = upload(&device, &pool, vertex_bytes, usage | vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let indices = upload(&device, &pool, index_bytes, usage | vk::BufferUsageFlags::INDEX_BUFFER)?;

        assert_eq!(read_back(&device, &pool, &vertices)?, vertex_bytes);
        assert_eq!(read_back(&device, &pool, &indices)?, index_bytes);
        Ok(())
    }
}

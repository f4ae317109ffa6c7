//! GPU buffers.
//!
//! - **[`Buffer::new_private`]**: device-local memory the host never touches. Vertex and index
//!   buffers of streamed meshes live here.
//! - **[`Buffer::new_staging`]**: persistently mapped host memory, written once by a worker and
//!   read by a transfer-queue copy. Staging buffers must stay alive until the copy reading them
//!   has completed on the GPU.

use std::{fmt::Debug, ptr::NonNull};

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice,
    backend::{BufferDesc, MemoryLocation},
    utils::AsVkHandle,
};

/// A buffer bound to its own memory allocation.
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    mapped: Option<NonNull<u8>>,
}
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    fn new(
        device: Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> VkResult<Self> {
        assert!(size > 0, "Buffers must not be empty");
        let allocation = device.create_buffer(&BufferDesc {
            size,
            usage,
            location,
        })?;
        Ok(Self {
            device,
            buffer: allocation.buffer,
            size,
            usage,
            mapped: allocation.mapped,
        })
    }

    /// Creates a device-local buffer.
    pub fn new_private(
        device: Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new(device, size, usage, MemoryLocation::DeviceLocal)
    }

    /// Creates a host-visible buffer used as a copy source. `TRANSFER_SRC` is always added to
    /// `usage`.
    pub fn new_staging(
        device: Device,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> VkResult<Self> {
        Self::new(
            device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::Staging,
        )
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn is_host_visible(&self) -> bool {
        self.mapped.is_some()
    }

    /// Returns the mapped memory, or `None` for device-local buffers.
    pub fn as_slice_mut(&mut self) -> Option<&mut [u8]> {
        self.mapped
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size as usize) })
    }

    /// Copies `data` into mapped memory at `offset` and flushes the written range.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not host visible or the write is out of bounds.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> VkResult<()> {
        let slice = self
            .as_slice_mut()
            .expect("Buffer::write requires a staging buffer");
        let start = offset as usize;
        slice[start..start + data.len()].copy_from_slice(data);
        self.flush(offset, data.len() as vk::DeviceSize)
    }

    /// Makes host writes in the given range visible to the device.
    pub fn flush(&self, offset: vk::DeviceSize, size: vk::DeviceSize) -> VkResult<()> {
        self.device.flush_buffer(self.buffer, offset, size)
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.buffer)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("host_visible", &self.mapped.is_some())
            .finish()
    }
}

impl HasDevice for Buffer {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_staging_write() {
        let mock = Arc::new(MockBackend::new());
        let device = Device::new(mock.clone());
        let mut staging = Buffer::new_staging(device, 8, vk::BufferUsageFlags::empty()).unwrap();
        assert!(staging.usage().contains(vk::BufferUsageFlags::TRANSFER_SRC));
        staging.write(4, &[9, 8, 7, 6]).unwrap();
        assert_eq!(
            mock.buffer_contents(staging.vk_handle()).unwrap(),
            vec![0, 0, 0, 0, 9, 8, 7, 6]
        );
        assert_eq!(
            mock.buffer_location(staging.vk_handle()),
            Some(MemoryLocation::Staging)
        );
    }

    #[test]
    fn test_private_buffer_is_not_mapped() {
        let mock = Arc::new(MockBackend::new());
        let device = Device::new(mock.clone());
        let mut buffer =
            Buffer::new_private(device, 16, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        assert!(buffer.as_slice_mut().is_none());
        assert_eq!(mock.live_buffers(), 1);
        drop(buffer);
        assert_eq!(mock.live_buffers(), 0);
    }

    #[test]
    #[should_panic(expected = "must not be empty")]
    fn test_empty_buffer_panics() {
        let device = Device::new(Arc::new(MockBackend::new()));
        let _ = Buffer::new_private(device, 0, vk::BufferUsageFlags::VERTEX_BUFFER);
    }
}

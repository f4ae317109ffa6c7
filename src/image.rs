//! Device-local 2D images.

use ash::{prelude::VkResult, vk};
use glam::{UVec2, UVec3};

use crate::{Device, HasDevice, backend::ImageDesc, utils::AsVkHandle};

/// Number of mip levels in a full chain for a `width` by `height` image.
///
/// ```
/// assert_eq!(scoria::image::mip_level_count_for(256, 256), 9);
/// assert_eq!(scoria::image::mip_level_count_for(300, 17), 9);
/// assert_eq!(scoria::image::mip_level_count_for(1, 1), 1);
/// ```
pub fn mip_level_count_for(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Extent of mip `level` for an image whose base extent is `extent`. Never smaller than 1x1.
pub fn mip_extent(extent: UVec2, level: u32) -> UVec2 {
    UVec2::new((extent.x >> level).max(1), (extent.y >> level).max(1))
}

/// A 2D, single-layer, color image backed by device-local memory.
pub struct Image {
    device: Device,
    handle: vk::Image,
    extent: UVec3,
    mip_level_count: u32,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
}

impl Image {
    /// Create an image that is accessible exclusively from the GPU.
    pub fn new_private(device: Device, desc: &ImageDesc) -> VkResult<Self> {
        assert!(desc.mip_levels > 0, "Images need at least one mip level");
        let handle = device.create_image(desc)?;
        Ok(Self {
            device,
            handle,
            extent: UVec3::new(desc.extent.width, desc.extent.height, desc.extent.depth),
            mip_level_count: desc.mip_levels,
            format: desc.format,
            usage: desc.usage,
        })
    }

    pub fn extent(&self) -> UVec3 {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    /// Subresource range covering `level_count` mips starting at `base_mip_level`.
    pub fn subresource_range(&self, base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
        debug_assert!(base_mip_level + level_count <= self.mip_level_count);
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    pub fn subresource_layers(&self, mip_level: u32) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    /// Extent of mip `level` in texels.
    pub fn level_extent(&self, level: u32) -> UVec2 {
        mip_extent(self.extent.truncate(), level)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("extent", &self.extent)
            .field("format", &self.format)
            .field("mip_level_count", &self.mip_level_count)
            .finish()
    }
}

impl HasDevice for Image {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Image {
    type Handle = vk::Image;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        self.device.destroy_image(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_mip_extent_clamps() {
        let base = UVec2::new(256, 64);
        assert_eq!(mip_extent(base, 0), UVec2::new(256, 64));
        assert_eq!(mip_extent(base, 3), UVec2::new(32, 8));
        assert_eq!(mip_extent(base, 8), UVec2::new(1, 1));
        assert_eq!(mip_level_count_for(256, 64), 9);
    }

    #[test]
    fn test_image_lifecycle() {
        let mock = Arc::new(MockBackend::new());
        let device = Device::new(mock.clone());
        let image = Image::new_private(
            device,
            &ImageDesc {
                extent: vk::Extent3D {
                    width: 64,
                    height: 32,
                    depth: 1,
                },
                format: vk::Format::R8G8B8A8_SRGB,
                mip_levels: 7,
                usage: vk::ImageUsageFlags::SAMPLED,
            },
        )
        .unwrap();
        assert_eq!(image.level_extent(6), UVec2::new(1, 1));
        assert_eq!(image.subresource_range(2, 5).level_count, 5);
        assert_eq!(mock.live_images(), 1);
        drop(image);
        assert_eq!(mock.live_images(), 0);
    }
}

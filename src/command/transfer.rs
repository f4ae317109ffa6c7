//! Buffer and image transfer commands.
//!
//! This module extends [`CommandEncoder`] with copies and blits. Each command first emits the
//! barriers queued so far, so a transition queued right before a copy always lands before it.
use ash::vk;

use crate::{buffer::Buffer, image::Image, utils::AsVkHandle};

use super::CommandEncoder;

impl CommandEncoder<'_> {
    /// Copies `size` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
    pub fn copy_buffer_region(
        &mut self,
        src: &Buffer,
        src_offset: vk::DeviceSize,
        dst: &Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        debug_assert!(!self.inside_renderpass());
        assert!(
            src_offset + size <= src.size() && dst_offset + size <= dst.size(),
            "Buffer copy out of bounds"
        );
        self.emit_barriers();
        self.buffer.pool.device.cmd_copy_buffer(
            self.buffer.buffer,
            src.vk_handle(),
            dst.vk_handle(),
            vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        );
    }

    /// Copies tightly packed texels from `buffer` into mip `level` of `image`, which must be in
    /// `TRANSFER_DST_OPTIMAL` layout.
    pub fn copy_buffer_to_image(
        &mut self,
        buffer: &Buffer,
        buffer_offset: vk::DeviceSize,
        image: &Image,
        level: u32,
    ) {
        debug_assert!(!self.inside_renderpass());
        let extent = image.level_extent(level);
        self.emit_barriers();
        self.buffer.pool.device.cmd_copy_buffer_to_image(
            self.buffer.buffer,
            buffer.vk_handle(),
            image.vk_handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::BufferImageCopy {
                buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: image.subresource_layers(level),
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: extent.x,
                    height: extent.y,
                    depth: 1,
                },
            },
        );
    }

    /// Blits mip `src_level` of `image` into mip `dst_level`, scaling the whole level. Filters
    /// linearly when the format supports it and falls back to nearest otherwise.
    ///
    /// The source level must be in `TRANSFER_SRC_OPTIMAL` and the destination level in
    /// `TRANSFER_DST_OPTIMAL`.
    pub fn blit_mip(&mut self, image: &Image, src_level: u32, dst_level: u32) {
        debug_assert!(!self.inside_renderpass());
        assert_ne!(src_level, dst_level, "Blit source and destination overlap");
        let src_extent = image.level_extent(src_level);
        let dst_extent = image.level_extent(dst_level);
        let filter = if self
            .buffer
            .pool
            .device
            .format_features(image.format())
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };
        self.emit_barriers();
        self.buffer.pool.device.cmd_blit_image(
            self.buffer.buffer,
            image.vk_handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image.vk_handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageBlit {
                src_subresource: image.subresource_layers(src_level),
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_extent.x as i32,
                        y: src_extent.y as i32,
                        z: 1,
                    },
                ],
                dst_subresource: image.subresource_layers(dst_level),
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_extent.x as i32,
                        y: dst_extent.y as i32,
                        z: 1,
                    },
                ],
            },
            filter,
        );
    }
}

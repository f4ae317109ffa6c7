//! Streamed GPU resources.
//!
//! A [`Mesh`] or [`Texture`] is produced on a worker thread and handed to the render thread
//! through an [`Async`](crate::Async). By the time it becomes observable it is owned by the
//! graphics queue family and in its shader-readable state; the render thread may use it in any
//! later submission without further synchronization.

use ash::vk;
use glam::UVec2;

use crate::{buffer::Buffer, image::Image, utils::AsVkHandle};

/// Vertex and index buffers in device-local memory. Indices are `u32`.
#[derive(Debug)]
pub struct Mesh {
    pub(crate) vertex_buffer: Buffer,
    pub(crate) index_buffer: Buffer,
    pub(crate) vertex_count: u32,
    pub(crate) index_count: u32,
    pub(crate) vertex_stride: u32,
}

impl Mesh {
    pub fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Size of one vertex in bytes.
    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }
}

/// A sampled image with a full mip chain, or the null texture.
///
/// Textures that fail to load resolve to the null texture instead of an error. The null
/// texture reports a zero extent and owns no image; render code that cannot skip it can
/// substitute the fallback with [`or_fallback`](Self::or_fallback).
#[derive(Debug, Default)]
pub struct Texture {
    image: Option<Image>,
}

impl Texture {
    pub(crate) fn new(image: Image) -> Self {
        Self { image: Some(image) }
    }

    /// The texture that owns nothing.
    pub fn null() -> Self {
        Self { image: None }
    }

    pub fn is_null(&self) -> bool {
        self.image.is_none()
    }

    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    pub fn handle(&self) -> vk::Image {
        self.image
            .as_ref()
            .map_or(vk::Image::null(), |image| image.vk_handle())
    }

    /// Extent of mip 0. Zero for the null texture.
    pub fn extent(&self) -> UVec2 {
        self.image
            .as_ref()
            .map_or(UVec2::ZERO, |image| image.extent().truncate())
    }

    pub fn format(&self) -> vk::Format {
        self.image
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |image| image.format())
    }

    pub fn mip_level_count(&self) -> u32 {
        self.image.as_ref().map_or(0, |image| image.mip_level_count())
    }

    /// Returns `self`, or `fallback` if this is the null texture.
    pub fn or_fallback<'a>(&'a self, fallback: &'a Texture) -> &'a Texture {
        if self.is_null() { fallback } else { self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_texture() {
        let texture = Texture::null();
        assert!(texture.is_null());
        assert_eq!(texture.extent(), UVec2::ZERO);
        assert_eq!(texture.mip_level_count(), 0);
        assert_eq!(texture.handle(), vk::Image::null());
        let other = Texture::default();
        assert!(std::ptr::eq(texture.or_fallback(&other), &other));
    }
}

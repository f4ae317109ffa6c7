//! Texture decoding and uploads.
//!
//! Only mip 0 crosses queues. The transfer queue copies it and releases it; the graphics queue
//! acquires it and, when mips are requested, generates every other level by blitting from the
//! level above.

use std::path::Path;

use ash::{prelude::VkResult, vk};
use glam::UVec2;

use crate::{
    HasDevice,
    backend::ImageDesc,
    command::CommandEncoder,
    error::{Error, Result},
    image::{Image, mip_level_count_for},
    resource::Texture,
    tracking::{Access, ImageBarrier, TransferTarget},
    utils::AsVkHandle,
};

use super::UploadContext;

/// Tightly packed texels of mip 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub extent: UVec2,
    pub format: vk::Format,
    pub texels: Vec<u8>,
}

/// Size of one texel of `format`, for the formats textures can be decoded into.
pub fn texel_size(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_UNORM => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Bytes of a tightly packed `extent` image in `format`.
pub fn packed_size(format: vk::Format, extent: UVec2) -> Option<usize> {
    texel_size(format).map(|size| size * extent.x as usize * extent.y as usize)
}

/// Reads and decodes the image at `path`, converting it to `format`.
pub fn decode_file(path: &Path, format: vk::Format) -> Result<DecodedImage> {
    if texel_size(format).is_none() {
        return Err(Error::UnsupportedFormat(format));
    }
    let data = std::fs::read(path)?;
    let mut reader = image::ImageReader::new(std::io::Cursor::new(&data));
    match path
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
    {
        "png" => reader.set_format(image::ImageFormat::Png),
        "jpg" | "jpeg" => reader.set_format(image::ImageFormat::Jpeg),
        "tif" | "tiff" => reader.set_format(image::ImageFormat::Tiff),
        _ => reader = reader.with_guessed_format()?,
    }
    convert(reader.decode()?, format)
}

/// Converts decoded pixels to the texel layout of `format`.
pub fn convert(image: image::DynamicImage, format: vk::Format) -> Result<DecodedImage> {
    let extent = UVec2::new(image.width(), image.height());
    let texels = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => image.into_luma8().into_raw(),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB => image.into_luma_alpha8().into_raw(),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => image.into_rgba8().into_raw(),
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => {
            let mut texels = image.into_rgba8().into_raw();
            for texel in texels.chunks_exact_mut(4) {
                texel.swap(0, 2);
            }
            texels
        }
        vk::Format::R16G16B16A16_UNORM => {
            bytemuck::cast_slice::<u16, u8>(&image.into_rgba16().into_raw()).to_vec()
        }
        vk::Format::R32G32B32A32_SFLOAT => {
            bytemuck::cast_slice::<f32, u8>(&image.into_rgba32f().into_raw()).to_vec()
        }
        other => return Err(Error::UnsupportedFormat(other)),
    };
    Ok(DecodedImage {
        extent,
        format,
        texels,
    })
}

/// Uploads `decoded` into a sampled image, blocking the calling worker until the graphics queue
/// owns it in `SHADER_READ_ONLY_OPTIMAL`.
///
/// With `generate_mips` the image gets a full mip chain; otherwise it has a single level.
pub fn upload_texture(
    ctx: &UploadContext,
    worker: usize,
    decoded: &DecodedImage,
    generate_mips: bool,
) -> VkResult<Texture> {
    let UVec2 {
        x: width,
        y: height,
    } = decoded.extent;
    assert!(width > 0 && height > 0, "Textures must not be empty");
    debug_assert_eq!(
        Some(decoded.texels.len()),
        packed_size(decoded.format, decoded.extent)
    );
    let mip_levels = if generate_mips {
        mip_level_count_for(width, height)
    } else {
        1
    };
    tracing::info!(
        width,
        height,
        format = ?decoded.format,
        mip_levels,
        "Loading texture"
    );

    let staging = ctx.stage(&[&decoded.texels])?;
    let image = Image::new_private(
        ctx.device().clone(),
        &ImageDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format: decoded.format,
            mip_levels,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::TRANSFER_SRC,
        },
    )?;

    // Mip 0 leaves the transfer queue in the layout its first graphics-side use needs.
    let (handoff_layout, first_use) = if mip_levels > 1 {
        (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, Access::BLIT_SRC)
    } else {
        (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SAMPLED_READ,
        )
    };
    let transfers = [ctx.queue_transfer(
        TransferTarget::Image {
            image: image.vk_handle(),
            range: image.subresource_range(0, 1),
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: handoff_layout,
        },
        Access::COPY_WRITE,
        first_use,
    )];

    let release = ctx.submit_release(worker, staging, &transfers, |encoder, staging| {
        encoder.image_barrier(ImageBarrier {
            image: image.vk_handle(),
            range: image.subresource_range(0, 1),
            src: Access::NONE,
            dst: Access::COPY_WRITE,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_queue_family: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
        });
        encoder.copy_buffer_to_image(staging, 0, &image, 0);
    })?;
    let acquire = ctx.submit_acquire(worker, release, &transfers, |encoder| {
        record_mip_chain(encoder, &image);
    })?;
    ctx.finalize(worker, acquire)?;

    Ok(Texture::new(image))
}

/// Generates levels `1..` of `image` from level 0, which must be in `TRANSFER_SRC_OPTIMAL`.
/// Every level ends in `SHADER_READ_ONLY_OPTIMAL`.
///
/// Levels are filtered linearly only for formats with `SAMPLED_IMAGE_FILTER_LINEAR`; see
/// [`CommandEncoder::blit_mip`]. Does nothing for single-level images.
pub fn record_mip_chain(encoder: &mut CommandEncoder, image: &Image) {
    let levels = image.mip_level_count();
    let transition = |level: u32,
                      src: Access,
                      dst: Access,
                      old_layout: vk::ImageLayout,
                      new_layout: vk::ImageLayout| ImageBarrier {
        image: image.vk_handle(),
        range: image.subresource_range(level, 1),
        src,
        dst,
        old_layout,
        new_layout,
        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
    };
    for level in 1..levels {
        encoder.image_barrier(transition(
            level,
            Access::NONE,
            Access::BLIT_DST,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ));
        encoder.blit_mip(image, level - 1, level);
        encoder.image_barrier(transition(
            level - 1,
            Access::BLIT_SRC,
            Access::FRAGMENT_SAMPLED_READ,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ));
        if level + 1 == levels {
            encoder.image_barrier(transition(
                level,
                Access::BLIT_DST,
                Access::FRAGMENT_SAMPLED_READ,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ));
        } else {
            encoder.image_barrier(transition(
                level,
                Access::BLIT_DST,
                Access::BLIT_SRC,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ));
        }
    }
}

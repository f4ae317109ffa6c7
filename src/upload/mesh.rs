//! Mesh uploads.
//!
//! Vertices and indices share one staging buffer, vertices first. Both device buffers are
//! released together and acquired at the vertex input stage.

use ash::{prelude::VkResult, vk};

use crate::{
    HasDevice,
    buffer::Buffer,
    resource::Mesh,
    tracking::{Access, TransferTarget},
    utils::AsVkHandle,
};

use super::UploadContext;

/// Uploads `vertices`, `vertex_stride` bytes per vertex, and `indices` into device-local
/// buffers, blocking the calling worker until the graphics queue owns them.
///
/// # Panics
///
/// Panics if either input is empty or `vertices` is not a whole number of vertices.
pub fn upload_mesh(
    ctx: &UploadContext,
    worker: usize,
    vertices: &[u8],
    vertex_stride: u32,
    indices: &[u32],
) -> VkResult<Mesh> {
    assert!(
        !vertices.is_empty() && !indices.is_empty(),
        "Meshes need at least one vertex and one index"
    );
    assert!(
        vertex_stride > 0 && vertices.len() % vertex_stride as usize == 0,
        "Vertex data is not a multiple of the vertex stride"
    );
    let index_bytes: &[u8] = bytemuck::cast_slice(indices);
    let vertex_size = vertices.len() as vk::DeviceSize;
    let index_size = index_bytes.len() as vk::DeviceSize;

    let staging = ctx.stage(&[vertices, index_bytes])?;
    let vertex_buffer = Buffer::new_private(
        ctx.device().clone(),
        vertex_size,
        vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
    )?;
    let index_buffer = Buffer::new_private(
        ctx.device().clone(),
        index_size,
        vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
    )?;

    let transfers = [
        ctx.queue_transfer(
            TransferTarget::Buffer {
                buffer: vertex_buffer.vk_handle(),
                size: vertex_size,
            },
            Access::COPY_WRITE,
            Access::VERTEX_READ,
        ),
        ctx.queue_transfer(
            TransferTarget::Buffer {
                buffer: index_buffer.vk_handle(),
                size: index_size,
            },
            Access::COPY_WRITE,
            Access::INDEX_READ,
        ),
    ];
    let release = ctx.submit_release(worker, staging, &transfers, |encoder, staging| {
        encoder.copy_buffer_region(staging, 0, &vertex_buffer, 0, vertex_size);
        encoder.copy_buffer_region(staging, vertex_size, &index_buffer, 0, index_size);
    })?;
    let acquire = ctx.submit_acquire(worker, release, &transfers, |_| {})?;
    ctx.finalize(worker, acquire)?;

    Ok(Mesh {
        vertex_buffer,
        index_buffer,
        vertex_count: (vertices.len() / vertex_stride as usize) as u32,
        index_count: indices.len() as u32,
        vertex_stride,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{backend::mock::MockBackend, upload::tests::context};

    #[test]
    fn test_triangle_sizes_and_contents() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let positions: [f32; 9] = [0.0, 0.5, 0.0, -0.5, -0.5, 0.0, 0.5, -0.5, 0.0];
        let mesh = upload_mesh(&ctx, 1, bytemuck::cast_slice(&positions), 12, &[0, 1, 2]).unwrap();

        assert_eq!(mesh.vertex_buffer().size(), 36);
        assert_eq!(mesh.index_buffer().size(), 12);
        assert_eq!(mesh.vertex_count(), 3);
        assert_eq!(mesh.index_count(), 3);
        assert_eq!(
            mock.buffer_contents(mesh.vertex_buffer().vk_handle()).unwrap(),
            bytemuck::cast_slice::<f32, u8>(&positions)
        );
        assert_eq!(
            mock.buffer_contents(mesh.index_buffer().vk_handle()).unwrap(),
            bytemuck::cast_slice::<u32, u8>(&[0, 1, 2])
        );
        // Only the two device buffers survive the upload.
        assert_eq!(mock.live_buffers(), 2);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_acquire_waits_at_vertex_input() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let _mesh = upload_mesh(&ctx, 0, &[0; 24], 8, &[0, 1, 2]).unwrap();
        let acquire = mock
            .submissions()
            .into_iter()
            .find(|s| s.family_index == 0)
            .unwrap();
        assert_eq!(
            acquire.wait.unwrap().stage,
            vk::PipelineStageFlags2::VERTEX_INPUT | vk::PipelineStageFlags2::INDEX_INPUT
        );
    }

    #[test]
    #[should_panic(expected = "at least one vertex")]
    fn test_empty_mesh_panics() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let _ = upload_mesh(&ctx, 0, &[], 12, &[0]);
    }
}

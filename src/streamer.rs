//! Resource requests from the render loop.
//!
//! A [`Streamer`] turns requests into upload tasks on a [`Scheduler`] and hands back an
//! [`Async`] right away. Requests never block the calling thread, and there is no ordering
//! between them: independent uploads run on different workers in parallel and only contend for
//! the short submit calls on the shared queues.
//!
//! Content errors do not fail a request. An empty mesh yields an invalid [`Async`]; a texture
//! that cannot be read or decoded resolves to [`Texture::null`]. Both are logged.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use ash::vk;
use event_listener::{Event, Listener};

use crate::{
    Async,
    config::RendererConfig,
    error::{self, Error},
    resource::{Mesh, Texture},
    scheduler::{Priority, Scheduler},
    upload::{
        UploadContext,
        mesh::upload_mesh,
        texture::{DecodedImage, convert, decode_file, upload_texture},
    },
};

#[derive(Default)]
struct PendingUploads {
    count: AtomicUsize,
    idle: Event,
}

/// Decrements the pending count when a task ends, even by panicking.
struct PendingGuard(Arc<PendingUploads>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify(usize::MAX);
        }
    }
}

/// Issues uploads on a worker pool.
///
/// Dropping a `Streamer` waits for every upload it started; requests cannot be cancelled.
pub struct Streamer {
    ctx: Arc<UploadContext>,
    scheduler: Arc<dyn Scheduler>,
    priority: Priority,
    generate_mips: bool,
    fallback: Texture,
    pending: Arc<PendingUploads>,
}

impl Streamer {
    /// Creates the streamer and uploads the fallback texture, blocking until it is resident.
    ///
    /// # Panics
    ///
    /// Panics if the scheduler and the upload queues disagree on the number of workers.
    pub fn new(
        ctx: Arc<UploadContext>,
        scheduler: Arc<dyn Scheduler>,
        config: &RendererConfig,
    ) -> Self {
        assert_eq!(
            ctx.worker_count(),
            scheduler.worker_count(),
            "Queues need exactly one transient command pool per scheduler worker"
        );
        let mut streamer = Self {
            ctx,
            scheduler,
            priority: config.upload_priority,
            generate_mips: config.generate_mipmaps,
            fallback: Texture::null(),
            pending: Arc::default(),
        };
        let color = config.fallback_color;
        streamer.fallback = streamer
            .spawn(Priority::High, move |ctx, worker| {
                let decoded = DecodedImage {
                    extent: glam::UVec2::ONE,
                    format: vk::Format::R8G8B8A8_UNORM,
                    texels: color.to_vec(),
                };
                upload_texture(ctx, worker, &decoded, false).unwrap_or_else(|e| error::fatal(e))
            })
            .into_inner();
        streamer
    }

    /// Uploads a mesh. `V` is one vertex; its size becomes the vertex stride.
    ///
    /// Returns an invalid handle, and logs, when either slice is empty.
    pub fn request_mesh<V: bytemuck::Pod>(&self, vertices: &[V], indices: &[u32]) -> Async<Mesh> {
        if vertices.is_empty() || indices.is_empty() {
            tracing::error!(
                vertices = vertices.len(),
                indices = indices.len(),
                error = %Error::EmptyMesh,
                "Mesh request rejected"
            );
            return Async::default();
        }
        let vertex_bytes: Vec<u8> = bytemuck::cast_slice(vertices).to_vec();
        let indices = indices.to_vec();
        let stride = std::mem::size_of::<V>() as u32;
        self.spawn(self.priority, move |ctx, worker| {
            upload_mesh(ctx, worker, &vertex_bytes, stride, &indices)
                .unwrap_or_else(|e| error::fatal(e))
        })
    }

    /// Loads the image at `path`, converts it to `format` and uploads it with a full mip chain
    /// when mipmaps are enabled.
    ///
    /// The handle is always valid. A missing, unreadable or unsupported file resolves to the null
    /// texture and logs an error.
    pub fn request_texture(&self, path: impl AsRef<Path>, format: vk::Format) -> Async<Texture> {
        let path: PathBuf = path.as_ref().to_owned();
        let generate_mips = self.generate_mips;
        self.spawn(self.priority, move |ctx, worker| {
            let decoded = match decode_file(&path, format) {
                Ok(decoded) => decoded,
                Err(error) => {
                    tracing::error!(path = %path.display(), %error, "Failed to load texture");
                    return Texture::null();
                }
            };
            upload_decoded(ctx, worker, &decoded, generate_mips, &path.display().to_string())
        })
    }

    /// Uploads already decoded RGBA8 pixels, converted to `format`.
    ///
    /// Pixel data that does not match the dimensions resolves to the null texture.
    pub fn request_texture_from_pixels(
        &self,
        width: u32,
        height: u32,
        rgba8: Vec<u8>,
        format: vk::Format,
    ) -> Async<Texture> {
        let generate_mips = self.generate_mips;
        self.spawn(self.priority, move |ctx, worker| {
            let Some(pixels) = image::RgbaImage::from_raw(width, height, rgba8) else {
                tracing::error!(width, height, "Pixel data does not match texture dimensions");
                return Texture::null();
            };
            match convert(pixels.into(), format) {
                Ok(decoded) => upload_decoded(ctx, worker, &decoded, generate_mips, "<memory>"),
                Err(error) => {
                    tracing::error!(width, height, %error, "Failed to convert texture");
                    Texture::null()
                }
            }
        })
    }

    /// The 1x1 texture substituted for textures that failed to load.
    pub fn fallback_texture(&self) -> &Texture {
        &self.fallback
    }

    /// Requests issued whose upload has not finished yet.
    pub fn pending_uploads(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    pub fn upload_context(&self) -> &Arc<UploadContext> {
        &self.ctx
    }

    /// Blocks until every upload issued so far has finished.
    pub fn wait_idle(&self) {
        loop {
            if self.pending_uploads() == 0 {
                return;
            }
            let listener = self.pending.idle.listen();
            if self.pending_uploads() == 0 {
                return;
            }
            listener.wait();
        }
    }

    fn spawn<T: Send + Sync + 'static>(
        &self,
        priority: Priority,
        task: impl FnOnce(&UploadContext, usize) -> T + Send + 'static,
    ) -> Async<T> {
        let (handle, promise) = Async::pending();
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(self.pending.clone());
        let ctx = self.ctx.clone();
        // Tasks must not keep the scheduler alive, or its last owner could be one of its own
        // worker threads.
        let scheduler: Weak<dyn Scheduler> = Arc::downgrade(&self.scheduler);
        self.scheduler.schedule(
            Box::new(move || {
                let _guard = guard;
                let worker = scheduler
                    .upgrade()
                    .and_then(|scheduler| scheduler.current_worker())
                    .unwrap_or_else(|| panic!("Upload task ran outside of its scheduler"));
                promise.fulfill(task(&ctx, worker));
            }),
            priority,
        );
        handle
    }
}

fn upload_decoded(
    ctx: &UploadContext,
    worker: usize,
    decoded: &DecodedImage,
    generate_mips: bool,
    source: &str,
) -> Texture {
    if decoded.extent.min_element() == 0 {
        tracing::error!(source, "Texture has no texels");
        return Texture::null();
    }
    upload_texture(ctx, worker, decoded, generate_mips).unwrap_or_else(|e| error::fatal(e))
}

impl Drop for Streamer {
    fn drop(&mut self) {
        let pending = self.pending_uploads();
        if pending > 0 {
            tracing::debug!(pending, "Waiting for uploads before shutting down");
        }
        self.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use glam::UVec2;

    use super::*;
    use crate::{
        Device, Queue,
        backend::mock::MockBackend,
        scheduler::WorkerPool,
        test_utils,
        utils::AsVkHandle,
    };

    const WORKERS: usize = 4;

    fn streamer(mock: &Arc<MockBackend>, config: &RendererConfig) -> Streamer {
        let device = Device::new(mock.clone());
        let graphics = Arc::new(Queue::new(device.clone(), 0, 0, WORKERS).unwrap());
        let transfer = Arc::new(Queue::new(device, 1, 0, WORKERS).unwrap());
        let ctx = Arc::new(UploadContext::new(transfer, graphics, u64::MAX));
        Streamer::new(ctx, Arc::new(WorkerPool::new(WORKERS)), config)
    }

    fn poll_until_ready<T>(handle: &Async<T>) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut ticks = 0;
        while !handle.is_ready() {
            assert!(Instant::now() < deadline, "upload did not finish in time");
            std::thread::sleep(Duration::from_millis(1));
            ticks += 1;
        }
        ticks
    }

    #[test]
    fn test_triangle_mesh() {
        let mock = Arc::new(MockBackend::new());
        let streamer = streamer(&mock, &RendererConfig::default());
        let vertices: [[f32; 3]; 3] = [[0.0, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0]];
        let mesh = streamer.request_mesh(&vertices, &[0, 1, 2]);
        assert!(mesh.valid());
        poll_until_ready(&mesh);
        assert_eq!(mesh.vertex_buffer().size(), 36);
        assert_eq!(mesh.index_buffer().size(), 12);
        assert_eq!(mesh.vertex_stride(), 12);
        assert!(std::ptr::eq(mesh.get(), &*mesh));
        drop(streamer);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_missing_texture_resolves_to_null() {
        test_utils::init_logging();
        let mock = Arc::new(MockBackend::new());
        let streamer = streamer(&mock, &RendererConfig::default());
        let texture = streamer.request_texture("assets/missing-albedo-7f3a.png", vk::Format::R8G8B8A8_SRGB);
        assert!(texture.valid());
        poll_until_ready(&texture);
        assert!(texture.is_null());
        assert_eq!(texture.extent(), UVec2::ZERO);
        assert_eq!(texture.or_fallback(streamer.fallback_texture()).extent(), UVec2::ONE);
        let logs = test_utils::captured_logs();
        assert!(
            logs.lines()
                .any(|line| line.contains("ERROR") && line.contains("missing-albedo-7f3a.png")),
            "{logs}"
        );
    }

    #[test]
    fn test_hundred_concurrent_meshes() {
        let mock = Arc::new(MockBackend::new());
        let streamer = streamer(&mock, &RendererConfig::default());
        let meshes: Vec<Async<Mesh>> = (0..100u32)
            .map(|i| {
                let vertices = vec![[i as f32; 3]; i as usize + 1];
                streamer.request_mesh(&vertices, &[0, 0, 0])
            })
            .collect();
        for (i, mesh) in meshes.iter().enumerate() {
            assert_eq!(mesh.vertex_count(), i as u32 + 1);
            assert_eq!(
                mock.buffer_contents(mesh.vertex_buffer().vk_handle()).unwrap(),
                bytemuck::cast_slice::<[f32; 3], u8>(&vec![[i as f32; 3]; i + 1])
            );
        }
        assert!(meshes.iter().all(|mesh| mesh.is_ready()));
        streamer.wait_idle();
        assert_eq!(streamer.pending_uploads(), 0);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_empty_mesh_is_invalid() {
        let mock = Arc::new(MockBackend::new());
        let streamer = streamer(&mock, &RendererConfig::default());
        let mesh = streamer.request_mesh::<f32>(&[], &[0, 1, 2]);
        assert!(!mesh.valid());
        assert_eq!(streamer.pending_uploads(), 0);
    }

    #[test]
    fn test_fallback_texture_color() {
        let mock = Arc::new(MockBackend::new());
        let config = RendererConfig {
            fallback_color: [1, 2, 3, 4],
            ..Default::default()
        };
        let streamer = streamer(&mock, &config);
        let fallback = streamer.fallback_texture();
        assert_eq!(fallback.extent(), UVec2::ONE);
        assert_eq!(mock.image_contents(fallback.handle()).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_texture_from_pixels_with_mips() {
        let mock = Arc::new(MockBackend::new());
        let streamer = streamer(&mock, &RendererConfig::default());
        let texture = streamer.request_texture_from_pixels(
            16,
            8,
            vec![200; 16 * 8 * 4],
            vk::Format::R8G8B8A8_SRGB,
        );
        assert_eq!(texture.extent(), UVec2::new(16, 8));
        assert_eq!(texture.mip_level_count(), 5);
        assert_eq!(texture.format(), vk::Format::R8G8B8A8_SRGB);

        let mismatched =
            streamer.request_texture_from_pixels(4, 4, vec![0; 3], vk::Format::R8G8B8A8_SRGB);
        assert!(mismatched.is_null());
        drop(streamer);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }
}

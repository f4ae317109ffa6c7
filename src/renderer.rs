//! The render-loop façade.
//!
//! [`Renderer`] wires the queues, the worker pool, the [`Streamer`] and the [`FramePager`]
//! together and exposes the four calls a render loop needs:
//!
//! ```
//! # use std::sync::Arc;
//! # use scoria::{Device, Renderer, RendererConfig, ash::vk, backend::mock::MockBackend};
//! # use scoria::renderer::RendererCreateInfo;
//! # let mock = Arc::new(MockBackend::new());
//! # let swapchain = mock.create_swapchain(3);
//! # let device = Device::new(mock);
//! let mut renderer = Renderer::new(device, RendererCreateInfo {
//!     graphics_family: 0,
//!     transfer_family: 1,
//!     swapchain,
//!     extent: vk::Extent2D { width: 640, height: 480 },
//!     config: RendererConfig { worker_threads: Some(2), ..Default::default() },
//! }).unwrap();
//!
//! let mesh = renderer.request_mesh(&[[0.0f32; 3]; 3], &[0, 1, 2]);
//! loop {
//!     let frame = renderer.acquire_frame().unwrap();
//!     let ready = mesh.is_ready();
//!     renderer.present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT).unwrap();
//!     if ready {
//!         break;
//!     }
//! }
//! ```

use std::{path::Path, sync::Arc};

use ash::vk;

use crate::{
    Async, Device, HasDevice, Queue,
    command::CommandEncoder,
    config::RendererConfig,
    error::Result,
    frame::{AcquiredFrame, FramePager, PresentOutcome, SwapchainTarget},
    resource::{Mesh, Texture},
    scheduler::{Scheduler, WorkerPool},
    streamer::Streamer,
    upload::UploadContext,
};

pub struct RendererCreateInfo {
    /// Queue family used for rendering, mip generation and presentation.
    pub graphics_family: u32,
    /// Queue family uploads copy on. May equal `graphics_family`.
    pub transfer_family: u32,
    /// Swapchain created by the windowing layer.
    pub swapchain: vk::SwapchainKHR,
    pub extent: vk::Extent2D,
    pub config: RendererConfig,
}

/// Streaming and frame pacing over one device.
pub struct Renderer {
    // Field order is drop order: uploads finish, then frames, then the queues go.
    streamer: Streamer,
    pager: FramePager,
    graphics: Arc<Queue>,
    transfer: Arc<Queue>,
    config: RendererConfig,
}

impl HasDevice for Renderer {
    fn device(&self) -> &Device {
        self.graphics.device()
    }
}

impl Renderer {
    /// Creates a renderer with its own [`WorkerPool`] sized from the config.
    pub fn new(device: Device, info: RendererCreateInfo) -> Result<Self> {
        let scheduler = Arc::new(WorkerPool::from_config(&info.config));
        Self::with_scheduler(device, info, scheduler)
    }

    /// Creates a renderer that runs uploads on `scheduler`.
    pub fn with_scheduler(
        device: Device,
        info: RendererCreateInfo,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        let workers = scheduler.worker_count();
        let graphics = Arc::new(Queue::new(device.clone(), info.graphics_family, 0, workers)?);
        let transfer = if info.transfer_family == info.graphics_family {
            graphics.clone()
        } else {
            Arc::new(Queue::new(device.clone(), info.transfer_family, 0, workers)?)
        };
        tracing::info!(
            graphics_family = info.graphics_family,
            transfer_family = info.transfer_family,
            workers,
            frames_in_flight = info.config.frames_in_flight,
            "Creating renderer"
        );

        let ctx = Arc::new(UploadContext::new(
            transfer.clone(),
            graphics.clone(),
            info.config.fence_timeout_ns,
        ));
        let streamer = Streamer::new(ctx, scheduler, &info.config);
        let target = SwapchainTarget::new(&device, info.swapchain, info.extent)?;
        let pager = FramePager::new(graphics.clone(), target, &info.config)?;
        Ok(Self {
            streamer,
            pager,
            graphics,
            transfer,
            config: info.config,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn graphics_queue(&self) -> &Arc<Queue> {
        &self.graphics
    }

    pub fn transfer_queue(&self) -> &Arc<Queue> {
        &self.transfer
    }

    pub fn request_mesh<V: bytemuck::Pod>(&self, vertices: &[V], indices: &[u32]) -> Async<Mesh> {
        self.streamer.request_mesh(vertices, indices)
    }

    pub fn request_texture(&self, path: impl AsRef<Path>, format: vk::Format) -> Async<Texture> {
        self.streamer.request_texture(path, format)
    }

    pub fn request_texture_from_pixels(
        &self,
        width: u32,
        height: u32,
        rgba8: Vec<u8>,
        format: vk::Format,
    ) -> Async<Texture> {
        self.streamer
            .request_texture_from_pixels(width, height, rgba8, format)
    }

    pub fn fallback_texture(&self) -> &Texture {
        self.streamer.fallback_texture()
    }

    pub fn pending_uploads(&self) -> usize {
        self.streamer.pending_uploads()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.pager.frames_in_flight()
    }

    pub fn acquire_frame(&mut self) -> Result<AcquiredFrame> {
        self.pager.acquire_frame()
    }

    pub fn record<T>(
        &mut self,
        frame: &AcquiredFrame,
        callback: impl FnOnce(&mut CommandEncoder) -> T,
    ) -> T {
        self.pager.record(frame, callback)
    }

    pub fn present_frame(
        &mut self,
        frame: AcquiredFrame,
        wait_stage: vk::PipelineStageFlags2,
    ) -> Result<PresentOutcome> {
        self.pager.present_frame(frame, wait_stage)
    }

    /// Swaps in a new swapchain after a resize or an out-of-date report.
    pub fn recreate_swapchain(&mut self, swapchain: vk::SwapchainKHR, extent: vk::Extent2D) -> Result<()> {
        let target = SwapchainTarget::new(self.graphics.device(), swapchain, extent)?;
        self.pager.recreate_swapchain(target)
    }

    /// Waits for all uploads, then for both queues to go idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.streamer.wait_idle();
        self.transfer.wait_idle()?;
        self.graphics.wait_idle()?;
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            tracing::error!(%error, "Failed to drain the renderer before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::{
        backend::{
            RenderPassBegin,
            mock::{MockBackend, MockCommand},
        },
        utils::AsVkHandle,
    };
    use ash::vk::Handle;

    fn renderer(mock: &Arc<MockBackend>, transfer_family: u32) -> Renderer {
        let swapchain = mock.create_swapchain(3);
        Renderer::new(
            Device::new(mock.clone()),
            RendererCreateInfo {
                graphics_family: 0,
                transfer_family,
                swapchain,
                extent: vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                config: RendererConfig {
                    worker_threads: Some(3),
                    ..Default::default()
                },
            },
        )
        .unwrap()
    }

    /// Runs empty frames until `handle` is ready, as a render loop polling it would.
    fn frames_until_ready<T>(renderer: &mut Renderer, handle: &Async<T>) -> usize {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = 0;
        while !handle.is_ready() {
            assert!(Instant::now() < deadline, "upload did not finish in time");
            let frame = renderer.acquire_frame().unwrap();
            renderer
                .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .unwrap();
            frames += 1;
            std::thread::sleep(Duration::from_millis(1));
        }
        frames
    }

    #[test]
    fn test_streamed_mesh_is_drawn() {
        let mock = Arc::new(MockBackend::new());
        let mut renderer = renderer(&mock, 1);
        let mesh = renderer.request_mesh(&[[1.0f32, 2.0, 3.0]; 4], &[0, 1, 2, 2, 3, 0]);
        frames_until_ready(&mut renderer, &mesh);

        let frame = renderer.acquire_frame().unwrap();
        renderer.record(&frame, |encoder| {
            let mut pass = encoder.begin_render_pass(&RenderPassBegin {
                render_pass: vk::RenderPass::from_raw(10),
                framebuffer: vk::Framebuffer::from_raw(11),
                render_area: vk::Rect2D::default(),
                clear_values: &[],
            });
            pass.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, vk::Pipeline::from_raw(12));
            pass.draw_mesh(&mesh);
            pass.end();
        });
        let outcome = renderer
            .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap();
        assert_eq!(outcome, PresentOutcome::Presented);
        renderer.wait_idle().unwrap();

        let draw = mock
            .submissions()
            .into_iter()
            .rev()
            .find(|s| s.fence.is_some() && s.wait.is_some() && s.signal.is_some())
            .unwrap();
        assert!(draw.commands.iter().any(|c| matches!(
            c,
            MockCommand::BindVertexBuffer { buffer, .. } if *buffer == mesh.vertex_buffer().vk_handle()
        )));
        assert!(draw.commands.iter().any(|c| matches!(
            c,
            MockCommand::DrawIndexed { index_count: 6, instance_count: 1 }
        )));
        drop(renderer);
        drop(mesh);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_same_family_renderer() {
        let mock = Arc::new(MockBackend::with_queue_families(vec![
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER,
        ]));
        let mut renderer = renderer(&mock, 0);
        assert!(Arc::ptr_eq(renderer.graphics_queue(), renderer.transfer_queue()));
        let texture = renderer.request_texture_from_pixels(
            4,
            4,
            vec![9; 64],
            vk::Format::R8G8B8A8_UNORM,
        );
        frames_until_ready(&mut renderer, &texture);
        assert_eq!(texture.mip_level_count(), 3);
        drop(renderer);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_missing_texture_falls_back() {
        let mock = Arc::new(MockBackend::new());
        let renderer = renderer(&mock, 1);
        let texture = renderer.request_texture("nowhere/normal.png", vk::Format::R8G8B8A8_UNORM);
        let resolved = texture.or_fallback(renderer.fallback_texture());
        assert!(!resolved.is_null());
        assert_eq!(resolved.handle(), renderer.fallback_texture().handle());
    }

    #[test]
    fn test_resize() {
        let mock = Arc::new(MockBackend::new());
        let mut renderer = renderer(&mock, 1);
        let frame = renderer.acquire_frame().unwrap();
        renderer
            .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap();
        let swapchain = mock.create_swapchain(2);
        renderer
            .recreate_swapchain(
                swapchain,
                vk::Extent2D {
                    width: 640,
                    height: 360,
                },
            )
            .unwrap();
        for _ in 0..3 {
            let frame = renderer.acquire_frame().unwrap();
            assert!(frame.image_index() < 2);
            renderer
                .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .unwrap();
        }
        drop(renderer);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }
}

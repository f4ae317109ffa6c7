//! N-buffered frame pacing.
//!
//! The [`FramePager`] owns `N` frame slots, each with an image-acquired semaphore, a
//! render-done semaphore, an in-flight fence and a command buffer, and cycles through them:
//!
//! ```text
//! Idle --acquire_frame--> Acquired --present_frame--> Submitted --(fence wait)--> Idle
//! ```
//!
//! Before a slot is reused its fence is waited on, so the render thread can run at most `N`
//! frames ahead of the GPU. That wait, and the swapchain image acquisition right after it, are
//! the only places the render thread blocks per frame.

use std::sync::Arc;

use ash::vk;

use crate::{
    Device, HasDevice, Queue,
    command::{CommandBuffer, CommandBufferState, CommandEncoder},
    config::RendererConfig,
    error::{Error, Result},
    queue::SubmitInfo,
    sync::{Fence, Semaphore},
    utils::AsVkHandle,
};

/// A swapchain created by the windowing layer, and its presentable images.
#[derive(Debug, Clone)]
pub struct SwapchainTarget {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    extent: vk::Extent2D,
    /// Cleared once the swapchain reports `VK_ERROR_OUT_OF_DATE_KHR`. It must then be recreated
    /// before further use.
    is_valid: bool,
}

impl SwapchainTarget {
    pub fn new(device: &Device, handle: vk::SwapchainKHR, extent: vk::Extent2D) -> Result<Self> {
        let images = device.get_swapchain_images(handle)?;
        Ok(Self {
            handle,
            images,
            extent,
            is_valid: true,
        })
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Acquired,
    Submitted,
}

struct FrameSlot {
    image_acquired: Semaphore,
    render_done: Semaphore,
    /// Created signaled so the first acquire does not wait.
    in_flight: Fence,
    command_buffer: Option<CommandBuffer>,
    state: SlotState,
}

impl FrameSlot {
    fn command_buffer(&mut self) -> &mut CommandBuffer {
        self.command_buffer
            .as_mut()
            .expect("frame command buffers live as long as the pager")
    }
}

/// A frame between [`FramePager::acquire_frame`] and [`FramePager::present_frame`].
#[derive(Debug)]
#[must_use = "an acquired frame must be presented"]
pub struct AcquiredFrame {
    frame_index: usize,
    image_index: u32,
    target_image: vk::Image,
    suboptimal: bool,
}

impl AcquiredFrame {
    /// Frame slot, in `0..frames_in_flight`.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// The swapchain image to render into.
    pub fn target_image(&self) -> vk::Image {
        self.target_image
    }

    pub fn is_suboptimal(&self) -> bool {
        self.suboptimal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// The work was submitted but the swapchain must be recreated before the next frame.
    OutOfDate,
}

/// Rotates `N` frame slots over a graphics queue and a swapchain.
pub struct FramePager {
    queue: Arc<Queue>,
    swapchain: SwapchainTarget,
    slots: Box<[FrameSlot]>,
    frame_index: usize,
    fence_timeout: u64,
    acquire_timeout: u64,
}

impl HasDevice for FramePager {
    fn device(&self) -> &Device {
        self.queue.device()
    }
}

impl FramePager {
    /// Creates `config.frames_in_flight` slots. Command buffers come from the queue's persistent
    /// pool.
    pub fn new(queue: Arc<Queue>, swapchain: SwapchainTarget, config: &RendererConfig) -> Result<Self> {
        assert!(
            config.frames_in_flight > 0,
            "At least one frame must be allowed in flight"
        );
        assert!(
            queue.capabilities().contains(vk::QueueFlags::GRAPHICS),
            "Frames must be rendered on a graphics queue"
        );
        let device = queue.device().clone();
        let slots = (0..config.frames_in_flight)
            .map(|_| -> Result<FrameSlot> {
                let command_buffer = queue.persistent_pool().alloc()?;
                Ok(FrameSlot {
                    image_acquired: Semaphore::new(device.clone())?,
                    render_done: Semaphore::new(device.clone())?,
                    in_flight: Fence::new(device.clone(), true)?,
                    command_buffer: Some(command_buffer),
                    state: SlotState::Idle,
                })
            })
            .collect::<Result<Box<[_]>>>()?;
        tracing::debug!(
            frames_in_flight = slots.len(),
            swapchain_images = swapchain.images.len(),
            "Created frame pager"
        );
        Ok(Self {
            queue,
            swapchain,
            slots,
            frame_index: 0,
            fence_timeout: config.fence_timeout_ns,
            acquire_timeout: config.acquire_timeout_ns,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Slot the next [`acquire_frame`](Self::acquire_frame) will use.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn swapchain(&self) -> &SwapchainTarget {
        &self.swapchain
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Waits until the current slot's previous frame has finished on the GPU, acquires the next
    /// swapchain image, and starts recording the slot's command buffer.
    ///
    /// Returns [`Error::SwapchainOutOfDate`] when the swapchain must be recreated; the slot is
    /// left untouched and the call can be retried after
    /// [`recreate_swapchain`](Self::recreate_swapchain).
    pub fn acquire_frame(&mut self) -> Result<AcquiredFrame> {
        let frame_index = self.frame_index;
        let slot = &mut self.slots[frame_index];
        assert_ne!(
            slot.state,
            SlotState::Acquired,
            "Frame {frame_index} acquired twice without presenting"
        );
        if !self.swapchain.is_valid {
            return Err(Error::SwapchainOutOfDate);
        }

        slot.in_flight.wait(self.fence_timeout)?;
        if slot.state == SlotState::Submitted {
            let fence = &slot.in_flight;
            let command_buffer = slot
                .command_buffer
                .as_mut()
                .expect("frame command buffers live as long as the pager");
            command_buffer.block_until_completion(fence, 0)?;
            slot.state = SlotState::Idle;
        }

        let (image_index, suboptimal) = match self.queue.device().acquire_next_image(
            self.swapchain.handle,
            self.acquire_timeout,
            slot.image_acquired.vk_handle(),
        ) {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::info!(frame_index, "Swapchain out of date on acquire");
                self.swapchain.is_valid = false;
                return Err(Error::SwapchainOutOfDate);
            }
            Err(error) => return Err(error.into()),
        };

        {
            let mut pool = self.queue.persistent_pool();
            let command_buffer = slot.command_buffer();
            if command_buffer.state() != CommandBufferState::Initial {
                pool.reset(command_buffer)?;
            }
            pool.begin(command_buffer)?;
        }
        slot.state = SlotState::Acquired;
        tracing::trace!(frame_index, image_index, "Acquired frame");
        Ok(AcquiredFrame {
            frame_index,
            image_index,
            target_image: self.swapchain.images[image_index as usize],
            suboptimal,
        })
    }

    /// Records commands for `frame` into its slot's command buffer. May be called several times
    /// per frame.
    pub fn record<T>(
        &mut self,
        frame: &AcquiredFrame,
        callback: impl FnOnce(&mut CommandEncoder) -> T,
    ) -> T {
        let frame_index = self.check_frame(frame);
        let command_buffer = self.slots[frame_index].command_buffer();
        self.queue.persistent_pool().record(command_buffer, callback)
    }

    /// Submits `frame`, waiting on its swapchain image at `wait_stage`, and queues the image for
    /// presentation. Advances to the next slot whatever the outcome.
    ///
    /// If the frame cannot be submitted, the slot is returned to idle and the swapchain is
    /// marked out of date: the acquired image is never presented, so later acquires fail with
    /// [`Error::SwapchainOutOfDate`] until [`recreate_swapchain`](Self::recreate_swapchain).
    pub fn present_frame(
        &mut self,
        frame: AcquiredFrame,
        wait_stage: vk::PipelineStageFlags2,
    ) -> Result<PresentOutcome> {
        let frame_index = self.check_frame(&frame);
        let next_index = (frame_index + 1) % self.slots.len();
        let slot = &mut self.slots[frame_index];
        let command_buffer = slot
            .command_buffer
            .as_mut()
            .expect("frame command buffers live as long as the pager");
        let submitted = self
            .queue
            .persistent_pool()
            .finish(command_buffer)
            .and_then(|()| slot.in_flight.reset())
            .and_then(|()| {
                self.queue.submit(
                    command_buffer,
                    SubmitInfo {
                        wait: Some((&slot.image_acquired, wait_stage)),
                        signal: Some(&slot.render_done),
                        fence: Some(&slot.in_flight),
                    },
                )
            });
        if let Err(error) = submitted {
            tracing::error!(frame_index, %error, "Failed to submit frame");
            slot.state = SlotState::Idle;
            self.swapchain.is_valid = false;
            self.frame_index = next_index;
            // The old fence may be unsignaled and the old semaphore still holds the acquire.
            let device = self.queue.device().clone();
            slot.in_flight = Fence::new(device.clone(), true)?;
            slot.image_acquired = Semaphore::new(device)?;
            return Err(error.into());
        }
        slot.state = SlotState::Submitted;
        let presented = self
            .queue
            .present(self.swapchain.handle, frame.image_index, &slot.render_done);
        self.frame_index = next_index;

        match presented {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::info!(frame_index, "Swapchain out of date on present");
                self.swapchain.is_valid = false;
                Ok(PresentOutcome::OutOfDate)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Replaces the swapchain after a resize or an out-of-date report.
    ///
    /// Waits for the graphics queue to go idle first, so no frame still renders into the old
    /// images.
    pub fn recreate_swapchain(&mut self, swapchain: SwapchainTarget) -> Result<()> {
        assert!(
            self.slots.iter().all(|slot| slot.state != SlotState::Acquired),
            "Swapchain recreated while a frame is being recorded"
        );
        tracing::info!(
            width = swapchain.extent.width,
            height = swapchain.extent.height,
            images = swapchain.images.len(),
            "Recreating swapchain"
        );
        self.queue.wait_idle()?;
        self.swapchain = swapchain;
        Ok(())
    }

    /// Returns the slot of `frame` after checking it is the frame being recorded.
    fn check_frame(&self, frame: &AcquiredFrame) -> usize {
        assert_eq!(
            frame.frame_index, self.frame_index,
            "Frame {} used after the pager moved on",
            frame.frame_index
        );
        assert_eq!(
            self.slots[frame.frame_index].state,
            SlotState::Acquired,
            "Frame was not acquired"
        );
        frame.frame_index
    }
}

impl Drop for FramePager {
    fn drop(&mut self) {
        if let Err(error) = self.queue.wait_idle() {
            tracing::error!(?error, "Failed to drain the graphics queue");
        }
        let mut pool = self.queue.persistent_pool();
        for slot in self.slots.iter_mut() {
            let Some(mut command_buffer) = slot.command_buffer.take() else {
                continue;
            };
            if command_buffer.state() == CommandBufferState::Pending
                && let Err(error) = command_buffer.block_until_completion(&slot.in_flight, 0)
            {
                tracing::error!(?error, "Frame still pending at shutdown");
                continue;
            }
            pool.free(command_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::backend::{
        RenderPassBegin,
        mock::{MockBackend, MockCommand},
    };

    fn pager(frames_in_flight: usize) -> (Arc<MockBackend>, FramePager) {
        let mock = Arc::new(MockBackend::new());
        let device = Device::new(mock.clone());
        let queue = Arc::new(Queue::new(device.clone(), 0, 0, 1).unwrap());
        let swapchain = mock.create_swapchain(3);
        let target = SwapchainTarget::new(
            &device,
            swapchain,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        let config = RendererConfig {
            frames_in_flight,
            ..Default::default()
        };
        let pager = FramePager::new(queue, target, &config).unwrap();
        (mock, pager)
    }

    fn run_frame(pager: &mut FramePager) -> PresentOutcome {
        let frame = pager.acquire_frame().unwrap();
        pager
            .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap()
    }

    #[test]
    fn test_ten_thousand_frames_stay_double_buffered() {
        let (mock, mut pager) = pager(2);
        let queue = pager.queue().vk_handle();
        for frame in 0..10_000 {
            assert_eq!(pager.frame_index(), frame % 2);
            assert_eq!(run_frame(&mut pager), PresentOutcome::Presented);
            assert!(mock.pending_submissions(queue) <= 2);
        }
        assert_eq!(mock.max_pending_submissions(queue), 2);
        assert_eq!(mock.present_count(queue), 10_000);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_bound_follows_frames_in_flight() {
        let (mock, mut pager) = pager(3);
        for _ in 0..50 {
            run_frame(&mut pager);
        }
        let queue = pager.queue().vk_handle();
        assert_eq!(mock.max_pending_submissions(queue), 3);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_target_images_rotate() {
        let (_mock, mut pager) = pager(2);
        let images = pager.swapchain().images().to_vec();
        for expected in [0, 1, 2, 0] {
            let frame = pager.acquire_frame().unwrap();
            assert_eq!(frame.image_index(), expected);
            assert_eq!(frame.target_image(), images[expected as usize]);
            pager
                .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .unwrap();
        }
    }

    #[test]
    fn test_recorded_draws_are_submitted() {
        let (mock, mut pager) = pager(2);
        let frame = pager.acquire_frame().unwrap();
        pager.record(&frame, |encoder| {
            let pass = encoder.begin_render_pass(&RenderPassBegin {
                render_pass: vk::RenderPass::from_raw(900),
                framebuffer: vk::Framebuffer::from_raw(901),
                render_area: vk::Rect2D::default(),
                clear_values: &[],
            });
            pass.end();
        });
        pager
            .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap();
        let queue = pager.queue().clone();
        queue.wait_idle().unwrap();
        let submission = mock.submissions().pop().unwrap();
        assert!(matches!(
            submission.commands[0],
            MockCommand::BeginRenderPass { .. }
        ));
        assert_eq!(
            submission.wait.unwrap().stage,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
        assert!(submission.fence.is_some());
    }

    #[test]
    fn test_out_of_date_then_recreate() {
        let (mock, mut pager) = pager(2);
        run_frame(&mut pager);
        mock.invalidate_swapchain(pager.swapchain().handle());
        assert!(matches!(
            pager.acquire_frame(),
            Err(Error::SwapchainOutOfDate)
        ));
        assert!(!pager.swapchain().is_valid());
        // Retrying without recreating keeps failing without touching the GPU.
        assert!(matches!(
            pager.acquire_frame(),
            Err(Error::SwapchainOutOfDate)
        ));

        let device = pager.device().clone();
        let target = SwapchainTarget::new(
            &device,
            mock.create_swapchain(2),
            vk::Extent2D {
                width: 1024,
                height: 768,
            },
        )
        .unwrap();
        pager.recreate_swapchain(target).unwrap();
        for _ in 0..4 {
            assert_eq!(run_frame(&mut pager), PresentOutcome::Presented);
        }
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_failed_submit_leaves_pager_recoverable() {
        let (mock, mut pager) = pager(2);
        run_frame(&mut pager);
        let frame = pager.acquire_frame().unwrap();
        mock.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let result = pager.present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT);
        assert!(matches!(result, Err(Error::DeviceLost)));
        assert_eq!(pager.frame_index(), 0);
        assert!(!pager.swapchain().is_valid());
        assert!(matches!(
            pager.acquire_frame(),
            Err(Error::SwapchainOutOfDate)
        ));

        let device = pager.device().clone();
        let target = SwapchainTarget::new(
            &device,
            mock.create_swapchain(3),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        pager.recreate_swapchain(target).unwrap();
        for _ in 0..4 {
            assert_eq!(run_frame(&mut pager), PresentOutcome::Presented);
        }
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_out_of_date_on_present() {
        let (mock, mut pager) = pager(2);
        let frame = pager.acquire_frame().unwrap();
        mock.invalidate_swapchain(pager.swapchain().handle());
        let outcome = pager
            .present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .unwrap();
        assert_eq!(outcome, PresentOutcome::OutOfDate);
        assert_eq!(pager.frame_index(), 1);
        assert!(!pager.swapchain().is_valid());
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn test_double_acquire_panics() {
        let (_mock, mut pager) = pager(1);
        let _first = pager.acquire_frame().unwrap();
        let _second = pager.acquire_frame();
    }

    #[test]
    fn test_drop_frees_command_buffers() {
        let (mock, mut pager) = pager(2);
        run_frame(&mut pager);
        run_frame(&mut pager);
        drop(pager);
        assert_eq!(mock.live_command_buffers(), 0);
        assert_eq!(mock.live_fences(), 0);
        assert_eq!(mock.live_semaphores(), 0);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }
}

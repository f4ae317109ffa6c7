//! A host-side GPU simulation for tests.
//!
//! [`MockBackend`] behaves like a very lazy GPU: a submission does not run until something
//! forces it. A fence wait runs the submission that signals the fence, `queue_wait_idle` runs
//! everything on the queue, and running a submission first runs whatever signals the
//! semaphore it waits on. Submissions on one queue complete in submission order.
//!
//! Because nothing completes early, code that frees memory, resets a fence or reuses a command
//! buffer too soon is caught: the mock records a violation instead of silently tolerating it.
//! Buffer copies run against real host memory, so uploaded bytes can be inspected afterwards.
//!
//! ```
//! # use std::sync::Arc;
//! use scoria::{Device, backend::mock::MockBackend, sync::Fence};
//! let mock = Arc::new(MockBackend::new());
//! let device = Device::new(mock.clone());
//! let fence = Fence::new(device, true).unwrap();
//! fence.wait(0).unwrap();
//! assert!(mock.violations().is_empty());
//! ```

use std::{
    collections::{HashMap, VecDeque},
    ptr::NonNull,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use super::{
    BarrierBatch, Backend, BufferAllocation, BufferDesc, ImageDesc, MemoryLocation,
    RenderPassBegin, SemaphoreWait, Submission,
};
use crate::tracking::{BufferBarrier, ImageBarrier, MemoryBarrier};

/// A command as recorded into a mock command buffer.
#[derive(Debug, Clone)]
pub enum MockCommand {
    Barrier {
        memory: Option<MemoryBarrier>,
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    },
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
}

impl MockCommand {
    fn references_buffer(&self, buffer: vk::Buffer) -> bool {
        match self {
            MockCommand::Barrier { buffers, .. } => buffers.iter().any(|b| b.buffer == buffer),
            MockCommand::CopyBuffer { src, dst, .. } => *src == buffer || *dst == buffer,
            MockCommand::CopyBufferToImage { src, .. } => *src == buffer,
            MockCommand::BindVertexBuffer { buffer: b, .. }
            | MockCommand::BindIndexBuffer { buffer: b, .. } => *b == buffer,
            _ => false,
        }
    }

    fn references_image(&self, image: vk::Image) -> bool {
        match self {
            MockCommand::Barrier { images, .. } => images.iter().any(|i| i.image == image),
            MockCommand::CopyBufferToImage { dst, .. } => *dst == image,
            MockCommand::BlitImage { src, dst, .. } => *src == image || *dst == image,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Executing,
    Executed,
}

/// A submission as seen by the mock GPU.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub id: usize,
    pub queue: vk::Queue,
    pub family_index: u32,
    pub command_buffer: vk::CommandBuffer,
    pub commands: Vec<MockCommand>,
    pub wait: Option<SemaphoreWait>,
    pub signal: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
    pub status: SubmissionStatus,
}

#[derive(Default)]
struct SemaphoreState {
    signaled: bool,
    signaler: Option<usize>,
    /// Presents waiting on a signal that has not happened yet.
    queued_presents: usize,
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    signaler: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingStage {
    Initial,
    Recording,
    Executable,
}

struct CommandBufferState {
    pool: vk::CommandPool,
    family_index: u32,
    stage: RecordingStage,
    commands: Vec<MockCommand>,
}

struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}
unsafe impl Send for HostMemory {}

impl HostMemory {
    fn new(len: usize) -> Self {
        let boxed = vec![0u8; len].into_boxed_slice();
        let ptr = NonNull::new(Box::into_raw(boxed).cast::<u8>()).unwrap_or(NonNull::dangling());
        Self { ptr, len }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

struct BufferState {
    memory: HostMemory,
    location: MemoryLocation,
}

struct ImageState {
    desc: ImageDesc,
    contents: Vec<u8>,
}

struct QueueState {
    family_index: u32,
    pending: VecDeque<usize>,
    max_pending: usize,
    presents: usize,
}

struct SwapchainState {
    images: Vec<vk::Image>,
    next: u32,
    out_of_date: bool,
}

#[derive(Default)]
struct MockState {
    semaphores: HashMap<vk::Semaphore, SemaphoreState>,
    fences: HashMap<vk::Fence, FenceState>,
    pools: HashMap<vk::CommandPool, u32>,
    command_buffers: HashMap<vk::CommandBuffer, CommandBufferState>,
    buffers: HashMap<vk::Buffer, BufferState>,
    images: HashMap<vk::Image, ImageState>,
    queues: HashMap<vk::Queue, QueueState>,
    queue_handles: HashMap<(u32, u32), vk::Queue>,
    swapchains: HashMap<vk::SwapchainKHR, SwapchainState>,
    submissions: Vec<SubmissionRecord>,
    violations: Vec<String>,
    fail_next_submit: Option<vk::Result>,
}

/// Lazily executing fake GPU. See the [module documentation](self).
pub struct MockBackend {
    families: Vec<vk::QueueFlags>,
    next_handle: AtomicU64,
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A device with a universal family 0 and a dedicated transfer family 1.
    pub fn new() -> Self {
        Self::with_queue_families(vec![
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            vk::QueueFlags::TRANSFER,
        ])
    }

    pub fn with_queue_families(families: Vec<vk::QueueFlags>) -> Self {
        Self {
            families,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(MockState::default()),
        }
    }

    fn handle<H: Handle>(&self) -> H {
        H::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a swapchain with `image_count` presentable images.
    pub fn create_swapchain(&self, image_count: u32) -> vk::SwapchainKHR {
        let swapchain = self.handle();
        let images = (0..image_count).map(|_| self.handle()).collect();
        self.lock().swapchains.insert(
            swapchain,
            SwapchainState {
                images,
                next: 0,
                out_of_date: false,
            },
        );
        swapchain
    }

    /// Makes subsequent acquires and presents on `swapchain` report `ERROR_OUT_OF_DATE_KHR`.
    pub fn invalidate_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(state) = self.lock().swapchains.get_mut(&swapchain) {
            state.out_of_date = true;
        }
    }

    /// Makes the next `queue_submit` fail with `error` without queueing anything.
    pub fn fail_next_submit(&self, error: vk::Result) {
        self.lock().fail_next_submit = Some(error);
    }

    /// Every protocol violation observed so far.
    pub fn violations(&self) -> Vec<String> {
        self.lock().violations.clone()
    }

    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.lock().submissions.clone()
    }

    /// Largest number of submissions ever outstanding on `queue` at once.
    pub fn max_pending_submissions(&self, queue: vk::Queue) -> usize {
        self.lock()
            .queues
            .get(&queue)
            .map_or(0, |queue| queue.max_pending)
    }

    pub fn pending_submissions(&self, queue: vk::Queue) -> usize {
        self.lock()
            .queues
            .get(&queue)
            .map_or(0, |queue| queue.pending.len())
    }

    pub fn present_count(&self, queue: vk::Queue) -> usize {
        self.lock().queues.get(&queue).map_or(0, |queue| queue.presents)
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.lock()
            .buffers
            .get(&buffer)
            .map(|state| state.memory.bytes().to_vec())
    }

    pub fn buffer_location(&self, buffer: vk::Buffer) -> Option<MemoryLocation> {
        self.lock().buffers.get(&buffer).map(|state| state.location)
    }

    /// Bytes copied into mip level 0 of `image`.
    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        self.lock()
            .images
            .get(&image)
            .map(|state| state.contents.clone())
    }

    pub fn image_desc(&self, image: vk::Image) -> Option<ImageDesc> {
        self.lock().images.get(&image).map(|state| state.desc)
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.lock().images.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.lock().command_buffers.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.lock().semaphores.len()
    }

    pub fn live_fences(&self) -> usize {
        self.lock().fences.len()
    }

    /// Runs every outstanding submission on every queue.
    pub fn complete_all(&self) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let pending: Vec<usize> = state
            .submissions
            .iter()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .map(|s| s.id)
            .collect();
        for id in pending {
            state.execute(id);
        }
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: MockCommand) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.stage == RecordingStage::Recording => cb.commands.push(command),
            Some(_) => state.violations.push(format!(
                "recorded {command:?} into {command_buffer:?} outside the recording state"
            )),
            None => state.violations.push(format!(
                "recorded {command:?} into unknown command buffer {command_buffer:?}"
            )),
        }
    }
}

impl MockState {
    fn unfinished(&self) -> impl Iterator<Item = &SubmissionRecord> {
        self.submissions
            .iter()
            .filter(|s| s.status != SubmissionStatus::Executed)
    }

    /// Runs submission `id` and everything it depends on.
    fn execute(&mut self, id: usize) {
        match self.submissions[id].status {
            SubmissionStatus::Executed => return,
            SubmissionStatus::Executing => {
                self.violations
                    .push(format!("submission {id} depends on itself"));
                return;
            }
            SubmissionStatus::Pending => (),
        }
        self.submissions[id].status = SubmissionStatus::Executing;

        let queue = self.submissions[id].queue;
        loop {
            let front = self
                .queues
                .get(&queue)
                .and_then(|q| q.pending.front().copied());
            match front {
                Some(front) if front != id => self.execute(front),
                _ => break,
            }
        }

        if let Some(wait) = self.submissions[id].wait {
            let signaler = self
                .semaphores
                .get(&wait.semaphore)
                .and_then(|s| s.signaler);
            if let Some(signaler) = signaler {
                self.execute(signaler);
            }
            match self.semaphores.get_mut(&wait.semaphore) {
                Some(semaphore) if semaphore.signaled => semaphore.signaled = false,
                _ => self.violations.push(format!(
                    "submission {id} waited on {:?}, which was never signaled",
                    wait.semaphore
                )),
            }
        }

        let commands = self.submissions[id].commands.clone();
        for command in &commands {
            self.run(id, command);
        }

        if let Some(signal) = self.submissions[id].signal
            && let Some(semaphore) = self.semaphores.get_mut(&signal)
        {
            semaphore.signaler = None;
            if semaphore.queued_presents > 0 {
                semaphore.queued_presents -= 1;
            } else {
                semaphore.signaled = true;
            }
        }
        if let Some(fence) = self.submissions[id].fence
            && let Some(fence) = self.fences.get_mut(&fence)
        {
            fence.signaler = None;
            fence.signaled = true;
        }
        if let Some(queue) = self.queues.get_mut(&queue) {
            queue.pending.retain(|&pending| pending != id);
        }
        self.submissions[id].status = SubmissionStatus::Executed;
    }

    fn run(&mut self, id: usize, command: &MockCommand) {
        match command {
            MockCommand::CopyBuffer { src, dst, region } => {
                let (Some(src_state), Some(dst_state)) = (self.buffers.get(src), self.buffers.get(dst))
                else {
                    self.violations.push(format!(
                        "submission {id} copies between destroyed buffers {src:?} -> {dst:?}"
                    ));
                    return;
                };
                let src_end = region.src_offset + region.size;
                let dst_end = region.dst_offset + region.size;
                if src_end as usize > src_state.memory.len || dst_end as usize > dst_state.memory.len
                {
                    self.violations
                        .push(format!("submission {id} copies out of bounds: {region:?}"));
                    return;
                }
                unsafe {
                    std::ptr::copy(
                        src_state.memory.ptr.as_ptr().add(region.src_offset as usize),
                        dst_state.memory.ptr.as_ptr().add(region.dst_offset as usize),
                        region.size as usize,
                    );
                }
            }
            MockCommand::CopyBufferToImage { src, dst, region, .. } => {
                let Some(src_state) = self.buffers.get(src) else {
                    self.violations
                        .push(format!("submission {id} copies from destroyed buffer {src:?}"));
                    return;
                };
                let bytes = src_state
                    .memory
                    .bytes()
                    .get(region.buffer_offset as usize..)
                    .unwrap_or_default()
                    .to_vec();
                match self.images.get_mut(dst) {
                    Some(image) if region.image_subresource.mip_level == 0 => image.contents = bytes,
                    Some(_) => (),
                    None => self
                        .violations
                        .push(format!("submission {id} copies into destroyed image {dst:?}")),
                }
            }
            MockCommand::BlitImage { src, dst, .. } => {
                if !self.images.contains_key(src) || !self.images.contains_key(dst) {
                    self.violations
                        .push(format!("submission {id} blits a destroyed image"));
                }
            }
            _ => (),
        }
    }

    fn drain_queue(&mut self, queue: vk::Queue) {
        while let Some(front) = self
            .queues
            .get(&queue)
            .and_then(|q| q.pending.front().copied())
        {
            self.execute(front);
        }
    }
}

impl Backend for MockBackend {
    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(&queue) = state.queue_handles.get(&(family_index, queue_index)) {
            return queue;
        }
        let queue = self.handle();
        state
            .queue_handles
            .insert((family_index, queue_index), queue);
        state.queues.insert(
            queue,
            QueueState {
                family_index,
                pending: VecDeque::new(),
                max_pending: 0,
                presents: 0,
            },
        );
        queue
    }

    fn queue_family_flags(&self, family_index: u32) -> vk::QueueFlags {
        self.families
            .get(family_index as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Every format transfers, blits and samples; the ones without mandatory linear filtering
    /// lack `SAMPLED_IMAGE_FILTER_LINEAR`.
    fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        let features = vk::FormatFeatureFlags::SAMPLED_IMAGE
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST
            | vk::FormatFeatureFlags::TRANSFER_SRC
            | vk::FormatFeatureFlags::TRANSFER_DST;
        match format {
            vk::Format::R8_SRGB
            | vk::Format::R8G8_SRGB
            | vk::Format::R16G16B16A16_UNORM
            | vk::Format::R32G32B32A32_SFLOAT => features,
            _ => features | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore = self.handle();
        self.lock()
            .semaphores
            .insert(semaphore, SemaphoreState::default());
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let in_use = state
            .unfinished()
            .any(|s| s.signal == Some(semaphore) || s.wait.map(|w| w.semaphore) == Some(semaphore));
        if in_use {
            state.violations.push(format!(
                "{semaphore:?} destroyed while a pending submission uses it"
            ));
        }
        if state.semaphores.remove(&semaphore).is_none() {
            state
                .violations
                .push(format!("{semaphore:?} destroyed twice"));
        }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence = self.handle();
        self.lock().fences.insert(
            fence,
            FenceState {
                signaled,
                signaler: None,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.fences.remove(&fence) {
            Some(FenceState {
                signaler: Some(id), ..
            }) => state.violations.push(format!(
                "{fence:?} destroyed while submission {id} will signal it"
            )),
            Some(_) => (),
            None => state.violations.push(format!("{fence:?} destroyed twice")),
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some((signaled, signaler)) = state
            .fences
            .get(&fence)
            .map(|fence| (fence.signaled, fence.signaler))
        else {
            state
                .violations
                .push(format!("waited on unknown {fence:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        if signaled {
            return Ok(());
        }
        match signaler {
            Some(id) => {
                state.execute(id);
                Ok(())
            }
            None if timeout == 0 => Err(vk::Result::TIMEOUT),
            None => {
                state.violations.push(format!(
                    "waited on {fence:?}, which no submission will ever signal"
                ));
                Err(vk::Result::TIMEOUT)
            }
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.fences.get_mut(&fence) {
            Some(FenceState {
                signaler: Some(id), ..
            }) => {
                let id = *id;
                state
                    .violations
                    .push(format!("{fence:?} reset while submission {id} will signal it"));
            }
            Some(fence) => fence.signaled = false,
            None => state.violations.push(format!("reset unknown {fence:?}")),
        }
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self
            .lock()
            .fences
            .get(&fence)
            .is_some_and(|fence| fence.signaled))
    }

    fn create_command_pool(
        &self,
        family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        let pool = self.handle();
        self.lock().pools.insert(pool, family_index);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let buffers: Vec<vk::CommandBuffer> = state
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == pool)
            .map(|(&handle, _)| handle)
            .collect();
        for handle in buffers {
            if state.unfinished().any(|s| s.command_buffer == handle) {
                state.violations.push(format!(
                    "{pool:?} destroyed while {handle:?} is still executing"
                ));
            }
            state.command_buffers.remove(&handle);
        }
        state.pools.remove(&pool);
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(&family_index) = state.pools.get(&pool) else {
            state
                .violations
                .push(format!("allocated from unknown {pool:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        let handle = self.handle();
        state.command_buffers.insert(
            handle,
            CommandBufferState {
                pool,
                family_index,
                stage: RecordingStage::Initial,
                commands: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.unfinished().any(|s| s.command_buffer == command_buffer) {
            state.violations.push(format!(
                "{command_buffer:?} freed while a submission using it is pending"
            ));
        }
        match state.command_buffers.remove(&command_buffer) {
            Some(cb) if cb.pool != pool => state.violations.push(format!(
                "{command_buffer:?} freed to {pool:?}, but it belongs to {:?}",
                cb.pool
            )),
            Some(_) => (),
            None => state
                .violations
                .push(format!("{command_buffer:?} freed twice")),
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.unfinished().any(|s| s.command_buffer == command_buffer) {
            state.violations.push(format!(
                "{command_buffer:?} reset while a submission using it is pending"
            ));
        }
        if let Some(cb) = state.command_buffers.get_mut(&command_buffer) {
            cb.stage = RecordingStage::Initial;
            cb.commands.clear();
        }
        Ok(())
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.stage == RecordingStage::Initial => {
                cb.stage = RecordingStage::Recording;
                Ok(())
            }
            Some(_) => {
                state
                    .violations
                    .push(format!("began {command_buffer:?} without resetting it"));
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.command_buffers.get_mut(&command_buffer) {
            Some(cb) if cb.stage == RecordingStage::Recording => {
                cb.stage = RecordingStage::Executable;
                Ok(())
            }
            Some(_) => {
                state
                    .violations
                    .push(format!("ended {command_buffer:?} outside the recording state"));
                Ok(())
            }
            None => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        self.record(
            command_buffer,
            MockCommand::Barrier {
                memory: barriers.memory,
                buffers: barriers.buffers.to_vec(),
                images: barriers.images.to_vec(),
            },
        );
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        self.record(command_buffer, MockCommand::CopyBuffer { src, dst, region });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        self.record(
            command_buffer,
            MockCommand::CopyBufferToImage {
                src,
                dst,
                layout: dst_layout,
                region,
            },
        );
    }

    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    ) {
        self.record(
            command_buffer,
            MockCommand::BlitImage {
                src,
                src_layout,
                dst,
                dst_layout,
                region,
                filter,
            },
        );
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        self.record(
            command_buffer,
            MockCommand::BeginRenderPass {
                render_pass: begin.render_pass,
                framebuffer: begin.framebuffer,
            },
        );
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record(command_buffer, MockCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            command_buffer,
            MockCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
    ) {
        self.record(
            command_buffer,
            MockCommand::BindVertexBuffer { binding, buffer },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(
            command_buffer,
            MockCommand::BindIndexBuffer { buffer, index_type },
        );
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            command_buffer,
            MockCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(error) = state.fail_next_submit.take() {
            return Err(error);
        }
        let id = state.submissions.len();
        let Some(queue_family) = state.queues.get(&queue).map(|q| q.family_index) else {
            state
                .violations
                .push(format!("submitted to unknown {queue:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        };

        let commands = match state.command_buffers.get(&submission.command_buffer) {
            Some(cb) => {
                let commands = cb.commands.clone();
                if cb.stage != RecordingStage::Executable {
                    state.violations.push(format!(
                        "submitted {:?} before ending it",
                        submission.command_buffer
                    ));
                }
                if cb.family_index != queue_family {
                    let family = cb.family_index;
                    state.violations.push(format!(
                        "{:?} from family {family} submitted to a family {queue_family} queue",
                        submission.command_buffer
                    ));
                }
                commands
            }
            None => {
                state.violations.push(format!(
                    "submitted unknown {:?}",
                    submission.command_buffer
                ));
                Vec::new()
            }
        };
        if state
            .unfinished()
            .any(|s| s.command_buffer == submission.command_buffer)
        {
            state.violations.push(format!(
                "{:?} submitted again while still pending",
                submission.command_buffer
            ));
        }

        if let Some(wait) = submission.wait {
            let will_signal = state
                .semaphores
                .get(&wait.semaphore)
                .is_some_and(|s| s.signaled || s.signaler.is_some());
            if !will_signal {
                state.violations.push(format!(
                    "submission {id} waits on {:?}, which nothing will signal",
                    wait.semaphore
                ));
            }
        }
        if let Some(signal) = submission.signal {
            match state.semaphores.get_mut(&signal) {
                Some(semaphore) if semaphore.signaled || semaphore.signaler.is_some() => {
                    state.violations.push(format!(
                        "submission {id} signals {signal:?}, which already has an unconsumed signal"
                    ));
                }
                Some(semaphore) => semaphore.signaler = Some(id),
                None => state
                    .violations
                    .push(format!("submission {id} signals unknown {signal:?}")),
            }
        }
        if let Some(fence) = submission.fence {
            match state.fences.get_mut(&fence) {
                Some(fence_state) if fence_state.signaled || fence_state.signaler.is_some() => {
                    state.violations.push(format!(
                        "submission {id} uses {fence:?}, which was not reset"
                    ));
                }
                Some(fence_state) => fence_state.signaler = Some(id),
                None => state
                    .violations
                    .push(format!("submission {id} uses unknown {fence:?}")),
            }
        }

        state.submissions.push(SubmissionRecord {
            id,
            queue,
            family_index: queue_family,
            command_buffer: submission.command_buffer,
            commands,
            wait: submission.wait,
            signal: submission.signal,
            fence: submission.fence,
            status: SubmissionStatus::Pending,
        });
        if let Some(queue) = state.queues.get_mut(&queue) {
            queue.pending.push_back(id);
            queue.max_pending = queue.max_pending.max(queue.pending.len());
        }
        Ok(())
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.semaphores.get_mut(&wait) {
            Some(semaphore) if semaphore.signaled => semaphore.signaled = false,
            Some(semaphore) if semaphore.signaler.is_some() => semaphore.queued_presents += 1,
            _ => state.violations.push(format!(
                "present of image {image_index} waits on {wait:?}, which nothing will signal"
            )),
        }
        if let Some(queue) = state.queues.get_mut(&queue) {
            queue.presents += 1;
        }
        match state.swapchains.get(&swapchain) {
            Some(swapchain) if swapchain.out_of_date => Err(vk::Result::ERROR_OUT_OF_DATE_KHR),
            Some(swapchain) if image_index as usize >= swapchain.images.len() => {
                state
                    .violations
                    .push(format!("presented out-of-range image {image_index}"));
                Ok(false)
            }
            Some(_) => Ok(false),
            None => Err(vk::Result::ERROR_SURFACE_LOST_KHR),
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        self.lock().drain_queue(queue);
        Ok(())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let index = match state.swapchains.get_mut(&swapchain) {
            Some(swapchain) if swapchain.out_of_date => {
                return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
            }
            Some(swapchain) => {
                let index = swapchain.next;
                swapchain.next = (swapchain.next + 1) % swapchain.images.len().max(1) as u32;
                index
            }
            None => return Err(vk::Result::ERROR_SURFACE_LOST_KHR),
        };
        match state.semaphores.get_mut(&signal) {
            Some(semaphore) if semaphore.signaled || semaphore.signaler.is_some() => {
                state.violations.push(format!(
                    "acquired into {signal:?}, which already has an unconsumed signal"
                ));
            }
            Some(semaphore) => semaphore.signaled = true,
            None => state
                .violations
                .push(format!("acquired into unknown {signal:?}")),
        }
        Ok((index, false))
    }

    fn get_swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.lock()
            .swapchains
            .get(&swapchain)
            .map(|swapchain| swapchain.images.clone())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<BufferAllocation> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if desc.size == 0 {
            state
                .violations
                .push("created a zero-sized buffer".to_string());
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let buffer = self.handle();
        let memory = HostMemory::new(desc.size as usize);
        let mapped = match desc.location {
            MemoryLocation::Staging => Some(memory.ptr),
            MemoryLocation::DeviceLocal => None,
        };
        state.buffers.insert(
            buffer,
            BufferState {
                memory,
                location: desc.location,
            },
        );
        Ok(BufferAllocation { buffer, mapped })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let users: Vec<usize> = state
            .unfinished()
            .filter(|s| s.commands.iter().any(|c| c.references_buffer(buffer)))
            .map(|s| s.id)
            .collect();
        if !users.is_empty() {
            state.violations.push(format!(
                "{buffer:?} destroyed while submissions {users:?} still reference it"
            ));
        }
        if state.buffers.remove(&buffer).is_none() {
            state.violations.push(format!("{buffer:?} destroyed twice"));
        }
    }

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.buffers.get(&buffer) {
            Some(b) if b.location != MemoryLocation::Staging => {
                state
                    .violations
                    .push(format!("flushed unmapped {buffer:?}"));
            }
            Some(b) if (offset + size) as usize > b.memory.len => {
                state
                    .violations
                    .push(format!("flushed {buffer:?} out of bounds"));
            }
            Some(_) => (),
            None => state.violations.push(format!("flushed unknown {buffer:?}")),
        }
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.mip_levels == 0 {
            state
                .violations
                .push(format!("created a degenerate image {desc:?}"));
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let image = self.handle();
        state.images.insert(
            image,
            ImageState {
                desc: *desc,
                contents: Vec::new(),
            },
        );
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let in_use = state
            .unfinished()
            .any(|s| s.commands.iter().any(|c| c.references_image(image)));
        if in_use {
            state.violations.push(format!(
                "{image:?} destroyed while a pending submission references it"
            ));
        }
        if state.images.remove(&image).is_none() {
            state.violations.push(format!("{image:?} destroyed twice"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(mock: &MockBackend, family: u32) -> (vk::CommandPool, vk::CommandBuffer) {
        let pool = mock
            .create_command_pool(family, vk::CommandPoolCreateFlags::empty())
            .unwrap();
        let cb = mock.allocate_command_buffer(pool).unwrap();
        mock.begin_command_buffer(cb).unwrap();
        (pool, cb)
    }

    #[test]
    fn test_submissions_run_lazily() {
        let mock = MockBackend::new();
        let queue = mock.get_queue(0, 0);
        let (_pool, cb) = recorded(&mock, 0);
        mock.end_command_buffer(cb).unwrap();
        let fence = mock.create_fence(false).unwrap();
        mock.queue_submit(
            queue,
            &Submission {
                command_buffer: cb,
                wait: None,
                signal: None,
                fence: Some(fence),
            },
        )
        .unwrap();
        assert!(!mock.fence_status(fence).unwrap());
        assert_eq!(mock.pending_submissions(queue), 1);
        mock.wait_for_fence(fence, u64::MAX).unwrap();
        assert!(mock.fence_status(fence).unwrap());
        assert_eq!(mock.pending_submissions(queue), 0);
        assert!(mock.violations().is_empty());
    }

    #[test]
    fn test_cross_queue_wait_runs_signaler_first() {
        let mock = MockBackend::new();
        let transfer = mock.get_queue(1, 0);
        let graphics = mock.get_queue(0, 0);

        let src = mock
            .create_buffer(&BufferDesc {
                size: 4,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::Staging,
            })
            .unwrap();
        let dst = mock
            .create_buffer(&BufferDesc {
                size: 4,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), src.mapped.unwrap().as_ptr(), 4);
        }

        let (_tp, copy_cb) = recorded(&mock, 1);
        mock.cmd_copy_buffer(
            copy_cb,
            src.buffer,
            dst.buffer,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 4,
            },
        );
        mock.end_command_buffer(copy_cb).unwrap();
        let (_gp, use_cb) = recorded(&mock, 0);
        mock.end_command_buffer(use_cb).unwrap();

        let semaphore = mock.create_semaphore().unwrap();
        let fence = mock.create_fence(false).unwrap();
        mock.queue_submit(
            transfer,
            &Submission {
                command_buffer: copy_cb,
                wait: None,
                signal: Some(semaphore),
                fence: None,
            },
        )
        .unwrap();
        mock.queue_submit(
            graphics,
            &Submission {
                command_buffer: use_cb,
                wait: Some(SemaphoreWait {
                    semaphore,
                    stage: vk::PipelineStageFlags2::VERTEX_INPUT,
                }),
                signal: None,
                fence: Some(fence),
            },
        )
        .unwrap();
        assert_eq!(mock.buffer_contents(dst.buffer).unwrap(), vec![0; 4]);

        mock.wait_for_fence(fence, u64::MAX).unwrap();
        assert_eq!(mock.buffer_contents(dst.buffer).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(mock.pending_submissions(transfer), 0);
        assert!(mock.violations().is_empty());
    }

    #[test]
    fn test_unsignaled_wait_is_a_violation() {
        let mock = MockBackend::new();
        let queue = mock.get_queue(0, 0);
        let (_pool, cb) = recorded(&mock, 0);
        mock.end_command_buffer(cb).unwrap();
        let semaphore = mock.create_semaphore().unwrap();
        mock.queue_submit(
            queue,
            &Submission {
                command_buffer: cb,
                wait: Some(SemaphoreWait {
                    semaphore,
                    stage: vk::PipelineStageFlags2::ALL_COMMANDS,
                }),
                signal: None,
                fence: None,
            },
        )
        .unwrap();
        assert_eq!(mock.violations().len(), 1);
    }

    #[test]
    fn test_freeing_referenced_buffer_is_a_violation() {
        let mock = MockBackend::new();
        let queue = mock.get_queue(0, 0);
        let staging = mock
            .create_buffer(&BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
                location: MemoryLocation::Staging,
            })
            .unwrap();
        let target = mock
            .create_buffer(&BufferDesc {
                size: 16,
                usage: vk::BufferUsageFlags::TRANSFER_DST,
                location: MemoryLocation::DeviceLocal,
            })
            .unwrap();
        let (_pool, cb) = recorded(&mock, 0);
        mock.cmd_copy_buffer(
            cb,
            staging.buffer,
            target.buffer,
            vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: 16,
            },
        );
        mock.end_command_buffer(cb).unwrap();
        mock.queue_submit(
            queue,
            &Submission {
                command_buffer: cb,
                wait: None,
                signal: None,
                fence: None,
            },
        )
        .unwrap();
        mock.destroy_buffer(staging.buffer);
        let violations = mock.violations();
        assert_eq!(violations.len(), 1, "{violations:?}");
        assert!(violations[0].contains("still reference"));
    }

    #[test]
    fn test_wrong_family_submission_is_a_violation() {
        let mock = MockBackend::new();
        let graphics = mock.get_queue(0, 0);
        let (_pool, cb) = recorded(&mock, 1);
        mock.end_command_buffer(cb).unwrap();
        mock.queue_submit(
            graphics,
            &Submission {
                command_buffer: cb,
                wait: None,
                signal: None,
                fence: None,
            },
        )
        .unwrap();
        assert!(mock.violations()[0].contains("family 1"));
    }

    #[test]
    fn test_swapchain_acquire_round_robin() {
        let mock = MockBackend::new();
        let swapchain = mock.create_swapchain(3);
        let indices: Vec<u32> = (0..4)
            .map(|_| {
                let semaphore = mock.create_semaphore().unwrap();
                mock.acquire_next_image(swapchain, u64::MAX, semaphore)
                    .unwrap()
                    .0
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0]);
        mock.invalidate_swapchain(swapchain);
        let semaphore = mock.create_semaphore().unwrap();
        assert_eq!(
            mock.acquire_next_image(swapchain, u64::MAX, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
    }
}

//! The capability interface between the streaming core and a GPU driver.
//!
//! Everything above this module reaches the GPU through [`Backend`], a small trait covering
//! submission, barriers, copies, blits, synchronization objects and memory. Two
//! implementations ship with the crate:
//!
//! - [`vulkan::VulkanBackend`] forwards to `ash` and allocates through `vk-mem`.
//! - [`mock::MockBackend`] simulates a GPU on the host. Submissions execute lazily and every
//!   synchronization mistake is recorded, so the upload protocol and frame pacing can be tested
//!   without a device.
//!
//! Handles are raw `ash::vk` handles; ownership and lifetimes are managed by the RAII wrappers in
//! [`sync`](crate::sync), [`buffer`](crate::buffer), [`image`](crate::image) and
//! [`command`](crate::command).

pub mod mock;
pub mod vulkan;

use std::ptr::NonNull;

use ash::{prelude::VkResult, vk};

use crate::tracking::{BufferBarrier, ImageBarrier, MemoryBarrier};

/// Where an allocation should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Fast device memory, not host visible.
    DeviceLocal,
    /// Host-visible, persistently mapped memory written sequentially by the CPU.
    Staging,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub extent: vk::Extent3D,
    pub format: vk::Format,
    pub mip_levels: u32,
    pub usage: vk::ImageUsageFlags,
}

/// A freshly allocated buffer. `mapped` is set for [`MemoryLocation::Staging`] allocations.
#[derive(Debug)]
pub struct BufferAllocation {
    pub buffer: vk::Buffer,
    pub mapped: Option<NonNull<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

/// One command buffer submitted to a queue, with at most one wait and one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<SemaphoreWait>,
    pub signal: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

/// Barriers emitted together in one pipeline barrier command.
#[derive(Debug, Clone, Copy)]
pub struct BarrierBatch<'a> {
    pub memory: Option<MemoryBarrier>,
    pub buffers: &'a [BufferBarrier],
    pub images: &'a [ImageBarrier],
}

pub struct RenderPassBegin<'a> {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: vk::Rect2D,
    pub clear_values: &'a [vk::ClearValue],
}

/// Driver entry points consumed by the core.
///
/// Implementations must be thread-safe: recording into distinct command buffers and
/// allocating memory may happen from many threads at once. Queue operations are serialized by
/// [`Queue`](crate::Queue) before they reach the backend.
pub trait Backend: Send + Sync + 'static {
    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue;
    fn queue_family_flags(&self, family_index: u32) -> vk::QueueFlags;
    /// Features of `format` for optimally tiled images.
    fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    fn create_command_pool(
        &self,
        family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch);
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    );
    #[allow(clippy::too_many_arguments)]
    fn cmd_blit_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::ImageBlit,
        filter: vk::Filter,
    );
    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin);
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission) -> VkResult<()>;
    /// Returns `true` when the swapchain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    fn get_swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<BufferAllocation>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Makes host writes to a mapped buffer visible to the device.
    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image>;
    fn destroy_image(&self, image: vk::Image);
}

//! [`Backend`] implementation on top of `ash`, with memory from the Vulkan Memory Allocator.
//!
//! The logical device is created by the windowing layer and handed over with
//! [`VulkanBackend::new`]. It must have Vulkan 1.3 (or `VK_KHR_synchronization2`) and
//! `VK_KHR_swapchain` enabled.

use std::{collections::HashMap, ptr::NonNull, sync::Mutex};

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;
use vk_mem::Alloc;

use super::{
    BarrierBatch, Backend, BufferAllocation, BufferDesc, ImageDesc, MemoryLocation,
    RenderPassBegin, Submission,
};

pub struct VulkanBackend {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain: ash::khr::swapchain::Device,
    allocator: vk_mem::Allocator,
    queue_families: Vec<vk::QueueFamilyProperties>,
    buffers: Mutex<HashMap<vk::Buffer, vk_mem::Allocation>>,
    images: Mutex<HashMap<vk::Image, vk_mem::Allocation>>,
}
unsafe impl Send for VulkanBackend {}
unsafe impl Sync for VulkanBackend {}

impl VulkanBackend {
    /// # Safety
    /// `device` must have been created from `physical_device` of `instance` with synchronization2
    /// and `VK_KHR_swapchain` enabled. The caller keeps `instance` and `device` alive for as
    /// long as the backend exists and destroys the device only after the backend is dropped.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> VkResult<Self> {
        let info = vk_mem::AllocatorCreateInfo::new(instance, &device, physical_device);
        let allocator = unsafe { vk_mem::Allocator::new(info)? };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        tracing::info!(
            device = ?device.handle(),
            queue_families = queue_families.len(),
            "Created Vulkan backend"
        );
        Ok(Self {
            instance: instance.clone(),
            physical_device,
            swapchain: ash::khr::swapchain::Device::new(instance, &device),
            device,
            allocator,
            queue_families,
            buffers: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
        })
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn allocation_info(location: MemoryLocation) -> vk_mem::AllocationCreateInfo {
        match location {
            MemoryLocation::DeviceLocal => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferDevice,
                flags: vk_mem::AllocationCreateFlags::empty(),
                ..Default::default()
            },
            MemoryLocation::Staging => vk_mem::AllocationCreateInfo {
                usage: vk_mem::MemoryUsage::AutoPreferHost,
                flags: vk_mem::AllocationCreateFlags::MAPPED
                    | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                ..Default::default()
            },
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let buffers = self.buffers.get_mut().map(std::mem::take).unwrap_or_default();
        let images = self.images.get_mut().map(std::mem::take).unwrap_or_default();
        if !buffers.is_empty() || !images.is_empty() {
            tracing::warn!(
                buffers = buffers.len(),
                images = images.len(),
                "Dropping VulkanBackend with live allocations"
            );
        }
        unsafe {
            for (buffer, mut allocation) in buffers {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
            for (image, mut allocation) in images {
                self.allocator.destroy_image(image, &mut allocation);
            }
        }
    }
}

impl Backend for VulkanBackend {
    fn get_queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn queue_family_flags(&self, family_index: u32) -> vk::QueueFlags {
        self.queue_families
            .get(family_index as usize)
            .map(|family| family.queue_flags)
            .unwrap_or_default()
    }

    fn format_features(&self, format: vk::Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
                .optimal_tiling_features
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo {
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn create_command_pool(
        &self,
        family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<vk::CommandPool> {
        unsafe {
            self.device.create_command_pool(
                &vk::CommandPoolCreateInfo {
                    flags,
                    queue_family_index: family_index,
                    ..Default::default()
                },
                None,
            )
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        unsafe {
            let mut command_buffer = vk::CommandBuffer::null();
            (self.device.fp_v1_0().allocate_command_buffers)(
                self.device.handle(),
                &vk::CommandBufferAllocateInfo {
                    command_pool: pool,
                    command_buffer_count: 1,
                    level: vk::CommandBufferLevel::PRIMARY,
                    ..Default::default()
                },
                &mut command_buffer,
            )
            .result()?;
            Ok(command_buffer)
        }
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device.begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )
        }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_pipeline_barrier(&self, command_buffer: vk::CommandBuffer, barriers: &BarrierBatch) {
        let memory_barriers: SmallVec<[vk::MemoryBarrier2<'static>; 1]> = barriers
            .memory
            .iter()
            .map(|barrier| vk::MemoryBarrier2 {
                src_stage_mask: barrier.src.stage,
                src_access_mask: barrier.src.access,
                dst_stage_mask: barrier.dst.stage,
                dst_access_mask: barrier.dst.access,
                ..Default::default()
            })
            .collect();
        let buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2<'static>; 4]> = barriers
            .buffers
            .iter()
            .map(|barrier| vk::BufferMemoryBarrier2 {
                src_stage_mask: barrier.src.stage,
                src_access_mask: barrier.src.access,
                dst_stage_mask: barrier.dst.stage,
                dst_access_mask: barrier.dst.access,
                src_queue_family_index: barrier.src_queue_family,
                dst_queue_family_index: barrier.dst_queue_family,
                buffer: barrier.buffer,
                offset: barrier.offset,
                size: barrier.size,
                ..Default::default()
            })
            .collect();
        let image_barriers: SmallVec<[vk::ImageMemoryBarrier2<'static>; 4]> = barriers
            .images
            .iter()
            .map(|barrier| vk::ImageMemoryBarrier2 {
                src_stage_mask: barrier.src.stage,
                src_access_mask: barrier.src.access,
                dst_stage_mask: barrier.dst.stage,
                dst_access_mask: barrier.dst.access,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
                src_queue_family_index: barrier.src_queue_family,
                dst_queue_family_index: barrier.dst_queue_family,
                image: barrier.image,
                subresource_range: barrier.range,
                ..Default::default()
            })
            .collect();
        unsafe {
            self.device.cmd_pipeline_barrier2(
                command_buffer,
                &vk::DependencyInfo::default()
                    .memory_barriers(&memory_barriers)
                    .buffer_memory_barriers(&buffer_barriers)
                    .image_memory_barriers(&image_barriers),
            );
        }
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer(command_buffer, src, dst, &[region]);
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, &[region]);
        }
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
        unsafe {
            self.device.cmd_blit_image(
                command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                &[region],
                filter,
            );
        }
    }

    fn cmd_begin_render_pass(&self, command_buffer: vk::CommandBuffer, begin: &RenderPassBegin) {
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(command_buffer, &info, vk::SubpassContents::INLINE);
        }
    }

    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }

    fn cmd_bind_vertex_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        binding: u32,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, binding, &[buffer], &[offset])
        }
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission) -> VkResult<()> {
        let waits: SmallVec<[vk::SemaphoreSubmitInfo<'static>; 1]> = submission
            .wait
            .iter()
            .map(|wait| vk::SemaphoreSubmitInfo {
                semaphore: wait.semaphore,
                stage_mask: wait.stage,
                ..Default::default()
            })
            .collect();
        let signals: SmallVec<[vk::SemaphoreSubmitInfo<'static>; 1]> = submission
            .signal
            .iter()
            .map(|&semaphore| vk::SemaphoreSubmitInfo {
                semaphore,
                stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                ..Default::default()
            })
            .collect();
        let command_buffers = [vk::CommandBufferSubmitInfo {
            command_buffer: submission.command_buffer,
            ..Default::default()
        }];
        unsafe {
            self.device.queue_submit2(
                queue,
                &[vk::SubmitInfo2::default()
                    .wait_semaphore_infos(&waits)
                    .command_buffer_infos(&command_buffers)
                    .signal_semaphore_infos(&signals)],
                submission.fence.unwrap_or_default(),
            )
        }
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let waits = [wait];
        let swapchains = [swapchain];
        let indices = [image_index];
        unsafe {
            self.swapchain.queue_present(
                queue,
                &vk::PresentInfoKHR::default()
                    .wait_semaphores(&waits)
                    .swapchains(&swapchains)
                    .image_indices(&indices),
            )
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: u64,
        signal: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain
                .acquire_next_image(swapchain, timeout, signal, vk::Fence::null())
        }
    }

    fn get_swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain.get_swapchain_images(swapchain) }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<BufferAllocation> {
        let (buffer, allocation) = unsafe {
            self.allocator.create_buffer(
                &vk::BufferCreateInfo {
                    size: desc.size,
                    usage: desc.usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &Self::allocation_info(desc.location),
            )?
        };
        let mapped = NonNull::new(
            self.allocator
                .get_allocation_info(&allocation)
                .mapped_data
                .cast::<u8>(),
        );
        self.buffers
            .lock()
            .unwrap()
            .insert(buffer, allocation);
        Ok(BufferAllocation { buffer, mapped })
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.buffers.lock().unwrap().remove(&buffer);
        match allocation {
            Some(mut allocation) => unsafe {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            },
            None => tracing::error!(?buffer, "Destroying a buffer this backend did not allocate"),
        }
    }

    fn flush_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()> {
        let buffers = self.buffers.lock().unwrap();
        let Some(allocation) = buffers.get(&buffer) else {
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        self.allocator.flush_allocation(allocation, offset, size)
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<vk::Image> {
        let (image, allocation) = unsafe {
            self.allocator.create_image(
                &vk::ImageCreateInfo {
                    image_type: vk::ImageType::TYPE_2D,
                    format: desc.format,
                    extent: desc.extent,
                    mip_levels: desc.mip_levels,
                    array_layers: 1,
                    samples: vk::SampleCountFlags::TYPE_1,
                    tiling: vk::ImageTiling::OPTIMAL,
                    usage: desc.usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    ..Default::default()
                },
                &Self::allocation_info(MemoryLocation::DeviceLocal),
            )?
        };
        self.images.lock().unwrap().insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let allocation = self.images.lock().unwrap().remove(&image);
        match allocation {
            Some(mut allocation) => unsafe {
                self.allocator.destroy_image(image, &mut allocation);
            },
            None => tracing::error!(?image, "Destroying an image this backend did not allocate"),
        }
    }
}

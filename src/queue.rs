//! Device queues.
//!
//! A [`Queue`] wraps one `VkQueue` together with the command pools that record for it:
//!
//! - one transient pool per worker thread, so workers allocate and record without ever
//!   contending with each other, and
//! - one resettable pool for the render thread, from which frame command buffers come.
//!
//! Submissions to a queue start in order. Submission and present are serialized internally, so
//! a `Queue` can be shared behind an `Arc` by the render thread and every worker.

use std::sync::{Mutex, MutexGuard};

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice,
    backend::{SemaphoreWait, Submission},
    command::{CommandBuffer, CommandBufferState, CommandPool},
    sync::{Fence, Semaphore},
    utils::AsVkHandle,
};

/// Synchronization attached to one submission.
///
/// A submission waits on at most one semaphore and signals at most one, which is all the
/// upload protocol and frame pacing need.
#[derive(Default, Clone, Copy)]
pub struct SubmitInfo<'a> {
    /// Semaphore to wait on, and the first stage that must not start before it is signaled.
    pub wait: Option<(&'a Semaphore, vk::PipelineStageFlags2)>,
    pub signal: Option<&'a Semaphore>,
    pub fence: Option<&'a Fence>,
}

/// A device queue and its command pools.
///
/// Each queue belongs to a queue family, which determines what operations it supports
/// (graphics, compute, transfer, etc.) and which command buffers may be submitted to it.
pub struct Queue {
    device: Device,
    handle: Mutex<vk::Queue>,
    family_index: u32,
    capabilities: vk::QueueFlags,
    persistent_pool: Mutex<CommandPool>,
    transient_pools: Box<[Mutex<CommandPool>]>,
}

impl HasDevice for Queue {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> Self::Handle {
        *self.handle.lock().unwrap()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("family_index", &self.family_index)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Retrieves queue `queue_index` of `family_index` and creates one transient command pool
    /// for each of `worker_count` workers.
    pub fn new(
        device: Device,
        family_index: u32,
        queue_index: u32,
        worker_count: usize,
    ) -> VkResult<Self> {
        let handle = device.get_queue(family_index, queue_index);
        let capabilities = device.queue_family_flags(family_index);
        let persistent_pool = CommandPool::new_resettable(device.clone(), family_index)?;
        let transient_pools = (0..worker_count)
            .map(|_| CommandPool::new(device.clone(), family_index).map(Mutex::new))
            .collect::<VkResult<Box<[_]>>>()?;
        tracing::debug!(
            family_index,
            queue_index,
            ?capabilities,
            worker_count,
            "Created queue"
        );
        Ok(Self {
            device,
            handle: Mutex::new(handle),
            family_index,
            capabilities,
            persistent_pool: Mutex::new(persistent_pool),
            transient_pools,
        })
    }

    /// Returns the queue family index.
    pub fn family_index(&self) -> u32 {
        self.family_index
    }

    /// Returns the capabilities supported by the queue family that this queue belongs to.
    pub fn capabilities(&self) -> vk::QueueFlags {
        self.capabilities
    }

    pub fn worker_count(&self) -> usize {
        self.transient_pools.len()
    }

    /// The transient command pool owned by `worker`.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range, or if the pool is already in use, which means two
    /// threads claimed the same worker index.
    pub fn transient_pool(&self, worker: usize) -> MutexGuard<'_, CommandPool> {
        let pool = self
            .transient_pools
            .get(worker)
            .unwrap_or_else(|| panic!("Worker index {worker} has no command pool"));
        match pool.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                panic!("Command pool of worker {worker} is used from two threads")
            }
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        }
    }

    /// The resettable pool used by the render thread.
    pub fn persistent_pool(&self) -> MutexGuard<'_, CommandPool> {
        self.persistent_pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submits a command buffer for execution.
    ///
    /// The command buffer must be in the `Executable` state and belong to this queue's family.
    /// After submission, it transitions to the `Pending` state.
    pub fn submit(&self, cb: &mut CommandBuffer, info: SubmitInfo) -> VkResult<()> {
        assert_eq!(
            cb.state(),
            CommandBufferState::Executable,
            "The command buffer must finish recording first!"
        );
        assert_eq!(
            cb.family_index(),
            self.family_index,
            "Command buffer submitted to a queue of a different family"
        );
        let submission = Submission {
            command_buffer: cb.vk_handle(),
            wait: info.wait.map(|(semaphore, stage)| SemaphoreWait {
                semaphore: semaphore.vk_handle(),
                stage,
            }),
            signal: info.signal.map(|semaphore| semaphore.vk_handle()),
            fence: info.fence.map(|fence| fence.vk_handle()),
        };
        let handle = self.handle.lock().unwrap();
        self.device.queue_submit(*handle, &submission)?;
        cb.state = CommandBufferState::Pending;
        Ok(())
    }

    /// Queues `image_index` of `swapchain` for presentation once `wait` is signaled.
    ///
    /// Returns `Ok(true)` if the swapchain is suboptimal.
    pub fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: &Semaphore,
    ) -> VkResult<bool> {
        let handle = self.handle.lock().unwrap();
        self.device
            .queue_present(*handle, swapchain, image_index, wait.vk_handle())
    }

    /// Blocks until every submission on this queue has completed.
    pub fn wait_idle(&self) -> VkResult<()> {
        let handle = self.handle.lock().unwrap();
        self.device.queue_wait_idle(*handle)
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(error) = self.wait_idle() {
            tracing::error!(?error, family_index = self.family_index, "Failed to drain queue");
        }
    }
}

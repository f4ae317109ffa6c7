//! GPU synchronization primitives.
//!
//! - [`Semaphore`]: a binary semaphore ordering one submission (or a present) after another,
//!   possibly across queues. Each signal is consumed by exactly one wait.
//! - [`Fence`]: signaled by the GPU when a submission completes, observed from the host.
//!
//! Both are RAII wrappers over a [`Device`]; dropping them destroys the handle immediately, so
//! they must outlive any submission referencing them.

use std::{fmt::Debug, sync::Arc};

use ash::{prelude::VkResult, vk};

use crate::{Device, HasDevice, utils::AsVkHandle};

/// A binary semaphore.
pub struct Semaphore {
    device: Device,
    handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: Device) -> VkResult<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self { device, handle })
    }
}

impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.handle).finish()
    }
}

impl HasDevice for Semaphore {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> vk::Semaphore {
        self.handle
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

/// A fence for host-side waits on GPU completion.
///
/// ```
/// # use std::sync::Arc;
/// # use scoria::{Device, backend::mock::MockBackend, sync::Fence};
/// # let device = Device::new(Arc::new(MockBackend::new()));
/// let fence = Fence::new(device, true).unwrap();
/// assert!(fence.is_signaled().unwrap());
/// fence.reset().unwrap();
/// assert!(!fence.is_signaled().unwrap());
/// ```
pub struct Fence {
    device: Device,
    handle: vk::Fence,
}

impl Fence {
    /// Creates a fence. Frame slots create theirs signaled so that the first wait returns
    /// immediately.
    pub fn new(device: Device, signaled: bool) -> VkResult<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self { device, handle })
    }

    /// Blocks until the fence is signaled or `timeout` nanoseconds elapse.
    ///
    /// Returns `Err(vk::Result::TIMEOUT)` on timeout.
    pub fn wait(&self, timeout: u64) -> VkResult<()> {
        self.device.wait_for_fence(self.handle, timeout)
    }

    /// Returns the fence to the unsignaled state.
    ///
    /// The fence must not be referenced by a submission that has not completed yet.
    pub fn reset(&self) -> VkResult<()> {
        self.device.reset_fence(self.handle)
    }

    pub fn is_signaled(&self) -> VkResult<bool> {
        self.device.fence_status(self.handle)
    }

    /// Async version of [`wait`](Self::wait). The blocking wait runs on the `blocking` thread
    /// pool.
    pub async fn wait_async(self: &Arc<Self>, timeout: u64) -> VkResult<()> {
        if self.is_signaled()? {
            return Ok(());
        }
        let fence = self.clone();
        blocking::unblock(move || fence.wait(timeout)).await
    }
}

impl Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}

impl HasDevice for Fence {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl AsVkHandle for Fence {
    type Handle = vk::Fence;
    fn vk_handle(&self) -> vk::Fence {
        self.handle
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.device.destroy_fence(self.handle);
    }
}

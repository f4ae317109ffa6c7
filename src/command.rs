//! # Command Recording
//!
//! Command buffers are allocated from a [`CommandPool`], recorded through a
//! [`CommandEncoder`] and submitted with [`Queue::submit`](crate::Queue::submit).
//!
//! ## Key Concepts
//! - Queue family: command buffers are bound to the family of the pool that allocated them and
//!   may only be submitted to queues of that family.
//! - Pipeline barrier: orders a source stage before a destination stage within a submission,
//!   optionally transitioning an image layout. The encoder batches barriers and emits them as
//!   one `vkCmdPipelineBarrier2` right before the next command that needs them.
//! - Ownership transfer: a resource with exclusive sharing written on one family and read on
//!   another is released on the source queue and acquired on the destination queue. Both halves
//!   come from a single [`QueueTransfer`] so they always agree; a semaphore orders the release
//!   submission before the acquire submission.
//!
//! ## Example Usage
//!
//! ```
//! # use std::sync::Arc;
//! # use scoria::{Device, backend::mock::MockBackend, command::{CommandPool, CommandBufferState}};
//! # let device = Device::new(Arc::new(MockBackend::new()));
//! let mut pool = CommandPool::new(device, 0).unwrap();
//! let mut cmd = pool.alloc().unwrap();
//! pool.begin(&mut cmd).unwrap();
//! pool.record(&mut cmd, |encoder| {
//!     // Record your commands here
//! });
//! pool.finish(&mut cmd).unwrap();
//! assert_eq!(cmd.state(), CommandBufferState::Executable);
//! # pool.free(cmd);
//! ```

mod render;
mod transfer;

use std::sync::{Arc, atomic::AtomicBool};

use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    backend::BarrierBatch,
    sync::Fence,
    tracking::{Access, Barrier, BufferBarrier, ImageBarrier, MemoryBarrier, QueueTransfer},
    utils::AsVkHandle,
};
pub use render::*;

/// Records commands into a [`CommandBuffer`] while batching pipeline barriers.
///
/// Command encoders are only ever provided as an argument to the closure passed to
/// [`CommandPool::record`]. Barriers queued through [`image_barrier`](Self::image_barrier),
/// [`buffer_barrier`](Self::buffer_barrier), [`memory_barrier`](Self::memory_barrier) and the
/// ownership methods are emitted together when:
/// - [`emit_barriers()`](Self::emit_barriers) is called explicitly
/// - a transfer or render command is recorded
/// - the recording closure returns
pub struct CommandEncoder<'a> {
    buffer: &'a mut CommandBuffer,

    /// Accumulated global memory barrier emitted in the next barrier batch.
    pending_memory_barrier: MemoryBarrier,
    pending_image_barriers: SmallVec<[ImageBarrier; 4]>,
    pending_buffer_barriers: SmallVec<[BufferBarrier; 4]>,

    render_pass_state: RenderPassState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderPassState {
    OutsideRenderPass,
    InsideRenderPass {
        render_area: vk::Rect2D,
        /// Last pipeline bound inside this pass. Rebinding the same pipeline is skipped.
        pipeline: Option<vk::Pipeline>,
    },
}

impl CommandEncoder<'_> {
    /// Returns a reference to the underlying command buffer.
    pub fn buffer(&self) -> &CommandBuffer {
        self.buffer
    }

    /// Queue family of the command buffer being recorded.
    pub fn family_index(&self) -> u32 {
        self.buffer.pool.family_index
    }

    /// Emits all pending barriers as a single pipeline barrier command.
    ///
    /// No command is recorded when nothing is pending.
    pub fn emit_barriers(&mut self) {
        if !self.has_pending_barriers() {
            return;
        }
        assert!(
            !self.inside_renderpass(),
            "Pipeline barriers cannot be emitted inside a render pass"
        );

        let memory_barrier = std::mem::take(&mut self.pending_memory_barrier);
        self.buffer.pool.device.cmd_pipeline_barrier(
            self.buffer.buffer,
            &BarrierBatch {
                memory: (!memory_barrier.is_empty()).then_some(memory_barrier),
                buffers: &self.pending_buffer_barriers,
                images: &self.pending_image_barriers,
            },
        );
        self.pending_image_barriers.clear();
        self.pending_buffer_barriers.clear();
    }

    pub fn has_pending_barriers(&self) -> bool {
        !self.pending_memory_barrier.is_empty()
            || !self.pending_image_barriers.is_empty()
            || !self.pending_buffer_barriers.is_empty()
    }

    /// Adds a global memory barrier between pipeline stages.
    ///
    /// Everything in `before.stage` completes, and writes in `before.access` become visible to
    /// `after.access`, before any work in `after.stage` begins.
    pub fn memory_barrier(&mut self, before: Access, after: Access) {
        self.pending_memory_barrier |= MemoryBarrier {
            src: before,
            dst: after,
        };
    }

    /// Queues an image memory barrier, possibly with a layout transition.
    pub fn image_barrier(&mut self, barrier: ImageBarrier) {
        self.pending_image_barriers.push(barrier);
    }

    /// Queues a buffer memory barrier.
    pub fn buffer_barrier(&mut self, barrier: BufferBarrier) {
        self.pending_buffer_barriers.push(barrier);
    }

    fn barrier(&mut self, barrier: Barrier) {
        match barrier {
            Barrier::Buffer(barrier) => self.buffer_barrier(barrier),
            Barrier::Image(barrier) => self.image_barrier(barrier),
        }
    }

    /// Records the release half of `transfer`.
    ///
    /// Must be recorded on the queue family that last wrote the resource. The submission
    /// containing the release must signal the semaphore that the acquiring submission waits on
    /// at [`QueueTransfer::wait_stage`].
    pub fn release_ownership(&mut self, transfer: &QueueTransfer) {
        assert_eq!(
            self.family_index(),
            transfer.src_family,
            "Ownership must be released on the source queue family"
        );
        self.barrier(transfer.release());
    }

    /// Records the acquire half of `transfer` on the destination queue family.
    pub fn acquire_ownership(&mut self, transfer: &QueueTransfer) {
        assert_eq!(
            self.family_index(),
            transfer.dst_family,
            "Ownership must be acquired on the destination queue family"
        );
        self.barrier(transfer.acquire());
    }

    pub fn inside_renderpass(&self) -> bool {
        matches!(
            self.render_pass_state,
            RenderPassState::InsideRenderPass { .. }
        )
    }
}

impl HasDevice for CommandEncoder<'_> {
    fn device(&self) -> &Device {
        &self.buffer.pool.device
    }
}

/// Represents the current state of a command buffer in its lifecycle.
///
/// # State Transitions
///
/// ```text
/// Initial -> Recording -> Executable -> Pending -> Invalid -> Freed
///    |                                              |
///    +----------------<<<---------------- (reset) --+
/// ```
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum CommandBufferState {
    /// Newly allocated or reset, ready to begin.
    Initial,

    /// Currently being recorded with commands.
    Recording,

    /// Recording finished, ready for submission to a queue.
    Executable,

    /// Submitted to a queue and possibly executing on the GPU.
    Pending,

    /// Execution completed, can be reset or freed.
    Invalid,

    /// Returned to the command pool.
    Freed,
}

/// A primary command buffer.
///
/// # Lifecycle
///
/// 1. **Allocation**: Created by [`CommandPool::alloc`]
/// 2. **Begin**: Before recording, call [`CommandPool::begin`]
/// 3. **Recording**: Commands recorded via [`CommandPool::record()`]
/// 4. **Finish**: [`CommandPool::finish`] ends recording
/// 5. **Execution**: Submitted with [Queue::submit](crate::Queue::submit)
/// 6. **Completion**: The host confirms completion through a fence with
///    [`CommandBuffer::block_until_completion`], or through [`CommandBuffer::mark_completed`]
///    once a later submission that waited on this one has been observed complete.
/// 7. **Cleanup**: Either [reset](CommandPool::reset) for reuse or [free](CommandPool::free) it
///    back to the pool. Command buffers must not be dropped while pending.
pub struct CommandBuffer {
    /// Keeps the pool alive while command buffers allocated from it are outstanding.
    pool: Arc<CommandPoolInner>,

    pub(crate) buffer: vk::CommandBuffer,

    pub(crate) state: CommandBufferState,
}

impl AsVkHandle for CommandBuffer {
    type Handle = vk::CommandBuffer;

    fn vk_handle(&self) -> Self::Handle {
        self.buffer
    }
}

impl HasDevice for CommandBuffer {
    fn device(&self) -> &Device {
        &self.pool.device
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.buffer)
            .field("family_index", &self.pool.family_index)
            .field("state", &self.state)
            .finish()
    }
}

impl CommandBuffer {
    /// Returns the current state of the command buffer.
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Queue family this command buffer may be submitted to.
    pub fn family_index(&self) -> u32 {
        self.pool.family_index
    }

    /// Blocks until `fence`, which must have been passed to the submission of this command
    /// buffer, is signaled. The command buffer becomes [`Invalid`](CommandBufferState::Invalid).
    ///
    /// Multiple calls are fine; once completed, subsequent calls return immediately.
    pub fn block_until_completion(&mut self, fence: &Fence, timeout: u64) -> VkResult<()> {
        match self.state {
            CommandBufferState::Pending => (),
            CommandBufferState::Invalid => return Ok(()),
            _ => panic!("Command buffer must be recorded and submitted for execution first"),
        }
        fence.wait(timeout)?;
        self.state = CommandBufferState::Invalid;
        Ok(())
    }

    /// Transitions a pending command buffer to [`Invalid`](CommandBufferState::Invalid)
    /// without touching the device.
    ///
    /// # Safety
    ///
    /// The caller must have observed completion of this submission, or of a submission that
    /// waited on a semaphore it signaled.
    pub unsafe fn mark_completed(&mut self) {
        assert_eq!(
            self.state,
            CommandBufferState::Pending,
            "Only pending command buffers can complete"
        );
        self.state = CommandBufferState::Invalid;
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self
            .pool
            .command_pool_dropped
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            return;
        }
        match self.state {
            CommandBufferState::Pending => {
                tracing::error!(
                    "Dropping CommandBuffer {:?} without waiting for its completion",
                    self.buffer
                );
            }
            CommandBufferState::Freed => (),
            _ => {
                tracing::warn!(
                    "Dropping CommandBuffer {:?} without returning it to the CommandPool {:?}",
                    self.buffer,
                    self.pool.handle
                );
            }
        }
    }
}

/// A pool for allocating command buffers of one queue family.
///
/// # Thread Safety
///
/// Command pools are externally synchronized: allocation, recording, reset and free all take
/// `&mut self`. [`Queue`](crate::Queue) keeps one pool per worker thread so that workers never
/// contend. Command buffers can be moved between threads once recording has finished.
pub struct CommandPool {
    inner: Arc<CommandPoolInner>,
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        // Outstanding command buffers can no longer be freed; silence their drop warnings.
        self.inner
            .command_pool_dropped
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

impl AsVkHandle for CommandPool {
    type Handle = vk::CommandPool;

    fn vk_handle(&self) -> Self::Handle {
        self.inner.handle
    }
}

impl HasDevice for CommandPool {
    fn device(&self) -> &Device {
        &self.inner.device
    }
}

struct CommandPoolInner {
    device: Device,
    handle: vk::CommandPool,
    family_index: u32,
    command_pool_dropped: AtomicBool,
}

impl Drop for CommandPoolInner {
    fn drop(&mut self) {
        self.device.destroy_command_pool(self.handle);
    }
}

impl CommandPool {
    /// Creates a pool of single-use command buffers for a queue family.
    pub fn new(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT,
        )
    }

    /// Creates a pool whose command buffers can be individually [reset](Self::reset).
    pub fn new_resettable(device: Device, queue_family_index: u32) -> VkResult<Self> {
        Self::new_with_flags(
            device,
            queue_family_index,
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    fn new_with_flags(
        device: Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> VkResult<Self> {
        let handle = device.create_command_pool(queue_family_index, flags)?;
        Ok(Self {
            inner: Arc::new(CommandPoolInner {
                device,
                handle,
                family_index: queue_family_index,
                command_pool_dropped: AtomicBool::new(false),
            }),
        })
    }

    pub fn family_index(&self) -> u32 {
        self.inner.family_index
    }

    /// Record commands using the provided [`CommandEncoder`]. Barriers still pending when the
    /// closure returns are emitted at the end.
    ///
    /// This method is defined on the CommandPool to ensure that the caller has a mutable
    /// reference to the pool.
    pub fn record<T>(
        &mut self,
        command_buffer: &mut CommandBuffer,
        callback: impl FnOnce(&mut CommandEncoder) -> T,
    ) -> T {
        assert_eq!(
            command_buffer.state,
            CommandBufferState::Recording,
            "Must call CommandPool::begin before recording a command buffer"
        );
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer recorded on the wrong pool!"
        );

        let mut encoder = CommandEncoder {
            buffer: command_buffer,
            pending_memory_barrier: MemoryBarrier::default(),
            pending_image_barriers: SmallVec::new(),
            pending_buffer_barriers: SmallVec::new(),
            render_pass_state: RenderPassState::OutsideRenderPass,
        };
        let result = (callback)(&mut encoder);
        assert!(
            !encoder.inside_renderpass(),
            "Render pass was not ended before recording finished"
        );
        encoder.emit_barriers();
        result
    }

    /// Allocate a new command buffer from the pool.
    pub fn alloc(&mut self) -> VkResult<CommandBuffer> {
        let buffer = self.inner.device.allocate_command_buffer(self.inner.handle)?;
        Ok(CommandBuffer {
            pool: self.inner.clone(),
            buffer,
            state: CommandBufferState::Initial,
        })
    }

    /// Begin recording a command buffer. Must be called before calling [`CommandPool::record`].
    pub fn begin(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert_eq!(
            cb.state,
            CommandBufferState::Initial,
            "Command buffer must be reset before it can be recorded again"
        );
        assert!(
            Arc::ptr_eq(&cb.pool, &self.inner),
            "Command buffer beginning on the wrong pool!"
        );
        self.device().begin_command_buffer(cb.buffer)?;
        cb.state = CommandBufferState::Recording;
        Ok(())
    }

    /// End recording on a command buffer. Must be called before submitting the command buffer.
    pub fn finish(&mut self, cb: &mut CommandBuffer) -> VkResult<()> {
        assert!(
            Arc::ptr_eq(&cb.pool, &self.inner),
            "Command buffer finished on the wrong pool!"
        );
        assert_eq!(
            cb.state,
            CommandBufferState::Recording,
            "Command buffer is not being recorded"
        );
        self.device().end_command_buffer(cb.buffer)?;
        cb.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Returns a command buffer to the pool.
    pub fn free(&mut self, mut command_buffer: CommandBuffer) {
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer returned to the wrong pool!"
        );
        assert_ne!(
            command_buffer.state,
            CommandBufferState::Pending,
            "Command buffer is still being executed!"
        );
        self.device()
            .free_command_buffer(self.inner.handle, command_buffer.buffer);
        command_buffer.state = CommandBufferState::Freed;
    }

    /// Resets a command buffer. The command pool must be created with
    /// [`CommandPool::new_resettable`].
    pub fn reset(&mut self, command_buffer: &mut CommandBuffer) -> VkResult<()> {
        assert!(
            Arc::ptr_eq(&command_buffer.pool, &self.inner),
            "Command buffer resetting on the wrong pool!"
        );
        assert_ne!(
            command_buffer.state,
            CommandBufferState::Pending,
            "Command buffer is still being executed!"
        );
        self.device().reset_command_buffer(command_buffer.buffer)?;
        command_buffer.state = CommandBufferState::Initial;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::{
        backend::{
            Backend,
            mock::{MockBackend, MockCommand},
        },
        tracking::TransferTarget,
    };

    fn pool(family: u32) -> (Arc<MockBackend>, CommandPool) {
        let mock = Arc::new(MockBackend::new());
        let pool = CommandPool::new_resettable(Device::new(mock.clone()), family).unwrap();
        (mock, pool)
    }

    fn commands(mock: &MockBackend, cb: &CommandBuffer) -> Vec<MockCommand> {
        let queue = mock.get_queue(cb.family_index(), 0);
        mock.queue_submit(
            queue,
            &crate::backend::Submission {
                command_buffer: cb.vk_handle(),
                wait: None,
                signal: None,
                fence: None,
            },
        )
        .unwrap();
        mock.complete_all();
        mock.submissions().pop().unwrap().commands
    }

    fn transfer() -> QueueTransfer {
        QueueTransfer {
            target: TransferTarget::Buffer {
                buffer: vk::Buffer::from_raw(42),
                size: 64,
            },
            src_family: 1,
            dst_family: 0,
            src: Access::COPY_WRITE,
            dst: Access::VERTEX_READ,
        }
    }

    #[test]
    fn test_state_transitions() {
        let (mock, mut pool) = pool(0);
        let mut cb = pool.alloc().unwrap();
        assert_eq!(cb.state(), CommandBufferState::Initial);
        pool.begin(&mut cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Recording);
        pool.record(&mut cb, |_| {});
        pool.finish(&mut cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Executable);
        pool.reset(&mut cb).unwrap();
        assert_eq!(cb.state(), CommandBufferState::Initial);
        pool.free(cb);
        assert_eq!(mock.live_command_buffers(), 0);
        assert!(mock.violations().is_empty());
    }

    #[test]
    #[should_panic(expected = "Must call CommandPool::begin")]
    fn test_record_requires_begin() {
        let (_mock, mut pool) = pool(0);
        let mut cb = pool.alloc().unwrap();
        pool.record(&mut cb, |_| {});
    }

    #[test]
    fn test_barriers_batched_into_one_command() {
        let (mock, mut pool) = pool(0);
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        pool.record(&mut cb, |encoder| {
            encoder.memory_barrier(Access::COPY_WRITE, Access::VERTEX_READ);
            encoder.buffer_barrier(BufferBarrier {
                buffer: vk::Buffer::from_raw(1),
                offset: 0,
                size: vk::WHOLE_SIZE,
                src: Access::COPY_WRITE,
                dst: Access::INDEX_READ,
                src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
            });
            assert!(encoder.has_pending_barriers());
            encoder.emit_barriers();
            assert!(!encoder.has_pending_barriers());
            // Nothing pending: no command.
            encoder.emit_barriers();
        });
        pool.finish(&mut cb).unwrap();
        let commands = commands(&mock, &cb);
        assert_eq!(commands.len(), 1);
        let MockCommand::Barrier {
            memory, buffers, ..
        } = &commands[0]
        else {
            panic!("expected a barrier");
        };
        assert!(memory.is_some());
        assert_eq!(buffers.len(), 1);
        pool.free(cb);
    }

    #[test]
    fn test_release_on_source_family() {
        let (mock, mut pool) = pool(1);
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        pool.record(&mut cb, |encoder| encoder.release_ownership(&transfer()));
        pool.finish(&mut cb).unwrap();
        let commands = commands(&mock, &cb);
        let MockCommand::Barrier { buffers, .. } = &commands[0] else {
            panic!("expected a barrier");
        };
        assert_eq!(buffers[0].src_queue_family, 1);
        assert_eq!(buffers[0].dst_queue_family, 0);
        pool.free(cb);
    }

    #[test]
    #[should_panic(expected = "destination queue family")]
    fn test_acquire_on_wrong_family_panics() {
        let (_mock, mut pool) = pool(1);
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        pool.record(&mut cb, |encoder| encoder.acquire_ownership(&transfer()));
    }
}

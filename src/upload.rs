//! The upload protocol.
//!
//! Every streamed resource reaches the GPU through the same one-shot pipeline, run entirely on
//! a worker thread:
//!
//! 1. [`stage`](UploadContext::stage) copies the CPU payload into a host-visible staging buffer.
//! 2. The caller allocates the device-local destination.
//! 3. [`submit_release`](UploadContext::submit_release) records the copy on the transfer
//!    queue followed by the release half of every [`QueueTransfer`], and submits it signaling a
//!    semaphore.
//! 4. [`submit_acquire`](UploadContext::submit_acquire) records the matching acquires on the
//!    graphics queue, plus any graphics-only work such as mip generation, and submits it waiting
//!    on that semaphore and signaling a fence.
//! 5. [`finalize`](UploadContext::finalize) blocks the worker on the fence, then returns both
//!    command buffers to the worker's pools and frees staging memory.
//!
//! The two submissions are kept as separate steps: the semaphore between them is the only
//! thing ordering the graphics queue's first use after the transfer queue's copy.

pub mod mesh;
pub mod texture;

use std::sync::Arc;

use ash::{prelude::VkResult, vk};

use crate::{
    Device, HasDevice, Queue,
    buffer::Buffer,
    command::{CommandBuffer, CommandEncoder},
    queue::SubmitInfo,
    sync::{Fence, Semaphore},
    tracking::{Access, QueueTransfer, TransferTarget},
};

/// The queues an upload runs on.
///
/// When both queues are the same family, ownership transfers degrade to plain barriers but the
/// two-submission structure is kept.
pub struct UploadContext {
    device: Device,
    transfer: Arc<Queue>,
    graphics: Arc<Queue>,
    fence_timeout: u64,
}

/// The transfer half of an upload, submitted and not yet known to be complete.
#[must_use = "a pending release must be followed by submit_acquire"]
pub struct PendingRelease {
    command_buffer: CommandBuffer,
    semaphore: Semaphore,
    staging: Buffer,
}

/// Both halves of an upload, submitted. Pass to [`UploadContext::finalize`].
#[must_use = "staging memory is only freed by finalize"]
pub struct PendingAcquire {
    release: PendingRelease,
    command_buffer: CommandBuffer,
    fence: Fence,
}

impl PendingRelease {
    /// Semaphore signaled by the transfer submission.
    pub fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }
}

impl PendingAcquire {
    pub fn fence(&self) -> &Fence {
        &self.fence
    }
}

impl HasDevice for UploadContext {
    fn device(&self) -> &Device {
        &self.device
    }
}

impl UploadContext {
    /// # Panics
    ///
    /// Panics if the queues come from different devices or have different worker counts.
    pub fn new(transfer: Arc<Queue>, graphics: Arc<Queue>, fence_timeout: u64) -> Self {
        assert_eq!(
            transfer.device(),
            graphics.device(),
            "Upload queues must belong to the same device"
        );
        assert_eq!(
            transfer.worker_count(),
            graphics.worker_count(),
            "Upload queues must have one transient pool per worker"
        );
        assert!(
            graphics.capabilities().contains(vk::QueueFlags::GRAPHICS),
            "The acquiring queue must support graphics"
        );
        Self {
            device: graphics.device().clone(),
            transfer,
            graphics,
            fence_timeout,
        }
    }

    pub fn transfer_queue(&self) -> &Arc<Queue> {
        &self.transfer
    }

    pub fn graphics_queue(&self) -> &Arc<Queue> {
        &self.graphics
    }

    pub fn worker_count(&self) -> usize {
        self.graphics.worker_count()
    }

    pub fn is_same_family(&self) -> bool {
        self.transfer.family_index() == self.graphics.family_index()
    }

    /// An ownership record moving `target` from the transfer family to the graphics family.
    /// `dst` is the access of the first use on the graphics queue.
    pub fn queue_transfer(&self, target: TransferTarget, src: Access, dst: Access) -> QueueTransfer {
        QueueTransfer {
            target,
            src_family: self.transfer.family_index(),
            dst_family: self.graphics.family_index(),
            src,
            dst,
        }
    }

    /// Allocates a staging buffer and writes `parts` into it back to back.
    pub fn stage(&self, parts: &[&[u8]]) -> VkResult<Buffer> {
        let size: usize = parts.iter().map(|part| part.len()).sum();
        let mut staging = Buffer::new_staging(
            self.device.clone(),
            size as vk::DeviceSize,
            vk::BufferUsageFlags::empty(),
        )?;
        let slice = staging
            .as_slice_mut()
            .expect("staging buffers are host visible");
        let mut offset = 0;
        for part in parts {
            slice[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        staging.flush(0, size as vk::DeviceSize)?;
        Ok(staging)
    }

    /// Records `record_copy` on the transfer queue, followed by the release half of every entry
    /// in `transfers`, and submits it signaling a fresh semaphore.
    ///
    /// Must run on worker `worker`; the command buffer comes from that worker's transient pool.
    pub fn submit_release(
        &self,
        worker: usize,
        staging: Buffer,
        transfers: &[QueueTransfer],
        record_copy: impl FnOnce(&mut CommandEncoder, &Buffer),
    ) -> VkResult<PendingRelease> {
        let semaphore = Semaphore::new(self.device.clone())?;
        let mut command_buffer = {
            let mut pool = self.transfer.transient_pool(worker);
            let mut command_buffer = pool.alloc()?;
            pool.begin(&mut command_buffer)?;
            pool.record(&mut command_buffer, |encoder| {
                record_copy(encoder, &staging);
                for transfer in transfers {
                    encoder.release_ownership(transfer);
                }
            });
            pool.finish(&mut command_buffer)?;
            command_buffer
        };
        self.transfer.submit(
            &mut command_buffer,
            SubmitInfo {
                signal: Some(&semaphore),
                ..Default::default()
            },
        )?;
        tracing::trace!(worker, transfers = transfers.len(), "Submitted upload release");
        Ok(PendingRelease {
            command_buffer,
            semaphore,
            staging,
        })
    }

    /// Records the acquire half of every entry in `transfers` on the graphics queue, then
    /// `record_tail`, and submits it waiting on the release semaphore.
    ///
    /// `transfers` must be the same records passed to [`submit_release`](Self::submit_release).
    /// The wait happens at the union of their first-use stages.
    pub fn submit_acquire(
        &self,
        worker: usize,
        release: PendingRelease,
        transfers: &[QueueTransfer],
        record_tail: impl FnOnce(&mut CommandEncoder),
    ) -> VkResult<PendingAcquire> {
        let fence = Fence::new(self.device.clone(), false)?;
        let wait_stage = transfers
            .iter()
            .fold(vk::PipelineStageFlags2::empty(), |stage, transfer| {
                stage | transfer.wait_stage()
            });
        let mut command_buffer = {
            let mut pool = self.graphics.transient_pool(worker);
            let mut command_buffer = pool.alloc()?;
            pool.begin(&mut command_buffer)?;
            pool.record(&mut command_buffer, |encoder| {
                for transfer in transfers {
                    encoder.acquire_ownership(transfer);
                }
                record_tail(encoder);
            });
            pool.finish(&mut command_buffer)?;
            command_buffer
        };
        self.graphics.submit(
            &mut command_buffer,
            SubmitInfo {
                wait: Some((&release.semaphore, wait_stage)),
                signal: None,
                fence: Some(&fence),
            },
        )?;
        tracing::trace!(worker, ?wait_stage, "Submitted upload acquire");
        Ok(PendingAcquire {
            release,
            command_buffer,
            fence,
        })
    }

    /// Blocks the calling worker until the acquire submission has completed, then frees staging
    /// memory, both command buffers and the synchronization objects.
    pub fn finalize(&self, worker: usize, pending: PendingAcquire) -> VkResult<()> {
        let PendingAcquire {
            release,
            mut command_buffer,
            fence,
        } = pending;
        command_buffer.block_until_completion(&fence, self.fence_timeout)?;
        let PendingRelease {
            command_buffer: mut release_buffer,
            semaphore,
            staging,
        } = release;
        // The acquire waited on the release semaphore, so the release has completed as well.
        unsafe { release_buffer.mark_completed() };
        self.transfer.transient_pool(worker).free(release_buffer);
        self.graphics.transient_pool(worker).free(command_buffer);
        drop(staging);
        drop(semaphore);
        drop(fence);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::mock::{MockBackend, MockCommand},
        utils::AsVkHandle,
    };

    pub(crate) fn context(mock: &Arc<MockBackend>, same_family: bool) -> UploadContext {
        let device = Device::new(mock.clone());
        let graphics = Arc::new(Queue::new(device.clone(), 0, 0, 2).unwrap());
        let transfer = if same_family {
            graphics.clone()
        } else {
            Arc::new(Queue::new(device, 1, 0, 2).unwrap())
        };
        UploadContext::new(transfer, graphics, u64::MAX)
    }

    fn upload_buffer(ctx: &UploadContext, payload: &[u8]) -> Buffer {
        let destination = Buffer::new_private(
            ctx.device().clone(),
            payload.len() as vk::DeviceSize,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        )
        .unwrap();
        let transfers = [ctx.queue_transfer(
            TransferTarget::Buffer {
                buffer: destination.vk_handle(),
                size: destination.size(),
            },
            Access::COPY_WRITE,
            Access::FRAGMENT_SAMPLED_READ,
        )];
        let staging = ctx.stage(&[payload]).unwrap();
        let release = ctx
            .submit_release(0, staging, &transfers, |encoder, staging| {
                encoder.copy_buffer_region(staging, 0, &destination, 0, staging.size());
            })
            .unwrap();
        let acquire = ctx.submit_acquire(0, release, &transfers, |_| {}).unwrap();
        ctx.finalize(0, acquire).unwrap();
        destination
    }

    #[test]
    fn test_stage_concatenates_parts() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let staging = ctx.stage(&[&[1, 2, 3], &[4, 5]]).unwrap();
        assert_eq!(
            mock.buffer_contents(staging.vk_handle()).unwrap(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn test_acquire_waits_on_the_copying_release() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let destination = upload_buffer(&ctx, &[7; 32]);
        assert_eq!(
            mock.buffer_contents(destination.vk_handle()).unwrap(),
            vec![7; 32]
        );

        let submissions = mock.submissions();
        let acquire = submissions
            .iter()
            .find(|s| s.family_index == 0)
            .expect("graphics submission");
        let wait = acquire.wait.expect("acquire waits on a semaphore");
        assert_eq!(wait.stage, vk::PipelineStageFlags2::FRAGMENT_SHADER);
        let signalers: Vec<_> = submissions
            .iter()
            .filter(|s| s.signal == Some(wait.semaphore))
            .collect();
        assert_eq!(signalers.len(), 1);
        assert_eq!(signalers[0].family_index, 1);
        assert!(signalers[0].id < acquire.id);
        assert!(
            signalers[0]
                .commands
                .iter()
                .any(|c| matches!(c, MockCommand::CopyBuffer { .. }))
        );
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_finalize_frees_everything_but_the_destination() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, false);
        let destination = upload_buffer(&ctx, &[1; 8]);
        assert_eq!(mock.live_buffers(), 1);
        assert_eq!(mock.live_command_buffers(), 0);
        assert_eq!(mock.live_semaphores(), 0);
        assert_eq!(mock.live_fences(), 0);
        drop(destination);
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }

    #[test]
    fn test_same_family_uses_plain_barriers() {
        let mock = Arc::new(MockBackend::new());
        let ctx = context(&mock, true);
        assert!(ctx.is_same_family());
        let _destination = upload_buffer(&ctx, &[5; 4]);
        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 2);
        assert!(submissions.iter().all(|s| s.family_index == 0));
        for submission in &submissions {
            for command in &submission.commands {
                if let MockCommand::Barrier { buffers, .. } = command {
                    assert!(
                        buffers
                            .iter()
                            .all(|b| b.src_queue_family == vk::QUEUE_FAMILY_IGNORED)
                    );
                }
            }
        }
        assert!(mock.violations().is_empty(), "{:?}", mock.violations());
    }
}

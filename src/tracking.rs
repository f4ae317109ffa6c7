//! Access descriptions and barrier records.
//!
//! An [`Access`] describes **when** ([`vk::PipelineStageFlags2`]) and **how**
//! ([`vk::AccessFlags2`]) a resource is touched. Barriers pair a source and a destination
//! access, optionally with an image layout transition and a queue-family hand-off.
//!
//! Cross-queue resources are described by a [`QueueTransfer`], which derives both halves of the
//! ownership transfer from one record so the release and the acquire can never disagree on
//! queue families or layouts.

use std::ops::{BitOr, BitOrAssign};

use ash::vk;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    /// End of the pipeline with no memory access. Destination of a queue-family release.
    pub const BOTTOM_OF_PIPE: Access = Access {
        stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
        access: vk::AccessFlags2::NONE,
    };
    pub const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_INPUT,
        access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    };
    pub const INDEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::INDEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
    };
    pub const VERTEX_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const FRAGMENT_SAMPLED_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_SAMPLED_READ,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const BLIT_DST: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const BLIT_SRC: Access = Access {
        stage: vk::PipelineStageFlags2::BLIT,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };

    /// The same stages with the memory access dropped.
    pub fn execution_only(self) -> Self {
        Self {
            stage: self.stage,
            access: vk::AccessFlags2::NONE,
        }
    }
}

/// A global memory barrier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl BitOr for MemoryBarrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            src: self.src | rhs.src,
            dst: self.dst | rhs.dst,
        }
    }
}
impl BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        self.src |= rhs.src;
        self.dst |= rhs.dst;
    }
}
impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src.stage.is_empty() && self.dst.stage.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src: Access,
    pub dst: Access,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub src: Access,
    pub dst: Access,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
}

/// The resource half of a [`QueueTransfer`].
#[derive(Debug, Clone, Copy)]
pub enum TransferTarget {
    Buffer {
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    },
    /// Across families, release and acquire carry identical layouts and the transition executes
    /// once, between them. Within one family the release transitions and the acquire keeps the
    /// layout.
    Image {
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
}

// `vk::ImageSubresourceRange` implements neither `PartialEq` nor `Eq`, so these are the
// field-wise impls the derives would produce.
fn range_eq(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask
        && a.base_mip_level == b.base_mip_level
        && a.level_count == b.level_count
        && a.base_array_layer == b.base_array_layer
        && a.layer_count == b.layer_count
}

impl PartialEq for ImageBarrier {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && range_eq(&self.range, &other.range)
            && self.src == other.src
            && self.dst == other.dst
            && self.old_layout == other.old_layout
            && self.new_layout == other.new_layout
            && self.src_queue_family == other.src_queue_family
            && self.dst_queue_family == other.dst_queue_family
    }
}
impl Eq for ImageBarrier {}

impl PartialEq for TransferTarget {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                TransferTarget::Buffer { buffer: a, size: sa },
                TransferTarget::Buffer { buffer: b, size: sb },
            ) => a == b && sa == sb,
            (
                TransferTarget::Image { image: a, range: ra, old_layout: oa, new_layout: na },
                TransferTarget::Image { image: b, range: rb, old_layout: ob, new_layout: nb },
            ) => a == b && range_eq(ra, rb) && oa == ob && na == nb,
            _ => false,
        }
    }
}
impl Eq for TransferTarget {}

/// Ownership record for one resource moving from the queue family that wrote it to the queue
/// family that reads it next.
///
/// The release half is recorded on the source queue:
/// `src` → [`Access::BOTTOM_OF_PIPE`], performing no synchronization on that side beyond the
/// hand-off. The acquire half is recorded on the destination queue and makes the resource
/// available at `dst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTransfer {
    pub target: TransferTarget,
    pub src_family: u32,
    pub dst_family: u32,
    /// Access of the last write on the source queue.
    pub src: Access,
    /// Access of the first use on the destination queue.
    pub dst: Access,
}

pub enum Barrier {
    Buffer(BufferBarrier),
    Image(ImageBarrier),
}

impl QueueTransfer {
    /// When both queues share a family no ownership moves; the barriers degrade to plain ones.
    pub fn is_same_family(&self) -> bool {
        self.src_family == self.dst_family
    }

    fn families(&self) -> (u32, u32) {
        if self.is_same_family() {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (self.src_family, self.dst_family)
        }
    }

    /// Stage the destination queue must wait at before the acquire may run.
    pub fn wait_stage(&self) -> vk::PipelineStageFlags2 {
        self.dst.stage
    }

    pub fn release(&self) -> Barrier {
        self.barrier(self.src, Access::BOTTOM_OF_PIPE)
    }

    /// The source scope is the destination stage with no access, so the acquire chains onto the
    /// semaphore wait at that stage.
    pub fn acquire(&self) -> Barrier {
        let mut barrier = self.barrier(self.dst.execution_only(), self.dst);
        // Plain barriers each transition on their own; the release already did.
        if let (true, Barrier::Image(image)) = (self.is_same_family(), &mut barrier) {
            image.old_layout = image.new_layout;
        }
        barrier
    }

    fn barrier(&self, src: Access, dst: Access) -> Barrier {
        let (src_queue_family, dst_queue_family) = self.families();
        match self.target {
            TransferTarget::Buffer { buffer, size } => Barrier::Buffer(BufferBarrier {
                buffer,
                offset: 0,
                size,
                src,
                dst,
                src_queue_family,
                dst_queue_family,
            }),
            TransferTarget::Image {
                image,
                range,
                old_layout,
                new_layout,
            } => Barrier::Image(ImageBarrier {
                image,
                range,
                src,
                dst,
                old_layout,
                new_layout,
                src_queue_family,
                dst_queue_family,
            }),
        }
    }
}

//! # Scoria
//!
//! Background streaming of GPU resources, and frame pacing for the render loop that uses them.
//!
//! Meshes and textures are uploaded on worker threads through a dedicated transfer queue.
//! Ownership of each finished resource is handed to the graphics queue with a release/acquire
//! barrier pair, and the render thread only ever sees a resource once that handoff is complete.
//!
//! ## Quick Start
//!
//! ```
//! # use std::sync::Arc;
//! use scoria::{Device, Renderer, RendererConfig, ash::vk, backend::mock::MockBackend};
//! use scoria::renderer::RendererCreateInfo;
//!
//! let mock = Arc::new(MockBackend::new());
//! let swapchain = mock.create_swapchain(3);
//! let mut renderer = Renderer::new(Device::new(mock), RendererCreateInfo {
//!     graphics_family: 0,
//!     transfer_family: 1,
//!     swapchain,
//!     extent: vk::Extent2D { width: 800, height: 600 },
//!     config: RendererConfig::default(),
//! }).unwrap();
//!
//! let texture = renderer.request_texture("albedo.png", vk::Format::R8G8B8A8_SRGB);
//! let frame = renderer.acquire_frame().unwrap();
//! renderer.record(&frame, |_encoder| {
//!     // Draw with `texture.or_fallback(..)` until it is ready.
//! });
//! renderer.present_frame(frame, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT).unwrap();
//! ```
//!
//! ## Overview
//!
//! - [`Async`] - A resource that becomes readable once its upload completes. Polling never blocks.
//! - [`Queue`] - Serializes submissions and hands each recording thread its own command pools.
//! - [`Streamer`](streamer::Streamer) - Runs uploads on a [`Scheduler`](scheduler::Scheduler).
//! - [`FramePager`](frame::FramePager) - Keeps at most `frames_in_flight` frames on the GPU.
//!
//! Everything talks to the GPU through a [`Backend`](backend::Backend). The Vulkan backend
//! drives a real device; the [mock backend](backend::mock) executes commands on the CPU and
//! records synchronization mistakes, which is what the tests run against.

pub mod backend;
pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod frame;
mod future;
pub mod image;
mod queue;
pub mod renderer;
pub mod resource;
pub mod scheduler;
pub mod streamer;
pub mod sync;
pub mod tracking;
pub mod upload;
pub mod utils;

pub use config::RendererConfig;
pub use device::{Device, HasDevice};
pub use error::{Error, Result};
pub use future::{Async, Promise};
pub use queue::{Queue, SubmitInfo};
pub use renderer::Renderer;
pub use resource::{Mesh, Texture};

pub use ash;

pub mod prelude {
    pub use crate::{
        Async, Device, HasDevice, Mesh, Renderer, RendererConfig, Texture, ash,
        ash::vk,
        buffer::Buffer,
        command::{CommandBuffer, CommandEncoder},
        frame::{AcquiredFrame, PresentOutcome},
        image::Image,
        queue::Queue,
        tracking::Access,
        utils::AsVkHandle,
    };
}

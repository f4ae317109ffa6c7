//! Renderer configuration.

use serde::{Deserialize, Serialize};

use crate::scheduler::Priority;

/// Tunables for [`Renderer`](crate::Renderer) and its parts.
///
/// Every field has a default, so partial documents deserialize cleanly:
///
/// ```
/// # use scoria::RendererConfig;
/// let config: RendererConfig = serde_json::from_str(r#"{ "frames_in_flight": 3 }"#).unwrap();
/// assert_eq!(config.frames_in_flight, 3);
/// assert!(config.generate_mipmaps);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Number of frame slots. The render thread may run this many frames ahead of the GPU.
    pub frames_in_flight: usize,
    /// Worker thread count. `None` uses the available hardware concurrency.
    pub worker_threads: Option<usize>,
    /// Timeout applied to every CPU-side fence wait, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Timeout for swapchain image acquisition, in nanoseconds.
    pub acquire_timeout_ns: u64,
    pub generate_mipmaps: bool,
    pub upload_priority: Priority,
    /// RGBA8 texel of the 1x1 texture substituted for textures that failed to load.
    pub fallback_color: [u8; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            worker_threads: None,
            fence_timeout_ns: u64::MAX,
            acquire_timeout_ns: u64::MAX,
            generate_mipmaps: true,
            upload_priority: Priority::Normal,
            fallback_color: [255, 0, 255, 255],
        }
    }
}

impl RendererConfig {
    /// Resolved worker thread count.
    pub fn worker_count(&self) -> usize {
        self.worker_threads
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

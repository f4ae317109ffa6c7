//! Error types shared by the streaming core.
//!
//! Errors fall into three groups. Content errors come from the asset itself and degrade to a
//! null resource. Device errors come from the driver; background tasks cannot report them to
//! anyone, so they end the process through [`fatal`]. Contract violations are asserted at the
//! call site and never reach this type.

use ash::vk;

/// Errors produced while streaming resources or driving frames.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Vulkan error: {0:?}")]
    Vulkan(vk::Result),

    #[error("Device lost")]
    DeviceLost,

    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0:?}")]
    Image(#[from] image::ImageError),

    #[error("Unsupported texture format: {0:?}")]
    UnsupportedFormat(vk::Format),

    #[error("Mesh has no vertices or no indices")]
    EmptyMesh,
}

impl From<vk::Result> for Error {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Error::SwapchainOutOfDate,
            other => Error::Vulkan(other),
        }
    }
}

impl Error {
    /// Errors caused by a missing or malformed asset.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Image(_) | Error::UnsupportedFormat(_) | Error::EmptyMesh
        )
    }

    /// Errors reported by the driver. The engine has no degraded mode for these.
    pub fn is_device_error(&self) -> bool {
        matches!(self, Error::Vulkan(_) | Error::DeviceLost)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Logs `error` and aborts the process.
///
/// Used by background tasks, which run detached from any caller and cannot unwind GPU state.
#[cold]
pub fn fatal(error: impl Into<Error>) -> ! {
    let error = error.into();
    tracing::error!(%error, "Fatal device error, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_lost_is_distinct() {
        let err = Error::from(vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, Error::DeviceLost));
        assert!(err.is_device_error());
        assert!(!err.is_content_error());

        let err = Error::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(
            err,
            Error::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }

    #[test]
    fn test_out_of_date_maps_to_swapchain_error() {
        let err = Error::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, Error::SwapchainOutOfDate));
        assert!(!err.is_device_error());
    }

    #[test]
    fn test_missing_file_is_content_error() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(err.is_content_error());
        assert!(Error::UnsupportedFormat(vk::Format::BC7_SRGB_BLOCK).is_content_error());
    }
}

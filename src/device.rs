//! The device handle shared by every component.
//!
//! A [`Device`] is a cheaply cloneable, context-owned dispatch table. Components receive it
//! explicitly at construction instead of reaching for process-wide function pointers, which is
//! what lets the whole core run against [`MockBackend`](crate::backend::mock::MockBackend).
//!
//! ```
//! # use std::sync::Arc;
//! use scoria::{Device, backend::mock::MockBackend};
//! let backend = Arc::new(MockBackend::new());
//! let device = Device::new(backend.clone());
//! let queue = device.get_queue(0, 0);
//! # let _ = queue;
//! ```

use std::{fmt::Debug, ops::Deref, sync::Arc};

use crate::backend::Backend;

/// A trait for types created from a [`Device`].
pub trait HasDevice {
    /// Returns a reference to the device.
    fn device(&self) -> &Device;
}

/// Reference-counted handle to a [`Backend`].
///
/// Dereferences to the backend, so driver calls read as `device.create_fence(..)`.
#[derive(Clone)]
pub struct Device(Arc<dyn Backend>);

impl Device {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self(backend)
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.0
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Device")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

impl Deref for Device {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl HasDevice for Device {
    fn device(&self) -> &Device {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn test_device_identity() {
        let backend = Arc::new(MockBackend::new());
        let a = Device::new(backend.clone());
        let b = a.clone();
        let c = Device::new(Arc::new(MockBackend::new()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

//! Single-assignment futures connecting background tasks to the render thread.
//!
//! A request returns an [`Async<T>`] right away; the task producing the value holds the
//! matching [`Promise<T>`]. The render thread can poll [`Async::is_ready`] every frame without
//! blocking and dereference once it returns `true`.
//!
//! ```
//! use scoria::Async;
//!
//! let (handle, promise) = Async::<i32>::pending();
//! assert!(handle.valid());
//! assert!(!handle.is_ready());
//! std::thread::spawn(move || promise.fulfill(42));
//! assert_eq!(*handle.get(), 42);
//! assert!(handle.is_ready());
//! ```

use std::{
    fmt::Debug,
    ops::Deref,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use event_listener::{Event, Listener};

struct Shared<T> {
    value: OnceLock<T>,
    /// Set when the promise was dropped without a value.
    abandoned: AtomicBool,
    event: Event,
}

impl<T> Shared<T> {
    fn is_settled(&self) -> bool {
        self.value.get().is_some() || self.abandoned.load(Ordering::Acquire)
    }
}

/// A value produced once, possibly on another thread.
///
/// The value is stored in place: every [`get`](Self::get) returns a reference to the same
/// object, and once [`is_ready`](Self::is_ready) returns `true` it keeps returning `true`.
///
/// An `Async` owns its value. Dropping it before the producer finishes is allowed; the value is
/// then dropped by whichever side lets go last.
///
/// A default-constructed `Async` is *invalid*: it has no producer and never becomes ready.
/// Check [`valid`](Self::valid) before dereferencing handles that may be empty.
pub struct Async<T> {
    shared: Option<Arc<Shared<T>>>,
}

/// The producing half of an [`Async`].
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Async<T> {
    /// Creates a handle and the promise that will complete it.
    pub fn pending() -> (Self, Promise<T>) {
        let shared = Arc::new(Shared {
            value: OnceLock::new(),
            abandoned: AtomicBool::new(false),
            event: Event::new(),
        });
        (
            Self {
                shared: Some(shared.clone()),
            },
            Promise { shared },
        )
    }

    /// An already-resolved handle.
    pub fn ready(value: T) -> Self {
        let (handle, promise) = Self::pending();
        promise.fulfill(value);
        handle
    }

    /// `false` only for a default-constructed handle.
    pub fn valid(&self) -> bool {
        self.shared.is_some()
    }

    /// Returns `true` if the value is available. Never blocks.
    pub fn is_ready(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| shared.value.get().is_some())
    }

    /// Returns the value, blocking the calling thread until it is produced.
    ///
    /// # Panics
    ///
    /// Panics if the handle is invalid, or if the producer was dropped without a value.
    pub fn get(&self) -> &T {
        let shared = self
            .shared
            .as_ref()
            .expect("Dereferenced an invalid Async; check valid() first");
        loop {
            if let Some(value) = shared.value.get() {
                return value;
            }
            assert!(
                !shared.abandoned.load(Ordering::Acquire),
                "The task producing this Async was dropped without a value"
            );
            let listener = shared.event.listen();
            if shared.is_settled() {
                continue;
            }
            listener.wait();
        }
    }

    /// Returns the value if it is available.
    pub fn try_get(&self) -> Option<&T> {
        self.shared.as_ref().and_then(|shared| shared.value.get())
    }

    /// Resolves once the value is available, without blocking a thread.
    ///
    /// # Panics
    ///
    /// Same conditions as [`get`](Self::get).
    pub async fn wait_ready(&self) -> &T {
        let shared = self
            .shared
            .as_ref()
            .expect("Awaited an invalid Async; check valid() first");
        loop {
            if let Some(value) = shared.value.get() {
                return value;
            }
            assert!(
                !shared.abandoned.load(Ordering::Acquire),
                "The task producing this Async was dropped without a value"
            );
            let listener = shared.event.listen();
            if shared.is_settled() {
                continue;
            }
            listener.await;
        }
    }

    /// Takes the value out, blocking until it is produced.
    pub fn into_inner(self) -> T {
        self.get();
        let mut shared = self
            .shared
            .expect("Dereferenced an invalid Async; check valid() first");
        // The promise may still hold its reference for a moment after publishing.
        loop {
            match Arc::try_unwrap(shared) {
                Ok(shared) => {
                    return shared
                        .value
                        .into_inner()
                        .expect("value was observed above");
                }
                Err(still_shared) => {
                    shared = still_shared;
                    std::thread::yield_now();
                }
            }
        }
    }
}

impl<T> Default for Async<T> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<T> Deref for Async<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
    }
}

impl<T: Debug> Debug for Async<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.shared {
            None => f.write_str("Async(<invalid>)"),
            Some(shared) => match shared.value.get() {
                Some(value) => f.debug_tuple("Async").field(value).finish(),
                None => f.write_str("Async(<pending>)"),
            },
        }
    }
}

impl<T> Promise<T> {
    /// Publishes the value and wakes every waiter.
    pub fn fulfill(self, value: T) {
        if self.shared.value.set(value).is_err() {
            unreachable!("a promise is fulfilled at most once");
        }
        self.shared.event.notify(usize::MAX);
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if self.shared.value.get().is_none() {
            self.shared.abandoned.store(true, Ordering::Release);
            self.shared.event.notify(usize::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_get_returns_same_address() {
        let (handle, promise) = Async::pending();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            promise.fulfill(vec![1u32, 2, 3]);
        });
        let first: *const Vec<u32> = handle.get();
        for _ in 0..10 {
            assert!(std::ptr::eq(first, handle.get()));
            assert!(std::ptr::eq(first, &*handle));
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_readiness_is_monotonic() {
        let (handle, promise) = Async::<&str>::pending();
        assert!(!handle.is_ready());
        promise.fulfill("done");
        for _ in 0..100 {
            assert!(handle.is_ready());
        }
    }

    #[test]
    fn test_concurrent_getters_observe_one_value() {
        let (handle, promise) = Async::<String>::pending();
        let handle = Arc::new(handle);
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                std::thread::spawn(move || handle.get() as *const String as usize)
            })
            .collect();
        promise.fulfill(String::from("mesh"));
        let addresses: Vec<usize> = readers.into_iter().map(|r| r.join().unwrap()).collect();
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_invalid_handle() {
        let handle = Async::<u32>::default();
        assert!(!handle.valid());
        assert!(!handle.is_ready());
        assert!(handle.try_get().is_none());
    }

    #[test]
    #[should_panic(expected = "invalid Async")]
    fn test_get_on_invalid_panics() {
        Async::<u32>::default().get();
    }

    #[test]
    #[should_panic(expected = "dropped without a value")]
    fn test_abandoned_promise_panics_waiter() {
        let (handle, promise) = Async::<u32>::pending();
        drop(promise);
        handle.get();
    }

    #[test]
    fn test_wait_ready_and_into_inner() {
        let (handle, promise) = Async::pending();
        std::thread::spawn(move || promise.fulfill(7u64));
        assert_eq!(*pollster::block_on(handle.wait_ready()), 7);
        assert_eq!(handle.into_inner(), 7);
        assert_eq!(Async::ready(3).into_inner(), 3);
    }
}

//! # Guarded shared state
//!
//! Every piece of mutable state shared between tasks (the cache index, the memory
//! tier, the in-flight registry, pool queues) lives inside a [`GuardedState`].
//! Access is closure-scoped so a guard can never escape or be held across an
//! `.await`.

use parking_lot::RwLock;

/// Reader/writer protected value with closure-scoped access.
///
/// `read` calls may overlap each other; `write` is exclusive against both.
/// Closures must stay short and must not block on I/O.
#[derive(Debug, Default)]
pub struct GuardedState<T> {
    inner: RwLock<T>,
}

impl<T> GuardedState<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    /// Run `f` with shared access to the value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.read();
        f(&guard)
    }

    /// Run `f` with exclusive access to the value.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.write();
        f(&mut guard)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

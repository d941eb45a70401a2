//! See [`Runtime`].

use std::future::Future;

/// Handle to the async runtime which drives the UDP IO and simulation tasks.
///
/// Backends and clients need a `tokio` runtime to run their socket loops on.
/// Use the [`Default`] impl to create (and leak) a fresh multi-threaded
/// runtime, or `Runtime::from(handle)` to piggyback on a runtime you already
/// own.
#[derive(Debug, Clone)]
pub struct Runtime {
    handle: tokio::runtime::Handle,
}

impl Default for Runtime {
    fn default() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to create tokio runtime");
        let runtime = Box::leak(Box::new(runtime));
        Self {
            handle: runtime.handle().clone(),
        }
    }
}

impl From<tokio::runtime::Handle> for Runtime {
    fn from(value: tokio::runtime::Handle) -> Self {
        Self { handle: value }
    }
}

impl Runtime {
    /// Spawns a future on the runtime `self`.
    pub fn spawn_on_self<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(future);
    }

    /// Blocks the current (non-async) thread on `future`.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

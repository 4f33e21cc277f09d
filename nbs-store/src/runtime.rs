//! Shared runtime context.
//!
//! An explicit [`RuntimeContext`] is threaded into every constructor that
//! needs one, rather than reaching for a process-global runtime, so a
//! [`crate::store::NomsBlockStore`] has no hidden global state and multiple
//! stores (or tests) can each carry their own runtime without fighting over
//! a singleton.

use std::sync::Arc;

use tokio::runtime::{Handle, Runtime};

/// Handle to the async runtime a store's remote backends and async caches
/// run their futures on.
#[derive(Clone)]
pub struct RuntimeContext {
    handle: Handle,
    /// Keeps an owned runtime alive when one was constructed for us (e.g. in
    /// tests or a synchronous `main`); `None` when wrapping an existing
    /// runtime's handle.
    _owned: Option<Arc<Runtime>>,
}

impl RuntimeContext {
    /// Wrap the handle of an already-running runtime (the common case
    /// inside an async `main`).
    pub fn from_handle(handle: Handle) -> Self {
        RuntimeContext { handle, _owned: None }
    }

    /// Spin up a dedicated multi-threaded runtime and wrap it. Useful for
    /// synchronous entry points (CLI tools, tests) that still need to drive
    /// a remote [`crate::persister::ChunkSource`].
    pub fn new_owned() -> std::io::Result<Self> {
        let rt = Runtime::new()?;
        let handle = rt.handle().clone();
        Ok(RuntimeContext {
            handle,
            _owned: Some(Arc::new(rt)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `fut` to completion, blocking the current thread. Used by the
    /// synchronous [`crate::persister::ChunkSource`] trait methods to drive
    /// an async HTTP request.
    pub fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
    }
}

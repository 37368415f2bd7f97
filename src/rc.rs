//! Manual reference counting for costly shared resources.
//!
//! The pool hands out object files to several consumers at once and must not
//! close a descriptor while any of them still reads from it. Rust's `Arc`
//! alone cannot express this: the teardown is fallible, must run exactly
//! once, and callers need to release explicitly rather than rely on scope.
//!
//! [`Reference`] wraps a value together with a single-shot destructor.
//! Cloning a handle increments the shared count; releasing the last handle
//! runs the destructor synchronously in the releasing thread. A handle can
//! be released only once, and no new handle can be produced after the
//! destructor has run. Dropping a handle that was never released performs an
//! implicit release as a fail-safe against descriptor leaks.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RcError {
    /// This handle has already been released.
    #[error("reference already released")]
    Released,

    /// The destructor has already run; the resource cannot be revived.
    #[error("resource already closed")]
    AlreadyClosed,

    /// The destructor ran and reported a failure.
    #[error("failed to close resource: {0}")]
    Closer(#[source] anyhow::Error),
}

type Closer<T> = Box<dyn FnOnce(&T) -> anyhow::Result<()> + Send>;

struct ResourceState<T> {
    closed: bool,
    closer: Option<Closer<T>>,
}

/// The shared block behind one or more [`Reference`] handles.
struct Resource<T> {
    ref_count: AtomicI32,
    val: T,
    // The closer is deliberately not reachable through the value type; the
    // resource can only be destroyed by releasing references.
    state: Mutex<ResourceState<T>>,
}

impl<T> Resource<T> {
    fn close(&self) -> Result<(), RcError> {
        let mut state = self.state.lock().expect("resource state lock poisoned");
        let Some(closer) = state.closer.take() else {
            return Ok(());
        };
        state.closed = true;
        closer(&self.val).map_err(RcError::Closer)
    }
}

impl<T> Drop for Resource<T> {
    fn drop(&mut self) {
        // Fail-safe: a block reclaimed without ever having been closed still
        // runs its destructor so the underlying resource is not leaked.
        let closer = match self.state.get_mut() {
            Ok(state) => state.closer.take(),
            Err(_) => None,
        };
        if let Some(closer) = closer {
            if let Err(err) = closer(&self.val) {
                warn!("failed to close reclaimed resource: {err:#}");
            }
        }
    }
}

/// A handle to a shared, reference-counted resource.
///
/// All operations are safe to call from multiple threads. The destructor is
/// invoked at most once, synchronously, by whichever `release` drops the
/// count to zero.
pub struct Reference<T> {
    resource: Arc<Resource<T>>,
    released: AtomicBool,
}

impl<T> Reference<T> {
    /// Wrap `val` in a fresh resource block with a single handle.
    ///
    /// `closer` destroys the resource; it runs exactly once, when the last
    /// outstanding handle is released (or, as a fail-safe, when the block is
    /// reclaimed without anyone having released).
    pub fn new(val: T, closer: impl FnOnce(&T) -> anyhow::Result<()> + Send + 'static) -> Self {
        Self {
            resource: Arc::new(Resource {
                ref_count: AtomicI32::new(1),
                val,
                state: Mutex::new(ResourceState { closed: false, closer: Some(Box::new(closer)) }),
            }),
            released: AtomicBool::new(false),
        }
    }

    /// Produce another handle to the same resource.
    ///
    /// # Errors
    /// [`RcError::Released`] if this handle has been released;
    /// [`RcError::AlreadyClosed`] if the destructor has already run.
    pub fn try_clone(&self) -> Result<Self, RcError> {
        if self.released.load(Ordering::Acquire) {
            return Err(RcError::Released);
        }
        // The closed-check and the count bump must not interleave with a
        // destructor running on another thread.
        let state = self.resource.state.lock().expect("resource state lock poisoned");
        if state.closed {
            return Err(RcError::AlreadyClosed);
        }
        self.resource.ref_count.fetch_add(1, Ordering::AcqRel);
        drop(state);

        Ok(Self { resource: Arc::clone(&self.resource), released: AtomicBool::new(false) })
    }

    /// Give up this handle. The destructor runs if this was the last one;
    /// its error is reported to this caller.
    ///
    /// # Errors
    /// [`RcError::Released`] on a second release of the same handle;
    /// [`RcError::Closer`] if the destructor fired and failed.
    pub fn release(&self) -> Result<(), RcError> {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RcError::Released);
        }
        if self.resource.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            return self.resource.close();
        }
        Ok(())
    }

    /// Access the shared value.
    ///
    /// # Panics
    /// Panics if this handle was released or the resource is closed. Using a
    /// value past its release is a bug in the caller, not a recoverable
    /// condition.
    pub fn value(&self) -> &T {
        assert!(!self.released.load(Ordering::Acquire), "reference already released");
        {
            let state = self.resource.state.lock().expect("resource state lock poisoned");
            assert!(!state.closed, "resource already closed");
        }
        &self.resource.val
    }
}

impl<T> Drop for Reference<T> {
    fn drop(&mut self) {
        if self.released.load(Ordering::Acquire) {
            return;
        }
        debug!("reference dropped without explicit release");
        if let Err(err) = self.release() {
            warn!("implicit release of dropped reference failed: {err}");
        }
    }
}

impl<T> std::fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference").field("released", &self.released.load(Ordering::Acquire)).finish()
    }
}

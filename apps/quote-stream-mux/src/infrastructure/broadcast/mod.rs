//! Callback Fan-Out
//!
//! [`Stream`] is a typed pub/sub list of callbacks, one per feed. It
//! delivers every emitted value to every registered callback in
//! registration order and reports when its last subscriber leaves.
//!
//! # Guarantees
//!
//! - A callback is registered at most once (compared by `Arc` identity).
//! - A panicking callback is logged and skipped; later callbacks still run.
//! - The no-subscriber hook fires exactly once, on the 1 → 0 transition.
//! - After [`Stream::destroy`], emits are no-ops.
//!
//! Callbacks and the hook always run with the internal lock released, so
//! they may call back into the stream.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;

/// A subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Hook run when the subscriber count drops to zero.
pub type NoSubscriberHook = Box<dyn FnOnce() + Send>;

struct StreamState<T> {
    callbacks: Vec<Callback<T>>,
    on_no_subscriber: Option<NoSubscriberHook>,
    destroyed: bool,
}

/// Per-feed callback registry.
pub struct Stream<T> {
    state: Mutex<StreamState<T>>,
}

impl<T> Stream<T> {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState {
                callbacks: Vec::new(),
                on_no_subscriber: None,
                destroyed: false,
            }),
        }
    }

    /// Set the hook fired when the last subscriber leaves.
    ///
    /// Replaces any previous hook. Ignored on a destroyed stream.
    pub fn set_on_no_subscriber(&self, hook: NoSubscriberHook) {
        let mut state = self.state.lock();
        if !state.destroyed {
            state.on_no_subscriber = Some(hook);
        }
    }

    /// Register a callback.
    ///
    /// Returns `false` if it was already registered or the stream is
    /// destroyed.
    pub fn on_stream(&self, callback: Callback<T>) -> bool {
        let mut state = self.state.lock();
        if state.destroyed || state.callbacks.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            return false;
        }
        state.callbacks.push(callback);
        true
    }

    /// Remove a callback.
    ///
    /// Fires the no-subscriber hook if this removed the last one. Returns
    /// whether the callback was registered.
    pub fn off_stream(&self, callback: &Callback<T>) -> bool {
        let hook = {
            let mut state = self.state.lock();
            let Some(index) = state.callbacks.iter().position(|c| Arc::ptr_eq(c, callback))
            else {
                return false;
            };
            state.callbacks.remove(index);

            if state.callbacks.is_empty() {
                state.on_no_subscriber.take()
            } else {
                None
            }
        };

        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Deliver `value` to every callback in registration order.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn emit(&self, value: &T) -> usize {
        let callbacks = {
            let state = self.state.lock();
            if state.destroyed {
                return 0;
            }
            state.callbacks.clone()
        };

        let mut delivered = 0;
        for (index, callback) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(value))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    tracing::error!(index, reason = %reason, "Stream callback panicked");
                }
            }
        }
        delivered
    }

    /// Drop every callback and the hook; later emits do nothing.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.destroyed = true;
        state.callbacks.clear();
        state.on_no_subscriber = None;
    }

    /// Drop every callback without firing the hook.
    pub fn clear(&self) {
        self.state.lock().callbacks.clear();
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl<T> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Stream")
            .field("subscribers", &state.callbacks.len())
            .field("destroyed", &state.destroyed)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

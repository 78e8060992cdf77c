//! Listener lists for inbound messages and errors.
//!
//! Listeners are plain closures. A panicking listener is caught and logged
//! at the call site; it never unwinds into a handler or a background loop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::message::CrossSystemMessage;
use crate::CommError;

pub type MessageCallback = Arc<dyn Fn(&CrossSystemMessage) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&CommError) + Send + Sync>;

/// Append-only list of listeners of one kind.
pub struct Listeners<F: ?Sized> {
    inner: RwLock<Vec<Arc<F>>>,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Listeners<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<F>) {
        match self.inner.write() {
            Ok(mut list) => list.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current list, so listeners run without the lock held.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        match self.inner.read() {
            Ok(list) => list.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Call every listener through `call`, isolating panics.
    pub fn notify_with(&self, label: &str, call: impl Fn(&F)) {
        for listener in self.snapshot() {
            invoke_guarded(label, || call(listener.as_ref()));
        }
    }
}

/// Run a user callback, logging instead of propagating a panic.
///
/// Returns `false` if the callback panicked.
pub fn invoke_guarded(label: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("{label} callback panicked: {reason}");
            false
        }
    }
}

/// Message and error listeners attached to one handler.
#[derive(Default)]
pub struct HandlerCallbacks {
    pub messages: Listeners<dyn Fn(&CrossSystemMessage) + Send + Sync>,
    pub errors: Listeners<dyn Fn(&CommError) + Send + Sync>,
}

impl HandlerCallbacks {
    pub fn notify_message(&self, message: &CrossSystemMessage) {
        self.messages.notify_with("message", |cb| cb(message));
    }

    pub fn notify_error(&self, error: &CommError) {
        self.errors.notify_with("error", |cb| cb(error));
    }
}

//! Completion normalization for entrypoint calls.
//!
//! A call may throw, return a value, or return a [`Thenable`] that settles
//! later (or never). Every path ends in exactly one callback invocation;
//! continuations that fire after the first delivery, including after the
//! watchdog, are dropped.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::{EntryPoint, ScriptError, ScriptValue};

/// Receives the single completion of an entrypoint call.
pub type CompletionCallback = Box<dyn FnOnce(Result<Value, ScriptError>) + Send>;

struct CompletionGuard {
    name: String,
    callback: Mutex<Option<CompletionCallback>>,
    watchdog: Mutex<Option<AbortHandle>>,
}

impl CompletionGuard {
    fn new(name: &str, callback: CompletionCallback) -> Self {
        Self {
            name: name.to_string(),
            callback: Mutex::new(Some(callback)),
            watchdog: Mutex::new(None),
        }
    }

    /// Delivers `result` if nothing was delivered yet. Returns whether it was.
    fn deliver(&self, result: Result<Value, ScriptError>) -> bool {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(callback) = callback else {
            debug!(entrypoint = %self.name, "ignoring repeated completion");
            return false;
        };
        if let Some(watchdog) = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watchdog.abort();
        }
        callback(result);
        true
    }

    fn arm(&self, watchdog: AbortHandle) {
        *self.watchdog.lock().unwrap_or_else(PoisonError::into_inner) = Some(watchdog);
    }
}

/// Calls `entry` and delivers its outcome to `callback` exactly once.
///
/// Deferred results are bounded by `timeout`; when it elapses the callback
/// receives [`ScriptError::Timeout`]. Must be called within a tokio runtime.
pub fn invoke_with_callback(
    entry: &dyn EntryPoint,
    args: Vec<Value>,
    timeout: Duration,
    callback: CompletionCallback,
) {
    let guard = Arc::new(CompletionGuard::new(entry.name(), callback));

    match entry.call(args) {
        Err(error) => {
            guard.deliver(Err(error));
        }
        Ok(ScriptValue::Immediate(value)) => {
            guard.deliver(Ok(value));
        }
        Ok(ScriptValue::Deferred(thenable)) => {
            let watchdog = {
                let guard = Arc::clone(&guard);
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let name = guard.name.clone();
                    if guard.deliver(Err(ScriptError::timeout(&name, timeout))) {
                        warn!(
                            entrypoint = %name,
                            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                            "module call timed out"
                        );
                    }
                })
            };
            guard.arm(watchdog.abort_handle());

            let on_fulfilled = {
                let guard = Arc::clone(&guard);
                Box::new(move |value: Value| {
                    guard.deliver(Ok(value));
                })
            };
            let on_rejected = {
                let guard = Arc::clone(&guard);
                Box::new(move |message: String| {
                    let name = guard.name.clone();
                    guard.deliver(Err(ScriptError::exception(name, message)));
                })
            };
            thenable.then(on_fulfilled, on_rejected);
        }
    }
}

/// Await-style form of [`invoke_with_callback`].
///
/// # Errors
///
/// Returns the [`ScriptError`] the call produced, or
/// [`ScriptError::Timeout`] when a deferred result does not settle in time.
pub async fn invoke(
    entry: &dyn EntryPoint,
    args: Vec<Value>,
    timeout: Duration,
) -> Result<Value, ScriptError> {
    let (tx, rx) = oneshot::channel();
    invoke_with_callback(
        entry,
        args,
        timeout,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.await
        .unwrap_or_else(|_| Err(ScriptError::timeout(entry.name(), timeout)))
}

//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is created by the caller of `send_message` /
//! `publish_message` and cloned down through every nested call. Every
//! suspension point in the runtime selects on it, so cancelling unwinds all
//! linked work at its next await. Cancellation is one-way.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::{Result, RuntimeError};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    cancelled: bool,
    next_key: u64,
    /// Keyed so a child token can withdraw its callback when dropped.
    callbacks: BTreeMap<u64, Callback>,
    linked: Vec<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    signal: tokio_util::sync::CancellationToken,
    state: Mutex<State>,
    /// Parent token and the key of the callback that cancels this one.
    parent: Option<(Weak<Inner>, u64)>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add `callback`, or hand it back if already cancelled.
    fn add_callback(&self, callback: Callback) -> std::result::Result<u64, Callback> {
        let mut state = self.state();
        if state.cancelled {
            return Err(callback);
        }
        let key = state.next_key;
        state.next_key += 1;
        state.callbacks.insert(key, callback);
        Ok(key)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((parent, key)) = self.parent.take() {
            if let Some(parent) = parent.upgrade() {
                parent.state().callbacks.remove(&key);
            }
        }
    }
}

/// Shared cancel flag with callbacks and linked operations.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Cancel the token. Idempotent: callbacks run exactly once, on the
    /// first call, after every linked operation has been aborted.
    pub fn cancel(&self) {
        let (callbacks, linked) = {
            let mut state = self.state();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            (
                mem::take(&mut state.callbacks),
                mem::take(&mut state.linked),
            )
        };
        self.inner.signal.cancel();
        debug!(
            target: "runtime",
            callbacks = callbacks.len(),
            linked = linked.len(),
            "Cancellation token fired"
        );
        for handle in linked {
            handle.abort();
        }
        for callback in callbacks.into_values() {
            callback();
        }
    }

    /// Register a callback. Runs immediately if the token is already
    /// cancelled.
    pub fn register<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(callback) = self.inner.add_callback(Box::new(callback)) {
            callback();
        }
    }

    /// Link an in-flight task so a later `cancel` aborts it. Linking to an
    /// already cancelled token aborts right away.
    pub fn link(&self, handle: AbortHandle) {
        let mut state = self.state();
        if state.cancelled {
            drop(state);
            handle.abort();
            return;
        }
        state.linked.retain(|h| !h.is_finished());
        state.linked.push(handle);
    }

    pub fn link_task<T>(&self, task: &JoinHandle<T>) {
        self.link(task.abort_handle());
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await
    }

    /// Drive `fut` until it completes or the token fires, whichever is
    /// first. A token that is already cancelled fails fast without polling
    /// `fut` at all.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.inner.signal.cancelled() => Err(RuntimeError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Timeout: spawn a task that cancels the token after `after`.
    pub fn cancel_after(&self, after: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    debug!(target: "runtime", timeout_ms = after.as_millis() as u64, "Timeout elapsed");
                    token.cancel();
                }
            }
        })
    }

    /// A token that is cancelled together with `self` but can also be
    /// cancelled on its own without affecting `self`. Dropping the child
    /// releases its hold on `self`.
    pub fn child_token(&self) -> CancellationToken {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let child = weak.clone();
            let cancel_child: Callback = Box::new(move || {
                if let Some(inner) = child.upgrade() {
                    CancellationToken { inner }.cancel();
                }
            });
            let (cancelled, parent) = match self.inner.add_callback(cancel_child) {
                Ok(key) => (false, Some((Arc::downgrade(&self.inner), key))),
                Err(_) => (true, None),
            };
            let signal = tokio_util::sync::CancellationToken::new();
            if cancelled {
                signal.cancel();
            }
            Inner {
                signal,
                state: Mutex::new(State {
                    cancelled,
                    ..State::default()
                }),
                parent,
            }
        });
        CancellationToken { inner }
    }

    #[cfg(test)]
    fn callback_count(&self) -> usize {
        self.state().callbacks.len()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

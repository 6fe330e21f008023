//! A single-resolution value cell used for responses that are not ready yet.
//!
//! A [`Deferred`] starts pending and settles exactly once, either resolved with a
//! value or cancelled. Observers registered while pending run on the transition,
//! observers registered afterwards run immediately with the stored outcome.
//! Settling an already settled cell is a no-op that returns `false`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use tracing::trace;

type ResolveFn<T> = Box<dyn FnOnce(T) + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// Terminal outcome of a [`Deferred`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled<T> {
    Resolved(T),
    Cancelled,
}

enum State<T> {
    Pending { on_resolve: Vec<ResolveFn<T>>, on_cancel: Vec<CancelFn>, waiters: Vec<oneshot::Sender<Settled<T>>> },
    Resolved(T),
    Cancelled,
}

/// Shared handle to a single-resolution cell, clones refer to the same cell.
pub struct Deferred<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        let state = State::Pending { on_resolve: Vec::new(), on_cancel: Vec::new(), waiters: Vec::new() };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.lock(), State::Pending { .. })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.lock(), State::Resolved(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), State::Cancelled)
    }

    /// The resolved value, if any.
    pub fn value(&self) -> Option<T> {
        match &*self.lock() {
            State::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Resolves the cell. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        let (on_resolve, waiters) = {
            let mut state = self.lock();
            if !matches!(*state, State::Pending { .. }) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Resolved(value.clone())) {
                State::Pending { on_resolve, waiters, .. } => (on_resolve, waiters),
                _ => return false,
            }
        };

        trace!(observers = on_resolve.len(), waiters = waiters.len(), "deferred resolved");
        for observer in on_resolve {
            observer(value.clone());
        }
        for waiter in waiters {
            let _ = waiter.send(Settled::Resolved(value.clone()));
        }
        true
    }

    /// Cancels the cell. Returns `false` if it was already settled.
    pub fn cancel(&self) -> bool {
        let (on_cancel, waiters) = {
            let mut state = self.lock();
            if !matches!(*state, State::Pending { .. }) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Cancelled) {
                State::Pending { on_cancel, waiters, .. } => (on_cancel, waiters),
                _ => return false,
            }
        };

        trace!(observers = on_cancel.len(), waiters = waiters.len(), "deferred cancelled");
        for observer in on_cancel {
            observer();
        }
        for waiter in waiters {
            let _ = waiter.send(Settled::Cancelled);
        }
        true
    }

    pub fn on_resolve<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let resolved = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { on_resolve, .. } => {
                    on_resolve.push(Box::new(f));
                    return;
                }
                State::Resolved(value) => value.clone(),
                State::Cancelled => return,
            }
        };
        f(resolved);
    }

    pub fn on_cancel<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { on_cancel, .. } => {
                    on_cancel.push(Box::new(f));
                    return;
                }
                State::Resolved(_) => return,
                State::Cancelled => {}
            }
        }
        f();
    }

    /// Waits until the cell settles.
    pub async fn settled(&self) -> Settled<T> {
        let receiver = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending { waiters, .. } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                State::Resolved(value) => return Settled::Resolved(value.clone()),
                State::Cancelled => return Settled::Cancelled,
            }
        };
        receiver.await.unwrap_or(Settled::Cancelled)
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Pending { .. } => "pending",
            State::Resolved(_) => "resolved",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

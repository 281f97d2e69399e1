use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

mod future;

pub use future::{CancellableFuture, TaskFailure, TaskState};

type Callback = Box<dyn FnOnce() + Send>;

struct ScopeInner {
    requested: AtomicBool,
    callbacks: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
    children: Mutex<Vec<Weak<ScopeInner>>>,
}

/// Mark `inner` as cancelled and run its callbacks, then recurse into its
/// child scopes so their callbacks fire on the same thread. Returns whether
/// this call newly marked the scope.
fn fire(inner: &ScopeInner) -> bool {
    if inner.requested.swap(true, Ordering::SeqCst) {
        return false;
    }
    let callbacks: Vec<Callback> = {
        let mut guard = inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.drain().map(|(_, cb)| cb).collect()
    };
    for cb in callbacks {
        cb();
    }
    let children: Vec<Weak<ScopeInner>> = {
        let mut guard = inner
            .children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.drain(..).collect()
    };
    for child in children {
        if let Some(child) = child.upgrade() {
            fire(&child);
        }
    }
    true
}

/// Cooperative cancellation scope threaded through broker calls, downloads
/// and external tool invocations.
///
/// Cancellation only flips the underlying token and runs any registered
/// callbacks synchronously on the cancelling thread; it never forcibly stops
/// a running worker. Callbacks must be fast and non-blocking.
#[derive(Clone)]
pub struct CancelScope {
    token: CancellationToken,
    inner: Arc<ScopeInner>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            inner: Arc::new(ScopeInner {
                requested: AtomicBool::new(false),
                callbacks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A scope that is cancelled whenever this one is, callbacks included.
    /// Cancelling the child does not affect the parent. Callback propagation
    /// runs through live scopes only; a dropped intermediate scope breaks
    /// the chain for its descendants (their tokens still cancel).
    pub fn child(&self) -> CancelScope {
        let child = Self::with_token(self.token.child_token());
        {
            let mut guard = self
                .inner
                .children
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.push(Arc::downgrade(&child.inner));
        }
        // Cancellation may have raced the registration.
        if self.inner.requested.load(Ordering::SeqCst) || self.token.is_cancelled() {
            fire(&child.inner);
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once cancellation is requested on this scope or an ancestor.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Request cancellation. Returns whether this call newly requested it;
    /// repeated calls and calls after an ancestor already cancelled return
    /// false. The first effective call runs all registered callbacks before
    /// returning.
    pub fn cancel(&self) -> bool {
        let newly = !self.token.is_cancelled();
        if !fire(&self.inner) {
            return false;
        }
        self.token.cancel();
        newly
    }

    /// Register a callback invoked synchronously at the moment of
    /// cancellation (for example, aborting a network connection). If the
    /// scope is already cancelled the callback runs immediately. The
    /// returned registration unregisters on drop.
    pub fn on_cancelled<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_cancelled() {
            callback();
            return CancelRegistration { owner: None, id: 0 };
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut guard = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.insert(id, Box::new(callback));
        }
        // Cancellation may have raced the insert; run the callback now if so.
        if self.inner.requested.load(Ordering::SeqCst) {
            let cb = {
                let mut guard = self
                    .inner
                    .callbacks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.remove(&id)
            };
            if let Some(cb) = cb {
                cb();
            }
            return CancelRegistration { owner: None, id: 0 };
        }
        CancelRegistration {
            owner: Some(self.inner.clone()),
            id,
        }
    }
}

/// Disposable handle for a cancellation callback registration.
pub struct CancelRegistration {
    owner: Option<Arc<ScopeInner>>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            let mut guard = owner
                .callbacks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.remove(&self.id);
        }
    }
}

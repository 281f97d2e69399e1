use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;

use super::CancelScope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Terminal failure of a [`CancellableFuture`].
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure<E> {
    #[error("task failed: {0}")]
    Error(E),
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("operation cancelled")]
    Cancelled,
}

enum Slot<T, E> {
    Pending,
    Done(Option<Result<T, TaskFailure<E>>>),
}

struct Shared<T, E> {
    slot: Mutex<Slot<T, E>>,
    done: Notify,
}

impl<T, E> Shared<T, E> {
    fn complete(&self, result: Result<T, TaskFailure<E>>) {
        let mut guard = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if matches!(*guard, Slot::Pending) {
            *guard = Slot::Done(Some(result));
            drop(guard);
            self.done.notify_waiters();
        }
    }
}

/// One unit of work executed off the caller's task, with cooperative
/// cancellation. `Pending -> Succeeded | Failed | Cancelled`; terminal states
/// are final and mutually exclusive.
pub struct CancellableFuture<T, E> {
    scope: CancelScope,
    shared: Arc<Shared<T, E>>,
}

impl<T, E> CancellableFuture<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Start `work` on the runtime immediately. Cancelling the scope resolves
    /// the handle to `Cancelled` without waiting for the work to unwind.
    pub fn spawn<F>(scope: CancelScope, work: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            done: Notify::new(),
        });
        let worker_shared = shared.clone();
        let worker_scope = scope.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = worker_scope.cancelled() => Err(TaskFailure::Cancelled),
                res = std::panic::AssertUnwindSafe(work).catch_unwind() => match res {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskFailure::Error(e)),
                    Err(panic) => Err(TaskFailure::Panic(describe_panic(&panic))),
                },
            };
            worker_shared.complete(result);
        });
        Self { scope, shared }
    }

    /// Run blocking `work` on a worker thread. The closure receives the scope
    /// for cooperative checks; on cancellation the handle resolves to
    /// `Cancelled` while the worker finishes detached - a running worker
    /// cannot be forcibly stopped.
    pub fn spawn_blocking<F>(scope: CancelScope, work: F) -> Self
    where
        F: FnOnce(CancelScope) -> Result<T, E> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            done: Notify::new(),
        });
        let worker_shared = shared.clone();
        let worker_scope = scope.clone();
        tokio::spawn(async move {
            let closure_scope = worker_scope.clone();
            let handle = tokio::task::spawn_blocking(move || work(closure_scope));
            let result = tokio::select! {
                _ = worker_scope.cancelled() => Err(TaskFailure::Cancelled),
                joined = handle => match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskFailure::Error(e)),
                    Err(join_err) => Err(TaskFailure::Panic(join_err.to_string())),
                },
            };
            worker_shared.complete(result);
        });
        Self { scope, shared }
    }

    pub fn state(&self) -> TaskState {
        let guard = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*guard {
            Slot::Pending => TaskState::Pending,
            Slot::Done(Some(Ok(_))) => TaskState::Succeeded,
            Slot::Done(Some(Err(TaskFailure::Cancelled))) => TaskState::Cancelled,
            Slot::Done(_) => TaskState::Failed,
        }
    }

    /// Block the caller until the task is terminal, or until `limit` elapses.
    /// A timeout does not cancel the task; the returned state is then still
    /// `Pending`.
    pub async fn wait(&self, limit: Option<Duration>) -> TaskState {
        match limit {
            None => self.wait_terminal().await,
            Some(d) => match tokio::time::timeout(d, self.wait_terminal()).await {
                Ok(state) => state,
                Err(_) => self.state(),
            },
        }
    }

    async fn wait_terminal(&self) -> TaskState {
        loop {
            let notified = self.shared.done.notified();
            let state = self.state();
            if state != TaskState::Pending {
                return state;
            }
            notified.await;
        }
    }

    /// Wait for completion and consume the result. Errors come back wrapped;
    /// a cancelled task yields `TaskFailure::Cancelled`.
    pub async fn outcome(self) -> Result<T, TaskFailure<E>> {
        self.wait_terminal().await;
        let mut guard = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &mut *guard {
            Slot::Done(result) => result
                .take()
                .unwrap_or(Err(TaskFailure::Panic("result already taken".into()))),
            Slot::Pending => Err(TaskFailure::Panic("terminal state lost".into())),
        }
    }

    /// Request cooperative cancellation; see [`CancelScope::cancel`].
    /// Returns false when the task already reached a terminal state, and
    /// leaves the scope untouched in that case.
    pub fn cancel(&self) -> bool {
        if self.state() != TaskState::Pending {
            return false;
        }
        self.scope.cancel()
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }
}

fn describe_panic(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

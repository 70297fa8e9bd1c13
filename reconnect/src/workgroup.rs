//! Work group: a cohort of tasks sharing one abort callback and one
//! termination point. All tasks are started before any can complete; on
//! any task's unhandled failure the group invokes the abort callback and
//! records the first error, so siblings observe the failure promptly rather
//! than running to their own, now-meaningless, completion.

use crate::error::{ReconnectError, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Fires once, when the first task in the group fails. Tasks can race
/// `signal.wait()` against their own work in a `tokio::select!` to stop
/// promptly instead of running to their own completion after a sibling has
/// already doomed the attempt.
#[derive(Clone)]
pub struct AbortSignal {
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// A closure invoked exactly once, the first time any task in the group
/// fails — e.g. to close the shared connection so stream pumps stuck in a
/// blocking read unblock immediately.
pub type AbortCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    first_error: Mutex<Option<ReconnectError>>,
    abort_callback: Mutex<Option<AbortCallback>>,
    notify: Arc<Notify>,
    closed_to_new_tasks: std::sync::atomic::AtomicBool,
}

/// `StandardWorkGroup`: launches `k` tasks sharing one synchronisation
/// point.
pub struct StandardWorkGroup {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<()>>,
}

impl StandardWorkGroup {
    pub fn new(abort_callback: AbortCallback) -> Self {
        StandardWorkGroup {
            inner: Arc::new(Inner {
                first_error: Mutex::new(None),
                abort_callback: Mutex::new(Some(abort_callback)),
                notify: Arc::new(Notify::new()),
                closed_to_new_tasks: std::sync::atomic::AtomicBool::new(false),
            }),
            handles: Vec::new(),
        }
    }

    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal {
            notify: self.inner.notify.clone(),
        }
    }

    /// Adds a task to the group. Rejected with `Interrupted` if the group
    /// has already aborted.
    pub fn spawn<F>(&mut self, name: &'static str, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        if self.inner.closed_to_new_tasks.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ReconnectError::Interrupted);
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = result {
                error!(task = name, error = %e, "work group task failed");
                Self::abort(&inner, e);
            }
        });
        self.handles.push(handle);
        Ok(())
    }

    fn abort(inner: &Arc<Inner>, e: ReconnectError) {
        let mut first = inner.first_error.lock().unwrap();
        if first.is_none() {
            *first = Some(e);
            inner
                .closed_to_new_tasks
                .store(true, std::sync::atomic::Ordering::SeqCst);
            if let Some(cb) = inner.abort_callback.lock().unwrap().take() {
                cb();
            } else {
                warn!("work group abort callback already consumed");
            }
            inner.notify.notify_waiters();
        }
    }

    /// Returns once every task has ended, surfacing the first recorded
    /// error, if any, to the caller.
    pub async fn await_termination(mut self) -> Result<()> {
        for handle in self.handles.drain(..) {
            // A task aborted out-of-band (e.g. by `JoinHandle::abort` from a
            // sibling's input-stream timeout) is not itself a work-group
            // failure; it is expected to have already reported its error
            // through `abort` before being cancelled, or to be a clean
            // shutdown path.
            let _ = handle.await;
        }
        match self.inner.first_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub type BoxedTask = BoxFuture<'static, Result<()>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_tasks_run_to_completion_when_none_fail() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let mut wg = StandardWorkGroup::new(Box::new(move || {
            called2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        wg.spawn("a", async { Ok(()) }).unwrap();
        wg.spawn("b", async { Ok(()) }).unwrap();
        wg.await_termination().await.unwrap();
        assert!(!called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn one_failure_invokes_abort_and_surfaces_error() {
        let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let called2 = called.clone();
        let mut wg = StandardWorkGroup::new(Box::new(move || {
            called2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let signal = wg.abort_signal();
        wg.spawn("a", async move {
            Err(ReconnectError::Invariant("boom".into()))
        })
        .unwrap();
        wg.spawn("b", async move {
            signal.wait().await;
            Ok(())
        })
        .unwrap();
        let result = wg.await_termination().await;
        assert!(result.is_err());
        assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn spawn_after_abort_is_rejected() {
        let mut wg = StandardWorkGroup::new(Box::new(|| {}));
        let signal = wg.abort_signal();
        wg.spawn("a", async { Err(ReconnectError::Invariant("x".into())) }).unwrap();
        signal.wait().await;
        let err = wg.spawn("b", async { Ok(()) }).unwrap_err();
        assert!(matches!(err, ReconnectError::Interrupted));
        wg.await_termination().await.unwrap_err();
    }
}

// src/core/supervisor.rs

//! A structured-concurrency group: owns a set of child tasks, aggregates
//! their failures, and cancels every sibling atomically on first failure.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::CoreResult;
use crate::core::errors::CoreError;
use crate::core::metrics;

struct Inner {
    unfinished: AtomicUsize,
    cancelled: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    errors: Mutex<Vec<CoreError>>,
    base_error: Mutex<Option<CoreError>>,
}

impl Inner {
    /// The done-callback every spawned child reports to on completion.
    fn on_child_done(self: &Arc<Self>, outcome: ChildOutcome) {
        match outcome {
            ChildOutcome::Ok => {}
            ChildOutcome::Cancelled => debug!("supervised child observed cancellation"),
            ChildOutcome::Err(err) => {
                if matches!(err, CoreError::ChildPanicked(_)) {
                    metrics::SUPERVISOR_CHILD_FAILURES_TOTAL
                        .with_label_values(&["base"])
                        .inc();
                    let mut base = self.base_error.lock();
                    if base.is_none() {
                        *base = Some(err);
                    }
                } else {
                    metrics::SUPERVISOR_CHILD_FAILURES_TOTAL
                        .with_label_values(&["aggregate"])
                        .inc();
                    self.errors.lock().push(err);
                }
                self.cancel_siblings();
            }
        }
        self.unfinished.fetch_sub(1, Ordering::SeqCst);
    }

    /// Requests cancellation of every currently tracked child. Abort is
    /// best-effort and idempotent against children that have already
    /// finished.
    fn cancel_siblings(&self) {
        for handle in self.handles.lock().iter() {
            handle.abort();
        }
    }
}

enum ChildOutcome {
    Ok,
    Cancelled,
    Err(CoreError),
}

/// A structured-concurrency group owning a set of child tasks.
#[derive(Clone)]
pub struct Supervisor(Arc<Inner>);

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Supervisor(Arc::new(Inner {
            unfinished: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            base_error: Mutex::new(None),
        }))
    }

    /// Spawns `fut` as a child task. Fails if the supervisor is already
    /// cancelling.
    pub fn create_task<F>(&self, fut: F) -> CoreResult<()>
    where
        F: Future<Output = CoreResult<()>> + Send + 'static,
    {
        if self.0.cancelled.load(Ordering::SeqCst) {
            return Err(CoreError::SupervisorClosed);
        }
        self.0.unfinished.fetch_add(1, Ordering::SeqCst);
        let inner = self.0.clone();
        let handle = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => ChildOutcome::Ok,
                Ok(Err(CoreError::Cancelled { .. })) => ChildOutcome::Cancelled,
                Ok(Err(e)) => ChildOutcome::Err(e),
                Err(panic) => ChildOutcome::Err(CoreError::ChildPanicked(panic_message(&panic))),
            };
            inner.on_child_done(outcome);
        });
        self.0.handles.lock().push(handle);
        Ok(())
    }

    /// The number of children that have not yet reached a terminal state.
    pub fn unfinished_tasks(&self) -> usize {
        self.0.unfinished.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Waits for every child to finish. If any child failed with a base
    /// (uncatchable) error, re-raises that error alone. Otherwise, if one or
    /// more children raised, aggregates all captured errors into a single
    /// [`CoreError::SupervisorAggregate`].
    ///
    /// Rust cannot resume a `wait()` future that the *caller* has dropped
    /// mid-await the way the source material resumes a cancelled
    /// `asyncio.Task`; callers that need "cancel this wait and still observe
    /// every child finish" should call [`Supervisor::cancel`] instead of
    /// racing `wait()` against an external cancellation.
    pub async fn wait(&self) -> CoreResult<()> {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.0.handles.lock());
        join_all(handles).await;
        self.0.unfinished.store(0, Ordering::SeqCst);

        if let Some(base) = self.0.base_error.lock().take() {
            return Err(CoreError::SupervisorBase(Box::new(base)));
        }
        // Clear the captured list before raising so the caller, not the
        // supervisor, retains whatever graph those errors carry.
        let errors = std::mem::take(&mut *self.0.errors.lock());
        if !errors.is_empty() {
            return Err(CoreError::SupervisorAggregate(errors));
        }
        Ok(())
    }

    /// Marks the supervisor cancelled, requests cancellation on every
    /// non-done child, and awaits their completion.
    pub async fn cancel(&self) -> CoreResult<()> {
        self.0.cancelled.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.0.handles.lock());
        let had_work = !handles.is_empty();
        for handle in &handles {
            handle.abort();
        }
        join_all(handles).await;
        self.0.unfinished.store(0, Ordering::SeqCst);
        if had_work {
            Err(CoreError::Cancelled { context: None })
        } else {
            Ok(())
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "supervised task panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn p3_single_failure_aggregates_to_one() {
        let sup = Supervisor::new();
        sup.create_task(async { Err(CoreError::PoolClosed) }).unwrap();
        sup.create_task(async {
            sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .unwrap();

        let res = sup.wait().await;
        match res {
            Err(CoreError::SupervisorAggregate(errs)) => assert_eq!(errs.len(), 1),
            other => panic!("expected aggregate of 1, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn p4_sibling_is_cancelled_before_wait_returns() {
        let sup = Supervisor::new();
        sup.create_task(async { Err(CoreError::PoolClosed) }).unwrap();
        sup.create_task(async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .unwrap();

        let start = tokio::time::Instant::now();
        let res = sup.wait().await;
        assert!(res.is_err());
        // The long sleeper must have been aborted, not actually waited out.
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn base_error_short_circuits_aggregate() {
        let sup = Supervisor::new();
        sup.create_task(async { Err(CoreError::PoolClosed) }).unwrap();
        sup.create_task(async { panic!("boom") }).unwrap();

        let res = sup.wait().await;
        assert!(matches!(res, Err(CoreError::SupervisorBase(_))));
    }

    #[tokio::test]
    async fn wait_succeeds_when_all_children_succeed() {
        let sup = Supervisor::new();
        for _ in 0..5 {
            sup.create_task(async { Ok(()) }).unwrap();
        }
        assert!(sup.wait().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_rejects_further_tasks() {
        let sup = Supervisor::new();
        sup.create_task(async {
            sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .unwrap();
        let _ = sup.cancel().await;
        assert!(sup.is_cancelled());
        assert!(matches!(
            sup.create_task(async { Ok(()) }),
            Err(CoreError::SupervisorClosed)
        ));
    }

    #[tokio::test]
    async fn invariant_unfinished_zero_after_wait() {
        let sup = Supervisor::new();
        sup.create_task(async { Ok(()) }).unwrap();
        sup.create_task(async { Ok(()) }).unwrap();
        let _ = sup.wait().await;
        assert_eq!(sup.unfinished_tasks(), 0);
    }
}

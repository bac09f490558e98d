// src/core/signalctl.rs

//! Process-wide signal dispatch and cooperative, cancellation-aware awaiting.
//!
//! A [`SignalController`] is a scoped handle over a subset of OS signals.
//! While at least one `SignalController` is registered for a given signal
//! number, exactly one OS-level handler is installed for it; the handler
//! fans the signal out to every controller currently registered for it, in
//! registration order. [`SignalController::wait_for`] is the central
//! contract: it awaits an operation while permitting any of a configurable
//! set of signals to cancel it, raising a [`CoreError::Signal`] that records
//! which signal won.
//!
//! The reference codebase this core is drawn from runs one event loop per
//! OS process and keys its signal registry by that loop. This crate runs a
//! single multi-threaded Tokio runtime per process, so the registry below is
//! simply process-global: one runtime plays the role one event loop played
//! in the source material.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::core::errors::CoreError;
use crate::core::metrics;
use crate::core::CoreResult;

fn next_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A single-use or multi-use notification handle fulfilled when a signal
/// arrives. Implemented as a small tagged variant rather than a trait object:
/// the producer (the registry dispatch loop) does not need to know whether
/// it is talking to a one-shot [`SignalController::wait_for`] waiter or the
/// many-shot queue behind [`SignalController::wait_for_signals`].
#[derive(Clone)]
struct Waiter {
    id: u64,
    payload: Arc<Mutex<WaiterPayload>>,
}

enum WaiterPayload {
    Once(Option<oneshot::Sender<i32>>),
    Stream(mpsc::UnboundedSender<i32>),
}

impl Waiter {
    fn once(tx: oneshot::Sender<i32>) -> Self {
        Waiter {
            id: next_id(),
            payload: Arc::new(Mutex::new(WaiterPayload::Once(Some(tx)))),
        }
    }

    fn stream(tx: mpsc::UnboundedSender<i32>) -> Self {
        Waiter {
            id: next_id(),
            payload: Arc::new(Mutex::new(WaiterPayload::Stream(tx))),
        }
    }

    fn is_done(&self) -> bool {
        match &*self.payload.lock() {
            WaiterPayload::Once(slot) => slot.is_none(),
            WaiterPayload::Stream(tx) => tx.is_closed(),
        }
    }

    /// Fulfils the waiter with `signo`. A no-op if it is already done.
    fn fulfil(&self, signo: i32) {
        match &mut *self.payload.lock() {
            WaiterPayload::Once(slot) => {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(signo);
                }
            }
            WaiterPayload::Stream(tx) => {
                let _ = tx.send(signo);
            }
        }
    }
}

/// Per-controller state: the set of signals it was installed for and its
/// own `(signal_number -> waiters)` map.
struct Inner {
    id: u64,
    signals: Vec<i32>,
    waiters: Mutex<HashMap<i32, Vec<Waiter>>>,
}

impl Inner {
    /// Fulfils every waiter currently registered for `signo` on this
    /// controller, in registration order. One-shot waiters are consumed by
    /// the delivery and pruned afterwards; the many-shot queue behind
    /// [`SignalController::wait_for_signals`] stays registered to receive
    /// further arrivals.
    fn on_signal(&self, signo: i32) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(&signo) {
            for waiter in list.iter() {
                if !waiter.is_done() {
                    waiter.fulfil(signo);
                }
            }
            list.retain(|w| !w.is_done());
        }
    }

    fn register_waiter(&self, signo: i32, waiter: Waiter) {
        self.waiters.lock().entry(signo).or_default().push(waiter);
    }

    fn deregister_waiter(&self, signo: i32, waiter_id: u64) {
        if let Some(list) = self.waiters.lock().get_mut(&signo) {
            list.retain(|w| w.id != waiter_id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let outstanding = self.waiters.lock().values().any(|v| !v.is_empty());
        if outstanding {
            warn!(
                controller_id = self.id,
                "SignalController dropped with outstanding waiters"
            );
        }
        for &signo in &self.signals {
            registry::deregister_controller(signo, self.id);
        }
        metrics::ACTIVE_SIGNAL_CONTROLLERS.dec();
    }
}

/// A scoped handle over a subset of OS signals. Registers itself in the
/// process-wide registry on construction; deregisters on drop of the last
/// clone.
#[derive(Clone)]
pub struct SignalController(Arc<Inner>);

impl SignalController {
    /// Installs a controller over `signals`. If any of them has no other
    /// registrant yet, an OS-level handler is installed for it.
    pub fn install(signals: impl IntoIterator<Item = i32>) -> Self {
        let signals: Vec<i32> = signals.into_iter().collect();
        let inner = Arc::new(Inner {
            id: next_id(),
            signals: signals.clone(),
            waiters: Mutex::new(HashMap::new()),
        });
        for &signo in &signals {
            registry::register_controller(signo, inner.id, Arc::downgrade(&inner));
        }
        metrics::ACTIVE_SIGNAL_CONTROLLERS.inc();
        SignalController(inner)
    }

    /// The signals this controller was installed over.
    pub fn signals(&self) -> &[i32] {
        &self.0.signals
    }

    /// Awaits `fut` while permitting any signal in `cancel_on` to cancel it.
    ///
    /// If `fut` completes first, its result is returned. If a signal in
    /// `cancel_on` arrives first, `fut` is dropped (ending its execution)
    /// and a [`CoreError::Signal`] carrying that signal number is returned.
    ///
    /// Rust has no equivalent of `asyncio.Task.cancel()` raising a catchable
    /// exception inside an already-running future: dropping a future only
    /// runs its synchronous destructors, it cannot perform further async
    /// cleanup. Callers that need a cleanup phase after cancellation (the
    /// "finally block awaits another suspension point" scenario in the
    /// source material) structure it as an explicit second `wait_for` call
    /// after observing the first one's error, chaining the two with
    /// [`CoreError::with_context`] so the resulting cause chain preserves
    /// both signals in order, outermost first.
    pub async fn wait_for<T, Fut>(&self, fut: Fut, cancel_on: &[i32]) -> CoreResult<T>
    where
        Fut: Future<Output = CoreResult<T>>,
    {
        if cancel_on.is_empty() {
            return fut.await;
        }

        let (tx, rx) = oneshot::channel::<i32>();
        let waiter = Waiter::once(tx);
        for &signo in cancel_on {
            self.0.register_waiter(signo, waiter.clone());
        }

        tokio::pin!(fut);
        let outcome = tokio::select! {
            biased;
            res = &mut fut => Ok(res),
            Ok(signo) = rx => Err(signo),
        };

        for &signo in cancel_on {
            self.0.deregister_waiter(signo, waiter.id);
        }

        match outcome {
            Ok(res) => res,
            Err(signo) => {
                debug!(signo, "wait_for cancelled by signal");
                metrics::WAIT_FOR_CANCELLED_TOTAL.inc();
                Err(CoreError::Signal {
                    signo,
                    context: None,
                })
            }
        }
    }

    /// Yields a lazy stream of signal numbers as this controller's signals
    /// arrive. The registration is torn down when the stream is dropped.
    pub fn wait_for_signals(&self) -> SignalStream {
        let (tx, rx) = mpsc::unbounded_channel::<i32>();
        let waiter = Waiter::stream(tx);
        for &signo in &self.0.signals {
            self.0.register_waiter(signo, waiter.clone());
        }
        SignalStream {
            controller: self.clone(),
            waiter_id: waiter.id,
            rx,
        }
    }
}

/// A stream of signal numbers produced by [`SignalController::wait_for_signals`].
pub struct SignalStream {
    controller: SignalController,
    waiter_id: u64,
    rx: mpsc::UnboundedReceiver<i32>,
}

impl Stream for SignalStream {
    type Item = i32;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<i32>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        for &signo in &self.controller.0.signals {
            self.controller.0.deregister_waiter(signo, self.waiter_id);
        }
    }
}

/// The process-wide `(signal_number -> set<SignalController>)` registry and
/// the OS-handler lifecycle it owns.
mod registry {
    use super::*;

    struct RegistryEntry {
        controllers: Vec<(u64, Weak<Inner>)>,
        handler: Option<JoinHandle<()>>,
    }

    static REGISTRY: Lazy<Mutex<HashMap<i32, RegistryEntry>>> = Lazy::new(|| Mutex::new(HashMap::new()));

    pub(super) fn register_controller(signo: i32, id: u64, weak: Weak<Inner>) {
        let mut registry = REGISTRY.lock();
        let entry = registry.entry(signo).or_insert_with(|| RegistryEntry {
            controllers: Vec::new(),
            handler: None,
        });
        entry.controllers.push((id, weak));
        if entry.handler.is_none() {
            entry.handler = Some(tokio::spawn(run_os_handler(signo)));
        }
    }

    pub(super) fn deregister_controller(signo: i32, id: u64) {
        let mut registry = REGISTRY.lock();
        if let Some(entry) = registry.get_mut(&signo) {
            entry.controllers.retain(|(cid, _)| *cid != id);
            if entry.controllers.is_empty() {
                if let Some(handle) = entry.handler.take() {
                    handle.abort();
                }
                registry.remove(&signo);
            }
        }
    }

    fn dispatch(signo: i32) {
        let controllers: Vec<Arc<Inner>> = {
            let mut registry = REGISTRY.lock();
            let Some(entry) = registry.get_mut(&signo) else {
                return;
            };
            entry.controllers.retain(|(_, w)| w.strong_count() > 0);
            entry
                .controllers
                .iter()
                .filter_map(|(_, w)| w.upgrade())
                .collect()
        };
        metrics::SIGNALS_DISPATCHED_TOTAL
            .with_label_values(&[&signo.to_string()])
            .inc();
        for inner in controllers {
            inner.on_signal(signo);
        }
    }

    async fn run_os_handler(signo: i32) {
        let mut stream = match signal(SignalKind::from_raw(signo)) {
            Ok(s) => s,
            Err(e) => {
                error!(signo, error = %e, "failed to install OS signal handler");
                return;
            }
        };
        loop {
            if stream.recv().await.is_none() {
                break;
            }
            dispatch(signo);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::sleep;

    async fn sleep_ok(ms: u64) -> CoreResult<&'static str> {
        sleep(Duration::from_millis(ms)).await;
        Ok("done")
    }

    #[tokio::test]
    async fn p1_returns_result_if_op_finishes_before_signal() {
        let ctl = SignalController::install([libc::SIGUSR1]);
        let res = ctl.wait_for(sleep_ok(5), &[libc::SIGUSR1]).await;
        assert_eq!(res.unwrap(), "done");
    }

    #[tokio::test]
    async fn p1_raises_signal_error_if_signal_arrives_first() {
        let ctl = SignalController::install([libc::SIGUSR2]);
        let ctl2 = ctl.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            unsafe {
                libc::raise(libc::SIGUSR2);
            }
            drop(ctl2);
        });
        let res = ctl.wait_for(sleep_ok(2_000), &[libc::SIGUSR2]).await;
        match res {
            Err(CoreError::Signal { signo, .. }) => assert_eq!(signo, libc::SIGUSR2),
            other => panic!("expected SignalError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn p2_second_wait_for_chains_cause_in_order() {
        // Simulates "op catches cancellation in a finally and awaits another
        // suspension point": the caller nests a second wait_for after the
        // first is cancelled and chains the resulting errors explicitly.
        let outer = CoreError::Signal {
            signo: 15, // SIGTERM
            context: None,
        };
        let inner = CoreError::Signal {
            signo: 2, // SIGINT
            context: None,
        };
        let chained = inner.with_context(outer);
        assert_eq!(chained.signo(), Some(2));
        assert_eq!(chained.cancellation_context().unwrap().signo(), Some(15));
    }

    #[tokio::test]
    async fn wait_for_signals_yields_each_arrival() {
        let ctl = SignalController::install([libc::SIGUSR1]);
        let mut stream = ctl.wait_for_signals();
        ctl.0.on_signal(libc::SIGUSR1);
        assert_eq!(stream.next().await, Some(libc::SIGUSR1));
    }

    #[tokio::test]
    async fn no_cancel_on_signals_just_awaits() {
        let ctl = SignalController::install([] as [i32; 0]);
        let res = ctl.wait_for(sleep_ok(1), &[]).await;
        assert_eq!(res.unwrap(), "done");
    }
}

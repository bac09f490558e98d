// src/core/procpool/manager.rs

//! The Pool Manager: spawns and kills worker subprocesses, keeps a warm
//! buffer of pre-spawned workers, and fans requests out across the active
//! set. One Manager instance is owned per worker class.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::process::{Child, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::core::CoreResult;
use crate::core::errors::CoreError;
use crate::core::metrics;
use crate::core::procpool::hub::{HubConnection, PoolHub};
use crate::core::procpool::wire::{self, Reply};
use crate::core::supervisor::Supervisor;

/// Default for how long `spawn_process` waits for a freshly-exec'd worker to
/// connect back to the Hub and announce its pid. Overridable per-manager via
/// [`PoolTimeouts`], which `Config` resolves from `timeouts.*` settings.
const DEFAULT_PROCESS_INITIAL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default for how long a graceful `SIGTERM` is given to take effect before
/// a worker process is escalated to `SIGKILL`.
const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// The timeouts governing worker spawn and kill discipline. Defaults match
/// the specification's `PROCESS_INITIAL_RESPONSE_TIMEOUT` (~60s) and
/// `KILL_TIMEOUT` (~10s); both are configurable via `Config` so operators can
/// tune them without a rebuild.
#[derive(Debug, Clone, Copy)]
pub struct PoolTimeouts {
    pub process_initial_response_timeout: Duration,
    pub kill_timeout: Duration,
}

impl Default for PoolTimeouts {
    fn default() -> Self {
        PoolTimeouts {
            process_initial_response_timeout: DEFAULT_PROCESS_INITIAL_RESPONSE_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// The fixed argv template used to exec every worker of one class, per the
/// `<worker-binary> --cls-name <dotted> --cls-args <base64-blob> --sockname
/// <path>` contract.
#[derive(Clone)]
pub struct WorkerSpawnSpec {
    pub worker_binary: PathBuf,
    pub cls_name: String,
    pub cls_args_b64: String,
    pub sockname: PathBuf,
}

struct WorkerState {
    pid: u32,
    child: Option<Child>,
    conn: Arc<HubConnection>,
}

/// A single worker process and its current transport connection. Identity
/// (the `id` assigned at first spawn) is stable across respawns; the
/// underlying OS pid and connection are not, and are guarded by an async
/// mutex so at most one request is ever in flight at a time.
pub struct Worker {
    id: u64,
    state: AsyncMutex<WorkerState>,
    closed: AtomicBool,
    last_used: SyncMutex<std::time::Instant>,
    manager: std::sync::Weak<ManagerInner>,
}

impl Worker {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> u32 {
        self.state.try_lock().map(|s| s.pid).unwrap_or(0)
    }

    /// Invokes `method` on the worker with `args` already serialized by the
    /// caller's payload codec.
    ///
    /// Respawns the process first if the connection was already observed
    /// closed from a prior call. If the connection turns out to have died
    /// since — the common case for an externally killed process, which
    /// this Worker only learns about by trying to use the socket — the
    /// first send/recv failure triggers one respawn-and-retry rather than
    /// surfacing that failure to the caller, so a crashed worker is
    /// transparent to the very next `call`, not just the one after.
    pub async fn call(&self, method: &str, args: Vec<u8>) -> CoreResult<Vec<u8>> {
        let manager = self
            .manager
            .upgrade()
            .ok_or(CoreError::PoolMisuse("manager dropped"))?;
        let payload = wire::encode_request(method, args)?;

        let mut state = self.state.lock().await;
        if state.conn.is_closed() {
            self.respawn_locked(&manager, &mut state).await?;
        }

        let reply_bytes = match state.conn.request(payload.clone().into()).await {
            Ok(bytes) => bytes,
            Err(CoreError::PoolClosed) => {
                self.respawn_locked(&manager, &mut state).await?;
                state.conn.request(payload.into()).await?
            }
            Err(e) => return Err(e),
        };
        let reply = wire::decode_reply(&reply_bytes)?;
        *self.last_used.lock() = std::time::Instant::now();

        match reply {
            Reply::Ok(bytes) => Ok(bytes),
            Reply::Raised { message, traceback } => {
                Err(CoreError::WorkerCallFailed { message, traceback })
            }
            Reply::SerializationError { traceback } => {
                Err(CoreError::WorkerSerializationFailed { traceback })
            }
        }
    }

    async fn respawn_locked(
        &self,
        manager: &Arc<ManagerInner>,
        state: &mut WorkerState,
    ) -> CoreResult<()> {
        let old_child = state.child.take();
        let (pid, child, conn) = manager.respawn_process(old_child).await?;
        state.pid = pid;
        state.child = Some(child);
        state.conn = conn;
        Ok(())
    }

    /// Idempotent. Marks the worker closed, removes it from the Manager's
    /// active set, and terminates its process.
    pub async fn close(self: &Arc<Self>) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let kill_timeout = self
            .manager
            .upgrade()
            .map(|m| m.timeouts.kill_timeout)
            .unwrap_or(DEFAULT_KILL_TIMEOUT);
        if let Some(manager) = self.manager.upgrade() {
            manager.active.lock().retain(|w| w.id != self.id);
        }
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            kill_process(&mut child, kill_timeout).await;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.killed.fetch_add(1, Ordering::SeqCst);
            metrics::WORKERS_KILLED_TOTAL
                .with_label_values(&[&manager.spec.cls_name])
                .inc();
        }
        Ok(())
    }
}

struct ManagerInner {
    spec: WorkerSpawnSpec,
    hub: Arc<PoolHub>,
    pool_size: usize,
    timeouts: PoolTimeouts,
    active: SyncMutex<Vec<Arc<Worker>>>,
    buffer: SyncMutex<VecDeque<Arc<Worker>>>,
    supervisor: Supervisor,
    running: AtomicBool,
    spawned: AtomicU64,
    killed: AtomicU64,
    next_id: AtomicU64,
}

impl ManagerInner {
    async fn spawn_process(self: &Arc<Self>) -> CoreResult<Arc<Worker>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (pid, child, conn) = self.exec_and_wait().await?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        metrics::WORKERS_SPAWNED_TOTAL
            .with_label_values(&[&self.spec.cls_name])
            .inc();
        Ok(Arc::new(Worker {
            id,
            state: AsyncMutex::new(WorkerState {
                pid,
                child: Some(child),
                conn,
            }),
            closed: AtomicBool::new(false),
            last_used: SyncMutex::new(std::time::Instant::now()),
            manager: Arc::downgrade(self),
        }))
    }

    /// Respawns a worker's process. If an old process handle is supplied,
    /// it is handed to the Supervisor for best-effort killing in the
    /// background so the caller of `Worker.call` never blocks on a
    /// potentially-hung previous process.
    async fn respawn_process(
        self: &Arc<Self>,
        old: Option<Child>,
    ) -> CoreResult<(u32, Child, Arc<HubConnection>)> {
        if let Some(mut old_child) = old {
            self.killed.fetch_add(1, Ordering::SeqCst);
            metrics::WORKERS_KILLED_TOTAL
                .with_label_values(&[&self.spec.cls_name])
                .inc();
            let kill_timeout = self.timeouts.kill_timeout;
            self.supervisor
                .create_task(async move {
                    kill_process(&mut old_child, kill_timeout).await;
                    Ok(())
                })
                .ok();
        }
        let (pid, child, conn) = self.exec_and_wait().await?;
        self.spawned.fetch_add(1, Ordering::SeqCst);
        metrics::WORKERS_SPAWNED_TOTAL
            .with_label_values(&[&self.spec.cls_name])
            .inc();
        Ok((pid, child, conn))
    }

    async fn exec_and_wait(self: &Arc<Self>) -> CoreResult<(u32, Child, Arc<HubConnection>)> {
        let mut cmd = Command::new(&self.spec.worker_binary);
        cmd.arg("--cls-name")
            .arg(&self.spec.cls_name)
            .arg("--cls-args")
            .arg(&self.spec.cls_args_b64)
            .arg("--sockname")
            .arg(&self.spec.sockname)
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or(CoreError::PoolMisuse("worker exited before reporting a pid"))?;

        match timeout(
            self.timeouts.process_initial_response_timeout,
            self.hub.get_by_pid(pid),
        )
        .await
        {
            Ok(Ok(conn)) => Ok((pid, child, conn)),
            Ok(Err(e)) => {
                kill_process(&mut child, self.timeouts.kill_timeout).await;
                Err(e)
            }
            Err(_) => {
                kill_process(&mut child, self.timeouts.kill_timeout).await;
                Err(CoreError::PoolMisuse(
                    "worker did not connect within the initial response timeout",
                ))
            }
        }
    }
}

async fn kill_process(child: &mut Child, kill_timeout: Duration) {
    let Some(pid) = child.id() else { return };
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    if timeout(kill_timeout, child.wait()).await.is_err() {
        warn!(pid, "worker did not exit after SIGTERM, escalating to SIGKILL");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

/// Spawns and supervises worker processes for a single worker class,
/// maintaining a warm buffer so `spawn_worker` usually returns without
/// waiting on a process launch.
#[derive(Clone)]
pub struct PoolManager(Arc<ManagerInner>);

impl PoolManager {
    pub fn new(hub: Arc<PoolHub>, spec: WorkerSpawnSpec, pool_size: usize) -> Self {
        Self::with_timeouts(hub, spec, pool_size, PoolTimeouts::default())
    }

    pub fn with_timeouts(
        hub: Arc<PoolHub>,
        spec: WorkerSpawnSpec,
        pool_size: usize,
        timeouts: PoolTimeouts,
    ) -> Self {
        PoolManager(Arc::new(ManagerInner {
            spec,
            hub,
            pool_size,
            timeouts,
            active: SyncMutex::new(Vec::new()),
            buffer: SyncMutex::new(VecDeque::new()),
            supervisor: Supervisor::new(),
            running: AtomicBool::new(false),
            spawned: AtomicU64::new(0),
            killed: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn spawned_count(&self) -> u64 {
        self.0.spawned.load(Ordering::SeqCst)
    }

    pub fn killed_count(&self) -> u64 {
        self.0.killed.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.0.active.lock().len()
    }

    pub fn buffer_count(&self) -> usize {
        self.0.buffer.lock().len()
    }

    /// Marks the pool running and spawns `pool_size` workers into the
    /// buffer in parallel, under the Manager's own Supervisor.
    pub async fn start(&self) -> CoreResult<()> {
        self.0.running.store(true, Ordering::SeqCst);
        let mut handles = Vec::with_capacity(self.0.pool_size);
        for _ in 0..self.0.pool_size {
            let inner = self.0.clone();
            handles.push(tokio::spawn(async move { inner.spawn_process().await }));
        }
        for handle in handles {
            let worker = handle
                .await
                .map_err(|_| CoreError::PoolMisuse("worker spawn task panicked"))??;
            self.0.buffer.lock().push_back(worker);
        }
        metrics::POOL_BUFFER_SIZE
            .with_label_values(&[&self.0.spec.cls_name])
            .set(self.buffer_count() as f64);
        info!(pool_size = self.0.pool_size, "pool manager started");
        Ok(())
    }

    /// Returns a ready Worker, preferring the warm buffer and asynchronously
    /// topping it back up; falls back to a synchronous spawn if the buffer
    /// is empty.
    pub async fn spawn_worker(&self) -> CoreResult<Arc<Worker>> {
        if !self.0.running.load(Ordering::SeqCst) {
            return Err(CoreError::PoolMisuse("spawn_worker called before start()"));
        }

        let popped = self.0.buffer.lock().pop_back();
        let worker = if let Some(worker) = popped {
            let inner = self.0.clone();
            let _ = self.0.supervisor.create_task(async move {
                let fresh = inner.spawn_process().await?;
                inner.buffer.lock().push_back(fresh);
                Ok(())
            });
            worker
        } else {
            self.0.spawn_process().await?
        };

        self.0.active.lock().push(worker.clone());
        metrics::POOL_ACTIVE_SIZE
            .with_label_values(&[&self.0.spec.cls_name])
            .set(self.active_count() as f64);
        metrics::POOL_BUFFER_SIZE
            .with_label_values(&[&self.0.spec.cls_name])
            .set(self.buffer_count() as f64);
        Ok(worker)
    }

    /// No-op if not running. Waits for the Supervisor's outstanding
    /// children, stops the Hub, and closes every worker still tracked in
    /// the active set and the buffer.
    pub async fn stop(&self) -> CoreResult<()> {
        if !self.0.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.0.supervisor.wait().await;
        self.0.hub.stop().await?;

        let active: Vec<Arc<Worker>> = std::mem::take(&mut *self.0.active.lock());
        let buffered: Vec<Arc<Worker>> = std::mem::take(&mut *self.0.buffer.lock()).into();
        let close_all = Supervisor::new();
        for worker in active.into_iter().chain(buffered.into_iter()) {
            let _ = close_all.create_task(async move { worker.close().await });
        }
        close_all.wait().await.ok();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_spec_is_cloneable_and_holds_argv_fields() {
        let spec = WorkerSpawnSpec {
            worker_binary: PathBuf::from("/usr/bin/ignis-worker"),
            cls_name: "ignis_core::workers::EchoService".to_string(),
            cls_args_b64: "e30=".to_string(),
            sockname: PathBuf::from("/tmp/ignis.socket"),
        };
        let cloned = spec.clone();
        assert_eq!(cloned.cls_name, spec.cls_name);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let hub = Arc::new(
            PoolHub::start(&std::env::temp_dir(), "manager-noop-test")
                .await
                .unwrap(),
        );
        let spec = WorkerSpawnSpec {
            worker_binary: PathBuf::from("/bin/true"),
            cls_name: "unused".to_string(),
            cls_args_b64: "e30=".to_string(),
            sockname: hub.socket_path().to_path_buf(),
        };
        let manager = PoolManager::new(hub, spec, 1);
        assert!(manager.stop().await.is_ok());
    }

    #[tokio::test]
    async fn spawn_worker_before_start_is_pool_misuse() {
        let hub = Arc::new(
            PoolHub::start(&std::env::temp_dir(), "manager-misuse-test")
                .await
                .unwrap(),
        );
        let spec = WorkerSpawnSpec {
            worker_binary: PathBuf::from("/bin/true"),
            cls_name: "unused".to_string(),
            cls_args_b64: "e30=".to_string(),
            sockname: hub.socket_path().to_path_buf(),
        };
        let manager = PoolManager::new(hub, spec, 1);
        assert!(matches!(
            manager.spawn_worker().await,
            Err(CoreError::PoolMisuse(_))
        ));
    }
}

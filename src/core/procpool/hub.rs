// src/core/procpool/hub.rs

//! The Pool Hub: the server side of the framed transport. Accepts worker
//! connections on a local Unix domain socket, reads each one's self-reported
//! pid, and hands out a single-in-flight-request handle per pid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::CoreResult;
use crate::core::errors::CoreError;
use crate::core::procpool::transport::{self, FramedConn};

/// A single worker connection. Requests on one connection are strictly
/// ordered 1:1 with replies, so the connection is guarded by an async mutex
/// rather than fanned out.
pub struct HubConnection {
    pid: u32,
    framed: tokio::sync::Mutex<FramedConn>,
    closed: std::sync::atomic::AtomicBool,
}

impl HubConnection {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Sends one frame and awaits the single reply. Connection loss while
    /// the request is outstanding fails with [`CoreError::PoolClosed`].
    pub async fn request(&self, payload: Bytes) -> CoreResult<Bytes> {
        let mut conn = self.framed.lock().await;
        if let Err(e) = transport::send_frame(&mut conn, payload).await {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            return Err(e);
        }
        match transport::recv_frame(&mut conn).await {
            Ok(Some(bytes)) => Ok(bytes.freeze()),
            Ok(None) => {
                self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                Err(CoreError::PoolClosed)
            }
            Err(e) => {
                self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

enum PidSlot {
    Pending(Vec<oneshot::Sender<Arc<HubConnection>>>),
    Ready(Arc<HubConnection>),
}

struct Inner {
    socket_path: PathBuf,
    pids: Mutex<HashMap<u32, PidSlot>>,
}

/// Accepts worker connections and maps each to the pid it self-reports.
pub struct PoolHub {
    inner: Arc<Inner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PoolHub {
    /// Binds `<runstate_dir>/<name>.socket` and starts accepting
    /// connections in the background.
    pub async fn start(runstate_dir: &Path, name: &str) -> CoreResult<Self> {
        let socket_path = runstate_dir.join(format!("{name}.socket"));
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path)?;
        let inner = Arc::new(Inner {
            socket_path: socket_path.clone(),
            pids: Mutex::new(HashMap::new()),
        });
        let accept_inner = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let inner = accept_inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = accept_one(stream, &inner).await {
                                warn!(error = %e, "failed to register new worker connection");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "pool hub accept loop failed");
                        break;
                    }
                }
            }
        });
        Ok(PoolHub {
            inner,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.socket_path
    }

    /// Returns the connection registered for `pid`, waiting for it to
    /// appear if it hasn't connected yet. Supports multiple concurrent
    /// waiters on the same pid.
    pub async fn get_by_pid(&self, pid: u32) -> CoreResult<Arc<HubConnection>> {
        let rx = {
            let mut pids = self.inner.pids.lock();
            match pids.get_mut(&pid) {
                Some(PidSlot::Ready(conn)) => return Ok(conn.clone()),
                Some(PidSlot::Pending(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    pids.insert(pid, PidSlot::Pending(vec![tx]));
                    rx
                }
            }
        };
        rx.await.map_err(|_| CoreError::PoolClosed)
    }

    /// Closes the listener and awaits its teardown.
    pub async fn stop(&self) -> CoreResult<()> {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&self.inner.socket_path);
        Ok(())
    }
}

async fn accept_one(mut stream: UnixStream, inner: &Inner) -> CoreResult<()> {
    let pid = transport::read_pid_prefix(&mut stream).await?;
    debug!(pid, "worker connected to pool hub");
    let conn = Arc::new(HubConnection {
        pid,
        framed: tokio::sync::Mutex::new(transport::framed(stream)),
        closed: std::sync::atomic::AtomicBool::new(false),
    });
    let waiters = {
        let mut pids = inner.pids.lock();
        match pids.insert(pid, PidSlot::Ready(conn.clone())) {
            Some(PidSlot::Pending(waiters)) => waiters,
            _ => Vec::new(),
        }
    };
    for tx in waiters {
        let _ = tx.send(conn.clone());
    }
    Ok(())
}

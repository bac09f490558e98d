// src/core/procpool/mod.rs

//! The external worker process pool: a framed local-socket protocol (A),
//! the server-side Hub (B), the worker-side runtime (C), and the Manager
//! that owns process lifecycle and request fan-out (D).

pub mod hub;
pub mod manager;
pub mod transport;
pub mod wire;
pub mod worker_runtime;

pub use hub::{HubConnection, PoolHub};
pub use manager::{PoolManager, PoolTimeouts, Worker, WorkerSpawnSpec};

// src/core/mod.rs

//! The central module containing the runtime coordination core: signal-aware
//! cancellation, structured task supervision, the external worker process
//! pool, and backend HA failover detection.

pub mod errors;
pub mod ha;
pub mod metrics;
pub mod procpool;
pub mod signalctl;
pub mod supervisor;

pub use errors::CoreError;

/// Convenience alias used throughout the core for fallible operations.
pub type CoreResult<T> = Result<T, CoreError>;

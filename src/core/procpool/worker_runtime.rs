// src/core/procpool/worker_runtime.rs

//! The worker-side runtime: hosts a single `WorkerService` instance, reads
//! one request frame at a time from the Hub connection, dispatches it, and
//! writes one reply frame. Backs the `ignis-worker` binary.
//!
//! The source material loads the service class dynamically by dotted name
//! via `importlib`; Rust has no analogous runtime class loader, so dispatch
//! here goes through a small compile-time registry of known class names
//! instead. Adding a worker class means adding an entry to the registry,
//! not shipping a new string to `importlib.import_module`.

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::core::CoreResult;
use crate::core::errors::CoreError;
use crate::core::procpool::transport::{self, FramedConn};
use crate::core::procpool::wire::{self, Reply, Request};

/// A worker-hosted service. Implementors back one `--cls-name` registry
/// entry; `args` is whatever this class needs to construct itself, decoded
/// from the `--cls-args` blob.
pub trait WorkerService: Send + Sync {
    fn construct(args: Vec<u8>) -> CoreResult<Self>
    where
        Self: Sized;

    /// Dispatches one call by method name. Returns the pickled/encoded
    /// result on success; an `Err` becomes a status-1 reply carrying this
    /// error's message as the remote "exception".
    fn dispatch(&self, method: &str, args: Vec<u8>) -> CoreResult<Vec<u8>>;
}

/// A trivial worker service used by tests and as a template for new
/// classes: `echo` returns its single argument unchanged.
pub struct EchoService;

impl WorkerService for EchoService {
    fn construct(_args: Vec<u8>) -> CoreResult<Self> {
        Ok(EchoService)
    }

    fn dispatch(&self, method: &str, args: Vec<u8>) -> CoreResult<Vec<u8>> {
        match method {
            "echo" => Ok(args),
            other => Err(CoreError::WorkerCallFailed {
                message: format!("EchoService has no method '{other}'"),
                traceback: String::new(),
            }),
        }
    }
}

/// Parsed `--cls-name <dotted> --cls-args <base64-blob> --sockname <path>`
/// argv, per the worker launch contract.
pub struct WorkerArgs {
    pub cls_name: String,
    pub cls_args: Vec<u8>,
    pub sockname: PathBuf,
}

pub fn parse_args<I: IntoIterator<Item = String>>(argv: I) -> CoreResult<WorkerArgs> {
    let mut cls_name = None;
    let mut cls_args_b64 = None;
    let mut sockname = None;

    let mut iter = argv.into_iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| CoreError::Config(format!("missing value for '{flag}'")))?;
        match flag.as_str() {
            "--cls-name" => cls_name = Some(value),
            "--cls-args" => cls_args_b64 = Some(value),
            "--sockname" => sockname = Some(PathBuf::from(value)),
            other => return Err(CoreError::Config(format!("unrecognized worker argument '{other}'"))),
        }
    }

    let cls_name = cls_name.ok_or_else(|| CoreError::Config("--cls-name is required".into()))?;
    let cls_args_b64 =
        cls_args_b64.ok_or_else(|| CoreError::Config("--cls-args is required".into()))?;
    let sockname = sockname.ok_or_else(|| CoreError::Config("--sockname is required".into()))?;
    let cls_args = BASE64
        .decode(cls_args_b64)
        .map_err(|e| CoreError::Config(format!("--cls-args is not valid base64: {e}")))?;

    Ok(WorkerArgs {
        cls_name,
        cls_args,
        sockname,
    })
}

fn construct_by_name(cls_name: &str, args: Vec<u8>) -> CoreResult<Box<dyn WorkerService>> {
    match cls_name {
        "echo" | "ignis_core::workers::EchoService" => {
            Ok(Box::new(EchoService::construct(args)?))
        }
        other => Err(CoreError::Config(format!(
            "no worker service registered for class '{other}'"
        ))),
    }
}

/// Connects to the Hub at `sockname`, sends this process's pid as the
/// handshake prefix, and processes requests until the connection closes.
pub async fn run(args: WorkerArgs) -> CoreResult<()> {
    let service = construct_by_name(&args.cls_name, args.cls_args)?;
    let mut stream = UnixStream::connect(&args.sockname).await?;
    let pid = std::process::id();
    transport::write_pid_prefix(&mut stream, pid).await?;
    info!(pid, cls_name = %args.cls_name, "worker connected to pool hub");

    let mut conn: FramedConn = transport::framed(stream);
    loop {
        let frame = match transport::recv_frame(&mut conn).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("hub connection closed, exiting cleanly");
                return Ok(());
            }
            Err(CoreError::PoolClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let reply = match wire::decode_request(&frame) {
            Ok(request) => dispatch_one(service.as_ref(), request),
            Err(e) => Reply::SerializationError {
                traceback: e.to_string(),
            },
        };

        let encoded = match wire::encode_reply(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode reply, falling back to a serialization-error reply");
                wire::encode_reply(&Reply::SerializationError {
                    traceback: e.to_string(),
                })?
            }
        };

        if let Err(e) = transport::send_frame(&mut conn, encoded.into()).await {
            return Err(e);
        }
    }
}

fn dispatch_one(service: &dyn WorkerService, request: Request) -> Reply {
    match service.dispatch(&request.method, request.args) {
        Ok(bytes) => Reply::Ok(bytes),
        Err(CoreError::WorkerCallFailed { message, traceback }) => Reply::Raised { message, traceback },
        Err(other) => Reply::Raised {
            message: other.to_string(),
            traceback: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_args_reads_all_three_required_flags() {
        let argv = vec![
            "--cls-name".to_string(),
            "echo".to_string(),
            "--cls-args".to_string(),
            base64::engine::general_purpose::STANDARD.encode(b"hi"),
            "--sockname".to_string(),
            "/tmp/x.socket".to_string(),
        ];
        let parsed = parse_args(argv).unwrap();
        assert_eq!(parsed.cls_name, "echo");
        assert_eq!(parsed.cls_args, b"hi");
        assert_eq!(parsed.sockname, PathBuf::from("/tmp/x.socket"));
    }

    #[test]
    fn parse_args_rejects_missing_flag() {
        let argv = vec!["--cls-name".to_string(), "echo".to_string()];
        assert!(parse_args(argv).is_err());
    }

    #[test]
    fn echo_service_dispatches_echo_and_rejects_unknown_methods() {
        let svc = EchoService;
        assert_eq!(svc.dispatch("echo", vec![1, 2, 3]).unwrap(), vec![1, 2, 3]);
        assert!(svc.dispatch("bogus", vec![]).is_err());
    }
}

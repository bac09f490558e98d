// src/bin/ignis_worker.rs

//! The `ignis-worker` entry point: a thin process that connects back to a
//! `PoolHub` socket, constructs the requested `WorkerService`, and serves
//! requests until the connection closes. Spawned exclusively by
//! `PoolManager`, never run directly by an operator.

use std::env;

use ignis_core::core::procpool::worker_runtime;
use tracing::error;

#[tokio::main]
async fn main() {
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    let argv: Vec<String> = env::args().skip(1).collect();
    let args = match worker_runtime::parse_args(argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("ignis-worker: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = worker_runtime::run(args).await {
        error!(error = %e, "worker exited with an error");
        std::process::exit(1);
    }
}

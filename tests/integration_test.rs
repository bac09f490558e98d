// tests/integration_test.rs

//! Integration tests for the process pool: these drive a real `ignis-worker`
//! subprocess over a real Unix-domain socket, exercising scenarios 4 and 5
//! from the specification's testable-properties section end to end rather
//! than through in-process mocks.

use std::path::PathBuf;
use std::time::Duration;

use ignis_core::core::procpool::{PoolHub, PoolManager, PoolTimeouts, WorkerSpawnSpec};
use tempfile::tempdir;

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ignis-worker"))
}

async fn start_manager(dir: &std::path::Path, name: &str, pool_size: usize) -> PoolManager {
    let hub = std::sync::Arc::new(PoolHub::start(dir, name).await.unwrap());
    let spec = WorkerSpawnSpec {
        worker_binary: worker_binary(),
        cls_name: "echo".to_string(),
        cls_args_b64: "".to_string(),
        sockname: hub.socket_path().to_path_buf(),
    };
    let timeouts = PoolTimeouts {
        process_initial_response_timeout: Duration::from_secs(10),
        kill_timeout: Duration::from_secs(5),
    };
    let manager = PoolManager::with_timeouts(hub, spec, pool_size, timeouts);
    manager.start().await.unwrap();
    manager
}

/// Scenario 4: worker RPC round-trip. A pool with two buffered workers
/// serves one `echo` call; afterward the active set holds one worker and
/// the buffer has been topped back up to its configured size.
#[tokio::test]
async fn scenario_4_worker_rpc_round_trip() {
    let dir = tempdir().unwrap();
    let manager = start_manager(dir.path(), "scenario4", 2).await;

    let worker = manager.spawn_worker().await.unwrap();
    let reply = worker.call("echo", b"hello".to_vec()).await.unwrap();
    assert_eq!(reply, b"hello");

    assert_eq!(manager.active_count(), 1);
    // The buffer refill is fire-and-forget; give it a moment to land.
    for _ in 0..50 {
        if manager.buffer_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.buffer_count(), 2);

    manager.stop().await.unwrap();
}

/// Scenario 5: worker crash and respawn. Once a worker's process is killed
/// out from under it, the next `call` transparently respawns a fresh
/// process and still succeeds.
#[tokio::test]
async fn scenario_5_worker_crash_and_respawn() {
    let dir = tempdir().unwrap();
    let manager = start_manager(dir.path(), "scenario5", 1).await;

    let worker = manager.spawn_worker().await.unwrap();
    let reply = worker.call("echo", b"one".to_vec()).await.unwrap();
    assert_eq!(reply, b"one");

    let spawned_before = manager.spawned_count();
    let killed_before = manager.killed_count();

    unsafe {
        libc::kill(worker.pid() as libc::pid_t, libc::SIGKILL);
    }
    // Give the OS a moment to tear the process and the socket down.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reply = worker.call("echo", b"two".to_vec()).await.unwrap();
    assert_eq!(reply, b"two");

    assert_eq!(manager.spawned_count(), spawned_before + 1);
    assert_eq!(manager.killed_count(), killed_before + 1);

    manager.stop().await.unwrap();
}

/// P6: worker idempotence on restart — repeated crash/respawn cycles each
/// succeed against a freshly spawned worker with the same argv.
#[tokio::test]
async fn p6_repeated_respawn_cycles_all_succeed() {
    let dir = tempdir().unwrap();
    let manager = start_manager(dir.path(), "p6", 1).await;
    let worker = manager.spawn_worker().await.unwrap();

    for i in 0..3 {
        let payload = format!("round-{i}").into_bytes();
        let reply = worker.call("echo", payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
        unsafe {
            libc::kill(worker.pid() as libc::pid_t, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    // One last call must still succeed after the final kill.
    let reply = worker.call("echo", b"final".to_vec()).await.unwrap();
    assert_eq!(reply, b"final");

    manager.stop().await.unwrap();
}

/// Closing a worker is idempotent and actually terminates its process.
#[tokio::test]
async fn worker_close_is_idempotent() {
    let dir = tempdir().unwrap();
    let manager = start_manager(dir.path(), "close-idem", 1).await;
    let worker = manager.spawn_worker().await.unwrap();
    worker.call("echo", b"x".to_vec()).await.unwrap();

    worker.close().await.unwrap();
    worker.close().await.unwrap();
    assert!(worker.is_closed());

    manager.stop().await.unwrap();
}

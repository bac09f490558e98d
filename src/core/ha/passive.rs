// src/core/ha/passive.rs

//! The Passive HA watcher: long-polls a consul-style KV store for
//! stolon's `clusterdata` document and reports master address changes.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::CoreResult;
use crate::core::errors::CoreError;
use crate::core::ha::adaptive::ClusterProtocol;
use crate::core::ha::uri::HaUri;
use crate::core::metrics;

const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CEILING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterAddr {
    pub host: String,
    pub port: u16,
}

#[derive(Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Deserialize)]
struct ClusterData {
    cluster: ClusterStatus,
    dbs: std::collections::HashMap<String, DbEntry>,
}

#[derive(Deserialize)]
struct ClusterStatus {
    status: ClusterStatusInner,
}

#[derive(Deserialize)]
struct ClusterStatusInner {
    master: String,
}

#[derive(Deserialize)]
struct DbEntry {
    status: DbStatus,
}

#[derive(Deserialize)]
struct DbStatus {
    healthy: bool,
    #[serde(rename = "listenAddress")]
    listen_address: String,
    port: u16,
}

struct Inner {
    tag: String,
    uri: HaUri,
    client: reqwest::Client,
    current_master: Mutex<Option<MasterAddr>>,
    protocol: Mutex<Option<Arc<dyn ClusterProtocol>>>,
    watching: std::sync::atomic::AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
    consensus_waiters: Mutex<Vec<oneshot::Sender<MasterAddr>>>,
    stop_signal: Arc<Notify>,
}

/// Watches a consul-backed stolon cluster's `clusterdata` key via long
/// polling and invokes [`ClusterProtocol::on_switch_over`] whenever the
/// designated master's address changes after the first observation.
#[derive(Clone)]
pub struct PassiveWatcher(Arc<Inner>);

/// Stops the watch on drop unless [`Self::defuse`] is called first. Used to
/// make [`PassiveWatcher::get_cluster_consensus`] cancellation-safe: if the
/// caller who started the watch abandons the wait, the long-poll loop it
/// started does not leak.
struct StopOnDrop {
    watcher: Option<PassiveWatcher>,
}

impl StopOnDrop {
    fn defuse(mut self) {
        self.watcher = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop_watching();
        }
    }
}

impl PassiveWatcher {
    pub fn new(tag: impl Into<String>, uri: HaUri) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()?;
        Ok(PassiveWatcher(Arc::new(Inner {
            tag: tag.into(),
            uri,
            client,
            current_master: Mutex::new(None),
            protocol: Mutex::new(None),
            watching: std::sync::atomic::AtomicBool::new(false),
            task: Mutex::new(None),
            consensus_waiters: Mutex::new(Vec::new()),
            stop_signal: Arc::new(Notify::new()),
        })))
    }

    pub fn current_master(&self) -> Option<MasterAddr> {
        self.0.current_master.lock().clone()
    }

    fn emit(&self, event: &str) {
        metrics::record_ha_event("passive", &self.0.tag, event);
    }

    /// Idempotent. Spawns the long-poll loop in the background. Returns
    /// `true` if this call actually started it (`watching` was false and is
    /// now true), `false` if a watch was already running.
    pub fn start_watching(&self, protocol: Option<Arc<dyn ClusterProtocol>>) -> bool {
        if self.0.watching.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return false;
        }
        *self.0.protocol.lock() = protocol;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.watch_loop().await });
        *self.0.task.lock() = Some(handle);
        true
    }

    pub fn stop_watching(&self) {
        self.0.watching.store(false, std::sync::atomic::Ordering::SeqCst);
        self.0.stop_signal.notify_waiters();
        if let Some(handle) = self.0.task.lock().take() {
            handle.abort();
        }
        *self.0.protocol.lock() = None;
    }

    /// Returns the current master, starting the watch if necessary and
    /// awaiting the first valid observation. If this call is the one that
    /// started the watch and the returned future is dropped before a master
    /// is observed (the waiter gave up), the watch is stopped rather than
    /// left running forever.
    pub async fn get_cluster_consensus(&self) -> CoreResult<MasterAddr> {
        if let Some(addr) = self.current_master() {
            return Ok(addr);
        }
        let (tx, rx) = oneshot::channel();
        self.0.consensus_waiters.lock().push(tx);
        let started_by_us = !self.0.watching.load(std::sync::atomic::Ordering::SeqCst) && self.start_watching(None);

        let guard = StopOnDrop {
            watcher: started_by_us.then(|| self.clone()),
        };
        let result = rx
            .await
            .map_err(|_| CoreError::HaTransport("watcher stopped before a master was observed".into()));
        guard.defuse();
        result
    }

    async fn watch_loop(&self) {
        let mut backoff = BACKOFF_FLOOR;
        let mut modify_index: Option<u64> = None;
        loop {
            if !self.0.watching.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            match self.poll_once(modify_index).await {
                Ok(next_index) => {
                    modify_index = Some(next_index);
                    backoff = BACKOFF_FLOOR;
                }
                Err(e) => {
                    warn!(error = %e, tag = %self.0.tag, "passive HA long-poll failed, backing off and reconnecting");
                    self.emit("reconnect");
                    // Jitter avoids a thundering herd of reconnects against the store
                    // when several watchers lose their long-poll at once.
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff + jitter) => {}
                        _ = self.0.stop_signal.notified() => return,
                    }
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }
        }
    }

    async fn poll_once(&self, modify_index: Option<u64>) -> CoreResult<u64> {
        let mut url = format!(
            "{}/v1/kv/stolon/cluster/{}/clusterdata?wait=90s",
            self.0.uri.base_url(),
            self.0.uri.cluster_name
        );
        if let Some(idx) = modify_index {
            url.push_str(&format!("&index={idx}"));
        }

        let resp = self.0.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::HaTransport(format!(
                "consul KV endpoint returned {}",
                resp.status()
            )));
        }
        let entries: Vec<KvEntry> = resp.json().await?;
        let entry = entries
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::HaTransport("empty KV response".into()))?;

        let decoded = BASE64
            .decode(entry.value.trim())
            .map_err(|e| CoreError::HaTransport(format!("clusterdata value is not valid base64: {e}")))?;
        let cluster_data: ClusterData = serde_json::from_slice(&decoded)?;

        let master_name = cluster_data.cluster.status.master;
        let Some(db) = cluster_data.dbs.get(&master_name) else {
            return Ok(entry.modify_index);
        };
        if !db.status.healthy {
            // Unhealthy observation: left unchanged, no callback.
            return Ok(entry.modify_index);
        }

        let addr = MasterAddr {
            host: db.status.listen_address.clone(),
            port: db.status.port,
        };
        self.observe_master(addr);
        Ok(entry.modify_index)
    }

    fn observe_master(&self, addr: MasterAddr) {
        let previous = {
            let mut current = self.0.current_master.lock();
            let previous = current.clone();
            *current = Some(addr.clone());
            previous
        };

        for waiter in std::mem::take(&mut *self.0.consensus_waiters.lock()) {
            let _ = waiter.send(addr.clone());
        }

        match previous {
            None => {
                info!(tag = %self.0.tag, host = %addr.host, port = addr.port, "passive HA observed initial master");
            }
            Some(prev) if prev != addr => {
                info!(tag = %self.0.tag, host = %addr.host, port = addr.port, "passive HA observed master change");
                self.emit("master_changed");
                if let Some(protocol) = self.0.protocol.lock().clone() {
                    tokio::spawn(async move {
                        protocol.on_switch_over().await;
                    });
                }
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ha::uri;

    fn test_uri() -> HaUri {
        uri::parse("stolon+consul://127.0.0.1:1/testcluster").unwrap()
    }

    #[tokio::test]
    async fn observe_master_does_not_fire_on_first_observation() {
        let watcher = PassiveWatcher::new("test", test_uri()).unwrap();
        watcher.observe_master(MasterAddr {
            host: "h1".into(),
            port: 5432,
        });
        assert_eq!(
            watcher.current_master(),
            Some(MasterAddr {
                host: "h1".into(),
                port: 5432
            })
        );
    }

    #[tokio::test]
    async fn p8_master_change_fires_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingProtocol(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl ClusterProtocol for CountingProtocol {
            async fn on_switch_over(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let watcher = PassiveWatcher::new("test", test_uri()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        *watcher.0.protocol.lock() = Some(Arc::new(CountingProtocol(calls.clone())));

        watcher.observe_master(MasterAddr {
            host: "h1".into(),
            port: 1,
        });
        watcher.observe_master(MasterAddr {
            host: "h2".into(),
            port: 2,
        });
        // Give the spawned on_switch_over task a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            watcher.current_master(),
            Some(MasterAddr {
                host: "h2".into(),
                port: 2
            })
        );
    }

    #[tokio::test]
    async fn repeated_observation_of_same_master_does_not_refire() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingProtocol(Arc<AtomicUsize>);
        #[async_trait::async_trait]
        impl ClusterProtocol for CountingProtocol {
            async fn on_switch_over(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let watcher = PassiveWatcher::new("test", test_uri()).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        *watcher.0.protocol.lock() = Some(Arc::new(CountingProtocol(calls.clone())));

        let addr = MasterAddr {
            host: "h1".into(),
            port: 1,
        };
        watcher.observe_master(addr.clone());
        watcher.observe_master(addr);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

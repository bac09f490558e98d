// src/core/ha/mod.rs

//! Backend HA failover detection: an Adaptive detector driven purely by
//! connection-pool events (G), a Passive watcher that long-polls a
//! consul/stolon-style cluster store (H), and the URI grammar used to pick
//! between them (I).

pub mod adaptive;
pub mod passive;
pub mod uri;

pub use adaptive::{AdaptiveConfig, AdaptiveHa, ClusterProtocol, HaState};
pub use passive::{MasterAddr, PassiveWatcher};
pub use uri::{HaUri, WireTag};

use std::sync::Arc;

use crate::core::CoreResult;

/// The HA watcher a server instance should run, chosen by parsing the
/// configured backend URI. Both variants implement the same
/// switch-over-notification contract, just driven by different signals.
pub enum HaWatcher {
    Adaptive(AdaptiveHa),
    Passive(PassiveWatcher),
}

/// Parses `uri` and constructs the matching watcher. Stolon/consul URIs
/// always select the passive watcher: the Adaptive detector has no URI of
/// its own, since it is driven by the local connection pool rather than an
/// external store, and is instead constructed directly by server startup
/// code that already owns a `ClusterProtocol`.
pub fn watcher_for_uri(tag: &str, uri: &str, protocol: Arc<dyn ClusterProtocol>) -> CoreResult<HaWatcher> {
    let parsed = uri::parse(uri)?;
    let watcher = PassiveWatcher::new(tag, parsed)?;
    watcher.start_watching(Some(protocol));
    Ok(HaWatcher::Passive(watcher))
}

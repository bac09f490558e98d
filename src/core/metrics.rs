// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the runtime coordination
//! core: signal delivery, supervisor outcomes, worker pool churn, and HA
//! state transitions.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire process lifetime.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_gauge_vec,
};

lazy_static! {
    // --- Signal Controller ---
    /// Total number of signal deliveries dispatched to registered waiters,
    /// labeled by signal number.
    pub static ref SIGNALS_DISPATCHED_TOTAL: CounterVec = register_counter_vec!(
        "ignis_signals_dispatched_total",
        "Total number of signal deliveries dispatched to registered waiters.",
        &["signo"]
    )
    .unwrap();
    /// Total number of `wait_for` calls that were cancelled by signal
    /// arrival rather than completing normally.
    pub static ref WAIT_FOR_CANCELLED_TOTAL: Counter = register_counter!(
        "ignis_wait_for_cancelled_total",
        "Total number of wait_for calls cancelled by signal arrival."
    )
    .unwrap();

    // --- Task Supervisor ---
    /// Total number of supervised tasks that finished with an error,
    /// labeled by whether the error was a base/uncatchable error.
    pub static ref SUPERVISOR_CHILD_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "ignis_supervisor_child_failures_total",
        "Total number of supervised child tasks that finished with an error.",
        &["kind"]
    )
    .unwrap();

    // --- Process Pool ---
    /// Total number of worker processes spawned, labeled by worker class.
    pub static ref WORKERS_SPAWNED_TOTAL: CounterVec = register_counter_vec!(
        "ignis_workers_spawned_total",
        "Total number of worker processes spawned.",
        &["class"]
    )
    .unwrap();
    /// Total number of worker processes killed, labeled by worker class.
    pub static ref WORKERS_KILLED_TOTAL: CounterVec = register_counter_vec!(
        "ignis_workers_killed_total",
        "Total number of worker processes killed.",
        &["class"]
    )
    .unwrap();
    /// Current size of a pool's warm buffer, labeled by worker class.
    pub static ref POOL_BUFFER_SIZE: GaugeVec = register_gauge_vec!(
        "ignis_pool_buffer_size",
        "Current size of a worker pool's warm buffer.",
        &["class"]
    )
    .unwrap();
    /// Current size of a pool's active set, labeled by worker class.
    pub static ref POOL_ACTIVE_SIZE: GaugeVec = register_gauge_vec!(
        "ignis_pool_active_size",
        "Current size of a worker pool's active worker set.",
        &["class"]
    )
    .unwrap();

    // --- HA Failover ---
    /// Total number of HA state-machine events, labeled by `(watcher, tag,
    /// event)`. Every state entry of the Adaptive detector, and every
    /// master-address change observed by the Passive watcher, emits one of
    /// these.
    pub static ref HA_EVENTS_TOTAL: CounterVec = register_counter_vec!(
        "ignis_ha_events_total",
        "Total number of HA state-machine events.",
        &["watcher", "tag", "event"]
    )
    .unwrap();
    /// 1 if the HA subsystem's current state is FAILOVER, 0 otherwise,
    /// labeled by tag.
    pub static ref HA_IN_FAILOVER: GaugeVec = register_gauge_vec!(
        "ignis_ha_in_failover",
        "Whether the HA subsystem currently considers itself in FAILOVER.",
        &["tag"]
    )
    .unwrap();
    /// Total number of `on_switch_over` invocations, labeled by tag.
    pub static ref HA_SWITCHOVERS_TOTAL: CounterVec = register_counter_vec!(
        "ignis_ha_switchovers_total",
        "Total number of on_switch_over invocations.",
        &["tag"]
    )
    .unwrap();

    /// Process-wide gauge mirroring the number of currently-alive signal
    /// controllers; used as a sanity check against controller leaks.
    pub static ref ACTIVE_SIGNAL_CONTROLLERS: Gauge = register_gauge!(
        "ignis_active_signal_controllers",
        "Number of currently-alive signal controllers."
    )
    .unwrap();
}

/// Records one HA state-machine event. Matches the specification's
/// `(adaptive://<tag>, <event>)` / `(passive://<tag>, <event>)` metric
/// contract, split into separate label dimensions for Prometheus.
pub fn record_ha_event(watcher: &str, tag: &str, event: &str) {
    HA_EVENTS_TOTAL.with_label_values(&[watcher, tag, event]).inc();
    if event == "to_failover" {
        HA_IN_FAILOVER.with_label_values(&[tag]).set(1.0);
        HA_SWITCHOVERS_TOTAL.with_label_values(&[tag]).inc();
    } else if event == "to_healthy" {
        HA_IN_FAILOVER.with_label_values(&[tag]).set(0.0);
    }
}

/// Gathers all registered metrics and encodes them in the Prometheus text
/// format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}

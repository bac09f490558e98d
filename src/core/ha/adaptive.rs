// src/core/ha/adaptive.rs

//! The Adaptive HA detector: a state machine driven entirely by the
//! connection pool's own connect/disconnect events, with no external
//! polling. Promotes to FAILOVER once a burst of unexpected disconnects
//! crosses a configurable fraction of the pool, sustained past a
//! minimum-time guard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::metrics;

/// Invoked at most once per transition into FAILOVER.
#[async_trait]
pub trait ClusterProtocol: Send + Sync {
    async fn on_switch_over(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaState {
    Healthy,
    Unhealthy,
    Failover,
}

pub struct AdaptiveConfig {
    pub unhealthy_min_time: Duration,
    pub unexpected_disconnects_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        AdaptiveConfig {
            unhealthy_min_time: Duration::from_secs(30),
            unexpected_disconnects_threshold: 0.60,
        }
    }
}

struct Counters {
    state: HaState,
    pgcon_count: u64,
    unexpected_disconnects: u64,
    sys_pgcon_healthy: bool,
    timer_expired: bool,
}

struct Inner {
    tag: String,
    config: AdaptiveConfig,
    counters: Mutex<Counters>,
    timer: Mutex<Option<JoinHandle<()>>>,
    protocol: Mutex<Option<Arc<dyn ClusterProtocol>>>,
}

/// Tracks backend connection health and declares FAILOVER based purely on
/// the shape of the connection pool's own churn, without any polling of
/// external cluster state.
///
/// Constructed instances start in [`HaState::Unhealthy`], not
/// [`HaState::Healthy`]: a fresh detector has not yet observed a successful
/// backend connection, so it cannot claim health. The steady state most
/// callers picture ("healthy, watching for trouble") is reached only after
/// the first successful non-hot-standby `on_pgcon_made`.
#[derive(Clone)]
pub struct AdaptiveHa(Arc<Inner>);

impl AdaptiveHa {
    pub fn new(tag: impl Into<String>, config: AdaptiveConfig, protocol: Arc<dyn ClusterProtocol>) -> Self {
        AdaptiveHa(Arc::new(Inner {
            tag: tag.into(),
            config,
            counters: Mutex::new(Counters {
                state: HaState::Unhealthy,
                pgcon_count: 0,
                unexpected_disconnects: 0,
                sys_pgcon_healthy: false,
                timer_expired: true,
            }),
            timer: Mutex::new(None),
            protocol: Mutex::new(Some(protocol)),
        }))
    }

    pub fn state(&self) -> HaState {
        self.0.counters.lock().state
    }

    fn emit(&self, event: &str) {
        metrics::record_ha_event("adaptive", &self.0.tag, event);
        info!(tag = %self.0.tag, event, "adaptive HA state transition");
    }

    /// A backend connection was unexpectedly lost — the event that drives
    /// HEALTHY → UNHEALTHY. `active_pgcon_num` is the pool's current count
    /// of other live connections, used to capture `pgcon_count` on that
    /// edge. Already-UNHEALTHY calls only grow `unexpected_disconnects`;
    /// they never touch `pgcon_count` (that is [`Self::on_pgcon_lost`]'s
    /// job), which keeps the `unexpected_disconnects <= pgcon_count`
    /// invariant intact.
    pub fn on_pgcon_broken(&self, active_pgcon_num: i64, is_sys: bool) {
        let mut should_start_timer = false;
        let mut should_recheck = false;
        {
            let mut c = self.0.counters.lock();
            if is_sys {
                c.sys_pgcon_healthy = false;
            }
            match c.state {
                HaState::Healthy => {
                    c.state = HaState::Unhealthy;
                    c.pgcon_count = (active_pgcon_num.max(0) as u64) + 1;
                    c.unexpected_disconnects = 1;
                    c.timer_expired = false;
                    should_start_timer = true;
                }
                HaState::Unhealthy => {
                    c.unexpected_disconnects += 1;
                    if c.timer_expired {
                        should_recheck = true;
                    }
                }
                HaState::Failover => {}
            }
        }
        if should_start_timer {
            self.emit("healthy_to_unhealthy");
            self.arm_timer();
        }
        if should_recheck {
            self.maybe_escalate();
        }
    }

    /// A previously captured backend connection slot disappeared from the
    /// pool without itself having unexpectedly disconnected (e.g. the pool
    /// shrank while already UNHEALTHY). Only shrinks the captured
    /// `pgcon_count`, floored at 1; never increments
    /// `unexpected_disconnects`.
    pub fn on_pgcon_lost(&self) {
        let mut should_recheck = false;
        {
            let mut c = self.0.counters.lock();
            if matches!(c.state, HaState::Unhealthy) {
                c.pgcon_count = c.pgcon_count.saturating_sub(1).max(1);
                if c.timer_expired {
                    should_recheck = true;
                }
            }
        }
        if should_recheck {
            self.maybe_escalate();
        }
    }

    /// A new backend connection was successfully established.
    /// `is_hot_standby` reflects whether the server identified as a replica;
    /// only a non-replica connection can clear UNHEALTHY.
    pub fn on_pgcon_made(&self, is_hot_standby: bool, is_sys: bool) {
        if is_sys {
            self.0.counters.lock().sys_pgcon_healthy = true;
        }
        if is_hot_standby {
            return;
        }
        let mut went_healthy = false;
        {
            let mut c = self.0.counters.lock();
            if matches!(c.state, HaState::Unhealthy) {
                c.state = HaState::Healthy;
                c.unexpected_disconnects = 0;
                c.pgcon_count = 0;
                went_healthy = true;
            } else if matches!(c.state, HaState::Failover) && c.sys_pgcon_healthy {
                c.state = HaState::Healthy;
                c.unexpected_disconnects = 0;
                c.pgcon_count = 0;
                went_healthy = true;
            }
        }
        if went_healthy {
            self.cancel_timer();
            self.emit("to_healthy");
        }
    }

    /// An explicit shutdown/hot-standby-promotion notification. Triggers an
    /// immediate FAILOVER regardless of current state.
    pub fn on_explicit_notification(&self) {
        self.enter_failover();
    }

    fn arm_timer(&self) {
        let this = self.clone();
        let duration = self.0.config.unhealthy_min_time;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            this.0.counters.lock().timer_expired = true;
            this.maybe_escalate();
        });
        *self.0.timer.lock() = Some(handle);
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.0.timer.lock().take() {
            handle.abort();
        }
    }

    fn maybe_escalate(&self) {
        let should_failover = {
            let c = self.0.counters.lock();
            matches!(c.state, HaState::Unhealthy)
                && c.timer_expired
                && !c.sys_pgcon_healthy
                && (c.unexpected_disconnects as f64) / (c.pgcon_count.max(1) as f64)
                    >= self.0.config.unexpected_disconnects_threshold
        };
        if should_failover {
            self.enter_failover();
        }
    }

    fn enter_failover(&self) {
        {
            let mut c = self.0.counters.lock();
            if matches!(c.state, HaState::Failover) {
                return;
            }
            c.state = HaState::Failover;
            c.unexpected_disconnects = 0;
            c.pgcon_count = 0;
        }
        self.cancel_timer();
        self.emit("to_failover");
        if let Some(protocol) = self.0.protocol.lock().clone() {
            tokio::spawn(async move {
                protocol.on_switch_over().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProtocol(Arc<AtomicUsize>);

    #[async_trait]
    impl ClusterProtocol for CountingProtocol {
        async fn on_switch_over(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn starts_unhealthy_not_healthy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ha = AdaptiveHa::new("test", AdaptiveConfig::default(), Arc::new(CountingProtocol(calls)));
        assert_eq!(ha.state(), HaState::Unhealthy);
    }

    #[test]
    fn first_healthy_connection_clears_unhealthy_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ha = AdaptiveHa::new("test", AdaptiveConfig::default(), Arc::new(CountingProtocol(calls)));
        ha.on_pgcon_made(false, false);
        assert_eq!(ha.state(), HaState::Healthy);
    }

    #[tokio::test]
    async fn p7_threshold_breach_triggers_exactly_one_failover() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = AdaptiveConfig {
            unhealthy_min_time: Duration::from_millis(100),
            unexpected_disconnects_threshold: 0.6,
        };
        let ha = AdaptiveHa::new("test", config, Arc::new(CountingProtocol(calls.clone())));
        ha.on_pgcon_made(false, false);

        // pgcon_count captured as 5 on the first unexpected disconnect; the
        // next two unexpected disconnects bring the ratio to 3/5 == 0.6.
        ha.on_pgcon_broken(4, false);
        ha.on_pgcon_broken(0, false);
        ha.on_pgcon_broken(0, false);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(ha.state(), HaState::Failover);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_pgcon_lost_floors_pgcon_count_at_one_and_never_touches_unexpected() {
        let calls = Arc::new(AtomicUsize::new(0));
        let ha = AdaptiveHa::new("test", AdaptiveConfig::default(), Arc::new(CountingProtocol(calls)));
        ha.on_pgcon_made(false, false); // -> Healthy
        ha.on_pgcon_broken(0, false); // Healthy -> Unhealthy: pgcon_count = 1, unexpected = 1
        for _ in 0..10 {
            ha.on_pgcon_lost();
        }
        let c = ha.0.counters.lock();
        assert_eq!(c.pgcon_count, 1);
        assert_eq!(c.unexpected_disconnects, 1);
    }

    #[test]
    fn unexpected_disconnects_never_exceeds_pgcon_count() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = AdaptiveConfig {
            unhealthy_min_time: Duration::from_secs(30),
            unexpected_disconnects_threshold: 0.6,
        };
        let ha = AdaptiveHa::new("test", config, Arc::new(CountingProtocol(calls)));
        ha.on_pgcon_made(false, false); // -> Healthy
        ha.on_pgcon_broken(0, false); // Healthy -> Unhealthy: pgcon_count = 1
        // A mix of expected pool-shrink events and further unexpected
        // disconnects must never push the ratio past 1.0.
        ha.on_pgcon_lost();
        ha.on_pgcon_lost();
        ha.on_pgcon_broken(0, false);
        let c = ha.0.counters.lock();
        assert!(c.unexpected_disconnects <= c.pgcon_count);
    }
}

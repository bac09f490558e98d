// src/config.rs

//! Server configuration: loading, resolving, and validating the settings
//! that wire up the runtime coordination core — which signals the top-level
//! `SignalController` watches, which worker-process pools to run, which HA
//! watcher to install, and the ambient timeouts and metrics endpoint.
//!
//! Follows the same raw/resolved split the reference codebase uses for its
//! own settings module: a [`RawConfig`] carries `#[serde(default = "...")]`
//! helpers for every optional field and is deserialized straight from TOML;
//! [`Config::from_file`] resolves it (applying environment overrides for the
//! two HA knobs the specification calls out) and validates the result,
//! turning inconsistent settings into a descriptive startup error rather
//! than silent misbehavior.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment override for [`HaConfig::Adaptive`]'s `unhealthy_min_time`,
/// per the specification's external-interfaces table.
const ENV_UNHEALTHY_MIN_TIME: &str = "EDGEDB_SERVER_BACKEND_ADAPTIVE_HA_UNHEALTHY_MIN_TIME";
/// Environment override for [`HaConfig::Adaptive`]'s disconnect-ratio
/// threshold, expressed as an integer percentage.
const ENV_DISCONNECT_PERCENT: &str = "EDGEDB_SERVER_BACKEND_ADAPTIVE_HA_DISCONNECT_PERCENT";

/// The final, validated, and resolved server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub log_level: String,
    /// Directory holding the ephemeral Pool Hub sockets; the core owns no
    /// other persisted state.
    pub runstate_dir: PathBuf,
    /// Symbolic names of the signals the top-level `SignalController`
    /// should watch (e.g. `["SIGTERM", "SIGINT", "SIGHUP", "SIGUSR1"]`).
    pub signals: Vec<String>,
    pub pools: Vec<PoolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ha: Option<HaConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

/// One worker-process pool: the argv template used to exec its workers and
/// the warm-buffer size to maintain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub worker_binary: PathBuf,
    pub cls_name: String,
    #[serde(default)]
    pub cls_args_b64: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    4
}

/// Which HA subsystem to run: the connection-pool-driven Adaptive detector,
/// or the external-store-polling Passive watcher (selected by URI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum HaConfig {
    Adaptive {
        #[serde(with = "humantime_serde", default = "default_unhealthy_min_time")]
        unhealthy_min_time: Duration,
        /// Fraction in `[0.0, 1.0]` of `pgcon_count` that must be lost to
        /// escalate UNHEALTHY to FAILOVER.
        #[serde(default = "default_disconnect_threshold")]
        unexpected_disconnects_threshold: f64,
    },
    Passive {
        /// `<backend>+<store>[+<wire>]://host:port/<cluster_name>`, parsed
        /// by [`crate::core::ha::uri::parse`].
        uri: String,
    },
}

fn default_unhealthy_min_time() -> Duration {
    Duration::from_secs(30)
}

fn default_disconnect_threshold() -> f64 {
    0.60
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// The two timeouts the specification calls out by name:
/// `PROCESS_INITIAL_RESPONSE_TIMEOUT` and `KILL_TIMEOUT`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(
        with = "humantime_serde",
        default = "default_process_initial_response_timeout"
    )]
    pub process_initial_response_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_kill_timeout")]
    pub kill_timeout: Duration,
}

fn default_process_initial_response_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        TimeoutsConfig {
            process_initial_response_timeout: default_process_initial_response_timeout(),
            kill_timeout: default_kill_timeout(),
        }
    }
}

impl From<TimeoutsConfig> for crate::core::procpool::PoolTimeouts {
    fn from(cfg: TimeoutsConfig) -> Self {
        crate::core::procpool::PoolTimeouts {
            process_initial_response_timeout: cfg.process_initial_response_timeout,
            kill_timeout: cfg.kill_timeout,
        }
    }
}

/// A raw representation of the config file before environment overrides,
/// resolution, and validation.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_runstate_dir")]
    runstate_dir: PathBuf,
    #[serde(default = "default_signals")]
    signals: Vec<String>,
    #[serde(default)]
    pools: Vec<PoolConfig>,
    #[serde(default)]
    ha: Option<HaConfig>,
    #[serde(default)]
    metrics: MetricsConfig,
    #[serde(default)]
    timeouts: TimeoutsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_runstate_dir() -> PathBuf {
    std::env::temp_dir().join("ignis-core")
}

fn default_signals() -> Vec<String> {
    vec![
        "SIGTERM".to_string(),
        "SIGINT".to_string(),
        "SIGHUP".to_string(),
        "SIGUSR1".to_string(),
    ]
}

impl Config {
    /// Reads and parses a TOML file, applies environment overrides for the
    /// HA knobs the specification names explicitly, and validates the
    /// result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs_read(path)?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML from '{path}'"))?;

        let ha = apply_ha_env_overrides(raw.ha)?;

        let config = Config {
            host: raw.host,
            log_level: raw.log_level,
            runstate_dir: raw.runstate_dir,
            signals: raw.signals,
            pools: raw.pools,
            ha,
            metrics: raw.metrics,
            timeouts: raw.timeouts,
        };

        config.validate()?;
        Ok(config)
    }

    /// Resolves the configured signal names to their raw OS signal numbers.
    pub fn signal_numbers(&self) -> Result<Vec<i32>> {
        self.signals.iter().map(|s| parse_signal_name(s)).collect()
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.signals.is_empty() {
            return Err(anyhow!(
                "signals cannot be empty: the top-level SignalController needs at least one signal to watch"
            ));
        }
        for name in &self.signals {
            parse_signal_name(name)
                .with_context(|| format!("invalid entry in `signals`: '{name}'"))?;
        }

        let mut seen_names = std::collections::HashSet::new();
        for pool in &self.pools {
            if pool.name.trim().is_empty() {
                return Err(anyhow!("a pool config cannot have an empty name"));
            }
            if !seen_names.insert(pool.name.clone()) {
                return Err(anyhow!("duplicate pool name '{}'", pool.name));
            }
            if pool.pool_size == 0 {
                return Err(anyhow!("pool '{}' must have pool_size > 0", pool.name));
            }
            if pool.cls_name.trim().is_empty() {
                return Err(anyhow!("pool '{}' must set cls_name", pool.name));
            }
        }

        if let Some(HaConfig::Adaptive {
            unexpected_disconnects_threshold,
            ..
        }) = &self.ha
        {
            if !(0.0..=1.0).contains(unexpected_disconnects_threshold) {
                return Err(anyhow!(
                    "ha.unexpected_disconnects_threshold must be between 0.0 and 1.0, got {}",
                    unexpected_disconnects_threshold
                ));
            }
        }
        if let Some(HaConfig::Passive { uri }) = &self.ha {
            crate::core::ha::uri::parse(uri)
                .map_err(|e| anyhow!("ha.uri is invalid: {e}"))?;
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0 when metrics are enabled"));
        }

        if self.timeouts.process_initial_response_timeout.is_zero() {
            return Err(anyhow!(
                "timeouts.process_initial_response_timeout must be greater than 0"
            ));
        }
        if self.timeouts.kill_timeout.is_zero() {
            return Err(anyhow!("timeouts.kill_timeout must be greater than 0"));
        }

        Ok(())
    }
}

fn fs_read(path: &str) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read config file at '{path}'"))
}

/// Overrides an [`HaConfig::Adaptive`] variant's thresholds from the two
/// environment variables the specification names, leaving any configured
/// [`HaConfig::Passive`] watcher untouched.
fn apply_ha_env_overrides(ha: Option<HaConfig>) -> Result<Option<HaConfig>> {
    let Some(HaConfig::Adaptive {
        mut unhealthy_min_time,
        mut unexpected_disconnects_threshold,
    }) = ha
    else {
        return Ok(ha);
    };

    if let Ok(val) = std::env::var(ENV_UNHEALTHY_MIN_TIME) {
        let secs: u64 = val.trim().parse().with_context(|| {
            format!("{ENV_UNHEALTHY_MIN_TIME} must be an integer number of seconds, got '{val}'")
        })?;
        unhealthy_min_time = Duration::from_secs(secs);
    }
    if let Ok(val) = std::env::var(ENV_DISCONNECT_PERCENT) {
        let percent: u64 = val.trim().parse().with_context(|| {
            format!("{ENV_DISCONNECT_PERCENT} must be an integer percentage, got '{val}'")
        })?;
        unexpected_disconnects_threshold = (percent as f64) / 100.0;
    }

    Ok(Some(HaConfig::Adaptive {
        unhealthy_min_time,
        unexpected_disconnects_threshold,
    }))
}

/// Parses a symbolic signal name (`"SIGTERM"`, `"TERM"`, or a bare integer)
/// into its raw OS signal number.
fn parse_signal_name(name: &str) -> Result<i32> {
    let trimmed = name.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        return Ok(n);
    }
    let upper = trimmed.to_ascii_uppercase();
    let stripped = upper.strip_prefix("SIG").unwrap_or(&upper);
    match stripped {
        "TERM" => Ok(libc::SIGTERM),
        "INT" => Ok(libc::SIGINT),
        "HUP" => Ok(libc::SIGHUP),
        "USR1" => Ok(libc::SIGUSR1),
        "USR2" => Ok(libc::SIGUSR2),
        "QUIT" => Ok(libc::SIGQUIT),
        other => Err(anyhow!("unrecognized signal name '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_signal_names_case_insensitively() {
        assert_eq!(parse_signal_name("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal_name("term").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal_name("SigUsr1").unwrap(), libc::SIGUSR1);
    }

    #[test]
    fn rejects_unknown_signal_name() {
        assert!(parse_signal_name("SIGBOGUS").is_err());
    }

    #[test]
    fn env_override_replaces_adaptive_thresholds() {
        // SAFETY: test-only, single-threaded access to process env within this test.
        unsafe {
            std::env::set_var(ENV_UNHEALTHY_MIN_TIME, "5");
            std::env::set_var(ENV_DISCONNECT_PERCENT, "75");
        }
        let ha = Some(HaConfig::Adaptive {
            unhealthy_min_time: Duration::from_secs(30),
            unexpected_disconnects_threshold: 0.60,
        });
        let resolved = apply_ha_env_overrides(ha).unwrap().unwrap();
        match resolved {
            HaConfig::Adaptive {
                unhealthy_min_time,
                unexpected_disconnects_threshold,
            } => {
                assert_eq!(unhealthy_min_time, Duration::from_secs(5));
                assert!((unexpected_disconnects_threshold - 0.75).abs() < f64::EPSILON);
            }
            _ => panic!("expected Adaptive variant"),
        }
        unsafe {
            std::env::remove_var(ENV_UNHEALTHY_MIN_TIME);
            std::env::remove_var(ENV_DISCONNECT_PERCENT);
        }
    }

    #[test]
    fn passive_ha_is_left_untouched_by_adaptive_env_overrides() {
        let ha = Some(HaConfig::Passive {
            uri: "stolon+consul://host/cluster".to_string(),
        });
        let resolved = apply_ha_env_overrides(ha.clone()).unwrap();
        assert!(matches!(resolved, Some(HaConfig::Passive { .. })));
    }

    #[test]
    fn validate_rejects_empty_signals() {
        let cfg = Config {
            host: "127.0.0.1".into(),
            log_level: "info".into(),
            runstate_dir: PathBuf::from("/tmp/ignis-core-test"),
            signals: vec![],
            pools: vec![],
            ha: None,
            metrics: MetricsConfig::default(),
            timeouts: TimeoutsConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_pool_size() {
        let cfg = Config {
            host: "127.0.0.1".into(),
            log_level: "info".into(),
            runstate_dir: PathBuf::from("/tmp/ignis-core-test"),
            signals: default_signals(),
            pools: vec![PoolConfig {
                name: "echo".into(),
                worker_binary: PathBuf::from("/bin/true"),
                cls_name: "echo".into(),
                cls_args_b64: String::new(),
                pool_size: 0,
            }],
            ha: None,
            metrics: MetricsConfig::default(),
            timeouts: TimeoutsConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let cfg = Config {
            host: "127.0.0.1".into(),
            log_level: "info".into(),
            runstate_dir: PathBuf::from("/tmp/ignis-core-test"),
            signals: default_signals(),
            pools: vec![],
            ha: Some(HaConfig::Adaptive {
                unhealthy_min_time: Duration::from_secs(30),
                unexpected_disconnects_threshold: 1.5,
            }),
            metrics: MetricsConfig::default(),
            timeouts: TimeoutsConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_toml() {
        let toml_src = r#"
            host = "0.0.0.0"
            log_level = "debug"
            runstate_dir = "/tmp/ignis-runstate"
            signals = ["SIGTERM", "SIGINT"]

            [[pools]]
            name = "echo"
            worker_binary = "/usr/local/bin/ignis-worker"
            cls_name = "echo"
            pool_size = 2

            [ha]
            mode = "adaptive"
            unhealthy_min_time = "15s"
            unexpected_disconnects_threshold = 0.5

            [metrics]
            enabled = true
            port = 9000
        "#;
        let raw: RawConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(raw.host, "0.0.0.0");
        assert_eq!(raw.pools.len(), 1);
        assert_eq!(raw.pools[0].pool_size, 2);
        match raw.ha.unwrap() {
            HaConfig::Adaptive {
                unhealthy_min_time, ..
            } => assert_eq!(unhealthy_min_time, Duration::from_secs(15)),
            _ => panic!("expected adaptive HA"),
        }
    }
}

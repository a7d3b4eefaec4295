//! Configuration for the machine agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::controller::{ControllerConfig, MonitorStrategy};

/// Which network provider the agent uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// In-memory addresses, no host devices.
    Mock,
    /// Real TAP devices.
    Tap,
}

/// Which liveness strategy controllers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    Polling,
    Events,
}

/// Machine agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,

    pub monitor: MonitorMode,

    /// Interval between healthchecks when polling.
    pub health_interval: Duration,

    /// Reconnect backoff cap of the guest event listener.
    pub listener_max_backoff: Duration,

    /// Fraction by which each listener reconnect delay is randomly spread.
    pub listener_jitter: f64,

    /// Pause between failed reconciliation attempts.
    pub retry_delay: Duration,

    pub network: NetworkMode,

    /// Subnet machine links are carved from.
    pub tap_subnet: String,

    pub tap_mtu: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/kiln"),
            log_level: "info".to_string(),
            monitor: MonitorMode::Polling,
            health_interval: Duration::from_millis(2000),
            listener_max_backoff: Duration::from_millis(1000),
            listener_jitter: 0.2,
            retry_delay: Duration::from_millis(100),
            network: NetworkMode::Mock,
            tap_subnet: "172.30.0.0/24".to_string(),
            tap_mtu: 1500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// unset keys. Malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(v) => match v.parse() {
                    Ok(ms) => Ok(Duration::from_millis(ms)),
                    Err(_) => bail!("{key} must be a number of milliseconds, got {v:?}"),
                },
                None => Ok(default),
            }
        };

        let monitor = match lookup("KILN_MONITOR").as_deref() {
            None | Some("polling") => MonitorMode::Polling,
            Some("events") => MonitorMode::Events,
            Some(other) => bail!("KILN_MONITOR must be 'polling' or 'events', got {other:?}"),
        };

        let network = match lookup("KILN_NETWORK").as_deref() {
            None | Some("mock") => NetworkMode::Mock,
            Some("tap") => NetworkMode::Tap,
            Some(other) => bail!("KILN_NETWORK must be 'mock' or 'tap', got {other:?}"),
        };

        let listener_jitter = match lookup("KILN_LISTENER_JITTER") {
            Some(v) => match v.parse::<f64>() {
                Ok(jitter) if (0.0..=1.0).contains(&jitter) => jitter,
                _ => bail!("KILN_LISTENER_JITTER must be between 0 and 1, got {v:?}"),
            },
            None => defaults.listener_jitter,
        };

        let tap_mtu = match lookup("KILN_TAP_MTU") {
            Some(v) => match v.parse() {
                Ok(mtu) => mtu,
                Err(_) => bail!("KILN_TAP_MTU must be a number, got {v:?}"),
            },
            None => defaults.tap_mtu,
        };

        Ok(Self {
            data_dir: lookup("KILN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_level: lookup("KILN_LOG_LEVEL").unwrap_or(defaults.log_level),
            monitor,
            health_interval: millis("KILN_HEALTH_INTERVAL_MS", defaults.health_interval)?,
            listener_max_backoff: millis(
                "KILN_LISTENER_MAX_BACKOFF_MS",
                defaults.listener_max_backoff,
            )?,
            listener_jitter,
            retry_delay: millis("KILN_RETRY_DELAY_MS", defaults.retry_delay)?,
            network,
            tap_subnet: lookup("KILN_TAP_SUBNET").unwrap_or(defaults.tap_subnet),
            tap_mtu,
        })
    }

    /// Controller settings derived from this configuration.
    pub fn controller(&self) -> ControllerConfig {
        let monitor = match self.monitor {
            MonitorMode::Polling => MonitorStrategy::Polling {
                interval: self.health_interval,
            },
            MonitorMode::Events => MonitorStrategy::EventStream {
                max_backoff: self.listener_max_backoff,
                jitter: self.listener_jitter,
            },
        };

        ControllerConfig {
            monitor,
            retry_delay: self.retry_delay,
        }
    }

    /// Path of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("kiln.db")
    }
}

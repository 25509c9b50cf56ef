use pkg_constants::presence::{
    HEARTBEAT_INTERVAL_SECS, MARK_OFFLINE_ON_EXIT, MAX_HEARTBEAT_INTERVAL_SECS,
    MAX_STOP_TIMEOUT_MS, STOP_TIMEOUT_MS,
};
use pkg_constants::state::{
    LEADER_LEASE_TTL_SECS, LEADER_RENEW_INTERVAL_DIVISOR, MAX_LEADER_LEASE_TTL_SECS,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Presence engine configuration file (YAML).
///
/// Example `presence.yaml`:
/// ```yaml
/// lease-ttl-secs: 15
/// heartbeat-interval-secs: 30
/// stop-timeout-ms: 3000
/// mark-offline-on-exit: false
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfigFile {
    #[serde(default, alias = "lease-ttl-secs")]
    pub lease_ttl_secs: Option<u64>,
    #[serde(default, alias = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, alias = "stop-timeout-ms")]
    pub stop_timeout_ms: Option<u64>,
    #[serde(default, alias = "mark-offline-on-exit")]
    pub mark_offline_on_exit: Option<bool>,
}

/// Runtime settings for leader election, heartbeats and teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceConfig {
    pub lease_ttl: Duration,
    pub renew_interval: Duration,
    pub heartbeat_interval: Duration,
    pub stop_timeout: Duration,
    /// Write `offline` when the agent is torn down. Off by default: a closing
    /// leader would mark the identity offline while other agents stay open.
    pub mark_offline_on_exit: bool,
}

impl PresenceConfig {
    /// Merge a config file over the built-in defaults. Values that are zero
    /// or above their upper bound fall back to the default.
    pub fn from_file(file: &PresenceConfigFile) -> Self {
        let defaults = Self::default();
        let lease_ttl = file
            .lease_ttl_secs
            .filter(|secs| (1..=MAX_LEADER_LEASE_TTL_SECS).contains(secs))
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);
        Self {
            lease_ttl,
            renew_interval: lease_ttl / LEADER_RENEW_INTERVAL_DIVISOR as u32,
            heartbeat_interval: file
                .heartbeat_interval_secs
                .filter(|secs| (1..=MAX_HEARTBEAT_INTERVAL_SECS).contains(secs))
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            stop_timeout: file
                .stop_timeout_ms
                .filter(|ms| *ms <= MAX_STOP_TIMEOUT_MS)
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_timeout),
            mark_offline_on_exit: file
                .mark_offline_on_exit
                .unwrap_or(defaults.mark_offline_on_exit),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(LEADER_LEASE_TTL_SECS),
            renew_interval: Duration::from_secs(
                LEADER_LEASE_TTL_SECS / LEADER_RENEW_INTERVAL_DIVISOR,
            ),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            stop_timeout: Duration::from_millis(STOP_TIMEOUT_MS),
            mark_offline_on_exit: MARK_OFFLINE_ON_EXIT,
        }
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

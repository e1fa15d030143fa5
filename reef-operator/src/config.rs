//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The Kubernetes namespace this operator manages.
    pub namespace: String,
    /// The name of the pod on which this instance is running.
    pub pod_name: String,

    /// Path of the data-plane admin tool binary.
    #[serde(default = "Config::default_dataplane_tool")]
    pub dataplane_tool: String,
    /// Path of the data-plane config file handed to the admin tool.
    #[serde(default = "Config::default_dataplane_conf")]
    pub dataplane_conf: String,

    /// Maximum number of OSDs which may be stopped together during updates.
    #[serde(default = "Config::default_ok_to_stop_max")]
    pub ok_to_stop_max: u32,
    /// Number of times an ok-to-stop query may error before its OSD is dropped
    /// from the update pass.
    #[serde(default = "Config::default_ok_to_stop_retries")]
    pub ok_to_stop_retries: u32,
    /// Interval in milliseconds between opportunistic polls of provisioning
    /// status records.
    #[serde(default = "Config::default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Upper bound in seconds on waiting for provisioning status records.
    #[serde(default = "Config::default_status_wait_timeout_secs")]
    pub status_wait_timeout_secs: u64,
    /// Interval in seconds between data-plane health checks.
    #[serde(default = "Config::default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Grace period in seconds before a DOWN OSD is reported.
    #[serde(default = "Config::default_health_down_grace_secs")]
    pub health_down_grace_secs: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        envy::from_env().context("error building config from env")
    }

    fn default_dataplane_tool() -> String {
        "ceph".into()
    }

    fn default_dataplane_conf() -> String {
        "/etc/ceph/ceph.conf".into()
    }

    fn default_ok_to_stop_max() -> u32 {
        20
    }

    fn default_ok_to_stop_retries() -> u32 {
        3
    }

    fn default_status_poll_interval_ms() -> u64 {
        1_000
    }

    fn default_status_wait_timeout_secs() -> u64 {
        900 // 15 minutes.
    }

    fn default_health_check_interval_secs() -> u64 {
        60
    }

    fn default_health_down_grace_secs() -> u64 {
        600 // 10 minutes.
    }
}

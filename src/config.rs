//! Runtime configuration.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The default name of the leader election lock.
pub const DEFAULT_LOCK_NAME: &str = "network-operator-lock";
/// The default location of the service account namespace file mounted into each pod.
pub const DEFAULT_SERVICE_ACCOUNT_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,

    /// The name of the ConfigMap used as the leader election lock.
    #[serde(default = "Config::default_lock_name")]
    pub lock_name: String,
    /// The name of the pod on which this instance is running.
    ///
    /// This is expected to be injected via the downward API.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// An explicit namespace for the operator, overriding the service account namespace file.
    #[serde(default)]
    pub operator_namespace: Option<String>,
    /// The path of the service account namespace file.
    #[serde(default = "Config::default_service_account_namespace_path")]
    pub service_account_namespace_path: String,
    /// The mode in which the operator is running.
    #[serde(default)]
    pub run_mode: RunMode,

    /// The first interval to wait between lock acquisition attempts, in milliseconds.
    #[serde(default = "Config::default_leader_initial_backoff_ms")]
    pub leader_initial_backoff_ms: u64,
    /// The ceiling of the lock acquisition retry interval, in seconds.
    #[serde(default = "Config::default_leader_max_backoff_seconds")]
    pub leader_max_backoff_seconds: u64,
    /// The jitter factor applied to each retry interval.
    #[serde(default = "Config::default_leader_backoff_jitter")]
    pub leader_backoff_jitter: f64,
    /// The number of consecutive malformed lock observations after which warnings are emitted.
    #[serde(default = "Config::default_leader_malformed_lock_warn_threshold")]
    pub leader_malformed_lock_warn_threshold: u32,
}

/// The mode in which the operator is running.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Running as a pod within a cluster.
    #[default]
    Cluster,
    /// Running outside of a cluster, as for local development.
    Local,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        // Surface invalid election timings at startup rather than at election time.
        config.election_config()?;
        Ok(config)
    }

    /// Build the leader election config from this runtime config.
    pub fn election_config(&self) -> Result<ElectionConfig> {
        ElectionConfig::new(
            Duration::from_millis(self.leader_initial_backoff_ms),
            Duration::from_secs(self.leader_max_backoff_seconds),
            self.leader_backoff_jitter,
            self.leader_malformed_lock_warn_threshold,
            self.identity_config(),
        )
    }

    /// Build the identity config from this runtime config.
    pub fn identity_config(&self) -> IdentityConfig {
        IdentityConfig {
            pod_name: self.pod_name.clone(),
            operator_namespace: self.operator_namespace.clone(),
            service_account_namespace_path: self.service_account_namespace_path.clone(),
            run_mode: self.run_mode,
        }
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_lock_name() -> String {
        DEFAULT_LOCK_NAME.into()
    }

    fn default_service_account_namespace_path() -> String {
        DEFAULT_SERVICE_ACCOUNT_NAMESPACE_PATH.into()
    }

    fn default_leader_initial_backoff_ms() -> u64 {
        1000
    }

    fn default_leader_max_backoff_seconds() -> u64 {
        16
    }

    fn default_leader_backoff_jitter() -> f64 {
        0.2
    }

    fn default_leader_malformed_lock_warn_threshold() -> u32 {
        5
    }
}

/// Settings used to resolve the identity & scope of this process.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// The name of the pod on which this instance is running.
    pub pod_name: Option<String>,
    /// An explicit namespace override.
    pub operator_namespace: Option<String>,
    /// The path of the service account namespace file.
    pub service_account_namespace_path: String,
    /// The mode in which the operator is running.
    pub run_mode: RunMode,
}

/// Configuration for leader election.
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// The first interval to wait between lock acquisition attempts.
    pub initial_backoff: Duration,
    /// The ceiling of the retry interval, doubling stops here.
    ///
    /// Defaults to 16 seconds.
    pub max_backoff: Duration,
    /// The jitter factor applied symmetrically around each retry interval.
    pub jitter: f64,
    /// The number of consecutive malformed lock observations after which each further
    /// observation is logged as a warning.
    pub malformed_lock_warn_threshold: u32,
    /// Identity resolution settings.
    pub identity: IdentityConfig,
}

impl ElectionConfig {
    /// Create a new `ElectionConfig` instance, validating given inputs.
    pub fn new(initial_backoff: Duration, max_backoff: Duration, jitter: f64, malformed_lock_warn_threshold: u32, identity: IdentityConfig) -> Result<Self> {
        ensure!(!initial_backoff.is_zero(), "initial backoff must be greater than zero");
        ensure!(max_backoff >= initial_backoff, "max backoff must be greater than or equal to the initial backoff");
        ensure!((0.0..1.0).contains(&jitter), "backoff jitter must be within [0, 1), got {}", jitter);
        Ok(Self {
            initial_backoff,
            max_backoff,
            jitter,
            malformed_lock_warn_threshold,
            identity,
        })
    }

    /// Create a config with default timings for a pod running in the given namespace.
    #[cfg(test)]
    pub fn new_test(namespace: Option<&str>, pod_name: Option<&str>) -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(16),
            jitter: 0.2,
            malformed_lock_warn_threshold: 5,
            identity: IdentityConfig {
                pod_name: pod_name.map(String::from),
                operator_namespace: namespace.map(String::from),
                // Never present, so that an unset namespace means running outside of a cluster.
                service_account_namespace_path: "/nonexistent/serviceaccount/namespace".into(),
                run_mode: RunMode::Cluster,
            },
        }
    }
}

//! Runtime configuration of the proxy core.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Context;
use pkg_constants::proxy::{
    DEFAULT_AFFINITY_SWEEP_INTERVAL_SECS, DEFAULT_EXECUTOR_TIMEOUT_MS,
    DEFAULT_PENDING_ENDPOINTS_TTL_SECS, DEFAULT_RESYNC_INTERVAL_SECS,
};
use pkg_types::config::{NoEndpointsPolicy, ProxyConfigFile};

use crate::flows::SynthesisConfig;
use crate::registers::parse_ipv4;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Source address for hairpin traffic. `None` rewrites to the Service VIP.
    pub hairpin_address: Option<Ipv4Addr>,
    pub no_endpoints_policy: NoEndpointsPolicy,
    /// Bound on every executor call.
    pub executor_timeout: Duration,
    pub retry: RetryConfig,
    pub affinity_sweep_interval: Duration,
    /// How long Endpoints wait for their Service before being dropped.
    pub pending_endpoints_ttl: Duration,
    /// Period at which degraded Services are re-driven.
    pub resync_interval: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hairpin_address: None,
            no_endpoints_policy: NoEndpointsPolicy::default(),
            executor_timeout: Duration::from_millis(DEFAULT_EXECUTOR_TIMEOUT_MS),
            retry: RetryConfig::default(),
            affinity_sweep_interval: Duration::from_secs(DEFAULT_AFFINITY_SWEEP_INTERVAL_SECS),
            pending_endpoints_ttl: Duration::from_secs(DEFAULT_PENDING_ENDPOINTS_TTL_SECS),
            resync_interval: Duration::from_secs(DEFAULT_RESYNC_INTERVAL_SECS),
        }
    }
}

impl ProxyConfig {
    /// Defaults overlaid with whatever the config file sets.
    pub fn from_file(file: &ProxyConfigFile) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(addr) = &file.hairpin_address {
            config.hairpin_address =
                Some(parse_ipv4(addr).with_context(|| format!("hairpin-address {}", addr))?);
        }
        if let Some(policy) = file.no_endpoints_policy {
            config.no_endpoints_policy = policy;
        }
        if let Some(ms) = file.executor_timeout_ms {
            anyhow::ensure!(ms > 0, "executor-timeout-ms must be positive");
            config.executor_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.retry_max_attempts {
            config.retry.max_attempts = attempts;
        }
        if let Some(secs) = file.affinity_sweep_interval_secs {
            anyhow::ensure!(secs > 0, "affinity-sweep-interval-secs must be positive");
            config.affinity_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.pending_endpoints_ttl_secs {
            config.pending_endpoints_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = file.resync_interval_secs {
            anyhow::ensure!(secs > 0, "resync-interval-secs must be positive");
            config.resync_interval = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        SynthesisConfig {
            hairpin_address: self.hairpin_address,
            no_endpoints_policy: self.no_endpoints_policy,
        }
    }
}

use serde::{Deserialize, Serialize};

/// What a Service with no ready endpoints does with its traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoEndpointsPolicy {
    /// Silently drop packets addressed to the Service.
    #[default]
    Blackhole,
    /// Reject packets (TCP RST / ICMP unreachable).
    Reject,
}

impl std::str::FromStr for NoEndpointsPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blackhole" => Ok(NoEndpointsPolicy::Blackhole),
            "reject" => Ok(NoEndpointsPolicy::Reject),
            other => Err(anyhow::anyhow!(
                "unknown no-endpoints policy '{}' (expected blackhole or reject)",
                other
            )),
        }
    }
}

/// Flow proxy configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// server: http://10.0.0.1:6443
/// token: my-secret-token
/// status-port: 10256
/// hairpin-address: 169.254.169.252
/// no-endpoints-policy: reject
/// executor-timeout-ms: 2000
/// retry-max-attempts: 5
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, alias = "status-port")]
    pub status_port: Option<u16>,
    /// Source address for hairpin traffic. Unset means the Service VIP.
    #[serde(default, alias = "hairpin-address")]
    pub hairpin_address: Option<String>,
    #[serde(default, alias = "no-endpoints-policy")]
    pub no_endpoints_policy: Option<NoEndpointsPolicy>,
    #[serde(default, alias = "executor-timeout-ms")]
    pub executor_timeout_ms: Option<u64>,
    #[serde(default, alias = "retry-max-attempts")]
    pub retry_max_attempts: Option<u32>,
    #[serde(default, alias = "affinity-sweep-interval-secs")]
    pub affinity_sweep_interval_secs: Option<u64>,
    #[serde(default, alias = "pending-endpoints-ttl-secs")]
    pub pending_endpoints_ttl_secs: Option<u64>,
    #[serde(default, alias = "resync-interval-secs")]
    pub resync_interval_secs: Option<u64>,
    #[serde(default, alias = "log-json")]
    pub log_json: Option<bool>,
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

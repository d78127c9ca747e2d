mod status;
mod watch;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use pkg_constants::network::{DEFAULT_API_ADDR, DEFAULT_STATUS_PORT};
use pkg_metrics::MetricsRegistry;
use pkg_proxy::{MemoryBridge, ProxyConfig, ServiceProxy};
use pkg_types::config::{NoEndpointsPolicy, ProxyConfigFile, load_config_file};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::watch::WatchClient;

#[derive(Parser, Debug)]
#[command(name = "k3rs-flowproxy", about = "k3rs flow-table service proxy")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = "/etc/k3rs/flowproxy.yaml")]
    config: String,

    /// Server API endpoint
    #[arg(long)]
    server: Option<String>,

    /// Bearer token for the watch API
    #[arg(long)]
    token: Option<String>,

    /// Port of the status / dump HTTP server
    #[arg(long)]
    status_port: Option<u16>,

    /// Source address written on hairpin traffic (default: the Service VIP)
    #[arg(long)]
    hairpin_address: Option<String>,

    /// What Services without ready endpoints do: blackhole or reject
    #[arg(long)]
    no_endpoints_policy: Option<NoEndpointsPolicy>,

    /// Bound on a single flow table call, in milliseconds
    #[arg(long)]
    executor_timeout_ms: Option<u64>,

    /// Attempts per flow table call before a Service is marked degraded
    #[arg(long)]
    retry_max_attempts: Option<u32>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// CLI args > config file > defaults.
    fn merge(self, file: ProxyConfigFile) -> ProxyConfigFile {
        ProxyConfigFile {
            server: self.server.or(file.server),
            token: self.token.or(file.token),
            status_port: self.status_port.or(file.status_port),
            hairpin_address: self.hairpin_address.or(file.hairpin_address),
            no_endpoints_policy: self.no_endpoints_policy.or(file.no_endpoints_policy),
            executor_timeout_ms: self.executor_timeout_ms.or(file.executor_timeout_ms),
            retry_max_attempts: self.retry_max_attempts.or(file.retry_max_attempts),
            log_json: if self.log_json { Some(true) } else { file.log_json },
            ..file
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// First characters of the token, for logging.
fn token_prefix(token: &str) -> String {
    token.chars().take(4).collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone();

    // Load config file (returns defaults if file not found)
    let file_cfg: ProxyConfigFile = load_config_file(&config_path)?;
    let merged = cli.merge(file_cfg);
    init_tracing(merged.log_json.unwrap_or(false));
    info!("Config file: {}", config_path);

    let config = ProxyConfig::from_file(&merged)?;
    let server = merged
        .server
        .clone()
        .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());
    let token = merged
        .token
        .clone()
        .unwrap_or_else(|| "demo-token-123".to_string());
    let status_port = merged.status_port.unwrap_or(DEFAULT_STATUS_PORT);

    info!("Starting k3rs-flowproxy");
    info!("  Server:       {}", server);
    info!("  Token:        {}***", token_prefix(&token));
    info!("  Status port:  {}", status_port);
    info!("  Exec timeout: {:?}", config.executor_timeout);

    let metrics = Arc::new(MetricsRegistry::for_proxy());
    let proxy = Arc::new(ServiceProxy::new(
        Arc::new(MemoryBridge::new()),
        config,
        metrics,
    ));
    proxy.start().await?;

    let (tx, rx) = mpsc::channel(1024);
    let watcher = WatchClient::new(&server, &token)?;
    tokio::spawn(watcher.run(tx));

    let events_proxy = proxy.clone();
    tokio::spawn(async move { events_proxy.run(rx).await });

    let status_proxy = proxy.clone();
    let addr = SocketAddr::from(([0, 0, 0, 0], status_port));
    tokio::spawn(async move {
        if let Err(e) = status::serve(status_proxy, addr).await {
            error!("Status server failed: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down k3rs-flowproxy");
    Ok(())
}

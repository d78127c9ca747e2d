use std::sync::{Arc, Mutex};

use pkg_metrics::MetricsRegistry;
use pkg_types::service::ServiceKey;
use pkg_types::watch::ObjectEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::affinity::AffinityStore;
use crate::config::ProxyConfig;
use crate::datapath::Datapath;
use crate::executor::FlowExecutor;
use crate::flows::learned_flow;
use crate::reconciler::{Reconciler, ServiceStatus};
use crate::table::TableId;

use pkg_constants::flow::SESSION_AFFINITY_TABLE;

/// Flow-table Service proxy: programs Service load balancing into the
/// forwarding table behind `executor`.
///
/// Feed it Service and Endpoint events; it keeps the table converged,
/// owns the session affinity bindings, and answers dumps.
pub struct ServiceProxy {
    executor: Arc<dyn FlowExecutor>,
    affinity: Arc<AffinityStore>,
    reconciler: Reconciler,
    metrics: Arc<MetricsRegistry>,
    config: ProxyConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceProxy {
    pub fn new(
        executor: Arc<dyn FlowExecutor>,
        config: ProxyConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let affinity = Arc::new(AffinityStore::new(metrics.clone()));
        let reconciler = Reconciler::new(
            executor.clone(),
            affinity.clone(),
            metrics.clone(),
            config.clone(),
        );
        Self {
            executor,
            affinity,
            reconciler,
            metrics,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Install the static pipeline and start the affinity sweeper.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            "Starting ServiceProxy (no-endpoints policy: {:?}, hairpin: {})",
            self.config.no_endpoints_policy,
            self.config
                .hairpin_address
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "service VIP".to_string())
        );
        self.reconciler.install_pipeline().await?;

        let handle = self
            .affinity
            .clone()
            .spawn_sweeper(self.config.affinity_sweep_interval);
        let mut sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    pub fn handle(&self, event: ObjectEvent) {
        self.reconciler.handle(event);
    }

    /// Consume events until the sender side closes.
    pub async fn run(&self, mut events: mpsc::Receiver<ObjectEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        warn!("ServiceProxy event stream closed");
    }

    /// Wait until every event handed in so far has been applied.
    pub async fn settle(&self) {
        self.reconciler.settle().await;
    }

    pub fn status(&self, key: &ServiceKey) -> Option<ServiceStatus> {
        self.reconciler.status(key)
    }

    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.reconciler.statuses()
    }

    pub fn datapath(&self) -> Datapath {
        Datapath::new(self.executor.clone(), self.affinity.clone())
    }

    pub fn affinity(&self) -> &Arc<AffinityStore> {
        &self.affinity
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Installed flows, plus learned affinity bindings when table 40 is
    /// included, one `ovs-ofctl dump-flows` style line each.
    pub async fn dump_flows(&self, table: Option<TableId>) -> anyhow::Result<Vec<String>> {
        let mut lines: Vec<String> = self
            .executor
            .dump_flows(table)
            .await?
            .iter()
            .map(|f| f.to_string())
            .collect();
        if table.is_none_or(|t| t == SESSION_AFFINITY_TABLE) {
            lines.extend(
                self.affinity
                    .bindings()
                    .iter()
                    .map(|(key, binding)| learned_flow(key, binding).to_string()),
            );
        }
        Ok(lines)
    }

    pub async fn dump_groups(&self) -> anyhow::Result<Vec<String>> {
        Ok(self
            .executor
            .dump_groups()
            .await?
            .iter()
            .map(|g| g.to_string())
            .collect())
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock()
            && let Some(handle) = sweeper.take()
        {
            handle.abort();
        }
    }
}

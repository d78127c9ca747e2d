//! Session affinity store: sticky client → endpoint bindings with sliding expiry.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pkg_metrics::{AFFINITY_BINDINGS, AFFINITY_EVICTIONS, MetricsRegistry};
use pkg_types::service::{Protocol, ServiceKey, ServicePortName};
use tracing::{debug, info};

use crate::registers::EndpointRegisters;

/// Client plus the Service target it connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AffinityKey {
    pub client: Ipv4Addr,
    pub vip: Ipv4Addr,
    pub port: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityBinding {
    pub owner: ServicePortName,
    pub endpoint: EndpointRegisters,
    pub ttl: Duration,
    pub last_seen: Instant,
}

impl AffinityBinding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) >= self.ttl
    }
}

/// Concurrent binding store shared by the datapath, the reconciler, and the sweeper.
pub struct AffinityStore {
    bindings: DashMap<AffinityKey, AffinityBinding>,
    metrics: Arc<MetricsRegistry>,
}

impl AffinityStore {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            bindings: DashMap::new(),
            metrics,
        }
    }

    /// Record (or overwrite) the endpoint chosen for a client.
    pub fn learn(
        &self,
        key: AffinityKey,
        owner: ServicePortName,
        endpoint: EndpointRegisters,
        ttl: Duration,
        now: Instant,
    ) {
        let previous = self.bindings.insert(
            key,
            AffinityBinding {
                owner,
                endpoint,
                ttl,
                last_seen: now,
            },
        );
        if previous.is_none() {
            self.metrics.gauge_add(AFFINITY_BINDINGS, 1);
        }
        debug!(
            "Affinity learned: {} -> {} via {}:{}",
            key.client,
            endpoint.socket_addr(),
            key.vip,
            key.port
        );
    }

    /// Live binding for `key`, refreshing its expiry. Expired bindings are dropped.
    pub fn lookup(&self, key: &AffinityKey, now: Instant) -> Option<EndpointRegisters> {
        {
            let mut entry = self.bindings.get_mut(key)?;
            if !entry.is_expired(now) {
                entry.last_seen = now;
                return Some(entry.endpoint);
            }
        }
        if self
            .bindings
            .remove_if(key, |_, b| b.is_expired(now))
            .is_some()
        {
            self.evicted(1);
        }
        None
    }

    /// Drop bindings that point at an endpoint of `owner` being removed.
    pub fn invalidate_endpoint(&self, owner: &ServicePortName, endpoint: &EndpointRegisters) -> usize {
        self.remove_where(|b| &b.owner == owner && b.endpoint == *endpoint)
    }

    /// Drop every binding of one Service port.
    pub fn invalidate_port(&self, owner: &ServicePortName) -> usize {
        self.remove_where(|b| &b.owner == owner)
    }

    /// Drop every binding of a Service.
    pub fn invalidate_service(&self, service: &ServiceKey) -> usize {
        self.remove_where(|b| &b.owner.service == service)
    }

    /// Remove expired bindings. Never creates or refreshes any.
    pub fn sweep(&self, now: Instant) -> usize {
        self.remove_where(|b| b.is_expired(now))
    }

    /// Snapshot of all bindings, sorted by key.
    pub fn bindings(&self) -> Vec<(AffinityKey, AffinityBinding)> {
        let mut out: Vec<_> = self
            .bindings
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn remove_where(&self, pred: impl Fn(&AffinityBinding) -> bool) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| !pred(b));
        let removed = before.saturating_sub(self.bindings.len());
        self.evicted(removed);
        removed
    }

    fn evicted(&self, n: usize) {
        if n > 0 {
            self.metrics.gauge_add(AFFINITY_BINDINGS, -(n as i64));
            self.metrics.counter_add(AFFINITY_EVICTIONS, n as u64);
        }
    }

    /// Start the periodic expiry sweep as a background task.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Affinity sweeper started (interval={}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep(Instant::now());
                if removed > 0 {
                    debug!("Affinity sweeper removed {} expired bindings", removed);
                }
            }
        })
    }
}

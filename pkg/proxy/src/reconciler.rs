//! Per-Service reconciliation of desired against installed table state.
//!
//! Every Service key gets its own ordered queue served by a dedicated task,
//! so keys converge independently while events for one key apply strictly
//! in arrival order. A queued Service delete supersedes whatever work is
//! still pending for that key, including a retry loop in progress.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use pkg_constants::flow::ENDPOINT_DNAT_TABLE;
use pkg_constants::proxy::KEY_QUEUE_CAPACITY;
use pkg_metrics::{
    DEGRADED_SERVICES, EVENTS_PROCESSED, EXECUTOR_CALLS, EXECUTOR_FAILURES, EXECUTOR_RETRIES,
    INSTALLED_FLOWS, INSTALLED_GROUPS, MetricsRegistry, ORPHAN_ENDPOINTS_DROPPED,
};
use pkg_types::endpoint::Endpoint;
use pkg_types::service::{Protocol, Service, ServiceKey, ServicePortName};
use pkg_types::watch::{EventType, Object, ObjectEvent, ObjectKind};
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::affinity::AffinityStore;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::executor::FlowExecutor;
use crate::flows::{
    SynthesisConfig, Synthesized, TableState, pipeline_flows, service_port_names, synthesize,
};
use crate::group::GroupIdAllocator;
use crate::registers::{EndpointRegisters, GroupId};
use crate::retry::{RetryError, retry_with_backoff};
use crate::table::{FlowEntry, FlowKey, Group};

/// One executor mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    InstallFlow(FlowEntry),
    InstallGroup(Group),
    RemoveGroup(GroupId),
    RemoveFlow(FlowKey),
}

impl TableOp {
    fn name(&self) -> &'static str {
        match self {
            TableOp::InstallFlow(_) => "install_flow",
            TableOp::InstallGroup(_) => "install_group",
            TableOp::RemoveGroup(_) => "remove_group",
            TableOp::RemoveFlow(_) => "remove_flow",
        }
    }

    fn is_removal(&self) -> bool {
        matches!(self, TableOp::RemoveFlow(_) | TableOp::RemoveGroup(_))
    }

    async fn apply(&self, executor: &dyn FlowExecutor) -> Result<()> {
        match self {
            TableOp::InstallFlow(flow) => executor.install_flow(flow).await,
            TableOp::InstallGroup(group) => executor.install_group(group).await,
            TableOp::RemoveGroup(id) => executor.remove_group(*id).await,
            TableOp::RemoveFlow(key) => executor.remove_flow(key).await,
        }
    }
}

impl fmt::Display for TableOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableOp::InstallFlow(flow) => write!(f, "install_flow {}", flow.key()),
            TableOp::InstallGroup(group) => write!(f, "install_group {}", group.id),
            TableOp::RemoveGroup(id) => write!(f, "remove_group {}", id),
            TableOp::RemoveFlow(key) => write!(f, "remove_flow {}", key),
        }
    }
}

const GROUP_RANK: u8 = 2;

/// Dependency rank: an entry only references entries of a lower rank.
/// NAT rules reference nothing, the learn rule resubmits to NAT, buckets
/// resubmit to NAT or the learn rule, dispatch rules point at groups.
fn flow_rank(flow: &FlowEntry) -> u8 {
    if flow.table == ENDPOINT_DNAT_TABLE {
        0
    } else if flow.is_learn() {
        1
    } else {
        3
    }
}

/// Operations taking the table from `installed` to `desired`.
///
/// Installs come first in ascending dependency rank, then removals of
/// stale entries in descending rank, so no entry ever references one that
/// is missing. `unconfirmed` holds entries whose install failed and whose
/// presence on the switch is unknown: they are reinstalled if desired and
/// removed otherwise. Identical states yield no operations.
pub fn plan(installed: &TableState, unconfirmed: &TableState, desired: &TableState) -> Vec<TableOp> {
    let mut installs: Vec<(u8, TableOp)> = Vec::new();
    for (key, flow) in &desired.flows {
        if installed.flows.get(key) != Some(flow) || unconfirmed.flows.contains_key(key) {
            installs.push((flow_rank(flow), TableOp::InstallFlow(flow.clone())));
        }
    }
    for (id, group) in &desired.groups {
        if installed.groups.get(id) != Some(group) || unconfirmed.groups.contains_key(id) {
            installs.push((GROUP_RANK, TableOp::InstallGroup(group.clone())));
        }
    }

    let mut stale_flows: BTreeMap<&FlowKey, u8> = BTreeMap::new();
    for (key, flow) in installed.flows.iter().chain(&unconfirmed.flows) {
        if !desired.flows.contains_key(key) {
            stale_flows.insert(key, flow_rank(flow));
        }
    }
    let stale_groups: BTreeSet<GroupId> = installed
        .groups
        .keys()
        .chain(unconfirmed.groups.keys())
        .filter(|id| !desired.groups.contains_key(id))
        .copied()
        .collect();

    let mut removes: Vec<(u8, TableOp)> = stale_flows
        .into_iter()
        .map(|(key, rank)| (rank, TableOp::RemoveFlow(key.clone())))
        .chain(
            stale_groups
                .into_iter()
                .map(|id| (GROUP_RANK, TableOp::RemoveGroup(id))),
        )
        .collect();

    installs.sort_by_key(|(rank, _)| *rank);
    removes.sort_by_key(|(rank, _)| Reverse(*rank));
    installs.into_iter().chain(removes).map(|(_, op)| op).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Absent,
    Pending,
    Installed,
    Removing,
}

/// Observable reconciliation state of one Service key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub key: ServiceKey,
    pub phase: Phase,
    /// Retries ran out; the key is re-driven on every resync tick.
    pub degraded: bool,
    pub flows: usize,
    pub groups: usize,
    pub ready_endpoints: usize,
    /// Endpoints are held waiting for their Service.
    pub buffered_endpoints: bool,
    pub last_error: Option<String>,
}

/// Frontend of a Service as seen by affinity bindings.
type Frontend = (Option<String>, Vec<(String, u16, Protocol)>);

fn frontend(service: &Service) -> Frontend {
    (
        service.cluster_ip.clone(),
        service
            .spec
            .ports
            .iter()
            .map(|p| (p.name.clone(), p.port, p.protocol))
            .collect(),
    )
}

/// What affinity bindings of a key may point at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct AffinityView {
    frontend: Option<Frontend>,
    backends: BTreeMap<ServicePortName, BTreeSet<EndpointRegisters>>,
    affinity_ports: BTreeSet<ServicePortName>,
}

/// Everything the worker of one key knows. Owned by that worker alone.
#[derive(Default)]
struct ServiceState {
    service: Option<Service>,
    endpoint: Option<Endpoint>,
    orphan_since: Option<Instant>,
    installed: TableState,
    unconfirmed: TableState,
    group_ids: BTreeMap<ServicePortName, GroupId>,
    /// View as of the last completed convergence.
    affinity: AffinityView,
    phase: Option<Phase>,
    degraded: bool,
    last_error: Option<String>,
}

impl ServiceState {
    fn is_idle(&self) -> bool {
        self.service.is_none()
            && self.endpoint.is_none()
            && self.installed.is_empty()
            && self.unconfirmed.is_empty()
            && self.group_ids.is_empty()
            && !self.degraded
    }

    fn record_success(&mut self, op: &TableOp, metrics: &MetricsRegistry) {
        match op {
            TableOp::InstallFlow(flow) => {
                let key = flow.key();
                self.unconfirmed.flows.remove(&key);
                if self.installed.flows.insert(key, flow.clone()).is_none() {
                    metrics.gauge_add(INSTALLED_FLOWS, 1);
                }
            }
            TableOp::InstallGroup(group) => {
                self.unconfirmed.groups.remove(&group.id);
                if self.installed.groups.insert(group.id, group.clone()).is_none() {
                    metrics.gauge_add(INSTALLED_GROUPS, 1);
                }
            }
            TableOp::RemoveFlow(key) => {
                self.unconfirmed.flows.remove(key);
                if self.installed.flows.remove(key).is_some() {
                    metrics.gauge_add(INSTALLED_FLOWS, -1);
                }
            }
            TableOp::RemoveGroup(id) => {
                self.unconfirmed.groups.remove(id);
                if self.installed.groups.remove(id).is_some() {
                    metrics.gauge_add(INSTALLED_GROUPS, -1);
                }
            }
        }
    }

    fn record_failure(&mut self, op: &TableOp) {
        match op {
            TableOp::InstallFlow(flow) => self.unconfirmed.insert_flow(flow.clone()),
            TableOp::InstallGroup(group) => {
                self.unconfirmed.groups.insert(group.id, group.clone());
            }
            TableOp::RemoveGroup(_) | TableOp::RemoveFlow(_) => {}
        }
    }

    fn status(&self, key: &ServiceKey) -> ServiceStatus {
        ServiceStatus {
            key: key.clone(),
            phase: self.phase.unwrap_or(Phase::Absent),
            degraded: self.degraded,
            flows: self.installed.flows.len(),
            groups: self.installed.groups.len(),
            ready_endpoints: self.affinity.backends.values().map(BTreeSet::len).sum(),
            buffered_endpoints: self.orphan_since.is_some(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Ordered event queue of one key.
#[derive(Default)]
struct KeyQueue {
    events: Mutex<VecDeque<ObjectEvent>>,
    notify: Notify,
    pending_deletes: AtomicUsize,
}

impl KeyQueue {
    /// Queue `event` and wake the worker. Returns how many queued events
    /// it superseded.
    fn push(&self, event: ObjectEvent) -> usize {
        let mut events = lock(&self.events);
        let mut superseded = 0;
        if event.is_service_delete() {
            self.pending_deletes.fetch_add(1, Ordering::SeqCst);
            let before = events.len();
            events.retain(|e| e.kind != ObjectKind::Service || e.is_service_delete());
            superseded = before - events.len();
        } else if events.len() >= KEY_QUEUE_CAPACITY {
            // Full: the newest snapshot of a kind replaces the latest queued one.
            if let Some(pos) = events
                .iter()
                .rposition(|e| e.kind == event.kind && !e.is_service_delete())
            {
                events.remove(pos);
                superseded = 1;
            }
        }
        events.push_back(event);
        drop(events);
        self.notify.notify_one();
        superseded
    }

    fn pop(&self) -> Option<ObjectEvent> {
        let event = lock(&self.events).pop_front()?;
        if event.is_service_delete() {
            self.pending_deletes.fetch_sub(1, Ordering::SeqCst);
        }
        Some(event)
    }

    fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    fn delete_pending(&self) -> bool {
        self.pending_deletes.load(Ordering::SeqCst) > 0
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    executor: Arc<dyn FlowExecutor>,
    affinity: Arc<AffinityStore>,
    metrics: Arc<MetricsRegistry>,
    config: ProxyConfig,
    synthesis: SynthesisConfig,
    group_ids: Mutex<GroupIdAllocator>,
    workers: Mutex<HashMap<ServiceKey, Arc<KeyQueue>>>,
    statuses: DashMap<ServiceKey, ServiceStatus>,
    in_flight: watch::Sender<usize>,
}

/// Drives the executor so installed state follows the Service and
/// Endpoint events it is fed.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        executor: Arc<dyn FlowExecutor>,
        affinity: Arc<AffinityStore>,
        metrics: Arc<MetricsRegistry>,
        config: ProxyConfig,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                executor,
                affinity,
                metrics,
                synthesis: config.synthesis(),
                config,
                group_ids: Mutex::new(GroupIdAllocator::new()),
                workers: Mutex::new(HashMap::new()),
                statuses: DashMap::new(),
                in_flight,
            }),
        }
    }

    /// Install the static flows every packet walks through.
    pub async fn install_pipeline(&self) -> Result<()> {
        for flow in pipeline_flows() {
            let op = TableOp::InstallFlow(flow);
            match self.inner.execute(None, &op).await {
                Ok(()) => self.inner.metrics.gauge_add(INSTALLED_FLOWS, 1),
                Err(RetryError::Failed { error, .. }) => return Err(error),
                Err(RetryError::Cancelled { .. }) => {
                    return Err(ProxyError::rejected(op.name(), "cancelled"));
                }
            }
        }
        info!("Pipeline flows installed");
        Ok(())
    }

    /// Queue an event on its key. Must be called from within a tokio runtime.
    pub fn handle(&self, event: ObjectEvent) {
        self.inner.enqueue(event);
    }

    /// Wait until every queued event has been applied.
    pub async fn settle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn status(&self, key: &ServiceKey) -> Option<ServiceStatus> {
        self.inner.statuses.get(key).map(|s| s.clone())
    }

    /// Status of every known key, sorted by key.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        let mut out: Vec<ServiceStatus> = self
            .inner
            .statuses
            .iter()
            .map(|e| e.value().clone())
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

impl Inner {
    fn enqueue(self: &Arc<Self>, event: ObjectEvent) {
        self.in_flight.send_modify(|n| *n += 1);
        let key = event.key.clone();

        let mut workers = lock(&self.workers);
        let queue = match workers.get(&key) {
            Some(queue) => queue.clone(),
            None => {
                let queue = Arc::new(KeyQueue::default());
                workers.insert(key.clone(), queue.clone());
                tokio::spawn(self.clone().run_worker(key.clone(), queue.clone()));
                queue
            }
        };
        let superseded = queue.push(event);
        drop(workers);

        if superseded > 0 {
            debug!("{} queued event(s) for {} superseded", superseded, key);
            self.finish(superseded);
        }
    }

    fn finish(&self, n: usize) {
        self.in_flight.send_modify(|count| *count = count.saturating_sub(n));
    }

    /// Remove the worker of an idle key. Fails if events arrived meanwhile.
    fn retire(&self, key: &ServiceKey, queue: &Arc<KeyQueue>) -> bool {
        let mut workers = lock(&self.workers);
        if !queue.is_empty() {
            return false;
        }
        if workers.get(key).is_some_and(|q| Arc::ptr_eq(q, queue)) {
            workers.remove(key);
        }
        self.statuses.remove(key);
        true
    }

    async fn run_worker(self: Arc<Self>, key: ServiceKey, queue: Arc<KeyQueue>) {
        debug!("Worker started for {}", key);
        let period = self.config.resync_interval;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = ServiceState::default();

        loop {
            let was_degraded = state.degraded;
            while let Some(event) = queue.pop() {
                self.apply(&key, &queue, &mut state, event).await;
                self.finish(1);
            }
            if state.degraded && !was_degraded {
                resync.reset();
            }

            if state.is_idle() && self.retire(&key, &queue) {
                debug!("Worker for {} exiting", key);
                return;
            }

            let orphan_deadline = state
                .orphan_since
                .map(|since| since + self.config.pending_endpoints_ttl);
            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = resync.tick(), if state.degraded => {
                    info!("Resyncing degraded service {}", key);
                    self.converge(&key, &queue, &mut state).await;
                }
                _ = tokio::time::sleep_until(orphan_deadline.unwrap_or_else(Instant::now)),
                    if orphan_deadline.is_some() => {
                    self.drop_orphan(&key, &mut state);
                }
            }
        }
    }

    async fn apply(
        &self,
        key: &ServiceKey,
        queue: &KeyQueue,
        state: &mut ServiceState,
        event: ObjectEvent,
    ) {
        self.metrics.counter_inc(EVENTS_PROCESSED);
        let ObjectEvent {
            kind,
            event_type,
            object,
            ..
        } = event;
        debug!("Applying {:?} {} {}", event_type, kind, key);

        match (kind, event_type, object) {
            (ObjectKind::Service, EventType::Delete, _) => {
                // Endpoints of a deleted Service are not kept for a later one.
                state.service = None;
                state.endpoint = None;
            }
            (ObjectKind::Endpoint, EventType::Delete, _) => state.endpoint = None,
            (ObjectKind::Service, _, Some(Object::Service(svc))) if svc.key() == *key => {
                state.service = Some(svc);
            }
            (ObjectKind::Endpoint, _, Some(Object::Endpoint(ep))) if ep.service_key() == *key => {
                state.endpoint = Some(ep);
            }
            (kind, event_type, _) => {
                let err = ProxyError::InvalidObject {
                    key: key.to_string(),
                    reason: format!("{:?} {} without a matching snapshot", event_type, kind),
                };
                warn!("Ignoring event: {}", err);
                return;
            }
        }

        match (&state.service, &state.endpoint) {
            (None, Some(_)) => {
                if state.orphan_since.is_none() {
                    let err = ProxyError::InconsistentSnapshot {
                        key: key.to_string(),
                    };
                    warn!("Buffering endpoints: {}", err);
                    state.orphan_since = Some(Instant::now());
                }
            }
            _ => state.orphan_since = None,
        }

        self.converge(key, queue, state).await;
    }

    fn drop_orphan(&self, key: &ServiceKey, state: &mut ServiceState) {
        let err = ProxyError::InconsistentSnapshot {
            key: key.to_string(),
        };
        warn!("Dropping buffered endpoints after {:?}: {}", self.config.pending_endpoints_ttl, err);
        self.metrics.counter_inc(ORPHAN_ENDPOINTS_DROPPED);
        state.endpoint = None;
        state.orphan_since = None;
        state.last_error = None;
        self.publish(key, state);
    }

    fn publish(&self, key: &ServiceKey, state: &ServiceState) {
        self.statuses.insert(key.clone(), state.status(key));
    }

    fn synthesize(&self, state: &mut ServiceState) -> Synthesized {
        let Some(service) = &state.service else {
            return Synthesized::default();
        };
        {
            let mut allocator = lock(&self.group_ids);
            for name in service_port_names(service) {
                state
                    .group_ids
                    .entry(name)
                    .or_insert_with(|| allocator.allocate());
            }
        }
        synthesize(
            service,
            state.endpoint.as_ref(),
            &state.group_ids,
            &self.synthesis,
        )
    }

    /// Drop bindings that point at something `next` no longer has.
    ///
    /// Safe to call more than once for the same transition.
    fn invalidate_affinity(&self, key: &ServiceKey, previous: &AffinityView, next: &AffinityView) {
        let mut removed = 0;
        if previous.frontend.is_some() && previous.frontend != next.frontend {
            // Deleted, or VIP/ports moved: every binding of the Service is stale.
            removed += self.affinity.invalidate_service(key);
        } else {
            for (port, before) in &previous.backends {
                match next.backends.get(port) {
                    None => removed += self.affinity.invalidate_port(port),
                    Some(current) => {
                        for endpoint in before.difference(current) {
                            removed += self.affinity.invalidate_endpoint(port, endpoint);
                        }
                    }
                }
            }
            for port in previous.affinity_ports.difference(&next.affinity_ports) {
                removed += self.affinity.invalidate_port(port);
            }
        }
        if removed > 0 {
            info!("Invalidated {} affinity binding(s) of {}", removed, key);
        }
    }

    async fn converge(&self, key: &ServiceKey, queue: &KeyQueue, state: &mut ServiceState) {
        if queue.delete_pending() {
            debug!("Delete queued for {}, skipping convergence", key);
            self.publish(key, state);
            return;
        }

        let next = self.synthesize(state);
        let next_view = AffinityView {
            frontend: state.service.as_ref().map(frontend),
            backends: next.backends.clone(),
            affinity_ports: next.affinity_ports.clone(),
        };
        state.last_error = match next.errors.first() {
            Some(err) => Some(err.to_string()),
            None if state.orphan_since.is_some() => Some(
                ProxyError::InconsistentSnapshot {
                    key: key.to_string(),
                }
                .to_string(),
            ),
            None => None,
        };

        let ops = plan(&state.installed, &state.unconfirmed, &next.desired);
        if !ops.is_empty() {
            state.phase = Some(if state.service.is_some() {
                Phase::Pending
            } else {
                Phase::Removing
            });
            info!("Reconciling {}: {} table operation(s)", key, ops.len());
            self.publish(key, state);
        }

        // Bindings are dropped once the installs are done: until then the
        // old group can still hand out a removed endpoint.
        let first_removal = ops.iter().position(TableOp::is_removal);
        for (i, op) in ops.iter().enumerate() {
            if first_removal == Some(i) {
                self.invalidate_affinity(key, &state.affinity, &next_view);
            }
            if queue.delete_pending() {
                debug!("Delete queued for {}, abandoning reconciliation", key);
                self.publish(key, state);
                return;
            }
            match self.execute(Some(queue), op).await {
                Ok(()) => state.record_success(op, &self.metrics),
                Err(RetryError::Cancelled { attempts }) => {
                    state.record_failure(op);
                    debug!("{} for {} cancelled after {} attempt(s)", op, key, attempts);
                    self.publish(key, state);
                    return;
                }
                Err(RetryError::Failed { error, attempts }) => {
                    state.record_failure(op);
                    error!(
                        "Reconciling {} failed at {} after {} attempt(s): {}",
                        key, op, attempts, error
                    );
                    if !state.degraded {
                        state.degraded = true;
                        self.metrics.gauge_add(DEGRADED_SERVICES, 1);
                    }
                    state.last_error = Some(error.to_string());
                    self.publish(key, state);
                    return;
                }
            }
        }

        // Again, for bindings learned while the removals ran.
        self.invalidate_affinity(key, &state.affinity, &next_view);
        state.affinity = next_view;

        if state.degraded {
            state.degraded = false;
            self.metrics.gauge_add(DEGRADED_SERVICES, -1);
            info!("Service {} recovered", key);
        }

        let live: BTreeSet<ServicePortName> = state
            .service
            .as_ref()
            .map(service_port_names)
            .unwrap_or_default()
            .into_iter()
            .collect();
        {
            let mut allocator = lock(&self.group_ids);
            state.group_ids.retain(|name, id| {
                let keep = live.contains(name);
                if !keep {
                    allocator.release(*id);
                }
                keep
            });
        }

        state.phase = Some(match &state.service {
            // Nothing of a rejected Service is programmed.
            Some(_) if next.rejected => Phase::Pending,
            Some(_) => Phase::Installed,
            None => Phase::Absent,
        });
        self.publish(key, state);
    }

    /// Run one operation under the call timeout, retrying transient failures.
    async fn execute(
        &self,
        queue: Option<&KeyQueue>,
        op: &TableOp,
    ) -> std::result::Result<(), RetryError<ProxyError>> {
        let timeout = self.config.executor_timeout;
        let executor = self.executor.as_ref();
        let metrics = self.metrics.as_ref();
        retry_with_backoff(
            &self.config.retry,
            op.name(),
            || queue.is_some_and(KeyQueue::delete_pending),
            move |attempt| async move {
                metrics.counter_inc(EXECUTOR_CALLS);
                if attempt > 1 {
                    metrics.counter_inc(EXECUTOR_RETRIES);
                }
                let result = match tokio::time::timeout(timeout, op.apply(executor)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProxyError::ExecutorTimeout {
                        operation: op.name().to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                if result.is_err() {
                    metrics.counter_inc(EXECUTOR_FAILURES);
                }
                result
            },
        )
        .await
    }
}

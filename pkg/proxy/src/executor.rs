//! Table-mutation interface and the in-memory bridge implementing it.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::registers::GroupId;
use crate::table::{FlowEntry, FlowKey, Group, TableId};

/// Mutations against the forwarding table.
///
/// Every call is idempotent: installing an identical entry or removing an
/// absent one succeeds. Calls are individually failable; there is no
/// multi-entry transaction.
#[async_trait]
pub trait FlowExecutor: Send + Sync {
    /// Add or replace a group.
    async fn install_group(&self, group: &Group) -> Result<()>;

    async fn remove_group(&self, id: GroupId) -> Result<()>;

    /// Add or replace the flow with the same key.
    async fn install_flow(&self, flow: &FlowEntry) -> Result<()>;

    async fn remove_flow(&self, key: &FlowKey) -> Result<()>;

    /// Installed flows, optionally restricted to one table.
    async fn dump_flows(&self, table: Option<TableId>) -> Result<Vec<FlowEntry>>;

    async fn dump_groups(&self) -> Result<Vec<Group>>;
}

/// Failure the bridge injects into a mutation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Never answer within any reasonable bound.
    Hang,
    Reject(String),
}

/// A successful mutation, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    InstallGroup(GroupId),
    RemoveGroup(GroupId),
    InstallFlow(FlowKey),
    RemoveFlow(FlowKey),
}

#[derive(Debug, Default)]
struct BridgeTables {
    flows: BTreeMap<FlowKey, FlowEntry>,
    groups: BTreeMap<GroupId, Group>,
}

/// In-memory forwarding table.
///
/// Stands in for the switch: holds installed flows and groups, answers
/// dumps, and can inject timeouts and rejections.
#[derive(Debug, Default)]
pub struct MemoryBridge {
    tables: RwLock<BridgeTables>,
    faults: Mutex<VecDeque<Fault>>,
    persistent_fault: Mutex<Option<Fault>>,
    flow_capacity: Option<usize>,
    calls: Mutex<Vec<BridgeCall>>,
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bridge whose flow table rejects installs beyond `capacity` entries.
    pub fn with_flow_capacity(capacity: usize) -> Self {
        Self {
            flow_capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Fail the next mutation with `fault`. Faults queue up in order.
    pub fn inject(&self, fault: Fault) {
        lock(&self.faults).push_back(fault);
    }

    /// Fail every mutation until cleared with `None`.
    pub fn set_persistent_fault(&self, fault: Option<Fault>) {
        *lock(&self.persistent_fault) = fault;
    }

    /// Successful mutations so far.
    pub fn calls(&self) -> Vec<BridgeCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Flows as `ovs-ofctl dump-flows` style lines.
    pub async fn dump_flows_text(&self, table: Option<TableId>) -> Vec<String> {
        let tables = self.tables.read().await;
        tables
            .flows
            .values()
            .filter(|f| table.is_none_or(|t| f.table == t))
            .map(|f| f.to_string())
            .collect()
    }

    /// Groups as `ovs-ofctl dump-groups` style lines.
    pub async fn dump_groups_text(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        tables.groups.values().map(|g| g.to_string()).collect()
    }

    async fn check_fault(&self, operation: &str) -> Result<()> {
        let fault = lock(&self.faults)
            .pop_front()
            .or_else(|| lock(&self.persistent_fault).clone());
        match fault {
            None => Ok(()),
            Some(Fault::Reject(reason)) => Err(ProxyError::rejected(operation, reason)),
            Some(Fault::Hang) => {
                // Callers bound every call with a timeout; this never returns in practice.
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProxyError::rejected(operation, "bridge hung"))
            }
        }
    }

    fn record(&self, call: BridgeCall) {
        debug!("bridge: {:?}", call);
        lock(&self.calls).push(call);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl FlowExecutor for MemoryBridge {
    async fn install_group(&self, group: &Group) -> Result<()> {
        self.check_fault("install_group").await?;
        self.tables
            .write()
            .await
            .groups
            .insert(group.id, group.clone());
        self.record(BridgeCall::InstallGroup(group.id));
        Ok(())
    }

    async fn remove_group(&self, id: GroupId) -> Result<()> {
        self.check_fault("remove_group").await?;
        self.tables.write().await.groups.remove(&id);
        self.record(BridgeCall::RemoveGroup(id));
        Ok(())
    }

    async fn install_flow(&self, flow: &FlowEntry) -> Result<()> {
        self.check_fault("install_flow").await?;
        let key = flow.key();
        {
            let mut tables = self.tables.write().await;
            if let Some(capacity) = self.flow_capacity
                && !tables.flows.contains_key(&key)
                && tables.flows.len() >= capacity
            {
                return Err(ProxyError::rejected("install_flow", "table full"));
            }
            tables.flows.insert(key.clone(), flow.clone());
        }
        self.record(BridgeCall::InstallFlow(key));
        Ok(())
    }

    async fn remove_flow(&self, key: &FlowKey) -> Result<()> {
        self.check_fault("remove_flow").await?;
        self.tables.write().await.flows.remove(key);
        self.record(BridgeCall::RemoveFlow(key.clone()));
        Ok(())
    }

    async fn dump_flows(&self, table: Option<TableId>) -> Result<Vec<FlowEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .flows
            .values()
            .filter(|f| table.is_none_or(|t| f.table == t))
            .cloned()
            .collect())
    }

    async fn dump_groups(&self) -> Result<Vec<Group>> {
        Ok(self.tables.read().await.groups.values().cloned().collect())
    }
}

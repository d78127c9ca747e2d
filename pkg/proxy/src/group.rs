//! Select-group construction for Service ports.

use std::collections::BTreeMap;

use pkg_constants::flow::{
    ENDPOINT_DNAT_TABLE, SERVICE_LB_TABLE, STATE_SELECTED, STATE_TO_LEARN,
};
use pkg_types::endpoint::Endpoint;
use pkg_types::service::{ServiceKey, ServicePort};
use tracing::warn;

use crate::error::ProxyError;
use crate::registers::{EndpointRegisters, GroupId};
use crate::table::{Action, Bucket, FlowOwner, Group};

/// A ready endpoint of one Service port, already encoded for its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Backend {
    pub registers: EndpointRegisters,
    pub weight: u16,
}

/// Resolve the ready backends of `port` from the Service's Endpoint object.
///
/// Addresses that cannot be encoded are skipped and returned as errors.
/// Duplicate `(ip, port)` pairs collapse into one backend; the result is
/// sorted so the same snapshot always yields the same buckets.
pub fn ready_backends(
    port: &ServicePort,
    endpoint: Option<&Endpoint>,
    group: GroupId,
) -> (Vec<Backend>, Vec<ProxyError>) {
    let Some(endpoint) = endpoint else {
        return (Vec::new(), Vec::new());
    };
    let backend_port = endpoint.port_for(&port.name, port.protocol, port.target_port);

    let mut backends: BTreeMap<EndpointRegisters, u16> = BTreeMap::new();
    let mut errors = Vec::new();
    for addr in endpoint.ready_addresses() {
        match EndpointRegisters::encode(&addr.ip, backend_port, group) {
            Ok(registers) => {
                backends.entry(registers).or_insert(addr.weight.max(1));
            }
            Err(e) => {
                warn!(
                    "Skipping endpoint {} of {}/{}: {}",
                    addr.ip, endpoint.namespace, endpoint.service_name, e
                );
                errors.push(e);
            }
        }
    }

    let backends = backends
        .into_iter()
        .map(|(registers, weight)| Backend { registers, weight })
        .collect();
    (backends, errors)
}

/// Build the select group for a Service port.
///
/// Returns `None` when there is no ready backend. A single backend still
/// yields a one-bucket group so every Service has the same rule shape.
pub fn build_group(
    owner: &ServiceKey,
    group: GroupId,
    backends: &[Backend],
    affinity: bool,
) -> Option<Group> {
    if backends.is_empty() {
        return None;
    }

    let buckets = backends
        .iter()
        .enumerate()
        .map(|(i, backend)| {
            let mut actions;
            if affinity {
                // Back through the LB table so the learn rule records the choice.
                actions = backend.registers.load_actions(STATE_TO_LEARN);
                actions.push(Action::Resubmit(SERVICE_LB_TABLE));
            } else {
                actions = backend.registers.load_actions(STATE_SELECTED);
                actions.push(Action::Resubmit(ENDPOINT_DNAT_TABLE));
            }
            Bucket {
                id: i as u32,
                weight: backend.weight,
                actions,
            }
        })
        .collect();

    Some(Group {
        id: group,
        buckets,
        owner: FlowOwner::Service(owner.clone()),
    })
}

/// Allocates group ids. Ids are reused after release so the id space stays dense.
#[derive(Debug, Default)]
pub struct GroupIdAllocator {
    next: GroupId,
    free: Vec<GroupId>,
}

impl GroupIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> GroupId {
        if let Some(id) = self.free.pop() {
            return id;
        }
        // Group 0 is never handed out.
        self.next += 1;
        self.next
    }

    pub fn release(&mut self, id: GroupId) {
        if id != 0 && id <= self.next && !self.free.contains(&id) {
            self.free.push(id);
        }
    }
}
